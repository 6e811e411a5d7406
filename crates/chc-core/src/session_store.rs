use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::domain::{ChatId, MessageId, UserId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingBoundary,
    Clearing,
}

/// Handle of the deletion run bound to a session.
#[derive(Clone, Debug)]
pub struct RunBinding {
    pub run_id: u64,
    pub cancel: CancellationToken,
}

/// Per-user clearing workflow record. Lives only in memory.
#[derive(Clone, Debug)]
pub struct Session {
    pub user_id: UserId,
    /// Chat where replies for this user go.
    pub chat_id: ChatId,
    pub state: SessionState,
    pub channel_id: Option<ChatId>,
    pub boundary: Option<MessageId>,
    /// Present from run start until the run's cleanup, even after `/stop`.
    pub run: Option<RunBinding>,
    pub last_activity: Instant,
}

impl Session {
    pub fn new(user_id: UserId, chat_id: ChatId) -> Self {
        Self {
            user_id,
            chat_id,
            state: SessionState::Idle,
            channel_id: None,
            boundary: None,
            run: None,
            last_activity: Instant::now(),
        }
    }

    /// Enter `Clearing`; target and run are recorded together.
    pub fn begin_clearing(&mut self, channel_id: ChatId, boundary: MessageId, run: RunBinding) {
        self.state = SessionState::Clearing;
        self.channel_id = Some(channel_id);
        self.boundary = Some(boundary);
        self.run = Some(run);
    }

    /// Back to `Idle`, forgetting the target. Requests cancellation of a live run.
    pub fn reset(&mut self) {
        if self.state == SessionState::Clearing {
            if let Some(run) = &self.run {
                run.cancel.cancel();
            }
        }
        self.state = SessionState::Idle;
        self.channel_id = None;
        self.boundary = None;
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn is_expired(&self, idle_timeout: Duration, now: Instant) -> bool {
        self.state != SessionState::Clearing
            && self.run.is_none()
            && now.saturating_duration_since(self.last_activity) >= idle_timeout
    }
}

type LockMap = StdMutex<HashMap<UserId, Arc<Mutex<()>>>>;

/// Exclusive hold on one user's transitions.
///
/// On drop the user's entry leaves the lock map once no other task holds or
/// waits on it, so users without a session leave nothing behind.
pub struct UserGuard<'a> {
    user_id: UserId,
    locks: &'a LockMap,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UserGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks
            .get(&self.user_id)
            .is_some_and(|l| Arc::strong_count(l) == 1)
        {
            locks.remove(&self.user_id);
        }
    }
}

/// Process-wide map from user to session.
///
/// Map operations are individually atomic. Callers that read-modify-write a
/// session hold [`SessionStore::lock_user`] for the whole transition, which
/// serializes all handlers (and run cleanup) for the same user.
pub struct SessionStore {
    sessions: Mutex<HashMap<UserId, Session>>,
    user_locks: LockMap,
    idle_timeout: Option<Duration>,
}

impl SessionStore {
    pub fn new(idle_timeout: Option<Duration>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            user_locks: StdMutex::new(HashMap::new()),
            idle_timeout,
        }
    }

    pub async fn lock_user(&self, user_id: UserId) -> UserGuard<'_> {
        let lock = {
            let mut map = self.user_locks.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(user_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        UserGuard {
            user_id,
            locks: &self.user_locks,
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    pub(crate) fn lock_entries(&self) -> usize {
        self.user_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Current session of `user_id`. An expired idle session reads as absent and is dropped.
    pub async fn get(&self, user_id: UserId) -> Option<Session> {
        let mut map = self.sessions.lock().await;
        let session = map.get(&user_id)?;
        if let Some(limit) = self.idle_timeout {
            if session.is_expired(limit, Instant::now()) {
                map.remove(&user_id);
                return None;
            }
        }
        Some(session.clone())
    }

    pub async fn set(&self, session: Session) {
        self.sessions.lock().await.insert(session.user_id, session);
    }

    pub async fn delete(&self, user_id: UserId) -> Option<Session> {
        self.sessions.lock().await.remove(&user_id)
    }

    pub async fn has(&self, user_id: UserId) -> bool {
        self.get(user_id).await.is_some()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every expired session; returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let Some(limit) = self.idle_timeout else {
            return 0;
        };
        let now = Instant::now();
        let mut map = self.sessions.lock().await;
        let before = map.len();
        map.retain(|_, s| !s.is_expired(limit, now));
        before - map.len()
    }

    /// Request cancellation of every bound run (used on shutdown).
    pub async fn cancel_all_runs(&self) -> usize {
        let map = self.sessions.lock().await;
        let mut n = 0;
        for run in map.values().filter_map(|s| s.run.as_ref()) {
            run.cancel.cancel();
            n += 1;
        }
        n
    }
}
