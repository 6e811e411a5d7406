//! Append-only audit trail of authorization decisions and deletion runs.

use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use chrono::Utc;
use serde::Serialize;

use crate::{
    domain::{ChatId, MessageId, UserId},
    engine::{RunOutcome, RunResult},
    errors::Error,
    Result,
};

const AUDIT_MAX_TEXT: usize = 500;

/// RFC3339 timestamp in UTC.
pub fn iso_timestamp_utc() -> String {
    Utc::now().to_rfc3339()
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct AuditEvent {
    pub timestamp: String,
    pub event: String,
    pub user_id: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorized: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub boundary: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditEvent {
    fn new(event: &str, user_id: UserId) -> Self {
        Self {
            timestamp: iso_timestamp_utc(),
            event: event.to_string(),
            user_id: user_id.0,
            ..Self::default()
        }
    }

    pub fn auth(user_id: UserId, channel_id: ChatId, authorized: bool) -> Self {
        Self {
            channel_id: Some(channel_id.0),
            authorized: Some(authorized),
            ..Self::new("auth", user_id)
        }
    }

    pub fn auth_error(user_id: UserId, channel_id: ChatId, error: &str) -> Self {
        Self {
            channel_id: Some(channel_id.0),
            error: Some(error.to_string()),
            ..Self::new("auth_error", user_id)
        }
    }

    pub fn run_started(user_id: UserId, channel_id: ChatId, boundary: MessageId, run_id: u64) -> Self {
        Self {
            channel_id: Some(channel_id.0),
            run_id: Some(run_id),
            boundary: Some(boundary.0),
            ..Self::new("run_started", user_id)
        }
    }

    pub fn run_finished(user_id: UserId, channel_id: ChatId, run_id: u64, result: &RunResult) -> Self {
        let outcome = match result.outcome {
            RunOutcome::Completed => "completed",
            RunOutcome::Cancelled => "cancelled",
            RunOutcome::AbortedTooManyFailures => "aborted_too_many_failures",
        };
        Self {
            channel_id: Some(channel_id.0),
            run_id: Some(run_id),
            outcome: Some(outcome.to_string()),
            deleted: Some(result.deleted),
            skipped: Some(result.skipped),
            ..Self::new("run_finished", user_id)
        }
    }

    pub fn run_crashed(user_id: UserId, channel_id: ChatId, run_id: u64, error: &str) -> Self {
        Self {
            channel_id: Some(channel_id.0),
            run_id: Some(run_id),
            outcome: Some("crashed".to_string()),
            error: Some(error.to_string()),
            ..Self::new("run_finished", user_id)
        }
    }
}

#[derive(Clone, Debug)]
pub struct AuditLogger {
    path: PathBuf,
    json: bool,
}

impl AuditLogger {
    pub fn new(path: impl Into<PathBuf>, json: bool) -> Self {
        Self {
            path: path.into(),
            json,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, mut event: AuditEvent) -> Result<()> {
        if let Some(s) = &event.error {
            event.error = Some(truncate_text(s, AUDIT_MAX_TEXT));
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        if self.json {
            let line = serde_json::to_string(&event)?;
            writeln!(file, "{line}")?;
            return Ok(());
        }

        // Plain text format for readability.
        let mut out = String::new();
        out.push('\n');
        out.push_str(&"=".repeat(60));

        let value = serde_json::to_value(&event)?;
        let Some(obj) = value.as_object() else {
            return Err(Error::External(
                "audit event is not a JSON object".to_string(),
            ));
        };
        for (k, v) in obj {
            out.push('\n');
            out.push_str(k);
            out.push_str(": ");
            out.push_str(&json_value_to_display(v));
        }
        out.push('\n');

        file.write_all(out.as_bytes())?;
        Ok(())
    }
}

pub fn truncate_text(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut out = s.chars().take(max_len).collect::<String>();
    out.push_str("...");
    out
}

fn json_value_to_display(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::Null => "null".to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s.to_string(),
        other => serde_json::to_string(other).unwrap_or_else(|_| "<unprintable>".to_string()),
    }
}
