use std::sync::Arc;

use tracing::{error, info};

use chc_core::config::Config;

#[tokio::main]
async fn main() -> Result<(), chc_core::Error> {
    chc_core::logging::init("chc")?;

    let cfg = match Config::load() {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return Err(e);
        }
    };
    info!(
        audit_log = %cfg.audit_log_path.display(),
        custom_api = cfg.telegram_api_url.is_some(),
        "starting channel clear bot"
    );

    if let Err(e) = chc_telegram::router::run_polling(cfg).await {
        error!(error = %format!("{e:#}"), "bot failed");
        return Err(chc_core::Error::External(format!("telegram bot failed: {e:#}")));
    }

    Ok(())
}
