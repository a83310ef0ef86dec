//! A3: process-wide structured logging setup. Grounded on the
//! `tracing_subscriber::fmt()` + `EnvFilter` wiring used elsewhere in this
//! pack's axum services, extended with the `pretty`/`json` switch named by
//! `general.log_format`.

use crate::config::LogFormat;

pub fn init(log_format: LogFormat) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "kme_core=info,tower_http=info".into());

    match log_format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(env_filter)
                .with_target(true)
                .with_thread_ids(true)
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
        }
    }
}
