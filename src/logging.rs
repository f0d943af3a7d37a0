use std::env;
use tracing_subscriber::{fmt, EnvFilter};

pub fn setup_logging() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(&log_level));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .init();

    tracing::info!(level = %log_level, "Logging initialized");
}

fn default_filter(log_level: &str) -> EnvFilter {
    let mut filter = EnvFilter::new(format!("notisync={}", log_level));
    // Dependencies stay quiet unless RUST_LOG asks otherwise.
    for directive in [
        "notisync::hub=info",
        "sqlx=warn",
        "tower_http=warn",
        "tungstenite=warn",
        "tokio_tungstenite=warn",
    ] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}
