/// Initialize tracing/logging for the application.
///
/// This uses a simple `with_max_level` configuration based on `default_level`.
/// Thread names are included because most of the interesting activity happens
/// on the delivery and promoter threads rather than the caller's.
pub fn init(default_level: &str) {
    let lvl = parse_level(default_level);

    // Use try_init so tests and libraries can call this multiple times without panicking
    let _ = tracing_subscriber::fmt()
        .with_max_level(lvl)
        .with_target(false)
        .with_thread_names(true)
        .try_init();
}

/// Map a configured level name onto a tracing level. Unknown names mean INFO.
pub fn parse_level(level: &str) -> tracing::Level {
    match level.trim().to_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" | "warning" => tracing::Level::WARN,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    }
}
