use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Initialize the logging system for the datastore engine
pub fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        // Default log level based on debug/release build
        if cfg!(debug_assertions) {
            EnvFilter::new("yangstore=debug")
        } else {
            EnvFilter::new("yangstore=info")
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)?;

    info!("yangstore logging initialized");
    Ok(())
}

/// Initialize logging with fallback behavior if setup fails
pub fn init_logging_safe() {
    if let Err(e) = init_logging() {
        eprintln!(
            "Warning: Failed to set up advanced logging: {}. Using basic logging.",
            e
        );
    }
}

/// Log lock acquisition and release events
pub fn log_lock_event(event: &str, details: &str) {
    info!(target: "yangstore::lock", "{}: {}", event, details);
}

/// Log datastore file operations
pub fn log_store_operation(operation: &str, module: &str, details: &str) {
    info!(target: "yangstore::store", "{} {}: {}", operation, module, details);
}

/// Log subscription lifecycle events
pub fn log_subscription_event(event: &str, module: &str, cid: u32) {
    info!(target: "yangstore::subscr", "{} for {} (cid {})", event, module, cid);
}

/// Log error with context
pub fn log_error_with_context(context: &str, error: &dyn std::error::Error) {
    error!(target: "yangstore::error", "{}: {}", context, error);
}
