use thiserror::Error;

/// Thin ambient error at the binary boundary: store connection/migration
/// setup and configuration problems that happen before a `Scheduler`
/// exists to report a `common::SchedulerError` of its own.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("failed to connect to or migrate the store: {0}")]
    StoreConnection(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}
