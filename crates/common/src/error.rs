use thiserror::Error;

/// Control-plane error taxonomy.
///
/// Every variant is caught at the boundary of whichever handler is executing
/// and converted into a reply or a log line; none of these may terminate an
/// event loop.
#[derive(Debug, Clone, Error)]
pub enum ControlError {
    /// Permission check failed. Logged, and the client receives no reply.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Target satellite or permission screen is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed addressing or payload (e.g. pool-name pattern violation).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Collaborator networking failure. Reported, not retried.
    #[error("transport fault: {0}")]
    Transport(String),
}
