use thiserror::Error;

/// Errors that prevent a session from being established.
/// The connection should be dropped when one of these is returned.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("transport error: {0:#}")]
    Transport(#[from] std::io::Error),
    #[error("SASL authentication is enabled but no mechanisms are configured")]
    NoSaslMechanisms,
}
