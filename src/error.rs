//! Registration-time error taxonomy
//!
//! Everything here is fatal to the registration that raised it and surfaced
//! to the process bootstrapper. Transient connection failures never appear
//! here: they are absorbed by the lifecycle manager according to its
//! reconnection policy.

use crate::config::ConfigError;
use crate::registry::RegistryError;
use crate::transport::SessionError;
use thiserror::Error;

/// Errors raised while registering connections
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Handler resolution failed: {0}")]
    Registry(#[from] RegistryError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Connection key '{0}' is already registered")]
    DuplicateKey(String),
}

/// Result type for registration operations
pub type LinkResult<T> = Result<T, RegistrationError>;
