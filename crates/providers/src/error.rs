//! Provider error type.
//!
//! [`ProviderError`] covers conditions specific to the providers. The
//! `From<ProviderError> for PlatvalError` conversion sorts each of them into
//! the outcome taxonomy so providers can use `?` against either type.

use platval_core::error::{PlatvalError, TestError};

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The NIC model name is not in the model table
    #[error("unknown nic model '{0}'")]
    UnknownNicModel(String),

    /// A command succeeded but its output did not look as expected
    #[error("unexpected output from '{command}': {reason}")]
    UnexpectedOutput { command: String, reason: String },

    /// Host-side USB drive trouble (no drive, several drives, no switch)
    #[error("usb drive error: {0}")]
    UsbDrive(String),

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProviderError {
    pub fn unexpected(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnexpectedOutput {
            command: command.into(),
            reason: reason.into(),
        }
    }
}

impl From<ProviderError> for PlatvalError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::UnexpectedOutput { .. } => TestError::Fail(err.to_string()).into(),
            ProviderError::UnknownNicModel(_)
            | ProviderError::UsbDrive(_)
            | ProviderError::Pattern(_) => TestError::Setup(err.to_string()).into(),
            ProviderError::Io(e) => PlatvalError::Io(e),
        }
    }
}
