//! Seamless update errors.
//!
//! BMC trouble (unreachable, unexpected status, undecodable body) says
//! nothing about the firmware under test and surfaces as a setup error.
//! The update flow itself reports platform failures as
//! [`TestError::Fail`] directly.

use platval_core::error::{PlatvalError, TestError};

#[derive(Debug, thiserror::Error)]
pub enum SeamlessError {
    #[error("bmc request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("bmc returned {status} for {url}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("bmc response from {url} could not be decoded: {reason}")]
    Decode { url: String, reason: String },

    #[error("capsule error: {0}")]
    Capsule(String),

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("bmc is not configured ([bmc] url is empty)")]
    NotConfigured,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SeamlessError> for PlatvalError {
    fn from(err: SeamlessError) -> Self {
        match err {
            SeamlessError::NotConfigured => {
                TestError::NotApplicable("capsule updates need a configured bmc".to_owned()).into()
            }
            SeamlessError::Io(e) => PlatvalError::Io(e),
            other => TestError::Setup(other.to_string()).into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use platval_core::types::Verdict;

    #[test]
    fn status_error_is_harness_error() {
        let err: PlatvalError = SeamlessError::Status {
            url: "https://bmc/redfish/v1/UpdateService".to_owned(),
            status: 503,
            body: "busy".to_owned(),
        }
        .into();
        assert_eq!(err.verdict(), Verdict::Error);
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn missing_bmc_is_not_applicable() {
        let err: PlatvalError = SeamlessError::NotConfigured.into();
        assert_eq!(err.verdict(), Verdict::NotApplicable);
    }

    #[test]
    fn io_stays_io() {
        let err: PlatvalError =
            SeamlessError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "cap")).into();
        assert!(matches!(err, PlatvalError::Io(_)));
    }
}
