//! CLI-specific error types and exit code mapping

use platval_core::error::PlatvalError;

/// CLI-specific error type.
///
/// Test outcomes never come through here: a finished run exits with its
/// verdict's code. These are the errors that stop the CLI before or
/// around a run.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Configuration loading or validation failure.
    #[error("configuration error: {0}")]
    Config(String),

    /// A subcommand-specific operation failed.
    #[error("{0}")]
    Command(String),

    /// JSON serialisation failed during output rendering.
    #[error("json output error: {0}")]
    JsonSerialize(#[from] serde_json::Error),

    /// IO error (file read, stdout write, etc.).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Wrapped domain error from platval-core.
    #[error("{0}")]
    Core(#[from] PlatvalError),
}

impl CliError {
    /// Map the error to a process exit code.
    ///
    /// | Code | Meaning                                   |
    /// |------|-------------------------------------------|
    /// | 1-5  | Domain error, mapped through its verdict  |
    /// | 2    | Configuration or command-line error       |
    /// | 10   | IO / output error                         |
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Command(_) => 2,
            Self::Core(e) => e.verdict().exit_code(),
            Self::Io(_) | Self::JsonSerialize(_) => 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use platval_core::error::{ConfigError, TestError};

    #[test]
    fn test_exit_code_config_error() {
        let err = CliError::Config("test error".to_owned());
        assert_eq!(err.exit_code(), 2, "config error should return exit code 2");
    }

    #[test]
    fn test_exit_code_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        assert_eq!(CliError::Io(io_err).exit_code(), 10);
    }

    #[test]
    fn test_exit_code_follows_domain_verdict() {
        let not_applicable: CliError =
            PlatvalError::from(TestError::NotApplicable("no sut2".to_owned())).into();
        assert_eq!(not_applicable.exit_code(), 3);

        let missing: CliError = PlatvalError::from(ConfigError::FileNotFound {
            path: "platval.toml".to_owned(),
        })
        .into();
        assert_eq!(missing.exit_code(), 2);
    }

    #[test]
    fn test_error_display_config() {
        let err = CliError::Config("invalid TOML syntax".to_owned());
        let display_str = err.to_string();
        assert!(display_str.contains("configuration error"));
        assert!(display_str.contains("invalid TOML syntax"));
    }

    #[test]
    fn test_error_display_command() {
        let err = CliError::Command("unknown section: gpu".to_owned());
        assert_eq!(err.to_string(), "unknown section: gpu");
    }
}
