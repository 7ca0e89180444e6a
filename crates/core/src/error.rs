//! Error types and their mapping onto test verdicts.
//!
//! [`TestError`] carries the outcome categories a test case raises on
//! purpose. Everything else ([`ExecError`], [`ConfigError`], ...) is
//! infrastructure trouble. [`PlatvalError::verdict`] is the single place
//! where an error becomes a [`Verdict`].

use std::time::Duration;

use crate::types::Verdict;

/// Top-level platval error
#[derive(Debug, thiserror::Error)]
pub enum PlatvalError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Test(#[from] TestError),

    #[error("command error: {0}")]
    Exec(#[from] ExecError),

    #[error("bios knob error: {0}")]
    Knob(#[from] KnobError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PlatvalError {
    /// Classifies the error into the verdict a run ends with.
    ///
    /// A command that ran and exited non-zero is a platform failure;
    /// a command that could not run at all is a harness error.
    pub fn verdict(&self) -> Verdict {
        match self {
            Self::Test(e) => e.verdict(),
            Self::Exec(ExecError::NonZeroExit { .. }) => Verdict::Fail,
            Self::Exec(_) => Verdict::Error,
            Self::Knob(_) | Self::Config(_) | Self::Registry(_) | Self::Io(_) => Verdict::Error,
        }
    }

    /// Shorthand for a [`TestError::Fail`].
    pub fn fail(reason: impl Into<String>) -> Self {
        Self::Test(TestError::Fail(reason.into()))
    }
}

/// Outcome categories raised by test cases and providers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TestError {
    /// The platform did not behave as expected
    #[error("test failed: {0}")]
    Fail(String),

    /// The scenario does not apply to this SUT or configuration
    #[error("not applicable: {0}")]
    NotApplicable(String),

    /// The scenario cannot run on this OS or platform
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Preconditions could not be established
    #[error("setup failed: {0}")]
    Setup(String),
}

impl TestError {
    pub fn verdict(&self) -> Verdict {
        match self {
            Self::Fail(_) => Verdict::Fail,
            Self::NotApplicable(_) => Verdict::NotApplicable,
            Self::Unsupported(_) => Verdict::Unsupported,
            Self::NotImplemented(_) => Verdict::NotImplemented,
            Self::Setup(_) => Verdict::Error,
        }
    }
}

/// Command execution errors
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The process could not be started
    #[error("failed to spawn '{command}': {reason}")]
    Spawn { command: String, reason: String },

    #[error("'{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("'{command}' exited with code {code}: {stderr}")]
    NonZeroExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// The remote transport (ssh) failed before the command ran
    #[error("transport error: {0}")]
    Transport(String),
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// BIOS knob file errors
#[derive(Debug, thiserror::Error)]
pub enum KnobError {
    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },

    /// A command template lacks its placeholder
    #[error("command template '{template}' has no '{placeholder}' placeholder")]
    Template {
        template: String,
        placeholder: &'static str,
    },
}

/// Test registry errors
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("test case '{id}' is already registered")]
    AlreadyRegistered { id: String },

    #[error("test case '{id}' not found")]
    NotFound { id: String },

    #[error("invalid arguments for '{id}': {reason}")]
    InvalidArgs { id: String, reason: String },

    /// `--help` was requested; `text` is the rendered help.
    #[error("{text}")]
    Help { id: String, text: String },
}
