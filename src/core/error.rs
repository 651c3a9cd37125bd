//! GT-002: Error kinds and stable exit-code categories.

use super::types::{Action, BackendKind};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for gantry operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while resolving, loading, planning or invoking.
#[derive(Error, Debug)]
pub enum Error {
    #[error("environment could not be resolved: {0}")]
    EnvironmentUnresolved(String),

    #[error("config error: {0}")]
    ConfigParse(String),

    #[error("duplicate module id '{0}'")]
    DuplicateModuleId(String),

    #[error("module '{module}' depends on unknown module '{dependency}'")]
    MissingDependency { module: String, dependency: String },

    #[error("dependency cycle detected: {}", format_cycle(.0))]
    CyclicDependency(Vec<String>),

    #[error("module '{module}' depends on '{dependency}', which is disabled in this environment")]
    DisabledDependency { module: String, dependency: String },

    #[error("unknown module '{0}'")]
    UnknownModule(String),

    #[error("{backend} backend does not support '{action}'")]
    UnsupportedAction { backend: BackendKind, action: Action },

    #[error("failed to invoke {program}: {message}")]
    BackendInvocationFailure { program: String, message: String },

    #[error("cannot read outputs of module '{module}': {message}")]
    OutputLookup { module: String, message: String },

    #[error("run cancelled")]
    RunCancelled,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invocation(program: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BackendInvocationFailure {
            program: program.into(),
            message: message.into(),
        }
    }

    /// Exit-code category for this error.
    pub fn category(&self) -> ExitCategory {
        match self {
            Self::EnvironmentUnresolved(_) => ExitCategory::Environment,
            Self::ConfigParse(_)
            | Self::DuplicateModuleId(_)
            | Self::MissingDependency { .. }
            | Self::CyclicDependency(_)
            | Self::DisabledDependency { .. }
            | Self::UnknownModule(_) => ExitCategory::Configuration,
            Self::UnsupportedAction { .. }
            | Self::BackendInvocationFailure { .. }
            | Self::OutputLookup { .. } => {
                ExitCategory::ModuleFailure
            }
            Self::RunCancelled => ExitCategory::Cancelled,
            Self::Io { .. } | Self::Internal(_) => ExitCategory::Internal,
        }
    }
}

fn format_cycle(members: &[String]) -> String {
    match members.first() {
        Some(first) => format!("{} -> {}", members.join(" -> "), first),
        None => String::new(),
    }
}

/// Stable exit-code categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCategory {
    Success,
    Internal,
    Configuration,
    Environment,
    ModuleFailure,
    Cancelled,
}

impl ExitCategory {
    pub fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Internal => 1,
            Self::Configuration => 2,
            Self::Environment => 3,
            Self::ModuleFailure => 4,
            Self::Cancelled => 5,
        }
    }
}
