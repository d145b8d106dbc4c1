use std::fmt::{Display, Formatter};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Fatal problems with the shape of the input document. These are raised at
/// construction time and abort the whole translation.
#[derive(Debug, Error)]
pub enum StructuralError {
    #[error("expected a <{expected}> element but found <{actual}>")]
    WrongTag { expected: String, actual: String },
    #[error("document must contain exactly one Facility, found {0}")]
    FacilityCount(usize),
    #[error("only one <{tag}> element may be processed, found {count}")]
    TooMany { tag: &'static str, count: usize },
    #[error("<{tag}> element is missing required attribute \"{attribute}\"")]
    MissingAttribute {
        tag: &'static str,
        attribute: &'static str,
    },
    #[error("<{tag}> element is missing required child <{child}>")]
    MissingChild {
        tag: &'static str,
        child: &'static str,
    },
    #[error("malformed document: {0}")]
    Malformed(String),
}

/// Per-scenario dispatch failures. These are fatal for the scenario they
/// belong to but never for the batch.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("could not create run directory {path}: {source}")]
    CreateRunDirectory { path: PathBuf, source: io::Error },
    #[error("could not write workflow descriptor {path}: {source}")]
    WriteDescriptor {
        path: PathBuf,
        source: anyhow::Error,
    },
    #[error("scenario \"{scenario_id}\" has no assembled workflow to dispatch")]
    MissingWorkflow { scenario_id: String },
    #[error("engine invocation for scenario \"{scenario_id}\" failed: {source}")]
    EngineInvocation {
        scenario_id: String,
        source: anyhow::Error,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Severity {
    Warning,
    Error,
}

/// One soft failure. Soft failures accumulate in a `Vec<Diagnostic>` and are
/// reported at the end of a phase instead of aborting it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
}

impl Diagnostic {
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
        }
    }
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.severity {
            Severity::Warning => write!(f, "warning: {}", self.message),
            Severity::Error => write!(f, "error: {}", self.message),
        }
    }
}
