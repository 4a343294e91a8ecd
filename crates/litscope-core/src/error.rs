use std::fmt;

use thiserror::Error;

use crate::state::{RecordState, Stage};

/// Why an operation refused to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreconditionViolation {
    /// Uncommitted changes outside the paths the stage may touch.
    DirtyTree { files: Vec<String> },
    /// Records are still in states that strictly precede the stage.
    ProcessOrder {
        stage: Stage,
        blocking_states: Vec<RecordState>,
    },
}

impl fmt::Display for PreconditionViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DirtyTree { files } => {
                write!(f, "clean working tree required, changed: {}", files.join(", "))
            }
            Self::ProcessOrder {
                stage,
                blocking_states,
            } => {
                let states: Vec<String> = blocking_states.iter().map(|s| s.to_string()).collect();
                write!(
                    f,
                    "{stage} not possible: records are still in {}",
                    states.join(", ")
                )
            }
        }
    }
}

/// All errors that can occur in litscope-core.
#[derive(Debug, Error)]
pub enum LitscopeError {
    #[error("precondition violated: {0}")]
    PreconditionViolation(PreconditionViolation),

    #[error("no records to process; run 'litscope load' first")]
    NoRecords,

    #[error("record lacks the feed identifier '{0}'")]
    NotFeedIdentifiable(String),

    #[error("record not parsable: {0}")]
    RecordNotParsable(String),

    #[error("record not found in prep source: {0}")]
    RecordNotFoundInPrepSource(String),

    #[error("not enough data to identify record: {0}")]
    NotEnoughDataToIdentify(String),

    #[error("record cannot be identified in a table of contents: {0}")]
    NotTocIdentifiable(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid parameter for {endpoint}: {message}")]
    PackageParameter { endpoint: String, message: String },

    #[error("service not available: {0}")]
    ServiceNotAvailable(String),

    #[error("missing dependency for {endpoint}: {requirement}")]
    MissingDependency {
        endpoint: String,
        requirement: String,
    },

    #[error("maximum offset {max} exceeded for {source_name}")]
    MaxOffset { source_name: String, max: u64 },

    #[error("invalid transition of {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: RecordState,
        to: RecordState,
    },

    #[error("origin {origin} is claimed by both {first} and {second}")]
    DuplicateOrigin {
        origin: String,
        first: String,
        second: String,
    },

    #[error("records cannot be merged: {0}")]
    InvalidMerge(String),

    #[error("no quality rules for entrytype '{0}'")]
    MissingQualityRule(String),

    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),

    #[error("endpoint {0} does not implement the capabilities of its stage")]
    CapabilityMismatch(String),

    #[error("record not found: {0}")]
    RecordNotFound(String),

    #[error("project not found at {0}; run 'litscope init' first")]
    ProjectNotFound(String),

    #[error("project already exists at {0}")]
    ProjectAlreadyExists(String),

    #[error("git error: {0}")]
    Git(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl LitscopeError {
    /// Record-level errors that the driver logs, counts and moves past.
    pub fn is_skippable(&self) -> bool {
        matches!(
            self,
            Self::NotFeedIdentifiable(_)
                | Self::RecordNotParsable(_)
                | Self::RecordNotFoundInPrepSource(_)
                | Self::NotEnoughDataToIdentify(_)
                | Self::NotTocIdentifiable(_)
        )
    }

    /// Errors that stop the current endpoint but not the whole driver run.
    pub fn is_fatal_to_endpoint(&self) -> bool {
        matches!(self, Self::ServiceNotAvailable(_) | Self::MaxOffset { .. })
    }

    /// Short label used in skip summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PreconditionViolation(_) => "precondition-violation",
            Self::NoRecords => "no-records",
            Self::NotFeedIdentifiable(_) => "not-feed-identifiable",
            Self::RecordNotParsable(_) => "record-not-parsable",
            Self::RecordNotFoundInPrepSource(_) => "record-not-found-in-prep-source",
            Self::NotEnoughDataToIdentify(_) => "not-enough-data-to-identify",
            Self::NotTocIdentifiable(_) => "not-toc-identifiable",
            Self::InvalidQuery(_) => "invalid-query",
            Self::PackageParameter { .. } => "package-parameter",
            Self::ServiceNotAvailable(_) => "service-not-available",
            Self::MissingDependency { .. } => "missing-dependency",
            Self::MaxOffset { .. } => "max-offset",
            Self::InvalidTransition { .. } => "invalid-transition",
            Self::DuplicateOrigin { .. } => "duplicate-origin",
            Self::InvalidMerge(_) => "invalid-merge",
            Self::MissingQualityRule(_) => "missing-quality-rule",
            Self::UnknownEndpoint(_) => "unknown-endpoint",
            Self::CapabilityMismatch(_) => "capability-mismatch",
            Self::RecordNotFound(_) => "record-not-found",
            Self::ProjectNotFound(_) => "project-not-found",
            Self::ProjectAlreadyExists(_) => "project-already-exists",
            Self::Git(_) => "git",
            Self::Cancelled => "cancelled",
            Self::ConfigError(_) => "config",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::TomlParse(_) => "toml-parse",
            Self::TomlSerialize(_) => "toml-serialize",
        }
    }
}

impl From<PreconditionViolation> for LitscopeError {
    fn from(v: PreconditionViolation) -> Self {
        Self::PreconditionViolation(v)
    }
}

/// Exit codes of the `litscope` binary.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    NotFound = 2,
    InvalidArgs = 3,
    PreconditionFailed = 4,
    ServiceUnavailable = 6,
    Conflict = 7,
}

impl From<&LitscopeError> for ExitCode {
    fn from(err: &LitscopeError) -> Self {
        match err {
            LitscopeError::PreconditionViolation(_) | LitscopeError::NoRecords => {
                Self::PreconditionFailed
            }
            LitscopeError::ServiceNotAvailable(_) | LitscopeError::MaxOffset { .. } => {
                Self::ServiceUnavailable
            }
            LitscopeError::RecordNotFound(_)
            | LitscopeError::ProjectNotFound(_)
            | LitscopeError::UnknownEndpoint(_) => Self::NotFound,
            LitscopeError::InvalidQuery(_) | LitscopeError::PackageParameter { .. } => {
                Self::InvalidArgs
            }
            LitscopeError::ProjectAlreadyExists(_) => Self::Conflict,
            _ => Self::GeneralError,
        }
    }
}

pub type Result<T> = std::result::Result<T, LitscopeError>;
