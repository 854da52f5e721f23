use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::pipeline::TaskState;

#[derive(Debug, Error, Diagnostic)]
pub enum HarvestError {
    #[error("missing config file kira-dwca.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(
        "numbers of parameters do not match for table {table}: statement binds {parameters}, \
         column list declares {columns}, expected {expected}"
    )]
    #[diagnostic(help("check the insert statement and the staging column list"))]
    ParameterMismatch {
        table: String,
        parameters: usize,
        columns: usize,
        expected: usize,
    },

    #[error("{path}: header is missing required columns: {missing}")]
    MissingColumns { path: String, missing: String },

    #[error("{0}: file has no header line")]
    EmptySource(String),

    #[error("unknown field name: {0}")]
    UnknownField(String),

    #[error("unknown term: {0}")]
    UnknownTerm(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("staging store error: {0}")]
    Staging(String),

    #[error("archive build failed: {0}")]
    Archive(String),

    #[error("portal request failed: {0}")]
    PortalHttp(String),

    #[error("portal returned status {status}: {message}")]
    PortalStatus { status: u16, message: String },

    #[error("task {task} failed while {state}: {source}")]
    TaskFailed {
        task: String,
        state: TaskState,
        #[source]
        source: Box<HarvestError>,
    },

    #[error("task {task} not run: dependency {dependency} did not complete")]
    DependencyFailed { task: String, dependency: String },
}

impl HarvestError {
    pub fn is_configuration(&self) -> bool {
        match self {
            HarvestError::MissingConfig
            | HarvestError::ConfigRead(_)
            | HarvestError::ConfigParse(_)
            | HarvestError::Config(_)
            | HarvestError::ParameterMismatch { .. }
            | HarvestError::UnknownField(_)
            | HarvestError::UnknownTerm(_) => true,
            HarvestError::TaskFailed { source, .. } => source.is_configuration(),
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for HarvestError {
    fn from(err: rusqlite::Error) -> Self {
        HarvestError::Staging(err.to_string())
    }
}
