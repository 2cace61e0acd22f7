use thiserror::Error;

/// Unified error type for perfmetrics.
#[derive(Error, Debug)]
pub enum PerfError {
    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Duplicate scope: {0}")]
    DuplicateScope(String),

    #[error("Scope {0} is enabled but has no output file")]
    MissingOutputFile(String),

    #[error("Config load error: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PerfError {
    /// True for errors caused by the configuration itself rather than the
    /// environment it was loaded from.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            PerfError::ConfigError(_)
                | PerfError::DuplicateScope(_)
                | PerfError::MissingOutputFile(_)
                | PerfError::Load(_)
        )
    }
}
