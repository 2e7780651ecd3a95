use thiserror::Error;

/// Structural failures that abort a run. Per-item anomalies never use this.
#[derive(Debug, Error)]
pub enum SplitError {
    #[error("no zip files found in {0}")]
    NoArchives(String),
    #[error("required export table missing: {0}")]
    MissingTable(String),
    #[error("archive unreadable: {0}")]
    UnreadableArchive(String),
    #[error("config file invalid or unreadable: {0}")]
    InvalidConfig(String),
    #[error("output directory is locked by another run: {0}")]
    OutputLocked(String),
}
