use thiserror::Error;

#[derive(Debug, Error)]
pub enum MigrateError {
    /// Remote protocol error surfaced by the CIMOM: status code plus
    /// human-readable description.
    #[error("CIM error {code}: {description}")]
    Cim { code: u32, description: String },
    #[error("Fatal: no guest specified.")]
    MissingGuest,
    #[error("Must specify virtualization type")]
    MissingVirtType,
    #[error("Unsupported virtualization type '{0}' [ Xen | KVM ]")]
    UnsupportedVirtType(String),
    #[error("Migration check failed.")]
    NotMigratable,
    #[error("No job returned from migrate call")]
    NoJobReturned,
    #[error("Unable to get job instance")]
    JobFetchFailed,
    #[error("Migrate job failed: {0}")]
    JobFailed(String),
    #[error("Migrate job took too long")]
    Interrupted,
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Malformed CIM-XML response: {0}")]
    MalformedResponse(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<toml::de::Error> for MigrateError {
    fn from(err: toml::de::Error) -> Self {
        MigrateError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for MigrateError {
    fn from(err: reqwest::Error) -> Self {
        MigrateError::Transport(err.to_string())
    }
}
