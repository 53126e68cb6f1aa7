//! Error handling for tether.
use std::path::PathBuf;

use thiserror::Error;

/// Boxed error used where the underlying transport is pluggable.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Defines all possible errors raised while managing the server binary and its process.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    ConfigReadError(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ConfigParseError(#[from] serde_yaml::Error),

    /// Error in a configuration value.
    #[error("Invalid configuration: {0}")]
    ConfigValueError(String),

    /// Error resolving or downloading a release.
    #[error(transparent)]
    Release(#[from] ReleaseError),

    /// Error unpacking a release archive.
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// Error installing the binary into the cache.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Error registering a deployment with the control plane.
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// Error spawning the server process.
    #[error("Failed to start '{binary}': {source}")]
    SpawnFailed {
        /// The binary that failed to start.
        binary: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The control-plane client could not be set up; no request was sent.
    #[error("Failed to create control plane client: {0}")]
    ControlPlaneClient(#[source] TransportError),

    /// A start was requested while an instance is already starting or running.
    #[error("Server is already running; only one instance can run at a time")]
    AlreadyRunning,

    /// Error for poisoned mutex.
    #[error("Mutex is poisoned: {0}")]
    MutexPoisonError(String),

    /// A background worker thread could not be created.
    #[error("Failed to schedule background worker: {0}")]
    WorkerUnavailable(#[source] std::io::Error),

    /// A background worker panicked before reporting its result.
    #[error("Background worker '{0}' panicked")]
    WorkerPanicked(&'static str),
}

impl ManagerError {
    /// Whether the error only reports a duplicate start rather than a failure.
    pub fn is_already_running(&self) -> bool {
        matches!(self, ManagerError::AlreadyRunning)
    }
}

/// Implement the `From` trait to convert a `std::sync::PoisonError` into a `ManagerError`.
impl<T> From<std::sync::PoisonError<T>> for ManagerError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ManagerError::MutexPoisonError(err.to_string())
    }
}

/// Error type for release resolution and download.
#[derive(Debug, Error)]
pub enum ReleaseError {
    /// The host OS or architecture has no published release tag.
    #[error("Unsupported platform: os '{os}', arch '{arch}'")]
    UnsupportedPlatform {
        /// Host operating system as reported by the environment.
        os: String,
        /// Host architecture as reported by the environment.
        arch: String,
    },

    /// The release feed could not be reached or returned garbage.
    #[error("Release feed '{feed}' unavailable: {source}")]
    FeedUnavailable {
        /// Feed location.
        feed: String,
        /// The underlying error that occurred.
        #[source]
        source: BoxError,
    },

    /// No asset in the latest release matches the binary and platform.
    #[error("Release '{release}' has no asset matching '{binary}' for {platform}")]
    NoMatchingAsset {
        /// Name of the inspected release.
        release: String,
        /// Binary base name searched for.
        binary: String,
        /// Platform tag searched for.
        platform: String,
    },

    /// The asset download could not be opened.
    #[error("Failed to download '{url}': {source}")]
    DownloadFailed {
        /// Download URL.
        url: String,
        /// The underlying error that occurred.
        #[source]
        source: BoxError,
    },
}

/// Error type for archive extraction.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The archive could not be decompressed or is not a valid tar stream.
    #[error("Archive is corrupt: {0}")]
    ArchiveCorrupt(#[source] std::io::Error),

    /// The stream feeding the archive failed before it was fully read.
    #[error("Failed to read archive stream: {0}")]
    SourceUnreadable(#[source] std::io::Error),

    /// No regular entry ends with the requested suffix.
    #[error("No archive entry ends with '{suffix}'")]
    EntryNotFound {
        /// Suffix searched for.
        suffix: String,
    },

    /// Error creating or writing the scratch directory.
    #[error("Failed to write extracted entry: {0}")]
    Io(#[from] std::io::Error),
}

/// Error type for cache install operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Neither permission mechanism could mark the binary executable.
    #[error("Permission denied making '{}' executable: {source}", path.display())]
    PermissionDenied {
        /// Binary path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error copying into or locking the cache directory.
    #[error("Failed to install binary into '{}': {source}", path.display())]
    Install {
        /// Destination path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },
}

/// Error type for control-plane transports.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The configured control plane address is not a usable URL.
    #[error("Invalid control plane endpoint '{endpoint}': {reason}")]
    InvalidEndpoint {
        /// Endpoint as derived from the configuration.
        endpoint: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The request never produced a response.
    #[error("Control plane request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The control plane answered with a non-success status.
    #[error("Control plane responded with status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly empty.
        body: String,
    },
}

/// Error type for deployment registration.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// All attempts failed; carries the last transport error.
    #[error("Failed to register '{uri}' after {attempts} attempts: {source}")]
    RegistrationFailed {
        /// Deployment URI that was being registered.
        uri: String,
        /// Number of attempts performed.
        attempts: u32,
        /// The last underlying error.
        #[source]
        source: TransportError,
    },
}
