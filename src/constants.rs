//! Constants and default values used throughout tether.
//!
//! Defaults here back the configuration layer; anything a user may want to
//! change is also exposed through [`crate::config::ManagerConfig`].

use std::time::Duration;

// ============================================================================
// Release Feed
// ============================================================================

/// Repository whose releases carry the server binary.
pub const DEFAULT_RELEASE_REPOSITORY: &str = "restatedev/restate";

/// Base URL of the GitHub REST API.
pub const DEFAULT_RELEASE_API: &str = "https://api.github.com";

/// User agent sent with release feed requests. GitHub rejects anonymous agents.
pub const USER_AGENT: &str = concat!("tether/", env!("CARGO_PKG_VERSION"));

/// Connect timeout for release feed and download requests.
pub const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Overall timeout for the release metadata request.
pub const RELEASE_METADATA_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Binary Cache
// ============================================================================

/// Base name of the managed binary, used for asset matching and the entry suffix.
pub const DEFAULT_BINARY_NAME: &str = "restate-server";

/// Age after which a cached binary is fetched again.
pub const STALENESS_THRESHOLD: Duration = Duration::from_secs(24 * 60 * 60);

/// Name of the advisory lock file guarding installs in a cache directory.
pub const INSTALL_LOCK_FILE: &str = ".install.lock";

/// Directory under `$HOME` holding the global cache.
pub const GLOBAL_CACHE_DIR: &str = ".local/share/tether/bin";

// ============================================================================
// Server Process
// ============================================================================

/// Substring the server prints to stdout once it accepts connections.
pub const DEFAULT_READINESS_MARKER: &str = "Server listening";

/// Directory handed to the server as its base directory.
pub const DEFAULT_BASE_DIRECTORY: &str = ".restate";

/// Node name handed to the server.
pub const DEFAULT_NODE_NAME: &str = "dev-cluster";

/// Command-line flag selecting the server's base directory.
pub const BASE_DIR_FLAG: &str = "--base-dir";

/// Command-line flag selecting the server's node name.
pub const NODE_NAME_FLAG: &str = "--node-name";

/// Grace period after SIGTERM before escalating to SIGKILL.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Wait after SIGKILL before giving up on confirming termination.
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(2);

/// Number of spawn attempts when the freshly installed binary is still busy.
pub const SPAWN_BUSY_RETRIES: usize = 5;

/// Delay between spawn attempts that failed with `ETXTBSY`.
pub const SPAWN_BUSY_DELAY: Duration = Duration::from_millis(50);

/// How long an exited server's remaining stdout is read before its exit is
/// announced. Bounds the wait when a descendant keeps the pipe open.
pub const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

// ============================================================================
// Control Plane
// ============================================================================

/// Admin endpoint of the locally running control plane.
pub const DEFAULT_CONTROL_PLANE: &str = "http://127.0.0.1:9070";

/// Path of the deployment registration endpoint.
pub const DEPLOYMENTS_PATH: &str = "/deployments";

/// Deployment URI registered by default.
pub const DEFAULT_DEPLOYMENT_URI: &str = "http://localhost:9080";

/// Total registration attempts before giving up.
pub const REGISTRATION_ATTEMPTS: u32 = 3;

/// Base delay of the registration backoff; attempt `n` waits `base * 2^n`.
pub const REGISTRATION_BASE_DELAY: Duration = Duration::from_millis(100);

/// Timeout applied to a single registration request.
pub const REGISTRATION_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Workload Readiness
// ============================================================================

/// Lines printed by service SDKs once their HTTP endpoint is up.
pub const SDK_READINESS_MARKERS: [&str; 3] = [
    "Restate HTTP Endpoint server started on port 9080",
    "Restate SDK started listening on [::]:9080",
    "Restate SDK started listening on 127.0.0.1:9080",
];
