//! On-disk cache for the managed binary.
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::{
    constants::{INSTALL_LOCK_FILE, STALENESS_THRESHOLD},
    error::CacheError,
};

/// Source of the current time, replaceable in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Snapshot of the cached binary on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedBinary {
    pub path: PathBuf,
    pub last_modified_at: DateTime<Utc>,
}

/// Result of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledBinary {
    pub path: PathBuf,
    /// Hex-encoded SHA-256 of the installed file.
    pub sha256: String,
}

/// Owns the install location of the binary and its freshness policy.
#[derive(Clone)]
pub struct BinaryCache {
    path: PathBuf,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl BinaryCache {
    /// Creates a cache rooted at `path` using the wall clock and the default threshold.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_clock(path, Arc::new(SystemClock))
    }

    /// Creates a cache with an explicit clock.
    pub fn with_clock(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: path.into(),
            ttl: STALENESS_THRESHOLD,
            clock,
        }
    }

    /// Overrides the staleness threshold.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Install location of the binary.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the cached binary's metadata, if present.
    pub fn cached(&self) -> Option<CachedBinary> {
        let modified = fs::metadata(&self.path).and_then(|meta| meta.modified()).ok()?;
        Some(CachedBinary {
            path: self.path.clone(),
            last_modified_at: DateTime::<Utc>::from(modified),
        })
    }

    /// Whether the binary must be fetched again.
    ///
    /// A missing file is always stale; otherwise the file is stale once its
    /// modification time is at least the threshold in the past.
    pub fn is_stale(&self) -> bool {
        let Some(cached) = self.cached() else {
            debug!("No cached binary at {}", self.path.display());
            return true;
        };

        let age = self.clock.now().signed_duration_since(cached.last_modified_at);
        let threshold = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        let stale = age >= threshold;
        debug!(
            "Cached binary {} is {}s old (stale: {stale})",
            self.path.display(),
            age.num_seconds()
        );
        stale
    }

    /// Copies `source` into the cache, replacing any previous binary atomically,
    /// and marks it executable for its owner.
    pub fn install(&self, source: &Path) -> Result<InstalledBinary, CacheError> {
        let install_err = |source: io::Error| CacheError::Install {
            path: self.path.clone(),
            source,
        };

        let dir = self
            .path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(install_err)?;

        let _lock = InstallLock::acquire(&dir.join(INSTALL_LOCK_FILE)).map_err(install_err)?;

        // Stage next to the destination so the final rename stays on one filesystem.
        let mut staged = tempfile::Builder::new()
            .prefix(".tether-staged")
            .tempfile_in(dir)
            .map_err(install_err)?;
        let mut input = File::open(source).map_err(install_err)?;
        io::copy(&mut input, staged.as_file_mut()).map_err(install_err)?;
        staged.as_file().sync_all().map_err(install_err)?;

        mark_executable(staged.path())?;

        let persisted = staged
            .persist(&self.path)
            .map_err(|err| install_err(err.error))?;
        drop(persisted);

        let sha256 = file_sha256(&self.path).map_err(install_err)?;
        info!("Installed binary to {} (sha256 {sha256})", self.path.display());
        Ok(InstalledBinary {
            path: self.path.clone(),
            sha256,
        })
    }
}

/// Exclusive advisory lock held while a cache directory is written.
struct InstallLock {
    file: File,
}

impl InstallLock {
    fn acquire(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for InstallLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!("Failed to release install lock: {err}");
        }
    }
}

/// Adds the owner-execute bit, falling back to clearing the read-only flag
/// where no POSIX permission model exists.
pub fn mark_executable(path: &Path) -> Result<(), CacheError> {
    let denied = |source: io::Error| CacheError::PermissionDenied {
        path: path.to_path_buf(),
        source,
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let mut permissions = fs::metadata(path).map_err(denied)?.permissions();
        permissions.set_mode(permissions.mode() | 0o700);
        fs::set_permissions(path, permissions).map_err(denied)?;
    }

    #[cfg(not(unix))]
    {
        let mut permissions = fs::metadata(path).map_err(denied)?.permissions();
        if permissions.readonly() {
            permissions.set_readonly(false);
            fs::set_permissions(path, permissions).map_err(denied)?;
        }
    }

    Ok(())
}

/// Hex-encoded SHA-256 of a file's contents.
pub fn file_sha256(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect())
}
