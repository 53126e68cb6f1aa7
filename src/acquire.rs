//! Locates the server binary, fetching it into the cache when needed.
use std::{path::PathBuf, sync::Arc};

use tracing::{debug, info};

use crate::{
    archive::extract_binary,
    cache::{BinaryCache, InstalledBinary},
    config::ManagerConfig,
    error::{ArchiveError, ManagerError, ReleaseError},
    platform::PlatformTag,
    release::{GitHubReleaseFeed, ReleaseFeed, resolve_latest_asset},
};

/// How the binary handed to the supervisor was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinarySource {
    /// A fresh cached copy was reused.
    Cached,
    /// A new copy was downloaded and installed.
    Downloaded(InstalledBinary),
    /// The binary is expected on the system `PATH`.
    System,
}

/// Program to execute together with its provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBinary {
    pub program: PathBuf,
    pub source: BinarySource,
}

/// Joins the release feed, archive extraction, and the cache.
#[derive(Clone)]
pub struct BinaryAcquirer {
    download: bool,
    binary_name: String,
    system_binary: String,
    cache: BinaryCache,
    feed: Arc<dyn ReleaseFeed>,
    platform: Option<PlatformTag>,
}

impl BinaryAcquirer {
    /// Builds an acquirer backed by the GitHub release feed.
    pub fn from_config(config: &ManagerConfig) -> Result<Self, ManagerError> {
        let feed = GitHubReleaseFeed::new(&config.release_api, &config.release_repository)?;
        Self::with_feed(config, Arc::new(feed))
    }

    /// Builds an acquirer using an explicit feed.
    pub fn with_feed(
        config: &ManagerConfig,
        feed: Arc<dyn ReleaseFeed>,
    ) -> Result<Self, ManagerError> {
        Ok(Self {
            download: config.download_binary,
            binary_name: config.binary_name.clone(),
            system_binary: config.system_binary().to_string(),
            cache: BinaryCache::new(config.cache_location()?),
            feed,
            platform: None,
        })
    }

    /// Pins the platform instead of detecting the host.
    pub fn with_platform(mut self, platform: PlatformTag) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Replaces the cache, e.g. to inject a clock.
    pub fn with_cache(mut self, cache: BinaryCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn cache(&self) -> &BinaryCache {
        &self.cache
    }

    /// Returns a runnable binary, downloading it only when the cache is stale.
    pub fn ensure_binary(&self) -> Result<ResolvedBinary, ManagerError> {
        if !self.download {
            debug!("Using system binary '{}'", self.system_binary);
            return Ok(ResolvedBinary {
                program: PathBuf::from(&self.system_binary),
                source: BinarySource::System,
            });
        }

        if !self.cache.is_stale() {
            debug!("Reusing cached binary at {}", self.cache.path().display());
            return Ok(ResolvedBinary {
                program: self.cache.path().to_path_buf(),
                source: BinarySource::Cached,
            });
        }

        let installed = self.refresh()?;
        Ok(ResolvedBinary {
            program: installed.path.clone(),
            source: BinarySource::Downloaded(installed),
        })
    }

    /// Downloads the latest release into the cache regardless of staleness.
    pub fn refresh(&self) -> Result<InstalledBinary, ManagerError> {
        let platform = match self.platform {
            Some(platform) => platform,
            None => PlatformTag::detect()?,
        };

        info!("Fetching latest '{}' for {platform}", self.binary_name);
        let asset = resolve_latest_asset(self.feed.as_ref(), &self.binary_name, platform)?;
        let stream = self.feed.open_asset(&asset)?;
        let extracted = extract_binary(stream, &self.binary_name).map_err(|err| match err {
            ArchiveError::SourceUnreadable(source) => {
                ManagerError::Release(ReleaseError::DownloadFailed {
                    url: asset.download_url.clone(),
                    source: Box::new(source),
                })
            }
            other => ManagerError::Archive(other),
        })?;
        let installed = self.cache.install(extracted.path())?;
        // `extracted` drops here and removes its scratch directory.
        Ok(installed)
    }
}
