//! Release feed access and platform-specific asset selection.
use std::io::Read;

use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::{debug, info};

use crate::{
    constants::{HTTP_CONNECT_TIMEOUT, RELEASE_METADATA_TIMEOUT, USER_AGENT},
    error::ReleaseError,
    platform::PlatformTag,
};

/// Downloadable file attached to a release.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReleaseAsset {
    /// File name as published.
    pub name: String,
    /// Direct download URL.
    #[serde(rename = "browser_download_url")]
    pub download_url: String,
}

/// Release metadata returned by a feed.
#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    /// Human-readable release name, falling back to the tag.
    #[serde(default)]
    pub name: Option<String>,
    /// Git tag of the release.
    #[serde(default)]
    pub tag_name: String,
    /// Attached assets.
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

impl Release {
    /// Display label for logs and errors.
    pub fn label(&self) -> &str {
        match self.name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => &self.tag_name,
        }
    }
}

/// Source of releases and their downloadable assets.
pub trait ReleaseFeed: Send + Sync {
    /// Returns the most recent release.
    fn latest_release(&self) -> Result<Release, ReleaseError>;

    /// Opens a streaming reader over an asset's bytes.
    fn open_asset(&self, asset: &ReleaseAsset) -> Result<Box<dyn Read + Send>, ReleaseError>;
}

/// Release feed backed by the GitHub REST API.
pub struct GitHubReleaseFeed {
    api_base: String,
    repository: String,
    client: Client,
    download_client: Client,
}

impl GitHubReleaseFeed {
    /// Creates a feed for `owner/name` served from `api_base`.
    pub fn new(api_base: &str, repository: &str) -> Result<Self, ReleaseError> {
        let feed = format!("{}/repos/{}", api_base.trim_end_matches('/'), repository);
        let unavailable = |err: reqwest::Error| ReleaseError::FeedUnavailable {
            feed: feed.clone(),
            source: Box::new(err),
        };

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .timeout(RELEASE_METADATA_TIMEOUT)
            .build()
            .map_err(unavailable)?;
        // Archive bodies can take longer than any fixed deadline.
        let download_client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .timeout(None)
            .build()
            .map_err(unavailable)?;

        Ok(Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            repository: repository.to_string(),
            client,
            download_client,
        })
    }

    fn latest_url(&self) -> String {
        format!("{}/repos/{}/releases/latest", self.api_base, self.repository)
    }
}

impl ReleaseFeed for GitHubReleaseFeed {
    fn latest_release(&self) -> Result<Release, ReleaseError> {
        let url = self.latest_url();
        debug!("Querying release feed {url}");

        let unavailable = |err: reqwest::Error| ReleaseError::FeedUnavailable {
            feed: url.clone(),
            source: Box::new(err),
        };

        let release = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .send()
            .and_then(|response| response.error_for_status())
            .map_err(unavailable)?
            .json::<Release>()
            .map_err(unavailable)?;

        info!(
            "Latest release of '{}': {} ({} assets)",
            self.repository,
            release.label(),
            release.assets.len()
        );
        Ok(release)
    }

    fn open_asset(&self, asset: &ReleaseAsset) -> Result<Box<dyn Read + Send>, ReleaseError> {
        info!(
            "Downloading release asset '{}' from {}",
            asset.name, asset.download_url
        );

        let response = self
            .download_client
            .get(&asset.download_url)
            .header("Accept", "application/octet-stream")
            .send()
            .and_then(|response| response.error_for_status())
            .map_err(|err| ReleaseError::DownloadFailed {
                url: asset.download_url.clone(),
                source: Box::new(err),
            })?;

        Ok(Box::new(response))
    }
}

/// Picks the first asset whose name carries the binary name and both platform tags.
pub fn select_asset(
    release: &Release,
    binary_name: &str,
    platform: PlatformTag,
) -> Result<ReleaseAsset, ReleaseError> {
    release
        .assets
        .iter()
        .find(|asset| asset.name.contains(binary_name) && platform.matches(&asset.name))
        .cloned()
        .ok_or_else(|| ReleaseError::NoMatchingAsset {
            release: release.label().to_string(),
            binary: binary_name.to_string(),
            platform: platform.to_string(),
        })
}

/// Fetches the latest release and selects the asset for `platform`.
pub fn resolve_latest_asset(
    feed: &dyn ReleaseFeed,
    binary_name: &str,
    platform: PlatformTag,
) -> Result<ReleaseAsset, ReleaseError> {
    debug!("Looking for '{binary_name}' asset for {platform}");
    let release = feed.latest_release()?;
    let asset = select_asset(&release, binary_name, platform)?;
    info!("Selected release asset '{}'", asset.name);
    Ok(asset)
}

/// Maps raw host names onto a tag before consulting the feed.
pub fn resolve_for_host(
    feed: &dyn ReleaseFeed,
    binary_name: &str,
    os: &str,
    arch: &str,
) -> Result<ReleaseAsset, ReleaseError> {
    let platform = PlatformTag::from_parts(os, arch)?;
    resolve_latest_asset(feed, binary_name, platform)
}
