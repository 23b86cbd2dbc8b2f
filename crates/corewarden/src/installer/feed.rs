use crate::error::InstallError;
use async_trait::async_trait;
use corewarden_core::InstallerSettings;
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseAsset {
    pub name: String,
    pub download_url: String,
}

/// Metadata of one published core release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub version: String,
    pub assets: Vec<ReleaseAsset>,
}

impl Release {
    pub fn find_asset(&self, name: &str) -> Option<&ReleaseAsset> {
        self.assets.iter().find(|asset| asset.name == name)
    }
}

/// Source of release metadata
#[async_trait]
pub trait ReleaseFeed: Send + Sync {
    async fn latest_release(&self) -> Result<Release, InstallError>;
}

#[derive(Debug, Deserialize)]
struct GithubRelease {
    tag_name: String,
    #[serde(default)]
    assets: Vec<GithubAsset>,
}

#[derive(Debug, Deserialize)]
struct GithubAsset {
    name: String,
    browser_download_url: String,
}

/// Release feed backed by a GitHub-style `releases/latest` endpoint
pub struct GithubReleaseFeed {
    client: reqwest::Client,
    url: String,
}

impl GithubReleaseFeed {
    pub fn new(settings: &InstallerSettings) -> Result<Self, InstallError> {
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .connect_timeout(settings.connect_timeout())
            .timeout(settings.read_timeout())
            .build()?;
        Ok(Self {
            client,
            url: settings.release_feed_url.clone(),
        })
    }
}

#[async_trait]
impl ReleaseFeed for GithubReleaseFeed {
    async fn latest_release(&self) -> Result<Release, InstallError> {
        debug!(url = %self.url, "Resolving latest core release");
        let release: GithubRelease = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if release.tag_name.trim().is_empty() {
            return Err(InstallError::InvalidRelease("empty tag_name".to_string()));
        }

        Ok(Release {
            version: release.tag_name,
            assets: release
                .assets
                .into_iter()
                .map(|asset| ReleaseAsset {
                    name: asset.name,
                    download_url: asset.browser_download_url,
                })
                .collect(),
        })
    }
}

/// Operating system and architecture as they appear in asset names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }

    pub fn is_windows(&self) -> bool {
        self.os == "windows"
    }

    pub fn archive_extension(&self) -> &'static str {
        if self.is_windows() { "zip" } else { "tar.gz" }
    }

    fn unsupported(&self) -> InstallError {
        InstallError::UnsupportedPlatform {
            os: self.os.clone(),
            arch: self.arch.clone(),
        }
    }

    /// `{prefix}-{version without v}-{os}-{arch}.{zip|tar.gz}`
    pub fn asset_name(&self, prefix: &str, version: &str) -> Result<String, InstallError> {
        let os = match self.os.as_str() {
            "windows" => "windows",
            "linux" => "linux",
            "macos" => "darwin",
            _ => return Err(self.unsupported()),
        };
        let arch = match self.arch.as_str() {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            "arm" => "armv7",
            _ => return Err(self.unsupported()),
        };
        let version = version.trim().trim_start_matches('v');
        Ok(format!(
            "{prefix}-{version}-{os}-{arch}.{}",
            self.archive_extension()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform(os: &str, arch: &str) -> Platform {
        Platform {
            os: os.to_string(),
            arch: arch.to_string(),
        }
    }

    #[test]
    fn test_asset_names() {
        assert_eq!(
            platform("linux", "x86_64").asset_name("sing-box", "v1.11.4").unwrap(),
            "sing-box-1.11.4-linux-amd64.tar.gz"
        );
        assert_eq!(
            platform("windows", "x86_64").asset_name("sing-box", "1.11.4").unwrap(),
            "sing-box-1.11.4-windows-amd64.zip"
        );
        assert_eq!(
            platform("macos", "aarch64").asset_name("sing-box", "v1.12.0-beta.1").unwrap(),
            "sing-box-1.12.0-beta.1-darwin-arm64.tar.gz"
        );
    }

    #[test]
    fn test_unsupported_platform() {
        let error = platform("freebsd", "x86_64")
            .asset_name("sing-box", "v1.0.0")
            .unwrap_err();
        assert_eq!(
            error,
            InstallError::UnsupportedPlatform {
                os: "freebsd".into(),
                arch: "x86_64".into()
            }
        );
        assert!(platform("linux", "riscv64").asset_name("sing-box", "1").is_err());
    }

    #[test]
    fn test_find_asset() {
        let release = Release {
            version: "v1.0.0".into(),
            assets: vec![ReleaseAsset {
                name: "sing-box-1.0.0-linux-amd64.tar.gz".into(),
                download_url: "https://example.invalid/a".into(),
            }],
        };
        assert!(release.find_asset("sing-box-1.0.0-linux-amd64.tar.gz").is_some());
        assert!(release.find_asset("sing-box-1.0.0-linux-arm64.tar.gz").is_none());
    }

    #[test]
    fn test_github_payload_shape() {
        let json = r#"{
            "tag_name": "v1.11.4",
            "name": "sing-box 1.11.4",
            "assets": [
                {"name": "sing-box-1.11.4-linux-amd64.tar.gz", "size": 10,
                 "browser_download_url": "https://github.com/x/releases/download/v1.11.4/a.tar.gz"}
            ]
        }"#;
        let release: GithubRelease = serde_json::from_str(json).unwrap();
        assert_eq!(release.tag_name, "v1.11.4");
        assert_eq!(release.assets.len(), 1);
    }
}
