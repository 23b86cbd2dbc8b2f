//! Makes sure the core executable exists locally.
//!
//! Order of preference: the canonical path, a binary the user dropped
//! somewhere under the install directory, then the latest published release.
//! Concurrent callers share one attempt.

mod download;
mod extract;
mod feed;

pub use download::Progress;
pub use feed::{GithubReleaseFeed, Platform, Release, ReleaseAsset, ReleaseFeed};

use crate::error::InstallError;
use async_trait::async_trait;
use corewarden_core::{
    EventBus, InstallPhase, InstallerSettings, InstallerState, RetryPolicy, StatusEvent,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

type InstallOutcome = Option<Result<PathBuf, InstallError>>;

/// Anything that can hand the supervisor a runnable core binary
#[async_trait]
pub trait BinaryProvider: Send + Sync {
    async fn ensure_binary(&self) -> Result<PathBuf, InstallError>;
}

/// A binary that is already in place and never downloaded
#[derive(Debug, Clone)]
pub struct ExistingBinary(pub PathBuf);

#[async_trait]
impl BinaryProvider for ExistingBinary {
    async fn ensure_binary(&self) -> Result<PathBuf, InstallError> {
        if is_file(&self.0).await {
            Ok(self.0.clone())
        } else {
            Err(InstallError::ExecutableMissing {
                name: self.0.display().to_string(),
            })
        }
    }
}

/// Coalescing installer for the core binary
#[derive(Clone)]
pub struct Installer {
    inner: Arc<InstallerInner>,
}

struct InstallerInner {
    settings: InstallerSettings,
    feed: Arc<dyn ReleaseFeed>,
    client: reqwest::Client,
    platform: Platform,
    policy: RetryPolicy,
    events: EventBus,
    in_flight: Mutex<Option<watch::Receiver<InstallOutcome>>>,
}

impl Installer {
    /// Installer resolving releases from the configured GitHub feed
    pub fn new(settings: InstallerSettings, events: EventBus) -> Result<Self, InstallError> {
        let feed = Arc::new(GithubReleaseFeed::new(&settings)?);
        Self::with_feed(settings, events, feed)
    }

    pub fn with_feed(
        settings: InstallerSettings,
        events: EventBus,
        feed: Arc<dyn ReleaseFeed>,
    ) -> Result<Self, InstallError> {
        // Redirects are followed by hand so the hop limit is ours to enforce
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .connect_timeout(settings.connect_timeout())
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            inner: Arc::new(InstallerInner {
                policy: RetryPolicy::new(&settings.download_retry),
                settings,
                feed,
                client,
                platform: Platform::current(),
                events,
                in_flight: Mutex::new(None),
            }),
        })
    }

    pub fn binary_path(&self) -> PathBuf {
        self.inner.settings.binary_path()
    }

    pub fn settings(&self) -> &InstallerSettings {
        &self.inner.settings
    }

    /// Return the canonical binary path, installing it first if needed
    pub async fn ensure_binary(&self) -> Result<PathBuf, InstallError> {
        let binary = self.binary_path();
        if is_file(&binary).await {
            return Ok(binary);
        }

        let mut outcome = self.join_or_begin();
        let result = outcome
            .wait_for(Option::is_some)
            .await
            .map(|settled| settled.clone())
            .unwrap_or(None);
        result.unwrap_or(Err(InstallError::Interrupted))
    }

    fn join_or_begin(&self) -> watch::Receiver<InstallOutcome> {
        let mut slot = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(pending) = slot.as_ref() {
            if pending.borrow().is_none() {
                debug!("Joining in-flight core installation");
                return pending.clone();
            }
        }

        let (tx, rx) = watch::channel(None);
        *slot = Some(rx.clone());
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let result = inner.install().await;
            tx.send_replace(Some(result));
        });
        rx
    }
}

#[async_trait]
impl BinaryProvider for Installer {
    async fn ensure_binary(&self) -> Result<PathBuf, InstallError> {
        Installer::ensure_binary(self).await
    }
}

impl InstallerInner {
    fn publish(&self, state: &InstallerState) {
        self.events.emit(StatusEvent::Installer(state.clone()));
    }

    fn enter(&self, state: &mut InstallerState, phase: InstallPhase) {
        state.phase = phase;
        self.publish(state);
    }

    async fn install(&self) -> Result<PathBuf, InstallError> {
        let binary = self.settings.binary_path();
        let mut state = InstallerState::new(self.settings.install_dir.clone(), binary.clone());
        self.publish(&state);

        if is_file(&binary).await {
            self.enter(&mut state, InstallPhase::Ready);
            return Ok(binary);
        }

        let result = match self.adopt_manual_binary().await {
            Ok(Some(path)) => Ok(path),
            Ok(None) => {
                self.enter(&mut state, InstallPhase::Missing);
                self.download_release(&mut state).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(path) => {
                self.enter(&mut state, InstallPhase::Completed);
                info!(path = %path.display(), version = ?state.version, "Core binary ready");
                Ok(path)
            }
            Err(e) => {
                error!(error = %e, "Core installation failed");
                state.error = Some(e.to_string());
                self.enter(&mut state, InstallPhase::Failed);
                Err(e)
            }
        }
    }

    /// Adopt a binary placed anywhere under the install directory, without network access
    async fn adopt_manual_binary(&self) -> Result<Option<PathBuf>, InstallError> {
        let root = self.settings.install_dir.clone();
        let name = self.settings.binary_name.clone();
        let canonical = self.settings.binary_path();

        let candidate = tokio::task::spawn_blocking(move || {
            extract::find_file(&root, &name)
                .into_iter()
                .find(|path| *path != canonical)
        })
        .await
        .map_err(|e| InstallError::Io(e.to_string()))?;

        let Some(source) = candidate else {
            return Ok(None);
        };

        info!(source = %source.display(), "Adopting manually placed core binary");
        let path = extract::install_executable(
            &source,
            &self.settings.install_dir,
            &self.settings.binary_name,
            true,
        )
        .await?;
        Ok(Some(path))
    }

    async fn download_release(&self, state: &mut InstallerState) -> Result<PathBuf, InstallError> {
        self.enter(state, InstallPhase::Resolving);
        let release = self
            .policy
            .run(|| self.feed.latest_release(), InstallError::is_retryable)
            .await?;

        let expected = self
            .platform
            .asset_name(&self.settings.asset_prefix, &release.version)?;
        let asset = release
            .find_asset(&expected)
            .ok_or_else(|| InstallError::AssetNotFound {
                version: release.version.clone(),
                expected: expected.clone(),
            })?;
        state.version = Some(release.version.clone());
        info!(version = %release.version, asset = %asset.name, "Resolved core release");

        tokio::fs::create_dir_all(&self.settings.install_dir).await?;
        // Removed on drop, whatever happens below
        let workspace = tempfile::Builder::new()
            .prefix(".corewarden-")
            .tempdir_in(&self.settings.install_dir)?;
        let archive = workspace.path().join(&asset.name);

        self.enter(state, InstallPhase::Downloading);
        let base = state.clone();
        self.policy
            .run(
                || {
                    let mut progress_state = base.clone();
                    download::download_to(
                        &self.client,
                        &asset.download_url,
                        &archive,
                        self.settings.max_redirects,
                        self.settings.progress_step_percent,
                        self.settings.read_timeout(),
                        move |progress| {
                            progress_state.progress_bytes = Some(progress.downloaded);
                            progress_state.total_bytes = progress.total;
                            progress_state.percent = progress.percent;
                            self.publish(&progress_state);
                        },
                    )
                },
                InstallError::is_retryable,
            )
            .await?;

        self.enter(state, InstallPhase::Extracting);
        let extracted = workspace.path().join("extracted");
        extract::extract_archive(&archive, &extracted).await?;

        let root = extracted.clone();
        let name = self.settings.binary_name.clone();
        let found = tokio::task::spawn_blocking(move || extract::find_file(&root, &name))
            .await
            .map_err(|e| InstallError::Io(e.to_string()))?;
        let Some(source) = found.into_iter().next() else {
            warn!(archive = %asset.name, "Archive does not contain the core executable");
            return Err(InstallError::ExecutableMissing {
                name: self.settings.binary_name.clone(),
            });
        };

        extract::install_executable(
            &source,
            &self.settings.install_dir,
            &self.settings.binary_name,
            self.platform.is_windows(),
        )
        .await
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}
