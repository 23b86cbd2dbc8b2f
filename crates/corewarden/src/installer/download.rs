use crate::error::InstallError;
use reqwest::header::LOCATION;
use reqwest::{Client, Url};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Byte counters handed to the progress callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub downloaded: u64,
    pub total: Option<u64>,
    pub percent: Option<u8>,
}

/// Fires the callback each time the download crosses into a new bucket
struct ProgressBuckets {
    step: u8,
    last_bucket: Option<u8>,
}

impl ProgressBuckets {
    fn new(step: u8) -> Self {
        Self {
            step: step.clamp(1, 100),
            last_bucket: None,
        }
    }

    fn observe(&mut self, downloaded: u64, total: Option<u64>) -> Option<Progress> {
        let total = total.filter(|t| *t > 0)?;
        let percent = (downloaded.saturating_mul(100) / total).min(100) as u8;
        let bucket = percent - percent % self.step;
        if self.last_bucket.is_some_and(|last| bucket <= last) {
            return None;
        }
        self.last_bucket = Some(bucket);
        Some(Progress {
            downloaded,
            total: Some(total),
            percent: Some(percent),
        })
    }
}

/// Fails with a retryable network error when `io` stays silent for `limit`
async fn within<T, Fut>(limit: Duration, what: &str, io: Fut) -> Result<T, InstallError>
where
    Fut: Future<Output = Result<T, reqwest::Error>>,
{
    match tokio::time::timeout(limit, io).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(InstallError::Network(format!(
            "timed out after {}ms waiting for {what}",
            limit.as_millis()
        ))),
    }
}

/// Download `url` into `dest`, following at most `max_redirects` redirects by hand
pub async fn download_to<F>(
    client: &Client,
    url: &str,
    dest: &Path,
    max_redirects: u32,
    progress_step: u8,
    read_timeout: Duration,
    mut on_progress: F,
) -> Result<u64, InstallError>
where
    F: FnMut(Progress),
{
    let mut current =
        Url::parse(url).map_err(|e| InstallError::InvalidRelease(format!("{url}: {e}")))?;

    for hop in 0..=max_redirects {
        let response = within(
            read_timeout,
            "response headers",
            client.get(current.clone()).send(),
        )
        .await?;
        let status = response.status();

        if status.is_redirection() {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .ok_or_else(|| InstallError::BadRedirect {
                    url: current.to_string(),
                })?;
            let next = current
                .join(location)
                .map_err(|_| InstallError::BadRedirect {
                    url: current.to_string(),
                })?;
            debug!(hop = hop + 1, from = %current, to = %next, "Following redirect");
            current = next;
            continue;
        }

        if !status.is_success() {
            return Err(InstallError::HttpStatus {
                status: status.as_u16(),
                url: current.to_string(),
            });
        }

        return stream_body(response, dest, progress_step, read_timeout, &mut on_progress).await;
    }

    Err(InstallError::RedirectLimit {
        limit: max_redirects,
    })
}

async fn stream_body<F>(
    mut response: reqwest::Response,
    dest: &Path,
    progress_step: u8,
    read_timeout: Duration,
    on_progress: &mut F,
) -> Result<u64, InstallError>
where
    F: FnMut(Progress),
{
    let total = response.content_length();
    let mut buckets = ProgressBuckets::new(progress_step);
    let mut file = tokio::fs::File::create(dest).await?;
    let mut downloaded = 0u64;

    while let Some(chunk) = within(read_timeout, "body data", response.chunk()).await? {
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;
        if let Some(progress) = buckets.observe(downloaded, total) {
            on_progress(progress);
        }
    }
    file.flush().await?;

    if let Some(expected) = total {
        if downloaded < expected {
            return Err(InstallError::Network(format!(
                "body ended after {downloaded} of {expected} bytes"
            )));
        }
    } else {
        on_progress(Progress {
            downloaded,
            total: None,
            percent: None,
        });
    }

    info!(bytes = downloaded, path = %dest.display(), "Download finished");
    Ok(downloaded)
}
