use anyhow::{Result, anyhow};
use reqwest::Client;
use tracing::{debug, warn};
use url::Url;

use crate::bridge::MediaRef;

const MAX_DISCORD_FILE_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub data: Vec<u8>,
    pub filename: String,
}

/// Fetches source attachments so they can be uploaded again at the destination.
pub struct MediaHandler {
    client: Client,
}

impl Default for MediaHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaHandler {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    pub async fn download(&self, media: &MediaRef) -> Result<MediaInfo> {
        let mut info = self.download_from_url(&media.url).await?;
        if !media.filename.is_empty() {
            info.filename = media.filename.clone();
        }
        Self::check_discord_file_size(info.data.len())?;
        Ok(info)
    }

    pub async fn download_from_url(&self, url: &str) -> Result<MediaInfo> {
        debug!("downloading media from {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| anyhow!("failed to download from {}: {}", url, e))?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "failed to download from {}: status {}",
                url,
                response.status()
            ));
        }

        let data = response
            .bytes()
            .await
            .map_err(|e| anyhow!("failed to read response body: {}", e))?
            .to_vec();

        debug!("downloaded {} bytes from {}", data.len(), url);

        Ok(MediaInfo {
            data,
            filename: filename_from_url(url),
        })
    }

    pub fn check_discord_file_size(size: usize) -> Result<()> {
        if size > MAX_DISCORD_FILE_SIZE {
            warn!(
                "file too large for Discord: {} bytes (max {})",
                size, MAX_DISCORD_FILE_SIZE
            );
            Err(anyhow!(
                "file too large for Discord: {} bytes (max {})",
                size,
                MAX_DISCORD_FILE_SIZE
            ))
        } else {
            Ok(())
        }
    }
}

/// Last path segment of `url` without its query string.
fn filename_from_url(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "attachment".to_string())
}
