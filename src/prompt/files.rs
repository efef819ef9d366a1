//! File capability checks and downloads.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::future::try_join_all;

use crate::error::RunError;
use crate::llm::{File, FileKind, FileWithKeyPath, ProviderError};
use crate::models::ModelCapabilities;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Fail when the files need a capability the model lacks. Text files are inlined and
/// never need one.
pub fn check_capabilities(
    files: &[FileWithKeyPath],
    capabilities: &ModelCapabilities,
    model: &str,
) -> Result<(), RunError> {
    let unsupported = |mode: &str| RunError::ModelDoesNotSupportMode {
        model: model.to_string(),
        mode: mode.to_string(),
    };

    let mut images = 0usize;
    for f in files {
        match f.file.kind() {
            FileKind::Image => {
                if !capabilities.supports_input_image {
                    return Err(unsupported("image input"));
                }
                images += 1;
            }
            FileKind::Pdf if !capabilities.supports_input_pdf => return Err(unsupported("pdf input")),
            FileKind::Audio if !capabilities.supports_input_audio => {
                return Err(unsupported("audio input"))
            }
            _ => {}
        }
    }
    if images > 1 && !capabilities.supports_multiple_images {
        return Err(unsupported("multiple image input"));
    }
    Ok(())
}

/// Fetches URL-only files so they can be sent inline.
#[derive(Debug, Clone)]
pub struct FileDownloader {
    client: reqwest::Client,
}

impl Default for FileDownloader {
    fn default() -> Self {
        Self::new()
    }
}

impl FileDownloader {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    /// Fill in `data` (and `content_type` when unknown) from the file URL.
    pub async fn download(&self, file: &mut File) -> Result<(), ProviderError> {
        let Some(url) = file.url.clone() else {
            return Err(ProviderError::invalid_file("File has neither data nor url"));
        };
        tracing::debug!("Downloading file {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProviderError::invalid_file(format!("Failed to download {}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(ProviderError::invalid_file(format!(
                "Failed to download {}: status {}",
                url,
                response.status()
            )));
        }
        let header_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ProviderError::invalid_file(format!("Failed to read {}: {}", url, e)))?;

        file.data = Some(STANDARD.encode(&bytes));
        if file.content_type.is_none() {
            file.content_type = header_type;
        }
        Ok(())
    }

    /// Download, concurrently, every file without data for which `needs_download` holds.
    pub async fn download_all<F>(
        &self,
        files: &mut [FileWithKeyPath],
        needs_download: F,
    ) -> Result<(), ProviderError>
    where
        F: Fn(&File) -> bool,
    {
        let pending = files
            .iter_mut()
            .filter(|f| !f.file.has_data() && needs_download(&f.file))
            .map(|f| self.download(&mut f.file));
        try_join_all(pending).await?;
        Ok(())
    }
}
