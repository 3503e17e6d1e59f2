//! Release download.

use std::future::Future;

use reqwest::StatusCode;

use super::InstallError;

/// Fetches a release archive into memory.
pub trait ReleaseFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<Vec<u8>, InstallError>> + Send;
}

/// HTTPS fetcher backed by `reqwest`. No retries: a failed download aborts
/// the install with the transport error attached.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    http: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        // Ensure a TLS crypto provider is installed (reqwest uses rustls-no-provider).
        // The `Err` case just means it was already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ReleaseFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, InstallError> {
        let download_error = |e: reqwest::Error| InstallError::Download {
            url: url.to_string(),
            reason: e.to_string(),
        };
        let resp = self.http.get(url).send().await.map_err(download_error)?;
        let status = resp.status();
        if status != StatusCode::OK {
            return Err(InstallError::DownloadStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let body = resp.bytes().await.map_err(download_error)?;
        Ok(body.to_vec())
    }
}
