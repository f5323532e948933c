//! Byte transports for model downloads
//!
//! The remote API does not guarantee byte-range support, so a transport only
//! ever fetches a whole file from offset zero.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;

use crate::error::{LifecycleError, Result};

pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Response body of one fetch
pub struct TransferBody {
    /// Content length when the server reports one
    pub total_bytes: Option<u64>,
    pub stream: ByteStream,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<TransferBody>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        // Large models over slow links
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .timeout(std::time::Duration::from_secs(7200))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, url: &str) -> Result<TransferBody> {
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(LifecycleError::DownloadFailed(format!(
                "Download failed with status: {}",
                response.status()
            )));
        }

        let total_bytes = response.content_length();
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(LifecycleError::from))
            .boxed();

        Ok(TransferBody { total_bytes, stream })
    }
}
