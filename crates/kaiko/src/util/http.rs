use std::{future::Future, ops::Deref};

use bytes::Bytes;
use reqwest::{Client, ClientBuilder};
use url::Url;

use crate::error::{KaikoError, KaikoResult};

#[derive(Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new(builder: ClientBuilder) -> KaikoResult<Self> {
        Ok(Self {
            client: builder.build()?,
        })
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Deref for HttpClient {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

/// Where segment bytes come from.
pub trait SegmentSource: Send + Sync + 'static {
    fn fetch_segment(&self, url: &Url) -> impl Future<Output = KaikoResult<Bytes>> + Send;
}

impl SegmentSource for HttpClient {
    async fn fetch_segment(&self, url: &Url) -> KaikoResult<Bytes> {
        let response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            tracing::warn!("Segment {url} responded with status {}", response.status());
            return Err(KaikoError::HttpError(response.status()));
        }

        Ok(response.bytes().await?)
    }
}
