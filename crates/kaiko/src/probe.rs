use std::{future::Future, time::Duration};

use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::util::http::HttpClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Present,
    /// The origin answered that nothing lives there.
    Absent,
    /// No definitive answer. Never to be taken as [ProbeOutcome::Absent].
    Indeterminate,
}

impl ProbeOutcome {
    pub fn from_status(status: StatusCode) -> Self {
        if status.is_success() {
            Self::Present
        } else if status.is_client_error()
            && status != StatusCode::TOO_MANY_REQUESTS
            && status != StatusCode::REQUEST_TIMEOUT
        {
            Self::Absent
        } else {
            Self::Indeterminate
        }
    }
}

/// Tells whether a candidate segment exists without downloading it.
pub trait ExistenceProbe: Send + Sync + 'static {
    fn check(&self, url: &Url) -> impl Future<Output = ProbeOutcome> + Send;
}

#[derive(Clone)]
pub struct HttpExistenceProbe {
    client: HttpClient,
    timeout: Duration,
}

impl HttpExistenceProbe {
    pub fn new(client: HttpClient, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

impl ExistenceProbe for HttpExistenceProbe {
    async fn check(&self, url: &Url) -> ProbeOutcome {
        match self
            .client
            .head(url.clone())
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(response) => ProbeOutcome::from_status(response.status()),
            Err(e) => {
                tracing::trace!("Probe of {url} failed: {e}");
                ProbeOutcome::Indeterminate
            }
        }
    }
}

/// Repeats indeterminate probes up to `attempts` times in total.
pub async fn check_with_retries<P>(
    probe: &P,
    url: &Url,
    attempts: u32,
    delay: Duration,
    token: &CancellationToken,
) -> ProbeOutcome
where
    P: ExistenceProbe,
{
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        let outcome = probe.check(url).await;
        if outcome != ProbeOutcome::Indeterminate || attempt == attempts {
            return outcome;
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    ProbeOutcome::Indeterminate
}
