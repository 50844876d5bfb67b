use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use opta_core::errors::HostFailure;
use opta_core::settings::UpstreamSettings;

use crate::backoff::RetryPolicy;
use crate::error::{parse_retry_after, FailureKind, UpstreamError};
use crate::hosts::{HostTable, UpstreamSnapshot};
use crate::openai::{
    ChatAccumulator, ChatCompletion, ChatRequest, ModelInfo, ModelList, SseDecoder, StreamDelta,
};

#[derive(Clone, Debug)]
pub struct UpstreamConfig {
    pub preferred_host: String,
    pub fallback_hosts: Vec<String>,
    pub scheme: String,
    pub port: u16,
    pub request_timeout: Duration,
    /// Longest gap between stream chunks before the stream counts as broken.
    pub stream_idle_timeout: Duration,
    pub cooldown: Duration,
    pub retry: RetryPolicy,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self::from_settings(&UpstreamSettings::default())
    }
}

impl UpstreamConfig {
    pub fn from_settings(settings: &UpstreamSettings) -> Self {
        Self {
            preferred_host: settings.preferred_host.clone(),
            fallback_hosts: settings.fallback_hosts.clone(),
            scheme: settings.scheme.clone(),
            port: settings.port,
            request_timeout: settings.request_timeout(),
            stream_idle_timeout: settings.request_timeout().max(Duration::from_secs(60)),
            cooldown: settings.cooldown(),
            retry: RetryPolicy {
                max_retries: settings.max_retries,
                base_delay: Duration::from_millis(settings.base_delay_ms),
                max_delay: Duration::from_millis(settings.max_delay_ms),
                jitter_factor: settings.jitter_factor,
            },
        }
    }
}

/// One resolved target handed to a request closure.
#[derive(Clone, Debug)]
pub struct Endpoint {
    pub host: String,
    pub base_url: String,
}

impl Endpoint {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// Resilient access to the inference backend across candidate hosts.
pub struct ConnectionManager {
    client: reqwest::Client,
    config: UpstreamConfig,
    api_key: Option<SecretString>,
    table: Mutex<HostTable>,
}

impl ConnectionManager {
    pub fn new(config: UpstreamConfig, api_key: Option<SecretString>) -> Self {
        let table = HostTable::new(
            &config.preferred_host,
            &config.fallback_hosts,
            &config.scheme,
            config.port,
            config.cooldown,
        );
        Self {
            client: reqwest::Client::new(),
            config,
            api_key,
            table: Mutex::new(table),
        }
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    pub fn snapshot(&self) -> UpstreamSnapshot {
        self.table.lock().snapshot(Instant::now())
    }

    pub fn active_host(&self) -> Option<String> {
        self.table.lock().active().map(|c| c.host.clone())
    }

    /// Run `op` against the candidate hosts with the configured per-attempt
    /// timeout.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, UpstreamError>
    where
        F: Fn(Endpoint) -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        self.call_with_timeout(op, Some(self.config.request_timeout))
            .await
    }

    async fn call_with_timeout<T, F, Fut>(
        &self,
        op: F,
        timeout: Option<Duration>,
    ) -> Result<T, UpstreamError>
    where
        F: Fn(Endpoint) -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let plan: Vec<(usize, Endpoint)> = {
            let table = self.table.lock();
            table
                .plan(Instant::now())
                .into_iter()
                .map(|idx| {
                    let c = table.candidate(idx);
                    (
                        idx,
                        Endpoint {
                            host: c.host.clone(),
                            base_url: c.base_url.clone(),
                        },
                    )
                })
                .collect()
        };

        let mut failures = Vec::new();
        for (idx, endpoint) in plan {
            let mut attempt = 0u32;
            loop {
                let result = match timeout {
                    Some(limit) => match tokio::time::timeout(limit, op(endpoint.clone())).await {
                        Ok(result) => result,
                        Err(_) => Err(UpstreamError::Timeout(limit)),
                    },
                    None => op(endpoint.clone()).await,
                };

                let err = match result {
                    Ok(value) => {
                        if self.table.lock().mark_healthy(idx) {
                            info!(host = %endpoint.host, "upstream switched active host");
                        }
                        return Ok(value);
                    }
                    Err(err) => err,
                };

                match err.kind() {
                    FailureKind::Application => return Err(err),
                    FailureKind::Transient if attempt < self.config.retry.max_retries => {
                        let delay = self.config.retry.delay(attempt, err.retry_after());
                        warn!(
                            host = %endpoint.host,
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "transient upstream failure, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    _ => {
                        warn!(host = %endpoint.host, error = %err, "upstream host failed, cooling down");
                        self.table
                            .lock()
                            .mark_cooling(idx, Instant::now(), err.to_string());
                        failures.push(HostFailure {
                            host: endpoint.host.clone(),
                            reason: err.to_string(),
                        });
                        break;
                    }
                }
            }
        }

        Err(UpstreamError::Exhausted(failures))
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key.expose_secret()),
            None => req,
        }
    }

    async fn check_status(
        resp: reqwest::Response,
    ) -> Result<reqwest::Response, UpstreamError> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let retry_after = parse_retry_after(resp.headers().get(reqwest::header::RETRY_AFTER));
        let body = resp.text().await.unwrap_or_default();
        Err(UpstreamError::from_status(status, body, retry_after))
    }

    /// `GET /healthz` with failover.
    #[instrument(skip(self))]
    pub async fn health(&self) -> Result<String, UpstreamError> {
        let timeout = self.config.request_timeout;
        self.call(|ep| {
            let req = self.authorize(self.client.get(ep.url("/healthz")));
            async move {
                let resp = req
                    .send()
                    .await
                    .map_err(|e| UpstreamError::from_reqwest(e, timeout))?;
                Self::check_status(resp).await?;
                Ok(ep.host)
            }
        })
        .await
    }

    /// `GET /v1/models` with failover.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, UpstreamError> {
        let timeout = self.config.request_timeout;
        self.call(|ep| {
            let req = self.authorize(self.client.get(ep.url("/v1/models")));
            async move {
                let resp = req
                    .send()
                    .await
                    .map_err(|e| UpstreamError::from_reqwest(e, timeout))?;
                let resp = Self::check_status(resp).await?;
                let list: ModelList = resp
                    .json()
                    .await
                    .map_err(|e| UpstreamError::Decode(e.to_string()))?;
                Ok(list.data)
            }
        })
        .await
    }

    /// Streamed chat completion with failover. Deltas go to `on_delta` as
    /// they arrive; once one has been delivered the request is no longer
    /// retried or moved to another host.
    #[instrument(skip_all, fields(model = %request.model))]
    pub async fn chat_stream(
        &self,
        request: &ChatRequest,
        on_delta: &(dyn Fn(StreamDelta) + Send + Sync),
    ) -> Result<ChatCompletion, UpstreamError> {
        let committed = AtomicBool::new(false);
        let connect_timeout = self.config.request_timeout;
        let idle_timeout = self.config.stream_idle_timeout;
        let committed_ref = &committed;

        self.call_with_timeout(
            |ep| {
                let req = self
                    .authorize(self.client.post(ep.url("/v1/chat/completions")))
                    .json(request);
                async move {
                    let resp = tokio::time::timeout(connect_timeout, req.send())
                        .await
                        .map_err(|_| UpstreamError::Timeout(connect_timeout))?
                        .map_err(|e| UpstreamError::from_reqwest(e, connect_timeout))?;
                    let resp = Self::check_status(resp).await?;
                    debug!(host = %ep.host, "chat stream opened");

                    let broken = |reason: String| {
                        if committed_ref.load(Ordering::Acquire) {
                            UpstreamError::StreamAborted(reason)
                        } else {
                            UpstreamError::StreamInterrupted(reason)
                        }
                    };

                    let mut bytes = resp.bytes_stream();
                    let mut decoder = SseDecoder::default();
                    let mut acc = ChatAccumulator::default();
                    let mut frames = Vec::new();
                    'stream: loop {
                        let next = tokio::time::timeout(idle_timeout, bytes.next())
                            .await
                            .map_err(|_| broken(format!("idle for {idle_timeout:?}")))?;
                        let ended = next.is_none();
                        match next {
                            Some(Ok(chunk)) => frames.extend(decoder.push(&chunk)),
                            Some(Err(e)) => return Err(broken(e.to_string())),
                            None => frames.extend(decoder.finish()),
                        }
                        for data in frames.drain(..) {
                            if data.trim() == "[DONE]" {
                                break 'stream;
                            }
                            for delta in acc.apply(&data)? {
                                committed_ref.store(true, Ordering::Release);
                                on_delta(delta);
                            }
                        }
                        if ended {
                            break;
                        }
                    }
                    Ok(acc.finish())
                }
            },
            None,
        )
        .await
    }
}
