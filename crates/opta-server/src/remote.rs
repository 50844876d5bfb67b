//! Reconnecting event-stream client.
//!
//! Follows one session's `/ws` stream and reconnects with capped exponential
//! backoff, resuming from the last seq it delivered. Consumers see every
//! envelope once, in seq order, across reconnects.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use opta_core::envelope::Envelope;
use opta_core::ids::SessionId;
use opta_upstream::RetryPolicy;

#[derive(Clone, Debug)]
pub struct RemoteConfig {
    /// `ws://host:port`
    pub base_url: String,
    pub token: String,
    pub session_id: SessionId,
    pub after_seq: u64,
    pub backoff: RetryPolicy,
}

impl RemoteConfig {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, session_id: SessionId) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            session_id,
            after_seq: 0,
            backoff: RetryPolicy {
                max_retries: u32::MAX,
                base_delay: Duration::from_millis(250),
                max_delay: Duration::from_secs(10),
                jitter_factor: 0.2,
            },
        }
    }

    fn url(&self, after_seq: u64) -> String {
        format!(
            "{}/ws?sessionId={}&afterSeq={}&token={}",
            self.base_url.trim_end_matches('/'),
            self.session_id,
            after_seq,
            self.token
        )
    }
}

pub struct EventStream {
    rx: mpsc::Receiver<Envelope>,
    last_seq: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl EventStream {
    /// `None` once the stream is closed or the server refused the session.
    pub async fn next(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Start following a session.
pub fn follow(config: RemoteConfig) -> EventStream {
    let (tx, rx) = mpsc::channel(256);
    let last_seq = Arc::new(AtomicU64::new(config.after_seq));
    let cancel = CancellationToken::new();
    tokio::spawn(run(config, tx, Arc::clone(&last_seq), cancel.clone()));
    EventStream {
        rx,
        last_seq,
        cancel,
    }
}

enum Ended {
    /// Connection dropped; try again.
    Retry,
    /// Consumer gone or cancelled.
    Stop,
}

async fn run(
    config: RemoteConfig,
    tx: mpsc::Sender<Envelope>,
    last_seq: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;
    loop {
        let resume_from = last_seq.load(Ordering::SeqCst);
        let connected = tokio::select! {
            _ = cancel.cancelled() => return,
            r = tokio_tungstenite::connect_async(config.url(resume_from)) => r,
        };

        match connected {
            Ok((socket, _)) => {
                attempt = 0;
                info!(session_id = %config.session_id, resume_from, "event stream attached");
                let (_write, mut read) = socket.split();
                let ended = loop {
                    let message = tokio::select! {
                        _ = cancel.cancelled() => break Ended::Stop,
                        m = read.next() => m,
                    };
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            let envelope: Envelope = match serde_json::from_str(text.as_str()) {
                                Ok(e) => e,
                                // Control replies share the socket.
                                Err(_) => continue,
                            };
                            if envelope.seq <= last_seq.load(Ordering::SeqCst) {
                                continue;
                            }
                            last_seq.store(envelope.seq, Ordering::SeqCst);
                            if tx.send(envelope).await.is_err() {
                                break Ended::Stop;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(?frame, "server closed event stream");
                            break Ended::Retry;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "event stream read failed");
                            break Ended::Retry;
                        }
                        None => break Ended::Retry,
                    }
                };
                if let Ended::Stop = ended {
                    return;
                }
            }
            Err(tungstenite::Error::Http(response))
                if matches!(response.status().as_u16(), 401 | 404) =>
            {
                warn!(session_id = %config.session_id, status = response.status().as_u16(), "event stream refused");
                return;
            }
            Err(e) => {
                warn!(session_id = %config.session_id, attempt, error = %e, "event stream connect failed");
            }
        }

        let delay = config.backoff.delay(attempt.min(16), None);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
