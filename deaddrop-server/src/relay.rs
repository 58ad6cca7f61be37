use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use deaddrop_core::{BlobMeta, BlobName, BlobStore, Codec, Direction, RequestFrame};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::tcp_proxy::TcpProxy;

/// What became of one request blob. The blob itself is gone in every case.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The destination answered; the response blob has this name.
    Answered(BlobName),
    /// The destination sent nothing back.
    Silent,
    /// The blob could not be parsed, downloaded or decrypted.
    Discarded,
    /// Frame decoding, the destination exchange or the response upload failed.
    Failed,
}

/// Drains the requests folder, one blob at a time, oldest first.
///
/// Keeps no per-session state: each request opens its own destination
/// connection and is answered under the same sequence number.
pub struct Relay {
    pub store: Arc<dyn BlobStore>,
    pub codec: Arc<dyn Codec>,
    pub requests_folder: String,
    pub responses_folder: String,
    pub chunk_size: usize,
    pub poll_interval: Duration,
    pub error_backoff: Duration,
}

impl Relay {
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            "Listening for requests in folder {} (responses to {})",
            self.requests_folder, self.responses_folder
        );

        loop {
            let pause = match self.poll_once().await {
                Ok(0) => self.poll_interval,
                Ok(n) => {
                    debug!("Processed {n} requests");
                    self.poll_interval
                }
                Err(e) => {
                    error!(
                        "Polling failed, retrying in {:?}: {e:#}",
                        self.error_backoff
                    );
                    self.error_backoff
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = cancel.cancelled() => { break; }
            }
        }

        info!("Relay stopped");
    }

    /// One cycle over the requests folder. Only a listing failure is an error.
    pub async fn poll_once(&self) -> Result<usize> {
        let listed = self
            .store
            .list(&self.requests_folder)
            .await
            .context("listing requests")?;

        let pending = oldest_first(listed);
        for meta in &pending {
            self.process(meta).await;
        }

        Ok(pending.len())
    }

    /// Handle one request blob and delete it, whatever happened.
    pub async fn process(&self, meta: &BlobMeta) -> Outcome {
        let outcome = match self.handle(meta).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Error relaying {}: {e:#}", meta.name);
                Outcome::Failed
            }
        };

        if let Err(e) = self.store.delete(&meta.id).await {
            warn!("Failed to delete request {}: {e}", meta.name);
        }

        outcome
    }

    async fn handle(&self, meta: &BlobMeta) -> Result<Outcome> {
        let name: BlobName = match meta.name.parse() {
            Ok(name) => name,
            Err(e) => {
                warn!("Malformed request blob name: {e}. Deleting.");
                return Ok(Outcome::Discarded);
            }
        };
        let sid = &name.session_id;

        info!("[{sid}] Processing request packet {}", name.seq);

        let sealed = match self.store.download(&meta.id).await {
            Ok(sealed) => sealed,
            Err(e) => {
                error!("[{sid}] Failed to download {}: {e}. Deleting.", meta.name);
                return Ok(Outcome::Discarded);
            }
        };

        let plain = match self.codec.decrypt(&sealed) {
            Ok(plain) => plain,
            Err(e) => {
                error!("[{sid}] Failed to decrypt {}: {e}. Deleting.", meta.name);
                return Ok(Outcome::Discarded);
            }
        };

        let frame = RequestFrame::decode(&plain).context("decoding request frame")?;
        let target = frame.target();

        info!("[{sid}] Connecting to {target}");
        let response = TcpProxy::exchange(&target, &frame.payload, self.chunk_size).await?;

        if response.is_empty() {
            warn!("[{sid}] No response data received from {target}");
            return Ok(Outcome::Silent);
        }

        let reply = name.response_to();
        let sealed = self.codec.encrypt(&response)?;
        info!("[{sid}] Uploading {reply} ({} bytes)", response.len());
        self.store
            .upload(&self.responses_folder, &reply.to_string(), sealed)
            .await
            .with_context(|| format!("uploading {reply}"))?;

        Ok(Outcome::Answered(reply))
    }
}

/// Request blobs only, in store creation order. Ties break on session id
/// and then numeric sequence, so one session's chunks stay in order when
/// timestamps collide. Unparseable names sort last among their ties.
fn oldest_first(listed: Vec<BlobMeta>) -> Vec<BlobMeta> {
    let mut pending: Vec<BlobMeta> = listed
        .into_iter()
        .filter(|meta| Direction::Request.matches(&meta.name))
        .collect();
    pending.sort_by_cached_key(|meta| {
        let parsed = meta
            .name
            .parse::<BlobName>()
            .map(|name| (name.session_id.to_string(), name.seq))
            .map_err(|_| meta.name.clone());
        (meta.created, parsed)
    });
    pending
}
