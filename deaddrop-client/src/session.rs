//! Session engine: one send loop and one receive loop per SOCKS5 tunnel.
//!
//! The send loop turns every chunk read from the local socket into a sealed
//! request blob numbered `1, 2, 3, ...`. The receive loop polls the responses
//! folder, and because the store gives no ordering guarantee it re-sorts the
//! session's response blobs every cycle and only ever moves its cursor
//! forward, so bytes reach the socket in sequence order.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use deaddrop_core::{
    BlobMeta, BlobName, BlobStore, Codec, Direction, RequestFrame, SessionId, StoreError,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::registry::{SessionInfo, SessionRegistry};
use crate::socks5::Target;

const MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// Everything a session needs from the process: the store, the codec, the
/// folder names, the tuning knobs and the registry it lives in.
pub struct Tunnel {
    pub store: Arc<dyn BlobStore>,
    pub codec: Arc<dyn Codec>,
    pub requests_folder: String,
    pub responses_folder: String,
    pub poll_interval: Duration,
    pub chunk_size: usize,
    pub registry: SessionRegistry,
}

/// Outbound half of a session. Owns `next_send_seq`.
pub struct Outbox {
    session_id: SessionId,
    target: Target,
    next_send_seq: u64,
}

impl Outbox {
    pub fn new(session_id: SessionId, target: Target) -> Self {
        Self {
            session_id,
            target,
            next_send_seq: 0,
        }
    }

    pub fn next_send_seq(&self) -> u64 {
        self.next_send_seq
    }

    /// Frame, seal and upload one chunk under the next sequence number.
    ///
    /// The sequence number is consumed even if the upload fails.
    pub async fn push(&mut self, tunnel: &Tunnel, chunk: &[u8]) -> Result<BlobName> {
        self.next_send_seq += 1;
        let name = BlobName::new(self.session_id.clone(), self.next_send_seq, Direction::Request);

        let frame = RequestFrame::new(
            self.target.addr.clone(),
            self.target.port,
            Bytes::copy_from_slice(chunk),
        )
        .encode()?;
        let sealed = tunnel.codec.encrypt(&frame)?;

        tunnel
            .store
            .upload(&tunnel.requests_folder, &name.to_string(), sealed)
            .await
            .with_context(|| format!("uploading {name}"))?;

        Ok(name)
    }
}

/// Why a receive cycle stopped early. Listing failures are retried,
/// a dead local socket ends the session.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("listing responses: {0}")]
    List(#[from] StoreError),
    #[error("writing to SOCKS5 client: {0}")]
    Write(#[from] std::io::Error),
}

/// Inbound half of a session. Owns `last_recv_seq`.
pub struct Inbox {
    session_id: SessionId,
    prefix: String,
    last_recv_seq: u64,
}

impl Inbox {
    pub fn new(session_id: SessionId) -> Self {
        let prefix = format!("{session_id}_");
        Self {
            session_id,
            prefix,
            last_recv_seq: 0,
        }
    }

    pub fn last_recv_seq(&self) -> u64 {
        self.last_recv_seq
    }

    /// One full cycle: list the responses folder and deliver what is new.
    pub async fn poll_once<W>(&mut self, tunnel: &Tunnel, writer: &mut W) -> Result<usize, PollError>
    where
        W: AsyncWrite + Unpin,
    {
        let listed = tunnel.store.list(&tunnel.responses_folder).await?;
        self.deliver(tunnel, listed, writer).await
    }

    /// Write every deliverable response in `listed` to `writer`, in
    /// sequence order, and return how many were written.
    ///
    /// Blobs that cannot be parsed, downloaded or decrypted are deleted and
    /// skipped. Only a failing `writer` is an error.
    pub async fn deliver<W>(
        &mut self,
        tunnel: &Tunnel,
        listed: Vec<BlobMeta>,
        writer: &mut W,
    ) -> Result<usize, PollError>
    where
        W: AsyncWrite + Unpin,
    {
        let id = self.session_id.clone();
        let mut pending = Vec::new();

        for meta in listed {
            if !meta.name.starts_with(&self.prefix) || !Direction::Response.matches(&meta.name) {
                continue;
            }
            match meta.name.parse::<BlobName>() {
                Ok(name) => pending.push((name.seq, meta)),
                Err(e) => {
                    warn!("[{id}] Malformed response blob {}: {e}. Deleting.", meta.name);
                    discard(tunnel, &meta).await;
                }
            }
        }

        pending.sort_by_key(|(seq, _)| *seq);

        let mut delivered = 0;
        for (seq, meta) in pending {
            if seq <= self.last_recv_seq {
                warn!(
                    "[{id}] Response {seq} arrived after {} was delivered. Deleting.",
                    self.last_recv_seq
                );
                discard(tunnel, &meta).await;
                continue;
            }

            debug!("[{id}] Found response packet {seq} ({})", meta.name);

            let sealed = match tunnel.store.download(&meta.id).await {
                Ok(sealed) => sealed,
                Err(e) => {
                    error!("[{id}] Failed to download {}: {e}. Deleting.", meta.name);
                    discard(tunnel, &meta).await;
                    continue;
                }
            };

            let payload = match tunnel.codec.decrypt(&sealed) {
                Ok(payload) => payload,
                Err(e) => {
                    error!("[{id}] Failed to decrypt {}: {e}. Deleting.", meta.name);
                    discard(tunnel, &meta).await;
                    continue;
                }
            };

            writer.write_all(&payload).await?;
            writer.flush().await?;

            discard(tunnel, &meta).await;
            self.last_recv_seq = seq;
            delivered += 1;
        }

        Ok(delivered)
    }
}

/// Best-effort delete; a failure only leaves garbage behind.
async fn discard(tunnel: &Tunnel, meta: &BlobMeta) {
    if let Err(e) = tunnel.store.delete(&meta.id).await {
        warn!("Failed to delete {}: {e}", meta.name);
    }
}

/// Run one tunnel session until either loop stops.
///
/// The session is registered for its whole lifetime; the registry guard
/// deregisters it and cancels both loops when this returns. The socket
/// closes once both halves are dropped.
pub async fn run_session<S>(
    stream: S,
    peer: SocketAddr,
    target: Target,
    tunnel: Arc<Tunnel>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let session_id = SessionId::generate();
    let cancel = CancellationToken::new();
    let started = Instant::now();

    let _guard = tunnel.registry.create(
        session_id.clone(),
        SessionInfo {
            target: target.clone(),
            peer,
            started,
            cancel: cancel.clone(),
        },
    );

    info!("[{session_id}] Tunnel established for {target}");

    let (reader, writer) = tokio::io::split(stream);

    let send_handle = tokio::spawn(send_loop(
        tunnel.clone(),
        Outbox::new(session_id.clone(), target),
        reader,
        cancel.clone(),
    ));

    let receive_handle = tokio::spawn(receive_loop(
        tunnel.clone(),
        Inbox::new(session_id.clone()),
        writer,
        cancel.clone(),
    ));

    let (sent, received) = tokio::join!(send_handle, receive_handle);
    if let Err(e) = sent {
        error!("[{session_id}] Send task panicked: {e}");
    }
    if let Err(e) = received {
        error!("[{session_id}] Receive task panicked: {e}");
    }

    Ok(())
}

/// Local socket → request blobs.
async fn send_loop<R>(tunnel: Arc<Tunnel>, mut outbox: Outbox, mut reader: R, cancel: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let id = outbox.session_id.clone();
    let mut buf = vec![0u8; tunnel.chunk_size];
    let mut consecutive_errors: u32 = 0;
    let reason;

    loop {
        let n = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                reason = "cancellation requested";
                break;
            }

            result = reader.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        reason = "client EOF";
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        warn!("[{id}] Local read error: {e}");
                        reason = "client read error";
                        break;
                    }
                }
            }
        };

        match outbox.push(&tunnel, &buf[..n]).await {
            Ok(name) => {
                consecutive_errors = 0;
                debug!("[{id}] Uploaded {name} ({n} bytes)");
            }
            Err(e) => {
                consecutive_errors += 1;
                error!(
                    "[{id}] Upload failed ({consecutive_errors}/{MAX_CONSECUTIVE_ERRORS}): {e:#}"
                );
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    reason = "too many consecutive upload errors";
                    break;
                }
            }
        }
    }

    debug!(
        "[{id}] Send loop stopping after {} packets: {reason}",
        outbox.next_send_seq()
    );
    cancel.cancel();
}

/// Response blobs → local socket.
async fn receive_loop<W>(tunnel: Arc<Tunnel>, mut inbox: Inbox, mut writer: W, cancel: CancellationToken)
where
    W: AsyncWrite + Unpin,
{
    let id = inbox.session_id.clone();
    let mut consecutive_errors: u32 = 0;
    let reason;

    loop {
        if cancel.is_cancelled() {
            reason = "cancellation requested";
            break;
        }
        if tunnel.registry.lookup(&id).is_none() {
            reason = "session deregistered";
            break;
        }

        match inbox.poll_once(&tunnel, &mut writer).await {
            Ok(n) => {
                consecutive_errors = 0;
                if n > 0 {
                    debug!(
                        "[{id}] Delivered {n} responses, cursor at {}",
                        inbox.last_recv_seq()
                    );
                }
            }
            Err(PollError::Write(e)) => {
                warn!("[{id}] Local write error: {e}");
                reason = "client write error";
                break;
            }
            Err(PollError::List(e)) => {
                consecutive_errors += 1;
                error!(
                    "[{id}] Listing responses failed ({consecutive_errors}/{MAX_CONSECUTIVE_ERRORS}): {e}"
                );
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    reason = "too many consecutive listing errors";
                    break;
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(tunnel.poll_interval) => {}
            _ = cancel.cancelled() => {
                reason = "cancellation requested";
                break;
            }
        }
    }

    debug!("[{id}] Receive loop stopping: {reason}");
    let _ = writer.shutdown().await;
    cancel.cancel();
}
