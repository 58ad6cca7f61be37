use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::session::{self, Tunnel};

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// Pause after an accept error that is not about a single connection
/// (out of file descriptors, out of memory).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Destination requested by a SOCKS5 CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub addr: String,
    pub port: u16,
}

impl Target {
    pub fn new(addr: impl Into<String>, port: u16) -> Self {
        Self {
            addr: addr.into(),
            port,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.addr.contains(':') {
            write!(f, "[{}]:{}", self.addr, self.port)
        } else {
            write!(f, "{}:{}", self.addr, self.port)
        }
    }
}

/// Accept SOCKS5 clients forever, one task per connection.
pub async fn serve(listener: TcpListener, tunnel: Arc<Tunnel>) -> Result<()> {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                let pause = accept_retry_delay(&e);
                error!("Accept failed, retrying in {pause:?}: {e}");
                tokio::time::sleep(pause).await;
                continue;
            }
        };
        info!("New connection from {addr}");

        let tunnel = tunnel.clone();
        tokio::spawn(async move {
            match handle_client(stream, addr, tunnel).await {
                Ok(()) => info!("Connection from {addr} closed"),
                Err(e) if is_disconnect(&e) => {
                    warn!("Client {addr} disconnected during handshake: {e:#}")
                }
                Err(e) => error!("Connection from {addr} failed: {e:#}"),
            }
        });
    }
}

/// Errors tied to one pending connection are retried at once; anything
/// else backs off so a persistent failure cannot spin the loop.
fn accept_retry_delay(err: &io::Error) -> Duration {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted => Duration::ZERO,
        _ => ACCEPT_BACKOFF,
    }
}

/// Handle a single SOCKS5 client connection end-to-end.
pub async fn handle_client<S>(mut stream: S, peer: SocketAddr, tunnel: Arc<Tunnel>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // ── Phase 1: Authentication negotiation ──────────────────────────
    negotiate_auth(&mut stream).await?;

    // ── Phase 2: Read the CONNECT request ────────────────────────────
    let target = read_connect_request(&mut stream).await?;

    info!("SOCKS5 CONNECT → {target} from {peer}");

    // ── Phase 3: Grant it; nothing is dialled until the relay sees data
    send_reply(&mut stream, REP_SUCCESS).await?;

    // ── Phase 4: Hand the socket to the session engine ───────────────
    session::run_session(stream, peer, target, tunnel).await
}

/// The peer went away mid-handshake; not a proxy fault.
fn is_disconnect(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.downcast_ref::<io::Error>().is_some_and(|e| {
            matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            )
        })
    })
}

/// SOCKS5 auth negotiation: we only support "no authentication".
async fn negotiate_auth<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ver = stream.read_u8().await.context("reading version")?;
    if ver != SOCKS5_VERSION {
        bail!("Unsupported SOCKS version: {ver}");
    }

    let nmethods = stream.read_u8().await.context("reading nmethods")? as usize;
    let mut methods = vec![0u8; nmethods];
    stream
        .read_exact(&mut methods)
        .await
        .context("reading methods")?;

    if !methods.contains(&AUTH_NONE) {
        stream
            .write_all(&[SOCKS5_VERSION, AUTH_NO_ACCEPTABLE])
            .await?;
        stream.flush().await?;
        bail!("Client does not support 'no auth'");
    }

    stream.write_all(&[SOCKS5_VERSION, AUTH_NONE]).await?;
    stream.flush().await?;
    Ok(())
}

/// Read the SOCKS5 CONNECT request and return its destination.
async fn read_connect_request<S>(stream: &mut S) -> Result<Target>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 4];
    stream
        .read_exact(&mut header)
        .await
        .context("reading request header")?;
    let [ver, cmd, _rsv, atyp] = header;

    if ver != SOCKS5_VERSION {
        bail!("Unexpected version in request: {ver}");
    }

    if cmd != CMD_CONNECT {
        send_reply(stream, REP_CMD_NOT_SUPPORTED).await?;
        bail!("Unsupported command: {cmd} (only CONNECT is supported)");
    }

    let addr = match atyp {
        ATYP_IPV4 => {
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.context("reading IPv4")?;
            Ipv4Addr::from(buf).to_string()
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await.context("reading domain length")? as usize;
            let mut buf = vec![0u8; len];
            stream.read_exact(&mut buf).await.context("reading domain")?;
            match String::from_utf8(buf) {
                Ok(domain) => domain,
                Err(_) => {
                    send_reply(stream, REP_GENERAL_FAILURE).await?;
                    bail!("Domain is not valid UTF-8");
                }
            }
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 16];
            stream.read_exact(&mut buf).await.context("reading IPv6")?;
            Ipv6Addr::from(buf).to_string()
        }
        _ => {
            send_reply(stream, REP_ATYP_NOT_SUPPORTED).await?;
            bail!("Unsupported address type: {atyp}");
        }
    };

    let port = stream.read_u16().await.context("reading port")?;

    Ok(Target::new(addr, port))
}

/// Send a SOCKS5 reply. BND.ADDR is always 0.0.0.0:0; no socket is bound
/// on this side of the tunnel.
async fn send_reply<S>(stream: &mut S, reply: u8) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let response = [SOCKS5_VERSION, reply, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
    stream.write_all(&response).await?;
    stream.flush().await?;
    Ok(())
}
