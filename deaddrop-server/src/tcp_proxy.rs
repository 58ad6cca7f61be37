use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

pub struct TcpProxy;

impl TcpProxy {
    /// One request/response round trip on a fresh destination connection:
    /// write `payload`, read at most `max_response` bytes once, close.
    ///
    /// Nothing is kept between calls, so a destination that answers in
    /// several reads, or only after a second client write, is cut short.
    pub async fn exchange(target: &str, payload: &[u8], max_response: usize) -> Result<Vec<u8>> {
        let mut stream = TcpStream::connect(target)
            .await
            .with_context(|| format!("Failed to connect to {target}"))?;

        debug!("Connected to {target}");

        stream
            .write_all(payload)
            .await
            .with_context(|| format!("Failed to write to {target}"))?;
        stream.flush().await?;

        let mut buf = vec![0u8; max_response];
        let n = stream
            .read(&mut buf)
            .await
            .with_context(|| format!("Failed to read from {target}"))?;
        buf.truncate(n);

        if let Err(e) = stream.shutdown().await {
            debug!("Shutdown of {target} failed: {e}");
        }

        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_exchange_single_chunk() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            sock.write_all(b"pong").await.unwrap();
        });

        let reply = TcpProxy::exchange(&addr.to_string(), b"ping", 4096).await.unwrap();
        assert_eq!(reply, b"pong");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_exchange_caps_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&[7u8; 64]).await.unwrap();
        });

        let reply = TcpProxy::exchange(&addr.to_string(), b"x", 16).await.unwrap();
        assert!(!reply.is_empty() && reply.len() <= 16);
    }

    #[tokio::test]
    async fn test_exchange_silent_destination() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1];
            sock.read_exact(&mut buf).await.unwrap();
        });

        let reply = TcpProxy::exchange(&addr.to_string(), b"x", 16).await.unwrap();
        assert!(reply.is_empty());
    }

    #[tokio::test]
    async fn test_exchange_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(TcpProxy::exchange(&addr.to_string(), b"x", 16).await.is_err());
    }
}
