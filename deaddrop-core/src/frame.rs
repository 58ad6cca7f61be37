//! Request frame: what the client seals into every request blob.
//!
//! ```text
//! offset 0    : 1 byte   addr_len (N)
//! offset 1    : 2 bytes  dest_port, big-endian
//! offset 3    : N bytes  dest_addr, UTF-8
//! offset 3+N  : payload
//! ```
//!
//! Responses carry no header; the decrypted blob is the payload.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

const HEADER_LEN: usize = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    Truncated(usize),
    #[error("destination address needs {expected} bytes, {actual} available")]
    AddrTruncated { expected: usize, actual: usize },
    #[error("destination address is not valid UTF-8")]
    AddrEncoding,
    #[error("destination address is {0} bytes, limit is 255")]
    AddrTooLong(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub dest_addr: String,
    pub dest_port: u16,
    pub payload: Bytes,
}

impl RequestFrame {
    pub fn new(dest_addr: impl Into<String>, dest_port: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            dest_addr: dest_addr.into(),
            dest_port,
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let addr = self.dest_addr.as_bytes();
        let addr_len =
            u8::try_from(addr.len()).map_err(|_| FrameError::AddrTooLong(addr.len()))?;

        let mut buf = BytesMut::with_capacity(HEADER_LEN + addr.len() + self.payload.len());
        buf.put_u8(addr_len);
        buf.put_u16(self.dest_port);
        buf.put_slice(addr);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < HEADER_LEN {
            return Err(FrameError::Truncated(data.len()));
        }

        let addr_len = data[0] as usize;
        let dest_port = u16::from_be_bytes([data[1], data[2]]);
        let rest = &data[HEADER_LEN..];
        if rest.len() < addr_len {
            return Err(FrameError::AddrTruncated {
                expected: addr_len,
                actual: rest.len(),
            });
        }

        let (addr, payload) = rest.split_at(addr_len);
        let dest_addr = std::str::from_utf8(addr)
            .map_err(|_| FrameError::AddrEncoding)?
            .to_string();

        Ok(Self {
            dest_addr,
            dest_port,
            payload: Bytes::copy_from_slice(payload),
        })
    }

    /// `host:port` suitable for `TcpStream::connect`, bracketing IPv6 literals.
    pub fn target(&self) -> String {
        if self.dest_addr.contains(':') {
            format!("[{}]:{}", self.dest_addr, self.dest_port)
        } else {
            format!("{}:{}", self.dest_addr, self.dest_port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let frame = RequestFrame::new("h", 80, &b"GET / HTTP/1.0\r\n\r\n"[..]);
        let bytes = frame.encode().unwrap();
        assert_eq!(&bytes[..4], &[0x01, 0x00, 0x50, b'h']);
        assert_eq!(&bytes[4..], b"GET / HTTP/1.0\r\n\r\n");
    }

    #[test]
    fn test_decode_example_com() {
        let mut raw = vec![11, 0x01, 0xbb];
        raw.extend_from_slice(b"example.com");
        raw.extend_from_slice(b"X");
        let frame = RequestFrame::decode(&raw).unwrap();
        assert_eq!(frame.dest_addr, "example.com");
        assert_eq!(frame.dest_port, 443);
        assert_eq!(&frame.payload[..], b"X");
        assert_eq!(frame.encode().unwrap(), Bytes::from(raw));
    }

    #[test]
    fn test_zero_length_addr_is_all_payload() {
        let frame = RequestFrame::decode(&[0, 0, 80, 1, 2, 3]).unwrap();
        assert_eq!(frame.dest_addr, "");
        assert_eq!(frame.dest_port, 80);
        assert_eq!(&frame.payload[..], &[1, 2, 3]);
    }

    #[test]
    fn test_empty_payload() {
        let frame = RequestFrame::decode(&[1, 0, 22, b'a']).unwrap();
        assert_eq!(frame.dest_addr, "a");
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(RequestFrame::decode(&[5, 0]), Err(FrameError::Truncated(2)));
        assert_eq!(
            RequestFrame::decode(&[5, 0, 80, b'a', b'b']),
            Err(FrameError::AddrTruncated {
                expected: 5,
                actual: 2
            })
        );
        assert_eq!(
            RequestFrame::decode(&[1, 0, 80, 0xff]),
            Err(FrameError::AddrEncoding)
        );
    }

    #[test]
    fn test_encode_rejects_long_addr() {
        let frame = RequestFrame::new("a".repeat(256), 80, Bytes::new());
        assert_eq!(frame.encode(), Err(FrameError::AddrTooLong(256)));
    }

    #[test]
    fn test_target_formatting() {
        assert_eq!(RequestFrame::new("example.com", 80, Bytes::new()).target(), "example.com:80");
        assert_eq!(RequestFrame::new("::1", 8080, Bytes::new()).target(), "[::1]:8080");
    }
}
