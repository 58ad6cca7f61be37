//! Blob names carry the frame identity: `<session_id>_<seq><suffix>`.
//!
//! The payload itself is sealed, so everything a consumer needs to route
//! and order a blob before downloading it lives in the name.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use uuid::Uuid;

const SEPARATOR: char = '_';

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NameError {
    #[error("blob name {0:?} has no known suffix")]
    Suffix(String),
    #[error("blob name {0:?} has no session/sequence separator")]
    Separator(String),
    #[error("session id {0:?} is empty or contains '_'")]
    SessionId(String),
    #[error("blob name {0:?} has an invalid sequence number")]
    Sequence(String),
}

/// Identifies every blob belonging to one SOCKS5 CONNECT tunnel.
///
/// Generated ids are 32 lowercase hex digits, so the first `_` in a blob
/// name always terminates the id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.contains(SEPARATOR) {
            return Err(NameError::SessionId(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

/// Which queue a blob travels through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Request,
    Response,
}

impl Direction {
    pub const fn suffix(self) -> &'static str {
        match self {
            Direction::Request => ".request.enc",
            Direction::Response => ".response.enc",
        }
    }

    /// Cheap pre-filter on a listed name, before full parsing.
    pub fn matches(self, name: &str) -> bool {
        name.ends_with(self.suffix())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobName {
    pub session_id: SessionId,
    pub seq: u64,
    pub direction: Direction,
}

impl BlobName {
    pub fn new(session_id: SessionId, seq: u64, direction: Direction) -> Self {
        Self {
            session_id,
            seq,
            direction,
        }
    }

    /// The name the relay answers a request with: same session, same seq.
    pub fn response_to(&self) -> Self {
        Self::new(self.session_id.clone(), self.seq, Direction::Response)
    }
}

impl fmt::Display for BlobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{SEPARATOR}{}{}",
            self.session_id,
            self.seq,
            self.direction.suffix()
        )
    }
}

impl FromStr for BlobName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (stem, direction) = if let Some(stem) = s.strip_suffix(Direction::Request.suffix()) {
            (stem, Direction::Request)
        } else if let Some(stem) = s.strip_suffix(Direction::Response.suffix()) {
            (stem, Direction::Response)
        } else {
            return Err(NameError::Suffix(s.to_string()));
        };

        let (session, seq) = stem
            .split_once(SEPARATOR)
            .ok_or_else(|| NameError::Separator(s.to_string()))?;
        let session_id = session.parse()?;

        // u64::from_str accepts a leading '+', which never appears in a name we write.
        if seq.is_empty() || !seq.bytes().all(|b| b.is_ascii_digit()) {
            return Err(NameError::Sequence(s.to_string()));
        }
        let seq = seq
            .parse()
            .map_err(|_| NameError::Sequence(s.to_string()))?;

        Ok(Self::new(session_id, seq, direction))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_session_id_is_hex() {
        let id = SessionId::generate();
        assert_eq!(id.as_str().len(), 32);
        assert!(id.as_str().bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(id, SessionId::generate());
    }

    #[test]
    fn test_request_name_format() {
        let id: SessionId = "abc123".parse().unwrap();
        let name = BlobName::new(id, 1, Direction::Request);
        assert_eq!(name.to_string(), "abc123_1.request.enc");
        assert_eq!(name.response_to().to_string(), "abc123_1.response.enc");
    }

    #[test]
    fn test_parse_response_name() {
        let name: BlobName = "deadbeef_42.response.enc".parse().unwrap();
        assert_eq!(name.session_id.as_str(), "deadbeef");
        assert_eq!(name.seq, 42);
        assert_eq!(name.direction, Direction::Response);
    }

    #[test]
    fn test_parse_accepts_leading_zeros() {
        let name: BlobName = "s_007.request.enc".parse().unwrap();
        assert_eq!(name.seq, 7);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            "s_1.txt".parse::<BlobName>(),
            Err(NameError::Suffix(_))
        ));
        assert!(matches!(
            "s1.request.enc".parse::<BlobName>(),
            Err(NameError::Separator(_))
        ));
        assert!(matches!(
            "_1.request.enc".parse::<BlobName>(),
            Err(NameError::SessionId(_))
        ));
        assert!(matches!(
            "s_x.response.enc".parse::<BlobName>(),
            Err(NameError::Sequence(_))
        ));
        assert!(matches!(
            "s_1_2.response.enc".parse::<BlobName>(),
            Err(NameError::Sequence(_))
        ));
        assert!(matches!(
            "s_+3.response.enc".parse::<BlobName>(),
            Err(NameError::Sequence(_))
        ));
        assert!(matches!(
            "s_.response.enc".parse::<BlobName>(),
            Err(NameError::Sequence(_))
        ));
    }

    #[test]
    fn test_session_id_rejects_separator() {
        assert!("a_b".parse::<SessionId>().is_err());
        assert!("".parse::<SessionId>().is_err());
    }

    #[test]
    fn test_direction_matches() {
        assert!(Direction::Request.matches("x_1.request.enc"));
        assert!(!Direction::Request.matches("x_1.response.enc"));
        assert!(Direction::Response.matches("garbage.response.enc"));
    }
}
