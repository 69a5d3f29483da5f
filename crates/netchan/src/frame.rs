// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire format helpers.
//!
//! TCP is a stream protocol without message boundaries, so both the
//! handshake and the sized-buffer user operations use length-prefix
//! framing:
//!
//! ```text
//! +----------------+-------------------+
//! | Length (4B LE) | Payload           |
//! +----------------+-------------------+
//! ```
//!
//! The length field is a 32-bit little-endian integer giving the payload
//! size, excluding the 4-byte header itself.
//!
//! The handshake additionally defines the server greeting (a single `'q'`
//! byte sent on accept) and the identity string a client sends back:
//!
//! ```text
//! sessionName ` sessionID ` localName ` remoteName
//! ```
//!
//! Back-tick (0x60) is the field separator; channel and session names must
//! not contain it (enforced at channel creation).

use crate::error::ChannelError;

/// Frame header size (4 bytes for the length).
pub const HEADER_SIZE: usize = 4;

/// Server greeting byte sent on accept, before the identity exchange.
pub const GREETING: u8 = b'q';

/// Field separator in the identity string.
pub const SEPARATOR: char = '`';

/// Upper bound on the identity string; session and channel names are short.
pub const MAX_IDENTITY_LEN: usize = 1024;

/// Frame a payload with its length prefix.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Decode a frame header into the payload length.
pub fn decode_len(header: &[u8]) -> usize {
    debug_assert!(header.len() >= HEADER_SIZE);
    u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize
}

/// Peer identity announced in the client handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    /// Session name shared by both peers.
    pub session_name: String,

    /// Session instance id chosen by the client.
    pub session_id: u64,

    /// The client's channel name.
    pub local_name: String,

    /// The name the client expects on the server side.
    pub remote_name: String,
}

impl Identity {
    /// Render the identity as the back-tick separated wire string.
    pub fn to_wire(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}{sep}{}",
            self.session_name,
            self.session_id,
            self.local_name,
            self.remote_name,
            sep = SEPARATOR
        )
    }

    /// Parse an identity string received from a client.
    pub fn parse(raw: &str) -> Result<Identity, ChannelError> {
        let mut parts = raw.split(SEPARATOR);

        let session_name = parts.next().unwrap_or("");
        let id_text = parts.next();
        let local_name = parts.next();
        let remote_name = parts.next();

        if parts.next().is_some() {
            return Err(ChannelError::HandshakeRejected(format!(
                "too many fields in identity {:?}",
                raw
            )));
        }

        let (id_text, local_name, remote_name) = match (id_text, local_name, remote_name) {
            (Some(i), Some(l), Some(r)) => (i, l, r),
            _ => {
                return Err(ChannelError::HandshakeRejected(format!(
                    "missing fields in identity {:?}",
                    raw
                )))
            }
        };

        let session_id: u64 = id_text.parse().map_err(|_| {
            ChannelError::HandshakeRejected(format!("bad session id {:?}", id_text))
        })?;

        if session_name.is_empty() || local_name.is_empty() || remote_name.is_empty() {
            return Err(ChannelError::HandshakeRejected(format!(
                "empty name in identity {:?}",
                raw
            )));
        }

        Ok(Identity {
            session_name: session_name.to_string(),
            session_id,
            local_name: local_name.to_string(),
            remote_name: remote_name.to_string(),
        })
    }
}

/// Check that a session or channel name is usable on the wire.
pub fn valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(SEPARATOR)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let frame = encode(b"abc");
        assert_eq!(frame.len(), HEADER_SIZE + 3);
        // Little-endian length
        assert_eq!(&frame[..4], &[3, 0, 0, 0]);
        assert_eq!(&frame[4..], b"abc");
    }

    #[test]
    fn test_encode_empty() {
        let frame = encode(b"");
        assert_eq!(frame, vec![0, 0, 0, 0]);
        assert_eq!(decode_len(&frame), 0);
    }

    #[test]
    fn test_decode_len_round_trip() {
        let frame = encode(&[0u8; 300]);
        assert_eq!(decode_len(&frame), 300);
    }

    #[test]
    fn test_identity_wire_format() {
        let id = Identity {
            session_name: "sess".into(),
            session_id: 42,
            local_name: "A".into(),
            remote_name: "B".into(),
        };
        assert_eq!(id.to_wire(), "sess`42`A`B");
    }

    #[test]
    fn test_identity_round_trip() {
        let id = Identity {
            session_name: "trading".into(),
            session_id: u64::MAX,
            local_name: "orders".into(),
            remote_name: "fills".into(),
        };
        let parsed = Identity::parse(&id.to_wire()).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_identity_parse_rejects_malformed() {
        assert!(Identity::parse("").is_err());
        assert!(Identity::parse("sess`1`A").is_err()); // missing remote
        assert!(Identity::parse("sess`1`A`B`extra").is_err());
        assert!(Identity::parse("sess`notanumber`A`B").is_err());
        assert!(Identity::parse("`1`A`B").is_err()); // empty session name
        assert!(Identity::parse("sess`1``B").is_err()); // empty local name
    }

    #[test]
    fn test_valid_name() {
        assert!(valid_name("alpha"));
        assert!(!valid_name(""));
        assert!(!valid_name("has`tick"));
    }
}
