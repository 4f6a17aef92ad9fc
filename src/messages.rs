//! # Routing Messages
//!
//! Wire types for the control traffic that flows along a circuit. Every
//! routing message is a bencoded dictionary with its kind character under
//! key `"A"`:
//!
//! | Kind | `A` | Purpose |
//! |------|-----|---------|
//! | PathLatency | `L` | latency probe and its echo |
//! | PathConfirm | `P` | build confirmation from the terminal hop |
//! | PathTransfer | `T` | hand a sealed frame to another local path |
//! | DataDiscard | `D` | the addressed path does not exist here |
//! | DHT | `M` | carried DHT client/relay messages |
//!
//! Messages below [`MESSAGE_PAD_SIZE`] are padded with random bytes up to
//! exactly that size before encryption so that control-message lengths
//! are not observable in transit. Decoding parses one leading dictionary
//! and ignores the pad.
//!
//! The link-layer envelopes ([`RelayUpstreamMessage`],
//! [`RelayDownstreamMessage`]) are plain structs handed to the link
//! collaborator; their outer wire encoding belongs to the link layer.

use std::fmt;

use crate::bencode::{DecodeError, DictReader, DictWriter, Item};
use crate::crypto::{self, CryptoError, PathId, TunnelNonce};
use crate::dht::DhtMessage;
use crate::frame::{FrameError, ProtocolFrame};

/// Minimum encrypted size of a routing message on the wire.
pub const MESSAGE_PAD_SIZE: usize = 1024;

/// Decode failure for a routing message buffer.
#[derive(Debug)]
pub enum MessageError {
    Decode(DecodeError),
    Frame(FrameError),
    /// The `A` field held a kind this relay does not know.
    UnknownKind(u8),
    Crypto(CryptoError),
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageError::Decode(e) => write!(f, "routing message decode failed: {}", e),
            MessageError::Frame(e) => write!(f, "nested frame decode failed: {}", e),
            MessageError::UnknownKind(k) => {
                write!(f, "unknown routing message kind {:?}", *k as char)
            }
            MessageError::Crypto(e) => write!(f, "routing message crypto failure: {}", e),
        }
    }
}

impl std::error::Error for MessageError {}

impl From<DecodeError> for MessageError {
    fn from(e: DecodeError) -> Self {
        MessageError::Decode(e)
    }
}

impl From<FrameError> for MessageError {
    fn from(e: FrameError) -> Self {
        MessageError::Frame(e)
    }
}

impl From<CryptoError> for MessageError {
    fn from(e: CryptoError) -> Self {
        MessageError::Crypto(e)
    }
}

// ============================================================================
// Message bodies
// ============================================================================

/// Latency probe. A sender stamps `sent_at`; the far end echoes it back
/// in `latency`. Zero-valued fields are omitted on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PathLatencyMessage {
    pub latency: u64,
    pub seq: u64,
    pub sent_at: u64,
}

/// Build confirmation sent by the terminal hop of a fresh path.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PathConfirmMessage {
    /// Lifetime granted to the path, milliseconds.
    pub lifetime: u64,
    pub seq: u64,
}

/// Ask the receiving relay to forward a sealed frame down another local
/// path identified by `path_id`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathTransferMessage {
    pub path_id: PathId,
    pub frame: ProtocolFrame,
    pub nonce: TunnelNonce,
    pub seq: u64,
}

/// Negative acknowledgement: the addressed path does not exist at this
/// relay.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DataDiscardMessage {
    pub path_id: PathId,
    pub seq: u64,
}

/// One or more DHT messages relayed over the circuit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DhtRoutingMessage {
    pub messages: Vec<DhtMessage>,
    pub seq: u64,
}

/// Any routing message this subsystem produces or consumes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoutingMessage {
    PathLatency(PathLatencyMessage),
    PathConfirm(PathConfirmMessage),
    PathTransfer(PathTransferMessage),
    DataDiscard(DataDiscardMessage),
    Dht(DhtRoutingMessage),
}

impl RoutingMessage {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            RoutingMessage::PathLatency(m) => {
                let mut w = DictWriter::new();
                w.bytes("A", b"L");
                if m.latency != 0 {
                    w.int("L", m.latency);
                }
                w.int("S", m.seq);
                if m.sent_at != 0 {
                    w.int("T", m.sent_at);
                }
                w.finish()
            }
            RoutingMessage::PathConfirm(m) => {
                let mut w = DictWriter::new();
                w.bytes("A", b"P");
                w.int("L", m.lifetime);
                w.int("S", m.seq);
                w.finish()
            }
            RoutingMessage::PathTransfer(m) => {
                let frame = m.frame.encode();
                let mut w = DictWriter::new();
                w.bytes("A", b"T");
                w.bytes("P", m.path_id.as_bytes());
                w.int("S", m.seq);
                w.raw("T", &frame);
                w.bytes("Y", m.nonce.as_bytes());
                w.finish()
            }
            RoutingMessage::DataDiscard(m) => {
                let mut w = DictWriter::new();
                w.bytes("A", b"D");
                w.bytes("P", m.path_id.as_bytes());
                w.int("S", m.seq);
                w.finish()
            }
            RoutingMessage::Dht(m) => {
                let bodies: Vec<Vec<u8>> = m.messages.iter().map(DhtMessage::encode).collect();
                let mut w = DictWriter::new();
                w.bytes("A", b"M");
                w.list("M", bodies.iter().map(Vec::as_slice));
                w.int("S", m.seq);
                w.finish()
            }
        }
    }

    /// Parse one routing message from the front of a decrypted, possibly
    /// padded buffer.
    pub fn decode(buf: &[u8]) -> Result<Self, MessageError> {
        let (item, _pad) = Item::parse_prefix(buf)?;
        let r = DictReader::new(&item)?;
        let kind = r.req_bytes("A")?;
        if kind.len() != 1 {
            return Err(MessageError::Decode(DecodeError::WrongField("A")));
        }
        match kind[0] {
            b'L' => Ok(RoutingMessage::PathLatency(PathLatencyMessage {
                latency: r.opt_int("L")?,
                seq: r.opt_int("S")?,
                sent_at: r.opt_int("T")?,
            })),
            b'P' => Ok(RoutingMessage::PathConfirm(PathConfirmMessage {
                lifetime: r.opt_int("L")?,
                seq: r.opt_int("S")?,
            })),
            b'T' => Ok(RoutingMessage::PathTransfer(PathTransferMessage {
                path_id: PathId(r.req_array("P")?),
                seq: r.opt_int("S")?,
                frame: ProtocolFrame::decode(r.get("T").ok_or(DecodeError::WrongField("T"))?)?,
                nonce: TunnelNonce(r.req_array("Y")?),
            })),
            b'D' => Ok(RoutingMessage::DataDiscard(DataDiscardMessage {
                path_id: PathId(r.req_array("P")?),
                seq: r.opt_int("S")?,
            })),
            b'M' => {
                let mut messages = Vec::new();
                for entry in r.req_list("M")? {
                    messages.push(DhtMessage::decode(entry)?);
                }
                Ok(RoutingMessage::Dht(DhtRoutingMessage { messages, seq: r.opt_int("S")? }))
            }
            other => Err(MessageError::UnknownKind(other)),
        }
    }

    /// Encode and pad with random bytes up to [`MESSAGE_PAD_SIZE`], the
    /// form in which routing messages enter path encryption.
    pub fn encode_padded(&self) -> Result<Vec<u8>, CryptoError> {
        let mut buf = self.encode();
        if buf.len() < MESSAGE_PAD_SIZE {
            let start = buf.len();
            buf.resize(MESSAGE_PAD_SIZE, 0);
            crypto::randbytes(&mut buf[start..])?;
        }
        Ok(buf)
    }
}

// ============================================================================
// Link-layer envelopes
// ============================================================================

/// A frame moving toward the upstream end of a circuit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayUpstreamMessage {
    pub path_id: PathId,
    pub nonce: TunnelNonce,
    pub payload: Vec<u8>,
}

/// A frame moving toward the downstream end of a circuit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayDownstreamMessage {
    pub path_id: PathId,
    pub nonce: TunnelNonce,
    pub payload: Vec<u8>,
}

/// Everything this subsystem hands to the link layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkMessage {
    Upstream(RelayUpstreamMessage),
    Downstream(RelayDownstreamMessage),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::FindIntroMessage;
    use crate::introset::Tag;

    #[test]
    fn latency_roundtrip_with_omitted_zeros() {
        let msg = RoutingMessage::PathLatency(PathLatencyMessage {
            latency: 0,
            seq: 3,
            sent_at: 12345,
        });
        let encoded = msg.encode();
        // The zero latency field must be absent.
        assert!(!encoded.windows(3).any(|w| w == b"1:L"));
        assert_eq!(RoutingMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn discard_roundtrip() {
        let msg = RoutingMessage::DataDiscard(DataDiscardMessage {
            path_id: PathId::random().unwrap(),
            seq: 9,
        });
        assert_eq!(RoutingMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn dht_roundtrip() {
        let msg = RoutingMessage::Dht(DhtRoutingMessage {
            messages: vec![DhtMessage::FindIntro(FindIntroMessage {
                tag: Tag::new("demo"),
                address: Default::default(),
                recursion: 0,
                txid: 42,
            })],
            seq: 1,
        });
        assert_eq!(RoutingMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn small_messages_pad_to_exact_size() {
        let msg = RoutingMessage::PathConfirm(PathConfirmMessage { lifetime: 600_000, seq: 0 });
        let padded = msg.encode_padded().unwrap();
        assert_eq!(padded.len(), MESSAGE_PAD_SIZE);
        // Decode ignores the pad.
        assert_eq!(RoutingMessage::decode(&padded).unwrap(), msg);
    }

    #[test]
    fn unknown_kind_is_an_error() {
        let mut w = DictWriter::new();
        w.bytes("A", b"Q");
        let encoded = w.finish();
        assert!(matches!(
            RoutingMessage::decode(&encoded),
            Err(MessageError::UnknownKind(b'Q'))
        ));
    }
}
