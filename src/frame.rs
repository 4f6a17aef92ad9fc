//! # Protocol Frames
//!
//! The end-to-end sealed envelope exchanged between hidden-service
//! endpoints, and the hybrid key exchange that bootstraps a conversation.
//!
//! A [`ProtocolFrame`] carries a KEM ciphertext `C` (handshake frames
//! only), a nonce `N`, a sequence number `S`, a conversation tag `T`, a
//! signature `Z`, and the sealed [`ProtocolMessage`] bytes `D`.
//!
//! ## Hybrid exchange
//!
//! The initiator encapsulates to the recipient's Kyber key (`K1`), runs a
//! nonced X25519 exchange against the recipient's encryption key (`K2`),
//! and both sides derive `session = H(K1 || K2)`. The first frame's body
//! is sealed under `K1` alone so the recipient can open it from `C`
//! before any session state exists; every later frame in the conversation
//! is sealed under the session key.

use std::fmt;

use crate::bencode::{DecodeError, DictReader, DictWriter, Item};
use crate::crypto::{
    self, CryptoError, PqPublicKey, SharedSecret, TunnelNonce, SIGNATURE_LEN,
};
use crate::identity::{SecretIdentity, ServiceInfo};
use crate::introset::{ConvoTag, Introduction};

/// Protocol version stamped into frames and messages.
pub const PROTOCOL_VERSION: u64 = 0;

/// Hard cap on a sealed message body; anything larger is dropped before
/// decryption is attempted.
pub const MAX_PROTOCOL_MESSAGE_SIZE: usize = 32 * 1024;

/// What a conversation payload is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolType {
    /// Control traffic between the endpoints themselves.
    Control,
    /// User traffic.
    Traffic,
}

impl ProtocolType {
    pub fn to_wire(self) -> u64 {
        match self {
            ProtocolType::Control => 0,
            ProtocolType::Traffic => 1,
        }
    }

    pub fn from_wire(value: u64) -> Option<Self> {
        match value {
            0 => Some(ProtocolType::Control),
            1 => Some(ProtocolType::Traffic),
            _ => None,
        }
    }
}

/// Frame processing failure. Failures are logged and the frame dropped;
/// nothing propagates to the peer.
#[derive(Debug)]
pub enum FrameError {
    /// The frame or its sealed body did not decode.
    Decode(DecodeError),
    /// The frame signature did not verify under the declared sender.
    BadSignature,
    /// The sealed body is larger than [`MAX_PROTOCOL_MESSAGE_SIZE`].
    Oversize(usize),
    /// KEM or RNG failure.
    Crypto(CryptoError),
    /// The declared protocol type is unknown.
    UnknownProtocol(u64),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Decode(e) => write!(f, "frame decode failed: {}", e),
            FrameError::BadSignature => write!(f, "frame signature invalid"),
            FrameError::Oversize(n) => write!(f, "sealed body of {} bytes exceeds limit", n),
            FrameError::Crypto(e) => write!(f, "frame crypto failure: {}", e),
            FrameError::UnknownProtocol(v) => write!(f, "unknown protocol type {}", v),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<DecodeError> for FrameError {
    fn from(e: DecodeError) -> Self {
        FrameError::Decode(e)
    }
}

impl From<CryptoError> for FrameError {
    fn from(e: CryptoError) -> Self {
        FrameError::Crypto(e)
    }
}

// ============================================================================
// ProtocolMessage
// ============================================================================

/// Plaintext of a sealed frame body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProtocolMessage {
    pub proto: ProtocolType,
    pub tag: ConvoTag,
    pub sender: ServiceInfo,
    /// The introduction the receiver should use when replying.
    pub intro_reply: Introduction,
    pub version: u64,
    pub payload: Vec<u8>,
}

impl ProtocolMessage {
    pub fn encode(&self) -> Vec<u8> {
        let sender = self.sender.encode();
        let intro = self.intro_reply.encode();
        let mut w = DictWriter::new();
        w.int("a", self.proto.to_wire());
        w.bytes("d", &self.payload);
        w.raw("i", &intro);
        w.raw("s", &sender);
        w.bytes("t", self.tag.as_bytes());
        w.int("v", self.version);
        w.finish()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let item = Item::parse(bytes)?;
        let r = DictReader::new(&item)?;
        let proto_wire = r.opt_int("a")?;
        let proto =
            ProtocolType::from_wire(proto_wire).ok_or(FrameError::UnknownProtocol(proto_wire))?;
        Ok(Self {
            proto,
            payload: r.req_bytes("d")?.to_vec(),
            intro_reply: Introduction::decode(r.get("i").ok_or(DecodeError::WrongField("i"))?)?,
            sender: ServiceInfo::decode(r.get("s").ok_or(DecodeError::WrongField("s"))?)?,
            tag: ConvoTag(r.req_array("t")?),
            version: r.opt_int("v")?,
        })
    }
}

// ============================================================================
// ProtocolFrame
// ============================================================================

/// The sealed envelope transmitted inside a path-transfer.
#[derive(Clone, PartialEq, Eq)]
pub struct ProtocolFrame {
    /// KEM ciphertext; empty on established-session frames.
    pub ciphertext: Vec<u8>,
    pub nonce: TunnelNonce,
    pub seq: u64,
    pub tag: ConvoTag,
    pub version: u64,
    pub signature: [u8; SIGNATURE_LEN],
    /// Sealed [`ProtocolMessage`] bytes.
    pub sealed: Vec<u8>,
}

impl ProtocolFrame {
    fn encode_inner(&self, signature: Option<&[u8; SIGNATURE_LEN]>) -> Vec<u8> {
        let mut w = DictWriter::new();
        w.bytes("A", b"H");
        if !self.ciphertext.is_empty() {
            w.bytes("C", &self.ciphertext);
        }
        w.bytes("D", &self.sealed);
        w.bytes("N", self.nonce.as_bytes());
        w.int("S", self.seq);
        w.bytes("T", self.tag.as_bytes());
        w.int("V", self.version);
        if let Some(sig) = signature {
            w.bytes("Z", sig);
        }
        w.finish()
    }

    /// Bytes covered by the frame signature.
    pub fn encode_unsigned(&self) -> Vec<u8> {
        self.encode_inner(None)
    }

    pub fn encode(&self) -> Vec<u8> {
        self.encode_inner(Some(&self.signature))
    }

    pub fn decode(item: &Item) -> Result<Self, FrameError> {
        let r = DictReader::new(item)?;
        let ciphertext = match r.get("C") {
            Some(c) => c.as_bytes().ok_or(DecodeError::WrongField("C"))?.to_vec(),
            None => Vec::new(),
        };
        let sealed = r.req_bytes("D")?.to_vec();
        if sealed.len() > MAX_PROTOCOL_MESSAGE_SIZE {
            return Err(FrameError::Oversize(sealed.len()));
        }
        Ok(Self {
            ciphertext,
            sealed,
            nonce: TunnelNonce(r.req_array("N")?),
            seq: r.opt_int("S")?,
            tag: ConvoTag(r.req_array("T")?),
            version: r.opt_int("V")?,
            signature: r.req_array("Z")?,
        })
    }

    /// True when this frame opens a conversation (carries a KEM ciphertext).
    pub fn is_handshake(&self) -> bool {
        !self.ciphertext.is_empty()
    }

    /// Sign the frame with the local identity.
    pub fn sign(&mut self, identity: &SecretIdentity) {
        self.signature = identity.sign(crypto::FRAME_SIGNATURE_DOMAIN, &self.encode_unsigned());
    }

    /// Verify the frame signature under the claimed sender.
    pub fn verify(&self, sender: &ServiceInfo) -> bool {
        crypto::verify(
            sender.sign_pk(),
            crypto::FRAME_SIGNATURE_DOMAIN,
            &self.encode_unsigned(),
            &self.signature,
        )
    }

    /// Decrypt the sealed body under `key` and parse it.
    pub fn open(&self, key: &SharedSecret) -> Result<ProtocolMessage, FrameError> {
        if self.sealed.len() > MAX_PROTOCOL_MESSAGE_SIZE {
            return Err(FrameError::Oversize(self.sealed.len()));
        }
        let mut body = self.sealed.clone();
        crypto::xchacha20(&mut body, key, &self.nonce);
        ProtocolMessage::decode(&body)
    }
}

impl fmt::Debug for ProtocolFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolFrame")
            .field("tag", &self.tag)
            .field("seq", &self.seq)
            .field("handshake", &self.is_handshake())
            .field("sealed_len", &self.sealed.len())
            .finish()
    }
}

// ============================================================================
// Hybrid key exchange
// ============================================================================

/// Product of the initiator-side exchange, ready to transmit and cache.
pub struct HandshakeOutcome {
    pub frame: ProtocolFrame,
    pub tag: ConvoTag,
    pub session_key: SharedSecret,
}

/// Run the initiator half of the hybrid exchange and seal the first
/// message of the conversation.
pub fn initiate_conversation(
    local: &SecretIdentity,
    remote: &ServiceInfo,
    remote_pq: &PqPublicKey,
    intro_reply: Introduction,
    payload: Vec<u8>,
    proto: ProtocolType,
) -> Result<HandshakeOutcome, FrameError> {
    // K1: post-quantum half, recoverable by the peer from C alone.
    let (ciphertext, pq_half) = crypto::pqe_encapsulate(remote_pq)?;
    let nonce = TunnelNonce::random()?;
    // K2: classical half bound to this nonce.
    let dh_half = local.key_exchange(remote, &nonce);
    let session_key = crypto::session_key(&pq_half, &dh_half);

    let tag = ConvoTag::random()?;
    let message = ProtocolMessage {
        proto,
        tag,
        sender: local.public().clone(),
        intro_reply,
        version: PROTOCOL_VERSION,
        payload,
    };

    // The first body is sealed under K1, not the session key: the
    // responder can recover K1 from C before any session exists.
    let mut sealed = message.encode();
    crypto::xchacha20(&mut sealed, &pq_half, &nonce);

    let mut frame = ProtocolFrame {
        ciphertext,
        nonce,
        seq: 0,
        tag,
        version: PROTOCOL_VERSION,
        signature: [0u8; SIGNATURE_LEN],
        sealed,
    };
    frame.sign(local);

    Ok(HandshakeOutcome { frame, tag, session_key })
}

/// Product of the responder-side exchange.
pub struct InboundConversation {
    pub message: ProtocolMessage,
    pub session_key: SharedSecret,
}

/// Run the responder half: recover `K1`, open and authenticate the first
/// message, derive the same session key.
pub fn accept_conversation(
    local: &SecretIdentity,
    frame: &ProtocolFrame,
) -> Result<InboundConversation, FrameError> {
    let pq_half = local.pq().decapsulate(&frame.ciphertext)?;
    let message = frame.open(&pq_half)?;
    if !frame.verify(&message.sender) {
        return Err(FrameError::BadSignature);
    }
    let dh_half = local.key_exchange(&message.sender, &frame.nonce);
    let session_key = crypto::session_key(&pq_half, &dh_half);
    Ok(InboundConversation { message, session_key })
}

/// Seal a message on an established conversation under the cached
/// session key.
pub fn seal_on_session(
    local: &SecretIdentity,
    message: &ProtocolMessage,
    session_key: &SharedSecret,
    seq: u64,
) -> Result<ProtocolFrame, FrameError> {
    let nonce = TunnelNonce::random()?;
    let mut sealed = message.encode();
    crypto::xchacha20(&mut sealed, session_key, &nonce);
    let mut frame = ProtocolFrame {
        ciphertext: Vec::new(),
        nonce,
        seq,
        tag: message.tag,
        version: PROTOCOL_VERSION,
        signature: [0u8; SIGNATURE_LEN],
        sealed,
    };
    frame.sign(local);
    Ok(frame)
}

/// Open an established-session frame: authenticate under the cached
/// sender, then decrypt under the cached session key.
pub fn open_on_session(
    frame: &ProtocolFrame,
    sender: &ServiceInfo,
    session_key: &SharedSecret,
) -> Result<ProtocolMessage, FrameError> {
    if !frame.verify(sender) {
        return Err(FrameError::BadSignature);
    }
    frame.open(session_key)
}
