//! # Introductions and IntroSets
//!
//! Reachability records for hidden services:
//!
//! - [`Introduction`]: one (router, pathID, expiry) hint telling a remote
//!   peer where a service can be reached. Two introductions are the same
//!   introduction when router and pathID match.
//! - [`IntroSet`]: the signed, publishable bundle of a service's current
//!   introductions plus its public keys. Immutable once signed;
//!   republishing builds a new one.
//! - [`ConvoTag`] / [`Tag`]: conversation and topic identifiers.

use std::fmt;

use crate::bencode::{DecodeError, DictReader, DictWriter, Item};
use crate::crypto::{
    self, PathId, PqPublicKey, RouterId, SIGNATURE_LEN,
};
use crate::identity::ServiceInfo;

/// Window before hard expiry in which an introduction is treated as
/// already stale, triggering rotation ahead of the deadline.
pub const INTRO_STALE_WINDOW: u64 = 5_000;

// ============================================================================
// Tags
// ============================================================================

/// Random 16-byte identifier chosen by the initiator of a conversation.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ConvoTag(pub [u8; 16]);

impl ConvoTag {
    pub fn random() -> Result<Self, crypto::CryptoError> {
        let mut bytes = [0u8; 16];
        crypto::randbytes(&mut bytes)?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Debug for ConvoTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConvoTag({})", hex::encode(&self.0[..8]))
    }
}

/// A topic tag: 16 bytes, zero-padded UTF-8. The zero tag means "none".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Tag(pub [u8; 16]);

impl Tag {
    /// Build from a string, truncating to 16 bytes.
    pub fn new(name: &str) -> Self {
        let mut bytes = [0u8; 16];
        let take = name.len().min(16);
        bytes[..take].copy_from_slice(&name.as_bytes()[..take]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self.0.iter().position(|b| *b == 0).unwrap_or(16);
        match std::str::from_utf8(&self.0[..end]) {
            Ok(text) => write!(f, "Tag({})", text),
            Err(_) => write!(f, "Tag({})", hex::encode(self.0)),
        }
    }
}

// ============================================================================
// Introduction
// ============================================================================

/// A reachability hint: contact this service at `path_id` on `router`
/// until `expires_at`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Introduction {
    pub router: RouterId,
    pub path_id: PathId,
    /// Measured latency of the underlying path, milliseconds.
    pub latency: u64,
    /// Hard expiry, milliseconds since epoch.
    pub expires_at: u64,
    pub version: u64,
}

impl Introduction {
    /// Hard expiry test.
    pub fn expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// True when the introduction expires within [`INTRO_STALE_WINDOW`].
    pub fn expires_soon(&self, now: u64) -> bool {
        now + INTRO_STALE_WINDOW >= self.expires_at
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = DictWriter::new();
        w.bytes("k", self.router.as_bytes());
        w.int("l", self.latency);
        w.bytes("p", self.path_id.as_bytes());
        w.int("v", self.version);
        w.int("x", self.expires_at);
        w.finish()
    }

    pub fn decode(item: &Item) -> Result<Self, DecodeError> {
        let r = DictReader::new(item)?;
        Ok(Self {
            router: RouterId(r.req_array("k")?),
            latency: r.opt_int("l")?,
            path_id: PathId(r.req_array("p")?),
            version: r.opt_int("v")?,
            expires_at: r.opt_int("x")?,
        })
    }
}

/// Identity of an introduction is its (router, pathID) pair; latency and
/// expiry are samples about it, not part of it.
impl PartialEq for Introduction {
    fn eq(&self, other: &Self) -> bool {
        self.router == other.router && self.path_id == other.path_id
    }
}

impl Eq for Introduction {}

impl PartialOrd for Introduction {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Introduction {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.router, self.path_id).cmp(&(other.router, other.path_id))
    }
}

impl std::hash::Hash for Introduction {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.router.hash(state);
        self.path_id.hash(state);
    }
}

impl fmt::Display for Introduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}",
            hex::encode(&self.path_id.0[..4]),
            hex::encode(&self.router.0[..8])
        )
    }
}

// ============================================================================
// IntroSet
// ============================================================================

/// The signed, publishable record for one hidden service.
#[derive(Clone, PartialEq, Eq)]
pub struct IntroSet {
    /// Public identity (`A` on the wire).
    pub service: ServiceInfo,
    /// Currently advertised introductions (`I`).
    pub intros: Vec<Introduction>,
    /// KEM public key peers encapsulate to (`K`).
    pub pq_key: PqPublicKey,
    /// Optional topic tag (`n`); zero when untagged.
    pub topic: Tag,
    /// Record version (`v`).
    pub version: u64,
    /// Signature over the remainder (`z`).
    pub signature: [u8; SIGNATURE_LEN],
}

impl IntroSet {
    pub fn new(service: ServiceInfo, pq_key: PqPublicKey) -> Self {
        Self {
            service,
            intros: Vec::new(),
            pq_key,
            topic: Tag::default(),
            version: 0,
            signature: [0u8; SIGNATURE_LEN],
        }
    }

    /// Serialize every field except the signature; the byte string that
    /// gets signed and verified.
    pub fn encode_unsigned(&self) -> Vec<u8> {
        self.encode_inner(None)
    }

    pub fn encode(&self) -> Vec<u8> {
        self.encode_inner(Some(&self.signature))
    }

    fn encode_inner(&self, signature: Option<&[u8; SIGNATURE_LEN]>) -> Vec<u8> {
        let service = self.service.encode();
        let intros: Vec<Vec<u8>> = self.intros.iter().map(Introduction::encode).collect();
        let mut w = DictWriter::new();
        w.raw("a", &service);
        w.list("i", intros.iter().map(Vec::as_slice));
        w.bytes("k", self.pq_key.as_bytes());
        if !self.topic.is_zero() {
            w.bytes("n", self.topic.as_bytes());
        }
        w.int("v", self.version);
        if let Some(sig) = signature {
            w.bytes("z", sig);
        }
        w.finish()
    }

    pub fn decode(item: &Item) -> Result<Self, DecodeError> {
        let r = DictReader::new(item)?;
        let service = ServiceInfo::decode(r.get("a").ok_or(DecodeError::WrongField("a"))?)?;
        let mut intros = Vec::new();
        for entry in r.req_list("i")? {
            intros.push(Introduction::decode(entry)?);
        }
        let pq_key = PqPublicKey::from_bytes(r.req_bytes("k")?)
            .map_err(|_| DecodeError::WrongField("k"))?;
        Ok(Self {
            service,
            intros,
            pq_key,
            topic: Tag(r.opt_array("n")?),
            version: r.opt_int("v")?,
            signature: r.req_array("z")?,
        })
    }

    /// Check the attached signature under the declared service identity.
    pub fn verify(&self) -> bool {
        crypto::verify(
            self.service.sign_pk(),
            crypto::INTROSET_SIGNATURE_DOMAIN,
            &self.encode_unsigned(),
            &self.signature,
        )
    }

    /// True when any advertised introduction has hard-expired.
    pub fn has_expired_intros(&self, now: u64) -> bool {
        self.intros.iter().any(|intro| intro.expired(now))
    }
}

impl fmt::Debug for IntroSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntroSet")
            .field("service", &self.service)
            .field("intros", &self.intros.len())
            .field("topic", &self.topic)
            .field("version", &self.version)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::SecretIdentity;

    fn signed_introset(intros: Vec<Introduction>) -> (SecretIdentity, IntroSet) {
        let identity = SecretIdentity::regenerate().unwrap();
        let mut introset =
            IntroSet::new(identity.public().clone(), identity.pq_public().clone());
        introset.intros = intros;
        identity.sign_introset(&mut introset);
        (identity, introset)
    }

    fn intro(expires_at: u64) -> Introduction {
        Introduction {
            router: RouterId::random().unwrap(),
            path_id: PathId::random().unwrap(),
            latency: 30,
            expires_at,
            version: 0,
        }
    }

    #[test]
    fn signed_introset_verifies() {
        let (_, introset) = signed_introset(vec![intro(60_000)]);
        assert!(introset.verify());
    }

    #[test]
    fn any_field_mutation_breaks_signature() {
        let (_, base) = signed_introset(vec![intro(60_000), intro(90_000)]);

        let mut tampered = base.clone();
        tampered.intros.pop();
        assert!(!tampered.verify());

        let mut tampered = base.clone();
        tampered.intros[0].expires_at += 1;
        assert!(!tampered.verify());

        let mut tampered = base.clone();
        tampered.topic = Tag::new("sneaky");
        assert!(!tampered.verify());

        let mut tampered = base.clone();
        tampered.version += 1;
        assert!(!tampered.verify());

        let other = SecretIdentity::regenerate().unwrap();
        let mut tampered = base.clone();
        tampered.pq_key = other.pq_public().clone();
        assert!(!tampered.verify());
    }

    #[test]
    fn introset_wire_roundtrip() {
        let (_, introset) = signed_introset(vec![intro(60_000)]);
        let encoded = introset.encode();
        let decoded = IntroSet::decode(&Item::parse(&encoded).unwrap()).unwrap();
        assert_eq!(introset, decoded);
        assert!(decoded.verify());
    }

    #[test]
    fn expires_soon_window() {
        let i = intro(100_000);
        assert!(!i.expires_soon(100_000 - INTRO_STALE_WINDOW - 1));
        assert!(i.expires_soon(100_000 - INTRO_STALE_WINDOW));
        assert!(i.expires_soon(100_000));
        assert!(i.expired(100_000));
        assert!(!i.expired(99_999));
    }

    #[test]
    fn intro_equality_ignores_samples() {
        let a = intro(50_000);
        let mut b = a;
        b.latency = 999;
        b.expires_at = 80_000;
        assert_eq!(a, b);
        let mut c = a;
        c.path_id = PathId::random().unwrap();
        assert_ne!(a, c);
    }
}
