//! # Endpoint Identity
//!
//! Long-term key material for a local hidden-service endpoint and the
//! public record derived from it:
//!
//! - [`SecretIdentity`]: X25519 encryption key, Ed25519 signing key,
//!   Kyber768 KEM keypair, version counter, vanity nonce. Mutated only
//!   during initialization.
//! - [`ServiceInfo`]: the public half published inside an introset.
//! - [`Address`]: the service address peers dial; the short hash of the
//!   signing key mixed with the vanity nonce.
//!
//! ## Persistence
//!
//! An identity serializes to a single bencoded dictionary with a version
//! field and is written to the configured keyfile. Loading rejects
//! dictionaries whose version this build does not understand. File IO is
//! expected to run on the disk worker.

use std::fmt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use tracing::info;

use crate::bencode::{DecodeError, DictReader, DictWriter, Item};
use crate::crypto::{
    self, CryptoError, PqKeyPair, PqPublicKey, RouterId, SharedSecret, TunnelNonce, SIGNATURE_LEN,
};
use crate::introset::IntroSet;

/// Identity dictionary version this build reads and writes.
pub const IDENTITY_VERSION: u64 = 0;

/// Length of a vanity nonce.
pub const VANITY_LEN: usize = 16;

/// Address derivation domain.
const ADDRESS_DOMAIN: &[u8] = b"shroud-addr-v1:";

/// Returns current time as milliseconds since Unix epoch.
/// Used for timestamps in advertised records.
#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ============================================================================
// Errors
// ============================================================================

/// Failure loading or persisting an identity keyfile.
#[derive(Debug)]
pub enum IdentityError {
    /// Reading or writing the keyfile failed.
    Io(std::io::Error),
    /// The keyfile did not parse as an identity dictionary.
    Malformed(DecodeError),
    /// The keyfile's version field is newer than this build understands.
    UnsupportedVersion(u64),
    /// Key material inside the file had the wrong shape.
    BadKeyMaterial(CryptoError),
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityError::Io(e) => write!(f, "identity keyfile io error: {}", e),
            IdentityError::Malformed(e) => write!(f, "identity keyfile malformed: {}", e),
            IdentityError::UnsupportedVersion(v) => {
                write!(f, "identity keyfile version {} not understood", v)
            }
            IdentityError::BadKeyMaterial(e) => write!(f, "identity key material invalid: {}", e),
        }
    }
}

impl std::error::Error for IdentityError {}

impl From<std::io::Error> for IdentityError {
    fn from(e: std::io::Error) -> Self {
        IdentityError::Io(e)
    }
}

impl From<DecodeError> for IdentityError {
    fn from(e: DecodeError) -> Self {
        IdentityError::Malformed(e)
    }
}

// ============================================================================
// Address
// ============================================================================

/// The dialable address of a hidden service.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(pub [u8; 32]);

impl Address {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The DHT keyspace location of this address, used to pick the
    /// closest established path for lookups.
    pub fn to_router(&self) -> RouterId {
        RouterId(self.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

// ============================================================================
// ServiceInfo
// ============================================================================

/// Public identity of a hidden service: signing key, encryption key,
/// derivation inputs. Equality is component-wise.
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    sign_pk: VerifyingKey,
    enc_pk: x25519_dalek::PublicKey,
    version: u64,
    vanity: [u8; VANITY_LEN],
}

impl ServiceInfo {
    pub fn new(
        sign_pk: VerifyingKey,
        enc_pk: x25519_dalek::PublicKey,
        version: u64,
        vanity: [u8; VANITY_LEN],
    ) -> Self {
        Self { sign_pk, enc_pk, version, vanity }
    }

    pub fn sign_pk(&self) -> &VerifyingKey {
        &self.sign_pk
    }

    pub fn enc_pk(&self) -> &x25519_dalek::PublicKey {
        &self.enc_pk
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Derive the dialable address: a short hash of the signing key with
    /// the vanity nonce mixed in.
    pub fn addr(&self) -> Address {
        let mut input = Vec::with_capacity(ADDRESS_DOMAIN.len() + 32 + VANITY_LEN);
        input.extend_from_slice(ADDRESS_DOMAIN);
        input.extend_from_slice(self.sign_pk.as_bytes());
        input.extend_from_slice(&self.vanity);
        Address(crypto::shorthash(&input))
    }

    /// Log-friendly short name.
    pub fn name(&self) -> String {
        hex::encode(&self.addr().0[..8])
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = DictWriter::new();
        w.bytes("e", self.enc_pk.as_bytes());
        w.bytes("s", self.sign_pk.as_bytes());
        w.int("v", self.version);
        w.bytes("x", &self.vanity);
        w.finish()
    }

    pub fn decode(item: &Item) -> Result<Self, DecodeError> {
        let r = DictReader::new(item)?;
        let enc: [u8; 32] = r.req_array("e")?;
        let sign: [u8; 32] = r.req_array("s")?;
        let sign_pk =
            VerifyingKey::from_bytes(&sign).map_err(|_| DecodeError::WrongField("s"))?;
        Ok(Self {
            sign_pk,
            enc_pk: x25519_dalek::PublicKey::from(enc),
            version: r.opt_int("v")?,
            vanity: r.opt_array("x")?,
        })
    }
}

impl fmt::Debug for ServiceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceInfo({})", self.name())
    }
}

// ============================================================================
// SecretIdentity
// ============================================================================

/// The secret half of an endpoint identity.
#[derive(Clone)]
pub struct SecretIdentity {
    enc_sk: x25519_dalek::StaticSecret,
    sign_sk: SigningKey,
    pq: PqKeyPair,
    version: u64,
    vanity: [u8; VANITY_LEN],
    public: ServiceInfo,
}

impl SecretIdentity {
    /// Unconditionally mint fresh encryption, signing, and PQ keys and a
    /// fresh vanity nonce, and recompute the public record.
    pub fn regenerate() -> Result<Self, CryptoError> {
        let enc_sk = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        let sign_sk = SigningKey::generate(&mut OsRng);
        let pq = PqKeyPair::generate();
        let mut vanity = [0u8; VANITY_LEN];
        crypto::randbytes(&mut vanity)?;
        Ok(Self::assemble(enc_sk, sign_sk, pq, IDENTITY_VERSION, vanity))
    }

    fn assemble(
        enc_sk: x25519_dalek::StaticSecret,
        sign_sk: SigningKey,
        pq: PqKeyPair,
        version: u64,
        vanity: [u8; VANITY_LEN],
    ) -> Self {
        let public = ServiceInfo::new(
            sign_sk.verifying_key(),
            x25519_dalek::PublicKey::from(&enc_sk),
            version,
            vanity,
        );
        Self { enc_sk, sign_sk, pq, version, vanity, public }
    }

    /// Load the identity at `path`, or mint and persist a fresh one when
    /// no file exists yet. Malformed or unwritable files are errors.
    pub fn ensure_keys(path: &Path) -> Result<Self, IdentityError> {
        if path.exists() {
            let bytes = std::fs::read(path)?;
            let identity = Self::decode(&bytes)?;
            info!(keyfile = %path.display(), addr = %identity.public.name(), "loaded identity");
            return Ok(identity);
        }
        let identity = Self::regenerate().map_err(IdentityError::BadKeyMaterial)?;
        std::fs::write(path, identity.encode())?;
        info!(keyfile = %path.display(), addr = %identity.public.name(), "generated identity");
        Ok(identity)
    }

    pub fn public(&self) -> &ServiceInfo {
        &self.public
    }

    pub fn pq_public(&self) -> &PqPublicKey {
        self.pq.public()
    }

    pub fn pq(&self) -> &PqKeyPair {
        &self.pq
    }

    /// Produce a frame signature with the signing secret key.
    pub fn sign(&self, domain: &[u8], data: &[u8]) -> [u8; SIGNATURE_LEN] {
        crypto::sign(&self.sign_sk, domain, data)
    }

    /// Populate `introset`'s public fields from this identity, then sign
    /// the serialized remainder and attach the signature.
    pub fn sign_introset(&self, introset: &mut IntroSet) {
        introset.service = self.public.clone();
        introset.pq_key = self.pq.public().clone();
        let unsigned = introset.encode_unsigned();
        introset.signature =
            crypto::sign(&self.sign_sk, crypto::INTROSET_SIGNATURE_DOMAIN, &unsigned);
    }

    /// Classical-DH half of the hybrid exchange with `other`.
    pub fn key_exchange(&self, other: &ServiceInfo, nonce: &TunnelNonce) -> SharedSecret {
        crypto::dh_session(&self.enc_sk, other.enc_pk(), nonce)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut pq_concat =
            Vec::with_capacity(self.pq.secret_bytes().len() + self.pq.public().as_bytes().len());
        pq_concat.extend_from_slice(self.pq.secret_bytes());
        pq_concat.extend_from_slice(self.pq.public().as_bytes());

        let mut w = DictWriter::new();
        w.bytes("e", &self.enc_sk.to_bytes());
        w.bytes("q", &pq_concat);
        w.bytes("s", &self.sign_sk.to_bytes());
        w.int("v", self.version);
        w.bytes("x", &self.vanity);
        w.finish()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, IdentityError> {
        let item = Item::parse(bytes)?;
        let r = DictReader::new(&item)?;
        let version = r.opt_int("v")?;
        if version > IDENTITY_VERSION {
            return Err(IdentityError::UnsupportedVersion(version));
        }
        let enc: [u8; 32] = r.req_array("e")?;
        let sign: [u8; 32] = r.req_array("s")?;
        let pq_concat = r.req_bytes("q")?;
        if pq_concat.len() <= crypto::PQ_PUBKEY_LEN {
            return Err(IdentityError::Malformed(DecodeError::WrongField("q")));
        }
        let split = pq_concat.len() - crypto::PQ_PUBKEY_LEN;
        let pq = PqKeyPair::from_parts(&pq_concat[..split], &pq_concat[split..])
            .map_err(IdentityError::BadKeyMaterial)?;
        let vanity: [u8; VANITY_LEN] = r.opt_array("x")?;
        Ok(Self::assemble(
            x25519_dalek::StaticSecret::from(enc),
            SigningKey::from_bytes(&sign),
            pq,
            version,
            vanity,
        ))
    }
}

impl fmt::Debug for SecretIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretIdentity({})", self.public.name())
    }
}

impl PartialEq for SecretIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.enc_sk.to_bytes() == other.enc_sk.to_bytes()
            && self.sign_sk.to_bytes() == other.sign_sk.to_bytes()
            && self.pq.secret_bytes() == other.pq.secret_bytes()
            && self.pq.public() == other.pq.public()
            && self.version == other.version
            && self.vanity == other.vanity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::verify;

    #[test]
    fn identity_encode_decode_roundtrip() {
        let identity = SecretIdentity::regenerate().unwrap();
        let decoded = SecretIdentity::decode(&identity.encode()).unwrap();
        assert_eq!(identity, decoded);
        assert_eq!(identity.public(), decoded.public());
        assert_eq!(identity.public().addr(), decoded.public().addr());
    }

    #[test]
    fn signatures_verify_under_public_info() {
        let identity = SecretIdentity::regenerate().unwrap();
        for msg in [&b"x"[..], &b""[..], &[0u8; 512][..]] {
            let sig = identity.sign(crypto::FRAME_SIGNATURE_DOMAIN, msg);
            assert!(verify(
                identity.public().sign_pk(),
                crypto::FRAME_SIGNATURE_DOMAIN,
                msg,
                &sig
            ));
        }
    }

    #[test]
    fn regenerated_identities_have_distinct_addresses() {
        let a = SecretIdentity::regenerate().unwrap();
        let b = SecretIdentity::regenerate().unwrap();
        assert_ne!(a.public().addr(), b.public().addr());
    }

    #[test]
    fn ensure_keys_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");

        let first = SecretIdentity::ensure_keys(&path).unwrap();
        assert!(path.exists());
        let second = SecretIdentity::ensure_keys(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn ensure_keys_rejects_garbage_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");
        std::fs::write(&path, b"not an identity").unwrap();
        assert!(SecretIdentity::ensure_keys(&path).is_err());
    }

    #[test]
    fn decode_rejects_future_version() {
        let identity = SecretIdentity::regenerate().unwrap();
        let mut replaced = Vec::new();
        // Rewrite the version integer in the encoded form.
        let encoded = identity.encode();
        let needle = b"1:vi0e";
        let pos = encoded.windows(needle.len()).position(|w| w == needle).unwrap();
        replaced.extend_from_slice(&encoded[..pos]);
        replaced.extend_from_slice(b"1:vi9e");
        replaced.extend_from_slice(&encoded[pos + needle.len()..]);
        assert!(matches!(
            SecretIdentity::decode(&replaced),
            Err(IdentityError::UnsupportedVersion(9))
        ));
    }
}
