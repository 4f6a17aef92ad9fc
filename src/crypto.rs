//! # Cryptographic Provider
//!
//! Primitive surface consumed by the rest of the crate:
//!
//! - **Short hash**: BLAKE3 for address derivation and key mixing
//! - **Signatures**: domain-separated Ed25519 sign/verify
//! - **Classical DH**: X25519 with a per-exchange nonce folded into the
//!   derived secret
//! - **Post-quantum KEM**: Kyber768 encapsulation for the hybrid handshake
//! - **Stream cipher**: XChaCha20 for in-place frame and path rewriting
//!
//! The hybrid conversation key is `H(K1 || K2)` where `K1` comes from the
//! KEM and `K2` from the nonced DH; both halves are 32 bytes.
//!
//! Also defined here are the small fixed-size identifiers that flow through
//! the wire protocol ([`RouterId`], [`PathId`], [`TunnelNonce`]) and the
//! zeroizing [`SharedSecret`] key material type.

use std::fmt;
use std::ops::BitXor;

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::XChaCha20;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use pqcrypto_kyber::kyber768;
use pqcrypto_traits::kem::{
    Ciphertext as KemCiphertext, PublicKey as KemPublicKey, SecretKey as KemSecretKey,
    SharedSecret as KemSharedSecret,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Kyber768 ciphertext length carried in a handshake frame.
pub const PQ_CIPHERTEXT_LEN: usize = 1088;

/// Kyber768 public key length carried in an introset.
pub const PQ_PUBKEY_LEN: usize = 1184;

/// Ed25519 signature length.
pub const SIGNATURE_LEN: usize = 64;

/// Domain separation prefix for introset signatures.
pub const INTROSET_SIGNATURE_DOMAIN: &[u8] = b"shroud-introset-v1:";

/// Domain separation prefix for protocol frame signatures.
pub const FRAME_SIGNATURE_DOMAIN: &[u8] = b"shroud-frame-v1:";

/// Domain separation prefix for the nonced X25519 secret derivation.
const DH_DOMAIN: &[u8] = b"shroud-dh-v1:";

/// Domain separation prefix for the hybrid session key hash.
const SESSION_DOMAIN: &[u8] = b"shroud-session-v1:";

// ============================================================================
// Errors
// ============================================================================

/// Failure from the system CSPRNG or a malformed key/ciphertext input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// The OS random source was unavailable.
    RngUnavailable,
    /// A key, ciphertext, or signature had the wrong length or encoding.
    Malformed,
    /// KEM decapsulation failed.
    Decapsulation,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::RngUnavailable => write!(f, "CSPRNG unavailable"),
            CryptoError::Malformed => write!(f, "malformed cryptographic input"),
            CryptoError::Decapsulation => write!(f, "KEM decapsulation failed"),
        }
    }
}

impl std::error::Error for CryptoError {}

impl From<getrandom::Error> for CryptoError {
    fn from(_: getrandom::Error) -> Self {
        CryptoError::RngUnavailable
    }
}

// ============================================================================
// Wire identifiers
// ============================================================================

macro_rules! byte_id {
    ($(#[$doc:meta])* $name:ident, $len:expr) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }

            /// Fill with fresh random bytes.
            pub fn random() -> Result<Self, CryptoError> {
                let mut bytes = [0u8; $len];
                getrandom::getrandom(&mut bytes)?;
                Ok(Self(bytes))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), hex::encode(&self.0[..8.min($len)]))
            }
        }
    };
}

byte_id!(
    /// A router's identity key hash; the node-level address of a relay.
    RouterId,
    32
);

byte_id!(
    /// Identifier of one circuit at one relay. Distinct per transit hop.
    PathId,
    16
);

byte_id!(
    /// 24-byte XChaCha20 nonce carried alongside relayed frames.
    TunnelNonce,
    24
);

impl BitXor for TunnelNonce {
    type Output = TunnelNonce;

    /// Per-hop nonce rotation. Applying the same mask twice is the identity.
    fn bitxor(self, rhs: TunnelNonce) -> TunnelNonce {
        let mut out = [0u8; 24];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ rhs.0[i];
        }
        TunnelNonce(out)
    }
}

/// 32 bytes of symmetric key material, wiped on drop.
#[derive(Clone, PartialEq, Eq, Default, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret(pub [u8; 32]);

impl SharedSecret {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn random() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; 32];
        getrandom::getrandom(&mut bytes)?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSecret(..)")
    }
}

// ============================================================================
// Hashing and randomness
// ============================================================================

/// Fixed 32-byte short hash.
pub fn shorthash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Fill `buf` with random bytes.
pub fn randbytes(buf: &mut [u8]) -> Result<(), CryptoError> {
    getrandom::getrandom(buf)?;
    Ok(())
}

/// Random 64-bit value for transaction ids.
pub fn random_u64() -> Result<u64, CryptoError> {
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes)?;
    Ok(u64::from_be_bytes(bytes))
}

// ============================================================================
// Classical DH (X25519, nonced)
// ============================================================================

/// Derive the classical half of a conversation secret.
///
/// Both directions reach the same X25519 shared point, so
/// `dh_session(a_sk, b_pk, n) == dh_session(b_sk, a_pk, n)`.
pub fn dh_session(
    local: &x25519_dalek::StaticSecret,
    remote: &x25519_dalek::PublicKey,
    nonce: &TunnelNonce,
) -> SharedSecret {
    let point = local.diffie_hellman(remote);
    let mut hasher = blake3::Hasher::new();
    hasher.update(DH_DOMAIN);
    hasher.update(point.as_bytes());
    hasher.update(nonce.as_bytes());
    SharedSecret(*hasher.finalize().as_bytes())
}

/// Hash the two hybrid halves into the conversation session key.
pub fn session_key(pq_half: &SharedSecret, dh_half: &SharedSecret) -> SharedSecret {
    let mut hasher = blake3::Hasher::new();
    hasher.update(SESSION_DOMAIN);
    hasher.update(pq_half.as_bytes());
    hasher.update(dh_half.as_bytes());
    SharedSecret(*hasher.finalize().as_bytes())
}

// ============================================================================
// Post-quantum KEM (Kyber768)
// ============================================================================

/// Public half of a Kyber768 keypair, as carried in an introset.
#[derive(Clone, PartialEq, Eq)]
pub struct PqPublicKey(Vec<u8>);

impl PqPublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != PQ_PUBKEY_LEN {
            return Err(CryptoError::Malformed);
        }
        Ok(Self(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for PqPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PqPublicKey({})", hex::encode(&self.0[..8]))
    }
}

/// A Kyber768 keypair held by a local identity.
#[derive(Clone)]
pub struct PqKeyPair {
    secret: Vec<u8>,
    public: PqPublicKey,
}

impl PqKeyPair {
    /// Mint a fresh keypair.
    pub fn generate() -> Self {
        let (pk, sk) = kyber768::keypair();
        Self {
            secret: sk.as_bytes().to_vec(),
            public: PqPublicKey(pk.as_bytes().to_vec()),
        }
    }

    pub fn from_parts(secret: &[u8], public: &[u8]) -> Result<Self, CryptoError> {
        if secret.len() != kyber768::secret_key_bytes() {
            return Err(CryptoError::Malformed);
        }
        Ok(Self {
            secret: secret.to_vec(),
            public: PqPublicKey::from_bytes(public)?,
        })
    }

    pub fn public(&self) -> &PqPublicKey {
        &self.public
    }

    pub fn secret_bytes(&self) -> &[u8] {
        &self.secret
    }

    /// Recover the encapsulated secret from a handshake ciphertext.
    pub fn decapsulate(&self, ciphertext: &[u8]) -> Result<SharedSecret, CryptoError> {
        let sk = kyber768::SecretKey::from_bytes(&self.secret)
            .map_err(|_| CryptoError::Malformed)?;
        let ct = kyber768::Ciphertext::from_bytes(ciphertext)
            .map_err(|_| CryptoError::Decapsulation)?;
        let ss = kyber768::decapsulate(&ct, &sk);
        let bytes: [u8; 32] = ss.as_bytes().try_into().map_err(|_| CryptoError::Decapsulation)?;
        Ok(SharedSecret(bytes))
    }
}

impl Drop for PqKeyPair {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl fmt::Debug for PqKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PqKeyPair({:?})", self.public)
    }
}

/// Encapsulate to a remote PQ public key: `(ciphertext, shared)`.
pub fn pqe_encapsulate(to: &PqPublicKey) -> Result<(Vec<u8>, SharedSecret), CryptoError> {
    let pk = kyber768::PublicKey::from_bytes(to.as_bytes()).map_err(|_| CryptoError::Malformed)?;
    let (ss, ct) = kyber768::encapsulate(&pk);
    let bytes: [u8; 32] = ss.as_bytes().try_into().map_err(|_| CryptoError::Malformed)?;
    Ok((ct.as_bytes().to_vec(), SharedSecret(bytes)))
}

// ============================================================================
// Stream cipher
// ============================================================================

/// Symmetric in-place rewrite under `key` and a 24-byte nonce.
/// Applying it twice with the same parameters restores the input.
pub fn xchacha20(buf: &mut [u8], key: &SharedSecret, nonce: &TunnelNonce) {
    let mut cipher = XChaCha20::new(key.as_bytes().into(), nonce.as_bytes().into());
    cipher.apply_keystream(buf);
}

// ============================================================================
// Signatures
// ============================================================================

/// Sign `data` under `domain` with an Ed25519 signing key.
pub fn sign(key: &SigningKey, domain: &[u8], data: &[u8]) -> [u8; SIGNATURE_LEN] {
    let mut message = Vec::with_capacity(domain.len() + data.len());
    message.extend_from_slice(domain);
    message.extend_from_slice(data);
    key.sign(&message).to_bytes()
}

/// Verify a domain-separated Ed25519 signature.
pub fn verify(key: &VerifyingKey, domain: &[u8], data: &[u8], sig: &[u8]) -> bool {
    let Ok(sig_bytes) = <[u8; SIGNATURE_LEN]>::try_from(sig) else {
        return false;
    };
    let signature = Signature::from_bytes(&sig_bytes);
    let mut message = Vec::with_capacity(domain.len() + data.len());
    message.extend_from_slice(domain);
    message.extend_from_slice(data);
    key.verify(&message, &signature).is_ok()
}

/// XOR distance comparison: orders `a` and `b` by distance from `key`,
/// bytewise from the most significant end.
pub fn distance_cmp(key: &[u8; 32], a: &[u8; 32], b: &[u8; 32]) -> std::cmp::Ordering {
    for i in 0..32 {
        let da = key[i] ^ a[i];
        let db = key[i] ^ b[i];
        if da != db {
            return da.cmp(&db);
        }
    }
    std::cmp::Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn nonce_xor_is_involution() {
        let a = TunnelNonce::random().unwrap();
        let mask = TunnelNonce::random().unwrap();
        assert_eq!((a ^ mask) ^ mask, a);
    }

    #[test]
    fn xchacha20_is_involution() {
        let key = SharedSecret::random().unwrap();
        let nonce = TunnelNonce::random().unwrap();
        let original = b"relay payload".to_vec();
        let mut buf = original.clone();
        xchacha20(&mut buf, &key, &nonce);
        assert_ne!(buf, original);
        xchacha20(&mut buf, &key, &nonce);
        assert_eq!(buf, original);
    }

    #[test]
    fn dh_session_agrees_both_directions() {
        let a_sk = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        let b_sk = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        let a_pk = x25519_dalek::PublicKey::from(&a_sk);
        let b_pk = x25519_dalek::PublicKey::from(&b_sk);
        let nonce = TunnelNonce::random().unwrap();

        let ab = dh_session(&a_sk, &b_pk, &nonce);
        let ba = dh_session(&b_sk, &a_pk, &nonce);
        assert_eq!(ab, ba);

        // A different nonce derives a different secret.
        let other = dh_session(&a_sk, &b_pk, &TunnelNonce::random().unwrap());
        assert_ne!(ab, other);
    }

    #[test]
    fn kem_roundtrip() {
        let pair = PqKeyPair::generate();
        let (ct, sealed) = pqe_encapsulate(pair.public()).unwrap();
        assert_eq!(ct.len(), PQ_CIPHERTEXT_LEN);
        let opened = pair.decapsulate(&ct).unwrap();
        assert_eq!(sealed, opened);
    }

    #[test]
    fn signature_domain_separation() {
        let key = SigningKey::generate(&mut OsRng);
        let sig = sign(&key, FRAME_SIGNATURE_DOMAIN, b"hello");
        assert!(verify(&key.verifying_key(), FRAME_SIGNATURE_DOMAIN, b"hello", &sig));
        assert!(!verify(&key.verifying_key(), INTROSET_SIGNATURE_DOMAIN, b"hello", &sig));
        assert!(!verify(&key.verifying_key(), FRAME_SIGNATURE_DOMAIN, b"hellO", &sig));
    }

    #[test]
    fn distance_cmp_orders_by_xor_metric() {
        let key = [0u8; 32];
        let mut near = [0u8; 32];
        near[31] = 1;
        let mut far = [0u8; 32];
        far[0] = 0x80;
        assert_eq!(distance_cmp(&key, &near, &far), std::cmp::Ordering::Less);
        assert_eq!(distance_cmp(&key, &far, &near), std::cmp::Ordering::Greater);
        assert_eq!(distance_cmp(&key, &near, &near), std::cmp::Ordering::Equal);
    }
}
