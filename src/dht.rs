//! # DHT Client Messages and Lookup State
//!
//! The client-facing half of the overlay DHT: the messages an endpoint
//! sends along its circuits to find introsets, publish its own, and
//! resolve router contacts, plus the in-flight bookkeeping records the
//! endpoint keeps per request.
//!
//! | Message | `A` | Direction |
//! |---------|-----|-----------|
//! | [`FindIntroMessage`] | `F` | request, by topic tag or by address |
//! | [`PublishIntroMessage`] | `I` | request, replicated store |
//! | [`GotIntroMessage`] | `G` | response to find/publish |
//! | [`FindRouterMessage`] | `R` | request, resolve a router contact |
//! | [`GotRouterMessage`] | `S` | response |
//!
//! Correlation is by 64-bit transaction id, unique among all in-flight
//! lookups of one endpoint. Requests ride inside a routing-layer DHT
//! message (`messages::DhtRoutingMessage`) on an established path.

use std::fmt;

use crate::bencode::{DecodeError, DictReader, DictWriter, Item};
use crate::crypto::RouterId;
use crate::identity::Address;
use crate::introset::{IntroSet, Tag};

/// Default time a lookup may stay unanswered before its handler fires
/// with an empty result.
pub const LOOKUP_TIMEOUT: u64 = 5_000;

/// Time a router resolution may stay outstanding.
pub const ROUTER_LOOKUP_TIMEOUT: u64 = 10_000;

/// Replication factor for introset publishes.
pub const PUBLISH_REPLICAS: u64 = 4;

/// Recursion depth for address lookups.
pub const ADDRESS_LOOKUP_RECURSION: u64 = 5;

/// How often a prefetched topic tag is re-queried.
pub const TAG_REFRESH_INTERVAL: u64 = 10_000;

// ============================================================================
// Wire messages
// ============================================================================

/// Lookup request: by topic tag (`tag` set) or by service address
/// (`address` set, with a recursion allowance).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FindIntroMessage {
    pub tag: Tag,
    pub address: Address,
    pub recursion: u64,
    pub txid: u64,
}

/// Store request replicating a signed introset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishIntroMessage {
    pub introset: IntroSet,
    pub replicas: u64,
    pub txid: u64,
}

/// Response carrying zero or more introsets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GotIntroMessage {
    pub txid: u64,
    pub introsets: Vec<IntroSet>,
}

/// Resolve the contact record for a router key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FindRouterMessage {
    pub flags: u64,
    pub key: RouterId,
    pub txid: u64,
}

/// Response carrying resolved router contacts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GotRouterMessage {
    pub txid: u64,
    pub routers: Vec<RouterContact>,
}

/// Any DHT message carried over a circuit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DhtMessage {
    FindIntro(FindIntroMessage),
    PublishIntro(PublishIntroMessage),
    GotIntro(GotIntroMessage),
    FindRouter(FindRouterMessage),
    GotRouter(GotRouterMessage),
}

impl DhtMessage {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            DhtMessage::FindIntro(m) => {
                let mut w = DictWriter::new();
                w.bytes("A", b"F");
                if !m.tag.is_zero() {
                    w.bytes("N", m.tag.as_bytes());
                }
                if m.recursion != 0 {
                    w.int("R", m.recursion);
                }
                if !m.address.is_zero() {
                    w.bytes("S", m.address.as_bytes());
                }
                w.int("T", m.txid);
                w.finish()
            }
            DhtMessage::PublishIntro(m) => {
                let introset = m.introset.encode();
                let mut w = DictWriter::new();
                w.bytes("A", b"I");
                w.raw("I", &introset);
                w.int("R", m.replicas);
                w.int("T", m.txid);
                w.finish()
            }
            DhtMessage::GotIntro(m) => {
                let sets: Vec<Vec<u8>> = m.introsets.iter().map(IntroSet::encode).collect();
                let mut w = DictWriter::new();
                w.bytes("A", b"G");
                w.list("I", sets.iter().map(Vec::as_slice));
                w.int("T", m.txid);
                w.finish()
            }
            DhtMessage::FindRouter(m) => {
                let mut w = DictWriter::new();
                w.bytes("A", b"R");
                if m.flags != 0 {
                    w.int("E", m.flags);
                }
                w.bytes("K", m.key.as_bytes());
                w.int("T", m.txid);
                w.finish()
            }
            DhtMessage::GotRouter(m) => {
                let contacts: Vec<Vec<u8>> = m.routers.iter().map(RouterContact::encode).collect();
                let mut w = DictWriter::new();
                w.bytes("A", b"S");
                w.list("R", contacts.iter().map(Vec::as_slice));
                w.int("T", m.txid);
                w.finish()
            }
        }
    }

    pub fn decode(item: &Item) -> Result<Self, DecodeError> {
        let r = DictReader::new(item)?;
        let kind = r.req_bytes("A")?;
        if kind.len() != 1 {
            return Err(DecodeError::WrongField("A"));
        }
        match kind[0] {
            b'F' => Ok(DhtMessage::FindIntro(FindIntroMessage {
                tag: Tag(r.opt_array("N")?),
                recursion: r.opt_int("R")?,
                address: Address(r.opt_array("S")?),
                txid: r.req_int("T")?,
            })),
            b'I' => Ok(DhtMessage::PublishIntro(PublishIntroMessage {
                introset: IntroSet::decode(r.get("I").ok_or(DecodeError::WrongField("I"))?)?,
                replicas: r.opt_int("R")?,
                txid: r.req_int("T")?,
            })),
            b'G' => {
                let mut introsets = Vec::new();
                for entry in r.req_list("I")? {
                    introsets.push(IntroSet::decode(entry)?);
                }
                Ok(DhtMessage::GotIntro(GotIntroMessage { introsets, txid: r.req_int("T")? }))
            }
            b'R' => Ok(DhtMessage::FindRouter(FindRouterMessage {
                flags: r.opt_int("E")?,
                key: RouterId(r.req_array("K")?),
                txid: r.req_int("T")?,
            })),
            b'S' => {
                let mut routers = Vec::new();
                for entry in r.req_list("R")? {
                    routers.push(RouterContact::decode(entry)?);
                }
                Ok(DhtMessage::GotRouter(GotRouterMessage { routers, txid: r.req_int("T")? }))
            }
            _ => Err(DecodeError::WrongField("A")),
        }
    }
}

// ============================================================================
// Router contacts
// ============================================================================

/// A relay's contact record as stored in the node database and resolved
/// through the DHT.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouterContact {
    pub id: RouterId,
    /// Dialable addresses, `host:port` strings.
    pub addrs: Vec<String>,
    /// Last-updated timestamp, milliseconds since epoch.
    pub last_updated: u64,
}

impl RouterContact {
    pub fn encode(&self) -> Vec<u8> {
        let addrs: Vec<Vec<u8>> = self.addrs.iter().map(|a| {
            let mut buf = Vec::new();
            buf.extend_from_slice(a.len().to_string().as_bytes());
            buf.push(b':');
            buf.extend_from_slice(a.as_bytes());
            buf
        }).collect();
        let mut w = DictWriter::new();
        w.list("a", addrs.iter().map(Vec::as_slice));
        w.bytes("k", self.id.as_bytes());
        w.int("t", self.last_updated);
        w.finish()
    }

    pub fn decode(item: &Item) -> Result<Self, DecodeError> {
        let r = DictReader::new(item)?;
        let mut addrs = Vec::new();
        for entry in r.req_list("a")? {
            let bytes = entry.as_bytes().ok_or(DecodeError::WrongField("a"))?;
            let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::WrongField("a"))?;
            addrs.push(text.to_owned());
        }
        Ok(Self {
            addrs,
            id: RouterId(r.req_array("k")?),
            last_updated: r.opt_int("t")?,
        })
    }
}

// ============================================================================
// In-flight lookup records
// ============================================================================

/// What a pending lookup's response should be routed to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LookupKind {
    /// Echo of our own introset confirming a publish.
    PublishConfirm,
    /// Hidden-service address resolution.
    Address(Address),
    /// Topic-tag prefetch.
    TagResult(Tag),
}

/// A DHT request in flight, correlated by transaction id.
#[derive(Clone, Debug)]
pub struct PendingLookup {
    pub txid: u64,
    /// Display name for logging.
    pub name: &'static str,
    pub issued: u64,
    pub timeout: u64,
    pub kind: LookupKind,
}

impl PendingLookup {
    pub fn timed_out(&self, now: u64) -> bool {
        now >= self.issued.saturating_add(self.timeout)
    }
}

/// A router-contact resolution in flight.
#[derive(Clone, Copy, Debug)]
pub struct PendingRouter {
    pub issued: u64,
    pub timeout: u64,
}

impl PendingRouter {
    pub fn new(now: u64) -> Self {
        Self { issued: now, timeout: ROUTER_LOOKUP_TIMEOUT }
    }

    pub fn expired(&self, now: u64) -> bool {
        now >= self.issued.saturating_add(self.timeout)
    }
}

// ============================================================================
// Cached tag results
// ============================================================================

/// The warm cache behind a `prefetch-tag` configuration entry.
#[derive(Clone, Debug)]
pub struct CachedTagResult {
    pub tag: Tag,
    pub result: Vec<IntroSet>,
    pub last_modified: u64,
    pub last_request: u64,
}

impl CachedTagResult {
    pub fn new(tag: Tag) -> Self {
        Self { tag, result: Vec::new(), last_modified: 0, last_request: 0 }
    }

    /// Merge a lookup response, tracking whether anything new arrived.
    pub fn handle_response(&mut self, introsets: Vec<IntroSet>, now: u64) {
        for introset in introsets {
            if !self.result.contains(&introset) {
                self.result.push(introset);
                self.last_modified = now;
            }
        }
    }

    /// Evict cached introsets whose introductions have hard-expired.
    pub fn expire(&mut self, now: u64) {
        let before = self.result.len();
        self.result.retain(|introset| !introset.has_expired_intros(now));
        if self.result.len() != before {
            self.last_modified = now;
        }
    }

    /// Due for another find-by-tag request.
    pub fn should_refresh(&self, now: u64) -> bool {
        now.saturating_sub(self.last_request) >= TAG_REFRESH_INTERVAL
    }

    /// Build the refresh request and stamp the request time.
    pub fn build_request(&mut self, txid: u64, now: u64) -> DhtMessage {
        self.last_request = now;
        DhtMessage::FindIntro(FindIntroMessage {
            tag: self.tag,
            address: Address::default(),
            recursion: 0,
            txid,
        })
    }
}

impl fmt::Display for CachedTagResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {} cached", self.tag, self.result.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::SecretIdentity;

    fn signed_introset(expires_at: u64) -> IntroSet {
        let identity = SecretIdentity::regenerate().unwrap();
        let mut introset = IntroSet::new(identity.public().clone(), identity.pq_public().clone());
        introset.intros.push(crate::introset::Introduction {
            router: RouterId::random().unwrap(),
            path_id: crate::crypto::PathId::random().unwrap(),
            latency: 10,
            expires_at,
            version: 0,
        });
        identity.sign_introset(&mut introset);
        introset
    }

    #[test]
    fn find_intro_roundtrips_both_shapes() {
        let by_tag = DhtMessage::FindIntro(FindIntroMessage {
            tag: Tag::new("chat"),
            address: Address::default(),
            recursion: 0,
            txid: 7,
        });
        let by_addr = DhtMessage::FindIntro(FindIntroMessage {
            tag: Tag::default(),
            address: Address([3u8; 32]),
            recursion: ADDRESS_LOOKUP_RECURSION,
            txid: 8,
        });
        for msg in [by_tag, by_addr] {
            let encoded = msg.encode();
            assert_eq!(DhtMessage::decode(&Item::parse(&encoded).unwrap()).unwrap(), msg);
        }
    }

    #[test]
    fn publish_and_got_intro_roundtrip() {
        let introset = signed_introset(90_000);
        let publish = DhtMessage::PublishIntro(PublishIntroMessage {
            introset: introset.clone(),
            replicas: PUBLISH_REPLICAS,
            txid: 99,
        });
        let got = DhtMessage::GotIntro(GotIntroMessage { introsets: vec![introset], txid: 99 });
        for msg in [publish, got] {
            let encoded = msg.encode();
            let decoded = DhtMessage::decode(&Item::parse(&encoded).unwrap()).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn router_messages_roundtrip() {
        let contact = RouterContact {
            id: RouterId::random().unwrap(),
            addrs: vec!["198.51.100.7:1090".to_owned()],
            last_updated: 1234,
        };
        let find = DhtMessage::FindRouter(FindRouterMessage {
            flags: 0,
            key: contact.id,
            txid: 5,
        });
        let got = DhtMessage::GotRouter(GotRouterMessage { routers: vec![contact], txid: 5 });
        for msg in [find, got] {
            let encoded = msg.encode();
            assert_eq!(DhtMessage::decode(&Item::parse(&encoded).unwrap()).unwrap(), msg);
        }
    }

    #[test]
    fn pending_lookup_timeout_boundary() {
        let lookup = PendingLookup {
            txid: 1,
            name: "test",
            issued: 1_000,
            timeout: LOOKUP_TIMEOUT,
            kind: LookupKind::PublishConfirm,
        };
        assert!(!lookup.timed_out(1_000 + LOOKUP_TIMEOUT - 1));
        assert!(lookup.timed_out(1_000 + LOOKUP_TIMEOUT));
    }

    #[test]
    fn cached_tag_dedupes_and_expires() {
        let mut cache = CachedTagResult::new(Tag::new("news"));
        let keeper = signed_introset(500_000);
        let expiring = signed_introset(10_000);

        cache.handle_response(vec![keeper.clone(), expiring.clone()], 1_000);
        assert_eq!(cache.result.len(), 2);
        assert_eq!(cache.last_modified, 1_000);

        // Same sets again: no modification recorded.
        cache.handle_response(vec![keeper.clone()], 2_000);
        assert_eq!(cache.last_modified, 1_000);

        cache.expire(20_000);
        assert_eq!(cache.result.len(), 1);
        assert!(cache.result.contains(&keeper));
        assert_eq!(cache.last_modified, 20_000);
    }

    #[test]
    fn tag_refresh_cadence() {
        let mut cache = CachedTagResult::new(Tag::new("news"));
        assert!(cache.should_refresh(0));
        let _ = cache.build_request(11, 30_000);
        assert!(!cache.should_refresh(30_000 + TAG_REFRESH_INTERVAL - 1));
        assert!(cache.should_refresh(30_000 + TAG_REFRESH_INTERVAL));
    }
}
