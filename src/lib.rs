//! # Shroud - Hidden-Service Overlay Core
//!
//! Shroud implements the client core of an onion-routing overlay's hidden
//! services, plus the relay-side transit state:
//!
//! - **Identity**: persistent hybrid key material (Ed25519 + X25519 +
//!   Kyber768) with a derived dialable address
//! - **IntroSets**: signed reachability records published to and resolved
//!   from the overlay DHT
//! - **Paths**: multi-hop circuits with XChaCha20 per-hop rewriting and
//!   XOR-closest selection primitives
//! - **Conversations**: end-to-end sealed frames bootstrapped by a hybrid
//!   post-quantum key exchange
//! - **Transit hops**: the forwarding state every relay keeps per circuit
//!
//! ## Architecture
//!
//! All endpoint state is owned by a single logic task and mutated only
//! through `&mut` methods; crypto and disk work runs on worker pools and
//! completions hop back as typed values over async channels. The link
//! layer, node database, and relay-side DHT are consumed through traits
//! (see `router`), so the core embeds into any router runtime.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `endpoint` | High-level orchestrator: ticks, lookups, publish, sessions |
//! | `identity` | Secret identity, ServiceInfo, address derivation |
//! | `introset` | Introductions, signed IntroSets, tags |
//! | `frame` | Protocol frames and the hybrid key exchange |
//! | `path` | Path builder and onion layering |
//! | `outbound` | Per-remote session state and intro rotation |
//! | `transit` | Relay-side per-circuit forwarding |
//! | `dht` | DHT client messages and lookup bookkeeping |
//! | `messages` | Routing-message wire codecs |
//! | `bencode` | The dictionary wire format everything encodes with |
//! | `crypto` | Primitive surface: hashing, KEM, DH, stream cipher |
//! | `router` | Collaborator traits and worker pools |
//! | `netns` | Optional Linux network-namespace isolation |

pub mod bencode;
pub mod crypto;
pub mod dht;
pub mod endpoint;
pub mod frame;
pub mod identity;
pub mod introset;
pub mod messages;
pub mod netns;
pub mod outbound;
pub mod path;
pub mod router;
pub mod transit;

pub use crypto::{PathId, RouterId, SharedSecret, TunnelNonce};
pub use dht::{DhtMessage, GotIntroMessage, GotRouterMessage, RouterContact};
pub use endpoint::{Endpoint, LogicJob, PathEnsureHook};
pub use frame::{ProtocolFrame, ProtocolMessage, ProtocolType};
pub use identity::{Address, SecretIdentity, ServiceInfo};
pub use introset::{ConvoTag, IntroSet, Introduction, Tag};
pub use messages::{LinkMessage, RoutingMessage};
pub use outbound::{OutboundContext, SendState};
pub use path::{Path, PathSet};
pub use router::{LinkLayer, MemoryNodeDb, NodeDb, Router, RouterDht};
pub use transit::{TransitHop, TransitHopInfo};
