//! # Paths and the Path Builder
//!
//! Client-side circuits: multi-hop cryptographic tunnels the endpoint
//! builds through the overlay, and the [`PathSet`] that maintains a
//! target number of them.
//!
//! ## Lifecycle
//!
//! *building* → *established* → *dead*. A path is established when its
//! build confirmation arrives on it; it dies on explicit drop, on expiry,
//! or when its measured latency exceeds the configured minimum. The set
//! schedules a replacement on the tick after any death.
//!
//! ## Onion layering
//!
//! Outgoing routing messages are padded, then encrypted once per hop in
//! reverse order with each hop's nonce derived through the per-hop XOR
//! chain; each relay peels exactly one layer. Inbound frames accumulate
//! one layer per relay and are peeled here with the mirrored chain.
//!
//! Per-hop symmetric keys are agreed during circuit construction by the
//! link layer's build handshake, which is outside this crate; the builder
//! records the agreed material per hop.

use rand::Rng;
use tracing::{debug, warn};

use crate::crypto::{self, PathId, RouterId, SharedSecret, TunnelNonce};
use crate::dht::RouterContact;
use crate::introset::Introduction;
use crate::messages::{LinkMessage, RelayUpstreamMessage, RoutingMessage};
use crate::router::{NodeDb, Router};

/// Lifetime granted to an established path.
pub const DEFAULT_PATH_LIFETIME: u64 = 600_000;

/// How long a path may sit in *building* before it is abandoned.
pub const PATH_BUILD_TIMEOUT: u64 = 30_000;

/// Hops per path.
pub const DEFAULT_HOP_COUNT: usize = 4;

/// Retries when hop selection draws a router already in the path.
const HOP_SELECT_RETRIES: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathStatus {
    Building,
    Established,
    Dead,
}

/// Why a path build could not start.
#[derive(Debug, PartialEq, Eq)]
pub enum BuildError {
    /// The node database cannot supply enough distinct routers.
    NotEnoughRouters,
    /// A pinned terminal router has no known contact yet.
    TerminalUnknown(RouterId),
    /// The set is at its concurrent path cap.
    AtCapacity,
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildError::NotEnoughRouters => write!(f, "not enough routers for a path"),
            BuildError::TerminalUnknown(r) => {
                write!(f, "terminal router {} unknown", hex::encode(&r.0[..8]))
            }
            BuildError::AtCapacity => write!(f, "path set at capacity"),
        }
    }
}

impl std::error::Error for BuildError {}

// ============================================================================
// Hop selection
// ============================================================================

/// Hook constraining which router serves at each position of a new path.
/// The outbound context pins the terminal hop to its remote introduction.
pub trait HopSelector {
    fn select_hop(
        &self,
        nodedb: &dyn NodeDb,
        prev: Option<&RouterContact>,
        index: usize,
        hop_count: usize,
    ) -> Result<RouterContact, BuildError>;
}

/// Uniform-random selection over the node database for every position.
pub struct AnyTerminal;

impl HopSelector for AnyTerminal {
    fn select_hop(
        &self,
        nodedb: &dyn NodeDb,
        prev: Option<&RouterContact>,
        _index: usize,
        _hop_count: usize,
    ) -> Result<RouterContact, BuildError> {
        let candidates = nodedb.all_rcs();
        if candidates.is_empty() {
            return Err(BuildError::NotEnoughRouters);
        }
        let mut rng = rand::thread_rng();
        for _ in 0..HOP_SELECT_RETRIES {
            let pick = &candidates[rng.gen_range(0..candidates.len())];
            if prev.map(|p| p.id) != Some(pick.id) {
                return Ok(pick.clone());
            }
        }
        Err(BuildError::NotEnoughRouters)
    }
}

/// Random selection with the terminal hop pinned to one router.
pub struct PinnedTerminal(pub RouterId);

impl HopSelector for PinnedTerminal {
    fn select_hop(
        &self,
        nodedb: &dyn NodeDb,
        prev: Option<&RouterContact>,
        index: usize,
        hop_count: usize,
    ) -> Result<RouterContact, BuildError> {
        if index == hop_count - 1 {
            return nodedb.get_rc(&self.0).ok_or(BuildError::TerminalUnknown(self.0));
        }
        AnyTerminal.select_hop(nodedb, prev, index, hop_count)
    }
}

// ============================================================================
// Path
// ============================================================================

/// One hop of a built path: the relay's contact, the path ids on its
/// sides, and the symmetric material agreed at build time.
#[derive(Clone, Debug)]
pub struct PathHop {
    pub rc: RouterContact,
    pub tx_id: PathId,
    pub rx_id: PathId,
    pub key: SharedSecret,
    pub nonce_xor: TunnelNonce,
}

/// A client-built circuit through the overlay.
#[derive(Clone, Debug)]
pub struct Path {
    pub hops: Vec<PathHop>,
    pub status: PathStatus,
    pub created_at: u64,
    pub established_at: u64,
    pub lifetime: u64,
    /// Last measured round-trip, milliseconds. Zero until probed.
    pub latency: u64,
    /// When the last latency probe left, milliseconds.
    pub last_latency_probe: u64,
    /// The introduction this path advertises once established.
    pub intro: Introduction,
}

impl Path {
    fn build(hops: Vec<PathHop>, now: u64) -> Self {
        Self {
            hops,
            status: PathStatus::Building,
            created_at: now,
            established_at: 0,
            lifetime: DEFAULT_PATH_LIFETIME,
            latency: 0,
            last_latency_probe: 0,
            intro: Introduction::default(),
        }
    }

    /// The relay adjacent to this endpoint.
    pub fn upstream_router(&self) -> RouterId {
        self.hops.first().map(|h| h.rc.id).unwrap_or_default()
    }

    /// The terminal relay; where this path surfaces on the overlay.
    pub fn endpoint_router(&self) -> RouterId {
        self.hops.last().map(|h| h.rc.id).unwrap_or_default()
    }

    /// Client-side id of this path; inbound downstream traffic carries it.
    pub fn local_rx_id(&self) -> PathId {
        self.hops.first().map(|h| h.rx_id).unwrap_or_default()
    }

    /// Client-side tx id, also how the path is addressed in the set.
    pub fn local_tx_id(&self) -> PathId {
        self.hops.first().map(|h| h.tx_id).unwrap_or_default()
    }

    pub fn is_established(&self) -> bool {
        self.status == PathStatus::Established
    }

    pub fn expired(&self, now: u64) -> bool {
        match self.status {
            PathStatus::Dead => true,
            PathStatus::Building => now.saturating_sub(self.created_at) > PATH_BUILD_TIMEOUT,
            PathStatus::Established => {
                now.saturating_sub(self.established_at) > self.lifetime
            }
        }
    }

    /// Mark established and derive the advertised introduction.
    pub fn confirm(&mut self, lifetime: u64, now: u64) {
        self.status = PathStatus::Established;
        self.established_at = now;
        if lifetime != 0 {
            self.lifetime = lifetime;
        }
        self.intro = Introduction {
            router: self.endpoint_router(),
            path_id: self.hops.last().map(|h| h.tx_id).unwrap_or_default(),
            latency: self.latency,
            expires_at: now + self.lifetime,
            version: 0,
        };
    }

    /// Send a routing message up this path: pad, apply one encryption
    /// layer per hop in reverse, hand to the link layer.
    pub fn send_routing_message(&self, msg: &RoutingMessage, router: &Router) -> bool {
        let mut buf = match msg.encode_padded() {
            Ok(buf) => buf,
            Err(e) => {
                warn!(error = %e, "failed to pad routing message");
                return false;
            }
        };
        let y = match TunnelNonce::random() {
            Ok(y) => y,
            Err(e) => {
                warn!(error = %e, "failed to draw path nonce");
                return false;
            }
        };

        // Nonce as each hop will see it.
        let mut hop_nonces = Vec::with_capacity(self.hops.len());
        let mut nonce = y;
        for hop in &self.hops {
            hop_nonces.push(nonce);
            nonce = nonce ^ hop.nonce_xor;
        }
        // Innermost layer first so each relay peels exactly one.
        for (hop, n) in self.hops.iter().zip(hop_nonces.iter()).rev() {
            crypto::xchacha20(&mut buf, &hop.key, n);
        }

        debug!(
            to = ?self.upstream_router(),
            endpoint = ?self.endpoint_router(),
            bytes = buf.len(),
            "send routing message on path"
        );
        router.link.send_to_or_queue(
            &self.upstream_router(),
            LinkMessage::Upstream(RelayUpstreamMessage {
                path_id: self.local_tx_id(),
                nonce: y,
                payload: buf,
            }),
        )
    }

    /// Peel the per-relay layers from an inbound downstream frame,
    /// returning the plaintext the terminal hop emitted.
    pub fn peel_inbound(&self, mut buf: Vec<u8>, y: TunnelNonce) -> Vec<u8> {
        let mut nonce = y;
        for hop in &self.hops {
            nonce = nonce ^ hop.nonce_xor;
            crypto::xchacha20(&mut buf, &hop.key, &nonce);
        }
        buf
    }

    /// Peel and parse an inbound routing message. Corrupt frames yield
    /// `None`.
    pub fn decrypt_inbound(&self, buf: Vec<u8>, y: TunnelNonce) -> Option<RoutingMessage> {
        let buf = self.peel_inbound(buf, y);
        match RoutingMessage::decode(&buf) {
            Ok(msg) => Some(msg),
            Err(e) => {
                debug!(error = %e, "dropping undecodable inbound frame");
                None
            }
        }
    }

    /// Materialize the relay-side state each hop of this path keeps, for
    /// in-process loopback deployments and tests.
    pub fn transit_hop_chain(&self, client: RouterId) -> Vec<crate::transit::TransitHop> {
        let mut chain = Vec::with_capacity(self.hops.len());
        for (i, hop) in self.hops.iter().enumerate() {
            let upstream = if i + 1 < self.hops.len() {
                self.hops[i + 1].rc.id
            } else {
                hop.rc.id
            };
            let downstream = if i == 0 { client } else { self.hops[i - 1].rc.id };
            chain.push(crate::transit::TransitHop::new(
                crate::transit::TransitHopInfo {
                    tx_id: hop.tx_id,
                    rx_id: hop.rx_id,
                    upstream,
                    downstream,
                },
                hop.key.clone(),
                self.created_at,
                hop.nonce_xor,
            ));
        }
        chain
    }
}

// ============================================================================
// PathSet
// ============================================================================

/// A collection of paths kept at a target size, with the established-path
/// selection primitives the endpoint and outbound contexts use.
pub struct PathSet {
    desired: usize,
    max_paths: usize,
    hop_count: usize,
    paths: Vec<Path>,
    /// Outstanding manual rebuild requests.
    build_requests: usize,
}

impl PathSet {
    pub fn new(desired: usize, max_paths: usize) -> Self {
        Self {
            desired,
            max_paths,
            hop_count: DEFAULT_HOP_COUNT,
            paths: Vec::new(),
            build_requests: 0,
        }
    }

    pub fn paths(&self) -> &[Path] {
        &self.paths
    }

    pub fn established(&self) -> impl Iterator<Item = &Path> {
        self.paths.iter().filter(|p| p.is_established())
    }

    pub fn num_established(&self) -> usize {
        self.established().count()
    }

    /// The established path whose terminal router is XOR-closest to `key`.
    pub fn get_established_path_closest_to(&self, key: &[u8; 32]) -> Option<&Path> {
        self.established().min_by(|a, b| {
            crypto::distance_cmp(key, a.endpoint_router().as_bytes(), b.endpoint_router().as_bytes())
        })
    }

    /// Uniform-random established path.
    pub fn pick_random_established_path(&self) -> Option<&Path> {
        let established: Vec<&Path> = self.established().collect();
        if established.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..established.len());
        Some(established[idx])
    }

    /// Any established path terminating at `router`.
    pub fn get_path_by_router(&self, router: &RouterId) -> Option<&Path> {
        self.established().find(|p| p.endpoint_router() == *router)
    }

    /// The most recently established path terminating at `router`.
    pub fn get_newest_path_by_router(&self, router: &RouterId) -> Option<&Path> {
        self.established()
            .filter(|p| p.endpoint_router() == *router)
            .max_by_key(|p| p.established_at)
    }

    pub fn get_path_by_tx_id(&self, id: &PathId) -> Option<&Path> {
        self.paths.iter().find(|p| p.local_tx_id() == *id)
    }

    /// Request `n` extra builds regardless of the normal cadence.
    pub fn manual_rebuild(&mut self, n: usize) {
        self.build_requests += n;
    }

    pub fn should_build_more(&self) -> bool {
        let alive = self.paths.iter().filter(|p| p.status != PathStatus::Dead).count();
        self.build_requests > 0 || alive < self.desired
    }

    /// Drop dead, expired, and stuck-building paths.
    pub fn expire(&mut self, now: u64) {
        let before = self.paths.len();
        self.paths.retain(|p| !p.expired(now));
        let dropped = before - self.paths.len();
        if dropped > 0 {
            debug!(dropped, "expired paths");
        }
    }

    /// Build one path with the given terminal policy. Hop material is
    /// drawn here; the link layer's build handshake distributes it.
    pub fn build_path(
        &mut self,
        nodedb: &dyn NodeDb,
        selector: &dyn HopSelector,
        now: u64,
    ) -> Result<&Path, BuildError> {
        let alive = self.paths.iter().filter(|p| p.status != PathStatus::Dead).count();
        if alive >= self.max_paths {
            return Err(BuildError::AtCapacity);
        }

        let mut hops: Vec<PathHop> = Vec::with_capacity(self.hop_count);
        for index in 0..self.hop_count {
            let prev = hops.last().map(|h| &h.rc);
            let mut rc = selector.select_hop(nodedb, prev, index, self.hop_count)?;
            // Redraw when a non-terminal pick already serves this path.
            let mut retries = 0;
            while index != self.hop_count - 1
                && hops.iter().any(|h| h.rc.id == rc.id)
                && retries < HOP_SELECT_RETRIES
            {
                rc = selector.select_hop(nodedb, prev, index, self.hop_count)?;
                retries += 1;
            }
            if hops.iter().any(|h| h.rc.id == rc.id) {
                return Err(BuildError::NotEnoughRouters);
            }
            hops.push(PathHop {
                rc,
                tx_id: PathId::random().map_err(|_| BuildError::NotEnoughRouters)?,
                rx_id: PathId::random().map_err(|_| BuildError::NotEnoughRouters)?,
                key: SharedSecret::random().map_err(|_| BuildError::NotEnoughRouters)?,
                nonce_xor: TunnelNonce::random().map_err(|_| BuildError::NotEnoughRouters)?,
            });
        }

        if self.build_requests > 0 {
            self.build_requests -= 1;
        }
        let path = Path::build(hops, now);
        debug!(endpoint = ?path.endpoint_router(), "building path");
        self.paths.push(path);
        Ok(self.paths.last().expect("just pushed"))
    }

    /// Handle a build confirmation that arrived on the path addressed by
    /// its client-side tx id. Returns the established path.
    pub fn confirm_path(&mut self, tx_id: &PathId, lifetime: u64, now: u64) -> Option<&Path> {
        let path = self
            .paths
            .iter_mut()
            .find(|p| p.local_tx_id() == *tx_id && p.status == PathStatus::Building)?;
        path.confirm(lifetime, now);
        debug!(endpoint = ?path.endpoint_router(), "path established");
        Some(&*path)
    }

    /// Kill the path addressed by its client-side tx id. A replacement is
    /// scheduled on the next tick by `should_build_more`.
    pub fn mark_path_dead(&mut self, tx_id: &PathId) -> bool {
        match self.paths.iter_mut().find(|p| p.local_tx_id() == *tx_id) {
            Some(path) => {
                path.status = PathStatus::Dead;
                debug!(endpoint = ?path.endpoint_router(), "path marked dead");
                true
            }
            None => false,
        }
    }

    /// Record a latency sample on a path.
    pub fn record_latency(&mut self, tx_id: &PathId, latency: u64) {
        if let Some(path) = self.paths.iter_mut().find(|p| p.local_tx_id() == *tx_id) {
            path.latency = latency;
            path.intro.latency = latency;
        }
    }

    /// Established paths due for a latency probe; stamps the probe time
    /// and returns clones for the caller to probe on.
    pub fn take_probe_due(&mut self, now: u64, interval: u64) -> Vec<Path> {
        let mut due = Vec::new();
        for path in &mut self.paths {
            if path.is_established() && now.saturating_sub(path.last_latency_probe) >= interval {
                path.last_latency_probe = now;
                due.push(path.clone());
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::MemoryNodeDb;

    fn seeded_nodedb(n: usize) -> MemoryNodeDb {
        let db = MemoryNodeDb::new();
        for i in 0..n {
            let mut id = [0u8; 32];
            id[0] = i as u8 + 1;
            db.put_rc(RouterContact {
                id: RouterId(id),
                addrs: vec![format!("198.51.100.{}:1090", i + 1)],
                last_updated: 0,
            });
        }
        db
    }

    fn built_established(set: &mut PathSet, db: &MemoryNodeDb, now: u64) -> PathId {
        let tx = set.build_path(db, &AnyTerminal, now).unwrap().local_tx_id();
        set.confirm_path(&tx, 0, now).unwrap();
        tx
    }

    #[test]
    fn build_and_confirm_sets_intro() {
        let db = seeded_nodedb(8);
        let mut set = PathSet::new(4, 4);
        let tx = set.build_path(&db, &AnyTerminal, 1_000).unwrap().local_tx_id();
        assert_eq!(set.num_established(), 0);

        let path = set.confirm_path(&tx, 0, 2_000).unwrap();
        assert!(path.is_established());
        assert_eq!(path.intro.router, path.endpoint_router());
        assert_eq!(path.intro.expires_at, 2_000 + DEFAULT_PATH_LIFETIME);
        assert_eq!(set.num_established(), 1);
    }

    #[test]
    fn hops_are_distinct_routers() {
        let db = seeded_nodedb(8);
        let mut set = PathSet::new(4, 4);
        let path = set.build_path(&db, &AnyTerminal, 0).unwrap();
        let mut ids: Vec<RouterId> = path.hops.iter().map(|h| h.rc.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), DEFAULT_HOP_COUNT);
    }

    #[test]
    fn pinned_terminal_lands_on_requested_router() {
        let db = seeded_nodedb(8);
        let target = db.all_rcs()[0].id;
        let mut set = PathSet::new(2, 4);
        let path = set.build_path(&db, &PinnedTerminal(target), 0).unwrap();
        assert_eq!(path.endpoint_router(), target);
    }

    #[test]
    fn pinned_terminal_fails_loudly_when_unknown() {
        let db = seeded_nodedb(8);
        let unknown = RouterId([0xee; 32]);
        let mut set = PathSet::new(2, 4);
        assert_eq!(
            set.build_path(&db, &PinnedTerminal(unknown), 0).unwrap_err(),
            BuildError::TerminalUnknown(unknown)
        );
    }

    #[test]
    fn closest_selection_uses_xor_metric() {
        let db = seeded_nodedb(12);
        let mut set = PathSet::new(4, 8);
        for _ in 0..4 {
            built_established(&mut set, &db, 1_000);
        }
        let key = [0u8; 32];
        let closest = set.get_established_path_closest_to(&key).unwrap();
        for other in set.established() {
            assert_ne!(
                crypto::distance_cmp(
                    &key,
                    other.endpoint_router().as_bytes(),
                    closest.endpoint_router().as_bytes()
                ),
                std::cmp::Ordering::Less
            );
        }
    }

    #[test]
    fn newest_by_router_prefers_latest_establishment() {
        let db = seeded_nodedb(6);
        let mut set = PathSet::new(4, 8);
        let first = set.build_path(&db, &PinnedTerminal(db.all_rcs()[0].id), 0).unwrap();
        let first_tx = first.local_tx_id();
        let second = set.build_path(&db, &PinnedTerminal(db.all_rcs()[0].id), 0).unwrap();
        let second_tx = second.local_tx_id();
        let router = db.all_rcs()[0].id;

        set.confirm_path(&first_tx, 0, 1_000).unwrap();
        set.confirm_path(&second_tx, 0, 5_000).unwrap();

        let newest = set.get_newest_path_by_router(&router).unwrap();
        assert_eq!(newest.local_tx_id(), second_tx);
        assert_eq!(newest.established_at, 5_000);
    }

    #[test]
    fn death_schedules_rebuild() {
        let db = seeded_nodedb(8);
        let mut set = PathSet::new(1, 4);
        let tx = built_established(&mut set, &db, 0);
        assert!(!set.should_build_more());

        set.mark_path_dead(&tx);
        set.expire(1);
        assert!(set.should_build_more());
    }

    #[test]
    fn manual_rebuild_requests_extra_builds() {
        let db = seeded_nodedb(8);
        let mut set = PathSet::new(1, 4);
        built_established(&mut set, &db, 0);
        assert!(!set.should_build_more());
        set.manual_rebuild(1);
        assert!(set.should_build_more());
        set.build_path(&db, &AnyTerminal, 10).unwrap();
        assert!(!set.should_build_more());
    }

    #[test]
    fn onion_layers_peel_through_transit_chain() {
        let db = seeded_nodedb(8);
        let mut set = PathSet::new(1, 4);
        let tx = built_established(&mut set, &db, 0);
        let path = set.get_path_by_tx_id(&tx).unwrap().clone();

        let msg = RoutingMessage::PathLatency(crate::messages::PathLatencyMessage {
            latency: 0,
            seq: 1,
            sent_at: 42,
        });
        let mut buf = msg.encode_padded().unwrap();
        let y = TunnelNonce::random().unwrap();

        // Apply the client-side layering exactly as send_routing_message does.
        let mut nonces = Vec::new();
        let mut nonce = y;
        for hop in &path.hops {
            nonces.push(nonce);
            nonce = nonce ^ hop.nonce_xor;
        }
        for (hop, n) in path.hops.iter().zip(nonces.iter()).rev() {
            crypto::xchacha20(&mut buf, &hop.key, n);
        }

        // Each relay peels one layer with its own key and received nonce.
        let mut cursor_nonce = y;
        for (i, hop) in path.hops.iter().enumerate() {
            crypto::xchacha20(&mut buf, &hop.key, &cursor_nonce);
            cursor_nonce = cursor_nonce ^ hop.nonce_xor;
            if i == path.hops.len() - 1 {
                assert_eq!(RoutingMessage::decode(&buf).unwrap(), msg);
            } else {
                // Intermediate relays must not see plaintext.
                assert!(RoutingMessage::decode(&buf).is_err());
            }
        }
    }

    #[test]
    fn downstream_peeling_mirrors_relay_encryption() {
        let db = seeded_nodedb(8);
        let mut set = PathSet::new(1, 4);
        let tx = built_established(&mut set, &db, 0);
        let path = set.get_path_by_tx_id(&tx).unwrap().clone();

        let msg = RoutingMessage::DataDiscard(crate::messages::DataDiscardMessage {
            path_id: PathId::random().unwrap(),
            seq: 3,
        });
        let mut buf = msg.encode_padded().unwrap();

        // The terminal hop originates the reply; every relay on the way
        // back adds one layer and rotates the nonce.
        let mut nonce = TunnelNonce::random().unwrap();
        for hop in path.hops.iter().rev() {
            crypto::xchacha20(&mut buf, &hop.key, &nonce);
            nonce = nonce ^ hop.nonce_xor;
        }

        let decoded = path.decrypt_inbound(buf, nonce).unwrap();
        assert_eq!(decoded, msg);
    }
}
