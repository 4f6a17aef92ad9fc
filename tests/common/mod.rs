//! Shared harness for integration tests: an in-process overlay network.
//!
//! Endpoints and relays share one link layer backed by a queue. The
//! harness materializes the relay-side transit hops for every wired path
//! and pumps queued link messages through them, so frames really do get
//! rewritten hop by hop exactly as they would across machines.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use shroud::crypto::{PathId, RouterId};
use shroud::dht::{DhtMessage, RouterContact};
use shroud::endpoint::Endpoint;
use shroud::messages::LinkMessage;
use shroud::path::Path;
use shroud::router::{
    LinkLayer, LogicSender, MemoryNodeDb, NodeDb, PathRegistry, Router, RouterDht, WorkerPool,
};
use shroud::transit::TransitHop;

/// Link layer shared by every node in the test network: messages land in
/// a queue the pump drains, and in a log for assertions.
#[derive(Default)]
pub struct NetLink {
    pub queue: Mutex<VecDeque<(RouterId, LinkMessage)>>,
    pub log: Mutex<Vec<(RouterId, LinkMessage)>>,
}

impl LinkLayer for NetLink {
    fn send_to_or_queue(&self, to: &RouterId, msg: LinkMessage) -> bool {
        self.log.lock().unwrap().push((*to, msg.clone()));
        self.queue.lock().unwrap().push_back((*to, msg));
        true
    }
}

/// Relay-side DHT stub that records every request reaching a relay.
#[derive(Default)]
pub struct RecordingDht {
    pub requests: Mutex<Vec<(PathId, DhtMessage)>>,
}

impl RouterDht for RecordingDht {
    fn relay_request_for_path(&self, rx_id: PathId, msg: &DhtMessage) -> bool {
        self.requests.lock().unwrap().push((rx_id, msg.clone()));
        true
    }
}

impl RecordingDht {
    pub fn clear(&self) {
        self.requests.lock().unwrap().clear();
    }

    pub fn find_intro_requests(&self) -> Vec<shroud::dht::FindIntroMessage> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, msg)| match msg {
                DhtMessage::FindIntro(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn publish_requests(&self) -> Vec<shroud::dht::PublishIntroMessage> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, msg)| match msg {
                DhtMessage::PublishIntro(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum Dir {
    Up,
    Down,
}

enum Edge {
    Hop { chain: usize, index: usize },
    Deliver { endpoint: RouterId, path_tx: PathId },
}

/// The simulated overlay: shared node database, one router facade per
/// relay, and routing state for every wired path.
pub struct TestNet {
    pub link: Arc<NetLink>,
    pub nodedb: Arc<MemoryNodeDb>,
    pub dht: Arc<RecordingDht>,
    relays: HashMap<RouterId, Arc<Router>>,
    chains: Vec<Vec<Arc<TransitHop>>>,
    routes: HashMap<(RouterId, PathId, Dir), Edge>,
    // Keeps relay logic receivers alive so sends never error.
    _logic_rx: Vec<tokio::sync::mpsc::UnboundedReceiver<shroud::endpoint::LogicJob>>,
    logic_txs: Vec<LogicSender>,
}

impl TestNet {
    /// Build a network with `routers` relay contacts in the node db.
    pub fn new(routers: usize) -> Self {
        let nodedb = Arc::new(MemoryNodeDb::new());
        for i in 0..routers {
            let mut id = [0u8; 32];
            id[0] = (i + 1) as u8;
            id[1] = 0x5a;
            nodedb.put_rc(RouterContact {
                id: RouterId(id),
                addrs: vec![format!("203.0.113.{}:1090", i + 1)],
                last_updated: 0,
            });
        }
        Self {
            link: Arc::new(NetLink::default()),
            nodedb,
            dht: Arc::new(RecordingDht::default()),
            relays: HashMap::new(),
            chains: Vec::new(),
            routes: HashMap::new(),
            _logic_rx: Vec::new(),
            logic_txs: Vec::new(),
        }
    }

    /// Construct an endpoint plugged into this network.
    pub fn endpoint(&self, name: &str, client: RouterId) -> Endpoint {
        Endpoint::new(name, client, self.link.clone(), self.nodedb.clone(), self.dht.clone())
    }

    fn relay(&mut self, id: RouterId) -> Arc<Router> {
        if let Some(router) = self.relays.get(&id) {
            return router.clone();
        }
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        self._logic_rx.push(rx);
        self.logic_txs.push(tx.clone());
        let router = Arc::new(Router {
            id,
            link: self.link.clone(),
            nodedb: self.nodedb.clone(),
            dht: self.dht.clone(),
            worker: WorkerPool::pooled("crypto"),
            disk: WorkerPool::serial("disk"),
            logic: tx,
            paths: PathRegistry::new(),
        });
        self.relays.insert(id, router.clone());
        router
    }

    /// Materialize the relay-side state for `path` and index its edges so
    /// the pump can route frames along it in both directions.
    pub fn wire_path(&mut self, path: &Path, client: RouterId) {
        let chain_id = self.chains.len();
        let mut chain = Vec::new();
        for (i, transit) in path.transit_hop_chain(client).into_iter().enumerate() {
            let relay = self.relay(path.hops[i].rc.id);
            let hop = Arc::new(transit);
            // Registration can fail only on id collision, which random
            // 16-byte ids do not produce in tests.
            assert!(relay.paths.register(hop.clone()), "path id collision in test net");
            chain.push(hop);
        }

        let hops = &path.hops;
        self.routes.insert(
            (hops[0].rc.id, path.local_tx_id(), Dir::Up),
            Edge::Hop { chain: chain_id, index: 0 },
        );
        for i in 1..hops.len() {
            self.routes.insert(
                (hops[i].rc.id, hops[i - 1].tx_id, Dir::Up),
                Edge::Hop { chain: chain_id, index: i },
            );
            self.routes.insert(
                (hops[i - 1].rc.id, hops[i].rx_id, Dir::Down),
                Edge::Hop { chain: chain_id, index: i - 1 },
            );
        }
        self.routes.insert(
            (client, hops[0].rx_id, Dir::Down),
            Edge::Deliver { endpoint: client, path_tx: path.local_tx_id() },
        );

        self.chains.push(chain);
    }

    /// Drain the link queue, running every frame through the transit hops
    /// and delivering downstream frames to their endpoints.
    pub fn pump(&mut self, endpoints: &mut HashMap<RouterId, &mut Endpoint>, now: u64) {
        loop {
            let item = self.link.queue.lock().unwrap().pop_front();
            let Some((to, msg)) = item else { break };
            match msg {
                LinkMessage::Upstream(up) => {
                    if let Some(Edge::Hop { chain, index }) =
                        self.routes.get(&(to, up.path_id, Dir::Up))
                    {
                        let hop = self.chains[*chain][*index].clone();
                        let router = self.relays.get(&to).expect("relay for wired hop").clone();
                        hop.handle_upstream(up.payload, up.nonce, &router);
                    }
                }
                LinkMessage::Downstream(down) => {
                    match self.routes.get(&(to, down.path_id, Dir::Down)) {
                        Some(Edge::Hop { chain, index }) => {
                            let hop = self.chains[*chain][*index].clone();
                            let router =
                                self.relays.get(&to).expect("relay for wired hop").clone();
                            hop.handle_downstream(down.payload, down.nonce, &router);
                        }
                        Some(Edge::Deliver { endpoint, path_tx }) => {
                            if let Some(ep) = endpoints.get_mut(endpoint) {
                                ep.handle_inbound_frame(*path_tx, down.payload, down.nonce, now);
                            }
                        }
                        None => {}
                    }
                }
            }
        }
    }

    /// Confirm every building path on the endpoint's own set and wire the
    /// established ones into the network.
    pub fn establish_endpoint_paths(&mut self, ep: &mut Endpoint, client: RouterId, now: u64) {
        ep.tick(now);
        let pending: Vec<PathId> =
            ep.paths().paths().iter().map(|p| p.local_tx_id()).collect();
        for tx in pending {
            ep.handle_path_confirm(tx, 0, now);
        }
        let established: Vec<Path> =
            ep.paths().established().cloned().collect();
        for path in established {
            self.wire_path(&path, client);
        }
    }

    /// Confirm and wire the paths of one outbound context.
    pub fn establish_context_paths(
        &mut self,
        ep: &mut Endpoint,
        addr: &shroud::identity::Address,
        client: RouterId,
        now: u64,
    ) {
        let pending: Vec<PathId> = match ep.outbound_context(addr) {
            Some(ctx) => ctx.paths.paths().iter().map(|p| p.local_tx_id()).collect(),
            None => return,
        };
        for tx in pending {
            ep.handle_path_confirm(tx, 0, now);
        }
        let established: Vec<Path> = match ep.outbound_context(addr) {
            Some(ctx) => ctx.paths.established().cloned().collect(),
            None => return,
        };
        for path in established {
            self.wire_path(&path, client);
        }
    }

    pub fn router_ids(&self) -> Vec<RouterId> {
        self.nodedb.all_rcs().into_iter().map(|rc| rc.id).collect()
    }
}

/// A client-side router id outside the relay contact set.
pub fn client_id(seed: u8) -> RouterId {
    let mut id = [0u8; 32];
    id[0] = 0xc0;
    id[1] = seed;
    RouterId(id)
}
