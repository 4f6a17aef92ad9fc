//! # Router Facade and Collaborator Seams
//!
//! The endpoint core does not own the link layer, the node database, or
//! the relay-side DHT; it consumes them through the traits defined here,
//! wired together in a [`Router`] handed to every component.
//!
//! Also here:
//!
//! - [`WorkerPool`]: job dispatch onto blocking threads. `pooled` gives
//!   the parallel crypto workers; `serial` gives the single disk worker.
//!   Jobs deliver their results by posting typed values onto a logic
//!   channel; nothing mutates endpoint state off the logic task.
//! - [`PathRegistry`]: the relay-side table of transit hops keyed by
//!   `(upstream router, pathID)`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::crypto::{PathId, RouterId};
use crate::dht::{DhtMessage, RouterContact};
use crate::endpoint::LogicJob;
use crate::messages::LinkMessage;
use crate::transit::TransitHop;

/// Sender half of an endpoint's logic queue. Worker jobs and isolated
/// loops post completions here; only the endpoint owner drains it.
pub type LogicSender = mpsc::UnboundedSender<LogicJob>;

// ============================================================================
// Collaborator traits
// ============================================================================

/// The inter-router link layer. Sending may fail under backpressure, in
/// which case the caller sees `false` and may retry at its own layer.
pub trait LinkLayer: Send + Sync {
    fn send_to_or_queue(&self, to: &RouterId, msg: LinkMessage) -> bool;
}

/// Read access to the node database of known router contacts. Mutation
/// happens only through verification jobs on the disk worker.
pub trait NodeDb: Send + Sync {
    fn get_rc(&self, router: &RouterId) -> Option<RouterContact>;
    fn put_rc(&self, rc: RouterContact);
    /// Snapshot of all known contacts, used by hop selection.
    fn all_rcs(&self) -> Vec<RouterContact>;
}

/// Relay-side DHT node, receiving requests that arrive over circuits
/// this relay participates in.
pub trait RouterDht: Send + Sync {
    fn relay_request_for_path(&self, rx_id: PathId, msg: &DhtMessage) -> bool;
}

// ============================================================================
// Worker pools
// ============================================================================

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Dispatches jobs onto blocking threads. Cheap to clone.
#[derive(Clone)]
pub struct WorkerPool {
    tx: mpsc::UnboundedSender<Job>,
    name: &'static str,
}

impl WorkerPool {
    /// A parallel pool: every job runs on its own blocking thread slot.
    pub fn pooled(name: &'static str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                tokio::task::spawn_blocking(job);
            }
        });
        Self { tx, name }
    }

    /// A serial worker: jobs run one at a time in submission order. Used
    /// for disk work so file operations never race.
    pub fn serial(name: &'static str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let _ = tokio::task::spawn_blocking(job).await;
            }
        });
        Self { tx, name }
    }

    /// Queue a job. Returns false when the pool has shut down.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> bool {
        if self.tx.send(Box::new(job)).is_err() {
            warn!(pool = self.name, "worker pool gone, job dropped");
            return false;
        }
        true
    }
}

// ============================================================================
// Transit-hop registry
// ============================================================================

/// Relay-side table of active transit hops, keyed by the upstream router
/// and the path id on the upstream side.
#[derive(Default)]
pub struct PathRegistry {
    hops: Mutex<HashMap<(RouterId, PathId), Arc<TransitHop>>>,
}

impl PathRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transit hop. Fails when either of its path ids would
    /// collide with a hop already registered at this relay.
    pub fn register(&self, hop: Arc<TransitHop>) -> bool {
        let mut hops = self.hops.lock().expect("path registry poisoned");
        let up_key = (hop.info.upstream, hop.info.tx_id);
        let down_key = (hop.info.downstream, hop.info.rx_id);
        if hops.contains_key(&up_key) || hops.contains_key(&down_key) {
            warn!(info = %hop.info, "rejecting transit hop with colliding path id");
            return false;
        }
        hops.insert(up_key, hop.clone());
        hops.insert(down_key, hop);
        true
    }

    /// Look up the hop whose upstream side is `(router, path_id)`.
    pub fn get_by_upstream(&self, router: &RouterId, path_id: &PathId) -> Option<Arc<TransitHop>> {
        let hops = self.hops.lock().expect("path registry poisoned");
        hops.get(&(*router, *path_id))
            .filter(|hop| hop.info.upstream == *router && hop.info.tx_id == *path_id)
            .cloned()
    }

    /// Drop hops whose lifetime has elapsed.
    pub fn expire(&self, now: u64) {
        let mut hops = self.hops.lock().expect("path registry poisoned");
        let before = hops.len();
        hops.retain(|_, hop| !hop.expired(now));
        let dropped = before - hops.len();
        if dropped > 0 {
            debug!(dropped, "expired transit hops");
        }
    }

    pub fn len(&self) -> usize {
        self.hops.lock().expect("path registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Router facade
// ============================================================================

/// Everything a component needs from the router hosting it.
pub struct Router {
    /// This relay's own identity on the overlay.
    pub id: RouterId,
    pub link: Arc<dyn LinkLayer>,
    pub nodedb: Arc<dyn NodeDb>,
    pub dht: Arc<dyn RouterDht>,
    /// Parallel crypto workers.
    pub worker: WorkerPool,
    /// Serial disk worker.
    pub disk: WorkerPool,
    /// The router-logic queue path-lifecycle events are posted to.
    pub logic: LogicSender,
    /// Relay-side transit hops.
    pub paths: PathRegistry,
}

impl Router {
    /// Queue verification of a freshly resolved router contact on the
    /// disk worker; accepted contacts land in the node database.
    pub fn queue_verify_rc(&self, rc: RouterContact) {
        let nodedb = self.nodedb.clone();
        self.disk.submit(move || {
            if rc.id.is_zero() || rc.addrs.is_empty() {
                warn!(router = ?rc.id, "discarding unverifiable router contact");
                return;
            }
            debug!(router = ?rc.id, "router contact verified");
            nodedb.put_rc(rc);
        });
    }
}

// ============================================================================
// In-memory node database
// ============================================================================

/// Map-backed [`NodeDb`] used by standalone deployments and tests.
#[derive(Default)]
pub struct MemoryNodeDb {
    contacts: Mutex<HashMap<RouterId, RouterContact>>,
}

impl MemoryNodeDb {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NodeDb for MemoryNodeDb {
    fn get_rc(&self, router: &RouterId) -> Option<RouterContact> {
        self.contacts.lock().expect("nodedb poisoned").get(router).cloned()
    }

    fn put_rc(&self, rc: RouterContact) {
        self.contacts.lock().expect("nodedb poisoned").insert(rc.id, rc);
    }

    fn all_rcs(&self) -> Vec<RouterContact> {
        self.contacts.lock().expect("nodedb poisoned").values().cloned().collect()
    }
}
