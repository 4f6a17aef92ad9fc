//! # Hidden-Service Endpoint
//!
//! The orchestrator that ties the core together. An [`Endpoint`] owns the
//! local identity, the endpoint-level path set, the conversation table,
//! every in-flight DHT lookup, and the per-remote [`OutboundContext`]s.
//!
//! ## Ownership and concurrency
//!
//! All endpoint state is mutated exclusively through `&mut self` methods
//! driven by one owner task (the router logic). Long-running work runs on
//! the crypto worker pool or the disk worker; results come back as typed
//! [`LogicJob`] values on the logic channel and are applied by
//! [`Endpoint::tick`] or [`Endpoint::process_one_logic_job`]. Nothing
//! else touches the tables.
//!
//! ## Tick duties
//!
//! Each tick: drain worker completions, maintain paths, republish the
//! introset when due, expire pending lookups and router resolutions, run
//! configured prefetches, and tick every outbound context, dropping the
//! ones that report themselves done.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::crypto::{self, PathId, RouterId, SharedSecret, TunnelNonce};
use crate::dht::{
    CachedTagResult, DhtMessage, FindIntroMessage, FindRouterMessage,
    GotIntroMessage, GotRouterMessage, LookupKind, PendingLookup, PendingRouter,
    PublishIntroMessage, ADDRESS_LOOKUP_RECURSION, LOOKUP_TIMEOUT, PUBLISH_REPLICAS,
};
use crate::frame::{self, ProtocolFrame, ProtocolMessage, ProtocolType};
use crate::identity::{Address, SecretIdentity, ServiceInfo};
use crate::introset::{ConvoTag, IntroSet, Introduction, Tag};
use crate::messages::{
    DhtRoutingMessage, PathTransferMessage, RoutingMessage,
};
use crate::netns::IsolatedLogic;
use crate::outbound::OutboundContext;
use crate::path::{AnyTerminal, Path, PathSet};
use crate::router::{LinkLayer, LogicSender, NodeDb, PathRegistry, Router, RouterDht, WorkerPool};

/// Refresh cadence for a healthy introset.
pub const INTROSET_PUBLISH_INTERVAL: u64 = 300_000;

/// Retry cadence while the published introset has expired introductions
/// (or none was ever confirmed).
pub const INTROSET_PUBLISH_RETRY_INTERVAL: u64 = 5_000;

/// Timeout handed to `EnsurePathToService` by the send path.
pub const ENSURE_PATH_TIMEOUT: u64 = 10_000;

/// Conversations idle beyond this are forgotten.
pub const SESSION_IDLE_TIMEOUT: u64 = 30 * 60_000;

/// Cadence of latency probes on established paths.
pub const LATENCY_PROBE_INTERVAL: u64 = 30_000;

/// Established paths the endpoint keeps for its own lookups and publish
/// traffic.
const ENDPOINT_DESIRED_PATHS: usize = 4;
const ENDPOINT_MAX_PATHS: usize = 4;

// ============================================================================
// Logic jobs
// ============================================================================

/// Typed completions hopped from worker threads back onto the endpoint's
/// logic task.
pub enum LogicJob {
    /// An outbound hybrid handshake finished; cache the conversation and
    /// transmit the first frame on the path bound at submit time.
    HandshakeReady {
        addr: Address,
        frame: ProtocolFrame,
        tag: ConvoTag,
        session_key: SharedSecret,
        remote: ServiceInfo,
        remote_intro: Introduction,
        path_tx: PathId,
        dst_path: PathId,
    },
    HandshakeFailed {
        addr: Address,
        reason: String,
    },
    /// A fast-path frame was sealed; transmit it.
    FrameReady {
        addr: Address,
        frame: ProtocolFrame,
        path_tx: PathId,
        dst_path: PathId,
    },
    FrameFailed {
        addr: Address,
        reason: String,
    },
    /// An inbound frame was opened and authenticated on a worker.
    InboundOpened {
        src_path: PathId,
        message: ProtocolMessage,
        /// Present for handshake frames: the freshly derived session key.
        session_key: Option<SharedSecret>,
    },
    /// An inbound frame failed decryption or authentication; dropped.
    InboundRejected {
        src_path: PathId,
        reason: String,
    },
    /// Re-publish the introset (queued by the dead-path check).
    RepublishIntroSet,
}

/// What to do when an address resolution completes or fails.
pub enum PathEnsureHook {
    /// Keep-warm prefetch; nothing further.
    Prefetch,
    /// Flush the pending traffic queue for this address.
    FlushQueued,
    /// Caller-supplied continuation; invoked with success or failure.
    Callback(Box<dyn FnOnce(Address, bool) + Send>),
}

enum InitHook {
    IsolateNetwork,
}

/// One queued payload awaiting an outbound context.
struct PendingBuffer {
    payload: Vec<u8>,
    proto: ProtocolType,
}

/// Conversation state keyed by tag.
#[derive(Default)]
pub struct Session {
    pub remote: Option<ServiceInfo>,
    pub intro: Introduction,
    pub shared_key: SharedSecret,
    pub seqno: u64,
    pub last_used: u64,
}

// ============================================================================
// Endpoint
// ============================================================================

pub struct Endpoint {
    name: String,
    router: Arc<Router>,

    identity: Option<SecretIdentity>,
    keyfile: Option<PathBuf>,
    tag: Tag,
    prefetch_tags: HashSet<Tag>,
    prefetch_addrs: HashSet<Address>,
    netns: Option<String>,
    min_path_latency: Option<u64>,
    on_init: Vec<InitHook>,

    paths: PathSet,
    introset: Option<IntroSet>,
    last_publish: u64,
    last_publish_attempt: u64,
    current_publish_tx: u64,

    sessions: HashMap<ConvoTag, Session>,
    pending_lookups: HashMap<u64, PendingLookup>,
    pending_routers: HashMap<RouterId, PendingRouter>,
    pending_service_lookups: HashMap<Address, PathEnsureHook>,
    pending_traffic: HashMap<Address, VecDeque<PendingBuffer>>,
    prefetched_tags: HashMap<Tag, CachedTagResult>,
    remote_sessions: HashMap<Address, OutboundContext>,
    address_to_service: HashMap<Address, ServiceInfo>,

    logic_tx: LogicSender,
    logic_rx: mpsc::UnboundedReceiver<LogicJob>,
    isolated: Option<IsolatedLogic>,
    txid_fallback: u64,

    inbound: VecDeque<ProtocolMessage>,
    data_handler: Option<Box<dyn FnMut(ProtocolMessage) + Send>>,
}

impl Endpoint {
    /// Wire a new endpoint onto its collaborators. Must run inside a
    /// tokio runtime; the worker pools spawn their dispatchers here.
    pub fn new(
        name: &str,
        id: RouterId,
        link: Arc<dyn LinkLayer>,
        nodedb: Arc<dyn NodeDb>,
        dht: Arc<dyn RouterDht>,
    ) -> Self {
        let (logic_tx, logic_rx) = mpsc::unbounded_channel();
        let router = Arc::new(Router {
            id,
            link,
            nodedb,
            dht,
            worker: WorkerPool::pooled("crypto"),
            disk: WorkerPool::serial("disk"),
            logic: logic_tx.clone(),
            paths: PathRegistry::new(),
        });
        Self {
            name: name.to_owned(),
            router,
            identity: None,
            keyfile: None,
            tag: Tag::default(),
            prefetch_tags: HashSet::new(),
            prefetch_addrs: HashSet::new(),
            netns: None,
            min_path_latency: None,
            on_init: Vec::new(),
            paths: PathSet::new(ENDPOINT_DESIRED_PATHS, ENDPOINT_MAX_PATHS),
            introset: None,
            last_publish: 0,
            last_publish_attempt: 0,
            current_publish_tx: 0,
            sessions: HashMap::new(),
            pending_lookups: HashMap::new(),
            pending_routers: HashMap::new(),
            pending_service_lookups: HashMap::new(),
            pending_traffic: HashMap::new(),
            prefetched_tags: HashMap::new(),
            remote_sessions: HashMap::new(),
            address_to_service: HashMap::new(),
            logic_tx,
            logic_rx,
            isolated: None,
            txid_fallback: 0,
            inbound: VecDeque::new(),
            data_handler: None,
        }
    }

    // ------------------------------------------------------------------
    // Configuration and startup
    // ------------------------------------------------------------------

    /// Apply one configuration option. Unknown keys are accepted silently
    /// for forward compatibility.
    pub fn set_option(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "keyfile" => {
                self.keyfile = Some(PathBuf::from(value));
            }
            "tag" => {
                self.tag = Tag::new(value);
                info!(endpoint = %self.name, tag = value, "setting tag");
            }
            "prefetch-tag" => {
                self.prefetch_tags.insert(Tag::new(value));
            }
            "prefetch-addr" => match parse_address(value) {
                Some(addr) => {
                    self.prefetch_addrs.insert(addr);
                }
                None => warn!(endpoint = %self.name, value, "ignoring unparseable prefetch-addr"),
            },
            "netns" => {
                if !cfg!(target_os = "linux") {
                    anyhow::bail!("network namespace isolation requires linux");
                }
                self.netns = Some(value.to_owned());
                self.on_init.push(InitHook::IsolateNetwork);
            }
            "min-latency" => {
                if let Ok(val) = value.parse::<u64>() {
                    if val > 0 {
                        self.min_path_latency = Some(val);
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Load or generate the identity and run queued init hooks. The first
    /// failing hook aborts startup.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        let identity = match self.keyfile.clone() {
            Some(path) => {
                // Identity persistence belongs to the disk worker.
                tokio::task::spawn_blocking(move || SecretIdentity::ensure_keys(&path))
                    .await
                    .context("disk worker failed")??
            }
            None => SecretIdentity::regenerate().context("key generation failed")?,
        };
        info!(endpoint = %self.name, addr = %identity.public().name(), "endpoint identity ready");
        self.identity = Some(identity);

        for hook in std::mem::take(&mut self.on_init) {
            match hook {
                InitHook::IsolateNetwork => {
                    let name = self.netns.clone().unwrap_or_default();
                    let isolated = IsolatedLogic::spawn(&name, self.logic_tx.clone())
                        .with_context(|| format!("failed to isolate into netns {:?}", name))?;
                    self.isolated = Some(isolated);
                }
            }
        }
        Ok(())
    }

    /// Route inbound payloads somewhere other than the internal queue.
    pub fn set_data_handler(&mut self, handler: Box<dyn FnMut(ProtocolMessage) + Send>) {
        self.data_handler = Some(handler);
    }

    // ------------------------------------------------------------------
    // Small accessors
    // ------------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn identity(&self) -> Option<&SecretIdentity> {
        self.identity.as_ref()
    }

    pub fn introset(&self) -> Option<&IntroSet> {
        self.introset.as_ref()
    }

    pub fn paths(&self) -> &PathSet {
        &self.paths
    }

    pub fn paths_mut(&mut self) -> &mut PathSet {
        &mut self.paths
    }

    pub fn last_publish(&self) -> u64 {
        self.last_publish
    }

    pub fn last_publish_attempt(&self) -> u64 {
        self.last_publish_attempt
    }

    pub fn current_publish_tx(&self) -> u64 {
        self.current_publish_tx
    }

    pub fn pending_lookup_count(&self) -> usize {
        self.pending_lookups.len()
    }

    pub fn pending_lookup_txids(&self) -> Vec<u64> {
        self.pending_lookups.keys().copied().collect()
    }

    pub fn pending_router_count(&self) -> usize {
        self.pending_routers.len()
    }

    pub fn outbound_context(&self, addr: &Address) -> Option<&OutboundContext> {
        self.remote_sessions.get(addr)
    }

    pub fn outbound_context_mut(&mut self, addr: &Address) -> Option<&mut OutboundContext> {
        self.remote_sessions.get_mut(addr)
    }

    pub fn cached_tag_result(&self, tag: &Tag) -> Option<&CachedTagResult> {
        self.prefetched_tags.get(tag)
    }

    pub fn has_path_to_service(&self, addr: &Address) -> bool {
        self.remote_sessions.contains_key(addr)
    }

    pub fn has_pending_path_to_service(&self, addr: &Address) -> bool {
        self.pending_service_lookups.contains_key(addr)
    }

    /// Pop one delivered inbound message.
    pub fn poll_inbound(&mut self) -> Option<ProtocolMessage> {
        self.inbound.pop_front()
    }

    /// Sender for worker completions dispatched on the router logic.
    pub fn logic_sender(&self) -> LogicSender {
        self.logic_tx.clone()
    }

    /// Sender for inbound-frame completions: the isolated loop when
    /// network isolation is active, the router logic otherwise.
    pub fn endpoint_logic(&self) -> LogicSender {
        match &self.isolated {
            Some(isolated) => isolated.sender(),
            None => self.logic_tx.clone(),
        }
    }

    pub fn network_is_isolated(&self) -> bool {
        self.isolated.is_some()
    }

    // ------------------------------------------------------------------
    // Transaction ids and lookups
    // ------------------------------------------------------------------

    /// Mint a transaction id distinct from every outstanding lookup.
    pub fn gen_txid(&mut self) -> u64 {
        self.txid_fallback = self.txid_fallback.wrapping_add(1);
        let mut txid = crypto::random_u64().unwrap_or(self.txid_fallback);
        while self.pending_lookups.contains_key(&txid) {
            txid = txid.wrapping_add(1);
        }
        txid
    }

    pub fn register_lookup(&mut self, lookup: PendingLookup) {
        self.pending_lookups.insert(lookup.txid, lookup);
    }

    // ------------------------------------------------------------------
    // Conversation table
    // ------------------------------------------------------------------

    pub fn put_sender_for(&mut self, tag: &ConvoTag, info: ServiceInfo, now: u64) {
        let session = self.sessions.entry(*tag).or_default();
        session.remote = Some(info);
        session.last_used = now;
    }

    pub fn get_sender_for(&self, tag: &ConvoTag) -> Option<ServiceInfo> {
        self.sessions.get(tag).and_then(|s| s.remote.clone())
    }

    pub fn put_intro_for(&mut self, tag: &ConvoTag, intro: Introduction, now: u64) {
        let session = self.sessions.entry(*tag).or_default();
        session.intro = intro;
        session.last_used = now;
    }

    pub fn get_intro_for(&self, tag: &ConvoTag) -> Option<Introduction> {
        self.sessions.get(tag).map(|s| s.intro)
    }

    pub fn put_cached_session_key_for(&mut self, tag: &ConvoTag, key: SharedSecret, now: u64) {
        let session = self.sessions.entry(*tag).or_default();
        session.shared_key = key;
        session.last_used = now;
    }

    pub fn get_cached_session_key_for(&self, tag: &ConvoTag) -> Option<SharedSecret> {
        self.sessions
            .get(tag)
            .filter(|s| !s.shared_key.is_zero())
            .map(|s| s.shared_key.clone())
    }

    /// Tags of every conversation with `info`.
    pub fn get_convo_tags_for_service(&self, info: &ServiceInfo) -> Vec<ConvoTag> {
        self.sessions
            .iter()
            .filter(|(_, s)| s.remote.as_ref() == Some(info))
            .map(|(tag, _)| *tag)
            .collect()
    }

    /// Post-increment the per-conversation sequence counter. Unknown tags
    /// read zero.
    pub fn get_seq_no_for_convo(&mut self, tag: &ConvoTag) -> u64 {
        match self.sessions.get_mut(tag) {
            Some(session) => {
                let seq = session.seqno;
                session.seqno += 1;
                seq
            }
            None => 0,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Remember which service answers at `addr` so replies can reuse the
    /// conversation.
    pub fn ensure_reply_path(&mut self, sender: ServiceInfo) {
        self.address_to_service.entry(sender.addr()).or_insert(sender);
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Send `data` to `remote`, or queue it while a context is built.
    pub fn send_to_or_queue(
        &mut self,
        remote: Address,
        data: &[u8],
        proto: ProtocolType,
        now: u64,
    ) -> bool {
        // Reply fast path: a known service with an open conversation.
        if let Some(service) = self.address_to_service.get(&remote).cloned() {
            return self.send_via_existing_convo(remote, &service, data, proto, now);
        }

        if self.remote_sessions.contains_key(&remote) {
            debug!(endpoint = %self.name, addr = %remote, bytes = data.len(), "send via session");
            if let Some(mut ctx) = self.remote_sessions.remove(&remote) {
                ctx.async_encrypt_and_send_to(self, data.to_vec(), proto, now);
                self.remote_sessions.insert(remote, ctx);
            }
            return true;
        }

        let first_for_addr = !self.pending_traffic.contains_key(&remote);
        self.pending_traffic
            .entry(remote)
            .or_default()
            .push_back(PendingBuffer { payload: data.to_vec(), proto });
        if first_for_addr
            && !self.ensure_path_to_service(remote, PathEnsureHook::FlushQueued, ENSURE_PATH_TIMEOUT, now)
        {
            warn!(endpoint = %self.name, addr = %remote, "failed to start service lookup for queued send");
        }
        true
    }

    fn send_via_existing_convo(
        &mut self,
        remote: Address,
        service: &ServiceInfo,
        data: &[u8],
        proto: ProtocolType,
        now: u64,
    ) -> bool {
        let tags = self.get_convo_tags_for_service(service);
        if tags.is_empty() {
            error!(endpoint = %self.name, addr = %remote, "no conversation tag");
            return false;
        }
        let mut chosen: Option<(ConvoTag, Introduction, Path)> = None;
        for tag in tags {
            let Some(intro) = self.get_intro_for(&tag) else { continue };
            if intro.expires_soon(now) {
                continue;
            }
            if let Some(path) = self.paths.get_path_by_router(&intro.router).cloned() {
                chosen = Some((tag, intro, path));
                break;
            }
        }
        let Some((tag, intro, path)) = chosen else {
            error!(endpoint = %self.name, addr = %remote, "no usable path for reply");
            return false;
        };
        let Some(session_key) = self.get_cached_session_key_for(&tag) else {
            error!(endpoint = %self.name, addr = %remote, "no cached session key");
            return false;
        };
        let Some(identity) = self.identity.clone() else {
            error!(endpoint = %self.name, "identity not loaded");
            return false;
        };

        let seq = self.get_seq_no_for_convo(&tag);
        let message = ProtocolMessage {
            proto,
            tag,
            sender: identity.public().clone(),
            intro_reply: path.intro,
            version: frame::PROTOCOL_VERSION,
            payload: data.to_vec(),
        };
        let logic = self.logic_tx.clone();
        let (path_tx, dst_path) = (path.local_tx_id(), intro.path_id);
        self.router.worker.submit(move || {
            match frame::seal_on_session(&identity, &message, &session_key, seq) {
                Ok(sealed) => {
                    let _ = logic.send(LogicJob::FrameReady {
                        addr: remote,
                        frame: sealed,
                        path_tx,
                        dst_path,
                    });
                }
                Err(e) => {
                    let _ = logic.send(LogicJob::FrameFailed { addr: remote, reason: e.to_string() });
                }
            }
        });
        true
    }

    /// Idempotently arrange for an outbound context to `remote`.
    pub fn ensure_path_to_service(
        &mut self,
        remote: Address,
        hook: PathEnsureHook,
        timeout_ms: u64,
        now: u64,
    ) -> bool {
        let Some(path) = self
            .paths
            .get_established_path_closest_to(remote.to_router().as_bytes())
            .cloned()
        else {
            warn!(endpoint = %self.name, "no outbound path for lookup yet");
            return false;
        };

        if self.remote_sessions.contains_key(&remote) {
            self.run_hook_success(remote, hook, now);
            return true;
        }
        if self.pending_service_lookups.contains_key(&remote) {
            warn!(endpoint = %self.name, addr = %remote, "duplicate pending service lookup");
            return false;
        }

        let txid = self.gen_txid();
        let msg = RoutingMessage::Dht(DhtRoutingMessage {
            messages: vec![DhtMessage::FindIntro(FindIntroMessage {
                tag: Tag::default(),
                address: remote,
                recursion: ADDRESS_LOOKUP_RECURSION,
                txid,
            })],
            seq: 0,
        });
        if !path.send_routing_message(&msg, &self.router) {
            error!(endpoint = %self.name, addr = %remote, "service lookup send failed");
            return false;
        }
        info!(endpoint = %self.name, addr = %remote, txid, "ensure path to service");
        self.pending_service_lookups.insert(remote, hook);
        self.register_lookup(PendingLookup {
            txid,
            name: "HSLookup",
            issued: now,
            timeout: timeout_ms,
            kind: LookupKind::Address(remote),
        });
        true
    }

    /// Resolve a router contact unless it is already known or in flight.
    pub fn ensure_router_is_known(&mut self, router: RouterId, now: u64) {
        if router.is_zero() {
            return;
        }
        if self.router.nodedb.get_rc(&router).is_some() {
            return;
        }
        if self.pending_routers.contains_key(&router) {
            return;
        }
        let Some(path) = self
            .paths
            .get_established_path_closest_to(router.as_bytes())
            .cloned()
        else {
            debug!(endpoint = %self.name, "no path for router lookup yet");
            return;
        };
        let txid = self.gen_txid();
        let msg = RoutingMessage::Dht(DhtRoutingMessage {
            messages: vec![DhtMessage::FindRouter(FindRouterMessage {
                flags: 0,
                key: router,
                txid,
            })],
            seq: 0,
        });
        if path.send_routing_message(&msg, &self.router) {
            info!(endpoint = %self.name, router = ?router, "looking up router");
            self.pending_routers.insert(router, PendingRouter::new(now));
        } else {
            error!(endpoint = %self.name, "failed to send request for router lookup");
        }
    }

    // ------------------------------------------------------------------
    // Publish pipeline
    // ------------------------------------------------------------------

    fn should_publish_descriptors(&self, now: u64) -> bool {
        if self.identity.is_none() {
            return false;
        }
        match &self.introset {
            Some(introset) if !introset.has_expired_intros(now) => {
                now.saturating_sub(self.last_publish_attempt) >= INTROSET_PUBLISH_INTERVAL
            }
            _ => now.saturating_sub(self.last_publish_attempt) >= INTROSET_PUBLISH_RETRY_INTERVAL,
        }
    }

    /// Collect current introductions, sign a fresh introset, and publish
    /// it via two paths.
    pub fn regen_and_publish_introset(&mut self, now: u64) {
        let Some(identity) = self.identity.clone() else {
            warn!(endpoint = %self.name, "cannot publish before start");
            return;
        };
        let intros: Vec<Introduction> = self.paths.established().map(|p| p.intro).collect();
        if intros.is_empty() {
            warn!(
                endpoint = %self.name,
                "could not publish introset, no introductions"
            );
            if self.paths.should_build_more() {
                self.paths.manual_rebuild(1);
            }
            return;
        }
        let keep: Vec<Introduction> =
            intros.into_iter().filter(|i| !i.expires_soon(now)).collect();
        if keep.is_empty() {
            warn!(endpoint = %self.name, "not enough introductions to publish");
            return;
        }

        let mut introset = IntroSet::new(identity.public().clone(), identity.pq_public().clone());
        introset.intros = keep;
        introset.topic = self.tag;
        identity.sign_introset(&mut introset);
        self.introset = Some(introset.clone());

        if self.publish_introset(introset, now) {
            info!(endpoint = %self.name, "(re)publishing introset");
        } else {
            warn!(endpoint = %self.name, "failed to publish introset");
        }
    }

    /// One publish transaction, replicated via the path closest to our
    /// own address and one random path.
    fn publish_introset(&mut self, introset: IntroSet, now: u64) -> bool {
        let Some(own_addr) = self.identity.as_ref().map(|i| i.public().addr()) else {
            return false;
        };
        let Some(near) = self
            .paths
            .get_established_path_closest_to(own_addr.as_bytes())
            .cloned()
        else {
            return false;
        };

        let txid = self.gen_txid();
        let msg = RoutingMessage::Dht(DhtRoutingMessage {
            messages: vec![DhtMessage::PublishIntro(PublishIntroMessage {
                introset,
                replicas: PUBLISH_REPLICAS,
                txid,
            })],
            seq: 0,
        });
        if !near.send_routing_message(&msg, &self.router) {
            return false;
        }
        self.current_publish_tx = txid;
        self.last_publish_attempt = now;
        self.register_lookup(PendingLookup {
            txid,
            name: "PublishIntroSet",
            issued: now,
            timeout: LOOKUP_TIMEOUT,
            kind: LookupKind::PublishConfirm,
        });

        match self.paths.pick_random_established_path().cloned() {
            Some(far) => far.send_routing_message(&msg, &self.router),
            None => false,
        }
    }

    fn introset_published(&mut self, now: u64) {
        self.last_publish = now;
        // The confirmation consumed this transaction.
        self.pending_lookups.remove(&self.current_publish_tx);
        info!(endpoint = %self.name, "introset publish confirmed");
    }

    fn introset_publish_fail(&mut self, _now: u64) {
        // Retry is governed by the publish cadence.
        warn!(endpoint = %self.name, "introset publish failed");
    }

    // ------------------------------------------------------------------
    // DHT response handling
    // ------------------------------------------------------------------

    /// Apply a `GotIntroMessage` that arrived on one of our paths.
    pub fn handle_got_intro(&mut self, msg: &GotIntroMessage, now: u64) -> bool {
        let our_info = self.identity.as_ref().map(|i| i.public().clone());
        let mut remote: Vec<IntroSet> = Vec::new();

        for introset in &msg.introsets {
            if !introset.verify() {
                if our_info.as_ref() == Some(&introset.service)
                    && self.current_publish_tx == msg.txid
                {
                    // A mangled echo of our own publish.
                    self.introset_publish_fail(now);
                } else if let Some(lookup) = self.pending_lookups.remove(&msg.txid) {
                    // One bad signature poisons the whole response.
                    self.complete_lookup(lookup, Vec::new(), now);
                } else {
                    warn!(endpoint = %self.name, txid = msg.txid, "invalid lookup response");
                }
                return true;
            }
            if our_info.as_ref() == Some(&introset.service) && self.current_publish_tx == msg.txid {
                self.introset_published(now);
                return true;
            }
            remote.push(introset.clone());
        }

        let Some(lookup) = self.pending_lookups.remove(&msg.txid) else {
            warn!(endpoint = %self.name, txid = msg.txid, "lookup response with no pending entry");
            return true;
        };
        self.complete_lookup(lookup, remote, now);
        true
    }

    /// Apply a `GotRouterMessage`: single-contact responses matching a
    /// pending resolution are queued for verification on the disk worker.
    pub fn handle_got_router(&mut self, msg: &GotRouterMessage) -> bool {
        if msg.routers.len() != 1 {
            return false;
        }
        let rc = msg.routers[0].clone();
        if self.pending_routers.remove(&rc.id).is_none() {
            return false;
        }
        self.router.queue_verify_rc(rc);
        true
    }

    fn complete_lookup(&mut self, lookup: PendingLookup, results: Vec<IntroSet>, now: u64) {
        match lookup.kind {
            LookupKind::PublishConfirm => {
                if results.is_empty() {
                    self.introset_publish_fail(now);
                } else {
                    self.introset_published(now);
                }
            }
            LookupKind::Address(addr) => {
                let introset = results.into_iter().next();
                self.on_address_lookup_result(addr, introset, now);
            }
            LookupKind::TagResult(tag) => {
                if let Some(cache) = self.prefetched_tags.get_mut(&tag) {
                    cache.handle_response(results, now);
                }
            }
        }
    }

    fn on_address_lookup_result(&mut self, addr: Address, introset: Option<IntroSet>, now: u64) {
        match introset {
            None => {
                if let Some(mut ctx) = self.remote_sessions.remove(&addr) {
                    ctx.on_intro_set_update(self, None, now);
                    self.remote_sessions.insert(addr, ctx);
                }
                if let Some(hook) = self.pending_service_lookups.remove(&addr) {
                    self.run_hook_failure(addr, hook);
                }
            }
            Some(introset) => {
                if let Some(mut ctx) = self.remote_sessions.remove(&addr) {
                    ctx.on_intro_set_update(self, Some(introset), now);
                    self.remote_sessions.insert(addr, ctx);
                } else {
                    self.put_new_outbound_context(introset, now);
                }
                // The hook is removed before it runs so its own sends see
                // a consistent pending table.
                if let Some(hook) = self.pending_service_lookups.remove(&addr) {
                    self.run_hook_success(addr, hook, now);
                }
            }
        }
    }

    fn put_new_outbound_context(&mut self, introset: IntroSet, now: u64) {
        let addr = introset.service.addr();
        if !self.remote_sessions.contains_key(&addr) {
            info!(endpoint = %self.name, addr = %addr, "created new outbound context");
            self.remote_sessions.insert(addr, OutboundContext::new(introset, now));
            // Kick the first round of path builds toward the remote.
            if let Some(mut ctx) = self.remote_sessions.remove(&addr) {
                ctx.tick(self, now);
                self.remote_sessions.insert(addr, ctx);
            }
        }
    }

    fn run_hook_success(&mut self, addr: Address, hook: PathEnsureHook, now: u64) {
        match hook {
            PathEnsureHook::Prefetch => {}
            PathEnsureHook::FlushQueued => {
                let queued = self.pending_traffic.remove(&addr).unwrap_or_default();
                if let Some(mut ctx) = self.remote_sessions.remove(&addr) {
                    for buffered in queued {
                        ctx.async_encrypt_and_send_to(self, buffered.payload, buffered.proto, now);
                    }
                    self.remote_sessions.insert(addr, ctx);
                }
            }
            PathEnsureHook::Callback(callback) => callback(addr, true),
        }
    }

    fn run_hook_failure(&mut self, addr: Address, hook: PathEnsureHook) {
        let dropped = self.pending_traffic.remove(&addr).map(|q| q.len()).unwrap_or(0);
        if dropped > 0 {
            warn!(endpoint = %self.name, addr = %addr, dropped, "dropping queued traffic, lookup failed");
        }
        match hook {
            PathEnsureHook::Prefetch | PathEnsureHook::FlushQueued => {
                warn!(endpoint = %self.name, addr = %addr, "failed to obtain outbound context within timeout");
            }
            PathEnsureHook::Callback(callback) => callback(addr, false),
        }
    }

    // ------------------------------------------------------------------
    // Inbound path traffic
    // ------------------------------------------------------------------

    /// Entry point for a downstream frame delivered on one of our paths,
    /// addressed by the path's client-side tx id.
    pub fn handle_inbound_frame(
        &mut self,
        path_tx: PathId,
        payload: Vec<u8>,
        nonce: TunnelNonce,
        now: u64,
    ) -> bool {
        let path = self
            .paths
            .get_path_by_tx_id(&path_tx)
            .cloned()
            .or_else(|| {
                self.remote_sessions
                    .values()
                    .find_map(|ctx| ctx.paths.get_path_by_tx_id(&path_tx).cloned())
            });
        let Some(path) = path else {
            debug!(endpoint = %self.name, "inbound frame for unknown path");
            return false;
        };

        let buf = path.peel_inbound(payload, nonce);
        match RoutingMessage::decode(&buf) {
            Ok(msg) => self.handle_routing_message(&path, msg, now),
            Err(_) => {
                // Not a routing message: hidden-service frames arrive on
                // the path as bare protocol frames.
                match crate::bencode::Item::parse_prefix(&buf)
                    .ok()
                    .and_then(|(item, _)| ProtocolFrame::decode(&item).ok())
                {
                    Some(frame) => self.handle_hidden_service_frame(path.local_rx_id(), frame),
                    None => {
                        debug!(endpoint = %self.name, "dropping undecodable inbound frame");
                        false
                    }
                }
            }
        }
    }

    fn handle_routing_message(&mut self, path: &Path, msg: RoutingMessage, now: u64) -> bool {
        match msg {
            RoutingMessage::PathConfirm(confirm) => {
                self.handle_path_confirm(path.local_tx_id(), confirm.lifetime, now)
            }
            RoutingMessage::PathLatency(latency) => {
                if latency.latency == 0 {
                    return false;
                }
                let sample = now.saturating_sub(latency.latency);
                self.handle_path_latency(path.local_tx_id(), sample, now);
                true
            }
            RoutingMessage::DataDiscard(discard) => {
                self.handle_data_drop(path, discard.path_id, discard.seq, now)
            }
            RoutingMessage::Dht(dht) => {
                let mut handled = true;
                for message in dht.messages {
                    handled &= match message {
                        DhtMessage::GotIntro(got) => self.handle_got_intro(&got, now),
                        DhtMessage::GotRouter(got) => self.handle_got_router(&got),
                        other => {
                            warn!(endpoint = %self.name, msg = ?other, "unexpected dht request on client path");
                            false
                        }
                    };
                }
                handled
            }
            RoutingMessage::PathTransfer(_) => {
                warn!(endpoint = %self.name, "unexpected path transfer at client");
                false
            }
        }
    }

    /// A build confirmation arrived on a path (ours or a context's).
    pub fn handle_path_confirm(&mut self, path_tx: PathId, lifetime: u64, now: u64) -> bool {
        if self.paths.confirm_path(&path_tx, lifetime, now).is_some() {
            self.handle_path_built(now);
            return true;
        }
        for ctx in self.remote_sessions.values_mut() {
            if ctx.paths.confirm_path(&path_tx, lifetime, now).is_some() {
                return true;
            }
        }
        false
    }

    /// An endpoint-level path came up: advertise it.
    fn handle_path_built(&mut self, now: u64) {
        self.regen_and_publish_introset(now);
    }

    /// Apply a latency sample and run the dead-path check.
    pub fn handle_path_latency(&mut self, path_tx: PathId, sample: u64, _now: u64) {
        self.paths.record_latency(&path_tx, sample);
        for ctx in self.remote_sessions.values_mut() {
            ctx.paths.record_latency(&path_tx, sample);
        }
        if self.check_path_is_dead(path_tx, sample) {
            debug!(endpoint = %self.name, sample, "path failed latency check");
        }
    }

    /// Paths at or above the configured minimum latency die, and the
    /// introset is re-published from the logic queue.
    fn check_path_is_dead(&mut self, path_tx: PathId, latency: u64) -> bool {
        let Some(min) = self.min_path_latency else {
            return false;
        };
        if latency < min {
            return false;
        }
        let _ = self.logic_tx.send(LogicJob::RepublishIntroSet);
        if !self.paths.mark_path_dead(&path_tx) {
            for ctx in self.remote_sessions.values_mut() {
                if ctx.paths.mark_path_dead(&path_tx) {
                    break;
                }
            }
        }
        true
    }

    /// A relay discarded our traffic on `path` for destination `dst`.
    pub fn handle_data_drop(&mut self, path: &Path, dst: PathId, seq: u64, now: u64) -> bool {
        let endpoint_router = path.endpoint_router();
        // Route to the owning context when one exists.
        let owner = self
            .remote_sessions
            .iter()
            .find(|(_, ctx)| ctx.paths.get_path_by_tx_id(&path.local_tx_id()).is_some())
            .map(|(addr, _)| *addr);
        match owner {
            Some(addr) => {
                if let Some(mut ctx) = self.remote_sessions.remove(&addr) {
                    ctx.handle_data_drop(self, endpoint_router, dst, seq, now);
                    self.remote_sessions.insert(addr, ctx);
                }
                true
            }
            None => {
                warn!(
                    endpoint = %self.name,
                    seq,
                    via = ?dst,
                    by = ?endpoint_router,
                    "message dropped by relay"
                );
                true
            }
        }
    }

    /// Dispatch decrypt-and-verify of an inbound protocol frame to the
    /// crypto workers; the completion lands on the endpoint logic.
    pub fn handle_hidden_service_frame(&mut self, src_path: PathId, frame: ProtocolFrame) -> bool {
        let logic = self.endpoint_logic();
        if frame.is_handshake() {
            let Some(identity) = self.identity.clone() else {
                return false;
            };
            return self.router.worker.submit(move || {
                match frame::accept_conversation(&identity, &frame) {
                    Ok(inbound) => {
                        let _ = logic.send(LogicJob::InboundOpened {
                            src_path,
                            message: inbound.message,
                            session_key: Some(inbound.session_key),
                        });
                    }
                    Err(e) => {
                        let _ = logic.send(LogicJob::InboundRejected {
                            src_path,
                            reason: e.to_string(),
                        });
                    }
                }
            });
        }

        let Some(sender) = self.get_sender_for(&frame.tag) else {
            warn!(endpoint = %self.name, tag = ?frame.tag, "frame for unknown conversation");
            return false;
        };
        let Some(session_key) = self.get_cached_session_key_for(&frame.tag) else {
            warn!(endpoint = %self.name, tag = ?frame.tag, "no cached session key for frame");
            return false;
        };
        self.router.worker.submit(move || {
            match frame::open_on_session(&frame, &sender, &session_key) {
                Ok(message) => {
                    let _ = logic.send(LogicJob::InboundOpened {
                        src_path,
                        message,
                        session_key: None,
                    });
                }
                Err(e) => {
                    let _ = logic.send(LogicJob::InboundRejected {
                        src_path,
                        reason: e.to_string(),
                    });
                }
            }
        })
    }

    fn handle_data_message(&mut self, src_path: PathId, message: ProtocolMessage, now: u64) {
        let _ = src_path;
        self.put_intro_for(&message.tag, message.intro_reply, now);
        self.put_sender_for(&message.tag, message.sender.clone(), now);
        self.ensure_reply_path(message.sender.clone());
        match &mut self.data_handler {
            Some(handler) => handler(message),
            None => self.inbound.push_back(message),
        }
    }

    // ------------------------------------------------------------------
    // Logic queue
    // ------------------------------------------------------------------

    /// Apply every completion currently queued.
    pub fn drain_logic_jobs(&mut self, now: u64) {
        while let Ok(job) = self.logic_rx.try_recv() {
            self.process_logic_job(job, now);
        }
    }

    /// Await and apply one completion; used by owners that block on
    /// worker results.
    pub async fn process_one_logic_job(&mut self, now: u64) -> bool {
        match self.logic_rx.recv().await {
            Some(job) => {
                self.process_logic_job(job, now);
                true
            }
            None => false,
        }
    }

    fn process_logic_job(&mut self, job: LogicJob, now: u64) {
        match job {
            LogicJob::HandshakeReady {
                addr,
                frame,
                tag,
                session_key,
                remote,
                remote_intro,
                path_tx,
                dst_path,
            } => {
                self.put_cached_session_key_for(&tag, session_key, now);
                self.put_intro_for(&tag, remote_intro, now);
                self.put_sender_for(&tag, remote, now);
                if let Some(session) = self.sessions.get_mut(&tag) {
                    // The handshake frame consumed sequence zero.
                    session.seqno = 1;
                }
                if let Some(ctx) = self.remote_sessions.get_mut(&addr) {
                    ctx.on_conversation_established(now);
                }
                self.transmit_frame(addr, frame, path_tx, dst_path);
                // Anything queued behind the handshake rides the session.
                if let Some(mut ctx) = self.remote_sessions.remove(&addr) {
                    ctx.flush_pending(self, now);
                    self.remote_sessions.insert(addr, ctx);
                }
            }
            LogicJob::HandshakeFailed { addr, reason } => {
                error!(endpoint = %self.name, addr = %addr, reason, "handshake failed");
            }
            LogicJob::FrameReady { addr, frame, path_tx, dst_path } => {
                self.transmit_frame(addr, frame, path_tx, dst_path);
            }
            LogicJob::FrameFailed { addr, reason } => {
                error!(endpoint = %self.name, addr = %addr, reason, "failed to encrypt and sign");
            }
            LogicJob::InboundOpened { src_path, message, session_key } => {
                if let Some(key) = session_key {
                    self.put_cached_session_key_for(&message.tag, key, now);
                }
                self.handle_data_message(src_path, message, now);
            }
            LogicJob::InboundRejected { src_path, reason } => {
                debug!(endpoint = %self.name, src = ?src_path, reason, "dropped inbound frame");
            }
            LogicJob::RepublishIntroSet => {
                self.regen_and_publish_introset(now);
            }
        }
    }

    /// Wrap a sealed frame in a path transfer and transmit it on the path
    /// bound at submit time. A path that died in the meantime drops the
    /// frame.
    fn transmit_frame(
        &mut self,
        addr: Address,
        frame: ProtocolFrame,
        path_tx: PathId,
        dst_path: PathId,
    ) -> bool {
        let path = self
            .remote_sessions
            .get(&addr)
            .and_then(|ctx| ctx.paths.get_path_by_tx_id(&path_tx).cloned())
            .or_else(|| self.paths.get_path_by_tx_id(&path_tx).cloned());
        let Some(path) = path else {
            error!(endpoint = %self.name, addr = %addr, "bound path gone, dropping frame");
            return false;
        };
        let Ok(nonce) = TunnelNonce::random() else {
            error!(endpoint = %self.name, "failed to draw transfer nonce");
            return false;
        };
        let seq = frame.seq;
        let transfer = RoutingMessage::PathTransfer(PathTransferMessage {
            path_id: dst_path,
            frame,
            nonce,
            seq,
        });
        if !path.send_routing_message(&transfer, &self.router) {
            warn!(endpoint = %self.name, addr = %addr, "failed to send routing message for data");
            return false;
        }
        true
    }

    // ------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------

    pub fn tick(&mut self, now: u64) {
        self.drain_logic_jobs(now);

        // Path maintenance for the endpoint's own set.
        self.paths.expire(now);
        while self.paths.should_build_more() {
            if self
                .paths
                .build_path(self.router.nodedb.as_ref(), &AnyTerminal, now)
                .is_err()
            {
                break;
            }
        }
        self.probe_path_latency(now);

        if self.should_publish_descriptors(now) {
            self.regen_and_publish_introset(now);
        }

        // Expire pending lookups; each handler fires exactly once with an
        // empty result.
        let timed_out: Vec<u64> = self
            .pending_lookups
            .iter()
            .filter(|(_, lookup)| lookup.timed_out(now))
            .map(|(txid, _)| *txid)
            .collect();
        for txid in timed_out {
            if let Some(lookup) = self.pending_lookups.remove(&txid) {
                info!(endpoint = %self.name, name = lookup.name, txid, "lookup timed out");
                self.complete_lookup(lookup, Vec::new(), now);
            }
        }

        // Expire pending router resolutions.
        let name = self.name.clone();
        self.pending_routers.retain(|router, job| {
            if job.expired(now) {
                info!(endpoint = %name, router = ?router, "router lookup timed out");
                false
            } else {
                true
            }
        });

        // Keep-warm addresses.
        for addr in self.prefetch_addrs.clone() {
            if self.has_path_to_service(&addr) || self.has_pending_path_to_service(&addr) {
                continue;
            }
            if !self.ensure_path_to_service(addr, PathEnsureHook::Prefetch, ENSURE_PATH_TIMEOUT, now)
            {
                warn!(endpoint = %self.name, addr = %addr, "failed to ensure path to prefetch addr");
            }
        }

        // Keep-warm topic tags.
        for tag in self.prefetch_tags.clone() {
            self.prefetched_tags.entry(tag).or_insert_with(|| CachedTagResult::new(tag));

            let cached_addrs: Vec<Address> = self.prefetched_tags[&tag]
                .result
                .iter()
                .map(|introset| introset.service.addr())
                .collect();
            for addr in cached_addrs {
                if self.has_path_to_service(&addr) || self.has_pending_path_to_service(&addr) {
                    continue;
                }
                if !self.ensure_path_to_service(addr, PathEnsureHook::Prefetch, ENSURE_PATH_TIMEOUT, now)
                {
                    warn!(endpoint = %self.name, addr = %addr, tag = ?tag, "failed to ensure path for tag");
                }
            }

            if let Some(cache) = self.prefetched_tags.get_mut(&tag) {
                cache.expire(now);
            }
            if self.prefetched_tags[&tag].should_refresh(now) {
                if let Some(path) = self.paths.pick_random_established_path().cloned() {
                    let txid = self.gen_txid();
                    let request = match self.prefetched_tags.get_mut(&tag) {
                        Some(cache) => cache.build_request(txid, now),
                        None => continue,
                    };
                    let msg = RoutingMessage::Dht(DhtRoutingMessage {
                        messages: vec![request],
                        seq: 0,
                    });
                    if path.send_routing_message(&msg, &self.router) {
                        self.register_lookup(PendingLookup {
                            txid,
                            name: "LookupTag",
                            issued: now,
                            timeout: LOOKUP_TIMEOUT,
                            kind: LookupKind::TagResult(tag),
                        });
                    }
                }
            }
        }

        // Forget idle conversations.
        self.sessions
            .retain(|_, session| now.saturating_sub(session.last_used) <= SESSION_IDLE_TIMEOUT);

        // Tick outbound contexts, dropping the ones that report done.
        let addrs: Vec<Address> = self.remote_sessions.keys().copied().collect();
        for addr in addrs {
            if let Some(mut ctx) = self.remote_sessions.remove(&addr) {
                if ctx.tick(self, now) {
                    info!(endpoint = %self.name, ctx = %ctx.name(), "outbound context done");
                } else {
                    self.remote_sessions.insert(addr, ctx);
                }
            }
        }
    }

    /// Probe established paths that have not been measured recently.
    fn probe_path_latency(&mut self, now: u64) {
        for path in self.paths.take_probe_due(now, LATENCY_PROBE_INTERVAL) {
            let probe = RoutingMessage::PathLatency(crate::messages::PathLatencyMessage {
                latency: 0,
                seq: 0,
                sent_at: now,
            });
            if !path.send_routing_message(&probe, &self.router) {
                debug!(endpoint = %self.name, "latency probe send failed");
            }
        }
    }
}

/// Parse a hidden-service address from its hex form.
fn parse_address(value: &str) -> Option<Address> {
    let bytes = hex::decode(value).ok()?;
    let bytes: [u8; 32] = bytes.try_into().ok()?;
    Some(Address(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::MemoryNodeDb;
    use std::sync::Mutex;

    struct SinkLink;

    impl LinkLayer for SinkLink {
        fn send_to_or_queue(&self, _to: &RouterId, _msg: crate::messages::LinkMessage) -> bool {
            true
        }
    }

    struct NullDht;

    impl RouterDht for NullDht {
        fn relay_request_for_path(&self, _rx: PathId, _msg: &DhtMessage) -> bool {
            true
        }
    }

    fn test_endpoint() -> Endpoint {
        Endpoint::new(
            "test",
            RouterId::random().unwrap(),
            Arc::new(SinkLink),
            Arc::new(MemoryNodeDb::new()),
            Arc::new(NullDht),
        )
    }

    #[tokio::test]
    async fn txids_are_distinct_from_outstanding() {
        let mut ep = test_endpoint();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..64 {
            let txid = ep.gen_txid();
            assert!(seen.insert(txid), "duplicate txid");
            ep.register_lookup(PendingLookup {
                txid,
                name: "test",
                issued: 0,
                timeout: LOOKUP_TIMEOUT,
                kind: LookupKind::PublishConfirm,
            });
        }
        assert_eq!(ep.pending_lookup_count(), 64);
    }

    #[tokio::test]
    async fn seqno_post_increments_and_unknown_reads_zero() {
        let mut ep = test_endpoint();
        let tag = ConvoTag::random().unwrap();
        assert_eq!(ep.get_seq_no_for_convo(&tag), 0);

        ep.put_cached_session_key_for(&tag, SharedSecret::random().unwrap(), 1_000);
        assert_eq!(ep.get_seq_no_for_convo(&tag), 0);
        assert_eq!(ep.get_seq_no_for_convo(&tag), 1);
        assert_eq!(ep.get_seq_no_for_convo(&tag), 2);
    }

    #[tokio::test]
    async fn conversation_table_roundtrip() {
        let mut ep = test_endpoint();
        let identity = SecretIdentity::regenerate().unwrap();
        let tag = ConvoTag::random().unwrap();
        let intro = Introduction {
            router: RouterId::random().unwrap(),
            path_id: PathId::random().unwrap(),
            latency: 5,
            expires_at: 900_000,
            version: 0,
        };

        ep.put_sender_for(&tag, identity.public().clone(), 1_000);
        ep.put_intro_for(&tag, intro, 1_000);
        let key = SharedSecret::random().unwrap();
        ep.put_cached_session_key_for(&tag, key.clone(), 1_000);

        assert_eq!(ep.get_sender_for(&tag).as_ref(), Some(identity.public()));
        assert_eq!(ep.get_intro_for(&tag), Some(intro));
        assert_eq!(ep.get_cached_session_key_for(&tag), Some(key));
        assert_eq!(ep.get_convo_tags_for_service(identity.public()), vec![tag]);
        assert_eq!(ep.session_count(), 1);
    }

    #[tokio::test]
    async fn idle_sessions_are_forgotten_on_tick() {
        let mut ep = test_endpoint();
        let tag = ConvoTag::random().unwrap();
        ep.put_cached_session_key_for(&tag, SharedSecret::random().unwrap(), 1_000);
        assert_eq!(ep.session_count(), 1);
        ep.tick(1_000 + SESSION_IDLE_TIMEOUT + 1);
        assert_eq!(ep.session_count(), 0);
    }

    #[tokio::test]
    async fn unknown_options_are_accepted_silently() {
        let mut ep = test_endpoint();
        assert!(ep.set_option("future-flag", "whatever").is_ok());
        assert!(ep.set_option("min-latency", "250").is_ok());
        assert!(ep.set_option("tag", "demo").is_ok());
    }

    #[tokio::test]
    async fn custom_data_handler_receives_messages() {
        let mut ep = test_endpoint();
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = delivered.clone();
        ep.set_data_handler(Box::new(move |msg| {
            sink.lock().unwrap().push(msg.payload.clone());
        }));

        let identity = SecretIdentity::regenerate().unwrap();
        let message = ProtocolMessage {
            proto: ProtocolType::Traffic,
            tag: ConvoTag::random().unwrap(),
            sender: identity.public().clone(),
            intro_reply: Introduction::default(),
            version: 0,
            payload: vec![0xaa],
        };
        ep.handle_data_message(PathId::default(), message, 1_000);
        assert_eq!(delivered.lock().unwrap().as_slice(), &[vec![0xaa]]);
        assert!(ep.poll_inbound().is_none());
    }
}
