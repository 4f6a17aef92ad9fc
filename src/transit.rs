//! # Transit Hops
//!
//! Per-circuit state a relay keeps for paths built by other nodes. A
//! transit hop never originates traffic; it rewrites and forwards
//! fixed-size frames between its upstream and downstream neighbors, and
//! terminates routing messages addressed to itself.
//!
//! ## Forwarding
//!
//! Every frame is rewritten in place with XChaCha20 under the hop's path
//! key and the frame nonce; the nonce forwarded to the next relay is the
//! received nonce XOR the hop's `nonce_xor` mask. A frame the hop cannot
//! decrypt parses as garbage downstream and is silently dropped there;
//! nothing is reflected to the sender.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::crypto::{self, PathId, RouterId, SharedSecret, TunnelNonce};
use crate::messages::{
    DataDiscardMessage, LinkMessage, PathLatencyMessage, RelayDownstreamMessage,
    RelayUpstreamMessage, RoutingMessage,
};
use crate::router::Router;

/// Default lifetime of a transit hop, matching the client-side path
/// lifetime.
pub const DEFAULT_TRANSIT_LIFETIME: u64 = 600_000;

/// The four-tuple identifying one circuit at one relay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TransitHopInfo {
    /// Path id on the upstream side.
    pub tx_id: PathId,
    /// Path id on the downstream side.
    pub rx_id: PathId,
    pub upstream: RouterId,
    pub downstream: RouterId,
}

impl fmt::Display for TransitHopInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tx={} rx={} up={} down={}",
            hex::encode(&self.tx_id.0[..4]),
            hex::encode(&self.rx_id.0[..4]),
            hex::encode(&self.upstream.0[..8]),
            hex::encode(&self.downstream.0[..8]),
        )
    }
}

/// One relay's state for one circuit.
pub struct TransitHop {
    pub info: TransitHopInfo,
    path_key: SharedSecret,
    pub started: u64,
    pub lifetime: u64,
    pub version: u64,
    nonce_xor: TunnelNonce,
}

impl TransitHop {
    pub fn new(
        info: TransitHopInfo,
        path_key: SharedSecret,
        started: u64,
        nonce_xor: TunnelNonce,
    ) -> Self {
        Self {
            info,
            path_key,
            started,
            lifetime: DEFAULT_TRANSIT_LIFETIME,
            version: 0,
            nonce_xor,
        }
    }

    pub fn expired(&self, now: u64) -> bool {
        now.saturating_sub(self.started) > self.lifetime
    }

    pub fn expire_time(&self) -> u64 {
        self.started + self.lifetime
    }

    pub fn nonce_xor(&self) -> TunnelNonce {
        self.nonce_xor
    }

    /// Process a frame arriving from downstream, moving toward upstream.
    ///
    /// When this relay is the upstream terminus the decrypted buffer is
    /// parsed as a routing message and handled locally; otherwise the
    /// rewritten frame is forwarded to the upstream neighbor.
    pub fn handle_upstream(&self, mut buf: Vec<u8>, y: TunnelNonce, r: &Router) -> bool {
        crypto::xchacha20(&mut buf, &self.path_key, &y);
        if self.info.upstream == r.id {
            let msg = match RoutingMessage::decode(&buf) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(info = %self.info, error = %e, "dropping undecodable routing message");
                    return false;
                }
            };
            return self.handle_routing_message(msg, r);
        }
        debug!(
            info = %self.info,
            bytes = buf.len(),
            "relay upstream"
        );
        r.link.send_to_or_queue(
            &self.info.upstream,
            LinkMessage::Upstream(RelayUpstreamMessage {
                path_id: self.info.tx_id,
                nonce: y ^ self.nonce_xor,
                payload: buf,
            }),
        )
    }

    /// Process a frame moving toward the downstream (path owner) side.
    pub fn handle_downstream(&self, mut buf: Vec<u8>, y: TunnelNonce, r: &Router) -> bool {
        crypto::xchacha20(&mut buf, &self.path_key, &y);
        debug!(
            info = %self.info,
            bytes = buf.len(),
            "relay downstream"
        );
        r.link.send_to_or_queue(
            &self.info.downstream,
            LinkMessage::Downstream(RelayDownstreamMessage {
                path_id: self.info.rx_id,
                nonce: y ^ self.nonce_xor,
                payload: buf,
            }),
        )
    }

    /// Originate a routing message at this hop, sending it downstream.
    /// The message is padded to the fixed minimum before encryption so
    /// control-message lengths are indistinguishable.
    pub fn send_routing_message(&self, msg: &RoutingMessage, r: &Router) -> bool {
        let buf = match msg.encode_padded() {
            Ok(buf) => buf,
            Err(e) => {
                warn!(info = %self.info, error = %e, "failed to pad routing message");
                return false;
            }
        };
        let nonce = match TunnelNonce::random() {
            Ok(nonce) => nonce,
            Err(e) => {
                warn!(info = %self.info, error = %e, "failed to draw nonce");
                return false;
            }
        };
        self.handle_downstream(buf, nonce, r)
    }

    /// Dispatch a routing message terminated at this hop.
    pub fn handle_routing_message(&self, msg: RoutingMessage, r: &Router) -> bool {
        match msg {
            RoutingMessage::PathLatency(latency) => self.handle_path_latency(latency, r),
            RoutingMessage::PathTransfer(transfer) => self.handle_path_transfer(transfer, r),
            RoutingMessage::PathConfirm(_) => {
                warn!(info = %self.info, "unwarranted path confirm");
                false
            }
            RoutingMessage::DataDiscard(_) => {
                warn!(info = %self.info, "unwarranted data discard");
                false
            }
            RoutingMessage::Dht(dht) => {
                let mut ok = true;
                for message in &dht.messages {
                    ok &= r.dht.relay_request_for_path(self.info.rx_id, message);
                }
                ok
            }
        }
    }

    /// Echo a latency probe: the probe's timestamp comes back as the
    /// sample.
    fn handle_path_latency(&self, msg: PathLatencyMessage, r: &Router) -> bool {
        let reply = RoutingMessage::PathLatency(PathLatencyMessage {
            latency: msg.sent_at,
            seq: msg.seq,
            sent_at: 0,
        });
        self.send_routing_message(&reply, r)
    }

    /// Forward a sealed frame to another path terminating at this relay,
    /// or answer with a discard when no such path exists. The discard
    /// travels back along the path that delivered the transfer; nothing
    /// is ever forwarded to a guessed destination.
    fn handle_path_transfer(
        &self,
        msg: crate::messages::PathTransferMessage,
        r: &Router,
    ) -> bool {
        match r.paths.get_by_upstream(&r.id, &msg.path_id) {
            Some(target) => {
                debug!(
                    info = %self.info,
                    dst = ?msg.path_id,
                    "transfer frame to local path"
                );
                target.handle_downstream(msg.frame.encode(), msg.nonce, r)
            }
            None => {
                let discard = RoutingMessage::DataDiscard(DataDiscardMessage {
                    path_id: msg.path_id,
                    seq: msg.seq,
                });
                debug!(info = %self.info, dst = ?msg.path_id, "no such path, discarding");
                self.send_routing_message(&discard, r)
            }
        }
    }
}

/// Materialize transit hops for testing relay chains in-process.
pub fn register_hop(r: &Router, hop: TransitHop) -> Option<Arc<TransitHop>> {
    let hop = Arc::new(hop);
    if r.paths.register(hop.clone()) {
        Some(hop)
    } else {
        None
    }
}
