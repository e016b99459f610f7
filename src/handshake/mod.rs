//! Handshake Orchestration
//!
//! Tunnels that are still being negotiated live in two pending registries,
//! one per direction, and never touch the main registry until they
//! complete:
//!
//! - **pending-outbound** is keyed by overlay IP. An attempt starts when
//!   something wants to reach a peer we have no tunnel to.
//! - **pending-inbound** is keyed by the local index we hand out when the
//!   first handshake packet from a peer arrives.
//!
//! Each direction has a timer wheel. Every tick either retransmits and
//! re-arms at the fixed retry interval, or evicts the attempt once the
//! retry limit is exhausted. A completed attempt is promoted into the main
//! registry, published to the lighthouse, and its certificate names are
//! registered with the name service.

mod tasks;

pub use tasks::HandshakeTasks;

use crate::config::HandshakesConfig;
use crate::dns::NameRegistry;
use crate::header::{MessageSubType, MessageType};
use crate::hostmap::{HostInfo, HostMap, HostMapError};
use crate::lighthouse::Lighthouse;
use crate::transport::{MessageSender, Outside};
use crate::wheel::TimerWheel;
use parking_lot::Mutex;
use rand::RngExt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// Random draws tried before local index allocation gives up.
pub const MAX_INDEX_ATTEMPTS: u32 = 32;

/// Errors from the handshake manager.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("no free local index after {attempts} attempts")]
    IndexAllocationExhausted { attempts: u32 },

    #[error("handshake tasks already running")]
    AlreadyRunning,

    #[error("handshake retry interval must be non-zero")]
    ZeroInterval,

    #[error(transparent)]
    HostMap(#[from] HostMapError),
}

/// Drives pending handshakes from first packet to promotion or expiry.
pub struct HandshakeManager {
    main: Arc<HostMap>,
    pending_inbound: HostMap,
    pending_outbound: HostMap,
    lighthouse: Arc<dyn Lighthouse>,
    outside: Arc<dyn Outside>,
    names: Option<Arc<dyn NameRegistry>>,
    config: HandshakesConfig,
    inbound_timer: Mutex<TimerWheel<u32>>,
    outbound_timer: Mutex<TimerWheel<Ipv4Addr>>,
    trigger_tx: mpsc::Sender<Ipv4Addr>,
    /// Taken by `spawn`.
    trigger_rx: Mutex<Option<mpsc::Receiver<Ipv4Addr>>>,
}

impl HandshakeManager {
    /// Create a manager feeding `main`.
    ///
    /// Both pending registries share the main map's overlay network and
    /// preferred ranges.
    pub fn new(
        main: Arc<HostMap>,
        lighthouse: Arc<dyn Lighthouse>,
        outside: Arc<dyn Outside>,
        config: HandshakesConfig,
    ) -> Self {
        let interval = config.try_interval();
        let span = interval.saturating_mul(config.retries());
        let (trigger_tx, trigger_rx) = mpsc::channel(config.trigger_buffer().max(1));

        let pending = |name: &str| {
            HostMap::new(name, main.vpn_cidr(), main.preferred_ranges().to_vec())
        };

        Self {
            pending_inbound: pending("pending-inbound"),
            pending_outbound: pending("pending-outbound"),
            main,
            lighthouse,
            outside,
            names: None,
            inbound_timer: Mutex::new(TimerWheel::new(interval, span)),
            outbound_timer: Mutex::new(TimerWheel::new(interval, span)),
            config,
            trigger_tx,
            trigger_rx: Mutex::new(Some(trigger_rx)),
        }
    }

    /// Register certificate names of promoted peers with `names`.
    pub fn with_name_registry(mut self, names: Arc<dyn NameRegistry>) -> Self {
        self.names = Some(names);
        self
    }

    // === Accessors ===

    pub fn main_hostmap(&self) -> &Arc<HostMap> {
        &self.main
    }

    pub fn pending_inbound(&self) -> &HostMap {
        &self.pending_inbound
    }

    pub fn pending_outbound(&self) -> &HostMap {
        &self.pending_outbound
    }

    pub fn config(&self) -> &HandshakesConfig {
        &self.config
    }

    /// Scheduled inbound retries.
    pub fn inbound_timer_len(&self) -> usize {
        self.inbound_timer.lock().len()
    }

    /// Scheduled outbound retries.
    pub fn outbound_timer_len(&self) -> usize {
        self.outbound_timer.lock().len()
    }

    // === Outbound ===

    /// Get or create the pending outbound record for `vpn_ip`.
    ///
    /// Does not schedule a retry; `handle_outbound` does.
    pub fn stage_outbound(&self, vpn_ip: Ipv4Addr) -> Arc<HostInfo> {
        let info = self.pending_outbound.insert_by_ip(vpn_ip);
        info.mark_handshake_started(Instant::now());
        info
    }

    /// Make one outbound attempt toward `vpn_ip`.
    ///
    /// Without an active endpoint the lighthouse cache is consulted (and
    /// the lighthouses queried when it knows little). With one, a
    /// timer-driven retry moves on to the next candidate; an externally
    /// triggered retry keeps the current endpoint. The stage-0 packet is
    /// sent once it is ready. At most one retry timer exists per overlay
    /// IP, so repeated calls never pile up entries.
    pub fn handle_outbound(
        &self,
        vpn_ip: Ipv4Addr,
        sender: &dyn MessageSender,
        externally_triggered: bool,
    ) {
        let info = self.stage_outbound(vpn_ip);
        self.attempt_outbound(&info, sender, externally_triggered);
    }

    /// One attempt on a record already fetched from pending-outbound.
    ///
    /// Never creates a record, so a peer promoted concurrently stays
    /// promoted; the retry timer is only armed while `info` is pending.
    fn attempt_outbound(
        &self,
        info: &Arc<HostInfo>,
        sender: &dyn MessageSender,
        externally_triggered: bool,
    ) {
        if info.is_handshake_complete() {
            return;
        }
        let vpn_ip = info.vpn_ip();

        if info.remote().is_none() {
            let candidates = self.lighthouse.query_cache(vpn_ip);
            if candidates.len() <= 1 {
                self.lighthouse.query(vpn_ip, sender);
            }
            for remote in candidates {
                info.add_remote(remote);
            }
            info.force_promote(self.main.preferred_ranges());
        } else if !externally_triggered {
            info.rotate_remote();
        }

        if info.is_handshake_ready()
            && let Some(remote) = info.remote()
            && let Some(packet) = info.handshake_packet(0)
        {
            debug!(
                vpn_ip = %vpn_ip,
                remote = %remote,
                attempts = info.handshake_attempts(),
                triggered = externally_triggered,
                "Sending handshake"
            );
            sender.send_via(
                MessageType::Handshake,
                MessageSubType::HandshakeIxPsk0,
                info,
                &remote,
                &packet,
            );
        }

        // promote drops the pending entry before the timer, so checking
        // under the timer lock cannot resurrect a promoted attempt
        let mut timer = self.outbound_timer.lock();
        let pending = self
            .pending_outbound
            .get_by_ip(vpn_ip)
            .is_ok_and(|current| current.slot() == info.slot());
        if pending && !timer.contains(&vpn_ip) {
            timer.add(vpn_ip, self.config.try_interval());
        }
    }

    /// Advance the outbound wheel to `now` and retry or expire whatever
    /// came due.
    pub fn on_outbound_tick(&self, now: Instant, sender: &dyn MessageSender) {
        let due = self.outbound_timer.lock().advance(now);
        for vpn_ip in due {
            let Ok(info) = self.pending_outbound.get_by_ip(vpn_ip) else {
                continue;
            };
            if info.is_handshake_complete() {
                continue;
            }

            let attempts = info.increment_handshake_attempts();
            if attempts > self.config.retries() {
                info!(
                    vpn_ip = %vpn_ip,
                    attempts = attempts - 1,
                    remotes = info.remotes().len(),
                    "Handshake timed out"
                );
                self.pending_outbound.remove(&info);
                continue;
            }
            self.attempt_outbound(&info, sender, false);
        }
    }

    /// Queue an out-of-band retry for `vpn_ip`, such as a lighthouse reply
    /// arriving. Dropped when the queue is full.
    pub fn trigger(&self, vpn_ip: Ipv4Addr) {
        match self.trigger_tx.try_send(vpn_ip) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(vpn_ip = %vpn_ip, "Handshake trigger queue full, dropping");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(vpn_ip = %vpn_ip, "Handshake trigger queue closed");
            }
        }
    }

    /// Retry a pending outbound attempt with whatever the lighthouse now
    /// knows. Overlay IPs with no attempt in progress are ignored.
    pub fn handle_trigger(&self, vpn_ip: Ipv4Addr, sender: &dyn MessageSender) {
        let Ok(info) = self.pending_outbound.get_by_ip(vpn_ip) else {
            return;
        };
        if let Some(addresses) = self.lighthouse.address_map(vpn_ip) {
            for remote in addresses.endpoints() {
                info.add_remote(*remote);
            }
        }
        self.attempt_outbound(&info, sender, true);
    }

    // === Inbound ===

    /// Hand out a fresh local index for `info` and register it in the
    /// pending inbound registry.
    pub fn register_inbound_index(&self, info: &Arc<HostInfo>) -> Result<u32, HandshakeError> {
        let mut rng = rand::rng();
        self.allocate_local_index(info, || rng.random::<u32>())
    }

    fn allocate_local_index(
        &self,
        info: &Arc<HostInfo>,
        mut next: impl FnMut() -> u32,
    ) -> Result<u32, HandshakeError> {
        for _ in 0..MAX_INDEX_ATTEMPTS {
            let index = next();
            if index == 0 || self.main.contains_local_index(index) {
                continue;
            }
            if self.pending_inbound.insert_local_index(index, info) {
                debug!(index, vpn_ip = %info.vpn_ip(), "Allocated local index");
                return Ok(index);
            }
        }

        warn!(
            attempts = MAX_INDEX_ATTEMPTS,
            "Failed to allocate a free local index"
        );
        Err(HandshakeError::IndexAllocationExhausted {
            attempts: MAX_INDEX_ATTEMPTS,
        })
    }

    /// Schedule the retry timer for an inbound attempt if none exists.
    pub fn arm_inbound(&self, index: u32) {
        let mut timer = self.inbound_timer.lock();
        if !timer.contains(&index) {
            timer.add(index, self.config.try_interval());
        }
    }

    /// Advance the inbound wheel to `now`; retransmit the latest handshake
    /// packet of each attempt that came due, or expire it.
    pub fn on_inbound_tick(&self, now: Instant) {
        let due = self.inbound_timer.lock().advance(now);
        let mut rearm = Vec::new();

        for index in due {
            let Ok(info) = self.pending_inbound.get_by_local_index(index) else {
                continue;
            };
            if info.is_handshake_complete() {
                continue;
            }

            let attempts = info.increment_handshake_attempts();
            if attempts > self.config.retries() {
                info!(
                    index,
                    vpn_ip = %info.vpn_ip(),
                    attempts = attempts - 1,
                    "Inbound handshake timed out"
                );
                self.pending_inbound.remove_by_local_index(index);
                continue;
            }

            if let Some(remote) = info.remote()
                && let Some((stage, packet)) = info.last_handshake_packet()
            {
                match self.outside.write_to(&packet, &remote) {
                    Ok(()) => debug!(index, stage, remote = %remote, "Resent handshake"),
                    Err(e) => debug!(index, remote = %remote, error = %e, "Handshake resend failed"),
                }
            }
            rearm.push(index);
        }

        if !rearm.is_empty() {
            let mut timer = self.inbound_timer.lock();
            for index in rearm {
                timer.add(index, self.config.try_interval());
            }
        }
    }

    // === Completion ===

    /// Finish the inbound attempt registered under `index` and promote it.
    pub fn complete_inbound(&self, index: u32) -> Result<Arc<HostInfo>, HandshakeError> {
        let info = self.pending_inbound.get_by_local_index(index)?;
        self.promote(&info);
        info.handshake_complete();
        Ok(info)
    }

    /// Finish the outbound attempt toward `vpn_ip` and promote it.
    pub fn complete_outbound(&self, vpn_ip: Ipv4Addr) -> Result<Arc<HostInfo>, HandshakeError> {
        let info = self.pending_outbound.get_by_ip(vpn_ip)?;
        self.promote(&info);
        info.handshake_complete();
        Ok(info)
    }

    /// Move `info` out of the pending registries and into the main one.
    ///
    /// A record whose overlay IP was never learned is indexed in main only
    /// by its indices and is not published to the lighthouse or name
    /// registry.
    pub fn promote(&self, info: &Arc<HostInfo>) {
        let vpn_ip = info.vpn_ip();

        self.pending_inbound.remove(info);
        self.pending_outbound.remove(info);
        self.inbound_timer.lock().remove(&info.local_index());
        self.outbound_timer.lock().remove(&vpn_ip);

        self.main.insert_full(info);

        let remote = info.remote();
        if vpn_ip.is_unspecified() {
            warn!(
                local_index = info.local_index(),
                "Promoted handshake without an overlay IP"
            );
        } else if let Some(remote) = remote {
            self.lighthouse.add_remote_and_reset(vpn_ip, remote);
        }

        if !vpn_ip.is_unspecified()
            && let Some(names) = &self.names
            && let Some(cert) = info.peer_cert()
        {
            for name in &cert.names {
                names.add(&format!("{}.", name), vpn_ip);
            }
        }

        info!(
            vpn_ip = %vpn_ip,
            local_index = info.local_index(),
            remote_index = info.remote_index(),
            remote = ?remote,
            attempts = info.handshake_attempts(),
            "Handshake promoted"
        );
    }

    pub(crate) fn take_trigger_rx(&self) -> Option<mpsc::Receiver<Ipv4Addr>> {
        self.trigger_rx.lock().take()
    }
}

impl std::fmt::Debug for HandshakeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeManager")
            .field("pending_inbound", &self.pending_inbound.stats())
            .field("pending_outbound", &self.pending_outbound.stats())
            .field("inbound_timers", &self.inbound_timer_len())
            .field("outbound_timers", &self.outbound_timer_len())
            .finish()
    }
}
