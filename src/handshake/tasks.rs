//! Ticking tasks for the two handshake wheels.

use super::{HandshakeError, HandshakeManager};
use crate::transport::MessageSender;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Handles of the running handshake tasks.
#[derive(Debug)]
pub struct HandshakeTasks {
    inbound: JoinHandle<()>,
    outbound: JoinHandle<()>,
}

impl HandshakeTasks {
    /// Wait for both tasks to stop. A task that panicked is logged.
    pub async fn join(self) {
        if let Err(e) = self.inbound.await {
            log_join_error("inbound", e);
        }
        if let Err(e) = self.outbound.await {
            log_join_error("outbound", e);
        }
    }

    /// Stop both tasks without waiting for shutdown.
    pub fn abort(&self) {
        self.inbound.abort();
        self.outbound.abort();
    }
}

fn log_join_error(task: &str, e: JoinError) {
    if e.is_cancelled() {
        debug!(task, "Handshake ticker aborted");
    } else {
        error!(task, error = %e, "Handshake ticker failed");
    }
}

impl HandshakeManager {
    /// Start one ticking task per wheel. The outbound task also drains
    /// queued triggers.
    ///
    /// Both tasks run until `shutdown` flips to true or its sender is
    /// dropped. Only one set of tasks may run per manager, and the retry
    /// interval must be non-zero.
    pub fn spawn(
        self: &Arc<Self>,
        sender: Arc<dyn MessageSender>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<HandshakeTasks, HandshakeError> {
        let interval = self.config.try_interval();
        if interval.is_zero() {
            return Err(HandshakeError::ZeroInterval);
        }
        let mut trigger_rx = self
            .take_trigger_rx()
            .ok_or(HandshakeError::AlreadyRunning)?;

        let manager = Arc::clone(self);
        let mut inbound_shutdown = shutdown.clone();
        let inbound = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    now = tick.tick() => manager.on_inbound_tick(now.into_std()),
                    changed = inbound_shutdown.changed() => {
                        if changed.is_err() || *inbound_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            debug!("Inbound handshake ticker stopped");
        });

        let manager = Arc::clone(self);
        let mut outbound_shutdown = shutdown;
        let outbound = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    now = tick.tick() => manager.on_outbound_tick(now.into_std(), sender.as_ref()),
                    Some(vpn_ip) = trigger_rx.recv() => manager.handle_trigger(vpn_ip, sender.as_ref()),
                    changed = outbound_shutdown.changed() => {
                        if changed.is_err() || *outbound_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            debug!("Outbound handshake ticker stopped");
        });

        info!(
            try_interval_ms = interval.as_millis() as u64,
            retries = self.config.retries(),
            "Handshake manager started"
        );

        Ok(HandshakeTasks { inbound, outbound })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HandshakesConfig;
    use crate::endpoint::Endpoint;
    use crate::hostmap::HostMap;
    use crate::lighthouse::AddressCache;
    use crate::transport::testing::{RecordingOutside, RecordingSender};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    const PEER: Ipv4Addr = Ipv4Addr::new(172, 1, 1, 2);

    fn manager(cache: Arc<AddressCache>) -> Arc<HandshakeManager> {
        manager_with_interval(cache, 20)
    }

    fn manager_with_interval(cache: Arc<AddressCache>, interval_ms: u64) -> Arc<HandshakeManager> {
        let config = HandshakesConfig {
            try_interval_ms: Some(interval_ms),
            retries: Some(2),
            trigger_buffer: None,
        };
        Arc::new(HandshakeManager::new(
            Arc::new(HostMap::new("main", None, Vec::new())),
            cache,
            Arc::new(RecordingOutside::default()),
            config,
        ))
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    #[tokio::test]
    async fn test_spawned_tasks_expire_attempts() {
        let mgr = manager(Arc::new(AddressCache::new()));
        let sender = Arc::new(RecordingSender::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = mgr.spawn(sender.clone(), shutdown_rx).unwrap();

        mgr.handle_outbound(PEER, sender.as_ref(), false);
        assert!(mgr.pending_outbound().contains_vpn_ip(PEER));

        assert!(wait_until(|| !mgr.pending_outbound().contains_vpn_ip(PEER)).await);
        assert_eq!(mgr.outbound_timer_len(), 0);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), tasks.join())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_spawned_task_drains_triggers() {
        let cache = Arc::new(AddressCache::new());
        let mgr = manager(cache.clone());
        let sender = Arc::new(RecordingSender::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = mgr.spawn(sender, shutdown_rx).unwrap();

        let info = mgr.stage_outbound(PEER);
        let remote: Endpoint = "1.2.3.4:4242".parse().unwrap();
        cache.add_remote(PEER, remote);
        mgr.trigger(PEER);

        assert!(wait_until(|| info.remote() == Some(remote)).await);

        drop(shutdown_tx);
        tokio::time::timeout(Duration::from_secs(2), tasks.join())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_spawn_twice_fails() {
        let mgr = manager(Arc::new(AddressCache::new()));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = mgr
            .spawn(Arc::new(RecordingSender::default()), shutdown_rx.clone())
            .unwrap();

        assert!(matches!(
            mgr.spawn(Arc::new(RecordingSender::default()), shutdown_rx),
            Err(HandshakeError::AlreadyRunning)
        ));
        tasks.abort();
    }

    #[tokio::test]
    async fn test_spawn_rejects_zero_interval() {
        let mgr = manager_with_interval(Arc::new(AddressCache::new()), 0);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        assert!(matches!(
            mgr.spawn(Arc::new(RecordingSender::default()), shutdown_rx),
            Err(HandshakeError::ZeroInterval)
        ));
        // Nothing was started, so the trigger queue is still unclaimed
        assert!(mgr.take_trigger_rx().is_some());
    }

    #[tokio::test]
    async fn test_join_after_abort_returns() {
        let mgr = manager(Arc::new(AddressCache::new()));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = mgr
            .spawn(Arc::new(RecordingSender::default()), shutdown_rx)
            .unwrap();

        tasks.abort();
        tokio::time::timeout(Duration::from_secs(2), tasks.join())
            .await
            .unwrap();
    }
}
