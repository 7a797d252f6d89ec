#![allow(dead_code)]

use async_trait::async_trait;
use netsim_core::{Interface, Kernel, KernelBase, KernelError, RipConfig, SimConfig};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

/// A kernel that leaves its interfaces alone so tests can drive them, and
/// counts the callbacks it gets.
#[derive(Default)]
pub struct Passive {
    base: KernelBase,
    pub added: AtomicUsize,
    pub connected: AtomicUsize,
    pub disconnected: AtomicUsize,
    pub started: AtomicUsize,
}

impl Passive {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        (
            self.added.load(Ordering::SeqCst),
            self.connected.load(Ordering::SeqCst),
            self.disconnected.load(Ordering::SeqCst),
        )
    }

    /// How often the kernel has been started.
    pub fn starts(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Kernel for Passive {
    fn base(&self) -> &KernelBase {
        &self.base
    }

    fn interface_added(&self, iface: &Arc<Interface>) {
        self.added.fetch_add(1, Ordering::SeqCst);
        self.base.record(iface);
    }

    fn interface_connected(&self, iface: &Arc<Interface>) {
        self.connected.fetch_add(1, Ordering::SeqCst);
        self.base.record(iface);
    }

    fn interface_disconnected(&self, _iface: &Arc<Interface>) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }

    async fn start(self: Arc<Self>) -> Result<(), KernelError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.base.scope().cancelled().await;
        Ok(())
    }

    async fn shut_down(&self) {
        self.base.stop();
    }
}

/// Timers fast enough for a test to watch RIP converge.
pub fn fast_config() -> SimConfig {
    SimConfig::new()
        .shutdown_grace(Duration::from_secs(2))
        .rip(
            RipConfig::new()
                .period(Duration::from_millis(50))
                .route_timeout(Duration::from_secs(2)),
        )
}

/// Polls `condition` until it holds, or fails after `limit`.
pub async fn eventually(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
