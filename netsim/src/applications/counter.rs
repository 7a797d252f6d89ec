use netsim_core::{Interface, InterfaceError, Kernel, KernelBase, KernelError, Message};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::{
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;

/// A bare kernel that counts with the node on the other end of its first
/// interface. Every number received is answered with the next one after a
/// pause. When nothing arrives for a while the count starts over from zero.
pub struct Counter {
    base: KernelBase,
    is_initiator: bool,
    pause: Duration,
    /// The shortest wait for the next number. Each wait adds a random extra
    /// of up to the same amount so two counters do not time out in lockstep.
    patience: Duration,
    limit: Option<i32>,
    shutdown: Option<CancellationToken>,
    highest: AtomicI32,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            base: KernelBase::new(),
            is_initiator: false,
            pause: Duration::from_millis(500),
            patience: Duration::from_millis(500),
            limit: None,
            shutdown: None,
            highest: AtomicI32::new(-1),
        }
    }

    /// Sends the first number instead of waiting for one.
    pub fn initiator(mut self) -> Self {
        self.is_initiator = true;
        self
    }

    /// How long to wait before answering.
    pub fn pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    pub fn patience(mut self, patience: Duration) -> Self {
        self.patience = patience;
        self
    }

    /// Stops counting once this number is received.
    pub fn limit(mut self, limit: i32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Cancels `shutdown` when the limit is reached.
    pub fn shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// The highest number received so far.
    pub fn highest(&self) -> Option<i32> {
        match self.highest.load(Ordering::Acquire) {
            -1 => None,
            n => Some(n),
        }
    }

    fn send(&self, iface: &Interface, count: i32) -> Result<(), KernelError> {
        tracing::info!("Sending {}", count);
        iface.send(&Message::new(self.base.address(), 0, 0, 0, count))?;
        Ok(())
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Kernel for Counter {
    fn base(&self) -> &KernelBase {
        &self.base
    }

    async fn start(self: Arc<Self>) -> Result<(), KernelError> {
        let Some(iface) = self.base.first_interface() else {
            tracing::warn!("No interfaces, nothing to count with");
            return Ok(());
        };
        let scope = self.base.scope();
        let mut rng = SmallRng::from_entropy();

        if self.is_initiator {
            self.send(&iface, 0)?;
        }
        loop {
            let wait = self.patience + self.patience.mul_f64(rng.gen::<f64>());
            let received = tokio::select! {
                _ = scope.cancelled() => return Ok(()),
                received = iface.receive(Some(wait)) => received?,
            };
            let next = match received {
                Some(message) => {
                    let count: i32 = message.data_as().map_err(InterfaceError::from)?;
                    tracing::info!("Receiving {}", count);
                    self.highest.fetch_max(count, Ordering::AcqRel);
                    if self.limit.is_some_and(|limit| count >= limit) {
                        tracing::info!("Counted to {}", count);
                        if let Some(shutdown) = &self.shutdown {
                            shutdown.cancel();
                        }
                        return Ok(());
                    }
                    count + 1
                }
                None => {
                    tracing::info!("Timed out");
                    0
                }
            };
            tokio::select! {
                _ = scope.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.pause) => {}
            }
            self.send(&iface, next)?;
        }
    }

    async fn shut_down(&self) {
        self.base.stop();
    }
}
