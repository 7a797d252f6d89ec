//! A kernel that routes traffic between its interfaces with RIP.

use super::{Kernel, KernelBase, KernelError};
use crate::{
    interface::InterfaceError,
    rip::{RipDatagram, RoutingEntry, RoutingTable},
    Address, Interface, KnownPort, Message, RipConfig,
};
use async_trait::async_trait;
use std::{
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};
use tokio::time::MissedTickBehavior;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Instrument;

/// Upper bound on the messages taken off one interface per integration pass,
/// so a flooded interface can not starve the others.
const MAX_DRAIN: usize = 1024;

/// Runs the RIP engine over every interface of its node.
///
/// Two duties run concurrently once started. The advertise duty sends the
/// routing table on every interface each advertise period. The integrate
/// duty drains what the interfaces have queued, folds routing datagrams into
/// the table and forwards all other traffic along the table's routes.
pub struct RouterKernel {
    base: KernelBase,
    config: RipConfig,
    table: OnceLock<RoutingTable>,
    duties: TaskTracker,
}

impl RouterKernel {
    pub fn new(config: RipConfig) -> Arc<Self> {
        Arc::new(Self {
            base: KernelBase::new(),
            config,
            table: OnceLock::new(),
            duties: TaskTracker::new(),
        })
    }

    pub fn config(&self) -> &RipConfig {
        &self.config
    }

    fn table(&self) -> &RoutingTable {
        self.table
            .get_or_init(|| RoutingTable::new(self.base.address(), self.config.link_cost))
    }

    /// A snapshot of the routing table, sorted by destination.
    pub fn routing_table(&self) -> Vec<RoutingEntry> {
        self.table.get().map(RoutingTable::snapshot).unwrap_or_default()
    }

    /// The route to `destination`, if it is reachable.
    pub fn route(&self, destination: Address) -> Option<RoutingEntry> {
        self.table.get()?.route(destination)
    }

    async fn advertise(self: Arc<Self>, scope: CancellationToken) {
        let mut ticker = tokio::time::interval(nonzero(self.config.advertise_period));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = scope.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let advertisement = Message::new(
                self.base.address(),
                KnownPort::Rip,
                0,
                KnownPort::Discovery,
                self.table().advertisement(),
            );
            for iface in self.base.interfaces() {
                match iface.send(&advertisement) {
                    Ok(()) | Err(InterfaceError::Disconnected) => {}
                    Err(e) => tracing::debug!("Could not advertise on {}: {}", iface, e),
                }
            }
        }
    }

    async fn integrate(self: Arc<Self>, scope: CancellationToken) {
        let mut ticker = tokio::time::interval(nonzero(self.config.integrate_period));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = scope.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let now = Instant::now();
            for iface in self.base.interfaces() {
                // Only what is queued right now; later arrivals wait a pass
                let budget = iface.pending().min(MAX_DRAIN);
                for _ in 0..budget {
                    match iface.try_receive() {
                        Ok(Some(message)) => self.handle(&iface, message, now),
                        Ok(None) => break,
                        Err(InterfaceError::Codec(e)) => {
                            tracing::warn!("Dropping a message on {}: {}", iface, e)
                        }
                        Err(e) => {
                            tracing::debug!("Stopped draining {}: {}", iface, e);
                            break;
                        }
                    }
                }
            }
            let expired = self.table().expire(now, self.config.route_timeout);
            if expired > 0 {
                tracing::debug!("{} routes expired", expired);
            }
        }
    }

    fn handle(&self, iface: &Interface, message: Message, now: Instant) {
        if message.sent_to_port(KnownPort::Rip) || message.sent_to_port(KnownPort::Discovery) {
            // Anything but a datagram on a routing port comes from a leaf
            let datagram = message
                .data_as::<RipDatagram>()
                .unwrap_or_else(|_| RipDatagram::not_a_router());
            let changed = self
                .table()
                .integrate(iface.index(), message.source(), &datagram, now);
            if changed > 0 {
                tracing::debug!(
                    "{} routes changed after {} from {:x}",
                    changed,
                    datagram,
                    message.source()
                );
            }
            return;
        }
        self.forward(message);
    }

    /// Forwards ordinary traffic. Undeliverable messages are dropped.
    fn forward(&self, message: Message) {
        let destination = message.destination();
        if destination == self.base.address() {
            tracing::warn!("Dropping {}: routers do not accept traffic", message);
            return;
        }
        let Some(route) = self.table().route(destination) else {
            tracing::warn!("No route to {:x}, dropping {}", destination, message);
            return;
        };
        let Some(next_hop) = self.base.interface(route.next_hop) else {
            tracing::warn!("Route to {:x} uses an unknown interface", destination);
            return;
        };
        if let Err(e) = next_hop.send(&message) {
            tracing::warn!("Could not forward {} on {}: {}", message, next_hop, e);
        }
    }
}

fn nonzero(period: Duration) -> Duration {
    period.max(Duration::from_millis(1))
}

#[async_trait]
impl Kernel for RouterKernel {
    fn base(&self) -> &KernelBase {
        &self.base
    }

    fn interface_disconnected(&self, iface: &Arc<Interface>) {
        if let Some(table) = self.table.get() {
            let forgotten = table.forget_interface(iface.index());
            if forgotten > 0 {
                tracing::debug!(
                    parent: &self.base.span(),
                    "Forgot {} routes through interface {}",
                    forgotten,
                    iface.index()
                );
            }
        }
    }

    async fn start(self: Arc<Self>) -> Result<(), KernelError> {
        let scope = self.base.scope();
        let span = self.base.span();
        tracing::info!("Router started");
        self.duties.spawn(
            self.clone()
                .advertise(scope.clone())
                .instrument(span.clone()),
        );
        self.duties
            .spawn(self.clone().integrate(scope.clone()).instrument(span));
        self.duties.close();
        scope.cancelled().await;
        self.duties.wait().await;
        Ok(())
    }

    async fn shut_down(&self) {
        self.base.stop();
        // A router that never started has nothing to wait for
        self.duties.close();
        self.duties.wait().await;
    }
}
