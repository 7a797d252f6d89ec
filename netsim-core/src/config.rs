//! Tunables for a simulation.

use std::time::Duration;

/// Configuration shared by every node of a [`Simulator`](crate::Simulator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimConfig {
    /// How long a node waits for its kernel to stop before forcing it
    pub shutdown_grace: Duration,
    /// Configuration for the router kernels the simulator creates
    pub rip: RipConfig,
}

impl SimConfig {
    pub fn new() -> Self {
        Default::default()
    }

    /// How long a node waits for its kernel to stop before forcing it.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Configuration for the router kernels the simulator creates.
    pub fn rip(mut self, rip: RipConfig) -> Self {
        self.rip = rip;
        self
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_secs(5),
            rip: Default::default(),
        }
    }
}

/// Timing and cost parameters of the RIP engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RipConfig {
    /// Time between two advertisements on every interface
    pub advertise_period: Duration,
    /// Time between two passes over the interfaces' inbound queues
    pub integrate_period: Duration,
    /// The cost added for every router-to-router link
    pub link_cost: u8,
    /// Routes not refreshed for this long are dropped
    pub route_timeout: Duration,
}

impl RipConfig {
    pub fn new() -> Self {
        Default::default()
    }

    /// Sets the advertise period. The integrate period becomes half of it
    /// and routes time out after six periods.
    pub fn period(self, period: Duration) -> Self {
        Self {
            advertise_period: period,
            integrate_period: period / 2,
            route_timeout: period * 6,
            ..self
        }
    }

    pub fn integrate_period(mut self, period: Duration) -> Self {
        self.integrate_period = period;
        self
    }

    pub fn link_cost(mut self, cost: u8) -> Self {
        self.link_cost = cost;
        self
    }

    pub fn route_timeout(mut self, timeout: Duration) -> Self {
        self.route_timeout = timeout;
        self
    }
}

impl Default for RipConfig {
    fn default() -> Self {
        Self {
            advertise_period: Duration::from_secs(1),
            integrate_period: Duration::from_millis(500),
            link_cost: 1,
            route_timeout: Duration::from_secs(6),
        }
    }
}
