//! Prebuilt simulations the command line can run.

use netsim_core::{Process, RipConfig, SimConfig, SimError, Simulator, UserKernel};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

mod counting;
pub use counting::counting;

mod ping_pong;
pub use ping_pong::ping_pong;

mod rip_line;
pub use rip_line::rip_line;

/// Knobs shared by every simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    /// The simulation fails if it has not finished after this long
    pub time_limit: Duration,
    /// How often routers advertise their tables
    pub advertise_period: Duration,
}

impl Settings {
    pub fn sim_config(&self) -> SimConfig {
        SimConfig::new().rip(RipConfig::new().period(self.advertise_period))
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            time_limit: Duration::from_secs(30),
            advertise_period: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error("The simulation did not finish within {0:?}")]
    TimedOut(Duration),
    #[error(transparent)]
    Sim(#[from] SimError),
}

fn user_kernel(sim: &Simulator, process: Arc<dyn Process>) -> Arc<UserKernel> {
    sim.create_user_kernel(Some(process))
}

/// Starts the simulation and waits until `done` is cancelled or the time
/// limit passes. Returns whether `done` was cancelled.
async fn run_until(sim: &Simulator, done: &CancellationToken, limit: Duration) -> bool {
    sim.start();
    tokio::time::timeout(limit, done.cancelled()).await.is_ok()
}
