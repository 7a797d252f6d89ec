use super::{run_until, Settings, SimulationError};
use crate::applications::Counter;
use netsim_core::Simulator;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const COUNT_TO: i32 = 10;

/// Two bare counting kernels on either end of one wire take turns counting
/// up until one of them receives [`COUNT_TO`]. Returns the highest number
/// either of them received.
pub async fn counting(settings: Settings) -> Result<i32, SimulationError> {
    let sim = Simulator::with_config(settings.sim_config());
    let done = CancellationToken::new();
    let counter = || {
        Counter::new()
            .pause(Duration::from_millis(100))
            .limit(COUNT_TO)
            .shutdown(done.clone())
    };
    let first = counter().initiator().shared();
    let second = counter().shared();
    let a = sim.build_node().name("A").kernel(first.clone()).create()?;
    sim.build_node()
        .name("B")
        .kernel(second.clone())
        .connections([&a])
        .create()?;

    let finished = run_until(&sim, &done, settings.time_limit).await;
    sim.destroy_all().await;
    let highest = first.highest().max(second.highest());
    match (finished, highest) {
        (true, Some(highest)) => Ok(highest),
        _ => Err(SimulationError::TimedOut(settings.time_limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn counters_reach_the_limit() {
        let settings = Settings {
            time_limit: Duration::from_secs(20),
            ..Default::default()
        };
        assert_eq!(counting(settings).await.unwrap(), COUNT_TO);
    }
}
