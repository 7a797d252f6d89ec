use super::{run_until, user_kernel, Settings, SimulationError};
use crate::applications::PingPong;
use netsim_core::Simulator;
use tokio_util::sync::CancellationToken;

const PORT: i32 = 0xbeef;

/// Runs a basic PingPong simulation.
///
/// In this simulation, two directly connected hosts send a Time To Live (TTL)
/// back and forth till it reaches 0. The TTL is decremented every time a
/// host receives it.
pub async fn ping_pong(settings: Settings) -> Result<(), SimulationError> {
    ping_pong_with_ttl(settings, 255).await
}

pub(crate) async fn ping_pong_with_ttl(settings: Settings, ttl: u32) -> Result<(), SimulationError> {
    let sim = Simulator::with_config(settings.sim_config());
    let done = CancellationToken::new();
    let ping = sim.build_node().name("Ping");
    let pong = sim.build_node().name("Pong");
    let (ping_address, pong_address) = (ping.address(), pong.address());

    let serve = PingPong::new(true, pong_address, PORT)
        .ttl(ttl)
        .shutdown(done.clone());
    let ping = ping.kernel(user_kernel(&sim, serve.shared())).create()?;
    let answer = PingPong::new(false, ping_address, PORT).shutdown(done.clone());
    pong.kernel(user_kernel(&sim, answer.shared()))
        .connections([&ping])
        .create()?;

    let finished = run_until(&sim, &done, settings.time_limit).await;
    sim.destroy_all().await;
    match finished {
        true => Ok(()),
        false => Err(SimulationError::TimedOut(settings.time_limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn ping_pong_completes() {
        let settings = Settings {
            time_limit: Duration::from_secs(10),
            ..Default::default()
        };
        super::ping_pong(settings).await.unwrap();
    }

    #[tokio::test]
    async fn long_game_times_out() {
        let settings = Settings {
            time_limit: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            ping_pong_with_ttl(settings, 1_000_000).await,
            Err(SimulationError::TimedOut(_))
        ));
    }
}
