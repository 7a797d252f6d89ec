use super::{run_until, user_kernel, Settings, SimulationError};
use crate::applications::{Capture, SendMessage};
use netsim_core::{Message, Simulator};
use tokio_util::sync::CancellationToken;

const PORT: i32 = 0xbeef;

/// Three routers in a line, each with one host:
///
/// ```text
/// L1 - R1 - R2 - R3 - L3
///            |
///            L2
/// ```
///
/// L1 keeps sending a greeting to L3 while the routers discover the line.
/// The simulation ends when L3 captures the first greeting that makes it
/// across, and returns that message.
pub async fn rip_line(settings: Settings) -> Result<Message, SimulationError> {
    let sim = Simulator::with_config(settings.sim_config());
    let done = CancellationToken::new();
    let period = settings.advertise_period;

    let routers = [
        sim.create_router_kernel(),
        sim.create_router_kernel(),
        sim.create_router_kernel(),
    ];
    let r1 = sim.build_node().name("R1").kernel(routers[0].clone()).create()?;
    let r2 = sim
        .build_node()
        .name("R2")
        .kernel(routers[1].clone())
        .connections([&r1])
        .create()?;
    let r3 = sim
        .build_node()
        .name("R3")
        .kernel(routers[2].clone())
        .connections([&r2])
        .create()?;

    let l3 = sim.build_node().name("L3");
    let greeting = SendMessage::new(vec!["Hello from L1".to_string()], l3.address(), PORT)
        .delay(period * 2)
        .repeat_every(period);
    sim.build_node()
        .name("L1")
        .kernel(user_kernel(&sim, greeting.shared()))
        .connections([&r1])
        .create()?;
    sim.build_node()
        .name("L2")
        .kernel(sim.create_user_kernel(None))
        .connections([&r2])
        .create()?;
    let capture = Capture::new(PORT).shutdown(done.clone()).shared();
    l3.kernel(user_kernel(&sim, capture.clone()))
        .connections([&r3])
        .create()?;

    let finished = run_until(&sim, &done, settings.time_limit).await;
    for (node, router) in [&r1, &r2, &r3].into_iter().zip(&routers) {
        for route in router.routing_table() {
            tracing::info!(
                parent: node.span(),
                "Route to {:x} costs {} via interface {}",
                route.destination,
                route.cost,
                route.next_hop
            );
        }
    }
    sim.destroy_all().await;

    match (finished, capture.message()) {
        (true, Some(message)) => Ok(message),
        _ => Err(SimulationError::TimedOut(settings.time_limit)),
    }
}
