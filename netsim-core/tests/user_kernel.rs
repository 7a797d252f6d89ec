use async_trait::async_trait;
use common::{eventually, Passive};
use netsim_core::{
    rip::{RipDatagram, RipEntry},
    KnownPort, Message, OperatingSystem, OsError, Process, Simulator,
};
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, time::Instant};

mod common;

/// Reports through a channel so tests can watch a process from outside.
struct Report {
    events: mpsc::UnboundedSender<String>,
}

impl Report {
    fn send(&self, event: impl Into<String>) {
        let _ = self.events.send(event.into());
    }
}

fn channel() -> (Arc<Report>, mpsc::UnboundedReceiver<String>) {
    let (events, receiver) = mpsc::unbounded_channel();
    (Arc::new(Report { events }), receiver)
}

async fn next(events: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for the process")
        .expect("the process hung up")
}

struct WaitOnEmptyPort(Arc<Report>);

#[async_trait]
impl Process for WaitOnEmptyPort {
    async fn run(self: Arc<Self>, os: OperatingSystem) -> Result<(), OsError> {
        let started = Instant::now();
        let received = os.receive(9, Some(Duration::from_millis(100))).await?;
        let elapsed = started.elapsed();
        self.0.send(format!(
            "{} {}",
            received.is_none(),
            elapsed >= Duration::from_millis(100) && elapsed < Duration::from_secs(1)
        ));
        Ok(())
    }
}

#[tokio::test]
async fn receive_on_an_idle_port_times_out() -> anyhow::Result<()> {
    let (report, mut events) = channel();
    let sim = Simulator::new();
    sim.build_node()
        .kernel(sim.create_user_kernel(Some(Arc::new(WaitOnEmptyPort(report)))))
        .create()?;
    sim.start();
    assert_eq!(next(&mut events).await, "true true");
    sim.destroy_all().await;
    Ok(())
}

struct Stage {
    name: &'static str,
    then: Option<Arc<dyn Process>>,
    report: Arc<Report>,
}

#[async_trait]
impl Process for Stage {
    async fn run(self: Arc<Self>, os: OperatingSystem) -> Result<(), OsError> {
        self.report.send(self.name);
        match &self.then {
            Some(then) => Err(os.replace_process(then.clone())),
            None => {
                os.cancelled().await;
                Err(OsError::Cancelled)
            }
        }
    }
}

#[tokio::test]
async fn processes_replace_themselves() -> anyhow::Result<()> {
    let (report, mut events) = channel();
    let second = Arc::new(Stage {
        name: "second",
        then: None,
        report: report.clone(),
    });
    let first = Arc::new(Stage {
        name: "first",
        then: Some(second),
        report: report.clone(),
    });
    let sim = Simulator::new();
    let kernel = sim.create_user_kernel(Some(first));
    sim.build_node().kernel(kernel.clone()).create()?;
    sim.start();

    assert_eq!(next(&mut events).await, "first");
    assert_eq!(next(&mut events).await, "second");
    assert!(kernel.has_process());

    // Replacing from outside cancels the waiting stage
    kernel.set_process(Arc::new(Stage {
        name: "third",
        then: None,
        report,
    }));
    assert_eq!(next(&mut events).await, "third");

    sim.destroy_all().await;
    Ok(())
}

#[tokio::test]
async fn process_installed_after_boot_runs() -> anyhow::Result<()> {
    let (report, mut events) = channel();
    let sim = Simulator::new();
    let kernel = sim.create_user_kernel(None);
    sim.build_node().kernel(kernel.clone()).create()?;
    sim.start();
    assert!(!kernel.has_process());

    tokio::time::sleep(Duration::from_millis(50)).await;
    kernel.set_process(Arc::new(Stage {
        name: "late",
        then: None,
        report,
    }));
    assert_eq!(next(&mut events).await, "late");

    sim.destroy_all().await;
    Ok(())
}

struct Quick(Arc<Report>);

#[async_trait]
impl Process for Quick {
    async fn run(self: Arc<Self>, _os: OperatingSystem) -> Result<(), OsError> {
        self.0.send("done");
        Ok(())
    }
}

#[tokio::test]
async fn finished_process_is_no_longer_reported() -> anyhow::Result<()> {
    let (report, mut events) = channel();
    let sim = Simulator::new();
    let kernel = sim.create_user_kernel(Some(Arc::new(Quick(report))));
    sim.build_node().kernel(kernel.clone()).create()?;
    assert!(kernel.has_process());
    sim.start();

    assert_eq!(next(&mut events).await, "done");
    assert!(eventually(Duration::from_secs(2), || !kernel.has_process()).await);

    sim.destroy_all().await;
    Ok(())
}

struct Forker(Arc<Report>);

#[async_trait]
impl Process for Forker {
    async fn run(self: Arc<Self>, os: OperatingSystem) -> Result<(), OsError> {
        for i in 0..2 {
            let report = self.0.clone();
            let child = os.clone();
            os.fork(async move {
                child.sleep(Duration::from_millis(50)).await?;
                report.send(format!("fork {}", i));
                child.cancelled().await;
                report.send(format!("fork {} cancelled", i));
                Ok(())
            });
        }
        // Returning leaves the forks running
        Ok(())
    }
}

#[tokio::test]
async fn forks_outlive_the_process_until_shutdown() -> anyhow::Result<()> {
    let (report, mut events) = channel();
    let sim = Simulator::new();
    let kernel = sim.create_user_kernel(Some(Arc::new(Forker(report))));
    sim.build_node().kernel(kernel.clone()).create()?;
    sim.start();

    let mut seen = vec![next(&mut events).await, next(&mut events).await];
    seen.sort();
    assert_eq!(seen, ["fork 0", "fork 1"]);
    assert!(kernel.has_process());

    let teardown = Instant::now();
    sim.destroy_all().await;
    assert!(teardown.elapsed() < Duration::from_secs(1));
    Ok(())
}

#[tokio::test]
async fn leaves_answer_router_discovery() -> anyhow::Result<()> {
    let sim = Simulator::new();
    let router = sim.build_node().kernel(Passive::new()).create()?;
    let leaf = sim
        .build_node()
        .kernel(sim.create_user_kernel(None))
        .connections([&router])
        .create()?;
    sim.start();
    let iface = router.interfaces()[0].clone();

    let advertisement = RipDatagram::router(vec![RipEntry::new(router.address(), 0)]);
    iface.send(&Message::new(
        router.address(),
        KnownPort::Rip,
        0,
        KnownPort::Discovery,
        advertisement,
    ))?;
    let answer = iface
        .receive(Some(Duration::from_secs(2)))
        .await?
        .expect("the leaf should answer");
    assert_eq!(answer.source(), leaf.address());
    assert_eq!(answer.destination(), router.address());
    assert!(answer.sent_to_port(KnownPort::Rip));
    assert!(!answer.data_as::<RipDatagram>()?.is_from_router());

    // Another leaf's answer is not answered again
    iface.send(&Message::new(
        router.address(),
        KnownPort::Discovery,
        leaf.address(),
        KnownPort::Discovery,
        RipDatagram::not_a_router(),
    ))?;
    assert!(iface
        .receive(Some(Duration::from_millis(200)))
        .await?
        .is_none());

    sim.destroy_all().await;
    Ok(())
}

struct Echo;

#[async_trait]
impl Process for Echo {
    async fn run(self: Arc<Self>, os: OperatingSystem) -> Result<(), OsError> {
        loop {
            let Some(message) = os.receive(7, None).await? else {
                continue;
            };
            let text: String = message.data_as()?;
            os.send_to(message.source(), 7, message.source_port(), text.to_uppercase())?;
        }
    }
}

#[tokio::test]
async fn traffic_is_sorted_by_port() -> anyhow::Result<()> {
    let sim = Simulator::new();
    let peer = sim.build_node().kernel(Passive::new()).create()?;
    let kernel = sim.create_user_kernel(None);
    let host = sim
        .build_node()
        .kernel(kernel.clone())
        .connections([&peer])
        .create()?;
    sim.start();
    let iface = peer.interfaces()[0].clone();

    // Queued before any process runs; the port keeps it
    iface.send(&Message::new(peer.address(), 12, host.address(), 7, "hi".to_string()))?;
    iface.send(&Message::new(peer.address(), 12, host.address(), 8, "no".to_string()))?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    kernel.set_process(Arc::new(Echo));

    let reply = iface
        .receive(Some(Duration::from_secs(2)))
        .await?
        .expect("the echo should answer");
    assert_eq!(reply.destination_port(), 12);
    assert_eq!(reply.data_as::<String>()?, "HI");
    assert!(iface
        .receive(Some(Duration::from_millis(200)))
        .await?
        .is_none());

    sim.destroy_all().await;
    Ok(())
}

struct SendAlone(Arc<Report>);

#[async_trait]
impl Process for SendAlone {
    async fn run(self: Arc<Self>, os: OperatingSystem) -> Result<(), OsError> {
        let outcome = match os.send_to(1, 1, 1, ()) {
            Err(OsError::NoInterface) => "no interface",
            Err(OsError::Disconnected) => "disconnected",
            Ok(()) => "sent",
            Err(_) => "other",
        };
        self.0.send(outcome);
        Ok(())
    }
}

#[tokio::test]
async fn sending_needs_a_connected_interface() -> anyhow::Result<()> {
    let (report, mut events) = channel();
    let sim = Simulator::new();
    let kernel = sim.create_user_kernel(Some(Arc::new(SendAlone(report.clone()))));
    let host = sim.build_node().kernel(kernel.clone()).create()?;
    sim.start();
    assert_eq!(next(&mut events).await, "no interface");

    let other = sim.build_node().kernel(Passive::new()).create()?;
    let iface = sim.connect(&host, &other)?;
    sim.disconnect(&iface)?;
    kernel.set_process(Arc::new(SendAlone(report)));
    assert_eq!(next(&mut events).await, "disconnected");

    sim.destroy_all().await;
    Ok(())
}
