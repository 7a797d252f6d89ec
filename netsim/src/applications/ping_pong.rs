use netsim_core::{Address, Datum, Message, OperatingSystem, OsError, Port, Process};
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;

/// What two [`PingPong`] players hit back and forth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ball {
    pub ttl: u32,
}

impl Datum for Ball {
    const TAG: &'static str = "ping_pong::Ball";
}

/// An application that sends a Time To Live (TTL) to another host. The other
/// host sends the TTL back minus 1. Once the TTL reaches 0 the game ends.
pub struct PingPong {
    is_initiator: bool,
    /// The host the initiator serves to
    remote: Address,
    port: Port,
    ttl: u32,
    /// How long the initiator waits for the first return before serving again
    retry: Duration,
    /// Cancelled once the game is over
    shutdown: Option<CancellationToken>,
    completed: AtomicBool,
}

impl PingPong {
    pub fn new(is_initiator: bool, remote: Address, port: impl Into<Port>) -> Self {
        Self {
            is_initiator,
            remote,
            port: port.into(),
            ttl: 255,
            retry: Duration::from_secs(1),
            shutdown: None,
            completed: AtomicBool::new(false),
        }
    }

    /// The TTL of the first serve.
    pub fn ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    /// How long to wait for the first return before serving again. Serves
    /// get lost while routes are still being discovered.
    pub fn retry(mut self, retry: Duration) -> Self {
        self.retry = retry;
        self
    }

    /// Cancels `shutdown` when this player ends the game.
    pub fn shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Whether this player received the last ball.
    pub fn completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    async fn serve(&self, os: &OperatingSystem) -> Result<Message, OsError> {
        loop {
            os.send_to(self.remote, self.port, self.port, Ball { ttl: self.ttl })?;
            if let Some(message) = os.receive(self.port, Some(self.retry)).await? {
                return Ok(message);
            }
            tracing::debug!("No return from {:x}, serving again", self.remote);
        }
    }
}

#[async_trait::async_trait]
impl Process for PingPong {
    async fn run(self: Arc<Self>, os: OperatingSystem) -> Result<(), OsError> {
        let mut next = match self.is_initiator {
            true => Some(self.serve(&os).await?),
            false => None,
        };
        loop {
            let message = match next.take() {
                Some(message) => message,
                None => match os.receive(self.port, None).await? {
                    Some(message) => message,
                    None => continue,
                },
            };
            let Ball { ttl } = message.data_as()?;
            if ttl % 2 == 0 {
                tracing::info!("Pong {}", ttl);
            } else {
                tracing::info!("Ping {}", ttl);
            }

            let ttl = ttl.saturating_sub(1);
            if ttl == 0 {
                tracing::info!("TTL has reached 0, PingPong has successfully completed");
                self.completed.store(true, Ordering::Release);
                if let Some(shutdown) = &self.shutdown {
                    shutdown.cancel();
                }
                return Ok(());
            }
            os.send_to(
                message.source(),
                self.port,
                message.source_port(),
                Ball { ttl },
            )?;
        }
    }
}
