use netsim_core::{Message, OperatingSystem, OsError, Port, Process};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// An application that stores the first message it receives on a port and
/// then ends the simulation.
pub struct Capture {
    port: Port,
    message: Mutex<Option<Message>>,
    shutdown: Option<CancellationToken>,
}

impl Capture {
    pub fn new(port: impl Into<Port>) -> Self {
        Self {
            port: port.into(),
            message: Mutex::new(None),
            shutdown: None,
        }
    }

    /// Cancels `shutdown` once a message arrives.
    pub fn shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Gets the message that was received.
    pub fn message(&self) -> Option<Message> {
        self.message.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Process for Capture {
    async fn run(self: Arc<Self>, os: OperatingSystem) -> Result<(), OsError> {
        let message = loop {
            if let Some(message) = os.receive(self.port, None).await? {
                break message;
            }
        };
        tracing::info!("Captured {}", message);
        *self.message.lock().unwrap() = Some(message);
        if let Some(shutdown) = &self.shutdown {
            shutdown.cancel();
        }
        Ok(())
    }
}
