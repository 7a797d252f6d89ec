use netsim_core::{Address, Datum, OperatingSystem, OsError, Port, Process};
use std::{sync::Arc, time::Duration};

/// An application that sends a fixed list of payloads to one destination.
pub struct SendMessage<T> {
    messages: Vec<T>,
    destination: Address,
    port: Port,
    source_port: Port,
    delay: Duration,
    /// Sends the list again after every interval until cancelled
    repeat: Option<Duration>,
}

impl<T: Datum + Clone> SendMessage<T> {
    pub fn new(messages: Vec<T>, destination: Address, port: impl Into<Port>) -> Self {
        let port = port.into();
        Self {
            messages,
            destination,
            port,
            source_port: port,
            delay: Duration::ZERO,
            repeat: None,
        }
    }

    pub fn source_port(mut self, port: impl Into<Port>) -> Self {
        self.source_port = port.into();
        self
    }

    /// How long to wait before the first send.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sends the whole list again every `interval` until the process is
    /// cancelled.
    pub fn repeat_every(mut self, interval: Duration) -> Self {
        self.repeat = Some(interval);
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait::async_trait]
impl<T: Datum + Clone> Process for SendMessage<T> {
    async fn run(self: Arc<Self>, os: OperatingSystem) -> Result<(), OsError> {
        os.sleep(self.delay).await?;
        loop {
            for message in &self.messages {
                os.send_to(self.destination, self.source_port, self.port, message.clone())?;
            }
            tracing::debug!(
                "Sent {} messages to {:x}",
                self.messages.len(),
                self.destination
            );
            match self.repeat {
                Some(interval) => os.sleep(interval).await?,
                None => return Ok(()),
            }
        }
    }
}
