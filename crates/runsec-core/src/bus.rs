use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::event::ResolvedEvent;

/// Fan-out of resolved events to every consumer.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Arc<ResolvedEvent>>,
}

/// Describes a bus error.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("bus is stopped")]
    Stopped,
}

const BUFFER_SIZE: usize = 1000;

impl Bus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BUFFER_SIZE);
        Self { tx }
    }

    /// Publish an event. Having no receiver is not an error.
    pub fn send(&self, event: ResolvedEvent) {
        log::trace!(
            target: &format!("event::{}", event.kind),
            "{} [cpu {}] {:?} {:?}",
            event.timestamp,
            event.cpu,
            event.path,
            event.error
        );

        let _ = self.tx.send(Arc::new(event));
    }

    pub fn get_receiver(&self) -> broadcast::Receiver<Arc<ResolvedEvent>> {
        self.tx.subscribe()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receive an event from a [`broadcast::Receiver`]. Log a warning if we have
/// lost messages.
pub async fn receive_from_broadcast(
    rx: &mut broadcast::Receiver<Arc<ResolvedEvent>>,
    consumer: &str,
) -> Result<Arc<ResolvedEvent>, BusError> {
    let mut lost: u64 = 0;
    loop {
        match rx.recv().await {
            Ok(value) => {
                if lost > 0 {
                    log::warn!(target: consumer, "broadcast channel lagged {lost} messages");
                }
                return Ok(value);
            }
            Err(RecvError::Lagged(lagged)) => lost += lagged,
            Err(RecvError::Closed) => return Err(BusError::Stopped),
        }
    }
}
