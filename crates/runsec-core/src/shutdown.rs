use tokio::sync::broadcast;

/// Returned by tasks which stopped because they were asked to.
#[derive(Debug)]
pub struct CleanExit(());

pub struct ShutdownSignal {
    tx: broadcast::Sender<()>,
    rx: broadcast::Receiver<()>,
}

impl Clone for ShutdownSignal {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.tx.subscribe(),
        }
    }
}

impl ShutdownSignal {
    pub fn new() -> (ShutdownSender, ShutdownSignal) {
        let (tx, rx) = broadcast::channel(1);
        (ShutdownSender(tx.clone()), ShutdownSignal { tx, rx })
    }

    /// Wait until the [`ShutdownSender`] fires.
    pub async fn recv(&mut self) -> CleanExit {
        let _ = self.rx.recv().await;
        CleanExit(())
    }
}

pub struct ShutdownSender(broadcast::Sender<()>);

impl ShutdownSender {
    pub fn send_signal(self) {
        let _ = self.0.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_clone_is_notified() {
        let (tx, mut signal) = ShutdownSignal::new();
        let mut other = signal.clone();
        tx.send_signal();
        signal.recv().await;
        other.recv().await;
    }
}
