//! The [`BpfSender`] trait is used by [`crate::Program`] to hand raw records
//! and errors over from the per-CPU reader tasks.
//!
//! [`BpfSender::send`] must not block since it runs inside the reader loop.

use tokio::sync::mpsc;

use crate::{ProgramError, program::RawEvent};

pub trait BpfSender: Clone + Send + 'static {
    /// Must not block since it can be used in async contexts
    fn send(&mut self, data: Result<RawEvent, ProgramError>);
}

/// Simple implementation for tokio::mpsc bounded channels.
/// Sending with full channel will drop messages.
impl BpfSender for mpsc::Sender<Result<RawEvent, ProgramError>> {
    fn send(&mut self, data: Result<RawEvent, ProgramError>) {
        if self.try_send(data).is_err() {
            log::warn!("dropping msg");
        }
    }
}

/// BpfSenderWrapper wraps a BpfSender with a new one which calls
/// a callback on every record read. Used to observe the raw stream
/// without changing where it goes.
#[derive(Clone)]
pub struct BpfSenderWrapper<S, F> {
    cb: F,
    inner: S,
}

impl<S, F> BpfSenderWrapper<S, F> {
    pub fn new(inner: S, cb: F) -> Self {
        Self { inner, cb }
    }
}

impl<S, F> BpfSender for BpfSenderWrapper<S, F>
where
    S: BpfSender,
    F: FnMut(&RawEvent) + Clone + Send + 'static,
{
    fn send(&mut self, data: Result<RawEvent, ProgramError>) {
        if let Ok(event) = &data {
            (self.cb)(event);
        }
        self.inner.send(data)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use bytes::Bytes;

    use super::*;

    #[tokio::test]
    async fn wrapper_sees_every_event() {
        let (tx, mut rx) = mpsc::channel(4);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let mut sender = BpfSenderWrapper::new(tx, move |_: &RawEvent| {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        for timestamp in 0..3 {
            sender.send(Ok(RawEvent {
                cpu: 0,
                timestamp,
                buffer: Bytes::from_static(b"payload"),
            }));
        }
        sender.send(Err(ProgramError::MapNotFound("events".to_string())));

        assert_eq!(seen.load(Ordering::Relaxed), 3);
        for timestamp in 0..3 {
            let event = rx.recv().await.unwrap().unwrap();
            assert_eq!(event.timestamp, timestamp);
        }
        assert!(rx.recv().await.unwrap().is_err());
    }

    #[test]
    fn full_channel_drops() {
        let (mut tx, mut rx) = mpsc::channel(1);
        for timestamp in 0..2 {
            BpfSender::send(
                &mut tx,
                Ok(RawEvent {
                    cpu: 1,
                    timestamp,
                    buffer: Bytes::new(),
                }),
            );
        }
        assert_eq!(rx.try_recv().unwrap().unwrap().timestamp, 0);
        assert!(rx.try_recv().is_err());
    }
}
