//! Two-phase handoff between the TCP prober and the response capture.
//!
//! Each signal is a rendezvous: `deliver` returns only once the other side
//! has taken the value, and both directions are bounded by a timeout. A value
//! whose sender gave up is discarded by the receiver instead of being
//! mistaken for the next one.

use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::state::{HopResult, Probe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HandoffError {
    #[error("handoff not completed within {0:?}")]
    TimedOut(Duration),
    #[error("peer went away")]
    Closed,
}

struct Envelope<T> {
    value: T,
    ack: oneshot::Sender<()>,
}

pub struct HandoffSender<T> {
    tx: mpsc::Sender<Envelope<T>>,
    within: Duration,
}

pub struct HandoffReceiver<T> {
    rx: mpsc::Receiver<Envelope<T>>,
    within: Duration,
}

/// A single-slot rendezvous bounded by `within`
pub fn handoff<T>(within: Duration) -> (HandoffSender<T>, HandoffReceiver<T>) {
    let (tx, rx) = mpsc::channel(1);
    (HandoffSender { tx, within }, HandoffReceiver { rx, within })
}

impl<T> HandoffSender<T> {
    /// Hand `value` over and wait until the receiver has taken it
    pub async fn deliver(&self, value: T) -> Result<(), HandoffError> {
        let (ack, acked) = oneshot::channel();
        let exchange = async {
            self.tx
                .send(Envelope { value, ack })
                .await
                .map_err(|_| HandoffError::Closed)?;
            acked.await.map_err(|_| HandoffError::Closed)
        };

        match tokio::time::timeout(self.within, exchange).await {
            Ok(result) => result,
            Err(_) => Err(HandoffError::TimedOut(self.within)),
        }
    }
}

impl<T> HandoffReceiver<T> {
    /// Wait for the next value whose sender is still waiting
    pub async fn accept(&mut self) -> Result<T, HandoffError> {
        let deadline = Instant::now() + self.within;
        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Err(_) => return Err(HandoffError::TimedOut(self.within)),
                Ok(None) => return Err(HandoffError::Closed),
                Ok(Some(envelope)) => {
                    if envelope.ack.send(()).is_ok() {
                        return Ok(envelope.value);
                    }
                    tracing::debug!("discarding abandoned handoff");
                }
            }
        }
    }
}

/// Prober half: announces probes, then waits for the capture's verdict
pub struct ProberSide {
    sent: HandoffSender<Probe>,
    ready: HandoffReceiver<HopResult>,
}

/// Capture half: waits for a probe, then reports what it saw
pub struct CaptureSide {
    sent: HandoffReceiver<Probe>,
    ready: HandoffSender<HopResult>,
}

/// Paired halves sharing one handoff timeout
pub fn coordinator(within: Duration) -> (ProberSide, CaptureSide) {
    let (sent_tx, sent_rx) = handoff(within);
    let (ready_tx, ready_rx) = handoff(within);
    (
        ProberSide {
            sent: sent_tx,
            ready: ready_rx,
        },
        CaptureSide {
            sent: sent_rx,
            ready: ready_tx,
        },
    )
}

impl ProberSide {
    /// Phase 1: tell the capture a probe just left
    pub async fn probe_sent(&self, probe: Probe) -> Result<(), HandoffError> {
        self.sent.deliver(probe).await
    }

    /// Phase 2: wait for the capture to classify the probe
    pub async fn await_ready(&mut self) -> Result<HopResult, HandoffError> {
        self.ready.accept().await
    }
}

impl CaptureSide {
    pub async fn await_probe(&mut self) -> Result<Probe, HandoffError> {
        self.sent.accept().await
    }

    pub async fn ready(&self, hop: HopResult) -> Result<(), HandoffError> {
        self.ready.deliver(hop).await
    }
}
