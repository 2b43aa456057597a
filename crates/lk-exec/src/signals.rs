//! Signal forwarding scoped to one subprocess call

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::runner::{ForwardedSignal, ProcessRunner};

/// Relays SIGINT/SIGTERM received by this process to a child.
///
/// The forwarding task lives exactly as long as the call: [`stop`] cancels
/// it and waits for it to finish.
///
/// [`stop`]: SignalForwarder::stop
pub struct SignalForwarder {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl SignalForwarder {
    /// Start forwarding signals to `pid`.
    ///
    /// Returns `None` if the signal streams cannot be registered.
    pub fn start(runner: Arc<dyn ProcessRunner>, pid: u32) -> Option<Self> {
        let mut listener = match SignalListener::register() {
            Ok(listener) => listener,
            Err(e) => {
                tracing::warn!("Signal forwarding unavailable for pid {}: {}", pid, e);
                return None;
            }
        };

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                let signal = tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => break,
                    signal = listener.recv() => match signal {
                        Some(signal) => signal,
                        None => break,
                    },
                };

                tracing::info!("Forwarding {:?} to child pid {}", signal, pid);
                if let Err(e) = runner.signal(pid, signal) {
                    tracing::debug!("Failed to forward {:?} to pid {}: {}", signal, pid, e);
                }
            }
        });

        Some(Self { cancel, handle })
    }

    /// Stop forwarding and wait for the task to end
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            tracing::debug!("Signal forwarder ended abnormally: {}", e);
        }
    }
}

#[cfg(unix)]
struct SignalListener {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl SignalListener {
    fn register() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    async fn recv(&mut self) -> Option<ForwardedSignal> {
        tokio::select! {
            received = self.interrupt.recv() => received.map(|_| ForwardedSignal::Interrupt),
            received = self.terminate.recv() => received.map(|_| ForwardedSignal::Terminate),
        }
    }
}

#[cfg(not(unix))]
struct SignalListener;

#[cfg(not(unix))]
impl SignalListener {
    fn register() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> Option<ForwardedSignal> {
        tokio::signal::ctrl_c()
            .await
            .ok()
            .map(|_| ForwardedSignal::Interrupt)
    }
}
