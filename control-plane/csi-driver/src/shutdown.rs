//! Process-wide shutdown event, triggered by SIGINT or SIGTERM.
use lazy_static::lazy_static;
use std::sync::Mutex;
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::watch,
};
use tracing::{info, warn};

/// Shutdown Event.
pub struct Shutdown {}

impl Shutdown {
    /// Returns a future that completes when the shutdown signal has been received.
    /// Every caller gets notified, whether it started waiting before or after the signal.
    pub async fn wait() {
        let mut receiver = Self::receiver();
        // An error means the signal task is gone, which is only possible once it has fired.
        let _ = receiver.wait_for(|signalled| *signalled).await;
    }

    fn receiver() -> watch::Receiver<bool> {
        lazy_static! {
            static ref EVENT: Mutex<Option<watch::Receiver<bool>>> = Mutex::new(None);
        }
        let mut event = EVENT.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        event
            .get_or_insert_with(|| {
                let (sender, receiver) = watch::channel(false);
                tokio::spawn(async move {
                    let kind = wait_int_term().await;
                    info!(signal = ?kind, "Shutdown signal received");
                    sender.send_replace(true);
                    // keep the sender alive so late waiters observe the value
                    sender.closed().await;
                });
                receiver
            })
            .clone()
    }
}

/// Waits for the reception of SIGINT or SIGTERM.
async fn wait_int_term() -> Option<SignalKind> {
    let (mut term, mut int) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(error), _) | (_, Err(error)) => {
            warn!(%error, "Failed to register the shutdown signal handlers");
            return futures::future::pending().await;
        }
    };
    tokio::select! {
        _ = term.recv() => Some(SignalKind::terminate()),
        _ = int.recv() => Some(SignalKind::interrupt()),
    }
}
