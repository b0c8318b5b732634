use std::pin::Pin;
use std::sync::Arc;

use cfg_if::cfg_if;
use futures::{future::Shared, FutureExt};
use std::future::Future;
use tokio::select;
use tokio::sync::watch;
use tracing::info;

cfg_if! {
    if #[cfg(windows)] {
        use tokio::signal::windows::*;

        async fn raw_shutdown_signal() {
            let mut  ctrl_c = ctrl_c().expect("Failed to attach Ctrl_C shutdown signal (windows)");
            let mut  ctrl_close = ctrl_close().expect("Failed to attach Ctrl_close shutdown signal (windows)");
            let mut  ctrl_shutdown = ctrl_shutdown().expect("Failed to attach Ctrl_shutdown shutdown signal (windows)");
            select! {
                _ = ctrl_c.recv() => (),
                _ = ctrl_close.recv() => (),
                _ = ctrl_shutdown.recv() => (),
            }
        }
    } else if #[cfg(unix)] {
        use tokio::signal::unix::*;

        async fn unix_shutdown_signal(signal_kind: SignalKind) {
            let mut signal = signal(signal_kind).expect("Failed to listen to unix shutdown signal");
            signal.recv().await;
        }

        async fn raw_shutdown_signal() {
            select! {
                _ = unix_shutdown_signal(SignalKind::interrupt()) => (),
                _ = unix_shutdown_signal(SignalKind::terminate()) => (),
                _ = unix_shutdown_signal(SignalKind::hangup()) => (),
            };
        }
    } else {
        compile_error!("Your OS does not support shutdown signal ! Are you targeting wasm ?");
    }
}

/// Resolves once shutdown has been requested. Cheap to clone, every clone resolves.
pub type ShutdownSignal = Shared<Pin<Box<dyn Future<Output = ()> + Send>>>;

/// Requests shutdown programmatically.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn request_shutdown(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        *self.sender.borrow()
    }
}

/// Creates a shutdown signal fired by [`ShutdownHandle::request_shutdown`] and,
/// when `listen_os_signals` is set, by SIGINT/SIGTERM/SIGHUP (Ctrl-C on windows).
pub fn shutdown_signal(listen_os_signals: bool) -> (ShutdownSignal, ShutdownHandle) {
    let (sender, mut receiver) = watch::channel(false);
    let signal = async move {
        select! {
            _ = raw_shutdown_signal(), if listen_os_signals => {
                info!("Shutdown signal detected. Attempting graceful shutdown...");
            }
            _ = receiver.wait_for(|requested| *requested) => {
                info!("Shutdown requested. Attempting graceful shutdown...");
            }
        }
    }
    .boxed()
    .shared();

    (
        signal,
        ShutdownHandle {
            sender: Arc::new(sender),
        },
    )
}
