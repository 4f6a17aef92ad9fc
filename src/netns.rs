//! # Network Namespace Isolation
//!
//! Optional confinement of an endpoint's network-facing completion loop
//! into a named Linux network namespace. When configured, a dedicated
//! thread enters the namespace and runs its own event loop; that loop
//! becomes the endpoint's logic target for inbound-frame completions,
//! which it relays onto the owning endpoint's queue.
//!
//! Entering a namespace is a process-global operation on the thread that
//! performs it, so this is Linux-only. Other targets reject the option at
//! configuration time; nothing is emulated.

use std::io;

#[cfg(target_os = "linux")]
use tokio::sync::mpsc;
#[cfg(target_os = "linux")]
use tracing::{info, warn};

#[cfg(target_os = "linux")]
use crate::endpoint::LogicJob;
use crate::router::LogicSender;

/// A running isolated logic loop.
pub struct IsolatedLogic {
    tx: LogicSender,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl IsolatedLogic {
    /// Sender for completions that must be dispatched on the isolated
    /// loop.
    pub fn sender(&self) -> LogicSender {
        self.tx.clone()
    }

    /// Spawn the isolated thread, enter `name`, and start relaying jobs
    /// to `forward_to`. Fails when the namespace cannot be entered; the
    /// endpoint refuses to start in that case.
    #[cfg(target_os = "linux")]
    pub fn spawn(name: &str, forward_to: LogicSender) -> io::Result<Self> {
        let ns_path = format!("/run/netns/{}", name);
        let (tx, mut rx) = mpsc::unbounded_channel::<LogicJob>();
        let (setup_tx, setup_rx) = std::sync::mpsc::sync_channel::<io::Result<()>>(1);
        let thread_name = format!("netns-{}", name);

        let thread = std::thread::Builder::new().name(thread_name).spawn(move || {
            if let Err(e) = enter_netns(&ns_path) {
                let _ = setup_tx.send(Err(e));
                return;
            }
            let _ = setup_tx.send(Ok(()));

            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    warn!(error = %e, "isolated event loop failed to start");
                    return;
                }
            };
            runtime.block_on(async move {
                while let Some(job) = rx.recv().await {
                    if forward_to.send(job).is_err() {
                        break;
                    }
                }
            });
        })?;

        match setup_rx.recv() {
            Ok(Ok(())) => {
                info!(netns = name, "network isolation active");
                Ok(Self { tx, thread: Some(thread) })
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(io::Error::new(
                io::ErrorKind::Other,
                "isolated thread died during setup",
            )),
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn spawn(_name: &str, _forward_to: LogicSender) -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "network namespace isolation requires linux",
        ))
    }
}

impl Drop for IsolatedLogic {
    fn drop(&mut self) {
        // The relay loop ends once every sender clone is gone; the thread
        // is detached rather than joined so shutdown never blocks on
        // completions still in flight.
        self.thread.take();
    }
}

#[cfg(target_os = "linux")]
fn enter_netns(ns_path: &str) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let file = std::fs::File::open(ns_path)?;
    let rc = unsafe { libc::setns(file.as_raw_fd(), libc::CLONE_NEWNET) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
