//! Self-rearming timer threads
//!
//! The engine has two timers: the pseudo-tick, which samples running
//! groups faster than the native scheduler tick, and the boost pulse
//! expiry. Each runs on its own named thread that sleeps on a command
//! channel and a deadline at the same time.
//!
//! The callback returns the delay until it wants to run again, or `None`
//! to go idle. Arming and cancelling are fire-and-forget and idempotent.

use crate::error::{Error, Result};
use crossbeam::channel::{self, select, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

enum Command {
    /// Fire after the delay, replacing any pending deadline
    Arm(Duration),

    /// Fire after the delay unless a deadline is already pending
    Start(Duration),

    Cancel,
    Shutdown,
}

/// Handle to one timer thread
///
/// Dropping the handle stops and joins the thread.
pub struct TimerWorker {
    name: String,
    tx: Sender<Command>,
    armed: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TimerWorker {
    /// Start an idle timer thread running `callback` on expiry
    pub fn spawn<F>(name: &str, callback: F) -> Result<Self>
    where
        F: FnMut() -> Option<Duration> + Send + 'static,
    {
        let (tx, rx) = channel::unbounded();
        let armed = Arc::new(AtomicBool::new(false));
        let worker_armed = Arc::clone(&armed);

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(rx, worker_armed, callback))
            .map_err(|e| Error::Timer(format!("failed to spawn {name}: {e}")))?;

        debug!(timer = name, "timer thread started");
        Ok(Self {
            name: name.to_string(),
            tx,
            armed,
            handle: Some(handle),
        })
    }

    /// Fire after `delay`, replacing a pending deadline
    pub fn arm(&self, delay: Duration) {
        self.send(Command::Arm(delay));
    }

    /// Fire after `delay` unless already armed
    pub fn start(&self, delay: Duration) {
        if !self.is_armed() {
            self.send(Command::Start(delay));
        }
    }

    /// Drop the pending deadline; no-op when idle
    pub fn cancel(&self) {
        self.send(Command::Cancel);
    }

    /// Whether a deadline is pending, as last seen by the timer thread
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Stop the thread and wait for it
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.send(Command::Shutdown);
            let _ = handle.join();
            debug!(timer = %self.name, "timer thread stopped");
        }
    }

    fn send(&self, cmd: Command) {
        if self.tx.send(cmd).is_err() {
            trace!(timer = %self.name, "timer thread gone");
        }
    }
}

impl Drop for TimerWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<F>(rx: Receiver<Command>, armed: Arc<AtomicBool>, mut callback: F)
where
    F: FnMut() -> Option<Duration>,
{
    let mut deadline: Option<Instant> = None;

    loop {
        let expiry = match deadline {
            Some(at) => channel::after(at.saturating_duration_since(Instant::now())),
            None => channel::never(),
        };

        select! {
            recv(rx) -> msg => match msg {
                Ok(Command::Arm(delay)) => deadline = Some(Instant::now() + delay),
                Ok(Command::Start(delay)) => {
                    deadline.get_or_insert_with(|| Instant::now() + delay);
                }
                Ok(Command::Cancel) => deadline = None,
                Ok(Command::Shutdown) | Err(_) => break,
            },
            recv(expiry) -> _ => {
                deadline = callback().map(|delay| Instant::now() + delay);
            }
        }

        armed.store(deadline.is_some(), Ordering::Release);
    }

    armed.store(false, Ordering::Release);
}
