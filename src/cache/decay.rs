//! Background decay of the control block's opportunistic `read` bit:
//! without decay, a bit set once by a single cold read would look
//! indistinguishable from a genuinely hot object forever.
//!
//! A dedicated named thread, woken on an interval, does one bounded unit
//! of work per wake.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::debug;

use crate::cbt::ControlBlockTable;

/// Periodically clears every control block's read bit, spread over
/// [`crate::config::Config::read_cache_window_sec`] so no single sweep
/// does a full scan in one burst.
pub struct DecaySweeper {
    cbt: Arc<ControlBlockTable>,
    window: Duration,
    shutdown: Arc<AtomicBool>,
}

impl DecaySweeper {
    /// Build a sweeper targeting one full decay pass every `window`.
    pub fn new(cbt: Arc<ControlBlockTable>, window: Duration) -> Self {
        Self {
            cbt,
            window,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Clear the read bit on every currently allocated control block.
    pub fn sweep_once(&self) {
        let zones = self.cbt.zone_count();
        for zone in 0..zones {
            self.cbt.clear_read_bits_in_zone(zone as u32);
        }
        debug!(zones, "completed read-bit decay sweep");
    }

    /// Spawn a background thread sweeping on `window`-spaced intervals
    /// until the returned handle is stopped or dropped.
    pub fn spawn(self) -> DecayHandle {
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.window;
        let join = std::thread::Builder::new()
            .name("arbokv-decay".into())
            .spawn(move || {
                while !shutdown.load(Ordering::Relaxed) {
                    self.sweep_once();
                    std::thread::sleep(interval);
                }
            })
            .expect("failed to spawn decay thread");
        DecayHandle {
            join: Some(join),
            shutdown: self.shutdown,
        }
    }
}

/// Handle to a spawned background decay thread.
pub struct DecayHandle {
    join: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl DecayHandle {
    /// Signal the decay thread to stop and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for DecayHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}
