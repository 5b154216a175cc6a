//! Cooperative cancellation.
//!
//! The interrupt listener owns the only writer of the shared token; pipeline
//! components only read it through [`CancelToken::check`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{MigrateError, Result};

/// Exit status used when the grace period expires after an interrupt.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Return [`MigrateError::Cancelled`] once the token has been cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(MigrateError::Cancelled);
        }
        Ok(())
    }
}

/// Install the Ctrl-C listener.
///
/// On interrupt the listener cancels `token`, then waits `grace` before
/// terminating the process. A second interrupt during the grace period
/// does nothing extra.
pub fn install_interrupt_listener(token: CancelToken, grace: Duration) -> anyhow::Result<()> {
    let fired = AtomicBool::new(false);
    ctrlc::set_handler(move || {
        if fired.swap(true, Ordering::SeqCst) {
            return;
        }
        token.cancel();
        tracing::warn!("interrupt received, cancelling migration");
        std::thread::sleep(grace);
        tracing::error!("migration did not stop within {}s, exiting", grace.as_secs());
        std::process::exit(INTERRUPTED_EXIT_CODE);
    })?;
    Ok(())
}
