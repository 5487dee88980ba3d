use crate::error::{Error, Result};
use crate::protocol::DEFAULT_WINDOW_SIZE;
use tokio::sync::Semaphore;

/// Default number of inbound streams waiting for `accept()`
pub const DEFAULT_ACCEPT_BACKLOG: usize = 256;

/// Muxer tunables
///
/// Both ends of a connection must agree on `window_size`: it is the credit a
/// sender starts with and the number of bytes a receiver will buffer per
/// stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Per-stream flow control window in bytes
    pub window_size: usize,

    /// Inbound streams queued for `accept()` before new SYNs are refused
    pub accept_backlog: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            accept_backlog: DEFAULT_ACCEPT_BACKLOG,
        }
    }
}

impl Config {
    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size;
        self
    }

    pub fn with_accept_backlog(mut self, accept_backlog: usize) -> Self {
        self.accept_backlog = accept_backlog;
        self
    }

    /// Check that the values can be used to build a muxer.
    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(Error::InvalidConfig("window_size must be non-zero".into()));
        }
        // Credit is granted through WINDOW_UPDATE frames (u32) and tracked by a semaphore.
        let max_window = (u32::MAX as usize).min(Semaphore::MAX_PERMITS);
        if self.window_size > max_window {
            return Err(Error::InvalidConfig(format!(
                "window_size {} exceeds {}",
                self.window_size, max_window
            )));
        }
        if self.accept_backlog == 0 {
            return Err(Error::InvalidConfig(
                "accept_backlog must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Consumed bytes a reader accumulates before returning credit.
    pub(crate) fn window_update_threshold(&self) -> usize {
        (self.window_size / 2).max(1)
    }
}
