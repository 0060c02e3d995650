//! Runtime configuration (spec §6 ambient stack): pool sizes, batching
//! limits and poll tuning, loadable from TOML the way a small service binary
//! would load it.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// InfiniBand MTUs are powers of two between 256 and 4096 bytes; buffers are
/// sized to the active MTU so a single send/receive work request never spans
/// more than one buffer.
pub const DEFAULT_BUFFER_LENGTH: usize = 4096;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of busy-poll iterations an [`crate::reactor::EventProcessor`]
    /// runs before falling back to a blocking `epoll_wait`.
    pub poll_cycles: u32,

    /// Upper bound on the number of idle fibers an
    /// [`crate::fiber::FiberCache`] keeps around per processor.
    pub fiber_cache_size: usize,

    /// Upper bound on outstanding synchronous RPC requests per connection
    /// before the caller blocks (spec §8 backpressure). Must be at least 1.
    pub max_pending_responses: usize,

    /// Maximum number of bytes a [`crate::message::Batcher`] coalesces into
    /// a single send work request.
    pub max_batch_size: usize,

    /// Number of buffers kept in the send/receive pool.
    pub buffer_count: usize,

    /// Length in bytes of each pooled buffer, normally the active MTU.
    pub buffer_length: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            poll_cycles: 1000,
            fiber_cache_size: 64,
            max_pending_responses: 64,
            max_batch_size: 8 * DEFAULT_BUFFER_LENGTH,
            buffer_count: 256,
            buffer_length: DEFAULT_BUFFER_LENGTH,
        }
    }
}

impl Config {
    /// Parses a configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Config> {
        let config: Config =
            toml::from_str(text).map_err(|e| Error::InvalidArgument(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
        let text = fs::read_to_string(path)?;
        Config::from_toml(&text)
    }

    /// Checks the invariants spec §6 calls out explicitly; everything else
    /// is a plain value that callers are free to mistune.
    pub fn validate(&self) -> Result<()> {
        if self.max_pending_responses == 0 {
            return Err(Error::InvalidArgument(
                "max_pending_responses must be at least 1".into(),
            ));
        }
        if self.buffer_count == 0 {
            return Err(Error::InvalidArgument(
                "buffer_count must be at least 1".into(),
            ));
        }
        if self.buffer_length == 0 {
            return Err(Error::InvalidArgument(
                "buffer_length must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
