//! Transport configuration options.

use std::net::TcpStream;
use std::time::Duration;

use keelson_core::config::Config;

const DEFAULT_BUFFER_SIZE: usize = 4096;
const DEFAULT_READ_PACKET: usize = 5;
const DEFAULT_WRITE_PACKET: usize = 100;
const DEFAULT_MAX_FRAME: usize = 16 << 20;

/// Per-transport tuning knobs.
///
/// # Examples
///
/// ```
/// use keelson_net::Options;
/// use std::time::Duration;
///
/// let opts = Options::default()
///     .with_no_delay(true)
///     .with_keep_alive(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct Options {
    /// Disable Nagle's algorithm on accepted/dialed sockets.
    pub no_delay: bool,

    /// Chunk size of the session buffer pool.
    pub buffer_size: usize,

    /// Capacity of the inbound decoded-value queue; when full, the reader
    /// helper stalls until dispatch catches up.
    pub max_read_packet: usize,

    /// Capacity of the outbound queue; when full, `send` fails with `Busy`.
    pub max_write_packet: usize,

    /// Idle read deadline. When set, a read that sees no bytes for this
    /// long closes the session.
    pub keep_alive: Option<Duration>,

    /// Maximum frame payload accepted or produced by the framed transport.
    pub max_frame: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            no_delay: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_read_packet: DEFAULT_READ_PACKET,
            max_write_packet: DEFAULT_WRITE_PACKET,
            keep_alive: None,
            max_frame: DEFAULT_MAX_FRAME,
        }
    }
}

impl Options {
    #[must_use]
    pub fn with_no_delay(mut self, value: bool) -> Self {
        self.no_delay = value;
        self
    }

    /// Zero is ignored.
    #[must_use]
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        if size > 0 {
            self.buffer_size = size;
        }
        self
    }

    /// Zero values are ignored.
    #[must_use]
    pub fn with_max_packet(mut self, read: usize, write: usize) -> Self {
        if read > 0 {
            self.max_read_packet = read;
        }
        if write > 0 {
            self.max_write_packet = write;
        }
        self
    }

    #[must_use]
    pub fn with_keep_alive(mut self, idle: Duration) -> Self {
        self.keep_alive = Some(idle);
        self
    }

    /// Zero is ignored.
    #[must_use]
    pub fn with_max_frame(mut self, size: usize) -> Self {
        if size > 0 {
            self.max_frame = size;
        }
        self
    }

    /// Read options from a config subtree; absent keys keep their defaults.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let mut options = Self::default();
        if let Some(value) = config.get_bool("noDelay") {
            options.no_delay = value;
        }
        if let Some(value) = config.get_unsigned("bufferSize") {
            options = options.with_buffer_size(value as usize);
        }
        let read = config.get_unsigned("maxReadPacket").unwrap_or(0) as usize;
        let write = config.get_unsigned("maxWritePacket").unwrap_or(0) as usize;
        options = options.with_max_packet(read, write);
        if let Some(idle) = config.get_duration("keepAlive") {
            options.keep_alive = Some(idle);
        }
        if let Some(value) = config.get_unsigned("maxFrame") {
            options = options.with_max_frame(value as usize);
        }
        options
    }

    /// Apply socket-level options to a connection.
    pub(crate) fn apply(&self, stream: &TcpStream) {
        let _ = stream.set_nodelay(self.no_delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keelson_core::config::Value;

    #[test]
    fn defaults() {
        let options = Options::default();
        assert_eq!(options.buffer_size, 4096);
        assert_eq!(options.max_read_packet, 5);
        assert_eq!(options.max_write_packet, 100);
        assert!(options.keep_alive.is_none());
        assert!(!options.no_delay);
    }

    #[test]
    fn builders_ignore_zero() {
        let options = Options::default()
            .with_buffer_size(0)
            .with_max_packet(0, 2)
            .with_max_frame(0);
        assert_eq!(options.buffer_size, 4096);
        assert_eq!(options.max_read_packet, 5);
        assert_eq!(options.max_write_packet, 2);
        assert_eq!(options.max_frame, 16 << 20);
    }

    #[test]
    fn from_config_reads_known_keys() {
        let config = Config::empty()
            .with("noDelay", Value::Bool(true))
            .with("bufferSize", Value::Unsigned(256))
            .with("maxWritePacket", Value::Unsigned(2))
            .with("keepAlive", Value::Str("45s".into()));
        let options = Options::from_config(&config);
        assert!(options.no_delay);
        assert_eq!(options.buffer_size, 256);
        assert_eq!(options.max_read_packet, 5);
        assert_eq!(options.max_write_packet, 2);
        assert_eq!(options.keep_alive, Some(Duration::from_secs(45)));
    }
}
