use std::time::Duration;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(120);
pub const DEFAULT_HAND_OFF_TIMEOUT: Duration = Duration::from_secs(5);

pub const OUTBOUND_CHANNEL_SIZE: usize = 32;
pub const CANCEL_CHANNEL_SIZE: usize = 16;
// One slot between the write queue and the writer, so anything not yet
// handed over can still be retracted.
pub const WRITER_CHANNEL_SIZE: usize = 1;

// Largest block (16 KiB is the norm, 128 KiB the usual ceiling) plus generous
// room for bitfields of very large swarms.
pub const MAX_FRAME_LENGTH: usize = (1 << 20) + 13;

#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Bound on resolve + dial.
    pub connect_timeout: Duration,
    /// Applied to the handshake and to every write.
    pub io_timeout: Duration,
    /// `None` leaves reads unbounded; liveness is judged by the owner from
    /// `last_keep_alive_at`.
    pub read_timeout: Option<Duration>,
    pub keep_alive_interval: Duration,
    /// Bound on each submission to the scheduler.
    pub hand_off_timeout: Duration,
    pub outbound_capacity: usize,
    pub max_frame_length: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            io_timeout: DEFAULT_IO_TIMEOUT,
            read_timeout: None,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            hand_off_timeout: DEFAULT_HAND_OFF_TIMEOUT,
            outbound_capacity: OUTBOUND_CHANNEL_SIZE,
            max_frame_length: MAX_FRAME_LENGTH,
        }
    }
}
