//! Fixed protocol constants that should NOT be changed.
//!
//! These values define the wire contract with clients (frame geometry,
//! cadence, timeouts). Changing them would break interoperability with
//! deployed clients.

// ─────────────────────────────────────────────────────────────────────────────
// Audio Format
// ─────────────────────────────────────────────────────────────────────────────

/// Audio sample rate (Hz). Narrowband speech; every client captures at this rate.
pub const SAMPLE_RATE: u32 = 16_000;

/// Samples per audio frame (20 ms at 16 kHz mono).
pub const FRAME_SAMPLES: usize = 320;

/// Bytes per audio frame (320 samples × 2 bytes, 16-bit LE).
///
/// Binary WebSocket messages of any other length are dropped silently.
pub const FRAME_BYTES: usize = 640;

/// Duration of one audio frame and of one mixer tick (milliseconds).
pub const FRAME_DURATION_MS: u64 = 20;

// ─────────────────────────────────────────────────────────────────────────────
// Mixing
// ─────────────────────────────────────────────────────────────────────────────

/// Numerator of the duck-mix gain applied when two or more speakers
/// contribute to one output (`gain = DUCK_GAIN / speakers`).
///
/// Keeps the summed amplitude from growing without bound as speakers
/// accumulate, while a single speaker passes at unit gain.
pub const DUCK_GAIN: f32 = 0.7;

// ─────────────────────────────────────────────────────────────────────────────
// Jitter Buffer
// ─────────────────────────────────────────────────────────────────────────────

/// Maximum frames buffered per channel member (200 ms at 20 ms/frame).
///
/// The bound is the sole backpressure mechanism: a push into a full buffer
/// drops the incoming frame, never an already-buffered one.
pub const JITTER_CAPACITY: usize = 10;

/// Minimum buffered frames before a member counts as an active speaker.
///
/// Two frames (~40 ms) absorb ordinary network arrival jitter before the
/// mixer starts consuming the stream.
pub const JITTER_FLOOR: usize = 2;

// ─────────────────────────────────────────────────────────────────────────────
// Liveness
// ─────────────────────────────────────────────────────────────────────────────

/// Interval between watchdog sweeps (seconds).
pub const WATCHDOG_INTERVAL_SECS: u64 = 5;

/// Sessions whose last ping is older than this are evicted (seconds).
pub const PING_TIMEOUT_SECS: u64 = 25;

// ─────────────────────────────────────────────────────────────────────────────
// Transport
// ─────────────────────────────────────────────────────────────────────────────

/// Capacity of each session's outbound queue (messages + frames).
///
/// A send into a full queue drops the item; the mixer and the signalling
/// handlers never wait on a slow client.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 64;

// ─────────────────────────────────────────────────────────────────────────────
// Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Owner name recorded for channels created through the admin surface.
pub const ADMIN_OWNER: &str = "admin";

/// Message delivered to a client removed by an administrator.
pub const KICKED_MESSAGE: &str = "Disconnected by an administrator";

/// Application name used in the health endpoint and log banner.
pub const APP_NAME: &str = "Squelch";

// ─────────────────────────────────────────────────────────────────────────────
// Defaults
// ─────────────────────────────────────────────────────────────────────────────

/// Default HTTP/WebSocket bind port. Override: `PORT`.
pub const DEFAULT_PORT: u16 = 5000;

/// Default admin bearer token - replace in production. Override: `ADMIN_TOKEN`.
pub const DEFAULT_ADMIN_TOKEN: &str = "admin1234";
