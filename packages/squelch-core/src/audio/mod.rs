//! PCM frame handling: decode, jitter buffering, and mix-minus composition.

pub mod frame;
pub mod jitter;

pub use frame::{duck_gain, MixBuffer};
pub use jitter::JitterBuffer;
