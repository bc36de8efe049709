//! PCM frame codec and mix arithmetic.
//!
//! Frames on the wire are exactly [`FRAME_BYTES`] bytes: 320 signed 16-bit
//! little-endian mono samples at 16 kHz (20 ms). Mixing accumulates in
//! single-precision float normalised to [-1, 1], applies a per-output duck
//! gain, soft-clips with `tanh`, and rescales to int16 with a saturating
//! cast.

use bytes::{BufMut, Bytes, BytesMut};

use crate::constants::{DUCK_GAIN, FRAME_BYTES, FRAME_SAMPLES};

/// Duck-mix gain for an output composed from `sources` speakers.
///
/// A single speaker passes at unit gain; two or more are scaled down so the
/// summed amplitude stays bounded as speakers accumulate.
pub fn duck_gain(sources: usize) -> f32 {
    if sources <= 1 {
        1.0
    } else {
        DUCK_GAIN / sources as f32
    }
}

/// Float accumulator for one mix-minus output frame.
///
/// Collects any number of source frames, then [`MixBuffer::into_frame`]
/// produces the encoded int16 LE frame. Sources of the wrong length are
/// rejected without mutating the accumulator.
pub struct MixBuffer {
    acc: [f32; FRAME_SAMPLES],
    sources: usize,
}

impl MixBuffer {
    pub fn new() -> Self {
        Self {
            acc: [0.0; FRAME_SAMPLES],
            sources: 0,
        }
    }

    /// Accumulates one 640-byte source frame. Returns `false` (no mutation)
    /// when the frame length is wrong.
    pub fn add_frame(&mut self, data: &[u8]) -> bool {
        if data.len() != FRAME_BYTES {
            return false;
        }
        for (slot, chunk) in self.acc.iter_mut().zip(data.chunks_exact(2)) {
            let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
            *slot += f32::from(sample) / 32_768.0;
        }
        self.sources += 1;
        true
    }

    /// Number of source frames accumulated so far.
    pub fn sources(&self) -> usize {
        self.sources
    }

    /// `true` when no source frame has been accumulated.
    pub fn is_empty(&self) -> bool {
        self.sources == 0
    }

    /// Applies the duck gain and soft-clip, then encodes to int16 LE.
    ///
    /// `tanh` keeps every sample strictly inside (-1, 1); the `as i16`
    /// saturating cast covers float rounding at the rails.
    pub fn into_frame(self) -> Bytes {
        let gain = duck_gain(self.sources);
        let mut out = BytesMut::with_capacity(FRAME_BYTES);
        for sample in self.acc {
            let clipped = (sample * gain).tanh();
            out.put_i16_le((clipped * 32_767.0) as i16);
        }
        out.freeze()
    }
}

impl Default for MixBuffer {
    fn default() -> Self {
        Self::new()
    }
}
