//! Streaming sample-rate conversion for the outbound audio path.
//!
//! Linear interpolation with filter state carried across blocks. The state
//! (last consumed sample plus fractional read position) makes chunked
//! conversion bit-identical to converting the whole signal at once; a
//! per-block reset would produce an audible click at every block boundary.

/// Stateful streaming resampler for mono 16-bit PCM.
pub struct StreamResampler {
    /// Source samples advanced per output sample.
    step: f64,
    /// Fractional read position past `prev`, in source-sample units.
    frac: f64,
    /// Last consumed input sample.
    prev: Option<i16>,
}

impl StreamResampler {
    /// Create a resampler converting `src_rate` to `dst_rate`.
    pub fn new(src_rate: u32, dst_rate: u32) -> Self {
        Self {
            step: f64::from(src_rate) / f64::from(dst_rate),
            frac: 0.0,
            prev: None,
        }
    }

    /// Convert a block of samples, carrying interpolation state over from
    /// previous blocks. May return an empty vector for very short inputs
    /// when downsampling; the withheld samples are emitted once enough
    /// input arrives.
    pub fn process(&mut self, input: &[i16]) -> Vec<i16> {
        let mut out = Vec::with_capacity((input.len() as f64 / self.step) as usize + 2);
        let mut i = 0_usize;

        let mut prev = match self.prev {
            Some(p) => p,
            None => {
                let Some(&first) = input.first() else {
                    return out;
                };
                i = 1;
                first
            }
        };

        loop {
            // Advance `prev` until the read position falls within [prev, next).
            while self.frac >= 1.0 {
                if i >= input.len() {
                    self.prev = Some(prev);
                    return out;
                }
                prev = input[i];
                i += 1;
                self.frac -= 1.0;
            }
            let Some(&next) = input.get(i) else {
                self.prev = Some(prev);
                return out;
            };
            let sample = f64::from(prev) + self.frac * (f64::from(next) - f64::from(prev));
            out.push(sample.round().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16);
            self.frac += self.step;
        }
    }
}
