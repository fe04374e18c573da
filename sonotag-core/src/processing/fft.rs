//! Radix-2 FFT and Hanning window over a shared sine table.
//!
//! The table holds one full period of `sin(2πi/N)` for `N = 65536`; twiddle
//! factors and the window are both read from it. Transforms work in place on
//! caller-owned real/imaginary buffers.

use std::sync::OnceLock;

use crate::models::error::DspError;

/// Points in the sine table, the largest supported transform.
pub const TABLE_SIZE: usize = 64 * 1024;

/// `log2(TABLE_SIZE)`.
pub const TABLE_LOG2: u32 = 16;

static SHARED_TABLE: OnceLock<SineTable> = OnceLock::new();

/// Precomputed `sin(2πi/N)` for `i` in `0..N`.
pub struct SineTable {
    values: Box<[f32]>,
}

impl SineTable {
    fn build() -> Self {
        let step = 2.0 * std::f64::consts::PI / TABLE_SIZE as f64;
        let values = (0..TABLE_SIZE)
            .map(|i| (step * i as f64).sin() as f32)
            .collect();
        Self { values }
    }

    /// The process-wide table, built on first use.
    pub fn shared() -> &'static SineTable {
        SHARED_TABLE.get_or_init(Self::build)
    }

    #[inline]
    fn sin(&self, index: usize) -> f32 {
        self.values[index]
    }

    #[inline]
    fn cos(&self, index: usize) -> f32 {
        self.values[index + TABLE_SIZE / 4]
    }

    /// In-place radix-2 decimation-in-time transform of `2^log2_size` points.
    ///
    /// The forward direction halves operands at every stage, so a forward
    /// transform is normalized by `1/n` and the inverse is not scaled.
    pub fn fft(
        &self,
        re: &mut [f32],
        im: &mut [f32],
        log2_size: u32,
        inverse: bool,
    ) -> Result<(), DspError> {
        if log2_size > TABLE_LOG2 {
            return Err(DspError::TransformTooLarge {
                log2_size,
                max: TABLE_SIZE,
            });
        }
        let n = 1usize << log2_size;
        let shortest = re.len().min(im.len());
        if shortest < n {
            return Err(DspError::BufferTooShort {
                needed: n,
                actual: shortest,
            });
        }

        bit_reverse(re, im, n);

        let mut half = 1usize;
        let mut stage = 0u32;
        while half < n {
            let span = half << 1;
            let shift = TABLE_LOG2 - 1 - stage;
            for m in 0..half {
                let j = m << shift;
                let mut wr = self.cos(j);
                let mut wi = -self.sin(j);
                if inverse {
                    wi = -wi;
                } else {
                    wr *= 0.5;
                    wi *= 0.5;
                }
                let mut i = m;
                while i < n {
                    let k = i + half;
                    let tr = wr * re[k] - wi * im[k];
                    let ti = wr * im[k] + wi * re[k];
                    let (mut qr, mut qi) = (re[i], im[i]);
                    if !inverse {
                        qr *= 0.5;
                        qi *= 0.5;
                    }
                    re[k] = qr - tr;
                    im[k] = qi - ti;
                    re[i] = qr + tr;
                    im[i] = qi + ti;
                    i += span;
                }
            }
            stage += 1;
            half = span;
        }
        Ok(())
    }

    /// Multiplies the first `n` samples by a Hanning window.
    ///
    /// `n` must be a power of two no larger than the table.
    pub fn window_hanning(&self, samples: &mut [f32], n: usize) -> Result<(), DspError> {
        if n == 0 || !n.is_power_of_two() || n > TABLE_SIZE {
            return Err(DspError::UnsupportedFormat(format!(
                "window length {} is not a power of two up to {}",
                n, TABLE_SIZE
            )));
        }
        if samples.len() < n {
            return Err(DspError::BufferTooShort {
                needed: n,
                actual: samples.len(),
            });
        }
        let step = TABLE_SIZE / n;
        for (i, sample) in samples[..n].iter_mut().enumerate() {
            let k = (TABLE_SIZE / 4 + i * step) % TABLE_SIZE;
            *sample *= 0.5 - 0.5 * self.sin(k);
        }
        Ok(())
    }
}

fn bit_reverse(re: &mut [f32], im: &mut [f32], n: usize) {
    let last = n - 1;
    let mut mr = 0usize;
    for m in 1..=last {
        let mut l = n;
        loop {
            l >>= 1;
            if mr + l <= last {
                break;
            }
        }
        mr = (mr & (l - 1)) + l;
        if mr > m {
            re.swap(m, mr);
            im.swap(m, mr);
        }
    }
}

/// Transform buffers owned by one caller, sized for the largest transform.
pub struct FftScratch {
    pub re: Vec<f32>,
    pub im: Vec<f32>,
}

impl FftScratch {
    pub fn new() -> Self {
        Self {
            re: vec![0.0; TABLE_SIZE],
            im: vec![0.0; TABLE_SIZE],
        }
    }

    /// Zero the first `n` points of both buffers.
    pub fn clear(&mut self, n: usize) {
        self.re[..n].fill(0.0);
        self.im[..n].fill(0.0);
    }
}

impl Default for FftScratch {
    fn default() -> Self {
        Self::new()
    }
}
