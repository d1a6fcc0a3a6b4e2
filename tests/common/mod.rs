//! Synthetic signal helpers shared by the integration tests

#![allow(dead_code)]

use psyquant::types::{BLKSIZE, BLKSIZE_S, GRANULE_SIZE};
use psyquant::{ChannelSpectrum, FrameAnalysis, GranuleAnalysis, PerceptualEncoder};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Deterministic noise with a falling spectral slope
fn noise(seed: u32, len: usize, level: f32, slope: f32) -> Vec<f32> {
    let mut state = seed.wrapping_mul(2_654_435_761).max(1);
    (0..len)
        .map(|i| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            ((state % 2000) as f32 / 1000.0 - 1.0) * level / (1.0 + i as f32 * slope)
        })
        .collect()
}

pub fn noise_spectrum(seed: u32, level: f32) -> ChannelSpectrum {
    if level == 0.0 {
        return ChannelSpectrum::silent();
    }
    ChannelSpectrum {
        long: noise(seed, BLKSIZE, level * 16.0, 0.01),
        short: [
            noise(seed + 1, BLKSIZE_S, level * 4.0, 0.04),
            noise(seed + 2, BLKSIZE_S, level * 4.0, 0.04),
            noise(seed + 3, BLKSIZE_S, level * 4.0, 0.04),
        ],
        attack_envelope: None,
    }
}

pub fn noise_xr(seed: u32, level: f32) -> [f32; GRANULE_SIZE] {
    let mut xr = [0.0f32; GRANULE_SIZE];
    xr.copy_from_slice(&noise(seed, GRANULE_SIZE, level, 0.02));
    xr
}

/// Feeds an encoder granule by granule, pairing each delayed analysis result
/// with the coefficients of the granule it describes
pub struct Stream {
    pub encoder: PerceptualEncoder,
    granule: u32,
    pending: Option<Vec<[f32; GRANULE_SIZE]>>,
}

impl Stream {
    pub fn new(encoder: PerceptualEncoder) -> Self {
        Self {
            encoder,
            granule: 0,
            pending: None,
        }
    }

    /// Next frame of noise at `level`; both channels carry the same signal when `mono_like`
    pub fn next_frame(&mut self, level: f32, mono_like: bool) -> FrameAnalysis {
        let channels = self.encoder.config().channels();
        let granules = self.encoder.config().granules_per_frame();
        let mut frame = FrameAnalysis::default();
        for _ in 0..granules {
            let seed = |ch: usize| if mono_like { self.granule * 7 + 1 } else { self.granule * 7 + 1 + ch as u32 * 3 };
            let spectra: Vec<ChannelSpectrum> = (0..channels).map(|ch| noise_spectrum(seed(ch), level)).collect();
            let xr: Vec<[f32; GRANULE_SIZE]> = (0..channels).map(|ch| noise_xr(seed(ch), level)).collect();
            let psy = self.encoder.analyze_granule(&spectra).unwrap();
            let delayed = self
                .pending
                .replace(xr)
                .unwrap_or_else(|| vec![[0.0; GRANULE_SIZE]; channels]);
            frame.granules.push(GranuleAnalysis { xr: delayed, psy });
            self.granule += 1;
        }
        frame
    }
}
