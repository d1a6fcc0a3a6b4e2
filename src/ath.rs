//! Absolute threshold of hearing
//!
//! The ATH curve is a fit to the threshold in quiet, expressed in dB SPL as a
//! function of frequency. It is evaluated once per encoder instance: in the FFT
//! domain for the partition model, and in the MDCT domain per scalefactor band for
//! the quantization loops.

use crate::config::AthType;
use crate::tables::ScalefactorBands;
use crate::types::{GRANULE_SIZE, PSFB12, PSFB21, SBMAX_L, SBMAX_S};

/// MDCT scaling offset of the threshold, in dB
const MDCT_SCALE_DB: f32 = 100.0;

/// Frequency to bark conversion
pub fn freq2bark(freq_hz: f32) -> f32 {
    let khz = freq_hz.max(0.0) * 0.001;
    13.0 * (0.76 * khz).atan() + 3.5 * (khz * khz / (7.5 * 7.5)).atan()
}

/// Threshold curve in dB; `shape` bends the high-frequency slope
///
/// Negative frequencies select the curve minimum near 3.4 kHz.
fn ath_curve(freq_hz: f32, shape: f32) -> f32 {
    let f = if freq_hz < -0.3 { 3410.0 } else { freq_hz };
    let f = (f / 1000.0).clamp(0.01, 18.0);
    3.640 * f.powf(-0.8) - 6.800 * (-0.6 * (f - 3.4).powi(2)).exp()
        + 6.000 * (-0.15 * (f - 8.7).powi(2)).exp()
        + (0.6 + 0.04 * shape) * 0.001 * f.powi(4)
}

/// Threshold in dB at `freq_hz` for the selected curve
pub fn ath_formula(freq_hz: f32, ath_type: AthType) -> f32 {
    match ath_type {
        AthType::Type0 => ath_curve(freq_hz, 9.0),
        AthType::Type1 => ath_curve(freq_hz, -1.0),
        AthType::Type2 => ath_curve(freq_hz, 0.0),
        AthType::Type3 => ath_curve(freq_hz, 1.0) + 6.0,
        AthType::Curve(shape) => ath_curve(freq_hz, shape),
    }
}

/// Threshold energy in MDCT units; `ath_lower` is in bels
pub fn ath_mdct(freq_hz: f32, ath_type: AthType, ath_lower: f32) -> f32 {
    let db = ath_formula(freq_hz, ath_type) - MDCT_SCALE_DB;
    10f32.powf(db / 10.0 + ath_lower)
}

/// Loudness-dependent threshold adjustment used by the VBR loops
///
/// Scales the dB distance of `x` above `floor_db` by the loudness factor `a`.
pub fn ath_adjust(a: f32, x: f32, floor_db: f32) -> f32 {
    const O: f32 = 90.308_73;
    const P: f32 = 94.824_45;
    let mut u = 10.0 * x.max(1e-37).log10() - floor_db;
    let v = a * a;
    let mut w = 0.0;
    if v > 1e-20 {
        w = 1.0 + 10.0 / O * v.log10();
    }
    if w < 0.0 {
        w = 0.0;
    }
    u *= w;
    u += floor_db + O - P;
    10f32.powf(0.1 * u)
}

/// Per-band threshold of hearing in the MDCT domain
#[derive(Debug, Clone, PartialEq)]
pub struct SfbAth {
    /// Minimum over each long band
    pub l: [f32; SBMAX_L],
    /// Minimum over each short band, times the band width
    pub s: [f32; SBMAX_S],
    pub psfb21: [f32; PSFB21],
    pub psfb12: [f32; PSFB12],
    /// Curve minimum in dB
    pub floor: f32,
    /// Loudness adjustment factor, 1.0 for a full-scale signal
    pub adjust: f32,
}

impl SfbAth {
    /// Evaluate the curve over the scalefactor bands of one sample rate
    pub fn compute(bands: &ScalefactorBands, sample_rate: u32, ath_type: AthType, ath_lower_db: f32) -> Self {
        let sr = sample_rate as f32;
        let ath_lower = -ath_lower_db / 10.0;
        let band_min = |start: usize, end: usize, lines: f32| -> f32 {
            (start..end)
                .map(|i| ath_mdct(i as f32 * sr / (2.0 * lines), ath_type, ath_lower))
                .fold(f32::MAX, f32::min)
        };

        let mut l = [0.0; SBMAX_L];
        for (sfb, ath) in l.iter_mut().enumerate() {
            *ath = band_min(bands.l[sfb], bands.l[sfb + 1], GRANULE_SIZE as f32);
        }
        let mut psfb21 = [0.0; PSFB21];
        for (i, ath) in psfb21.iter_mut().enumerate() {
            *ath = band_min(bands.psfb21[i], bands.psfb21[i + 1], GRANULE_SIZE as f32);
        }
        let mut s = [0.0; SBMAX_S];
        for (sfb, ath) in s.iter_mut().enumerate() {
            let (start, end) = (bands.s[sfb], bands.s[sfb + 1]);
            *ath = band_min(start, end, 192.0) * (end - start) as f32;
        }
        let mut psfb12 = [0.0; PSFB12];
        for (i, ath) in psfb12.iter_mut().enumerate() {
            let (start, end) = (bands.psfb12[i], bands.psfb12[i + 1]);
            *ath = band_min(start, end, 192.0) * (end - start) as f32;
        }

        Self {
            l,
            s,
            psfb21,
            psfb12,
            floor: 10.0 * ath_mdct(-1.0, ath_type, ath_lower).log10(),
            adjust: 1.0,
        }
    }
}
