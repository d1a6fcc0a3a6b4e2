//! Configuration management for the perceptual coding core
//!
//! This module provides configuration structures and validation logic for the
//! psychoacoustic model, the quantization loops and the rate control modes. The
//! numeric defaults are empirically tuned values; they are policy, not protocol.

use crate::error::{ConfigError, ConfigResult};
use crate::tables::{get_bitrate_index, BITRATES, SAMPLE_RATES};
use crate::types::{SBMAX_L, SBMAX_S};

/// Main configuration structure
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Audio format and channel mode
    pub wave: WaveConfig,
    /// Psychoacoustic model tuning
    pub psy: PsyConfig,
    /// Quantization loop tuning
    pub quant: QuantConfig,
    /// Rate control mode
    pub rate: RateControl,
}

/// Audio format configuration
#[derive(Debug, Clone, PartialEq)]
pub struct WaveConfig {
    /// Number of audio channels
    pub channels: Channels,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Channel coding mode
    pub mode: ChannelMode,
}

/// Number of audio channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channels {
    /// Mono audio (1 channel)
    Mono = 1,
    /// Stereo audio (2 channels)
    Stereo = 2,
}

/// Channel coding modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    Mono,
    /// Left/right stereo
    StereoLr,
    /// Mid/side stereo
    StereoMs,
}

/// MPEG version enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "diagnostics", derive(serde::Serialize, serde::Deserialize))]
pub enum MpegVersion {
    /// MPEG-1
    Mpeg1,
    /// MPEG-2
    Mpeg2,
    /// MPEG-2.5
    Mpeg25,
}

/// Psychoacoustic model variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsyStrategy {
    /// Unpredictability measured from phase prediction across consecutive blocks
    Classical,
    /// Tonality from spectral peakiness, block switching from sub-block attacks
    AttackDriven,
}

/// Short block policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortBlocks {
    /// Both channels of a stereo pair always switch together
    Coupled,
    /// Channels may use different block types
    Allowed,
    /// Never use short blocks
    Dispensed,
    /// Always use short blocks
    Forced,
}

/// Absolute threshold of hearing curve
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AthType {
    Type0,
    Type1,
    Type2,
    /// Type 2 curve raised by 6 dB
    Type3,
    /// Curve with an explicit shape parameter
    Curve(f32),
}

/// Rate control mode
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateControl {
    /// Constant bitrate in kbps
    Cbr { bitrate: u32 },
    /// Average bitrate in kbps, frames between `min_bitrate` and `max_bitrate`
    Abr { mean_bitrate: u32, min_bitrate: u32, max_bitrate: u32 },
    /// Variable bitrate, quality 0 (best) to 9
    Vbr { quality: u8, min_bitrate: u32, max_bitrate: u32, hard_min: bool },
}

/// Quantizer used in true VBR mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VbrSolver {
    /// Bisection over the bit budget, each step running the outer loop
    OuterLoop,
    /// Direct per-band scalefactor solve with colour search
    Direct,
}

/// Which bands the outer loop amplifies each iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseShapingAmp {
    /// All bands over the masking threshold
    Iso,
    /// Bands within 50% (in dB) of the worst band
    HalfOfWorst,
    /// Only the single worst band
    SingleBand,
    /// Half-of-worst pass, then a single-band refinement pass
    TwoPassRefine,
}

/// Psychoacoustic model configuration
#[derive(Debug, Clone, PartialEq)]
pub struct PsyConfig {
    pub strategy: PsyStrategy,
    pub short_blocks: ShortBlocks,
    /// Mid/side threshold fixup factor, 0 disables
    pub msfix: f32,
    /// Interchannel masking ratio, 0 disables
    pub interch_ratio: f32,
    pub ath_type: AthType,
    /// Lowers the ATH by this many dB
    pub ath_lower_db: f32,
    /// Masking adjustment in dB for long and short blocks
    pub mask_adjust_db: f32,
    pub mask_adjust_short_db: f32,
    /// Sub-block energy ratio that flags an attack
    pub attack_threshold: f32,
    /// Attack threshold for the side channel
    pub attack_threshold_short: f32,
    /// Noise-masking-tone and tone-masking-noise offsets in dB
    pub nmt_db: f32,
    pub tmn_db: f32,
    /// Pre-echo clamp against the previous block and the one before it
    pub pre_echo_ratio: f32,
    pub pre_echo_ratio_hysteresis: f32,
    /// Upper frequency of the unpredictability analysis
    pub cwlimit_hz: f32,
    pub tonality_patch: bool,
    /// Temporal masking decay between short windows
    pub temporal_masking: bool,
    /// Quantize the top scalefactor band against its own threshold
    pub sfb21_extra: bool,
}

/// Quantization loop configuration
#[derive(Debug, Clone, PartialEq)]
pub struct QuantConfig {
    /// Comparison heuristic id (0..=9) for long blocks
    pub comparison: u8,
    /// Comparison heuristic id (0..=9) for short blocks
    pub comparison_short: u8,
    /// 0: gain search only, 1: scalefactor amplification, 2: also scalefac_scale and subblock gain
    pub noise_shaping: u8,
    pub noise_shaping_amp: NoiseShapingAmp,
    /// Bit 0: truncate small spectra, bit 1: pseudo half steps, bit 2: also on short blocks
    pub substep_shaping: u8,
    /// Search every scalefactor combination instead of stopping early
    pub full_outer_loop: bool,
    pub use_subblock_gain: bool,
    pub vbr_solver: VbrSolver,
    /// 0 off, 1 sparse by masking level difference, 2 also fold the top bands
    pub ms_sparsing: u8,
    pub sparse_a: f32,
    pub sparse_b: f32,
    /// Round at 0.4054 instead of the exact x^(3/4) decision points
    pub iso_quantization: bool,
    /// Per-band factors applied to the allowed noise of long and short bands
    pub longfact: [f32; SBMAX_L],
    pub shortfact: [f32; SBMAX_S],
}

impl Config {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self {
            wave: WaveConfig::default(),
            psy: PsyConfig::default(),
            quant: QuantConfig::default(),
            rate: RateControl::Cbr { bitrate: 128 },
        }
    }

    /// Configuration for VBR at the given quality, with the tuned masking offsets applied
    pub fn vbr(quality: u8, solver: VbrSolver) -> Self {
        let mut config = Self::new();
        let q = quality.min(9) as usize;
        let row = match solver {
            VbrSolver::OuterLoop => VBR_OUTER_TUNING[q],
            VbrSolver::Direct => VBR_DIRECT_TUNING[q],
        };
        config.psy.strategy = PsyStrategy::AttackDriven;
        config.psy.attack_threshold = row.attack;
        config.psy.attack_threshold_short = row.attack_short;
        config.psy.mask_adjust_db = row.mask;
        config.psy.mask_adjust_short_db = row.mask_short;
        config.psy.ath_lower_db = row.ath_lower;
        config.psy.ath_type = AthType::Curve(row.ath_curve);
        config.psy.interch_ratio = row.interch;
        if row.msfix > 0.0 {
            config.psy.msfix = row.msfix;
        }
        config.quant.set_sfb21_adjust_db(row.sfb21_db);
        config.quant.vbr_solver = solver;
        let comparison = match solver {
            VbrSolver::OuterLoop => 9,
            VbrSolver::Direct => 0,
        };
        config.quant.comparison = comparison;
        config.quant.comparison_short = comparison;
        config.rate = RateControl::Vbr {
            quality,
            min_bitrate: 0,
            max_bitrate: 0,
            hard_min: false,
        };
        config
    }

    /// Configuration for ABR at the given mean bitrate, tuned from the nearest table row
    pub fn abr(mean_bitrate: u32) -> Self {
        let mut config = Self::new();
        let mean_bitrate = mean_bitrate.clamp(8, 320);
        let row = ABR_TUNING
            .iter()
            .min_by_key(|r| (r.kbps as i64 - mean_bitrate as i64).abs())
            .copied()
            .unwrap_or(ABR_TUNING[11]);
        config.psy.strategy = PsyStrategy::AttackDriven;
        if row.msfix > 0.0 {
            config.psy.msfix = row.msfix;
        }
        config.psy.attack_threshold = row.attack;
        config.psy.attack_threshold_short = row.attack_short;
        config.psy.mask_adjust_db = row.mask;
        config.psy.mask_adjust_short_db = if row.mask > 0.0 { row.mask * 0.9 } else { row.mask * 1.1 };
        config.psy.ath_lower_db = row.ath_lower;
        config.psy.ath_type = AthType::Curve(row.ath_curve);
        config.psy.interch_ratio = row.interch;
        if row.sfscale {
            config.quant.noise_shaping = 2;
        }
        config.quant.comparison = 9;
        config.quant.comparison_short = 9;
        config.rate = RateControl::Abr {
            mean_bitrate,
            min_bitrate: 0,
            max_bitrate: 0,
        };
        config
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        self.wave.validate()?;
        self.psy.validate()?;
        self.quant.validate()?;
        self.validate_rate()?;
        Ok(())
    }

    /// Get the MPEG version based on sample rate
    pub fn mpeg_version(&self) -> MpegVersion {
        match self.wave.sample_rate {
            44100 | 48000 | 32000 => MpegVersion::Mpeg1,
            22050 | 24000 | 16000 => MpegVersion::Mpeg2,
            _ => MpegVersion::Mpeg25,
        }
    }

    /// Granules per frame: 2 for MPEG-1, 1 otherwise
    pub fn granules_per_frame(&self) -> usize {
        match self.mpeg_version() {
            MpegVersion::Mpeg1 => 2,
            MpegVersion::Mpeg2 | MpegVersion::Mpeg25 => 1,
        }
    }

    /// Samples per channel in one frame
    pub fn frame_size(&self) -> usize {
        576 * self.granules_per_frame()
    }

    pub fn channels(&self) -> usize {
        self.wave.channels as usize
    }

    /// Index into the sample rate and scalefactor band tables
    pub fn samplerate_index(&self) -> usize {
        SAMPLE_RATES.iter().position(|&sr| sr == self.wave.sample_rate).unwrap_or(0)
    }

    /// Bitrate index of a CBR stream, or the mean bitrate of ABR
    pub fn bitrate_index(&self) -> usize {
        let kbps = match self.rate {
            RateControl::Cbr { bitrate } => bitrate,
            RateControl::Abr { mean_bitrate, .. } => mean_bitrate,
            RateControl::Vbr { .. } => return self.max_bitrate_index(),
        };
        get_bitrate_index(kbps, self.is_mpeg1()).unwrap_or(9)
    }

    /// Lowest bitrate index a variable-rate frame may use
    pub fn min_bitrate_index(&self) -> usize {
        let kbps = match self.rate {
            RateControl::Cbr { bitrate } => bitrate,
            RateControl::Abr { min_bitrate, .. } | RateControl::Vbr { min_bitrate, .. } => min_bitrate,
        };
        if kbps == 0 {
            return 1;
        }
        get_bitrate_index(kbps, self.is_mpeg1()).unwrap_or(1)
    }

    /// Highest bitrate index a variable-rate frame may use
    pub fn max_bitrate_index(&self) -> usize {
        let kbps = match self.rate {
            RateControl::Cbr { bitrate } => bitrate,
            RateControl::Abr { max_bitrate, .. } | RateControl::Vbr { max_bitrate, .. } => max_bitrate,
        };
        if kbps == 0 {
            return self.highest_bitrate_index();
        }
        get_bitrate_index(kbps, self.is_mpeg1()).unwrap_or_else(|| self.highest_bitrate_index())
    }

    /// Ratio of PCM bits to coded bits at the configured (mean) bitrate
    pub fn compression_ratio(&self) -> f32 {
        let kbps = match self.rate {
            RateControl::Cbr { bitrate } => bitrate,
            RateControl::Abr { mean_bitrate, .. } => mean_bitrate,
            RateControl::Vbr { .. } => {
                crate::tables::get_bitrate(self.max_bitrate_index(), self.is_mpeg1()).unwrap_or(128)
            }
        };
        self.wave.sample_rate as f32 * 16.0 * self.channels() as f32 / (1000.0 * kbps.max(1) as f32)
    }

    pub(crate) fn is_mpeg1(&self) -> bool {
        self.mpeg_version() == MpegVersion::Mpeg1
    }

    /// Side information length in bytes, frame header included
    pub fn sideinfo_len(&self) -> usize {
        match (self.is_mpeg1(), self.channels()) {
            (true, 1) => 4 + 17,
            (true, _) => 4 + 32,
            (false, 1) => 4 + 9,
            (false, _) => 4 + 17,
        }
    }

    fn highest_bitrate_index(&self) -> usize {
        match self.mpeg_version() {
            MpegVersion::Mpeg25 => 8,
            _ => 14,
        }
    }

    fn allowed_bitrates(&self) -> &'static [u32] {
        match self.mpeg_version() {
            MpegVersion::Mpeg1 => &BITRATES[0][1..],
            MpegVersion::Mpeg2 => &BITRATES[1][1..],
            MpegVersion::Mpeg25 => &BITRATES[1][1..9],
        }
    }

    /// Validate compatibility between sample rate and the rate control bitrates
    fn validate_rate(&self) -> ConfigResult<()> {
        let allowed = self.allowed_bitrates();
        let check = |kbps: u32| -> ConfigResult<()> {
            if !BITRATES.iter().any(|row| row[1..].contains(&kbps)) {
                return Err(ConfigError::UnsupportedBitrate(kbps));
            }
            if !allowed.contains(&kbps) {
                return Err(ConfigError::IncompatibleRateCombination {
                    sample_rate: self.wave.sample_rate,
                    bitrate: kbps,
                });
            }
            Ok(())
        };

        match self.rate {
            RateControl::Cbr { bitrate } => check(bitrate),
            RateControl::Abr { mean_bitrate, min_bitrate, max_bitrate } => {
                if mean_bitrate < 8 || mean_bitrate > 320 {
                    return Err(ConfigError::UnsupportedBitrate(mean_bitrate));
                }
                self.validate_range(min_bitrate, max_bitrate, check)
            }
            RateControl::Vbr { quality, min_bitrate, max_bitrate, .. } => {
                if quality > 9 {
                    return Err(ConfigError::InvalidVbrQuality(quality));
                }
                self.validate_range(min_bitrate, max_bitrate, check)
            }
        }
    }

    fn validate_range(
        &self,
        min: u32,
        max: u32,
        check: impl Fn(u32) -> ConfigResult<()>,
    ) -> ConfigResult<()> {
        if min != 0 {
            check(min)?;
        }
        if max != 0 {
            check(max)?;
        }
        if min != 0 && max != 0 && min > max {
            return Err(ConfigError::InvalidVbrRange { min, max });
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl WaveConfig {
    /// Validate wave configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if !SAMPLE_RATES.contains(&self.sample_rate) {
            return Err(ConfigError::UnsupportedSampleRate(self.sample_rate));
        }

        match (self.channels, self.mode) {
            (Channels::Mono, ChannelMode::Mono) => Ok(()),
            (Channels::Stereo, ChannelMode::StereoLr | ChannelMode::StereoMs) => Ok(()),
            (channels, mode) => Err(ConfigError::InvalidChannelMode {
                mode: format!("{:?}", mode),
                channels: channels as u8,
            }),
        }
    }
}

impl Default for WaveConfig {
    fn default() -> Self {
        Self {
            channels: Channels::Stereo,
            sample_rate: 44100,
            mode: ChannelMode::StereoMs,
        }
    }
}

impl PsyConfig {
    /// Defaults for a given model; the attack-driven model enables the mid/side fixup
    pub fn for_strategy(strategy: PsyStrategy) -> Self {
        Self {
            strategy,
            short_blocks: ShortBlocks::Coupled,
            msfix: match strategy {
                PsyStrategy::Classical => 0.0,
                PsyStrategy::AttackDriven => 3.5,
            },
            interch_ratio: 0.0,
            ath_type: AthType::Type2,
            ath_lower_db: 0.0,
            mask_adjust_db: 0.0,
            mask_adjust_short_db: 0.0,
            attack_threshold: 4.4,
            attack_threshold_short: 25.0,
            nmt_db: 6.0,
            tmn_db: 29.0,
            pre_echo_ratio: 2.0,
            pre_echo_ratio_hysteresis: 16.0,
            cwlimit_hz: 8871.7,
            tonality_patch: false,
            temporal_masking: true,
            sfb21_extra: false,
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if !self.msfix.is_finite() || self.msfix < 0.0 {
            return Err(ConfigError::InvalidMsfix(self.msfix));
        }
        if !self.interch_ratio.is_finite() || !(0.0..1.0).contains(&self.interch_ratio) {
            return Err(ConfigError::InvalidInterchannelRatio(self.interch_ratio));
        }
        if let AthType::Curve(c) = self.ath_type {
            if !c.is_finite() {
                return Err(ConfigError::InvalidAthCurve(c));
            }
        }
        Ok(())
    }
}

impl Default for PsyConfig {
    fn default() -> Self {
        Self::for_strategy(PsyStrategy::AttackDriven)
    }
}

impl QuantConfig {
    /// Raise the allowed noise of the top long and short band by `db`
    pub fn set_sfb21_adjust_db(&mut self, db: f32) {
        let factor = 10f32.powf(db / 10.0);
        self.longfact[SBMAX_L - 1] = factor;
        self.shortfact[SBMAX_S - 1] = factor;
    }

    pub fn validate(&self) -> ConfigResult<()> {
        for id in [self.comparison, self.comparison_short] {
            if id > 9 {
                return Err(ConfigError::UnknownComparison(id));
            }
        }
        Ok(())
    }
}

impl Default for QuantConfig {
    fn default() -> Self {
        Self {
            comparison: 9,
            comparison_short: 9,
            noise_shaping: 1,
            noise_shaping_amp: NoiseShapingAmp::Iso,
            substep_shaping: 0,
            full_outer_loop: false,
            use_subblock_gain: true,
            vbr_solver: VbrSolver::OuterLoop,
            ms_sparsing: 0,
            sparse_a: 5.0,
            sparse_b: 1.0,
            iso_quantization: false,
            longfact: [1.0; SBMAX_L],
            shortfact: [1.0; SBMAX_S],
        }
    }
}

impl From<u8> for Channels {
    fn from(value: u8) -> Self {
        match value {
            1 => Channels::Mono,
            _ => Channels::Stereo,
        }
    }
}

impl From<Channels> for usize {
    fn from(channels: Channels) -> Self {
        channels as usize
    }
}

#[derive(Debug, Clone, Copy)]
struct VbrTuning {
    attack: f32,
    attack_short: f32,
    msfix: f32,
    mask: f32,
    mask_short: f32,
    interch: f32,
    ath_lower: f32,
    ath_curve: f32,
    sfb21_db: f32,
}

#[allow(clippy::too_many_arguments)]
const fn vbr(attack: f32, attack_short: f32, msfix: f32, mask: f32, mask_short: f32, interch: f32, ath_lower: f32, ath_curve: f32, sfb21_db: f32) -> VbrTuning {
    VbrTuning { attack, attack_short, msfix, mask, mask_short, interch, ath_lower, ath_curve, sfb21_db }
}

/// Tuning of the outer-loop VBR quantizer, quality 0 first
const VBR_OUTER_TUNING: [VbrTuning; 10] = [
    vbr(5.2, 125.0, 0.97, -4.2, -6.3, 0.0, 4.8, 1.0, 5.25),
    vbr(5.3, 125.0, 1.35, -3.6, -5.6, 0.0, 4.5, 1.5, 5.25),
    vbr(5.6, 125.0, 1.49, -2.2, -3.5, 0.0, 2.8, 2.0, 5.25),
    vbr(5.8, 130.0, 1.64, -1.8, -2.8, 0.0, 2.6, 3.0, 5.0),
    vbr(6.0, 135.0, 1.79, -0.7, -1.1, 0.0, 1.1, 3.5, 0.0),
    vbr(6.4, 140.0, 1.95, 0.5, 0.4, 0.0002, -7.5, 4.0, 0.0),
    vbr(6.6, 145.0, 2.30, 0.67, 0.65, 0.0004, -14.7, 6.5, 0.0),
    vbr(6.6, 145.0, 2.70, 0.8, 0.75, 0.0006, -19.7, 8.0, 0.0),
    vbr(6.6, 145.0, 0.0, 1.2, 1.15, 0.0007, -27.5, 10.0, 0.0),
    vbr(6.6, 145.0, 0.0, 1.6, 1.6, 0.0008, -36.0, 11.0, 0.0),
];

/// Tuning of the direct VBR solver, quality 0 first
const VBR_DIRECT_TUNING: [VbrTuning; 10] = [
    vbr(5.2, 125.0, 0.97, -3.6, -5.6, 0.0, 7.5, 1.0, 6.5),
    vbr(5.3, 125.0, 1.35, -3.4, -5.4, 0.0, 4.5, 1.5, 5.25),
    vbr(5.6, 125.0, 1.49, -1.7, -3.2, 0.0, 2.0, 2.0, 4.5),
    vbr(5.8, 130.0, 1.64, -1.45, -2.45, 0.0, 1.1, 3.0, 3.75),
    vbr(6.0, 135.0, 1.79, -0.7, -1.1, 0.0, 0.0, 3.5, 0.0),
    vbr(6.4, 140.0, 1.95, 0.45, 0.35, 0.0002, -7.7, 4.0, 0.0),
    vbr(6.6, 145.0, 2.30, 0.67, 0.65, 0.0004, -14.5, 6.5, 0.0),
    vbr(6.6, 145.0, 2.70, 0.8, 0.78, 0.0006, -22.0, 8.0, 0.0),
    vbr(6.6, 145.0, 0.0, 1.2, 1.15, 0.0007, -30.0, 10.0, 0.0),
    vbr(6.6, 145.0, 0.0, 1.75, 1.75, 0.0008, -39.5, 11.0, 0.0),
];

#[derive(Debug, Clone, Copy)]
struct AbrTuning {
    kbps: u32,
    msfix: f32,
    attack: f32,
    attack_short: f32,
    mask: f32,
    ath_lower: f32,
    ath_curve: f32,
    interch: f32,
    sfscale: bool,
}

#[allow(clippy::too_many_arguments)]
const fn abr(kbps: u32, msfix: f32, attack: f32, attack_short: f32, mask: f32, ath_lower: f32, ath_curve: f32, interch: f32, sfscale: bool) -> AbrTuning {
    AbrTuning { kbps, msfix, attack, attack_short, mask, ath_lower, ath_curve, interch, sfscale }
}

const ABR_TUNING: [AbrTuning; 17] = [
    abr(8, 0.0, 6.6, 145.0, 0.0, -30.0, 11.0, 0.0012, true),
    abr(16, 0.0, 6.6, 145.0, 0.0, -25.0, 11.0, 0.0010, true),
    abr(24, 0.0, 6.6, 145.0, 0.0, -20.0, 11.0, 0.0010, true),
    abr(32, 0.0, 6.6, 145.0, 0.0, -15.0, 11.0, 0.0010, true),
    abr(40, 0.0, 6.6, 145.0, 0.0, -10.0, 11.0, 0.0009, true),
    abr(48, 0.0, 6.6, 145.0, 0.0, -10.0, 11.0, 0.0009, true),
    abr(56, 0.0, 6.6, 145.0, 0.0, -6.0, 11.0, 0.0008, true),
    abr(64, 0.0, 6.6, 145.0, 0.0, -2.0, 11.0, 0.0008, true),
    abr(80, 0.0, 6.6, 145.0, 0.0, 0.0, 8.0, 0.0007, true),
    abr(96, 2.5, 6.6, 145.0, 0.0, 1.0, 5.5, 0.0006, true),
    abr(112, 2.25, 6.6, 145.0, 0.0, 2.0, 4.5, 0.0005, true),
    abr(128, 1.95, 6.4, 140.0, 0.0, 3.0, 4.0, 0.0002, true),
    abr(160, 1.79, 6.0, 135.0, -2.0, 5.0, 3.5, 0.0, true),
    abr(192, 1.49, 5.6, 125.0, -4.0, 7.0, 3.0, 0.0, false),
    abr(224, 1.25, 5.2, 125.0, -6.0, 9.0, 2.0, 0.0, false),
    abr(256, 0.97, 5.2, 125.0, -8.0, 10.0, 1.0, 0.0, false),
    abr(320, 0.90, 5.2, 125.0, -10.0, 12.0, 0.0, 0.0, false),
];
