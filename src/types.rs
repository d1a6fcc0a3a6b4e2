//! Type definitions shared by the analyzer and the quantization loops
//!
//! Layout constants follow the Layer III granule structure: 576 spectral lines per
//! granule, 22 long and 13 short scalefactor band edges, 64 psychoacoustic partitions.

/// Spectral lines per granule
pub const GRANULE_SIZE: usize = 576;
/// Long FFT length used by the psychoacoustic model
pub const BLKSIZE: usize = 1024;
/// Number of distinct long FFT energy bins
pub const HBLKSIZE: usize = BLKSIZE / 2 + 1;
/// Short FFT length used by the psychoacoustic model
pub const BLKSIZE_S: usize = 256;
/// Number of distinct short FFT energy bins
pub const HBLKSIZE_S: usize = BLKSIZE_S / 2 + 1;
/// Maximum number of bark partitions
pub const CBANDS: usize = 64;
/// Long scalefactor bands (including the unused top band)
pub const SBMAX_L: usize = 22;
/// Short scalefactor bands (including the unused top band)
pub const SBMAX_S: usize = 13;
/// Long scalefactor bands carrying psychoacoustic thresholds
pub const SBPSY_L: usize = 21;
/// Short scalefactor bands carrying psychoacoustic thresholds
pub const SBPSY_S: usize = 12;
/// Maximum number of scalefactors in one granule (13 short bands × 3 windows)
pub const SFBMAX: usize = SBMAX_S * 3;
/// Sub-partitions of the top long band used for analog-silence trimming
pub const PSFB21: usize = 6;
/// Sub-partitions of the top short band used for analog-silence trimming
pub const PSFB12: usize = 6;
/// Sentinel bit count reported when a quantization is not encodable
pub const LARGE_BITS: u32 = 100_000;
/// Maximum part2_3_length of one granule/channel
pub const MAX_BITS_PER_CHANNEL: u32 = 4095;
/// Maximum main data bits of one granule (both channels)
pub const MAX_BITS_PER_GRANULE: u32 = 7680;
/// Largest quantized magnitude the escape code books can carry
pub const IXMAX_VAL: i32 = 8206;
pub const MAX_CHANNELS: usize = 2;
pub const MAX_GRANULES: usize = 2;
pub const SQRT2: f32 = std::f32::consts::SQRT_2;
pub const LN_TO_LOG10: f32 = 0.230_258_5;

/// Window type of a granule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "diagnostics", derive(serde::Serialize, serde::Deserialize))]
pub enum BlockType {
    #[default]
    Normal = 0,
    Start = 1,
    Short = 2,
    Stop = 3,
}

impl BlockType {
    pub fn is_short(self) -> bool {
        self == BlockType::Short
    }
}

/// Per-band values for long (22) and short (13 × 3 windows) scalefactor bands
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SfbValues {
    pub l: [f32; SBMAX_L],
    pub s: [[f32; 3]; SBMAX_S],
}

impl SfbValues {
    pub fn filled(value: f32) -> Self {
        Self {
            l: [value; SBMAX_L],
            s: [[value; 3]; SBMAX_S],
        }
    }
}

impl Default for SfbValues {
    fn default() -> Self {
        Self::filled(0.0)
    }
}

/// Energy/threshold pairs of one channel, per scalefactor band
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MaskingRatio {
    /// Signal energy per band
    pub en: SfbValues,
    /// Allowed noise energy per band
    pub thm: SfbValues,
}

impl MaskingRatio {
    /// Initial state of the analyzer history: everything masked
    pub fn saturated() -> Self {
        Self {
            en: SfbValues::filled(1e20),
            thm: SfbValues::filled(1e20),
        }
    }
}

/// Quantization state of one granule of one channel
///
/// Reset by `init_outer_loop` at the start of every granule, mutated by the
/// search loops, and handed to the reservoir once the bits are committed.
#[derive(Debug, Clone, PartialEq)]
pub struct GranuleChannelState {
    /// MDCT coefficients
    pub xr: [f32; GRANULE_SIZE],
    /// |xr|^(3/4)
    pub xrpow: [f32; GRANULE_SIZE],
    /// Quantized magnitudes
    pub l3_enc: [i32; GRANULE_SIZE],
    pub scalefac: [i32; SFBMAX],
    pub xrpow_max: f32,
    pub part2_3_length: u32,
    pub big_values: u32,
    pub count1: u32,
    pub global_gain: i32,
    pub scalefac_compress: u32,
    pub block_type: BlockType,
    pub mixed_block_flag: bool,
    pub table_select: [u32; 3],
    pub subblock_gain: [i32; 4],
    pub region0_count: u32,
    pub region1_count: u32,
    pub preflag: bool,
    /// 0: scalefactor step of sqrt(2), 1: step of 2
    pub scalefac_scale: u32,
    pub count1table_select: u32,
    pub part2_length: u32,
    pub sfb_lmax: usize,
    pub sfb_smin: usize,
    pub psy_lmax: usize,
    pub sfbmax: usize,
    pub psymax: usize,
    pub sfbdivide: usize,
    /// Width of each scalefactor band in spectral lines
    pub width: [usize; SFBMAX],
    /// Short-window index of each scalefactor band (3 for long bands)
    pub window: [usize; SFBMAX],
    pub count1bits: u32,
    /// Scalefactor partition of the MPEG-2 storage scheme
    pub sfb_partition_table: [usize; 4],
    pub slen: [u32; 4],
    pub max_nonzero_coeff: usize,
    pub energy_above_cutoff: [bool; SFBMAX],
}

impl Default for GranuleChannelState {
    fn default() -> Self {
        Self {
            xr: [0.0; GRANULE_SIZE],
            xrpow: [0.0; GRANULE_SIZE],
            l3_enc: [0; GRANULE_SIZE],
            scalefac: [0; SFBMAX],
            xrpow_max: 0.0,
            part2_3_length: 0,
            big_values: 0,
            count1: 0,
            global_gain: 210,
            scalefac_compress: 0,
            block_type: BlockType::Normal,
            mixed_block_flag: false,
            table_select: [0; 3],
            subblock_gain: [0; 4],
            region0_count: 0,
            region1_count: 0,
            preflag: false,
            scalefac_scale: 0,
            count1table_select: 0,
            part2_length: 0,
            sfb_lmax: SBPSY_L,
            sfb_smin: SBPSY_S,
            psy_lmax: SBPSY_L,
            sfbmax: SBPSY_L,
            psymax: SBPSY_L,
            sfbdivide: 11,
            width: [0; SFBMAX],
            window: [3; SFBMAX],
            count1bits: 0,
            sfb_partition_table: [0; 4],
            slen: [0; 4],
            max_nonzero_coeff: GRANULE_SIZE - 1,
            energy_above_cutoff: [false; SFBMAX],
        }
    }
}

impl GranuleChannelState {
    /// A fresh state carrying the given coefficients and window type
    pub fn new(xr: &[f32; GRANULE_SIZE], block_type: BlockType) -> Self {
        Self {
            xr: *xr,
            block_type,
            ..Self::default()
        }
    }

    /// Bits committed to the reservoir for this granule/channel
    pub fn total_bits(&self) -> u32 {
        self.part2_3_length + self.part2_length
    }
}

/// Quantization side information of one frame
#[derive(Debug, Clone, Default)]
pub struct FrameSideInfo {
    pub gr: [[GranuleChannelState; MAX_CHANNELS]; MAX_GRANULES],
}

/// Windowed Hartley spectra of one channel for one granule
///
/// `long` carries the 1024-point transform of the long analysis window, `short`
/// the three 256-point transforms of the short windows. Bin `k` and bin `N - k`
/// together hold the real and imaginary parts of frequency `k`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpectrum {
    pub long: Vec<f32>,
    pub short: [Vec<f32>; 3],
    /// Peak magnitudes of the high-passed signal in 9 equal sub-blocks, when the
    /// provider has time-domain access
    pub attack_envelope: Option<[f32; 9]>,
}

impl Default for ChannelSpectrum {
    fn default() -> Self {
        Self::silent()
    }
}

impl ChannelSpectrum {
    pub fn silent() -> Self {
        Self {
            long: vec![0.0; BLKSIZE],
            short: [vec![0.0; BLKSIZE_S], vec![0.0; BLKSIZE_S], vec![0.0; BLKSIZE_S]],
            attack_envelope: None,
        }
    }

    /// Energy of the 513 long-window bins
    pub fn long_energy(&self) -> [f32; HBLKSIZE] {
        let mut energy = [0.0f32; HBLKSIZE];
        energy[0] = self.long[0] * self.long[0];
        for (k, e) in energy.iter_mut().enumerate().skip(1) {
            let re = self.long[k];
            let im = self.long[(BLKSIZE - k) % BLKSIZE];
            *e = (re * re + im * im) * 0.5;
        }
        energy
    }

    /// Energy of the 129 bins of each short window
    pub fn short_energy(&self) -> [[f32; HBLKSIZE_S]; 3] {
        let mut energy = [[0.0f32; HBLKSIZE_S]; 3];
        for (w, bins) in energy.iter_mut().enumerate() {
            let x = &self.short[w];
            bins[0] = x[0] * x[0];
            for (k, e) in bins.iter_mut().enumerate().skip(1) {
                let re = x[k];
                let im = x[(BLKSIZE_S - k) % BLKSIZE_S];
                *e = (re * re + im * im) * 0.5;
            }
        }
        energy
    }

    /// Mid and side spectra derived from a left/right pair
    ///
    /// The transform is linear, so M = (L + R)/sqrt(2) and S = (L - R)/sqrt(2)
    /// hold bin by bin. The attack envelope cannot be derived from peaks and is
    /// left unset.
    pub fn mid_side(left: &ChannelSpectrum, right: &ChannelSpectrum) -> (ChannelSpectrum, ChannelSpectrum) {
        let scale = SQRT2 * 0.5;
        let combine = |a: &[f32], b: &[f32], sign: f32| -> Vec<f32> {
            a.iter().zip(b).map(|(&l, &r)| (l + sign * r) * scale).collect()
        };
        let mid = ChannelSpectrum {
            long: combine(&left.long, &right.long, 1.0),
            short: [
                combine(&left.short[0], &right.short[0], 1.0),
                combine(&left.short[1], &right.short[1], 1.0),
                combine(&left.short[2], &right.short[2], 1.0),
            ],
            attack_envelope: None,
        };
        let side = ChannelSpectrum {
            long: combine(&left.long, &right.long, -1.0),
            short: [
                combine(&left.short[0], &right.short[0], -1.0),
                combine(&left.short[1], &right.short[1], -1.0),
                combine(&left.short[2], &right.short[2], -1.0),
            ],
            attack_envelope: None,
        };
        (mid, side)
    }

    pub(crate) fn has_valid_layout(&self) -> bool {
        self.long.len() == BLKSIZE && self.short.iter().all(|s| s.len() == BLKSIZE_S)
    }
}

/// Source of per-channel analysis spectra
pub trait SpectralEnergyProvider {
    /// Spectrum of `channel` for analysis block `block`
    fn compute_spectrum(&mut self, block: usize, channel: usize) -> ChannelSpectrum;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_granule_state_default() {
        let gi = GranuleChannelState::default();
        assert_eq!(gi.global_gain, 210);
        assert_eq!(gi.part2_3_length, 0);
        assert_eq!(gi.block_type, BlockType::Normal);
        assert_eq!(gi.sfbmax, SBPSY_L);
        assert!(gi.l3_enc.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_spectrum_energy_of_single_bin() {
        let mut spec = ChannelSpectrum::silent();
        spec.long[10] = 3.0;
        spec.long[BLKSIZE - 10] = 4.0;
        let energy = spec.long_energy();
        assert!((energy[10] - 12.5).abs() < 1e-6);
        assert_eq!(energy[11], 0.0);
    }

    #[test]
    fn test_mid_side_of_identical_channels_has_silent_side() {
        let mut left = ChannelSpectrum::silent();
        left.long[5] = 2.0;
        left.short[1][7] = 1.5;
        let (mid, side) = ChannelSpectrum::mid_side(&left, &left.clone());
        assert!(side.long.iter().all(|&v| v == 0.0));
        assert!((mid.long[5] - 2.0 * SQRT2).abs() < 1e-5);
        assert!((mid.short[1][7] - 1.5 * SQRT2).abs() < 1e-5);
    }
}
