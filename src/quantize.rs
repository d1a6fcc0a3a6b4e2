//! Granule quantization primitives
//!
//! Everything the search loops need to evaluate one granule/channel: the
//! per-granule reset, the allowed noise per band, quantization at a given gain
//! with its bit cost, the resulting noise, the initial step size search and the
//! scalefactor storage cost.

use crate::ath::{ath_adjust, SfbAth};
use crate::config::{Config, RateControl};
use crate::huffman::BitCostEstimator;
use crate::partition::PartitionTables;
use crate::tables::{
    ScalefactorBands, LOG2TAB, MAX_RANGE_SFAC_TAB, NR_OF_SFB_BLOCK, PRETAB, SCALE_LONG, SCALE_MIXED, SCALE_SHORT,
    SLEN1_N, SLEN2_N,
};
use crate::types::{
    BlockType, GranuleChannelState, MaskingRatio, GRANULE_SIZE, IXMAX_VAL, LARGE_BITS, PSFB12, PSFB21, SBMAX_L,
    SBMAX_S, SBPSY_L, SBPSY_S, SFBMAX, SQRT2,
};
use lazy_static::lazy_static;

/// Entries of the x^(4/3) table
const PRECALC_SIZE: usize = IXMAX_VAL as usize + 2;
/// Gain range of the step size tables
const Q_MAX: i32 = 257;
/// Negative offset of the noise step table, for gains lowered by scalefactors
const Q_MAX2: i32 = 116;

/// Flags of the pseudo half-step rounding, one per scalefactor band
pub type PseudoHalf = [bool; SFBMAX];

lazy_static! {
    /// x^(4/3) for every quantized magnitude
    static ref POW43: Vec<f32> = (0..PRECALC_SIZE).map(|i| (i as f64).powf(4.0 / 3.0) as f32).collect();

    /// Rounding offsets placing the decision points at the midpoints in the x^(4/3) domain
    static ref ADJ43: Vec<f32> = {
        let mut adj = vec![0.5f32; PRECALC_SIZE];
        for i in 0..PRECALC_SIZE - 1 {
            let mid = 0.5 * (POW43[i] as f64 + POW43[i + 1] as f64);
            adj[i] = ((i + 1) as f64 - mid.powf(0.75)) as f32;
        }
        adj
    };

    /// Quantizer step 2^(-3/16 (g - 210))
    static ref IPOW20: Vec<f32> = (0..Q_MAX).map(|i| 2f64.powf((i - 210) as f64 * -0.1875) as f32).collect();

    /// Dequantizer step 2^((g - 210) / 4), offset by `Q_MAX2`
    static ref POW20: Vec<f32> =
        (0..Q_MAX + Q_MAX2 + 1).map(|i| 2f64.powf((i - 210 - Q_MAX2) as f64 * 0.25) as f32).collect();
}

/// Dequantized magnitude of `ix` before the step
#[inline]
pub fn pow43(ix: i32) -> f32 {
    POW43[ix.clamp(0, PRECALC_SIZE as i32 - 1) as usize]
}

/// Dequantizer step of an effective gain
#[inline]
pub fn pow20(gain: i32) -> f32 {
    POW20[(gain + Q_MAX2).clamp(0, Q_MAX + Q_MAX2) as usize]
}

/// Quantizer step of a global gain
#[inline]
pub fn ipow20(gain: i32) -> f32 {
    IPOW20[gain.clamp(0, Q_MAX - 1) as usize]
}

#[inline]
pub(crate) fn adj43(x: f32) -> f32 {
    ADJ43[(x as usize).min(PRECALC_SIZE - 1)]
}

/// Pre-emphasis added to long band `sfb` when `preflag` is set
#[inline]
pub fn pretab(sfb: usize) -> i32 {
    PRETAB.get(sfb).copied().unwrap_or(0)
}

/// Noise of one quantization against the allowed noise
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NoiseResult {
    /// Bands whose noise exceeds the allowed noise
    pub over_count: i32,
    /// Largest band noise in log10 units of the allowed noise
    pub max_noise: f32,
    /// Sum of the log10 noise over the bands above their allowance
    pub over_noise: f32,
    /// Sum of the log10 noise over all bands
    pub tot_noise: f32,
    /// Sum of squared tenth-dB excesses
    pub over_ssd: i32,
    /// Main data bits of the quantization
    pub bits: i32,
}

/// Step size search state carried across granules of one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepSearchState {
    pub current_step: i32,
    pub old_value: i32,
}

impl Default for StepSearchState {
    fn default() -> Self {
        Self {
            current_step: 4,
            old_value: 180,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SearchDirection {
    None,
    Up,
    Down,
}

/// Stream-wide parameters of the granule primitives
#[derive(Debug, Clone)]
pub struct QuantizeContext {
    bands: ScalefactorBands,
    ath: SfbAth,
    sample_rate: u32,
    granules: usize,
    mpeg1: bool,
    sfb21_extra: bool,
    substep_shaping: u8,
    iso_quantization: bool,
    temporal_masking: bool,
    decay: f32,
    longfact: [f32; SBMAX_L],
    shortfact: [f32; SBMAX_S],
    mld_l: [f32; SBMAX_L],
    mld_s: [f32; SBMAX_S],
    ms_sparsing: u8,
    sparse_a: f32,
    sparse_b: f32,
    /// Variable bitrate thresholds in quiet follow the signal loudness
    ath_loudness: bool,
}

impl QuantizeContext {
    pub fn new(config: &Config, tables: &PartitionTables) -> Self {
        let mut mld_l = [0.0; SBMAX_L];
        for (dst, &src) in mld_l.iter_mut().zip(&tables.long.mld) {
            *dst = src;
        }
        let mut mld_s = [0.0; SBMAX_S];
        for (dst, &src) in mld_s.iter_mut().zip(&tables.short.mld) {
            *dst = src;
        }
        Self {
            bands: tables.sfb.clone(),
            ath: tables.sfb_ath.clone(),
            sample_rate: config.wave.sample_rate,
            granules: config.granules_per_frame(),
            mpeg1: config.is_mpeg1(),
            sfb21_extra: config.psy.sfb21_extra,
            substep_shaping: config.quant.substep_shaping,
            iso_quantization: config.quant.iso_quantization,
            temporal_masking: config.psy.temporal_masking,
            decay: tables.decay,
            longfact: config.quant.longfact,
            shortfact: config.quant.shortfact,
            mld_l,
            mld_s,
            ms_sparsing: config.quant.ms_sparsing,
            sparse_a: config.quant.sparse_a,
            sparse_b: config.quant.sparse_b,
            ath_loudness: matches!(config.rate, RateControl::Vbr { .. }),
        }
    }

    pub fn bands(&self) -> &ScalefactorBands {
        &self.bands
    }

    pub fn is_mpeg1(&self) -> bool {
        self.mpeg1
    }

    pub fn sfb21_extra(&self) -> bool {
        self.sfb21_extra
    }

    pub fn substep_shaping(&self) -> u8 {
        self.substep_shaping
    }

    /// Reset a granule for a fresh search
    ///
    /// Short blocks arrive interleaved (`xr[3 * line + window]`) and leave
    /// ordered band by band, window by window within each band.
    pub fn init_outer_loop(&self, gi: &mut GranuleChannelState) {
        gi.part2_3_length = 0;
        gi.big_values = 0;
        gi.count1 = 0;
        gi.global_gain = 210;
        gi.scalefac_compress = 0;
        gi.table_select = [0; 3];
        gi.subblock_gain = [0; 4];
        gi.region0_count = 0;
        gi.region1_count = 0;
        gi.preflag = false;
        gi.scalefac_scale = 0;
        gi.count1table_select = 0;
        gi.part2_length = 0;
        gi.sfb_lmax = SBPSY_L;
        gi.sfb_smin = SBPSY_S;
        gi.psy_lmax = if self.sfb21_extra { SBMAX_L } else { SBPSY_L };
        gi.psymax = gi.psy_lmax;
        gi.sfbmax = gi.sfb_lmax;
        gi.sfbdivide = 11;

        let l = &self.bands.l;
        for sfb in 0..SBMAX_L {
            gi.width[sfb] = l[sfb + 1] - l[sfb];
            gi.window[sfb] = 3;
        }

        if gi.block_type == BlockType::Short {
            let (sfb_lmax, sfb_smin) = self.band_split(gi);
            gi.sfb_lmax = sfb_lmax;
            gi.sfb_smin = sfb_smin;
            let top = if self.sfb21_extra { SBMAX_S } else { SBPSY_S };
            gi.psymax = sfb_lmax + 3 * (top - sfb_smin);
            gi.sfbmax = sfb_lmax + 3 * (SBPSY_S - sfb_smin);
            gi.sfbdivide = gi.sfbmax - 18;
            gi.psy_lmax = sfb_lmax;

            let s = &self.bands.s;
            let interleaved = gi.xr;
            let mut ix = l[sfb_lmax];
            for sfb in sfb_smin..SBMAX_S {
                for window in 0..3 {
                    for line in s[sfb]..s[sfb + 1] {
                        gi.xr[ix] = interleaved[3 * line + window];
                        ix += 1;
                    }
                }
            }

            let mut j = sfb_lmax;
            for sfb in sfb_smin..SBMAX_S {
                let width = s[sfb + 1] - s[sfb];
                for window in 0..3 {
                    gi.width[j + window] = width;
                    gi.window[j + window] = window;
                }
                j += 3;
            }
        }

        gi.count1bits = 0;
        gi.sfb_partition_table = NR_OF_SFB_BLOCK[0][0];
        gi.slen = [0; 4];
        gi.max_nonzero_coeff = GRANULE_SIZE - 1;
        gi.scalefac = [0; SFBMAX];

        self.psfb21_analogsilence(gi);
    }

    /// Long bands and first short band of a granule: `(sfb_lmax, sfb_smin)`
    fn band_split(&self, gi: &GranuleChannelState) -> (usize, usize) {
        match (gi.block_type, gi.mixed_block_flag) {
            (BlockType::Short, true) => (self.granules * 2 + 4, 3),
            (BlockType::Short, false) => (0, 0),
            _ => (SBPSY_L, SBPSY_S),
        }
    }

    /// Zero the coefficients of the top band that fall below the threshold in
    /// quiet, from the top down to the first audible one
    pub fn psfb21_analogsilence(&self, gi: &mut GranuleChannelState) {
        let ath = &self.ath;
        match gi.block_type {
            BlockType::Normal => {
                for gsfb in (0..PSFB21).rev() {
                    let start = self.bands.psfb21[gsfb];
                    let end = self.bands.psfb21[gsfb + 1];
                    let mut ath21 = ath_adjust(ath.adjust, ath.psfb21[gsfb], ath.floor);
                    if self.longfact[SBMAX_L - 1] != 0.0 {
                        ath21 *= self.longfact[SBMAX_L - 1];
                    }
                    if !zero_below(&mut gi.xr[start..end], ath21) {
                        break;
                    }
                }
            }
            BlockType::Short => {
                let s = &self.bands.s;
                let p = &self.bands.psfb12;
                for block in 0..3 {
                    for gsfb in (0..PSFB12).rev() {
                        let start = s[12] * 3 + (s[13] - s[12]) * block + (p[gsfb] - p[0]);
                        let end = start + (p[gsfb + 1] - p[gsfb]);
                        let mut ath12 = ath_adjust(ath.adjust, ath.psfb12[gsfb], ath.floor);
                        if self.shortfact[SBMAX_S - 1] != 0.0 {
                            ath12 *= self.shortfact[SBMAX_S - 1];
                        }
                        if !zero_below(&mut gi.xr[start..end.min(GRANULE_SIZE)], ath12) {
                            break;
                        }
                    }
                }
            }
            BlockType::Start | BlockType::Stop => {}
        }
    }

    /// Fill `xrpow` with |xr|^(3/4); false when the granule has no energy
    pub fn init_xrpow(&self, gi: &mut GranuleChannelState, pseudohalf: &mut PseudoHalf) -> bool {
        let upper = gi.max_nonzero_coeff.min(GRANULE_SIZE - 1);
        let mut sum = 0.0f32;
        let mut max = 0.0f32;
        for (pow, &x) in gi.xrpow[..=upper].iter_mut().zip(&gi.xr[..=upper]) {
            let a = x.abs();
            sum += a;
            *pow = (a * a.sqrt()).sqrt();
            max = max.max(*pow);
        }
        gi.xrpow[upper + 1..].fill(0.0);
        gi.xrpow_max = max;

        if sum > 1e-20 {
            let half = self.substep_shaping & 2 != 0;
            pseudohalf[..gi.psymax.min(SFBMAX)].fill(half);
            return true;
        }
        gi.l3_enc = [0; GRANULE_SIZE];
        false
    }

    /// Allowed noise per band; returns the number of bands above the threshold in quiet
    ///
    /// Also sets `max_nonzero_coeff` and `energy_above_cutoff`.
    pub fn calc_xmin(
        &self,
        ratio: &MaskingRatio,
        gi: &mut GranuleChannelState,
        masking_lower: f32,
        xmin: &mut [f32; SFBMAX],
    ) -> u32 {
        let ath = &self.ath;
        let mut ath_over = 0;
        let mut j = 0;

        let mut gsfb = 0;
        while gsfb < gi.psy_lmax {
            let mut x = if self.ath_loudness {
                ath_adjust(ath.adjust, ath.l[gsfb], ath.floor)
            } else {
                ath.adjust * ath.l[gsfb]
            };
            let width = gi.width[gsfb];
            let en0 = band_energy(&gi.xr[j..j + width]);
            j += width;
            if en0 > x {
                ath_over += 1;
            }

            let e = ratio.en.l[gsfb];
            if e > 0.0 {
                let masked = en0 * ratio.thm.l[gsfb] * masking_lower / e * self.longfact[gsfb];
                x = x.max(masked);
            }
            x = x.max(f32::EPSILON);
            gi.energy_above_cutoff[gsfb] = en0 > x + 1e-14;
            xmin[gsfb] = x;
            gsfb += 1;
        }

        self.limit_nonzero(gi);

        let mut sfb = gi.sfb_smin;
        while gsfb < gi.psymax {
            let tmp_ath = if self.ath_loudness {
                ath_adjust(ath.adjust, ath.s[sfb], ath.floor)
            } else {
                ath.adjust * ath.s[sfb]
            };
            let width = gi.width[gsfb];
            for b in 0..3 {
                let en0 = band_energy(&gi.xr[j..j + width]);
                j += width;
                if en0 > tmp_ath {
                    ath_over += 1;
                }

                let mut x = tmp_ath;
                let e = ratio.en.s[sfb][b];
                if e > 0.0 {
                    let masked = en0 * ratio.thm.s[sfb][b] * masking_lower / e * self.shortfact[sfb];
                    x = x.max(masked);
                }
                x = x.max(f32::EPSILON);
                gi.energy_above_cutoff[gsfb + b] = en0 > x + 1e-14;
                xmin[gsfb + b] = x;
            }
            if self.temporal_masking {
                for w in 0..2 {
                    let (prev, next) = (xmin[gsfb + w], xmin[gsfb + w + 1]);
                    if prev > next {
                        xmin[gsfb + w + 1] += (prev - next) * self.decay;
                    }
                }
            }
            gsfb += 3;
            sfb += 1;
        }

        ath_over
    }

    /// Highest line worth quantizing
    fn limit_nonzero(&self, gi: &mut GranuleChannelState) {
        let k = (1..GRANULE_SIZE).rev().find(|&k| gi.xr[k].abs() > 1e-12).unwrap_or(0);
        let mut max_nonzero = if gi.block_type == BlockType::Short {
            k / 6 * 6 + 5
        } else {
            k | 1
        };
        if !self.sfb21_extra && self.sample_rate < 44000 {
            let (sfb_l, sfb_s) = if self.sample_rate <= 8000 { (17, 9) } else { (21, 12) };
            let limit = if gi.block_type == BlockType::Short {
                3 * self.bands.s[sfb_s] - 1
            } else {
                self.bands.l[sfb_l] - 1
            };
            max_nonzero = max_nonzero.min(limit);
        }
        gi.max_nonzero_coeff = max_nonzero.min(GRANULE_SIZE - 1);
    }

    /// Quantize `xrpow` at the granule's global gain and count its bits
    ///
    /// Returns `LARGE_BITS` when the largest value does not fit the escape range.
    /// Does not touch `part2_3_length`.
    pub fn count_bits(
        &self,
        estimator: &dyn BitCostEstimator,
        gi: &mut GranuleChannelState,
        pseudohalf: &PseudoHalf,
    ) -> u32 {
        let istep = ipow20(gi.global_gain);
        if gi.xrpow_max > IXMAX_VAL as f32 / istep {
            return LARGE_BITS;
        }
        self.quantize_xrpow(gi, istep);

        if self.substep_shaping & 2 != 0 {
            let roundfac = 0.634_521_7 / ipow20(gi.global_gain + gi.scalefac_scale as i32);
            let mut j = 0;
            for sfb in 0..gi.sfbmax {
                let end = (j + gi.width[sfb]).min(GRANULE_SIZE);
                if pseudohalf[sfb] {
                    for k in j..end {
                        if gi.xrpow[k] < roundfac {
                            gi.l3_enc[k] = 0;
                        }
                    }
                }
                j = end;
            }
        }

        estimator.count_bits(gi)
    }

    fn quantize_xrpow(&self, gi: &mut GranuleChannelState, istep: f32) {
        let iso = self.iso_quantization;
        for (ix, &pow) in gi.l3_enc.iter_mut().zip(gi.xrpow.iter()) {
            let x = pow * istep;
            *ix = if iso {
                (x + 0.4054) as i32
            } else {
                (x + adj43(x)) as i32
            };
        }
    }

    /// Quantization noise of every band against `xmin`
    ///
    /// `distort` receives the noise to allowed-noise ratio of each band.
    pub fn calc_noise(
        &self,
        gi: &GranuleChannelState,
        xmin: &[f32; SFBMAX],
        distort: &mut [f32; SFBMAX],
    ) -> NoiseResult {
        let mut res = NoiseResult {
            max_noise: -20.0,
            ..NoiseResult::default()
        };
        let mut j = 0usize;

        for sfb in 0..gi.psymax {
            let pre = if gi.preflag { pretab(sfb) } else { 0 };
            let s = gi.global_gain
                - ((gi.scalefac[sfb] + pre) << (gi.scalefac_scale + 1))
                - gi.subblock_gain[gi.window[sfb]] * 8;
            let step = pow20(s);

            let width = gi.width[sfb];
            let mut lines = width;
            if j + width > gi.max_nonzero_coeff {
                let usefull = gi.max_nonzero_coeff as isize - j as isize + 1;
                lines = if usefull > 0 { (usefull as usize >> 1) << 1 } else { 0 };
            }

            let mut noise = 0.0f32;
            for k in j..(j + lines).min(GRANULE_SIZE) {
                let diff = gi.xr[k].abs() - pow43(gi.l3_enc[k]) * step;
                noise += diff * diff;
            }
            j += lines;

            let ratio = noise / xmin[sfb];
            distort[sfb] = ratio;
            let db = ratio.max(1e-20).log10();
            if db > 0.0 {
                let tenth = ((db * 10.0 + 0.5) as i32).max(1);
                res.over_ssd += tenth * tenth;
                res.over_count += 1;
                res.over_noise += db;
            }
            res.tot_noise += db;
            res.max_noise = res.max_noise.max(db);
        }

        res
    }

    /// Global gain meeting `desired_rate` bits, by stepwise search from the
    /// previous granule's gain; sets `part2_3_length`
    pub fn bin_search_step_size(
        &self,
        estimator: &dyn BitCostEstimator,
        gi: &mut GranuleChannelState,
        desired_rate: i32,
        state: &mut StepSearchState,
        pseudohalf: &PseudoHalf,
    ) -> u32 {
        let mut step = state.current_step;
        let start = state.old_value;
        let mut gone_over = false;
        let mut direction = SearchDirection::None;
        let desired = desired_rate - gi.part2_length as i32;
        gi.global_gain = start;

        let mut bits;
        loop {
            bits = self.count_bits(estimator, gi, pseudohalf);
            if step == 1 || bits as i32 == desired {
                break;
            }
            let delta = if bits as i32 > desired {
                if direction == SearchDirection::Down {
                    gone_over = true;
                }
                if gone_over {
                    step /= 2;
                }
                direction = SearchDirection::Up;
                step
            } else {
                if direction == SearchDirection::Up {
                    gone_over = true;
                }
                if gone_over {
                    step /= 2;
                }
                direction = SearchDirection::Down;
                -step
            };
            gi.global_gain += delta;
            if !(0..256).contains(&gi.global_gain) {
                break;
            }
        }

        if gi.global_gain < 0 {
            gi.global_gain = 0;
            bits = self.count_bits(estimator, gi, pseudohalf);
        } else if gi.global_gain > 255 {
            gi.global_gain = 255;
            bits = self.count_bits(estimator, gi, pseudohalf);
        } else if bits as i32 > desired {
            gi.global_gain += 1;
            bits = self.count_bits(estimator, gi, pseudohalf);
        }

        state.current_step = if start - gi.global_gain >= 4 { 4 } else { 2 };
        state.old_value = gi.global_gain;
        gi.part2_3_length = bits;
        log::trace!("step search: gain {} -> {}, {} bits for {}", start, gi.global_gain, bits, desired);
        bits
    }

    /// Zero small quantized values while the band's noise stays within its allowance
    pub fn trancate_smallspectrums(
        &self,
        estimator: &dyn BitCostEstimator,
        gi: &mut GranuleChannelState,
        xmin: &[f32; SFBMAX],
    ) {
        let short = gi.block_type == BlockType::Short;
        if (self.substep_shaping & 4 == 0 && short) || self.substep_shaping & 0x80 != 0 {
            return;
        }

        let mut distort = [0.0; SFBMAX];
        self.calc_noise(gi, xmin, &mut distort);

        let mut work = [0.0f32; GRANULE_SIZE];
        for (w, (&x, &ix)) in work.iter_mut().zip(gi.xr.iter().zip(gi.l3_enc.iter())) {
            if ix != 0 {
                *w = x.abs();
            }
        }

        let first = if short { 6 } else { 8 };
        let mut j: usize = gi.width[..first].iter().sum();
        for sfb in first..gi.psymax {
            let width = gi.width[sfb];
            let start = j;
            j += width;
            if distort[sfb] >= 1.0 || width == 0 || j > GRANULE_SIZE {
                continue;
            }

            let band = &mut work[start..j];
            band.sort_by(|a, b| a.total_cmp(b));
            if band[width - 1] == 0.0 {
                continue;
            }

            let mut allowed = (1.0 - distort[sfb]) * xmin[sfb];
            let mut threshold = 0.0;
            let mut k = 0;
            while k < width {
                let mut nsame = 1;
                while k + nsame < width && band[k] == band[k + nsame] {
                    nsame += 1;
                }
                let noise = band[k] * band[k] * nsame as f32;
                if allowed < noise {
                    if k != 0 {
                        threshold = band[k - 1];
                    }
                    break;
                }
                allowed -= noise;
                k += nsame;
            }
            if threshold == 0.0 {
                continue;
            }

            for i in start..j {
                if gi.xr[i].abs() <= threshold {
                    gi.l3_enc[i] = 0;
                }
            }
        }

        gi.part2_3_length = estimator.count_bits(gi);
    }

    /// Fold weak mid or side lines into the other channel
    ///
    /// Runs on the interleaved coefficients, before the granules are reset.
    pub fn ms_sparsing(&self, pair: &mut [GranuleChannelState; 2]) {
        if self.ms_sparsing == 0 {
            return;
        }
        let threshold_of = |mld: f32| 10f32.powf(-(self.sparse_a - mld * self.sparse_b) / 10.0);
        let (sfb_lmax, sfb_smin) = self.band_split(&pair[0]);
        let [mid, side] = pair;
        let mut j = 0;
        let mut threshold = 0.0;

        for sfb in 0..sfb_lmax {
            let width = self.bands.l[sfb + 1] - self.bands.l[sfb];
            threshold = threshold_of(self.mld_l[sfb]);
            for _ in (0..width).step_by(2) {
                sparse_pair(&mut mid.xr, &mut side.xr, j, j + 1, threshold);
                j += 2;
            }
        }

        let mut sfb = sfb_smin;
        while sfb < SBPSY_S {
            let width = self.bands.s[sfb + 1] - self.bands.s[sfb];
            threshold = threshold_of(self.mld_s[sfb]);
            for _ in (0..width).step_by(2) {
                for k in 0..3 {
                    sparse_pair(&mut mid.xr, &mut side.xr, j + k, j + k + 3, threshold);
                }
                j += 6;
            }
            sfb += 1;
        }

        let m = if sfb == SBPSY_S { 3 } else { 1 };
        while j < GRANULE_SIZE - 1 {
            for i in 0..m {
                let (a, b) = (j + i, j + i + m);
                if b >= GRANULE_SIZE {
                    break;
                }
                if self.ms_sparsing == 2 {
                    for idx in [a, b] {
                        mid.xr[idx] += side.xr[idx];
                        side.xr[idx] = 0.0;
                    }
                } else {
                    sparse_pair(&mut mid.xr, &mut side.xr, a, b, threshold);
                }
            }
            j += 2 * m;
        }
    }
}

/// Zero `xr` from the top while below `ath`; true when every line was zeroed
fn zero_below(xr: &mut [f32], ath: f32) -> bool {
    for x in xr.iter_mut().rev() {
        if x.abs() < ath {
            *x = 0.0;
        } else {
            return false;
        }
    }
    true
}

fn band_energy(xr: &[f32]) -> f32 {
    xr.iter().map(|x| x * x).sum()
}

fn sparse_pair(mid: &mut [f32; GRANULE_SIZE], side: &mut [f32; GRANULE_SIZE], a: usize, b: usize, threshold: f32) {
    let (m0, m1) = (mid[a] * mid[a], mid[b] * mid[b]);
    let (s0, s1) = (side[a] * side[a], side[b] * side[b]);
    if s0 < m0 * threshold && s1 < m1 * threshold {
        mid[a] += side[a];
        side[a] = 0.0;
        mid[b] += side[b];
        side[b] = 0.0;
    }
    if m0 < s0 * threshold && m1 < s1 * threshold {
        side[a] += mid[a];
        mid[a] = 0.0;
        side[b] += mid[b];
        mid[b] = 0.0;
    }
}

/// Left/right to mid/side
pub fn ms_convert(pair: &mut [GranuleChannelState; 2]) {
    let [left, right] = pair;
    for (l, r) in left.xr.iter_mut().zip(right.xr.iter_mut()) {
        let (a, b) = (*l, *r);
        *l = (a + b) * (SQRT2 * 0.5);
        *r = (a - b) * (SQRT2 * 0.5);
    }
}

/// Scalefactor storage cost for the stream's MPEG version
///
/// Sets `part2_length` and `scalefac_compress`; returns false when the
/// scalefactors cannot be stored.
pub fn scale_bitcount(gi: &mut GranuleChannelState, mpeg1: bool) -> bool {
    if mpeg1 {
        scale_bitcount_mpeg1(gi)
    } else {
        scale_bitcount_lsf(gi)
    }
}

/// MPEG-1 storage, choosing the cheapest `scalefac_compress`; may turn on
/// `preflag` when every upper long band can absorb the pre-emphasis
pub fn scale_bitcount_mpeg1(gi: &mut GranuleChannelState) -> bool {
    let tab = if gi.block_type == BlockType::Short {
        if gi.mixed_block_flag {
            &SCALE_MIXED
        } else {
            &SCALE_SHORT
        }
    } else {
        if !gi.preflag && (11..SBPSY_L).all(|sfb| gi.scalefac[sfb] >= PRETAB[sfb]) {
            gi.preflag = true;
            for sfb in 11..SBPSY_L {
                gi.scalefac[sfb] -= PRETAB[sfb];
            }
        }
        &SCALE_LONG
    };

    let divide = gi.sfbdivide.min(gi.sfbmax);
    let max_slen1 = gi.scalefac[..divide].iter().copied().fold(0, i32::max);
    let max_slen2 = gi.scalefac[divide..gi.sfbmax].iter().copied().fold(0, i32::max);

    gi.part2_length = LARGE_BITS;
    for k in 0..16 {
        if max_slen1 < SLEN1_N[k] && max_slen2 < SLEN2_N[k] && gi.part2_length > tab[k] {
            gi.part2_length = tab[k];
            gi.scalefac_compress = k as u32;
        }
    }
    gi.part2_length != LARGE_BITS
}

/// MPEG-2/2.5 storage over four partitions of bands
pub fn scale_bitcount_lsf(gi: &mut GranuleChannelState) -> bool {
    let table = if gi.preflag { 2 } else { 0 };
    let short = gi.block_type == BlockType::Short;
    let row = if short { 1 } else { 0 };
    let partitions = NR_OF_SFB_BLOCK[table][row];

    let mut max_sfac = [0i32; 4];
    let mut sfb = 0;
    for (partition, &count) in partitions.iter().enumerate() {
        if short {
            for _ in 0..count / 3 {
                for window in 0..3 {
                    max_sfac[partition] = max_sfac[partition].max(gi.scalefac[sfb * 3 + window]);
                }
                sfb += 1;
            }
        } else {
            for _ in 0..count {
                max_sfac[partition] = max_sfac[partition].max(gi.scalefac[sfb]);
                sfb += 1;
            }
        }
    }

    let over = max_sfac
        .iter()
        .zip(MAX_RANGE_SFAC_TAB[table].iter())
        .any(|(&max, &range)| max > range);
    if over {
        gi.part2_length = LARGE_BITS;
        return false;
    }

    gi.sfb_partition_table = partitions;
    for (slen, &max) in gi.slen.iter_mut().zip(max_sfac.iter()) {
        *slen = LOG2TAB[max.clamp(0, 15) as usize];
    }
    let [s1, s2, s3, s4] = gi.slen;
    gi.scalefac_compress = if table == 0 {
        (((s1 * 5) + s2) << 4) + (s3 << 2) + s4
    } else {
        500 + s1 * 3 + s2
    };
    gi.part2_length = gi
        .slen
        .iter()
        .zip(partitions.iter())
        .map(|(&slen, &count)| slen * count as u32)
        .sum();
    true
}
