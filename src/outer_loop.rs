//! Noise shaping search
//!
//! Starting from the step size that meets a bit target, the outer loop
//! repeatedly amplifies the bands whose noise is above the allowed noise,
//! requantizes within the target and keeps the best result according to the
//! configured comparison. The variable bitrate search wraps it in a bisection
//! over the bit budget.

use crate::compare::{self, NoiseComparison};
use crate::config::{Config, NoiseShapingAmp, RateControl};
use crate::huffman::BitCostEstimator;
use crate::quantize::{ipow20, pretab, scale_bitcount, PseudoHalf, QuantizeContext, StepSearchState};
use crate::types::{BlockType, GranuleChannelState, GRANULE_SIZE, SFBMAX};

/// x^(3/4) of one scalefactor step, for scale 0 and 1
const IFQSTEP34: [f32; 2] = [1.296_839_6, 1.681_792_8];

/// Search steps of the outer loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    /// Amplify distorted bands and check the scalefactors still fit
    Amplify,
    /// Requantize within the target and compare with the best so far
    Evaluate,
    /// A pass is over; start the refinement pass or stop
    PassEnd,
    Terminate,
}

/// Quantizes one granule/channel against its allowed noise
pub struct GranuleQuantizer {
    ctx: QuantizeContext,
    estimator: Box<dyn BitCostEstimator>,
    comparison: Box<dyn NoiseComparison>,
    comparison_short: Box<dyn NoiseComparison>,
    noise_shaping: u8,
    amp: NoiseShapingAmp,
    full_outer_loop: bool,
    use_subblock_gain: bool,
    vbr: bool,
}

impl GranuleQuantizer {
    pub fn new(config: &Config, ctx: QuantizeContext, estimator: Box<dyn BitCostEstimator>) -> Self {
        Self {
            ctx,
            estimator,
            comparison: compare::from_id(config.quant.comparison),
            comparison_short: compare::from_id(config.quant.comparison_short),
            noise_shaping: config.quant.noise_shaping,
            amp: config.quant.noise_shaping_amp,
            full_outer_loop: config.quant.full_outer_loop,
            use_subblock_gain: config.quant.use_subblock_gain,
            vbr: matches!(config.rate, RateControl::Vbr { .. }),
        }
    }

    pub fn context(&self) -> &QuantizeContext {
        &self.ctx
    }

    pub fn estimator(&self) -> &dyn BitCostEstimator {
        self.estimator.as_ref()
    }

    /// Best quantization of `gi` within `targ_bits`
    ///
    /// Returns the number of distorted bands of the result, or 100 when noise
    /// shaping is off and only the step size was searched.
    pub fn outer_loop(
        &self,
        gi: &mut GranuleChannelState,
        xmin: &[f32; SFBMAX],
        targ_bits: i32,
        step: &mut StepSearchState,
        pseudohalf: &mut PseudoHalf,
    ) -> i32 {
        self.search(gi, xmin, targ_bits, step, pseudohalf, self.ctx.sfb21_extra())
    }

    /// Noise heuristic for a block type; every long window uses the long one
    fn comparison_for(&self, block_type: BlockType) -> &dyn NoiseComparison {
        if block_type == BlockType::Short {
            self.comparison_short.as_ref()
        } else {
            self.comparison.as_ref()
        }
    }

    fn search(
        &self,
        gi: &mut GranuleChannelState,
        xmin: &[f32; SFBMAX],
        targ_bits: i32,
        step: &mut StepSearchState,
        pseudohalf: &mut PseudoHalf,
        sfb21_extra: bool,
    ) -> i32 {
        let estimator = self.estimator.as_ref();
        self.ctx.bin_search_step_size(estimator, gi, targ_bits, step, pseudohalf);
        if self.noise_shaping == 0 {
            return 100;
        }

        let mut distort = [0.0f32; SFBMAX];
        let mut best = self.ctx.calc_noise(gi, xmin, &mut distort);
        best.bits = gi.part2_3_length as i32;

        let comparison = self.comparison_for(gi.block_type);
        let search_limit = if self.ctx.substep_shaping() & 2 != 0 { 20 } else { 3 };

        let mut work = gi.clone();
        let mut age = 0;
        let mut best_part2_3 = 9_999_999i32;
        let mut refine = false;
        let mut first_pass_gain = 0;
        let mut state = LoopState::Amplify;

        loop {
            state = match state {
                LoopState::Amplify => {
                    if sfb21_extra && self.top_band_distorted(&work, &distort) {
                        LoopState::PassEnd
                    } else if !self.balance_noise(&mut work, &distort, refine, pseudohalf) {
                        LoopState::PassEnd
                    } else {
                        LoopState::Evaluate
                    }
                }
                LoopState::Evaluate => {
                    let max_gain = if work.scalefac_scale != 0 { 254 } else { 255 };
                    let huff_bits = targ_bits - work.part2_length as i32;
                    if huff_bits <= 0 || !self.raise_gain_within(&mut work, huff_bits, max_gain, pseudohalf) {
                        LoopState::PassEnd
                    } else if best.over_count == 0
                        && !self.raise_gain_within(&mut work, best_part2_3, max_gain, pseudohalf)
                    {
                        LoopState::PassEnd
                    } else {
                        let mut noise = self.ctx.calc_noise(&work, xmin, &mut distort);
                        noise.bits = work.part2_3_length as i32;
                        let mut stop = false;
                        if comparison.is_better(&best, &mut noise, &distort, work.psymax) {
                            best = noise;
                            *gi = work.clone();
                            best_part2_3 = gi.part2_3_length as i32;
                            age = 0;
                        } else if !self.full_outer_loop {
                            age += 1;
                            if age > search_limit && best.over_count == 0 {
                                stop = true;
                            }
                            if self.amp == NoiseShapingAmp::TwoPassRefine
                                && refine
                                && (age > 30 || work.global_gain - first_pass_gain > 15)
                            {
                                stop = true;
                            }
                        }
                        if stop || work.global_gain + work.scalefac_scale as i32 >= 255 {
                            LoopState::PassEnd
                        } else {
                            LoopState::Amplify
                        }
                    }
                }
                LoopState::PassEnd => {
                    if self.amp == NoiseShapingAmp::TwoPassRefine && !refine {
                        work = gi.clone();
                        age = 0;
                        first_pass_gain = work.global_gain;
                        refine = true;
                        LoopState::Amplify
                    } else {
                        LoopState::Terminate
                    }
                }
                LoopState::Terminate => break,
            };
        }

        if !self.vbr && self.ctx.substep_shaping() & 1 != 0 {
            self.ctx.trancate_smallspectrums(estimator, gi, xmin);
        }
        log::trace!(
            "outer loop: gain {}, {} bits of {}, {} bands over",
            gi.global_gain,
            gi.part2_3_length,
            targ_bits,
            best.over_count
        );
        best.over_count
    }

    /// Raise the global gain until the granule fits `limit` bits; false when
    /// the gain runs past `max_gain`
    fn raise_gain_within(&self, gi: &mut GranuleChannelState, limit: i32, max_gain: i32, pseudohalf: &PseudoHalf) -> bool {
        loop {
            gi.part2_3_length = self.ctx.count_bits(self.estimator.as_ref(), gi, pseudohalf);
            if gi.part2_3_length as i32 <= limit || gi.global_gain > max_gain {
                break;
            }
            gi.global_gain += 1;
        }
        gi.global_gain <= max_gain
    }

    fn top_band_distorted(&self, gi: &GranuleChannelState, distort: &[f32; SFBMAX]) -> bool {
        let top = gi.sfbmax;
        if distort[top] > 1.0 {
            return true;
        }
        gi.block_type == BlockType::Short && (distort[top + 1] > 1.0 || distort[top + 2] > 1.0)
    }

    /// Amplify distorted bands and make the scalefactors storable again;
    /// false when the search cannot continue
    fn balance_noise(
        &self,
        gi: &mut GranuleChannelState,
        distort: &[f32; SFBMAX],
        refine: bool,
        pseudohalf: &mut PseudoHalf,
    ) -> bool {
        self.amp_scalefac_bands(gi, distort, refine, pseudohalf);
        if loop_break(gi) {
            return false;
        }

        let mpeg1 = self.ctx.is_mpeg1();
        if scale_bitcount(gi, mpeg1) {
            return true;
        }

        let mut failed = true;
        if self.noise_shaping > 1 {
            pseudohalf.fill(false);
            if gi.scalefac_scale == 0 {
                inc_scalefac_scale(gi);
                failed = false;
            } else if gi.block_type == BlockType::Short && self.use_subblock_gain {
                failed = !inc_subblock_gain(gi) || loop_break(gi);
            }
        }
        if !failed {
            failed = !scale_bitcount(gi, mpeg1);
        }
        !failed
    }

    /// Raise the scalefactor of every band at or above the distortion trigger
    fn amp_scalefac_bands(&self, gi: &mut GranuleChannelState, distort: &[f32; SFBMAX], refine: bool, pseudohalf: &mut PseudoHalf) {
        let ifqstep34 = IFQSTEP34[(gi.scalefac_scale != 0) as usize];
        let mut trigger = distort[..gi.sfbmax].iter().copied().fold(0.0f32, f32::max);

        let mode = match self.amp {
            NoiseShapingAmp::TwoPassRefine if refine => NoiseShapingAmp::SingleBand,
            NoiseShapingAmp::TwoPassRefine => NoiseShapingAmp::HalfOfWorst,
            amp => amp,
        };
        trigger = match mode {
            NoiseShapingAmp::HalfOfWorst if trigger > 1.0 => trigger.sqrt(),
            NoiseShapingAmp::Iso if trigger > 1.0 => 1.0,
            NoiseShapingAmp::SingleBand => trigger,
            _ => trigger * 0.95,
        };

        let single_band = self.amp == NoiseShapingAmp::SingleBand;
        let half_steps = self.ctx.substep_shaping() & 2 != 0;
        let mut j = 0;
        for sfb in 0..gi.sfbmax {
            let start = j;
            j += gi.width[sfb];
            if distort[sfb] < trigger {
                continue;
            }
            if half_steps {
                pseudohalf[sfb] = !pseudohalf[sfb];
                if !pseudohalf[sfb] && single_band {
                    return;
                }
            }
            gi.scalefac[sfb] += 1;
            amplify(gi, start, j, ifqstep34);
            if single_band {
                return;
            }
        }
    }

    /// Bisect the bit budget between `min_bits` and `max_bits` for the
    /// cheapest quantization without distorted bands
    pub fn vbr_encode_granule(
        &self,
        gi: &mut GranuleChannelState,
        xmin: &[f32; SFBMAX],
        min_bits: i32,
        max_bits: i32,
        step: &mut StepSearchState,
        pseudohalf: &mut PseudoHalf,
    ) {
        let limit = max_bits;
        let (mut min_bits, mut max_bits) = (min_bits, max_bits);
        let mut this_bits = (max_bits + min_bits) / 2;
        let mut best: Option<GranuleChannelState> = None;

        loop {
            let sfb21_extra = this_bits <= limit - 42 && self.ctx.sfb21_extra();
            let over = self.search(gi, xmin, this_bits, step, pseudohalf, sfb21_extra);

            if over <= 0 {
                max_bits = gi.part2_3_length as i32 - 32;
                best = Some(gi.clone());
            } else {
                min_bits = this_bits + 32;
                if let Some(clean) = &best {
                    *gi = clean.clone();
                }
            }
            let dbits = max_bits - min_bits;
            this_bits = (max_bits + min_bits) / 2;
            if dbits <= 12 {
                break;
            }
        }
        log::trace!("vbr bisection: {} bits, clean result found {}", gi.part2_3_length, best.is_some());
    }

    /// Final scalefactor and region choice of a quantized granule/channel
    pub fn finish_one(&self, gi: &mut GranuleChannelState) {
        best_scalefac_store(gi, self.ctx.is_mpeg1());
        self.estimator.finalize(gi);
    }
}

/// True when every band has been amplified at least once
pub fn loop_break(gi: &GranuleChannelState) -> bool {
    (0..gi.sfbmax).all(|sfb| gi.scalefac[sfb] + gi.subblock_gain[gi.window[sfb]] != 0)
}

fn amplify(gi: &mut GranuleChannelState, start: usize, end: usize, factor: f32) {
    let end = end.min(GRANULE_SIZE);
    for x in &mut gi.xrpow[start.min(end)..end] {
        *x *= factor;
        if *x > gi.xrpow_max {
            gi.xrpow_max = *x;
        }
    }
}

/// Switch to the coarse scalefactor step, rounding odd scalefactors up
pub fn inc_scalefac_scale(gi: &mut GranuleChannelState) {
    let ifqstep34 = IFQSTEP34[0];
    let mut j = 0;
    for sfb in 0..gi.sfbmax {
        let start = j;
        j += gi.width[sfb];
        let mut s = gi.scalefac[sfb];
        if gi.preflag {
            s += pretab(sfb);
        }
        if s & 1 != 0 {
            s += 1;
            amplify(gi, start, j, ifqstep34);
        }
        gi.scalefac[sfb] = s >> 1;
    }
    gi.preflag = false;
    gi.scalefac_scale = 1;
}

/// Move large short-block scalefactors into the subblock gains
///
/// Returns false when a long band or a subblock gain is out of range.
pub fn inc_subblock_gain(gi: &mut GranuleChannelState) -> bool {
    if gi.scalefac[..gi.sfb_lmax].iter().any(|&sf| sf >= 16) {
        return false;
    }

    for window in 0..3 {
        let mut s1 = 0;
        let mut s2 = 0;
        let mut sfb = gi.sfb_lmax + window;
        while sfb < gi.sfbdivide {
            s1 = s1.max(gi.scalefac[sfb]);
            sfb += 3;
        }
        while sfb < gi.sfbmax {
            s2 = s2.max(gi.scalefac[sfb]);
            sfb += 3;
        }
        if s1 < 16 && s2 < 8 {
            continue;
        }
        if gi.subblock_gain[window] >= 7 {
            return false;
        }
        gi.subblock_gain[window] += 1;

        let shift = gi.scalefac_scale + 1;
        let mut j: usize = gi.width[..gi.sfb_lmax].iter().sum();
        let mut sfb = gi.sfb_lmax + window;
        while sfb < gi.sfbmax {
            let width = gi.width[sfb];
            let s = gi.scalefac[sfb] - (4 >> gi.scalefac_scale);
            if s >= 0 {
                gi.scalefac[sfb] = s;
                j += width * 3;
            } else {
                gi.scalefac[sfb] = 0;
                let amp = ipow20(210 + (s << shift));
                j += width * (window + 1);
                amplify(gi, j - width, j, amp);
                j += width * (3 - window - 1);
            }
            sfb += 3;
        }

        // the band above the scalefactor bands has no scalefactor to lower
        if sfb < SFBMAX {
            let width = gi.width[sfb];
            let amp = ipow20(202);
            j += width * (window + 1);
            amplify(gi, j - width, j, amp);
        }
    }
    true
}

/// Smallest storage of the final scalefactors
///
/// Bands quantized to zero drop their scalefactor; all-even scalefactors move
/// to the coarse step. When the result cannot be stored the previous
/// scalefactors are put back.
pub fn best_scalefac_store(gi: &mut GranuleChannelState, mpeg1: bool) {
    let saved = (gi.scalefac, gi.scalefac_scale, gi.preflag);
    let mut j = 0;
    for sfb in 0..gi.sfbmax {
        let start = j;
        j = (j + gi.width[sfb]).min(GRANULE_SIZE);
        if gi.l3_enc[start..j].iter().all(|&v| v == 0) {
            gi.scalefac[sfb] = 0;
        }
    }

    if gi.scalefac_scale == 0 && !gi.preflag {
        let any_odd = gi.scalefac[..gi.sfbmax].iter().any(|&sf| sf & 1 != 0);
        let any_set = gi.scalefac[..gi.sfbmax].iter().any(|&sf| sf != 0);
        if any_set && !any_odd {
            for sf in &mut gi.scalefac[..gi.sfbmax] {
                *sf >>= 1;
            }
            gi.scalefac_scale = 1;
        }
    }
    if !scale_bitcount(gi, mpeg1) {
        log::debug!("scalefactors not storable after compaction, keeping previous set");
        (gi.scalefac, gi.scalefac_scale, gi.preflag) = saved;
        scale_bitcount(gi, mpeg1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::huffman::HuffmanBitCounter;
    use crate::partition::PartitionTables;
    use crate::tables::ScalefactorBands;
    use crate::types::{MaskingRatio, SfbValues, SBPSY_L};
    use proptest::prelude::*;

    fn quantizer(config: &Config) -> GranuleQuantizer {
        let bands = ScalefactorBands::for_index(config.samplerate_index()).unwrap();
        let tables = PartitionTables::new(config.wave.sample_rate, &bands, &config.psy).unwrap();
        let ctx = QuantizeContext::new(config, &tables);
        GranuleQuantizer::new(config, ctx, Box::new(HuffmanBitCounter::new(&bands)))
    }

    fn music(seed: u32) -> [f32; GRANULE_SIZE] {
        let mut xr = [0.0f32; GRANULE_SIZE];
        let mut state = seed.wrapping_mul(2_654_435_761).max(1);
        for (i, x) in xr.iter_mut().enumerate() {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            let noise = (state % 2000) as f32 / 1000.0 - 1.0;
            *x = noise * 8000.0 / (1.0 + i as f32 * 0.02);
        }
        xr
    }

    /// Prepared granule with an allowed noise of `fraction` of each band's energy
    fn prepared(
        q: &GranuleQuantizer,
        xr: &[f32; GRANULE_SIZE],
        block_type: BlockType,
        fraction: f32,
    ) -> Option<(GranuleChannelState, [f32; SFBMAX], PseudoHalf)> {
        let ctx = q.context();
        let mut gi = GranuleChannelState::new(xr, block_type);
        ctx.init_outer_loop(&mut gi);
        let ratio = MaskingRatio {
            en: SfbValues::filled(1.0),
            thm: SfbValues::filled(fraction),
        };
        let mut xmin = [0.0; SFBMAX];
        ctx.calc_xmin(&ratio, &mut gi, 1.0, &mut xmin);
        let mut pseudohalf = [false; SFBMAX];
        if !ctx.init_xrpow(&mut gi, &mut pseudohalf) {
            return None;
        }
        Some((gi, xmin, pseudohalf))
    }

    #[test]
    fn test_outer_loop_stays_within_target() {
        let config = Config::new();
        let q = quantizer(&config);
        let (mut gi, xmin, mut pseudohalf) = prepared(&q, &music(7), BlockType::Normal, 0.001).unwrap();
        let mut step = StepSearchState::default();

        q.outer_loop(&mut gi, &xmin, 1200, &mut step, &mut pseudohalf);
        assert!(gi.part2_3_length as i32 <= 1200);
        assert!((0..=255).contains(&gi.global_gain));
        assert!(scale_bitcount(&mut gi.clone(), true));
    }

    #[test]
    fn test_outer_loop_is_deterministic() {
        let config = Config::new();
        let q = quantizer(&config);
        let run = || {
            let (mut gi, xmin, mut pseudohalf) = prepared(&q, &music(11), BlockType::Normal, 0.001).unwrap();
            let mut step = StepSearchState::default();
            let over = q.outer_loop(&mut gi, &xmin, 900, &mut step, &mut pseudohalf);
            (over, gi.global_gain, gi.part2_3_length, gi.scalefac, gi.l3_enc.to_vec())
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_noise_shaping_off_only_searches_step() {
        let mut config = Config::new();
        config.quant.noise_shaping = 0;
        let q = quantizer(&config);
        let (mut gi, xmin, mut pseudohalf) = prepared(&q, &music(3), BlockType::Normal, 0.001).unwrap();
        let mut step = StepSearchState::default();
        assert_eq!(q.outer_loop(&mut gi, &xmin, 1000, &mut step, &mut pseudohalf), 100);
        assert!(gi.scalefac.iter().all(|&sf| sf == 0));
    }

    #[test]
    fn test_generous_budget_removes_distortion() {
        let config = Config::new();
        let q = quantizer(&config);
        let (mut gi, xmin, mut pseudohalf) = prepared(&q, &music(5), BlockType::Normal, 0.05).unwrap();
        let mut step = StepSearchState::default();
        let over = q.outer_loop(&mut gi, &xmin, 4000, &mut step, &mut pseudohalf);
        assert_eq!(over, 0);
    }

    #[test]
    fn test_short_blocks_with_subblock_gain() {
        let mut config = Config::new();
        config.quant.noise_shaping = 2;
        let q = quantizer(&config);
        let (mut gi, xmin, mut pseudohalf) = prepared(&q, &music(9), BlockType::Short, 0.0005).unwrap();
        let mut step = StepSearchState::default();
        q.outer_loop(&mut gi, &xmin, 700, &mut step, &mut pseudohalf);
        assert!(gi.part2_3_length as i32 <= 700);
        assert!(gi.subblock_gain.iter().all(|&g| (0..=7).contains(&g)));
    }

    #[test]
    fn test_zero_energy_granule_is_not_searched() {
        let config = Config::new();
        let q = quantizer(&config);
        assert!(prepared(&q, &[0.0; GRANULE_SIZE], BlockType::Normal, 0.01).is_none());
    }

    #[test]
    fn test_loop_break_needs_every_band_amplified() {
        let mut gi = GranuleChannelState::default();
        gi.sfbmax = SBPSY_L;
        assert!(!loop_break(&gi));
        gi.scalefac[..SBPSY_L].fill(1);
        assert!(loop_break(&gi));
        gi.scalefac[4] = 0;
        assert!(!loop_break(&gi));
    }

    #[test]
    fn test_scalefac_scale_halves_and_rounds_up() {
        let mut gi = GranuleChannelState::default();
        gi.sfbmax = SBPSY_L;
        gi.width[..SBPSY_L].fill(4);
        gi.xrpow[..84].fill(1.0);
        gi.xrpow_max = 1.0;
        gi.scalefac[0] = 3;
        gi.scalefac[1] = 4;
        inc_scalefac_scale(&mut gi);
        assert_eq!(gi.scalefac_scale, 1);
        assert_eq!(gi.scalefac[0], 2);
        assert_eq!(gi.scalefac[1], 2);
        assert!(gi.xrpow[0] > 1.0);
        assert_eq!(gi.xrpow[4], 1.0);
        assert!(gi.xrpow_max > 1.0);
    }

    #[test]
    fn test_subblock_gain_absorbs_large_short_scalefactors() {
        let config = Config::new();
        let q = quantizer(&config);
        let mut gi = GranuleChannelState::new(&music(1), BlockType::Short);
        q.context().init_outer_loop(&mut gi);
        gi.scalefac[0] = 17;
        assert!(inc_subblock_gain(&mut gi));
        assert_eq!(gi.subblock_gain[0], 1);
        assert_eq!(gi.subblock_gain[1], 0);
        assert_eq!(gi.scalefac[0], 13);

        gi.subblock_gain[0] = 7;
        gi.scalefac[0] = 20;
        assert!(!inc_subblock_gain(&mut gi));
    }

    #[test]
    fn test_zero_bands_drop_their_scalefactors() {
        let mut gi = GranuleChannelState::default();
        gi.sfbmax = SBPSY_L;
        gi.width[..SBPSY_L].fill(4);
        gi.scalefac[0] = 2;
        gi.scalefac[1] = 4;
        gi.l3_enc[0] = 1;
        gi.l3_enc[4] = 0;
        best_scalefac_store(&mut gi, true);
        assert_eq!(gi.scalefac[1], 0);
        assert_eq!(gi.scalefac[0], 1);
        assert_eq!(gi.scalefac_scale, 1);
    }

    #[test]
    fn test_unstorable_scalefactors_are_restored() {
        let mut gi = GranuleChannelState::default();
        gi.sfbmax = SBPSY_L;
        gi.width[..SBPSY_L].fill(4);
        gi.scalefac[0] = 40;
        gi.scalefac[1] = 2;
        gi.l3_enc[0] = 1;
        gi.l3_enc[4] = 1;
        best_scalefac_store(&mut gi, true);
        assert_eq!(gi.scalefac[0], 40);
        assert_eq!(gi.scalefac[1], 2);
        assert_eq!(gi.scalefac_scale, 0);
        assert!(!gi.preflag);
        assert_eq!(gi.part2_length, crate::types::LARGE_BITS);
    }

    #[test]
    fn test_start_and_stop_blocks_use_long_heuristic() {
        let mut config = Config::new();
        config.quant.comparison = 1;
        config.quant.comparison_short = 4;
        let q = quantizer(&config);
        assert_eq!(q.comparison_for(BlockType::Normal).id(), 1);
        assert_eq!(q.comparison_for(BlockType::Start).id(), 1);
        assert_eq!(q.comparison_for(BlockType::Stop).id(), 1);
        assert_eq!(q.comparison_for(BlockType::Short).id(), 4);
    }

    #[test]
    fn test_kept_granule_carries_its_own_cost() {
        let config = Config::new();
        let q = quantizer(&config);
        let (mut gi, xmin, mut pseudohalf) = prepared(&q, &music(13), BlockType::Start, 0.002).unwrap();
        let mut step = StepSearchState::default();
        let over = q.outer_loop(&mut gi, &xmin, 1500, &mut step, &mut pseudohalf);

        let mut recount = gi.clone();
        assert_eq!(q.context().count_bits(q.estimator(), &mut recount, &pseudohalf), gi.part2_3_length);
        assert_eq!(recount.l3_enc, gi.l3_enc);
        let mut distort = [0.0; SFBMAX];
        assert_eq!(q.context().calc_noise(&gi, &xmin, &mut distort).over_count, over);
    }

    #[test]
    fn test_vbr_bisection_finds_clean_result() {
        let config = Config::vbr(4, crate::config::VbrSolver::OuterLoop);
        let q = quantizer(&config);
        let (mut gi, xmin, mut pseudohalf) = prepared(&q, &music(21), BlockType::Normal, 0.05).unwrap();
        let mut step = StepSearchState::default();
        q.vbr_encode_granule(&mut gi, &xmin, 126, 4000, &mut step, &mut pseudohalf);
        assert!(gi.part2_3_length as i32 <= 4000);

        let mut distort = [0.0; SFBMAX];
        let noise = q.context().calc_noise(&gi, &xmin, &mut distort);
        assert_eq!(noise.over_count, 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 100,
            failure_persistence: None,
            .. ProptestConfig::default()
        })]

        #[test]
        fn test_outer_loop_respects_any_target(
            seed in 1u32..10_000,
            targ_bits in 200i32..4095,
            comparison in 0u8..=9,
            amp in prop::sample::select(vec![
                NoiseShapingAmp::Iso,
                NoiseShapingAmp::HalfOfWorst,
                NoiseShapingAmp::SingleBand,
                NoiseShapingAmp::TwoPassRefine,
            ]),
        ) {
            let mut config = Config::new();
            config.quant.comparison = comparison;
            config.quant.noise_shaping_amp = amp;
            let q = quantizer(&config);
            let (mut gi, xmin, mut pseudohalf) = prepared(&q, &music(seed), BlockType::Normal, 0.001).unwrap();
            let mut step = StepSearchState::default();
            q.outer_loop(&mut gi, &xmin, targ_bits, &mut step, &mut pseudohalf);
            prop_assert!(gi.part2_3_length as i32 <= targ_bits.max(gi.part2_length as i32 + 1));
        }
    }
}
