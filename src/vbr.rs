//! Direct scalefactor solver for variable bitrate
//!
//! Rather than amplifying distorted bands one step at a time, the solver
//! computes for every band the coarsest step whose noise stays under the
//! allowed noise, then fits global gain, scalefactor scale, pre-emphasis and
//! subblock gains around those steps. When the result does not fit the bit
//! ceiling, the per-band steps are blended towards the coarsest one (the
//! colour search) and, failing that, shifted by a common offset.

use crate::config::Config;
use crate::error::{QuantizationError, QuantizationResult};
use crate::huffman::BitCostEstimator;
use crate::quantize::{adj43, ipow20, pow20, pow43, pretab, scale_bitcount};
use crate::tables::{MAX_RANGE_LONG, MAX_RANGE_LONG_LSF_PRETAB, MAX_RANGE_SHORT};
use crate::types::{BlockType, GranuleChannelState, GRANULE_SIZE, IXMAX_VAL, LARGE_BITS, SFBMAX};

/// Rounding offset of the ISO quantizer
const ROUNDFAC: f32 = 0.4054;

/// Which search produced the final scalefactors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverStage {
    /// The per-band solution fit as computed
    Direct,
    /// Blended towards the coarsest band step by the given fraction of `range`
    Colour { blend: i32, range: i32 },
    /// Every band step shifted by a common offset
    GlobalStep { offset: i32 },
}

/// Result of one direct solve
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VbrSolution {
    /// Smallest step per band that keeps every quantized value in range
    pub step_floor: [i32; SFBMAX],
    /// Step per band that keeps its noise under the allowed noise
    pub step_target: [i32; SFBMAX],
    pub stage: SolverStage,
}

/// Direct per-band scalefactor solver
#[derive(Debug, Clone)]
pub struct VbrScalefactorSolver {
    mpeg1: bool,
    iso_quantization: bool,
    /// The coarse scalefactor step may be chosen
    allow_scale: bool,
}

impl VbrScalefactorSolver {
    pub fn new(config: &Config) -> Self {
        Self {
            mpeg1: config.is_mpeg1(),
            iso_quantization: config.quant.iso_quantization,
            allow_scale: config.quant.noise_shaping == 2,
        }
    }

    /// Quantize `gi` so its noise stays under `xmin` within `max_bits`
    ///
    /// `gi.xrpow` must hold the unamplified |xr|^(3/4). When the granule
    /// needs fewer than `min_bits`, the steps are refined towards that floor.
    pub fn solve(
        &self,
        estimator: &dyn BitCostEstimator,
        gi: &mut GranuleChannelState,
        xmin: &[f32; SFBMAX],
        min_bits: i32,
        max_bits: i32,
        granule: usize,
        channel: usize,
    ) -> QuantizationResult<VbrSolution> {
        let mut pass = SolverPass {
            solver: self,
            estimator,
            xr34: gi.xrpow,
            mingain_l: 0,
            mingain_s: [0; 3],
        };
        gi.l3_enc = [0; GRANULE_SIZE];

        let mut step_target = [0i32; SFBMAX];
        let mut step_floor = [0i32; SFBMAX];
        let vbrmax = pass.block_sf(gi, xmin, &mut step_target, &mut step_floor);

        let mut sfwork = step_target;
        if !pass.alloc(gi, &sfwork, &step_floor, vbrmax) || !scale_bitcount(gi, self.mpeg1) {
            gi.part2_3_length = LARGE_BITS;
            log::warn!("granule {} channel {}: no storable scalefactors", granule, channel);
            return Err(QuantizationError::Unrepresentable { granule, channel });
        }
        pass.quantize_and_count_bits(gi);

        let mut stage = SolverStage::Direct;
        if pass.over(gi, max_bits) {
            stage = pass.search_colour_max(gi, &mut sfwork, &step_target, &step_floor, max_bits);
        }
        if pass.over(gi, max_bits) {
            stage = pass.search_global_max(gi, &sfwork, &step_floor, max_bits);
        } else if min_bits > 0 && pass.total(gi) < min_bits {
            stage = pass.search_colour_min(gi, &mut sfwork, &step_target, &step_floor, min_bits);
            if pass.total(gi) < min_bits {
                stage = pass.search_global_min(gi, &sfwork, &step_floor, min_bits);
            }
            if pass.over(gi, max_bits) {
                stage = pass.search_global_max(gi, &sfwork, &step_floor, max_bits);
            }
        }

        let total = pass.total(gi);
        if total >= LARGE_BITS as i32 {
            gi.part2_3_length = LARGE_BITS;
            log::warn!("granule {} channel {}: direct solve exhausted the budget", granule, channel);
            return Err(QuantizationError::BudgetExhausted {
                bits: total as u32,
                ceiling: max_bits.max(0) as u32,
            });
        }
        log::trace!(
            "direct solve: gain {}, {} + {} bits of {}, {:?}",
            gi.global_gain,
            gi.part2_3_length,
            gi.part2_length,
            max_bits,
            stage
        );
        Ok(VbrSolution {
            step_floor,
            step_target,
            stage,
        })
    }
}

/// Quantizer step actually applied to band `sfb`
pub fn effective_step(gi: &GranuleChannelState, sfb: usize) -> i32 {
    gi.global_gain - scalefactor_offset(gi, sfb)
}

fn scalefactor_offset(gi: &GranuleChannelState, sfb: usize) -> i32 {
    let pre = if gi.preflag { pretab(sfb) } else { 0 };
    ((gi.scalefac[sfb] + pre) << (gi.scalefac_scale + 1)) + gi.subblock_gain[gi.window[sfb]] * 8
}

#[inline]
fn valid_sf(sf: i32) -> i32 {
    sf.clamp(0, 255)
}

/// Coarsest of the steps that keep `max_xr34` within the escape range
fn find_lowest_scalefac(max_xr34: f32) -> i32 {
    let (mut sf, mut sf_ok, mut delsf) = (128, 10_000, 128);
    for _ in 0..8 {
        delsf >>= 1;
        if ipow20(sf) * max_xr34 <= IXMAX_VAL as f32 {
            sf_ok = sf;
            sf -= delsf;
        } else {
            sf += delsf;
        }
    }
    if sf_ok < 255 {
        sf_ok
    } else {
        sf
    }
}

struct SolverPass<'a> {
    solver: &'a VbrScalefactorSolver,
    estimator: &'a dyn BitCostEstimator,
    xr34: [f32; GRANULE_SIZE],
    mingain_l: i32,
    mingain_s: [i32; 3],
}

impl SolverPass<'_> {
    #[inline]
    fn quantize_line(&self, x: f32) -> i32 {
        if self.solver.iso_quantization {
            (x + ROUNDFAC) as i32
        } else {
            (x + adj43(x)) as i32
        }
    }

    fn band_noise(&self, xr: &[f32], xr34: &[f32], sf: i32) -> f32 {
        let sf = valid_sf(sf);
        let sfpow = pow20(sf);
        let sfpow34 = ipow20(sf);
        xr.iter()
            .zip(xr34)
            .map(|(&x, &x34)| {
                let diff = x.abs() - sfpow * pow43(self.quantize_line(sfpow34 * x34));
                diff * diff
            })
            .sum()
    }

    /// Coarsest step of one band whose noise stays under `xmin`, by bisection
    fn find_scalefac(&self, xr: &[f32], xr34: &[f32], xmin: f32, sf_min: i32) -> i32 {
        let (mut sf, mut sf_ok, mut delsf) = (128, 10_000, 128);
        for _ in 0..8 {
            delsf >>= 1;
            if sf <= sf_min {
                sf += delsf;
                continue;
            }
            let noisy = (sf < 255 && self.band_noise(xr, xr34, sf + 1) > xmin)
                || self.band_noise(xr, xr34, sf) > xmin
                || self.band_noise(xr, xr34, sf - 1) > xmin;
            if noisy {
                sf -= delsf;
            } else {
                sf_ok = sf;
                sf += delsf;
            }
        }
        if sf_ok <= 255 {
            sf_ok
        } else {
            sf
        }
    }

    /// Per-band target and floor steps; returns the largest target
    fn block_sf(
        &mut self,
        gi: &GranuleChannelState,
        xmin: &[f32; SFBMAX],
        vbrsf: &mut [i32; SFBMAX],
        vbrsfmin: &mut [i32; SFBMAX],
    ) -> i32 {
        self.mingain_l = 0;
        self.mingain_s = [0; 3];
        let max_nonzero = gi.max_nonzero_coeff;
        let mut maxsf = 0;
        let mut window = 0;
        let (mut sfb, mut j) = (0, 0);

        while j <= max_nonzero && sfb < SFBMAX {
            let width = gi.width[sfb];
            if width == 0 {
                break;
            }
            let lines = width.min(max_nonzero + 1 - j).min(GRANULE_SIZE - j);
            let band34 = &self.xr34[j..j + lines];
            let max_xr34 = band34.iter().copied().fold(0.0f32, f32::max);

            let m1 = find_lowest_scalefac(max_xr34);
            vbrsfmin[sfb] = m1;
            self.mingain_l = self.mingain_l.max(m1);
            self.mingain_s[window] = self.mingain_s[window].max(m1);
            window = (window + 1) % 3;

            let m2 = if sfb < gi.psymax {
                let m2 = self.find_scalefac(&gi.xr[j..j + lines], band34, xmin[sfb], m1);
                maxsf = maxsf.max(m2);
                m2
            } else {
                maxsf = maxsf.max(m1);
                maxsf
            };
            vbrsf[sfb] = m2;
            sfb += 1;
            j += width;
        }
        for rest in sfb..SFBMAX {
            vbrsf[rest] = maxsf;
            vbrsfmin[rest] = 0;
        }
        maxsf
    }

    fn quantize(&self, gi: &mut GranuleChannelState) {
        let max_nonzero = gi.max_nonzero_coeff;
        let (mut sfb, mut j) = (0, 0);
        while j <= max_nonzero && sfb < SFBMAX {
            let width = gi.width[sfb];
            if width == 0 {
                break;
            }
            let step = ipow20(valid_sf(gi.global_gain - scalefactor_offset(gi, sfb)));
            let lines = width.min(max_nonzero + 1 - j).min(GRANULE_SIZE - j);
            for k in j..j + lines {
                gi.l3_enc[k] = self.quantize_line(step * self.xr34[k]);
            }
            j += width;
            sfb += 1;
        }
    }

    fn quantize_and_count_bits(&self, gi: &mut GranuleChannelState) -> u32 {
        self.quantize(gi);
        gi.part2_3_length = self.estimator.count_bits(gi);
        gi.part2_3_length
    }

    fn total(&self, gi: &GranuleChannelState) -> i32 {
        (gi.part2_3_length + gi.part2_length) as i32
    }

    fn over(&self, gi: &GranuleChannelState, max_bits: i32) -> bool {
        gi.part2_3_length as i32 > max_bits - gi.part2_length as i32
    }

    /// Fit gain and side parameters around absolute band steps `sf`
    fn alloc(&self, gi: &mut GranuleChannelState, sf: &[i32; SFBMAX], vbrsfmin: &[i32; SFBMAX], vbrmax: i32) -> bool {
        let mut work = *sf;
        if gi.block_type == BlockType::Short {
            self.short_block_constrain(gi, &mut work, vbrsfmin, vbrmax)
        } else {
            self.long_block_constrain(gi, &mut work, vbrsfmin, vbrmax)
        }
    }

    fn short_block_constrain(
        &self,
        gi: &mut GranuleChannelState,
        vbrsf: &mut [i32; SFBMAX],
        vbrsfmin: &[i32; SFBMAX],
        mut vbrmax: i32,
    ) -> bool {
        let (mut maxover0, mut maxover1, mut delta) = (0, 0, 0);
        for sfb in 0..gi.psymax.min(SFBMAX) {
            let v = vbrmax - vbrsf[sfb];
            delta = delta.max(v);
            maxover0 = maxover0.max(v - (4 * 14 + 2 * MAX_RANGE_SHORT[sfb]));
            maxover1 = maxover1.max(v - (4 * 14 + 4 * MAX_RANGE_SHORT[sfb]));
        }
        let mover = if self.solver.allow_scale {
            maxover0.min(maxover1)
        } else {
            maxover0
        };
        delta = delta.min(mover);
        vbrmax -= delta;
        maxover0 -= mover;
        maxover1 -= mover;

        if maxover0 == 0 {
            gi.scalefac_scale = 0;
        } else if maxover1 == 0 {
            gi.scalefac_scale = 1;
        }
        vbrmax = vbrmax.max(self.mingain_l);
        gi.global_gain = vbrmax.clamp(0, 255);

        for v in vbrsf.iter_mut() {
            *v -= vbrmax;
        }
        self.set_subblock_gain(gi, vbrsf);
        set_scalefacs(gi, vbrsfmin, vbrsf, &MAX_RANGE_SHORT);
        check_scalefactor(gi, vbrsfmin)
    }

    fn long_block_constrain(
        &self,
        gi: &mut GranuleChannelState,
        vbrsf: &mut [i32; SFBMAX],
        vbrsfmin: &[i32; SFBMAX],
        mut vbrmax: i32,
    ) -> bool {
        let max_range_pre: &[i32] = if self.solver.mpeg1 {
            &MAX_RANGE_LONG
        } else {
            &MAX_RANGE_LONG_LSF_PRETAB
        };
        let psymax = gi.psymax.min(MAX_RANGE_LONG.len());
        let maxminsfb = self.mingain_l;

        let (mut maxover0, mut maxover1, mut maxover0p, mut maxover1p, mut delta) = (0, 0, 0, 0, 0);
        for sfb in 0..psymax {
            let v = vbrmax - vbrsf[sfb];
            delta = delta.max(v);
            maxover0 = maxover0.max(v - 2 * MAX_RANGE_LONG[sfb]);
            maxover1 = maxover1.max(v - 4 * MAX_RANGE_LONG[sfb]);
            maxover0p = maxover0p.max(v - 2 * (max_range_pre[sfb] + pretab(sfb)));
            maxover1p = maxover1p.max(v - 4 * (max_range_pre[sfb] + pretab(sfb)));
        }

        // pre-emphasis is only an option while every band keeps room for it
        let pre_fits = |maxover: i32, shift: i32| {
            let gain = (vbrmax - maxover).max(maxminsfb);
            (0..psymax).all(|sfb| gain - vbrsfmin[sfb] - shift * pretab(sfb) > 0)
        };
        let vm0p = pre_fits(maxover0p, 2);
        let vm1p = vm0p && pre_fits(maxover1p, 4);
        if !vm0p {
            maxover0p = maxover0;
        }
        if !vm1p {
            maxover1p = maxover1;
        }
        if !self.solver.allow_scale {
            maxover1 = maxover0;
            maxover1p = maxover0p;
        }

        let mover = maxover0.min(maxover0p).min(maxover1).min(maxover1p);
        delta = delta.min(mover);
        vbrmax = (vbrmax - delta).max(maxminsfb);
        maxover0 -= mover;
        maxover0p -= mover;
        maxover1 -= mover;
        maxover1p -= mover;

        let max_range: &[i32] = if maxover0 == 0 {
            gi.scalefac_scale = 0;
            gi.preflag = false;
            &MAX_RANGE_LONG
        } else if maxover0p == 0 {
            gi.scalefac_scale = 0;
            gi.preflag = true;
            max_range_pre
        } else if maxover1 == 0 {
            gi.scalefac_scale = 1;
            gi.preflag = false;
            &MAX_RANGE_LONG
        } else if maxover1p == 0 {
            gi.scalefac_scale = 1;
            gi.preflag = true;
            max_range_pre
        } else {
            return false;
        };

        gi.global_gain = vbrmax.clamp(0, 255);
        for v in vbrsf.iter_mut() {
            *v -= vbrmax;
        }
        set_scalefacs(gi, vbrsfmin, vbrsf, max_range);
        check_scalefactor(gi, vbrsfmin)
    }

    /// Smallest subblock gains that bring every window's scalefactors in range
    fn set_subblock_gain(&self, gi: &mut GranuleChannelState, sf: &mut [i32; SFBMAX]) {
        const MAXRANGE1: i32 = 15;
        const MAXRANGE2: i32 = 7;
        let shift = if gi.scalefac_scale == 0 { 1 } else { 2 };
        let psydiv = gi.psymax.min(18);

        for window in 0..3 {
            let (mut maxsf1, mut maxsf2, mut minsf) = (0, 0, 1000);
            let mut sfb = window;
            while sfb < psydiv {
                let v = -sf[sfb];
                maxsf1 = maxsf1.max(v);
                minsf = minsf.min(v);
                sfb += 3;
            }
            while sfb < SFBMAX {
                let v = -sf[sfb];
                maxsf2 = maxsf2.max(v);
                minsf = minsf.min(v);
                sfb += 3;
            }

            let needed = (maxsf1 - (MAXRANGE1 << shift)).max(maxsf2 - (MAXRANGE2 << shift));
            let mut sbg = if minsf > 0 { minsf >> 3 } else { 0 };
            if needed > 0 {
                sbg = sbg.max((needed + 7) >> 3);
            }
            if sbg > 0 && self.mingain_s[window] > gi.global_gain - sbg * 8 {
                sbg = (gi.global_gain - self.mingain_s[window]) >> 3;
            }
            gi.subblock_gain[window] = sbg.clamp(0, 7);
        }

        for (sfb, v) in sf.iter_mut().enumerate() {
            *v += gi.subblock_gain[sfb % 3] << 3;
        }
    }

    fn try_steps(&self, gi: &mut GranuleChannelState, steps: &[i32; SFBMAX], vbrsfmin: &[i32; SFBMAX]) -> u32 {
        let vbrmax = steps.iter().copied().fold(0, i32::max);
        if !self.alloc(gi, steps, vbrsfmin, vbrmax) {
            gi.part2_3_length = LARGE_BITS;
            return LARGE_BITS;
        }
        self.count_storable(gi)
    }

    /// Bits of the quantized granule, or `LARGE_BITS` when its scalefactors
    /// cannot be stored
    fn count_storable(&self, gi: &mut GranuleChannelState) -> u32 {
        if !scale_bitcount(gi, self.solver.mpeg1) {
            gi.part2_3_length = LARGE_BITS;
            return LARGE_BITS;
        }
        self.quantize_and_count_bits(gi)
    }

    /// Band steps blended from `sfcalc` towards `target` by `i / m`
    fn try_colour(
        &self,
        gi: &mut GranuleChannelState,
        sfwork: &mut [i32; SFBMAX],
        sfcalc: &[i32; SFBMAX],
        vbrsfmin: &[i32; SFBMAX],
        i: i32,
        m: i32,
        target: i32,
    ) -> u32 {
        for sfb in 0..SFBMAX {
            let gain = target + (sfcalc[sfb] - target) * i / m;
            sfwork[sfb] = gain.max(vbrsfmin[sfb]).min(255);
        }
        self.try_steps(gi, sfwork, vbrsfmin)
    }

    fn step_range(&self, gi: &GranuleChannelState, sfcalc: &[i32; SFBMAX]) -> (i32, i32) {
        let bands = &sfcalc[..gi.psymax.min(SFBMAX)];
        let min = bands.iter().copied().fold(255, i32::min);
        let max = bands.iter().copied().fold(0, i32::max);
        (min, max)
    }

    /// Largest blend of the steps towards the coarsest band that still fits `bits`
    fn search_colour_max(
        &self,
        gi: &mut GranuleChannelState,
        sfwork: &mut [i32; SFBMAX],
        sfcalc: &[i32; SFBMAX],
        vbrsfmin: &[i32; SFBMAX],
        bits: i32,
    ) -> SolverStage {
        let (vbrmin, vbrmax) = self.step_range(gi, sfcalc);
        let m = vbrmax - vbrmin;
        if m <= 0 {
            return SolverStage::Direct;
        }
        let target = vbrmax;
        let (mut l, mut r) = (0, m);
        let mut ok = -1;
        let mut last = m / 2;
        while l <= r {
            let i = (l + r) / 2;
            let nbits = self.try_colour(gi, sfwork, sfcalc, vbrsfmin, i, m, target);
            if (nbits as i32) < bits {
                ok = i;
                l = i + 1;
            } else {
                r = i - 1;
            }
            last = i;
        }
        let ok = ok.max(0);
        if last != ok {
            self.try_colour(gi, sfwork, sfcalc, vbrsfmin, ok, m, target);
        }
        SolverStage::Colour { blend: ok, range: m }
    }

    /// Smallest blend of the steps towards the finest band that reaches `bits`
    fn search_colour_min(
        &self,
        gi: &mut GranuleChannelState,
        sfwork: &mut [i32; SFBMAX],
        sfcalc: &[i32; SFBMAX],
        vbrsfmin: &[i32; SFBMAX],
        bits: i32,
    ) -> SolverStage {
        let (vbrmin, vbrmax) = self.step_range(gi, sfcalc);
        let m = vbrmax - vbrmin;
        if m <= 0 {
            return SolverStage::Direct;
        }
        let target = vbrmin;
        let (mut l, mut r) = (0, m);
        let mut ok = -1;
        let mut last = m / 2;
        while l <= r {
            let i = (l + r) / 2;
            let nbits = self.try_colour(gi, sfwork, sfcalc, vbrsfmin, i, m, target);
            if nbits < LARGE_BITS && nbits as i32 + gi.part2_length as i32 >= bits {
                ok = i;
                l = i + 1;
            } else {
                r = i - 1;
            }
            last = i;
        }
        let ok = ok.max(0);
        if last != ok {
            self.try_colour(gi, sfwork, sfcalc, vbrsfmin, ok, m, target);
        }
        SolverStage::Colour { blend: ok, range: m }
    }

    fn try_offset(&self, gi: &mut GranuleChannelState, sfwork: &[i32; SFBMAX], vbrsfmin: &[i32; SFBMAX], delta: i32) -> u32 {
        let mut steps = [0i32; SFBMAX];
        for sfb in 0..SFBMAX {
            steps[sfb] = (sfwork[sfb] + delta).max(vbrsfmin[sfb]).min(255);
        }
        self.try_steps(gi, &steps, vbrsfmin)
    }

    /// Finest common step offset that fits `target`
    fn search_global_max(
        &self,
        gi: &mut GranuleChannelState,
        sfwork: &[i32; SFBMAX],
        vbrsfmin: &[i32; SFBMAX],
        target: i32,
    ) -> SolverStage {
        let gain = gi.global_gain;
        let mut curr = gain;
        let mut gain_ok = None;
        let (mut l, mut r) = (gain, 512);
        while l <= r {
            curr = (l + r) >> 1;
            let nbits = self.try_offset(gi, sfwork, vbrsfmin, curr - gain);
            if gi.part2_length >= LARGE_BITS || nbits >= LARGE_BITS {
                l = curr + 1;
                continue;
            }
            if (nbits + gi.part2_length) < target.max(0) as u32 {
                r = curr - 1;
                gain_ok = Some(curr);
            } else {
                l = curr + 1;
                gain_ok.get_or_insert(curr);
            }
        }
        let chosen = gain_ok.unwrap_or(curr);
        if chosen != curr {
            self.try_offset(gi, sfwork, vbrsfmin, chosen - gain);
        }
        SolverStage::GlobalStep { offset: chosen - gain }
    }

    /// Coarsest common step offset that still reaches `target`
    fn search_global_min(
        &self,
        gi: &mut GranuleChannelState,
        sfwork: &[i32; SFBMAX],
        vbrsfmin: &[i32; SFBMAX],
        target: i32,
    ) -> SolverStage {
        let gain = gi.global_gain;
        let mut curr = gain;
        let mut gain_ok = None;
        let (mut l, mut r) = (0, gain);
        while l <= r {
            curr = (l + r) >> 1;
            let nbits = self.try_offset(gi, sfwork, vbrsfmin, curr - gain);
            if gi.part2_length >= LARGE_BITS || nbits >= LARGE_BITS {
                l = curr + 1;
                continue;
            }
            if (nbits + gi.part2_length) as i32 >= target {
                gain_ok = Some(curr);
                l = curr + 1;
            } else {
                r = curr - 1;
            }
        }
        let chosen = gain_ok.unwrap_or(gain);
        if chosen != curr {
            self.try_offset(gi, sfwork, vbrsfmin, chosen - gain);
        }
        SolverStage::GlobalStep { offset: chosen - gain }
    }
}

/// Scalefactors from relative band steps `sf` (negative means finer than the gain)
fn set_scalefacs(gi: &mut GranuleChannelState, vbrsfmin: &[i32; SFBMAX], sf: &mut [i32; SFBMAX], max_range: &[i32]) {
    let shift = if gi.scalefac_scale == 0 { 1 } else { 2 };
    let ifqstep = 1 << shift;
    let sfbmax = gi.sfbmax.min(max_range.len());

    if gi.preflag {
        for sfb in 11..sfbmax {
            sf[sfb] += pretab(sfb) << shift;
        }
    }
    for sfb in 0..sfbmax {
        let pre = if gi.preflag { pretab(sfb) } else { 0 };
        let gain = gi.global_gain - (gi.subblock_gain[gi.window[sfb]] << 3) - (pre << shift);
        gi.scalefac[sfb] = if sf[sfb] < 0 {
            let m = gain - vbrsfmin[sfb];
            // round up so the band is at least as fine as requested
            let mut s = ((ifqstep - 1 - sf[sfb]) >> shift).min(max_range[sfb]);
            if s > 0 && (s << shift) > m {
                s = (m >> shift).max(0);
            }
            s
        } else {
            0
        };
    }
    for s in &mut gi.scalefac[sfbmax..] {
        *s = 0;
    }
}

/// Every band's step keeps its quantized values in range
fn check_scalefactor(gi: &GranuleChannelState, vbrsfmin: &[i32; SFBMAX]) -> bool {
    (0..gi.psymax.min(SFBMAX)).all(|sfb| effective_step(gi, sfb) >= vbrsfmin[sfb])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VbrSolver;
    use crate::huffman::HuffmanBitCounter;
    use crate::partition::PartitionTables;
    use crate::quantize::{PseudoHalf, QuantizeContext};
    use crate::tables::ScalefactorBands;
    use crate::types::{MaskingRatio, SfbValues};
    use proptest::prelude::*;

    struct Fixture {
        ctx: QuantizeContext,
        huffman: HuffmanBitCounter,
        solver: VbrScalefactorSolver,
    }

    fn fixture() -> Fixture {
        let config = Config::vbr(2, VbrSolver::Direct);
        let bands = ScalefactorBands::for_index(config.samplerate_index()).unwrap();
        let tables = PartitionTables::new(config.wave.sample_rate, &bands, &config.psy).unwrap();
        Fixture {
            ctx: QuantizeContext::new(&config, &tables),
            huffman: HuffmanBitCounter::new(&bands),
            solver: VbrScalefactorSolver::new(&config),
        }
    }

    fn spectrum(seed: u32, level: f32) -> [f32; GRANULE_SIZE] {
        let mut xr = [0.0f32; GRANULE_SIZE];
        let mut state = seed.wrapping_mul(747_796_405).max(1);
        for (i, x) in xr.iter_mut().enumerate() {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            *x = ((state % 2000) as f32 / 1000.0 - 1.0) * level / (1.0 + i as f32 * 0.01);
        }
        xr
    }

    fn prepared(f: &Fixture, xr: &[f32; GRANULE_SIZE], block_type: BlockType, fraction: f32) -> (GranuleChannelState, [f32; SFBMAX]) {
        let mut gi = GranuleChannelState::new(xr, block_type);
        f.ctx.init_outer_loop(&mut gi);
        let ratio = MaskingRatio {
            en: SfbValues::filled(1.0),
            thm: SfbValues::filled(fraction),
        };
        let mut xmin = [0.0; SFBMAX];
        f.ctx.calc_xmin(&ratio, &mut gi, 1.0, &mut xmin);
        let mut pseudohalf: PseudoHalf = [false; SFBMAX];
        f.ctx.init_xrpow(&mut gi, &mut pseudohalf);
        (gi, xmin)
    }

    #[test]
    fn test_lowest_scalefac_keeps_values_in_range() {
        for max in [0.0f32, 1.0, 100.0, 5000.0, 1e5] {
            let sf = find_lowest_scalefac(max);
            assert!((0..=255).contains(&sf));
            if sf < 255 {
                assert!(ipow20(sf) * max <= IXMAX_VAL as f32);
            }
        }
        assert!(find_lowest_scalefac(1e5) > find_lowest_scalefac(1.0));
    }

    #[test]
    fn test_generous_ceiling_keeps_direct_solution() {
        let f = fixture();
        let (mut gi, xmin) = prepared(&f, &spectrum(3, 2000.0), BlockType::Normal, 0.05);
        let solution = f.solver.solve(&f.huffman, &mut gi, &xmin, 0, 4095, 0, 0).unwrap();
        assert_eq!(solution.stage, SolverStage::Direct);
        assert!(gi.part2_3_length + gi.part2_length <= 4095);

        let mut distort = [0.0; SFBMAX];
        let noise = f.ctx.calc_noise(&gi, &xmin, &mut distort);
        assert!(noise.over_count <= 1, "{} bands distorted", noise.over_count);
    }

    #[test]
    fn test_colour_search_meets_tight_ceiling() {
        let f = fixture();
        let (mut gi, xmin) = prepared(&f, &spectrum(9, 20000.0), BlockType::Normal, 0.0005);
        let ceiling = 600;
        let solution = f.solver.solve(&f.huffman, &mut gi, &xmin, 0, ceiling, 0, 0).unwrap();
        assert_ne!(solution.stage, SolverStage::Direct);
        assert!((gi.part2_3_length + gi.part2_length) as i32 <= ceiling);
        for sfb in 0..gi.psymax {
            assert!(effective_step(&gi, sfb) >= solution.step_floor[sfb], "band {} overflows", sfb);
        }
    }

    #[test]
    fn test_short_block_solution_is_storable() {
        let f = fixture();
        let (mut gi, xmin) = prepared(&f, &spectrum(17, 8000.0), BlockType::Short, 0.01);
        let solution = f.solver.solve(&f.huffman, &mut gi, &xmin, 0, 2500, 1, 1).unwrap();
        assert!(gi.subblock_gain.iter().all(|&g| (0..=7).contains(&g)));
        assert!(scale_bitcount(&mut gi.clone(), true));
        assert!(check_scalefactor(&gi, &solution.step_floor));
    }

    #[test]
    fn test_floor_raises_bits() {
        let f = fixture();
        let (mut plain, xmin) = prepared(&f, &spectrum(5, 3000.0), BlockType::Normal, 0.3);
        f.solver.solve(&f.huffman, &mut plain, &xmin, 0, 4095, 0, 0).unwrap();
        let plain_bits = (plain.part2_3_length + plain.part2_length) as i32;

        let (mut floored, xmin) = prepared(&f, &spectrum(5, 3000.0), BlockType::Normal, 0.3);
        f.solver
            .solve(&f.huffman, &mut floored, &xmin, plain_bits + 400, 4095, 0, 0)
            .unwrap();
        assert!((floored.part2_3_length + floored.part2_length) as i32 >= plain_bits);
        assert!((floored.part2_3_length + floored.part2_length) as i32 <= 4095);
    }

    fn pass<'a>(f: &'a Fixture, gi: &GranuleChannelState) -> SolverPass<'a> {
        SolverPass {
            solver: &f.solver,
            estimator: &f.huffman,
            xr34: gi.xrpow,
            mingain_l: 0,
            mingain_s: [0; 3],
        }
    }

    #[test]
    fn test_unstorable_scalefactors_cost_large_bits() {
        let f = fixture();
        let (mut gi, _) = prepared(&f, &spectrum(7, 2000.0), BlockType::Normal, 0.01);
        let pass = pass(&f, &gi);
        gi.scalefac[0] = 40;
        assert_eq!(pass.count_storable(&mut gi), LARGE_BITS);
        assert_eq!(gi.part2_3_length, LARGE_BITS);
        assert!(pass.over(&gi, 4095));

        gi.scalefac[0] = 10;
        pass.count_storable(&mut gi);
        assert!(gi.part2_length < LARGE_BITS);
    }

    #[test]
    fn test_overflow_floor_covers_odd_final_line() {
        let f = fixture();
        let mut xr = [0.0f32; GRANULE_SIZE];
        xr[0] = 1.0;
        xr[2] = 30000.0;
        let (mut gi, xmin) = prepared(&f, &xr, BlockType::Normal, 0.01);
        gi.max_nonzero_coeff = 2;
        let mut pass = pass(&f, &gi);
        let (mut vbrsf, mut vbrsfmin) = ([0; SFBMAX], [0; SFBMAX]);
        pass.block_sf(&gi, &xmin, &mut vbrsf, &mut vbrsfmin);

        assert_eq!(vbrsfmin[0], find_lowest_scalefac(gi.xrpow[2]));
        assert!(vbrsfmin[0] > find_lowest_scalefac(gi.xrpow[0]));
        assert!(ipow20(vbrsfmin[0]) * gi.xrpow[2] <= IXMAX_VAL as f32);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 100,
            failure_persistence: None,
            .. ProptestConfig::default()
        })]

        #[test]
        fn test_solution_respects_ceiling_and_floor_steps(
            seed in 1u32..50_000,
            level in 10.0f32..30000.0,
            ceiling in 300i32..4095,
        ) {
            let f = fixture();
            let (mut gi, xmin) = prepared(&f, &spectrum(seed, level), BlockType::Normal, 0.001);
            match f.solver.solve(&f.huffman, &mut gi, &xmin, 0, ceiling, 0, 0) {
                Ok(solution) => {
                    prop_assert!((gi.part2_3_length + gi.part2_length) as i32 <= ceiling);
                    for sfb in 0..gi.psymax {
                        prop_assert!(effective_step(&gi, sfb) >= solution.step_floor[sfb]);
                    }
                }
                Err(err) => {
                    let is_budget_exhausted = matches!(err, QuantizationError::BudgetExhausted { .. });
                    prop_assert!(is_budget_exhausted);
                    prop_assert_eq!(gi.part2_3_length, LARGE_BITS);
                }
            }
        }
    }
}
