//! Rate control of whole frames
//!
//! A controller sequences the granule quantizer over every granule and channel
//! of a frame and settles the frame with the bit reservoir. Constant bitrate
//! frames split a fixed allowance by perceptual entropy, average bitrate frames
//! aim at a long-term mean, and variable bitrate frames quantize at their
//! allowed noise and then pick the smallest bitrate that holds the result.

use crate::bit_allocation::{bitpressure, fit_to_ceiling, reduce_side, BitAllocationPlanner, GranuleBits, MinBitsInput};
use crate::config::{Config, RateControl, VbrSolver};
use crate::error::{QuantizationError, QuantizationResult};
use crate::outer_loop::GranuleQuantizer;
use crate::quantize::{ms_convert, PseudoHalf, StepSearchState};
use crate::reservoir::BitReservoir;
use crate::types::{BlockType, FrameSideInfo, GranuleChannelState, MaskingRatio, MAX_CHANNELS, MAX_GRANULES, SFBMAX};
use crate::vbr::VbrScalefactorSolver;

/// Bit pressure passes before a variable bitrate frame is given up
const MAX_PRESSURE_PASSES: usize = 16;

/// Quantization inputs of one frame, after the stereo decision
#[derive(Debug, Clone)]
pub struct FramePlan {
    /// Coefficients and block types; receives the quantization
    pub side: FrameSideInfo,
    pub ratio: [[MaskingRatio; MAX_CHANNELS]; MAX_GRANULES],
    pub pe: [[f32; MAX_CHANNELS]; MAX_GRANULES],
    pub ms_ener_ratio: [f32; MAX_GRANULES],
    /// Channels are coded as mid/side; `side` still holds left/right
    pub mid_side: bool,
}

impl FramePlan {
    pub fn block_types(&self) -> [[BlockType; MAX_CHANNELS]; MAX_GRANULES] {
        let mut types = [[BlockType::Normal; MAX_CHANNELS]; MAX_GRANULES];
        for (row, granule) in types.iter_mut().zip(&self.side.gr) {
            for (t, gi) in row.iter_mut().zip(granule) {
                *t = gi.block_type;
            }
        }
        types
    }
}

/// Quantization summary of one granule/channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GranuleReport {
    pub global_gain: i32,
    pub part2_3_length: u32,
    pub part2_length: u32,
    pub over_count: i32,
    pub max_noise: f32,
}

impl Default for GranuleReport {
    fn default() -> Self {
        Self {
            global_gain: 0,
            part2_3_length: 0,
            part2_length: 0,
            over_count: 0,
            max_noise: -20.0,
        }
    }
}

/// Result of one frame
#[derive(Debug, Clone, PartialEq)]
pub struct FrameOutcome {
    pub bitrate_index: usize,
    /// Main data bits of one granule at the chosen bitrate
    pub mean_bits: i32,
    /// Bits the quantized granules use, scalefactors included
    pub used_bits: i32,
    pub stuffing_bits: i32,
    pub reports: [[GranuleReport; MAX_CHANNELS]; MAX_GRANULES],
}

/// Shared state the controllers work with
pub struct ControllerContext<'a> {
    pub quantizer: &'a GranuleQuantizer,
    pub planner: &'a BitAllocationPlanner,
    pub reservoir: &'a mut dyn BitReservoir,
    /// Step size search state per channel, carried across frames
    pub step: &'a mut [StepSearchState; MAX_CHANNELS],
}

/// Frame level rate control
pub trait RateController: Send {
    fn encode_frame(&mut self, cx: ControllerContext<'_>, plan: &mut FramePlan) -> QuantizationResult<FrameOutcome>;
}

/// Controller for the configured rate control mode
pub fn for_config(config: &Config) -> Box<dyn RateController> {
    match config.rate {
        RateControl::Cbr { .. } => Box::new(CbrController::new(config.bitrate_index())),
        RateControl::Abr { .. } => Box::new(AbrController),
        RateControl::Vbr { .. } => Box::new(VbrController::new(config)),
    }
}

/// Mid/side conversion and optional sparsing of one granule
fn to_mid_side(quantizer: &GranuleQuantizer, pair: &mut [GranuleChannelState; MAX_CHANNELS]) {
    ms_convert(pair);
    quantizer.context().ms_sparsing(pair);
}

/// Allowed noise and xrpow of a fresh granule; false when it carries no energy
fn prepare_granule(
    quantizer: &GranuleQuantizer,
    gi: &mut GranuleChannelState,
    ratio: &MaskingRatio,
    masking_lower: f32,
    xmin: &mut [f32; SFBMAX],
    pseudohalf: &mut PseudoHalf,
) -> (bool, u32) {
    let ctx = quantizer.context();
    ctx.init_outer_loop(gi);
    let ath_over = ctx.calc_xmin(ratio, gi, masking_lower, xmin);
    (ctx.init_xrpow(gi, pseudohalf), ath_over)
}

fn report(quantizer: &GranuleQuantizer, gi: &GranuleChannelState, xmin: &[f32; SFBMAX]) -> GranuleReport {
    let mut distort = [0.0; SFBMAX];
    let noise = quantizer.context().calc_noise(gi, xmin, &mut distort);
    GranuleReport {
        global_gain: gi.global_gain,
        part2_3_length: gi.part2_3_length,
        part2_length: gi.part2_length,
        over_count: noise.over_count,
        max_noise: noise.max_noise,
    }
}

/// Store the final scalefactors and charge the reservoir
fn settle(cx: &mut ControllerContext<'_>, gi: &mut GranuleChannelState, report: &mut GranuleReport) -> i32 {
    cx.quantizer.finish_one(gi);
    cx.reservoir.adjust(gi);
    report.part2_3_length = gi.part2_3_length;
    report.part2_length = gi.part2_length;
    gi.total_bits() as i32
}

/// Constant bitrate
#[derive(Debug, Clone)]
pub struct CbrController {
    bitrate_index: usize,
}

impl CbrController {
    pub fn new(bitrate_index: usize) -> Self {
        Self { bitrate_index }
    }
}

impl RateController for CbrController {
    fn encode_frame(&mut self, mut cx: ControllerContext<'_>, plan: &mut FramePlan) -> QuantizationResult<FrameOutcome> {
        let geometry = *cx.planner.geometry();
        let frame = cx.reservoir.begin_frame(self.bitrate_index);
        let mean_bits = frame.mean_bits;
        let mut reports = [[GranuleReport::default(); MAX_CHANNELS]; MAX_GRANULES];
        let mut used_bits = 0;

        for gr in 0..geometry.granules {
            let targets = cx.planner.on_pe(&*cx.reservoir, &plan.pe[gr], mean_bits, gr != 0);
            let mut targ_bits = targets.targ_bits;
            if plan.mid_side {
                to_mid_side(cx.quantizer, &mut plan.side.gr[gr]);
                reduce_side(&mut targ_bits, plan.ms_ener_ratio[gr], mean_bits, targets.max_bits);
            }

            for ch in 0..geometry.channels {
                let gi = &mut plan.side.gr[gr][ch];
                let masking_lower = cx.planner.masking_lower(gi.block_type);
                let mut xmin = [0.0; SFBMAX];
                let mut pseudohalf = [false; SFBMAX];
                let (audible, _) = prepare_granule(cx.quantizer, gi, &plan.ratio[gr][ch], masking_lower, &mut xmin, &mut pseudohalf);
                if audible {
                    cx.quantizer.outer_loop(gi, &xmin, targ_bits[ch], &mut cx.step[ch], &mut pseudohalf);
                }
                reports[gr][ch] = report(cx.quantizer, gi, &xmin);
                used_bits += settle(&mut cx, gi, &mut reports[gr][ch]);

                if gi.part2_3_length as i32 > targ_bits[ch] {
                    log::warn!(
                        "granule {} channel {}: {} bits over a target of {}",
                        gr,
                        ch,
                        gi.part2_3_length,
                        targ_bits[ch]
                    );
                }
                log::debug!(
                    "cbr granule {} channel {}: gain {}, {} bits of {}",
                    gr,
                    ch,
                    gi.global_gain,
                    gi.part2_3_length,
                    targ_bits[ch]
                );
            }
        }

        let stuffing_bits = cx.reservoir.end_frame(mean_bits);
        Ok(FrameOutcome {
            bitrate_index: self.bitrate_index,
            mean_bits,
            used_bits,
            stuffing_bits,
            reports,
        })
    }
}

/// Average bitrate
#[derive(Debug, Clone, Default)]
pub struct AbrController;

impl RateController for AbrController {
    fn encode_frame(&mut self, mut cx: ControllerContext<'_>, plan: &mut FramePlan) -> QuantizationResult<FrameOutcome> {
        let geometry = *cx.planner.geometry();
        let targets = cx.planner.abr_targets(
            &mut *cx.reservoir,
            &plan.pe,
            &plan.ms_ener_ratio,
            &plan.block_types(),
            plan.mid_side,
        );
        let mut reports = [[GranuleReport::default(); MAX_CHANNELS]; MAX_GRANULES];
        let mut used_bits = 0;

        for gr in 0..geometry.granules {
            if plan.mid_side {
                to_mid_side(cx.quantizer, &mut plan.side.gr[gr]);
            }
            for ch in 0..geometry.channels {
                let gi = &mut plan.side.gr[gr][ch];
                let masking_lower = cx.planner.masking_lower(gi.block_type);
                let mut xmin = [0.0; SFBMAX];
                let mut pseudohalf = [false; SFBMAX];
                let (audible, ath_over) =
                    prepare_granule(cx.quantizer, gi, &plan.ratio[gr][ch], masking_lower, &mut xmin, &mut pseudohalf);
                if audible {
                    let targ_bits = if ath_over == 0 {
                        log::debug!("abr granule {} channel {}: analog silence", gr, ch);
                        targets.analog_silence_bits
                    } else {
                        targets.targ_bits[gr][ch]
                    };
                    cx.quantizer.outer_loop(gi, &xmin, targ_bits, &mut cx.step[ch], &mut pseudohalf);
                }
                reports[gr][ch] = report(cx.quantizer, gi, &xmin);
                used_bits += settle(&mut cx, gi, &mut reports[gr][ch]);
            }
        }

        // lowest bitrate that brings the reservoir back to a nonnegative size
        let (min_index, max_index) = (cx.planner.min_index(), cx.planner.max_index());
        let mut chosen = (max_index, 0);
        for index in min_index..=max_index {
            let frame = cx.reservoir.begin_frame(index);
            chosen = (index, frame.mean_bits);
            if frame.frame_bits >= 0 {
                break;
            }
        }
        let (bitrate_index, mean_bits) = chosen;
        log::debug!("abr frame: index {}, {} bits used", bitrate_index, used_bits);

        let stuffing_bits = cx.reservoir.end_frame(mean_bits);
        Ok(FrameOutcome {
            bitrate_index,
            mean_bits,
            used_bits,
            stuffing_bits,
            reports,
        })
    }
}

/// Variable bitrate
pub struct VbrController {
    solver: Option<VbrScalefactorSolver>,
}

impl VbrController {
    pub fn new(config: &Config) -> Self {
        let solver = match config.quant.vbr_solver {
            VbrSolver::Direct => Some(VbrScalefactorSolver::new(config)),
            VbrSolver::OuterLoop => None,
        };
        Self { solver }
    }

    /// Quantize one granule at its allowed noise within `[min_bits, max_bits]`
    fn quantize(
        &self,
        cx: &mut ControllerContext<'_>,
        gi: &mut GranuleChannelState,
        xmin: &[f32; SFBMAX],
        bounds: (i32, i32),
        gr: usize,
        ch: usize,
    ) {
        let (min_bits, max_bits) = bounds;
        let ctx = cx.quantizer.context();
        let mut pseudohalf = [false; SFBMAX];
        if !ctx.init_xrpow(gi, &mut pseudohalf) || max_bits == 0 {
            return;
        }

        let solved = match &self.solver {
            Some(solver) => {
                let fresh = gi.clone();
                match solver.solve(cx.quantizer.estimator(), gi, xmin, min_bits, max_bits, gr, ch) {
                    Ok(_) => true,
                    Err(err) => {
                        log::warn!("{}; falling back to the outer loop", err);
                        *gi = fresh;
                        false
                    }
                }
            }
            None => false,
        };
        if !solved {
            cx.quantizer.vbr_encode_granule(gi, xmin, min_bits, max_bits, &mut cx.step[ch], &mut pseudohalf);
        }

        if ctx.substep_shaping() & 1 != 0 {
            ctx.trancate_smallspectrums(cx.quantizer.estimator(), gi, xmin);
        }
    }
}

impl RateController for VbrController {
    fn encode_frame(&mut self, mut cx: ControllerContext<'_>, plan: &mut FramePlan) -> QuantizationResult<FrameOutcome> {
        let geometry = *cx.planner.geometry();
        let (granules, channels) = (geometry.granules, geometry.channels);
        let max_index = cx.planner.max_index();

        let avg = cx.reservoir.begin_frame(max_index).frame_bits / granules as i32;
        let budget = cx.planner.frame_budget(&mut *cx.reservoir);

        let mut xmin = [[[0.0f32; SFBMAX]; MAX_CHANNELS]; MAX_GRANULES];
        let mut min_bits: GranuleBits = [[0; MAX_CHANNELS]; MAX_GRANULES];
        let mut max_bits: GranuleBits = [[0; MAX_CHANNELS]; MAX_GRANULES];
        let mut analog_silence = true;

        for gr in 0..granules {
            let targets = cx.planner.on_pe(&*cx.reservoir, &plan.pe[gr], avg, false);
            max_bits[gr] = targets.targ_bits;
            if plan.mid_side {
                to_mid_side(cx.quantizer, &mut plan.side.gr[gr]);
                reduce_side(&mut max_bits[gr], plan.ms_ener_ratio[gr], avg, targets.max_bits);
            }
            for ch in 0..channels {
                let gi = &mut plan.side.gr[gr][ch];
                let masking_lower = cx.planner.vbr_masking_lower(gi.block_type, plan.pe[gr][ch]);
                let ctx = cx.quantizer.context();
                ctx.init_outer_loop(gi);
                let bands = ctx.calc_xmin(&plan.ratio[gr][ch], gi, masking_lower, &mut xmin[gr][ch]);
                if bands > 0 {
                    analog_silence = false;
                }
                let input = MinBitsInput {
                    pe: plan.pe[gr][ch],
                    ms_ener_ratio: plan.ms_ener_ratio[gr],
                    bands,
                    analog_silence,
                    channel: ch,
                };
                min_bits[gr][ch] = cx.planner.min_bits(gi, input, &budget, plan.mid_side);
            }
        }
        fit_to_ceiling(&mut min_bits, &mut max_bits, budget.ceiling(), granules, channels);

        let prepared = plan.side.clone();
        let start_index = if analog_silence && !cx.planner.hard_min() {
            1
        } else {
            budget.min_index
        };

        let mut settled = None;
        for pass in 0..MAX_PRESSURE_PASSES {
            let mut used_bits = 0;
            for gr in 0..granules {
                for ch in 0..channels {
                    // every pass starts over from the prepared granule
                    let mut gi = prepared.gr[gr][ch].clone();
                    self.quantize(&mut cx, &mut gi, &xmin[gr][ch], (min_bits[gr][ch], max_bits[gr][ch]), gr, ch);
                    used_bits += gi.total_bits() as i32;
                    plan.side.gr[gr][ch] = gi;
                }
            }

            let index = budget.lowest_index_for(used_bits, start_index);
            let frame = cx.reservoir.begin_frame(index);
            log::debug!(
                "vbr pass {}: {} bits used, index {} holds {}",
                pass,
                used_bits,
                index,
                frame.frame_bits
            );
            if used_bits <= frame.frame_bits {
                settled = Some((index, frame.mean_bits, used_bits));
                break;
            }

            for gr in 0..granules {
                for ch in 0..channels {
                    bitpressure(&mut xmin[gr][ch], &prepared.gr[gr][ch], min_bits[gr][ch], &mut max_bits[gr][ch]);
                }
            }
        }

        let Some((bitrate_index, mean_bits, _)) = settled else {
            let bits: i32 = (0..granules)
                .flat_map(|gr| (0..channels).map(move |ch| (gr, ch)))
                .map(|(gr, ch)| plan.side.gr[gr][ch].total_bits() as i32)
                .sum();
            log::warn!("vbr frame does not fit the largest frame after {} passes", MAX_PRESSURE_PASSES);
            return Err(QuantizationError::BudgetExhausted {
                bits: bits.max(0) as u32,
                ceiling: budget.ceiling().max(0) as u32,
            });
        };

        let mut reports = [[GranuleReport::default(); MAX_CHANNELS]; MAX_GRANULES];
        let mut used_bits = 0;
        for gr in 0..granules {
            for ch in 0..channels {
                let gi = &mut plan.side.gr[gr][ch];
                reports[gr][ch] = report(cx.quantizer, gi, &xmin[gr][ch]);
                used_bits += settle(&mut cx, gi, &mut reports[gr][ch]);
            }
        }
        let stuffing_bits = cx.reservoir.end_frame(mean_bits);
        Ok(FrameOutcome {
            bitrate_index,
            mean_bits,
            used_bits,
            stuffing_bits,
            reports,
        })
    }
}
