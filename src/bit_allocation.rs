//! Bit allocation planning
//!
//! Turns perceptual entropy and reservoir state into bit targets: per-channel
//! targets for constant and average bitrate frames, and minimum/maximum bounds
//! plus a per-bitrate frame size table for variable bitrate frames.

use crate::config::{Config, MpegVersion, PsyStrategy, RateControl};
use crate::reservoir::BitReservoir;
use crate::tables::get_bitrate;
use crate::types::{
    BlockType, GranuleChannelState, MAX_BITS_PER_CHANNEL, MAX_BITS_PER_GRANULE, MAX_CHANNELS, MAX_GRANULES,
    SBMAX_L, SBMAX_S, SFBMAX,
};

/// Minimum bits any coded granule/channel starts from
pub const MIN_GRANULE_BITS: i32 = 126;

/// Perceptual entropy at which a channel gets exactly its share of the mean
const PE_BASE: f32 = 700.0;

/// Per-frame bit targets indexed by granule and channel
pub type GranuleBits = [[i32; MAX_CHANNELS]; MAX_GRANULES];

/// Layout and size of the frames of one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub version: MpegVersion,
    pub sample_rate: u32,
    /// Header and side information in bytes
    pub sideinfo_len: usize,
    pub granules: usize,
    pub channels: usize,
}

impl FrameGeometry {
    pub fn from_config(config: &Config) -> Self {
        Self {
            version: config.mpeg_version(),
            sample_rate: config.wave.sample_rate,
            sideinfo_len: config.sideinfo_len(),
            granules: config.granules_per_frame(),
            channels: config.channels(),
        }
    }

    pub fn is_mpeg1(&self) -> bool {
        self.version == MpegVersion::Mpeg1
    }

    /// Bytes per frame times the sample rate, per kbps
    pub fn slot_multiplier(&self) -> u32 {
        if self.is_mpeg1() {
            144_000
        } else {
            72_000
        }
    }

    /// Total frame length in bits at `bitrate_index`, header included
    pub fn frame_bits(&self, bitrate_index: usize, padding: bool) -> u32 {
        let kbps = get_bitrate(bitrate_index, self.is_mpeg1()).unwrap_or(0);
        let bytes = self.slot_multiplier() as u64 * kbps as u64 / self.sample_rate as u64 + padding as u64;
        8 * bytes as u32
    }

    /// Main data bits of one granule/channel at `bitrate_index`, without reservoir
    pub fn mean_bits_per_channel(&self, bitrate_index: usize) -> i32 {
        let main_data = self.frame_bits(bitrate_index, false) as i32 - 8 * self.sideinfo_len as i32;
        main_data / (self.granules * self.channels) as i32
    }
}

/// Frame sizes available to a variable bitrate frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitBudget {
    /// Bits each bitrate index provides, reservoir included; index 0 unused
    pub frame_bits: [i32; 15],
    /// Bits per granule/channel at the lowest allowed bitrate
    pub min_mean_bits: i32,
    /// Bits per granule/channel granted to analog silence
    pub analog_mean_bits: i32,
    pub min_index: usize,
    pub max_index: usize,
}

impl BitBudget {
    /// Frame bits for every bitrate up to `max_index`, given the reservoir state
    pub fn compute<R: BitReservoir + ?Sized>(
        reservoir: &mut R,
        geometry: &FrameGeometry,
        min_index: usize,
        max_index: usize,
    ) -> Self {
        let mut frame_bits = [0; 15];
        for (index, bits) in frame_bits.iter_mut().enumerate().take(max_index + 1).skip(1) {
            *bits = reservoir.begin_frame(index).frame_bits;
        }
        Self {
            frame_bits,
            min_mean_bits: geometry.mean_bits_per_channel(min_index),
            analog_mean_bits: geometry.mean_bits_per_channel(1),
            min_index,
            max_index,
        }
    }

    /// Bits of the largest allowed frame
    pub fn ceiling(&self) -> i32 {
        self.frame_bits[self.max_index]
    }

    /// Lowest bitrate index from `start` whose frame holds `used_bits`
    pub fn lowest_index_for(&self, used_bits: i32, start: usize) -> usize {
        (start..self.max_index)
            .find(|&index| used_bits <= self.frame_bits[index])
            .unwrap_or(self.max_index)
    }
}

/// Per-channel targets of one constant bitrate granule and its ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GranuleTargets {
    pub targ_bits: [i32; MAX_CHANNELS],
    pub max_bits: i32,
}

/// Targets of one average bitrate frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbrTargets {
    pub targ_bits: GranuleBits,
    /// Bits per granule/channel for analog silence
    pub analog_silence_bits: i32,
    /// Bits of the largest allowed frame, reservoir included
    pub max_frame_bits: i32,
}

/// Inputs of the minimum bit estimate of one granule/channel
#[derive(Debug, Clone, Copy)]
pub struct MinBitsInput {
    pub pe: f32,
    pub ms_ener_ratio: f32,
    /// Bands whose energy exceeds the threshold in quiet
    pub bands: u32,
    pub analog_silence: bool,
    pub channel: usize,
}

/// Bit targets from perceptual entropy and reservoir state
#[derive(Debug, Clone)]
pub struct BitAllocationPlanner {
    geometry: FrameGeometry,
    strategy: PsyStrategy,
    hard_min: bool,
    mean_kbps: u32,
    compression_ratio: f32,
    substep_shaping: u8,
    mask_adjust_db: f32,
    mask_adjust_short_db: f32,
    min_index: usize,
    max_index: usize,
}

impl BitAllocationPlanner {
    pub fn new(config: &Config) -> Self {
        let (mean_kbps, hard_min) = match config.rate {
            RateControl::Cbr { bitrate } => (bitrate, false),
            RateControl::Abr { mean_bitrate, .. } => (mean_bitrate, false),
            RateControl::Vbr { hard_min, .. } => (0, hard_min),
        };
        Self {
            geometry: FrameGeometry::from_config(config),
            strategy: config.psy.strategy,
            hard_min,
            mean_kbps,
            compression_ratio: config.compression_ratio(),
            substep_shaping: config.quant.substep_shaping,
            mask_adjust_db: config.psy.mask_adjust_db,
            mask_adjust_short_db: config.psy.mask_adjust_short_db,
            min_index: config.min_bitrate_index(),
            max_index: config.max_bitrate_index(),
        }
    }

    pub fn geometry(&self) -> &FrameGeometry {
        &self.geometry
    }

    pub fn min_index(&self) -> usize {
        self.min_index
    }

    pub fn max_index(&self) -> usize {
        self.max_index
    }

    /// Silent frames may drop below the configured minimum bitrate
    pub fn hard_min(&self) -> bool {
        self.hard_min
    }

    /// Frame sizes of every allowed bitrate
    pub fn frame_budget<R: BitReservoir + ?Sized>(&self, reservoir: &mut R) -> BitBudget {
        BitBudget::compute(reservoir, &self.geometry, self.min_index, self.max_index)
    }

    /// Targets weighted by perceptual entropy above the base of 700
    ///
    /// Every channel starts from an equal share of the reservoir target and may
    /// claim up to three quarters of the mean on top of it, limited by the extra
    /// bits the reservoir can lend.
    pub fn on_pe<R: BitReservoir + ?Sized>(&self, reservoir: &R, pe: &[f32; 2], mean_bits: i32, cbr: bool) -> GranuleTargets {
        let channels = self.geometry.channels;
        let (tbits, mut extra_bits) = reservoir.max_bits(mean_bits, cbr);
        let max_bits = (tbits + extra_bits).min(MAX_BITS_PER_GRANULE as i32);
        let max_channel = MAX_BITS_PER_CHANNEL as i32;

        let mut targ_bits = [0; MAX_CHANNELS];
        let mut add_bits = [0; MAX_CHANNELS];
        let mut bits = 0;
        for ch in 0..channels {
            targ_bits[ch] = max_channel.min(tbits / channels as i32);
            let mut add = (targ_bits[ch] as f32 * pe[ch] / PE_BASE - targ_bits[ch] as f32) as i32;
            add = add.clamp(0, (mean_bits * 3 / 4).max(0));
            if add + targ_bits[ch] > max_channel {
                add = (max_channel - targ_bits[ch]).max(0);
            }
            add_bits[ch] = add;
            bits += add;
        }
        if bits > extra_bits && bits > 0 {
            for add in add_bits.iter_mut().take(channels) {
                *add = extra_bits * *add / bits;
            }
        }
        for ch in 0..channels {
            targ_bits[ch] += add_bits[ch];
            extra_bits -= add_bits[ch];
        }

        let sum: i32 = targ_bits.iter().take(channels).sum();
        if sum > MAX_BITS_PER_GRANULE as i32 {
            for targ in targ_bits.iter_mut().take(channels) {
                *targ = *targ * MAX_BITS_PER_GRANULE as i32 / sum;
            }
        }
        GranuleTargets { targ_bits, max_bits }
    }

    /// Average bitrate targets of one frame
    pub fn abr_targets<R: BitReservoir + ?Sized>(
        &self,
        reservoir: &mut R,
        pe: &[[f32; 2]; MAX_GRANULES],
        ms_ener_ratio: &[f32; MAX_GRANULES],
        block_types: &[[BlockType; 2]; MAX_GRANULES],
        mid_side: bool,
    ) -> AbrTargets {
        let g = &self.geometry;
        let per_frame = (g.granules * g.channels) as i32;
        let max_frame_bits = reservoir.begin_frame(self.max_index).frame_bits;
        let analog_silence_bits = g.mean_bits_per_channel(1);

        let framesize = (576 * g.granules) as i64;
        let mut mean = self.mean_kbps as i64 * framesize * 1000;
        if self.substep_shaping & 1 != 0 {
            mean = (mean as f64 * 1.09) as i64;
        }
        mean /= g.sample_rate as i64;
        mean -= 8 * g.sideinfo_len as i64;
        let mean_bits = (mean / per_frame as i64) as i32;

        let res_factor = (0.93 + 0.07 * (11.0 - self.compression_ratio) / (11.0 - 5.5)).clamp(0.90, 1.00);

        let mut targ_bits = [[0; MAX_CHANNELS]; MAX_GRANULES];
        for gr in 0..g.granules {
            for ch in 0..g.channels {
                targ_bits[gr][ch] = (res_factor * mean_bits as f32) as i32;
                if pe[gr][ch] > PE_BASE {
                    let mut add = ((pe[gr][ch] - PE_BASE) / 1.4) as i32;
                    // short blocks use a little extra, whatever the entropy
                    if block_types[gr][ch] == BlockType::Short {
                        add = add.max(mean_bits / 2);
                    }
                    add = add.clamp(0, (mean_bits * 3 / 2).max(0));
                    targ_bits[gr][ch] += add;
                }
            }
        }

        if mid_side {
            for gr in 0..g.granules {
                reduce_side(
                    &mut targ_bits[gr],
                    ms_ener_ratio[gr],
                    mean_bits * g.channels as i32,
                    MAX_BITS_PER_CHANNEL as i32,
                );
            }
        }

        let mut total = 0;
        for row in targ_bits.iter_mut().take(g.granules) {
            for targ in row.iter_mut().take(g.channels) {
                *targ = (*targ).min(MAX_BITS_PER_CHANNEL as i32);
                total += *targ;
            }
        }
        if total > max_frame_bits && total > 0 {
            for row in targ_bits.iter_mut().take(g.granules) {
                for targ in row.iter_mut().take(g.channels) {
                    *targ = *targ * max_frame_bits / total;
                }
            }
        }

        log::trace!("abr targets {:?}, mean {} bits, ceiling {}", targ_bits, mean_bits, max_frame_bits);
        AbrTargets {
            targ_bits,
            analog_silence_bits,
            max_frame_bits,
        }
    }

    /// Bit floor of one variable bitrate granule/channel
    pub fn min_bits(&self, gi: &GranuleChannelState, input: MinBitsInput, budget: &BitBudget, mid_side: bool) -> i32 {
        if self.strategy == PsyStrategy::AttackDriven {
            return MIN_GRANULE_BITS;
        }

        let side = mid_side && input.channel == 1;
        let min_bits = MIN_GRANULE_BITS.max(budget.min_mean_bits);

        let sfb_count = if gi.block_type == BlockType::Short {
            gi.sfbmax + 3
        } else {
            gi.sfbmax + 1
        };
        let mut pe_bits = (input.pe as i32 - 350) * input.bands as i32 / sfb_count as i32;
        if side {
            let fac = 0.33 * (0.5 - input.ms_ener_ratio) / 0.5;
            pe_bits = (pe_bits as f32 * ((1.0 - fac) / (1.0 + fac))) as i32;
        }
        pe_bits = pe_bits.min((1820 * self.geometry.sample_rate / 44100) as i32);

        if input.analog_silence && !self.hard_min {
            budget.analog_mean_bits
        } else {
            min_bits.max(pe_bits)
        }
    }

    /// Linear masking adjustment of the constant and average bitrate loops
    pub fn masking_lower(&self, block_type: BlockType) -> f32 {
        let db = if block_type == BlockType::Normal {
            self.mask_adjust_db
        } else {
            self.mask_adjust_short_db
        };
        10f32.powf(db * 0.1)
    }

    /// Masking adjustment of the variable bitrate loop, lowered further as the
    /// granule's entropy grows
    pub fn vbr_masking_lower(&self, block_type: BlockType, pe: f32) -> f32 {
        let sigmoid = 1.0 + (3.5 - pe / 300.0).exp();
        let db = if block_type == BlockType::Normal {
            self.mask_adjust_db - (1.28 / sigmoid - 0.05)
        } else {
            self.mask_adjust_short_db - (2.56 / sigmoid - 0.14)
        };
        10f32.powf(db * 0.1)
    }
}

/// Move bits from the side channel to the mid channel
///
/// The less energy the side channel carries, the more of its target moves, but
/// it keeps at least 125 bits when it had them.
pub fn reduce_side(targ_bits: &mut [i32; MAX_CHANNELS], ms_ener_ratio: f32, mean_bits: i32, max_bits: i32) {
    let fac = (0.33 * (0.5 - ms_ener_ratio) / 0.5).clamp(0.0, 0.5);
    let mut move_bits = (fac * 0.5 * (targ_bits[0] + targ_bits[1]) as f32) as i32;
    move_bits = move_bits.min(MAX_BITS_PER_CHANNEL as i32 - targ_bits[0]).max(0);

    if targ_bits[1] >= 125 {
        if targ_bits[1] - move_bits > 125 {
            if targ_bits[0] < mean_bits {
                targ_bits[0] += move_bits;
            }
            targ_bits[1] -= move_bits;
        } else {
            targ_bits[0] += targ_bits[1] - 125;
            targ_bits[1] = 125;
        }
    }

    let total = targ_bits[0] + targ_bits[1];
    if total > max_bits && total > 0 {
        targ_bits[0] = max_bits * targ_bits[0] / total;
        targ_bits[1] = max_bits * targ_bits[1] / total;
    }
}

/// Scale the maxima of a frame down to the largest frame and keep every floor
/// at or below its maximum
pub fn fit_to_ceiling(min_bits: &mut GranuleBits, max_bits: &mut GranuleBits, ceiling: i32, granules: usize, channels: usize) {
    let total: i32 = max_bits.iter().take(granules).flat_map(|row| row.iter().take(channels)).sum();
    for gr in 0..granules {
        for ch in 0..channels {
            if total > ceiling && total > 0 {
                max_bits[gr][ch] = max_bits[gr][ch] * ceiling / total;
            }
            min_bits[gr][ch] = min_bits[gr][ch].min(max_bits[gr][ch]);
        }
    }
}

/// Tighten allowed noise on the upper bands and lower the granule maximum by a
/// tenth, used when no bitrate can hold a variable bitrate frame
pub fn bitpressure(xmin: &mut [f32; SFBMAX], gi: &GranuleChannelState, min_bits: i32, max_bits: &mut i32) {
    let mut k = 0;
    for sfb in 0..gi.psy_lmax {
        xmin[k] *= 1.0 + 0.029 * (sfb * sfb) as f32 / (SBMAX_L * SBMAX_L) as f32;
        k += 1;
    }
    if gi.block_type == BlockType::Short {
        for sfb in gi.sfb_smin..SBMAX_S {
            let factor = 1.0 + 0.029 * (sfb * sfb) as f32 / (SBMAX_S * SBMAX_S) as f32;
            for _ in 0..3 {
                if k < SFBMAX {
                    xmin[k] *= factor;
                }
                k += 1;
            }
        }
    }
    *max_bits = min_bits.max((0.9 * *max_bits as f32) as i32);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelMode;
    use crate::reservoir::Reservoir;
    use proptest::prelude::*;

    fn stereo() -> Config {
        Config::new()
    }

    #[test]
    fn test_frame_lengths() {
        let g = FrameGeometry::from_config(&stereo());
        assert_eq!(g.frame_bits(9, false), 417 * 8);
        assert_eq!(g.frame_bits(9, true), 418 * 8);
        assert_eq!(g.frame_bits(14, false), 1044 * 8);

        let mut config = stereo();
        config.wave.sample_rate = 22050;
        let g = FrameGeometry::from_config(&config);
        assert_eq!(g.granules, 1);
        // 64 kbps at 22.05 kHz: 72000 * 64 / 22050 = 208 bytes
        assert_eq!(g.frame_bits(8, false), 208 * 8);
    }

    #[test]
    fn test_reduce_side_moves_bits_to_mid() {
        let mut targ = [1000, 1000];
        reduce_side(&mut targ, 0.1, 2000, 4000);
        assert!(targ[0] > 1000);
        assert!(targ[1] < 1000);
        assert_eq!(targ[0] + targ[1], 2000);

        // a balanced pair stays untouched
        let mut even = [800, 800];
        reduce_side(&mut even, 0.5, 2000, 4000);
        assert_eq!(even, [800, 800]);
    }

    #[test]
    fn test_reduce_side_keeps_125_bits_on_side() {
        let mut targ = [300, 130];
        reduce_side(&mut targ, 0.0, 2000, 4000);
        assert_eq!(targ[1], 125);
        assert_eq!(targ[0], 305);
    }

    #[test]
    fn test_on_pe_splits_evenly_at_base_entropy() {
        let config = stereo();
        let planner = BitAllocationPlanner::new(&config);
        let mut reservoir = Reservoir::new(*planner.geometry(), Some(128));
        let bits = reservoir.begin_frame(9);
        let targets = planner.on_pe(&reservoir, &[PE_BASE, PE_BASE], bits.mean_bits, false);
        assert_eq!(targets.targ_bits[0], targets.targ_bits[1]);
        assert!(targets.targ_bits[0] + targets.targ_bits[1] <= targets.max_bits);
    }

    #[test]
    fn test_abr_short_blocks_get_extra_bits() {
        let config = Config::abr(128);
        let planner = BitAllocationPlanner::new(&config);
        let mut reservoir = Reservoir::new(*planner.geometry(), None);
        let pe = [[800.0; 2]; 2];
        let long = planner.abr_targets(&mut reservoir, &pe, &[0.5; 2], &[[BlockType::Normal; 2]; 2], false);
        let short = planner.abr_targets(&mut reservoir, &pe, &[0.5; 2], &[[BlockType::Short; 2]; 2], false);
        assert!(short.targ_bits[0][0] > long.targ_bits[0][0]);
        assert!(long.analog_silence_bits > 0);
    }

    #[test]
    fn test_vbr_budget_grows_with_bitrate() {
        let config = Config::vbr(4, crate::config::VbrSolver::OuterLoop);
        let planner = BitAllocationPlanner::new(&config);
        let mut reservoir = Reservoir::new(*planner.geometry(), None);
        let budget = planner.frame_budget(&mut reservoir);
        assert_eq!(budget.max_index, 14);
        assert!(budget.frame_bits[1..=14].windows(2).all(|w| w[0] < w[1]));
        assert_eq!(budget.lowest_index_for(0, 1), 1);
        assert_eq!(budget.lowest_index_for(i32::MAX, 1), 14);
        assert!(budget.analog_mean_bits <= budget.min_mean_bits);
    }

    #[test]
    fn test_attack_model_floor_is_fixed() {
        let config = Config::vbr(2, crate::config::VbrSolver::OuterLoop);
        let planner = BitAllocationPlanner::new(&config);
        let mut reservoir = Reservoir::new(*planner.geometry(), None);
        let budget = planner.frame_budget(&mut reservoir);
        let input = MinBitsInput {
            pe: 5000.0,
            ms_ener_ratio: 0.5,
            bands: 21,
            analog_silence: false,
            channel: 0,
        };
        assert_eq!(
            planner.min_bits(&GranuleChannelState::default(), input, &budget, false),
            MIN_GRANULE_BITS
        );
    }

    #[test]
    fn test_classical_floor_follows_entropy_and_silence() {
        let mut config = Config::vbr(2, crate::config::VbrSolver::OuterLoop);
        config.psy.strategy = PsyStrategy::Classical;
        let planner = BitAllocationPlanner::new(&config);
        let mut reservoir = Reservoir::new(*planner.geometry(), None);
        let budget = planner.frame_budget(&mut reservoir);
        let gi = GranuleChannelState::default();
        let quiet = MinBitsInput {
            pe: 100.0,
            ms_ener_ratio: 0.5,
            bands: 21,
            analog_silence: false,
            channel: 0,
        };
        let busy = MinBitsInput { pe: 3000.0, ..quiet };
        let silent = MinBitsInput {
            analog_silence: true,
            ..quiet
        };
        assert_eq!(planner.min_bits(&gi, quiet, &budget, false), budget.min_mean_bits.max(MIN_GRANULE_BITS));
        assert!(planner.min_bits(&gi, busy, &budget, false) > planner.min_bits(&gi, quiet, &budget, false));
        assert_eq!(planner.min_bits(&gi, silent, &budget, false), budget.analog_mean_bits);
    }

    #[test]
    fn test_masking_lower_tracks_entropy() {
        let planner = BitAllocationPlanner::new(&Config::vbr(4, crate::config::VbrSolver::OuterLoop));
        let low = planner.vbr_masking_lower(BlockType::Normal, 100.0);
        let high = planner.vbr_masking_lower(BlockType::Normal, 3000.0);
        assert!(high < low);
    }

    #[test]
    fn test_bitpressure_tightens_upper_bands() {
        let gi = GranuleChannelState::default();
        let mut xmin = [1.0; SFBMAX];
        let mut max_bits = 1000;
        bitpressure(&mut xmin, &gi, 200, &mut max_bits);
        assert_eq!(xmin[0], 1.0);
        assert!(xmin[20] > xmin[10]);
        assert_eq!(max_bits, 900);

        let mut floor_bound = 210;
        bitpressure(&mut xmin, &gi, 200, &mut floor_bound);
        assert_eq!(floor_bound, 200);
    }

    #[test]
    fn test_fit_to_ceiling() {
        let mut min_bits = [[500; 2]; 2];
        let mut max_bits = [[1000; 2]; 2];
        fit_to_ceiling(&mut min_bits, &mut max_bits, 2000, 2, 2);
        assert_eq!(max_bits, [[500; 2]; 2]);
        assert_eq!(min_bits, [[500; 2]; 2]);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 100,
            failure_persistence: None,
            .. ProptestConfig::default()
        })]

        #[test]
        fn test_on_pe_respects_granule_limits(
            pe0 in 0.0f32..20000.0,
            pe1 in 0.0f32..20000.0,
            bitrate_index in 1usize..=14,
            mono in any::<bool>(),
        ) {
            let mut config = stereo();
            if mono {
                config.wave.channels = crate::config::Channels::Mono;
                config.wave.mode = ChannelMode::Mono;
            }
            let planner = BitAllocationPlanner::new(&config);
            let mut reservoir = Reservoir::new(*planner.geometry(), None);
            let bits = reservoir.begin_frame(bitrate_index);
            let targets = planner.on_pe(&reservoir, &[pe0, pe1], bits.mean_bits, false);
            let channels = planner.geometry().channels;
            let total: i32 = targets.targ_bits.iter().take(channels).sum();
            prop_assert!(total <= MAX_BITS_PER_GRANULE as i32);
            for &t in targets.targ_bits.iter().take(channels) {
                prop_assert!(t >= 0);
                prop_assert!(t <= MAX_BITS_PER_CHANNEL as i32);
            }
        }

        #[test]
        fn test_reduce_side_never_exceeds_ceiling(
            mid in 0i32..4095,
            side in 0i32..4095,
            ratio in 0.0f32..=1.0,
            max_bits in 1i32..7680,
        ) {
            let mut targ = [mid, side];
            reduce_side(&mut targ, ratio, 2000, max_bits);
            prop_assert!(targ[0] >= 0 && targ[1] >= 0);
            prop_assert!(targ[0] + targ[1] <= max_bits.max(mid + side));
            prop_assert!(targ[0] + targ[1] <= max_bits || mid + side <= max_bits);
        }
    }
}
