//! Psychoacoustic analysis
//!
//! Both models share one output contract: the masking ratios, perceptual entropy
//! and block type returned by a call describe the block passed to the *previous*
//! call. The block type of a block can only be settled once the next block has
//! been checked for an attack, so every result is delayed by one block.

mod attack;
mod classic;

pub use attack::AttackModel;
pub use classic::ClassicalModel;

use crate::config::{ChannelMode, Config, PsyConfig, PsyStrategy, ShortBlocks};
use crate::error::{InputDataError, InputResult};
use crate::interchannel::InterchannelMaskingAdjuster;
use crate::partition::PartitionTables;
use crate::types::{
    BlockType, ChannelSpectrum, MaskingRatio, BLKSIZE, BLKSIZE_S, CBANDS, HBLKSIZE, HBLKSIZE_S, SBMAX_L, SBMAX_S,
};

/// Per-call inputs that depend on encoder state outside the analyzer
#[derive(Debug, Clone, Copy)]
pub struct AnalysisContext<'a> {
    pub tables: &'a PartitionTables,
    /// Strength of the long-block pre-echo clamp, 0..=1
    pub pcfact: f32,
    /// Linear masking adjustment used by the entropy estimate
    pub masking_lower: f32,
}

/// Analysis output for one granule, describing the previous block
#[derive(Debug, Clone, PartialEq)]
pub struct PsyGranuleResult {
    /// Left/right (or mono) masking ratios
    pub masking: [MaskingRatio; 2],
    /// Mid/side masking ratios; saturated unless mid/side analysis is active
    pub masking_ms: [MaskingRatio; 2],
    pub pe: [f32; 2],
    pub pe_ms: [f32; 2],
    /// Total energy above the lowest bins of left, right, mid and side
    pub energy: [f32; 4],
    pub block_type: [BlockType; 2],
    /// Average left/right threshold difference, capped at 0.5
    pub ms_ratio: f32,
    /// Same estimate for the block just analysed, assuming long blocks
    pub ms_ratio_next: f32,
}

impl PsyGranuleResult {
    /// Share of the side channel in the total mid/side energy
    pub fn ms_ener_ratio(&self) -> f32 {
        let total = self.energy[2] + self.energy[3];
        if total > 0.0 {
            self.energy[3] / total
        } else {
            0.5
        }
    }
}

/// Common contract of the analysis strategies
pub trait PsychoacousticModel: std::fmt::Debug {
    /// Analyse one block of every channel and return the delayed result
    fn analyze(&mut self, ctx: &AnalysisContext<'_>, spectra: &[ChannelSpectrum]) -> PsyGranuleResult;

    fn strategy(&self) -> PsyStrategy;
}

/// Per virtual channel analysis history
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ChannelHistory {
    /// Long-block thresholds of the last two blocks, for pre-echo control
    pub nb_1: [f32; CBANDS],
    pub nb_2: [f32; CBANDS],
    pub nb_s1: [f32; CBANDS],
    pub nb_s2: [f32; CBANDS],
    /// Ratios computed by the last call, handed out by the next one
    pub ratio: MaskingRatio,
    pub pe: f32,
    pub tot_ener: f32,
}

impl Default for ChannelHistory {
    fn default() -> Self {
        Self {
            nb_1: [1e20; CBANDS],
            nb_2: [1e20; CBANDS],
            nb_s1: [1.0; CBANDS],
            nb_s2: [1.0; CBANDS],
            ratio: MaskingRatio::saturated(),
            pe: 0.0,
            tot_ener: 0.0,
        }
    }
}

/// State and helpers shared by both models
#[derive(Debug, Clone)]
pub(crate) struct AnalyzerCore {
    pub config: PsyConfig,
    pub mid_side: bool,
    pub channels_out: usize,
    pub history: [ChannelHistory; 4],
    pub blocktype_old: [BlockType; 2],
    ms_ratio_s_old: f32,
    ms_ratio_l_old: f32,
    adjuster: InterchannelMaskingAdjuster,
}

impl AnalyzerCore {
    pub fn new(config: &Config) -> Self {
        let ath_factor = 10f32.powf(-config.psy.ath_lower_db / 10.0);
        Self {
            config: config.psy.clone(),
            mid_side: config.wave.mode == ChannelMode::StereoMs,
            channels_out: config.channels(),
            history: Default::default(),
            blocktype_old: [BlockType::Normal; 2],
            ms_ratio_s_old: 0.0,
            ms_ratio_l_old: 0.0,
            adjuster: InterchannelMaskingAdjuster::new(config.psy.interch_ratio, config.psy.msfix, ath_factor),
        }
    }

    /// Number of analysed channels, mid and side included
    pub fn numchn(&self) -> usize {
        if self.mid_side {
            4
        } else {
            self.channels_out
        }
    }

    /// Linear threshold-in-quiet scale for the configured ATH offset
    pub fn ath_factor(&self) -> f32 {
        self.adjuster.ath_factor
    }

    /// Spectra of every analysed channel, mid/side derived from left/right
    pub fn virtual_spectra(&self, spectra: &[ChannelSpectrum]) -> Vec<ChannelSpectrum> {
        let mut out: Vec<ChannelSpectrum> = spectra.iter().take(self.channels_out).cloned().collect();
        if self.mid_side && spectra.len() >= 2 {
            let (mid, side) = ChannelSpectrum::mid_side(&spectra[0], &spectra[1]);
            out.push(mid);
            out.push(side);
        }
        out
    }

    /// Results of the previous call: (L/R ratios, M/S ratios, energies)
    pub fn delayed_ratios(&self) -> ([MaskingRatio; 2], [MaskingRatio; 2], [f32; 4]) {
        let masking = [self.history[0].ratio, self.history[1].ratio];
        let masking_ms = if self.mid_side {
            [self.history[2].ratio, self.history[3].ratio]
        } else {
            [MaskingRatio::saturated(); 2]
        };
        let energy = [
            self.history[0].tot_ener,
            self.history[1].tot_ener,
            self.history[2].tot_ener,
            self.history[3].tot_ener,
        ];
        (masking, masking_ms, energy)
    }

    /// Spread the energy of one short window and clamp it against the two previous windows
    ///
    /// `eb` and `thr` must hold one more entry than there are short partitions; the
    /// extra entry is zeroed.
    pub fn compute_masking_s(
        &mut self,
        tables: &PartitionTables,
        chn: usize,
        fftenergy_s: &[f32; HBLKSIZE_S],
        eb: &mut [f32],
        thr: &mut [f32],
    ) {
        let part = &tables.short;
        let athlower = self.ath_factor() * (BLKSIZE_S as f32 / BLKSIZE as f32);
        let rpelev = self.config.pre_echo_ratio;
        let rpelev2 = self.config.pre_echo_ratio_hysteresis;
        let prev_short = self.blocktype_old[chn & 1] == BlockType::Short;

        let mut j = 0;
        for b in 0..part.npart {
            let n = part.numlines[b];
            eb[b] = fftenergy_s[j..j + n].iter().sum();
            j += n;
        }
        eb[part.npart] = 0.0;
        thr[part.npart] = 0.0;

        let hist = &mut self.history[chn];
        for b in 0..part.npart {
            let (first, coeffs) = part.spreading.row(b);
            let ecb: f32 = coeffs.iter().zip(&eb[first..]).map(|(c, e)| c * e).sum();

            let mut t = ecb.min(rpelev * hist.nb_s1[b]);
            if prev_short {
                t = t.min(rpelev2 * hist.nb_s2[b]);
            }
            t = t.max((part.ath[b] * athlower).min(t * 2.0));
            thr[b] = t;
            hist.nb_s2[b] = hist.nb_s1[b];
            hist.nb_s1[b] = ecb;
        }
    }

    /// Settle the block type of the previous block from this block's attack flags
    pub fn block_type_set(&mut self, mut uselongblock: [bool; 2]) -> [BlockType; 2] {
        if self.config.short_blocks == ShortBlocks::Coupled
            && self.channels_out == 2
            && !(uselongblock[0] && uselongblock[1])
        {
            uselongblock = [false, false];
        }

        let mut delayed = [BlockType::Normal; 2];
        for chn in 0..self.channels_out {
            match self.config.short_blocks {
                ShortBlocks::Dispensed => uselongblock[chn] = true,
                ShortBlocks::Forced => uselongblock[chn] = false,
                ShortBlocks::Coupled | ShortBlocks::Allowed => {}
            }

            let current = if uselongblock[chn] {
                if self.blocktype_old[chn] == BlockType::Short {
                    BlockType::Stop
                } else {
                    BlockType::Normal
                }
            } else {
                match self.blocktype_old[chn] {
                    BlockType::Normal => self.blocktype_old[chn] = BlockType::Start,
                    BlockType::Stop => self.blocktype_old[chn] = BlockType::Short,
                    BlockType::Start | BlockType::Short => {}
                }
                BlockType::Short
            };

            delayed[chn] = self.blocktype_old[chn];
            if delayed[chn] != current {
                log::debug!("channel {} block type {:?} -> {:?}", chn, delayed[chn], current);
            }
            self.blocktype_old[chn] = current;
        }
        if self.channels_out == 1 {
            delayed[1] = delayed[0];
        }
        delayed
    }

    /// Interchannel adjustment of the freshly computed ratios
    pub fn adjust_interchannel(&mut self, tables: &PartitionTables) {
        let n = self.numchn();
        let mut ratios: Vec<MaskingRatio> = self.history[..n].iter().map(|h| h.ratio).collect();
        self.adjuster.adjust(tables, &mut ratios);
        for (h, r) in self.history.iter_mut().zip(ratios) {
            h.ratio = r;
        }
    }

    /// Mid/side preference from the left/right threshold difference
    ///
    /// Returns (ms_ratio for the delayed block, ms_ratio_next).
    pub fn update_ms_ratio(&mut self, delayed: [BlockType; 2]) -> (f32, f32) {
        let (mut ms_ratio_l, mut ms_ratio_s) = (0.0, 0.0);
        if self.mid_side {
            let (t0, t1) = (&self.history[0].ratio.thm, &self.history[1].ratio.thm);
            let mut sidetot = 0.0;
            let mut tot = 0.0;
            for sb in SBMAX_L / 4..SBMAX_L {
                sidetot += threshold_difference(t0.l[sb], t1.l[sb]);
                tot += 1.0;
            }
            ms_ratio_l = (sidetot / tot * 0.7f32).min(0.5);

            sidetot = 0.0;
            tot = 0.0;
            for w in 0..3 {
                for sb in SBMAX_S / 4..SBMAX_S {
                    sidetot += threshold_difference(t0.s[sb][w], t1.s[sb][w]);
                    tot += 1.0;
                }
            }
            ms_ratio_s = (sidetot / tot * 0.7f32).min(0.5);
        }

        let ms_ratio = if delayed[0] == BlockType::Short && delayed[1] == BlockType::Short {
            self.ms_ratio_s_old
        } else {
            self.ms_ratio_l_old
        };
        self.ms_ratio_s_old = ms_ratio_s;
        self.ms_ratio_l_old = ms_ratio_l;
        (ms_ratio, ms_ratio_l)
    }
}

/// Threshold difference in bels, 3 when one side is at least 30 dB above the other
fn threshold_difference(a: f32, b: f32) -> f32 {
    let x1 = a.min(b);
    let x2 = a.max(b);
    if x2 >= 1000.0 * x1 {
        3.0
    } else {
        (x2 / x1).log10()
    }
}

/// Sum of the long FFT energy above the lowest 11 bins
pub(crate) fn total_energy(fftenergy: &[f32; HBLKSIZE]) -> f32 {
    fftenergy[11..].iter().sum()
}

/// Partition energies and thresholds to long scalefactor bands
///
/// A partition straddling a band edge contributes half to each side.
pub(crate) fn partition_to_sfb_l(tables: &PartitionTables, eb: &[f32], thr: &[f32], out: &mut MaskingRatio) {
    let bo = &tables.long.bo;
    let (mut enn, mut thmm) = (0.0f32, 0.0f32);
    let mut b = 0;
    for sb in 0..SBMAX_L {
        while b < bo[sb] {
            enn += eb[b];
            thmm += thr[b];
            b += 1;
        }
        if sb == SBMAX_L - 1 {
            break;
        }
        out.en.l[sb] = enn + 0.5 * eb[b];
        out.thm.l[sb] = thmm + 0.5 * thr[b];
        enn = 0.5 * eb[b];
        thmm = 0.5 * thr[b];
        b += 1;
    }
    out.en.l[SBMAX_L - 1] = enn;
    out.thm.l[SBMAX_L - 1] = thmm;
}

/// Partition energies and thresholds of one short window to short scalefactor bands
pub(crate) fn partition_to_sfb_s(tables: &PartitionTables, eb: &[f32], thr: &[f32], window: usize, out: &mut MaskingRatio) {
    let bo = &tables.short.bo;
    let (mut enn, mut thmm) = (0.0f32, 0.0f32);
    let mut b = 0usize;
    for sb in 0..SBMAX_S {
        if sb > 0 {
            b += 1;
        }
        while b < bo[sb] {
            enn += eb[b];
            thmm += thr[b];
            b += 1;
        }
        enn += 0.5 * eb[b];
        thmm += 0.5 * thr[b];
        out.en.s[sb][window] = enn;
        out.thm.s[sb][window] = thmm;
        enn = 0.5 * eb[b];
        thmm = 0.5 * thr[b];
    }
    out.en.s[SBMAX_S - 1][window] += enn;
    out.thm.s[SBMAX_S - 1][window] += thmm;
}

/// Long-block perceptual entropy from band energies and thresholds
pub(crate) fn pecalc_l(mr: &MaskingRatio, masking_lower: f32) -> f32 {
    const REGCOEF_L: [f32; SBMAX_L - 1] = [
        6.8, 5.8, 5.8, 6.4, 6.5, 9.9, 12.1, 14.4, 15.0, 18.9, 21.6, 26.9, 34.2, 40.2, 46.8, 56.5, 60.7, 73.9, 85.7, 93.4,
        126.1,
    ];
    let mut pe = 1124.23 / 4.0;
    for (sb, &coef) in REGCOEF_L.iter().enumerate() {
        let x = mr.thm.l[sb] * masking_lower;
        if mr.thm.l[sb] <= 0.0 || mr.en.l[sb] <= x {
            continue;
        }
        pe += coef * entropy_term(mr.en.l[sb], x);
    }
    pe
}

/// Short-block perceptual entropy over the three windows
pub(crate) fn pecalc_s(mr: &MaskingRatio, masking_lower: f32) -> f32 {
    const REGCOEF_S: [f32; SBMAX_S - 1] = [11.8, 13.6, 17.2, 32.0, 46.5, 51.3, 57.5, 67.1, 71.5, 84.6, 97.6, 130.0];
    let mut pe = 1236.28 / 4.0;
    for (sb, &coef) in REGCOEF_S.iter().enumerate() {
        for w in 0..3 {
            let x = mr.thm.s[sb][w] * masking_lower;
            if mr.thm.s[sb][w] <= 0.0 || mr.en.s[sb][w] <= x {
                continue;
            }
            pe += coef * entropy_term(mr.en.s[sb][w], x);
        }
    }
    pe
}

fn entropy_term(en: f32, x: f32) -> f32 {
    if en > x * 1e10 {
        10.0 * std::f32::consts::LN_10
    } else {
        (en / x).log10()
    }
}

/// Psychoacoustic analyzer selected by configuration
#[derive(Debug)]
pub struct PsychoacousticAnalyzer {
    model: Box<dyn PsychoacousticModel>,
    channels: usize,
}

impl PsychoacousticAnalyzer {
    pub fn new(config: &Config) -> Self {
        let model: Box<dyn PsychoacousticModel> = match config.psy.strategy {
            PsyStrategy::Classical => Box::new(ClassicalModel::new(config)),
            PsyStrategy::AttackDriven => Box::new(AttackModel::new(config)),
        };
        Self {
            model,
            channels: config.channels(),
        }
    }

    pub fn strategy(&self) -> PsyStrategy {
        self.model.strategy()
    }

    /// Validate the spectra of one block and analyse them
    pub fn analyze(&mut self, ctx: &AnalysisContext<'_>, spectra: &[ChannelSpectrum]) -> InputResult<PsyGranuleResult> {
        if spectra.len() != self.channels {
            return Err(InputDataError::InvalidChannelCount {
                expected: self.channels,
                actual: spectra.len(),
            });
        }
        for (channel, spectrum) in spectra.iter().enumerate() {
            if !spectrum.has_valid_layout() {
                return Err(InputDataError::InvalidSpectrumLength {
                    channel,
                    expected: BLKSIZE,
                    actual: spectrum.long.len(),
                });
            }
            let mut values = spectrum.long.iter().chain(spectrum.short.iter().flatten());
            if let Some(index) = values.position(|v| !v.is_finite()) {
                return Err(InputDataError::NonFinite { index });
            }
        }
        Ok(self.model.analyze(ctx, spectra))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::ScalefactorBands;
    use crate::types::SfbValues;

    fn tables() -> PartitionTables {
        let bands = ScalefactorBands::for_index(0).unwrap();
        PartitionTables::new(44100, &bands, &PsyConfig::default()).unwrap()
    }

    #[test]
    fn test_block_type_pipeline() {
        let mut core = AnalyzerCore::new(&Config::default());
        assert_eq!(core.block_type_set([true, true]), [BlockType::Normal; 2]);
        // attack: the previous long block becomes a start block
        assert_eq!(core.block_type_set([false, true]), [BlockType::Start; 2]);
        assert_eq!(core.blocktype_old, [BlockType::Short; 2]);
        assert_eq!(core.block_type_set([true, true]), [BlockType::Short; 2]);
        assert_eq!(core.block_type_set([true, true]), [BlockType::Stop; 2]);
        assert_eq!(core.block_type_set([true, true]), [BlockType::Normal; 2]);
    }

    #[test]
    fn test_start_block_precedes_short() {
        let mut config = Config::default();
        config.psy.short_blocks = ShortBlocks::Allowed;
        let mut core = AnalyzerCore::new(&config);
        core.block_type_set([true, true]);
        assert_eq!(core.block_type_set([false, true]), [BlockType::Start, BlockType::Normal]);
        let delayed = core.block_type_set([true, true]);
        assert_eq!(delayed[0], BlockType::Short);
        assert_eq!(delayed[1], BlockType::Normal);
    }

    #[test]
    fn test_dispensed_short_blocks_stay_long() {
        let mut config = Config::default();
        config.psy.short_blocks = ShortBlocks::Dispensed;
        let mut core = AnalyzerCore::new(&config);
        for _ in 0..3 {
            assert_eq!(core.block_type_set([false, false]), [BlockType::Normal; 2]);
        }
    }

    #[test]
    fn test_partition_to_sfb_conserves_energy() {
        let t = tables();
        let mut eb = vec![1.0f32; t.long.npart + 1];
        let mut thr = vec![0.5f32; t.long.npart + 1];
        eb[t.long.npart] = 0.0;
        thr[t.long.npart] = 0.0;
        let mut mr = MaskingRatio::default();
        partition_to_sfb_l(&t, &eb, &thr, &mut mr);
        let total: f32 = mr.en.l.iter().sum();
        assert!(total <= t.long.npart as f32 + 1e-3);
        assert!(mr.en.l.iter().all(|&e| e >= 0.0));
        assert!(mr.thm.l.iter().zip(&mr.en.l).all(|(t, e)| (t * 2.0 - e).abs() < 1e-4));
    }

    #[test]
    fn test_pe_of_fully_masked_block_is_base_value() {
        let mr = MaskingRatio {
            en: SfbValues::filled(1.0),
            thm: SfbValues::filled(10.0),
        };
        assert!((pecalc_l(&mr, 1.0) - 1124.23 / 4.0).abs() < 1e-3);
        assert!((pecalc_s(&mr, 1.0) - 1236.28 / 4.0).abs() < 1e-3);
    }

    #[test]
    fn test_pe_grows_with_unmasked_energy() {
        let quiet = MaskingRatio {
            en: SfbValues::filled(10.0),
            thm: SfbValues::filled(1.0),
        };
        let loud = MaskingRatio {
            en: SfbValues::filled(1000.0),
            thm: SfbValues::filled(1.0),
        };
        assert!(pecalc_l(&loud, 1.0) > pecalc_l(&quiet, 1.0));
    }

    #[test]
    fn test_threshold_difference_is_capped() {
        assert_eq!(threshold_difference(1.0, 5000.0), 3.0);
        assert!((threshold_difference(10.0, 100.0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_analyzer_rejects_wrong_channel_count() {
        let t = tables();
        let mut analyzer = PsychoacousticAnalyzer::new(&Config::default());
        let ctx = AnalysisContext {
            tables: &t,
            pcfact: 1.0,
            masking_lower: 1.0,
        };
        let result = analyzer.analyze(&ctx, &[ChannelSpectrum::silent()]);
        assert!(matches!(
            result,
            Err(InputDataError::InvalidChannelCount { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn test_analyzer_rejects_non_finite_input() {
        let t = tables();
        let mut analyzer = PsychoacousticAnalyzer::new(&Config::default());
        let ctx = AnalysisContext {
            tables: &t,
            pcfact: 1.0,
            masking_lower: 1.0,
        };
        let mut bad = ChannelSpectrum::silent();
        bad.long[17] = f32::NAN;
        let result = analyzer.analyze(&ctx, &[ChannelSpectrum::silent(), bad]);
        assert!(matches!(result, Err(InputDataError::NonFinite { index: 17 })));
    }
}
