//! Attack-driven model
//!
//! Block switching comes from peak ratios of nine sub-blocks of the high-passed
//! signal. Tonality is estimated from spectral peakiness inside neighbouring
//! partitions, and partition contributions are added with a nonlinear masking law
//! instead of a plain sum.

use super::{
    partition_to_sfb_l, partition_to_sfb_s, pecalc_l, pecalc_s, total_energy, AnalysisContext, AnalyzerCore,
    PsyGranuleResult, PsychoacousticModel,
};
use crate::config::{Config, PsyStrategy};
use crate::partition::PartitionTables;
use crate::types::{BlockType, ChannelSpectrum, MaskingRatio, CBANDS, HBLKSIZE, HBLKSIZE_S, SBMAX_S};

const NS_PREECHO_ATT0: f32 = 0.8;
const NS_PREECHO_ATT1: f32 = 0.6;
const NS_PREECHO_ATT2: f32 = 0.3;

/// Masking offset per peakiness step, 0 dB down to -9.3 dB
const PEAKINESS_OFFSET: [f32; 9] = [1.0, 0.79433, 0.63096, 0.63096, 0.63096, 0.63096, 0.63096, 0.25119, 0.11749];
/// Fixed -8 dB applied after the masking addition
const MASK_OFFSET: f32 = 0.158_489_32;

/// 10^(9/16): ratio beyond which close maskers add linearly
const MA_MAX_I1: f32 = 3.651_741_4;
/// 10^(24/16): ratio beyond which any maskers add linearly
const MA_MAX_I2: f32 = 31.622_776;
/// 10^1.5: level above the threshold in quiet where the full boost applies
const MA_MAX_M: f32 = 31.622_776;

const MASK_ADD_TABLE1: [f32; 25] = [
    3.3246 * 3.3246,
    3.23837 * 3.23837,
    3.15437 * 3.15437,
    3.00412 * 3.00412,
    2.86103 * 2.86103,
    2.65407 * 2.65407,
    2.46209 * 2.46209,
    2.284 * 2.284,
    2.11879 * 2.11879,
    1.96552 * 1.96552,
    1.82335 * 1.82335,
    1.69146 * 1.69146,
    1.56911 * 1.56911,
    1.46658 * 1.46658,
    1.37074 * 1.37074,
    1.31036 * 1.31036,
    1.25264 * 1.25264,
    1.20648 * 1.20648,
    1.16203 * 1.16203,
    1.12765 * 1.12765,
    1.09428 * 1.09428,
    1.0659 * 1.0659,
    1.03826 * 1.03826,
    1.01895 * 1.01895,
    1.0,
];

const MASK_ADD_TABLE2: [f32; 10] = [
    1.33352 * 1.33352,
    1.35879 * 1.35879,
    1.38454 * 1.38454,
    1.39497 * 1.39497,
    1.40548 * 1.40548,
    1.3537 * 1.3537,
    1.30382 * 1.30382,
    1.22321 * 1.22321,
    1.14758 * 1.14758,
    1.0,
];

const MASK_ADD_TABLE3: [f32; 14] = [
    2.35364 * 2.35364,
    2.29259 * 2.29259,
    2.23313 * 2.23313,
    2.12675 * 2.12675,
    2.02545 * 2.02545,
    1.87894 * 1.87894,
    1.74303 * 1.74303,
    1.61695 * 1.61695,
    1.49999 * 1.49999,
    1.39148 * 1.39148,
    1.29083 * 1.29083,
    1.19746 * 1.19746,
    1.11084 * 1.11084,
    1.03826 * 1.03826,
];

/// Geometric interpolation x^r * y^(1-r)
pub(crate) fn ns_interp(x: f32, y: f32, r: f32) -> f32 {
    if r == 1.0 {
        return x;
    }
    if r == 0.0 {
        return y;
    }
    if y > 0.0 {
        return (x / y).powf(r) * y;
    }
    0.0
}

/// Nonlinear addition of two maskers
///
/// `distance` is the partition distance between masker and maskee, `ath` the
/// threshold in quiet of partition `k`. The result is never below `m1 + m2`.
pub(crate) fn mask_add(m1: f32, m2: f32, distance: isize, ath: f32) -> f32 {
    let ratio = if m2 > m1 {
        if m2 >= m1 * MA_MAX_I2 {
            return m1 + m2;
        }
        m2 / m1
    } else {
        if m1 >= m2 * MA_MAX_I2 {
            return m1 + m2;
        }
        m1 / m2
    };

    let sum = m1 + m2;
    if (-3..=3).contains(&distance) {
        if ratio >= MA_MAX_I1 {
            return sum;
        }
        let i = ((16.0 * ratio.log10()) as usize).min(MASK_ADD_TABLE2.len() - 1);
        return sum * MASK_ADD_TABLE2[i];
    }

    let i = ((16.0 * ratio.log10()) as usize).min(MASK_ADD_TABLE1.len() - 1);
    if sum < MA_MAX_M * ath {
        if sum > ath {
            let f = MASK_ADD_TABLE3.get(i).copied().unwrap_or(1.0);
            let r = (10.0 / 15.0) * (sum / ath).log10();
            return sum * ((MASK_ADD_TABLE1[i] - f) * r + f);
        }
        return sum * MASK_ADD_TABLE3.get(i).copied().unwrap_or(1.0);
    }
    sum * MASK_ADD_TABLE1[i]
}

/// Outcome of the attack detector for one channel
#[derive(Debug, Clone, Copy, PartialEq)]
struct AttackDecision {
    use_long: bool,
    /// Attack position per third: 0 none, 1..=3 sub-block; entry 0 is the tail of the previous block
    attacks: [u8; 4],
    /// Sub-block peaks: three of the previous block, then nine of this one
    en_subshort: [f32; 12],
}

/// Attack-detection psychoacoustic model
#[derive(Debug, Clone)]
pub struct AttackModel {
    core: AnalyzerCore,
    last_en_subshort: [[f32; 9]; 4],
    last_attacks: [u8; 4],
}

impl AttackModel {
    pub fn new(config: &Config) -> Self {
        Self {
            core: AnalyzerCore::new(config),
            last_en_subshort: [[10.0; 9]; 4],
            last_attacks: [0; 4],
        }
    }

    /// Sub-block peaks of a channel
    ///
    /// Without a time-domain envelope, each short window's high-half magnitude
    /// stands in for its three sub-blocks.
    fn envelope(spec: &ChannelSpectrum, fft_s: &[[f32; HBLKSIZE_S]; 3]) -> [f32; 9] {
        if let Some(envelope) = spec.attack_envelope {
            return envelope;
        }
        let mut envelope = [0.0f32; 9];
        for (w, energies) in fft_s.iter().enumerate() {
            let peak = energies[HBLKSIZE_S / 2..].iter().sum::<f32>().sqrt();
            for e in &mut envelope[w * 3..w * 3 + 3] {
                *e = peak;
            }
        }
        envelope
    }

    fn detect_attacks(&mut self, chn: usize, envelope: &[f32; 9]) -> AttackDecision {
        let threshold = if chn == 3 {
            self.core.config.attack_threshold_short
        } else {
            self.core.config.attack_threshold
        };
        let last = &mut self.last_en_subshort[chn];
        let mut en_subshort = [0.0f32; 12];
        let mut en_short = [0.0f32; 4];
        let mut intensity = [0.0f32; 12];

        for i in 0..3 {
            en_subshort[i] = last[i + 6];
            intensity[i] = en_subshort[i] / last[i + 4];
            en_short[0] += en_subshort[i];
        }

        for (i, &peak) in envelope.iter().enumerate() {
            let p = peak.max(1.0);
            last[i] = p;
            en_subshort[i + 3] = p;
            en_short[1 + i / 3] += p;

            let before = en_subshort[i + 1];
            intensity[i + 3] = if p > before {
                p / before
            } else if before > p * 10.0 {
                before / (p * 10.0)
            } else {
                0.0
            };
        }

        let mut attacks = [0u8; 4];
        for (i, &x) in intensity.iter().enumerate() {
            if attacks[i / 3] == 0 && x > threshold {
                attacks[i / 3] = (i % 3) as u8 + 1;
            }
        }

        // periodic signals show no energy change between thirds
        for i in 1..4 {
            let ratio = if en_short[i - 1] > en_short[i] {
                en_short[i - 1] / en_short[i]
            } else {
                en_short[i] / en_short[i - 1]
            };
            if ratio < 1.7 {
                attacks[i] = 0;
                if i == 1 {
                    attacks[0] = 0;
                }
            }
        }

        if attacks[0] != 0 && self.last_attacks[chn] != 0 {
            attacks[0] = 0;
        }

        let mut use_long = true;
        if self.last_attacks[chn] == 3 || attacks.iter().any(|&a| a != 0) {
            use_long = false;
            for i in 1..4 {
                if attacks[i] != 0 && attacks[i - 1] != 0 {
                    attacks[i] = 0;
                }
            }
        }

        if !use_long {
            log::trace!("channel {} attacks {:?}", chn, attacks);
        }
        AttackDecision {
            use_long,
            attacks,
            en_subshort,
        }
    }

    /// Short-window thresholds with pre-echo control around detected attacks
    fn short_masking(
        &mut self,
        tables: &PartitionTables,
        chn: usize,
        fft_s: &[[f32; HBLKSIZE_S]; 3],
        decision: &AttackDecision,
        pcfact: f32,
    ) {
        let mut eb = [0.0f32; CBANDS + 1];
        let mut thr = [0.0f32; CBANDS + 1];
        let mut bands = MaskingRatio::default();
        let mut ratio = self.core.history[chn].ratio;
        let attacks = &decision.attacks;
        let last_attack = self.last_attacks[chn];

        for (sblock, energies) in fft_s.iter().enumerate() {
            self.core.compute_masking_s(tables, chn, energies, &mut eb, &mut thr);
            partition_to_sfb_s(tables, &eb, &thr, sblock, &mut bands);

            let sub = &decision.en_subshort[sblock * 3 + 3..sblock * 3 + 6];
            let sub_total: f32 = sub.iter().sum();
            let prev = if sblock != 0 { sblock - 1 } else { 2 };
            let next = if sblock != 2 { sblock + 1 } else { 0 };

            for sb in 0..SBMAX_S {
                let mut thmm = bands.thm.s[sb][sblock] * NS_PREECHO_ATT0;

                if attacks[sblock] >= 2 || attacks[sblock + 1] == 1 {
                    thmm = thmm.min(ns_interp(ratio.thm.s[sb][prev], thmm, NS_PREECHO_ATT1 * pcfact));
                }
                let follows_late_attack = if sblock != 0 {
                    attacks[sblock - 1] == 3
                } else {
                    last_attack == 3
                };
                if attacks[sblock] == 1 {
                    thmm = thmm.min(ns_interp(ratio.thm.s[sb][prev], thmm, NS_PREECHO_ATT2 * pcfact));
                } else if follows_late_attack {
                    thmm = thmm.min(ns_interp(ratio.thm.s[sb][next], thmm, NS_PREECHO_ATT2 * pcfact));
                }

                // pulse-like signals
                if sub[2] * 6.0 < sub_total {
                    thmm *= 0.5;
                    if sub[1] * 6.0 < sub_total {
                        thmm *= 0.5;
                    }
                }

                ratio.en.s[sb][sblock] = bands.en.s[sb][sblock];
                ratio.thm.s[sb][sblock] = thmm;
            }
        }
        self.core.history[chn].ratio = ratio;
    }

    /// Long-block thresholds from peakiness-weighted energies
    fn long_masking(&mut self, tables: &PartitionTables, chn: usize, fft: &[f32; HBLKSIZE], pcfact: f32) {
        let part = &tables.long;
        let npart = part.npart;
        let mut eb = [0.0f32; CBANDS + 1];
        let mut thr = [0.0f32; CBANDS + 1];
        let mut max = [0.0f32; CBANDS];
        let mut avg = [0.0f32; CBANDS];

        let mut j = 0;
        for b in 0..npart {
            let lines = &fft[j..j + part.numlines[b]];
            eb[b] = lines.iter().sum();
            max[b] = lines.iter().copied().fold(0.0, f32::max);
            avg[b] = eb[b] * part.rnumlines[b];
            j += part.numlines[b];
        }

        let mut eb2 = [0.0f32; CBANDS];
        for b in 0..npart {
            let lo = b.saturating_sub(1);
            let hi = (b + 1).min(npart - 1);
            let a: f32 = avg[lo..=hi].iter().sum();
            if a == 0.0 {
                continue;
            }
            let m = max[lo..=hi].iter().copied().fold(0.0, f32::max);
            let n = (hi - lo + 1) as f32;
            let lines: usize = part.numlines[lo..=hi].iter().sum();
            let k = 20.0 * (m * n - a) / (a * (lines as f32 - 1.0));
            let k = (k.max(0.0) as usize).min(PEAKINESS_OFFSET.len() - 1);
            eb2[b] = eb[b] * PEAKINESS_OFFSET[k];
        }

        let rpelev = self.core.config.pre_echo_ratio;
        let rpelev2 = self.core.config.pre_echo_ratio_hysteresis;
        let prev_short = self.core.blocktype_old[chn & 1] == BlockType::Short;
        let ath_factor = self.core.ath_factor();
        let hist = &mut self.core.history[chn];

        for b in 0..npart {
            let (first, coeffs) = part.spreading.row(b);
            let mut ecb = coeffs.first().map_or(0.0, |c| c * eb2[first]);
            for (i, c) in coeffs.iter().enumerate().skip(1) {
                let kk = first + i;
                ecb = mask_add(ecb, c * eb2[kk], kk as isize - b as isize, part.ath[kk] * ath_factor);
            }
            ecb *= MASK_OFFSET;

            thr[b] = if prev_short {
                ecb
            } else {
                let clamped = ecb.min(rpelev * hist.nb_1[b]).min(rpelev2 * hist.nb_2[b]);
                ns_interp(clamped, ecb, pcfact)
            };
            hist.nb_2[b] = hist.nb_1[b];
            hist.nb_1[b] = ecb;
        }

        partition_to_sfb_l(tables, &eb, &thr, &mut hist.ratio);
    }
}

impl PsychoacousticModel for AttackModel {
    fn analyze(&mut self, ctx: &AnalysisContext<'_>, spectra: &[ChannelSpectrum]) -> PsyGranuleResult {
        let tables = ctx.tables;
        let (masking, masking_ms, energy) = self.core.delayed_ratios();
        let virtual_spectra = self.core.virtual_spectra(spectra);

        let mut uselongblock = [true; 2];
        for (chn, spec) in virtual_spectra.iter().enumerate() {
            let fft = spec.long_energy();
            let fft_s = spec.short_energy();
            self.core.history[chn].tot_ener = total_energy(&fft);

            let envelope = Self::envelope(spec, &fft_s);
            let decision = self.detect_attacks(chn, &envelope);
            if chn < 2 {
                uselongblock[chn] = decision.use_long;
            } else if !decision.use_long {
                uselongblock = [false, false];
            }

            self.short_masking(tables, chn, &fft_s, &decision, ctx.pcfact);
            self.last_attacks[chn] = decision.attacks[2];
            self.long_masking(tables, chn, &fft, ctx.pcfact);
        }

        self.core.adjust_interchannel(tables);
        let block_type = self.core.block_type_set(uselongblock);
        let (ms_ratio, ms_ratio_next) = self.core.update_ms_ratio(block_type);

        let entropy = |mr: &MaskingRatio, short: bool| {
            if short {
                pecalc_s(mr, ctx.masking_lower)
            } else {
                pecalc_l(mr, ctx.masking_lower)
            }
        };
        let mut pe = [0.0f32; 2];
        for chn in 0..self.core.channels_out {
            pe[chn] = entropy(&masking[chn], block_type[chn] == BlockType::Short);
        }
        let mut pe_ms = [0.0f32; 2];
        if self.core.mid_side {
            let short = block_type.contains(&BlockType::Short);
            for (p, mr) in pe_ms.iter_mut().zip(&masking_ms) {
                *p = entropy(mr, short);
            }
        }

        PsyGranuleResult {
            masking,
            masking_ms,
            pe,
            pe_ms,
            energy,
            block_type,
            ms_ratio,
            ms_ratio_next,
        }
    }

    fn strategy(&self) -> PsyStrategy {
        PsyStrategy::AttackDriven
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelMode;
    use crate::tables::ScalefactorBands;
    use proptest::prelude::*;

    fn lr_config() -> Config {
        let mut config = Config::default();
        config.wave.mode = ChannelMode::StereoLr;
        config
    }

    fn tables(config: &Config) -> PartitionTables {
        let bands = ScalefactorBands::for_index(0).unwrap();
        PartitionTables::new(44100, &bands, &config.psy).unwrap()
    }

    fn with_envelope(envelope: [f32; 9]) -> ChannelSpectrum {
        ChannelSpectrum {
            attack_envelope: Some(envelope),
            ..ChannelSpectrum::silent()
        }
    }

    fn run(model: &mut AttackModel, t: &PartitionTables, spectra: &[ChannelSpectrum]) -> PsyGranuleResult {
        let ctx = AnalysisContext {
            tables: t,
            pcfact: 1.0,
            masking_lower: 1.0,
        };
        model.analyze(&ctx, spectra)
    }

    #[test]
    fn test_interp_endpoints() {
        assert_eq!(ns_interp(4.0, 9.0, 1.0), 4.0);
        assert_eq!(ns_interp(4.0, 9.0, 0.0), 9.0);
        assert!((ns_interp(4.0, 9.0, 0.5) - 6.0).abs() < 1e-5);
        assert_eq!(ns_interp(4.0, 0.0, 0.5), 0.0);
    }

    #[test]
    fn test_mask_add_of_silence_is_silence() {
        assert_eq!(mask_add(0.0, 0.0, 5, 1.0), 0.0);
        assert_eq!(mask_add(3.0, 0.0, 5, 1.0), 3.0);
        assert_eq!(mask_add(0.0, 3.0, 1, 1.0), 3.0);
    }

    #[test]
    fn test_first_call_entropy_is_base_value() {
        let config = lr_config();
        let t = tables(&config);
        let mut model = AttackModel::new(&config);
        let result = run(&mut model, &t, &[ChannelSpectrum::silent(), ChannelSpectrum::silent()]);
        assert!((result.pe[0] - 1124.23 / 4.0).abs() < 1e-3);
        assert_eq!(result.pe_ms, [0.0, 0.0]);
    }

    #[test]
    fn test_silence_never_triggers_attacks() {
        let config = Config::default();
        let t = tables(&config);
        let mut model = AttackModel::new(&config);
        let silent = [ChannelSpectrum::silent(), ChannelSpectrum::silent()];
        for _ in 0..4 {
            let result = run(&mut model, &t, &silent);
            assert_eq!(result.block_type, [BlockType::Normal; 2]);
            assert!(result.pe.iter().chain(&result.pe_ms).all(|p| p.is_finite()));
            assert!(result.masking[0].thm.s.iter().flatten().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn test_late_peak_switches_to_short_blocks() {
        let config = lr_config();
        let t = tables(&config);
        let mut model = AttackModel::new(&config);
        let steady = with_envelope([100.0; 9]);
        // the jump from the initial history counts as an attack
        run(&mut model, &t, &[steady.clone(), steady.clone()]);
        run(&mut model, &t, &[steady.clone(), steady.clone()]);
        let result = run(&mut model, &t, &[steady.clone(), steady.clone()]);
        assert_eq!(result.block_type, [BlockType::Stop; 2]);

        let mut peak = [100.0; 9];
        peak[8] = 5000.0;
        let attack = with_envelope(peak);
        let result = run(&mut model, &t, &[attack.clone(), steady]);
        assert_eq!(result.block_type, [BlockType::Start; 2]);
    }

    #[test]
    fn test_periodic_peaks_are_not_attacks() {
        let mut model = AttackModel::new(&lr_config());
        let pulses = [100.0, 1000.0, 100.0, 100.0, 1000.0, 100.0, 100.0, 1000.0, 100.0];
        model.detect_attacks(0, &pulses);
        let decision = model.detect_attacks(0, &pulses);
        assert_eq!(decision.attacks[1..], [0, 0, 0]);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 100,
            failure_persistence: None,
            .. ProptestConfig::default()
        })]

        #[test]
        fn test_mask_add_never_below_sum(
            m1 in 0.0f32..1e6,
            m2 in 0.0f32..1e6,
            distance in -10isize..10,
            ath in 1e-3f32..1e3,
        ) {
            let sum = m1 + m2;
            prop_assert!(mask_add(m1, m2, distance, ath) >= sum * 0.9999);
        }
    }
}
