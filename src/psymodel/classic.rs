//! Classical model: tonality from phase prediction across consecutive blocks

use super::{
    partition_to_sfb_l, partition_to_sfb_s, total_energy, AnalysisContext, AnalyzerCore, PsyGranuleResult,
    PsychoacousticModel,
};
use crate::config::{Config, PsyStrategy};
use crate::partition::{PartitionTables, CW_LOWER_INDEX};
use crate::types::{
    BlockType, ChannelSpectrum, MaskingRatio, BLKSIZE, BLKSIZE_S, CBANDS, HBLKSIZE, HBLKSIZE_S, LN_TO_LOG10,
};

/// Tonality index from the log of the unpredictability
const CONV1: f32 = -0.299;
const CONV2: f32 = -0.43;
/// Unpredictability assumed above the analysed range
const CW_DEFAULT: f32 = 0.4;
/// Bound on the tonality reduction relative to the partition one octave below
const TONALITY_PATCH_RATIO: f32 = 1.869_942_2;

/// Magnitudes and components of the two previous long blocks, low bins only
#[derive(Debug, Clone, Copy, Default)]
struct PhaseHistory {
    ax: [[f32; CW_LOWER_INDEX]; 2],
    bx: [[f32; CW_LOWER_INDEX]; 2],
    rx: [[f32; CW_LOWER_INDEX]; 2],
}

/// Phase-prediction psychoacoustic model
#[derive(Debug, Clone)]
pub struct ClassicalModel {
    core: AnalyzerCore,
    phase: [PhaseHistory; 4],
    prv_ton_red: [[f32; CBANDS]; 4],
}

impl ClassicalModel {
    pub fn new(config: &Config) -> Self {
        Self {
            core: AnalyzerCore::new(config),
            phase: [PhaseHistory::default(); 4],
            prv_ton_red: [[1.0; CBANDS]; 4],
        }
    }

    /// Unpredictability of every long bin: low bins predicted from the two previous
    /// long blocks, higher bins from the three short windows of this block
    fn unpredictability(
        &mut self,
        chn: usize,
        spec: &ChannelSpectrum,
        fft: &[f32; HBLKSIZE],
        fft_s: &[[f32; HBLKSIZE_S]; 3],
        cw_upper: usize,
    ) -> [f32; HBLKSIZE] {
        let mut cw = [CW_DEFAULT; HBLKSIZE];
        let w = &spec.long;
        let h = &mut self.phase[chn];

        for j in 0..CW_LOWER_INDEX {
            let a2 = h.ax[1][j];
            let b2 = h.bx[1][j];
            let mut r2 = h.rx[1][j];
            let mut r1 = h.rx[0][j];
            h.rx[1][j] = r1;

            let (mut den, mut numre, mut numim) = if r1 != 0.0 {
                let a1 = h.ax[0][j];
                let b1 = h.bx[0][j];
                h.ax[1][j] = a1;
                h.bx[1][j] = b1;
                (r1 * r1, a1 * b1, r1 * r1 - b1 * b1)
            } else {
                (1.0, 1.0, 0.0)
            };

            if r2 != 0.0 {
                let tmp2 = (numim + numre) * (a2 + b2) * 0.5;
                let tmp1 = -a2 * numre + tmp2;
                numre = -b2 * numim + tmp2;
                numim = tmp1;
                den *= r2;
            }

            r1 = 2.0 * r1 - r2;
            r2 = fft[j].sqrt();
            h.rx[0][j] = r2;
            r2 += r1.abs();
            if r2 != 0.0 {
                let an = w[j];
                let bn = if j == 0 { w[0] } else { w[BLKSIZE - j] };
                h.ax[0][j] = an;
                h.bx[0][j] = bn;
                let d = if den != 0.0 { r1 / den * 2.0 } else { 0.0 };
                numre = (an + bn) - numre * d;
                numim = (an - bn) - numim * d;
                r2 = (numre * numre + numim * numim).sqrt() / (2.0 * r2);
            }
            cw[j] = r2;
        }

        let (ws0, ws1, ws2) = (&spec.short[0], &spec.short[1], &spec.short[2]);
        for j in (CW_LOWER_INDEX..cw_upper).step_by(4) {
            let k = (j + 2) / 4;

            let mut r1 = fft_s[0][k];
            let (mut den, mut numre, mut numim) = if r1 != 0.0 {
                let a1 = ws0[k];
                let b1 = ws0[BLKSIZE_S - k];
                let parts = (r1, a1 * b1, r1 - b1 * b1);
                r1 = r1.sqrt();
                parts
            } else {
                (1.0, 1.0, 0.0)
            };

            let mut r2 = fft_s[2][k];
            if r2 != 0.0 {
                let a2 = ws2[k];
                let b2 = ws2[BLKSIZE_S - k];
                let tmp2 = (numim + numre) * (a2 + b2) * 0.5;
                let tmp1 = -a2 * numre + tmp2;
                numre = -b2 * numim + tmp2;
                numim = tmp1;
                r2 = r2.sqrt();
                den *= r2;
            }

            let predicted = 2.0 * r1 - r2;
            let mut rn = fft_s[1][k].sqrt() + predicted.abs();
            if rn != 0.0 {
                let an = ws1[k];
                let bn = ws1[BLKSIZE_S - k];
                let d = if den != 0.0 { predicted / den * 2.0 } else { 0.0 };
                numre = (an + bn) - numre * d;
                numim = (an - bn) - numim * d;
                rn = (numre * numre + numim * numim).sqrt() / (2.0 * rn);
            }
            for c in &mut cw[j..(j + 4).min(HBLKSIZE)] {
                *c = rn;
            }
        }
        cw
    }

    /// Tonality-weighted offset of one partition, as a linear factor
    fn tonality_reduction(&self, ecb: f32, ctb: f32) -> f32 {
        let (nmt, tmn) = (self.core.config.nmt_db, self.core.config.tmn_db);
        if ecb == 0.0 {
            return (-LN_TO_LOG10 * nmt).exp();
        }
        let tbb = CONV1 + CONV2 * (ctb / ecb).ln();
        if tbb.is_nan() || tbb < 0.0 {
            (-LN_TO_LOG10 * nmt).exp()
        } else if tbb > 1.0 {
            (-LN_TO_LOG10 * tmn).exp()
        } else {
            (-LN_TO_LOG10 * ((tmn - nmt) * tbb + nmt)).exp()
        }
    }

    /// Long-block thresholds and entropy of one channel, stored in its history
    fn analyze_long(&mut self, tables: &PartitionTables, chn: usize, fft: &[f32; HBLKSIZE], cw: &[f32; HBLKSIZE]) {
        let part = &tables.long;
        let mut eb = [0.0f32; CBANDS + 1];
        let mut cb = [0.0f32; CBANDS + 1];
        let mut thr = [0.0f32; CBANDS + 1];

        let mut j = 0;
        for b in 0..part.npart {
            let n = part.numlines[b];
            eb[b] = fft[j..j + n].iter().sum();
            cb[b] = fft[j..j + n].iter().zip(&cw[j..j + n]).map(|(e, c)| e * c).sum();
            j += n;
        }

        let rpelev = self.core.config.pre_echo_ratio;
        let rpelev2 = self.core.config.pre_echo_ratio_hysteresis;
        let prev_short = self.core.blocktype_old[chn & 1] == BlockType::Short;
        let ath_factor = self.core.ath_factor();
        let mut pe = 0.0f32;

        for b in 0..part.npart {
            let (first, coeffs) = part.spreading.row(b);
            let (mut ecb, mut ctb) = (0.0f32, 0.0f32);
            for (k, c) in coeffs.iter().enumerate() {
                ecb += c * eb[first + k];
                ctb += c * cb[first + k];
            }

            let mut tbb = self.tonality_reduction(ecb, ctb).min(tables.minval[b]);
            if self.core.config.tonality_patch && b > 5 {
                tbb = tbb.min(self.prv_ton_red[chn][b / 2] * TONALITY_PATCH_RATIO);
            }
            self.prv_ton_red[chn][b] = tbb;
            ecb *= tbb;

            let hist = &mut self.core.history[chn];
            let mut t = ecb.min(rpelev * hist.nb_1[b]);
            if !prev_short && t > rpelev2 * hist.nb_2[b] {
                t = rpelev2 * hist.nb_2[b];
            }
            thr[b] = t;
            hist.nb_2[b] = hist.nb_1[b];
            hist.nb_1[b] = ecb;

            let e = t.max(part.ath[b] * ath_factor);
            if e > 0.0 && e < eb[b] {
                pe -= part.numlines[b] as f32 * (e / eb[b]).ln();
            }
        }

        let hist = &mut self.core.history[chn];
        hist.pe = pe;
        partition_to_sfb_l(tables, &eb, &thr, &mut hist.ratio);
    }

    /// Short-window energies decide whether this block wants short windows
    fn wants_long_block(&mut self, chn: usize, fft_s: &[[f32; HBLKSIZE_S]; 3]) -> bool {
        let high: Vec<f32> = fft_s.iter().map(|w| w[HBLKSIZE_S / 2..].iter().sum()).collect();
        let mn = high.iter().copied().fold(f32::MAX, f32::min);
        let mx = high.iter().copied().fold(0.0f32, f32::max);

        let hist = &mut self.core.history[chn];
        if mx > mn {
            hist.pe = hist.pe.max(400.0 * (mx / (1e-12 + mn)).ln());
        }
        let pe = hist.pe;
        !(pe > 3000.0 || mx > 30.0 * mn || (mx > 10.0 * mn && pe > 1000.0))
    }
}

impl PsychoacousticModel for ClassicalModel {
    fn analyze(&mut self, ctx: &AnalysisContext<'_>, spectra: &[ChannelSpectrum]) -> PsyGranuleResult {
        let tables = ctx.tables;
        let (masking, masking_ms, energy) = self.core.delayed_ratios();
        let pe_prev: Vec<f32> = self.core.history.iter().map(|h| h.pe).collect();
        let virtual_spectra = self.core.virtual_spectra(spectra);

        let mut uselongblock = [true; 2];
        let mut eb_s = [0.0f32; CBANDS + 1];
        let mut thr_s = [0.0f32; CBANDS + 1];
        for (chn, spec) in virtual_spectra.iter().enumerate() {
            let fft = spec.long_energy();
            let fft_s = spec.short_energy();
            self.core.history[chn].tot_ener = total_energy(&fft);

            let cw = self.unpredictability(chn, spec, &fft, &fft_s, tables.cw_upper_index);
            self.analyze_long(tables, chn, &fft, &cw);

            let use_long = self.wants_long_block(chn, &fft_s);
            if chn < 2 {
                uselongblock[chn] = use_long;
            }

            let mut ratio: MaskingRatio = self.core.history[chn].ratio;
            for (sblock, energies) in fft_s.iter().enumerate() {
                self.core.compute_masking_s(tables, chn, energies, &mut eb_s, &mut thr_s);
                partition_to_sfb_s(tables, &eb_s, &thr_s, sblock, &mut ratio);
            }
            self.core.history[chn].ratio = ratio;
        }

        self.core.adjust_interchannel(tables);
        let block_type = self.core.block_type_set(uselongblock);
        let (ms_ratio, ms_ratio_next) = self.core.update_ms_ratio(block_type);

        PsyGranuleResult {
            masking,
            masking_ms,
            pe: [pe_prev[0], pe_prev[1]],
            pe_ms: [pe_prev[2], pe_prev[3]],
            energy,
            block_type,
            ms_ratio,
            ms_ratio_next,
        }
    }

    fn strategy(&self) -> PsyStrategy {
        PsyStrategy::Classical
    }
}
