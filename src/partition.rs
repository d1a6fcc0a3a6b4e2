//! Bark-scale partition model
//!
//! Built once per encoder instance: groups FFT bins into partitions roughly a third
//! of a bark wide, maps scalefactor bands onto partitions, and precomputes the
//! sparse spreading-function matrix and the per-partition threshold in quiet.

use crate::ath::{ath_formula, freq2bark, SfbAth};
use crate::config::{AthType, PsyConfig};
use crate::error::{SetupError, SetupResult};
use crate::tables::ScalefactorBands;
use crate::types::{BLKSIZE, BLKSIZE_S, CBANDS, GRANULE_SIZE, HBLKSIZE, SBMAX_L, SBMAX_S};

/// Partition width in bark
const DELBARK: f32 = 0.34;
/// Bins below this index use the long-window unpredictability
pub const CW_LOWER_INDEX: usize = 6;
/// Sustain time of temporal masking between short windows
const TEMPORAL_MASK_SUSTAIN_SEC: f32 = 0.01;

/// Spreading function in energy units, normalized to unit area over the bark axis
fn s3_func(bark: f32) -> f32 {
    let mut tempx = if bark >= 0.0 { bark * 3.0 } else { bark * 1.5 };
    let x = if (0.5..=2.5).contains(&tempx) {
        let temp = tempx - 0.5;
        8.0 * (temp * temp - 2.0 * temp)
    } else {
        0.0
    };
    tempx += 0.474;
    let tempy = 15.811_389 + 7.5 * tempx - 17.5 * (1.0 + tempx * tempx).sqrt();
    if tempy <= -60.0 {
        return 0.0;
    }
    ((x + tempy) * crate::types::LN_TO_LOG10).exp() / 0.660_919_3
}

/// Sparse row-compressed spreading matrix: for every maskee partition the range
/// of masker partitions with a nonzero coefficient
#[derive(Debug, Clone, PartialEq)]
pub struct SpreadingMatrix {
    ranges: Vec<(usize, usize)>,
    offsets: Vec<usize>,
    coeffs: Vec<f32>,
}

impl SpreadingMatrix {
    fn build(bval: &[f32], bval_width: &[f32], norm: &[f32]) -> SetupResult<Self> {
        let npart = bval.len();
        let dense: Vec<Vec<f32>> = (0..npart)
            .map(|i| {
                (0..npart)
                    .map(|j| s3_func(bval[i] - bval[j]) * bval_width[j] * norm[i])
                    .collect()
            })
            .collect();

        let mut ranges = Vec::with_capacity(npart);
        let mut requested = 0;
        for row in &dense {
            let first = row.iter().position(|&v| v != 0.0);
            let last = row.iter().rposition(|&v| v != 0.0);
            match (first, last) {
                (Some(first), Some(last)) => {
                    requested += last - first + 1;
                    ranges.push((first, last + 1));
                }
                _ => ranges.push((0, 0)),
            }
        }

        let mut coeffs = Vec::new();
        coeffs
            .try_reserve_exact(requested)
            .map_err(|_| SetupError::SpreadingTableAllocation { requested })?;
        let mut offsets = Vec::with_capacity(npart);
        for (row, &(first, end)) in dense.iter().zip(&ranges) {
            offsets.push(coeffs.len());
            coeffs.extend_from_slice(&row[first..end]);
        }

        Ok(Self { ranges, offsets, coeffs })
    }

    /// First masker index and the coefficients of maskee `b`
    pub fn row(&self, b: usize) -> (usize, &[f32]) {
        let (first, end) = self.ranges[b];
        let offset = self.offsets[b];
        (first, &self.coeffs[offset..offset + (end - first)])
    }

    /// Number of stored coefficients
    pub fn len(&self) -> usize {
        self.coeffs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coeffs.is_empty()
    }

    /// Spread `values` onto every partition with a plain weighted sum
    pub fn convolve(&self, values: &[f32], out: &mut [f32]) {
        for (b, o) in out.iter_mut().enumerate().take(self.ranges.len()) {
            let (first, coeffs) = self.row(b);
            *o = coeffs.iter().zip(&values[first..]).map(|(c, v)| c * v).sum();
        }
    }
}

/// Partitioning of one FFT length
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionBands {
    /// Number of partitions in use
    pub npart: usize,
    /// FFT bins per partition
    pub numlines: Vec<usize>,
    pub rnumlines: Vec<f32>,
    /// Bark value of each partition centre
    pub bval: Vec<f32>,
    /// Partition holding the upper edge of each scalefactor band
    pub bo: Vec<usize>,
    /// Partition at the middle of each scalefactor band
    pub bm: Vec<usize>,
    /// Masking level difference of each scalefactor band, for mid/side demasking
    pub mld: Vec<f32>,
    /// Threshold in quiet per partition, FFT energy units
    pub ath: Vec<f32>,
    pub spreading: SpreadingMatrix,
}

struct Numlines {
    numlines: Vec<usize>,
    bo: Vec<usize>,
    bm: Vec<usize>,
    bval: Vec<f32>,
    bval_width: Vec<f32>,
    mld: Vec<f32>,
}

fn init_numline(sfreq: f32, blksize: usize, scalepos: &[usize], deltafreq: f32, sbmax: usize) -> SetupResult<Numlines> {
    let half = blksize / 2;
    let line_freq = sfreq / blksize as f32;
    let mut partition = vec![0usize; half + 1];
    let mut numlines = Vec::with_capacity(CBANDS);

    let mut j = 0usize;
    while j <= half {
        if numlines.len() == CBANDS {
            return Err(SetupError::PartitionOverflow { count: CBANDS + 1, max: CBANDS });
        }
        let bark1 = freq2bark(line_freq * j as f32);
        let mut j2 = j;
        while j2 <= half && freq2bark(line_freq * j2 as f32) - bark1 < DELBARK {
            j2 += 1;
        }
        let i = numlines.len();
        numlines.push(j2 - j);
        for p in &mut partition[j..j2] {
            *p = i;
        }
        j = j2;
    }

    let mut bo = vec![0; sbmax];
    let mut bm = vec![0; sbmax];
    let mut mld = vec![0.0; sbmax];
    for sfb in 0..sbmax {
        let (start, end) = (scalepos[sfb] as f32, scalepos[sfb + 1] as f32);
        let i1 = ((0.5 + deltafreq * (start - 0.5)).floor().max(0.0)) as usize;
        let i2 = ((0.5 + deltafreq * (end - 0.5)).floor() as usize).min(half);
        bm[sfb] = (partition[i1] + partition[i2]) / 2;
        bo[sfb] = partition[i2];

        let arg = freq2bark(line_freq * start * deltafreq).min(15.5) / 15.5;
        mld[sfb] = 10f32.powf(1.25 * (1.0 - (std::f32::consts::PI * arg).cos()) - 2.5);
    }

    let mut bval = Vec::with_capacity(numlines.len());
    let mut bval_width = Vec::with_capacity(numlines.len());
    let mut j = 0usize;
    for &w in &numlines {
        let (jf, wf) = (j as f32, w as f32);
        bval.push(0.5 * (freq2bark(line_freq * jf) + freq2bark(line_freq * (jf + wf - 1.0))));
        bval_width.push(freq2bark(line_freq * (jf + wf - 0.5)) - freq2bark(line_freq * (jf - 0.5)));
        j += w;
    }

    Ok(Numlines { numlines, bo, bm, bval, bval_width, mld })
}

/// Threshold in quiet of each partition: the minimum over its bins, summed over its width
fn partition_ath(sfreq: f32, blksize: usize, numlines: &[usize], ath_type: AthType) -> Vec<f32> {
    let mut j = 0usize;
    numlines
        .iter()
        .map(|&w| {
            let level = (j..j + w)
                .map(|k| {
                    let freq = sfreq * k as f32 / blksize as f32;
                    10f32.powf(0.1 * (ath_formula(freq, ath_type) - 20.0)) * w as f32
                })
                .fold(f32::MAX, f32::min);
            j += w;
            level
        })
        .collect()
}

/// All per-sample-rate tables of the psychoacoustic model
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionTables {
    pub sample_rate: u32,
    pub long: PartitionBands,
    pub short: PartitionBands,
    /// Lower bound of the tonality reduction per long partition
    pub minval: Vec<f32>,
    /// Upper bin of the unpredictability analysis
    pub cw_upper_index: usize,
    /// Temporal masking decay between consecutive short windows
    pub decay: f32,
    pub sfb: ScalefactorBands,
    /// Scalefactor-band threshold in quiet, MDCT domain
    pub sfb_ath: SfbAth,
}

impl PartitionTables {
    pub fn new(sample_rate: u32, bands: &ScalefactorBands, psy: &PsyConfig) -> SetupResult<Self> {
        let sfreq = sample_rate as f32;

        let long = init_numline(sfreq, BLKSIZE, &bands.l, BLKSIZE as f32 / (2.0 * GRANULE_SIZE as f32), SBMAX_L)?;
        let norm_l = vec![1.0; long.numlines.len()];
        let spreading_l = SpreadingMatrix::build(&long.bval, &long.bval_width, &norm_l)?;
        let minval = long
            .bval
            .iter()
            .map(|&b| {
                let x = if b > 10.0 { 0.0 } else { -20.0 + b * 2.0 };
                10f32.powf(x / 10.0)
            })
            .collect();
        let ath_l = partition_ath(sfreq, BLKSIZE, &long.numlines, psy.ath_type);

        let short = init_numline(sfreq, BLKSIZE_S, &bands.s, BLKSIZE_S as f32 / (2.0 * 192.0), SBMAX_S)?;
        let norm_s: Vec<f32> = short
            .bval
            .iter()
            .map(|&b| {
                let snr = if b >= 13.0 {
                    -4.5 * (b - 13.0) / (24.0 - 13.0) - 8.25 * (b - 24.0) / (13.0 - 24.0)
                } else {
                    -8.25
                };
                10f32.powf(snr / 10.0)
            })
            .collect();
        let spreading_s = SpreadingMatrix::build(&short.bval, &short.bval_width, &norm_s)?;
        let ath_s = partition_ath(sfreq, BLKSIZE_S, &short.numlines, psy.ath_type);

        let cw_upper_index = ((psy.cwlimit_hz / (sfreq / BLKSIZE as f32)) as usize).clamp(CW_LOWER_INDEX, HBLKSIZE - 4);
        let decay = (-std::f32::consts::LN_10 / (TEMPORAL_MASK_SUSTAIN_SEC * sfreq / 192.0)).exp();

        let long_bands = Self::bands_from(long, spreading_l, ath_l);
        let mut short_bands = Self::bands_from(short, spreading_s, ath_s);
        short_bands.bo[SBMAX_S - 1] -= 1;

        log::debug!(
            "partition model for {} Hz: {} long, {} short partitions, {} spreading coefficients",
            sample_rate,
            long_bands.npart,
            short_bands.npart,
            long_bands.spreading.len() + short_bands.spreading.len()
        );

        Ok(Self {
            sample_rate,
            long: long_bands,
            short: short_bands,
            minval,
            cw_upper_index,
            decay,
            sfb: bands.clone(),
            sfb_ath: SfbAth::compute(bands, sample_rate, psy.ath_type, psy.ath_lower_db),
        })
    }

    fn bands_from(n: Numlines, spreading: SpreadingMatrix, ath: Vec<f32>) -> PartitionBands {
        PartitionBands {
            npart: n.numlines.len(),
            rnumlines: n.numlines.iter().map(|&w| 1.0 / w as f32).collect(),
            numlines: n.numlines,
            bval: n.bval,
            bo: n.bo,
            bm: n.bm,
            mld: n.mld,
            ath,
            spreading,
        }
    }
}
