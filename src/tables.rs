//! Lookup tables and constants for the Layer III quantization core
//!
//! Sample rate and bitrate tables, scalefactor band layouts for all nine sample
//! rates, scalefactor storage tables for both MPEG-1 and MPEG-2/2.5, and the code
//! lengths of the small Huffman code books used for bit counting.

use crate::types::{PSFB12, PSFB21, SBMAX_L, SBMAX_S};

/// Supported sample rates, grouped by MPEG version
pub const SAMPLE_RATES: [u32; 9] = [
    44100, 48000, 32000, // MPEG-1
    22050, 24000, 16000, // MPEG-2
    11025, 12000, 8000, // MPEG-2.5
];

/// Bitrates in kbps, indexed by [version][bitrate_index]
/// Version rows: 0 = MPEG-1, 1 = MPEG-2 and MPEG-2.5
pub const BITRATES: [[u32; 15]; 2] = [
    [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320],
    [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160],
];

/// Long-block scalefactor band edges, one row per entry of `SAMPLE_RATES`
const SFB_LONG: [[usize; SBMAX_L + 1]; 9] = [
    [0, 4, 8, 12, 16, 20, 24, 30, 36, 44, 52, 62, 74, 90, 110, 134, 162, 196, 238, 288, 342, 418, 576],
    [0, 4, 8, 12, 16, 20, 24, 30, 36, 42, 50, 60, 72, 88, 106, 128, 156, 190, 230, 276, 330, 384, 576],
    [0, 4, 8, 12, 16, 20, 24, 30, 36, 44, 54, 66, 82, 102, 126, 156, 194, 240, 296, 364, 448, 550, 576],
    [0, 6, 12, 18, 24, 30, 36, 44, 54, 66, 80, 96, 116, 140, 168, 200, 238, 284, 336, 396, 464, 522, 576],
    [0, 6, 12, 18, 24, 30, 36, 44, 54, 66, 80, 96, 114, 136, 162, 194, 232, 278, 332, 394, 464, 540, 576],
    [0, 6, 12, 18, 24, 30, 36, 44, 54, 66, 80, 96, 116, 140, 168, 200, 238, 284, 336, 396, 464, 522, 576],
    [0, 6, 12, 18, 24, 30, 36, 44, 54, 66, 80, 96, 116, 140, 168, 200, 238, 284, 336, 396, 464, 522, 576],
    [0, 6, 12, 18, 24, 30, 36, 44, 54, 66, 80, 96, 116, 140, 168, 200, 238, 284, 336, 396, 464, 522, 576],
    [0, 12, 24, 36, 48, 60, 72, 88, 108, 132, 160, 192, 232, 280, 336, 400, 476, 566, 568, 570, 572, 574, 576],
];

/// Short-block scalefactor band edges (per window), one row per entry of `SAMPLE_RATES`
const SFB_SHORT: [[usize; SBMAX_S + 1]; 9] = [
    [0, 4, 8, 12, 16, 22, 30, 40, 52, 66, 84, 106, 136, 192],
    [0, 4, 8, 12, 16, 22, 28, 38, 50, 64, 80, 100, 126, 192],
    [0, 4, 8, 12, 16, 22, 30, 42, 58, 78, 104, 138, 180, 192],
    [0, 4, 8, 12, 18, 24, 32, 42, 56, 74, 100, 132, 174, 192],
    [0, 4, 8, 12, 18, 26, 36, 48, 62, 80, 104, 136, 180, 192],
    [0, 4, 8, 12, 18, 26, 36, 48, 62, 80, 104, 134, 174, 192],
    [0, 4, 8, 12, 18, 26, 36, 48, 62, 80, 104, 134, 174, 192],
    [0, 4, 8, 12, 18, 26, 36, 48, 62, 80, 104, 134, 174, 192],
    [0, 8, 16, 24, 36, 52, 72, 96, 124, 160, 162, 164, 166, 192],
];

/// Scalefactor band layout of one sample rate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalefactorBands {
    /// Long band edges in spectral lines
    pub l: [usize; SBMAX_L + 1],
    /// Short band edges in lines of one short window
    pub s: [usize; SBMAX_S + 1],
    /// Sub-partition edges of the top long band
    pub psfb21: [usize; PSFB21 + 1],
    /// Sub-partition edges of the top short band
    pub psfb12: [usize; PSFB12 + 1],
}

impl ScalefactorBands {
    /// Band layout for an index into `SAMPLE_RATES`
    pub fn for_index(samplerate_index: usize) -> Option<Self> {
        let l = *SFB_LONG.get(samplerate_index)?;
        let s = *SFB_SHORT.get(samplerate_index)?;

        let mut psfb21 = [0usize; PSFB21 + 1];
        let size = (l[SBMAX_L] - l[SBMAX_L - 1]) / PSFB21;
        for (i, edge) in psfb21.iter_mut().enumerate().take(PSFB21) {
            *edge = l[SBMAX_L - 1] + i * size;
        }
        psfb21[PSFB21] = 576;

        let mut psfb12 = [0usize; PSFB12 + 1];
        let size = (s[SBMAX_S] - s[SBMAX_S - 1]) / PSFB12;
        for (i, edge) in psfb12.iter_mut().enumerate().take(PSFB12) {
            *edge = s[SBMAX_S - 1] + i * size;
        }
        psfb12[PSFB12] = 192;

        Some(Self { l, s, psfb21, psfb12 })
    }
}

/// Index of a sample rate in `SAMPLE_RATES`
pub fn get_sample_rate_index(sample_rate: u32) -> Option<usize> {
    SAMPLE_RATES.iter().position(|&sr| sr == sample_rate)
}

/// Bitrate in kbps for a bitrate index; `mpeg1` selects the MPEG-1 row
pub fn get_bitrate(bitrate_index: usize, mpeg1: bool) -> Option<u32> {
    let row = if mpeg1 { 0 } else { 1 };
    match BITRATES[row].get(bitrate_index) {
        Some(&kbps) if kbps > 0 => Some(kbps),
        _ => None,
    }
}

/// Bitrate index for a bitrate in kbps
pub fn get_bitrate_index(kbps: u32, mpeg1: bool) -> Option<usize> {
    let row = if mpeg1 { 0 } else { 1 };
    BITRATES[row].iter().skip(1).position(|&b| b == kbps).map(|i| i + 1)
}

/// Preemphasis added to long-band scalefactors when `preflag` is set
pub const PRETAB: [i32; SBMAX_L] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 3, 3, 3, 2, 0];

/// Bit widths of the two MPEG-1 scalefactor groups, per scalefac_compress
pub const SLEN1_TAB: [u32; 16] = [0, 0, 0, 0, 3, 1, 1, 1, 2, 2, 2, 3, 3, 3, 4, 4];
pub const SLEN2_TAB: [u32; 16] = [0, 1, 2, 3, 0, 1, 2, 3, 1, 2, 3, 1, 2, 3, 2, 3];

/// Exclusive upper bounds (2^slen) of the two MPEG-1 scalefactor groups
pub const SLEN1_N: [i32; 16] = [1, 1, 1, 1, 8, 2, 2, 2, 4, 4, 4, 8, 8, 8, 16, 16];
pub const SLEN2_N: [i32; 16] = [1, 2, 4, 8, 1, 2, 4, 8, 2, 4, 8, 2, 4, 8, 4, 8];

/// MPEG-1 part2 lengths per scalefac_compress
pub const SCALE_SHORT: [u32; 16] = [0, 18, 36, 54, 54, 36, 54, 72, 54, 72, 90, 72, 90, 108, 108, 126];
pub const SCALE_MIXED: [u32; 16] = [0, 18, 36, 54, 51, 35, 53, 71, 52, 70, 88, 69, 87, 105, 104, 122];
pub const SCALE_LONG: [u32; 16] = [0, 10, 20, 30, 33, 21, 31, 41, 32, 42, 52, 43, 53, 63, 64, 74];

/// MPEG-2 scalefactor partitions: [table][long, short, mixed][partition]
pub const NR_OF_SFB_BLOCK: [[[usize; 4]; 3]; 6] = [
    [[6, 5, 5, 5], [9, 9, 9, 9], [6, 9, 9, 9]],
    [[6, 5, 7, 3], [9, 9, 12, 6], [6, 9, 12, 6]],
    [[11, 10, 0, 0], [18, 18, 0, 0], [15, 18, 0, 0]],
    [[7, 7, 7, 0], [12, 12, 12, 0], [6, 15, 12, 0]],
    [[6, 6, 6, 3], [12, 9, 9, 6], [6, 12, 9, 6]],
    [[8, 8, 5, 0], [15, 12, 9, 0], [6, 18, 9, 0]],
];

/// Largest storable scalefactor per MPEG-2 partition
pub const MAX_RANGE_SFAC_TAB: [[i32; 4]; 6] = [
    [15, 15, 7, 7],
    [15, 15, 7, 0],
    [7, 3, 0, 0],
    [15, 31, 31, 0],
    [7, 7, 7, 0],
    [3, 3, 0, 0],
];

/// Bits needed to store a value 0..=15
pub const LOG2TAB: [u32; 16] = [0, 1, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 4, 4, 4, 4];

/// Largest scalefactor per band for short blocks
pub const MAX_RANGE_SHORT: [i32; 39] = [
    15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, //
    7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, //
    0, 0, 0,
];

/// Largest scalefactor per band for long blocks
pub const MAX_RANGE_LONG: [i32; SBMAX_L] = [15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 0];

/// Largest scalefactor per band for MPEG-2 long blocks with preemphasis
pub const MAX_RANGE_LONG_LSF_PRETAB: [i32; SBMAX_L] = [7, 7, 7, 7, 7, 7, 3, 3, 3, 3, 3, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];

/// Region subdivision of the big-values area, indexed by the number of long bands it spans
pub const SUBDV_TABLE: [(u32, u32); 23] = [
    (0, 0), // 0 bands
    (0, 0), // 1 bands
    (0, 0), // 2 bands
    (0, 0), // 3 bands
    (0, 0), // 4 bands
    (0, 1), // 5 bands
    (1, 1), // 6 bands
    (1, 1), // 7 bands
    (1, 2), // 8 bands
    (2, 2), // 9 bands
    (2, 3), // 10 bands
    (2, 3), // 11 bands
    (3, 4), // 12 bands
    (3, 4), // 13 bands
    (3, 4), // 14 bands
    (4, 5), // 15 bands
    (4, 5), // 16 bands
    (4, 6), // 17 bands
    (5, 6), // 18 bands
    (5, 6), // 19 bands
    (5, 7), // 20 bands
    (6, 7), // 21 bands
    (6, 7), // 22 bands
];

/// Code lengths of a pair code book without escape
#[derive(Debug, Clone, Copy)]
pub struct HuffmanLengths {
    /// Values per dimension (max codable value + 1)
    pub xlen: usize,
    /// Code length for the pair (x, y) at index x * xlen + y
    pub lengths: &'static [u8],
}

static T1_LENGTHS: [u8; 4] = [1, 3, 2, 3];
static T2_LENGTHS: [u8; 9] = [1, 3, 6, 3, 3, 5, 5, 5, 6];
static T3_LENGTHS: [u8; 9] = [2, 2, 6, 3, 2, 5, 5, 5, 6];
static T5_LENGTHS: [u8; 16] = [1, 3, 6, 7, 3, 3, 6, 7, 6, 6, 7, 8, 7, 6, 7, 8];
static T6_LENGTHS: [u8; 16] = [3, 3, 5, 7, 3, 2, 4, 5, 4, 4, 5, 6, 6, 5, 6, 7];
static T7_LENGTHS: [u8; 36] = [
    1, 3, 6, 8, 8, 9, 3, 4, 6, 7, 7, 8, 6, 5, 7, 8, 8, 9, 7, 7, 8, 9, 9, 9, //
    7, 7, 8, 9, 9, 10, 8, 8, 9, 10, 10, 10,
];
static T8_LENGTHS: [u8; 36] = [
    2, 3, 6, 8, 8, 9, 3, 2, 4, 8, 8, 8, 6, 4, 6, 8, 8, 9, 8, 8, 8, 9, 9, 10, //
    8, 7, 8, 9, 10, 10, 9, 8, 9, 9, 11, 11,
];
static T9_LENGTHS: [u8; 36] = [
    3, 3, 5, 6, 8, 9, 3, 3, 4, 5, 6, 8, 4, 4, 5, 6, 7, 8, 6, 5, 6, 7, 7, 8, //
    7, 6, 7, 7, 8, 9, 8, 7, 8, 8, 9, 9,
];

/// Pair code books 1..=9 (tables 0 and 4 do not exist)
pub const PAIR_TABLES: [Option<HuffmanLengths>; 10] = [
    None,
    Some(HuffmanLengths { xlen: 2, lengths: &T1_LENGTHS }),
    Some(HuffmanLengths { xlen: 3, lengths: &T2_LENGTHS }),
    Some(HuffmanLengths { xlen: 3, lengths: &T3_LENGTHS }),
    None,
    Some(HuffmanLengths { xlen: 4, lengths: &T5_LENGTHS }),
    Some(HuffmanLengths { xlen: 4, lengths: &T6_LENGTHS }),
    Some(HuffmanLengths { xlen: 6, lengths: &T7_LENGTHS }),
    Some(HuffmanLengths { xlen: 6, lengths: &T8_LENGTHS }),
    Some(HuffmanLengths { xlen: 6, lengths: &T9_LENGTHS }),
];

/// Quadruple code books A and B of the count1 region, indexed by 8v + 4w + 2x + y
pub const COUNT1_LENGTHS: [[u8; 16]; 2] = [
    [1, 4, 4, 5, 4, 6, 5, 6, 4, 5, 5, 6, 5, 6, 6, 6],
    [4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4],
];

/// Escape bits of tables 16..=31
pub const LINBITS: [u32; 16] = [1, 2, 3, 4, 6, 8, 10, 13, 4, 5, 6, 7, 8, 9, 11, 13];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_tables_are_increasing_and_complete() {
        for idx in 0..SAMPLE_RATES.len() {
            let bands = ScalefactorBands::for_index(idx).unwrap();
            assert!(bands.l.windows(2).all(|w| w[0] < w[1]), "long row {}", idx);
            assert!(bands.s.windows(2).all(|w| w[0] < w[1]), "short row {}", idx);
            assert_eq!(bands.l[SBMAX_L], 576);
            assert_eq!(bands.s[SBMAX_S], 192);
            assert_eq!(bands.psfb21[0], bands.l[SBMAX_L - 1]);
            assert_eq!(bands.psfb21[PSFB21], 576);
        }
        assert!(ScalefactorBands::for_index(9).is_none());
    }

    #[test]
    fn test_bitrate_lookup() {
        assert_eq!(get_bitrate(9, true), Some(128));
        assert_eq!(get_bitrate(1, false), Some(8));
        assert_eq!(get_bitrate(0, true), None);
        assert_eq!(get_bitrate_index(128, true), Some(9));
        assert_eq!(get_bitrate_index(144, false), Some(13));
        assert_eq!(get_bitrate_index(144, true), None);
    }

    #[test]
    fn test_code_books_are_square() {
        for table in PAIR_TABLES.iter().flatten() {
            assert_eq!(table.lengths.len(), table.xlen * table.xlen);
        }
    }

    #[test]
    fn test_part2_tables_match_slen_widths() {
        for k in 0..16 {
            assert_eq!(SCALE_LONG[k], SLEN1_TAB[k] * 11 + SLEN2_TAB[k] * 10);
            assert_eq!(SCALE_SHORT[k], SLEN1_TAB[k] * 18 + SLEN2_TAB[k] * 18);
            assert_eq!(1 << SLEN1_TAB[k], SLEN1_N[k]);
            assert_eq!(1 << SLEN2_TAB[k], SLEN2_N[k]);
        }
    }
}
