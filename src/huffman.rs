//! Huffman bit counting for quantized granules
//!
//! Counts the bits the entropy coder will spend on a granule without producing a
//! bitstream. The spectrum is split, from the top down, into a run of zero pairs,
//! a count1 region of quadruples with magnitudes at most one, and the big-values
//! region coded in pairs. Code books 1..=9 are counted with their exact code
//! lengths; the larger books and the escape books are modelled in closed form.

use crate::tables::{ScalefactorBands, COUNT1_LENGTHS, LINBITS, PAIR_TABLES, SUBDV_TABLE};
use crate::types::{BlockType, GranuleChannelState, GRANULE_SIZE, IXMAX_VAL, LARGE_BITS, SBMAX_L};

/// Largest magnitude the non-escape books represent
const ESCAPE_LIMIT: u32 = 15;

/// Entropy-coding cost of a quantized granule
pub trait BitCostEstimator {
    /// Bits of the big-values and count1 regions of `gi.l3_enc`
    ///
    /// Sets `big_values`, `count1`, `count1bits`, the region counts and the table
    /// selection. Returns `LARGE_BITS` when a magnitude exceeds the escape range.
    fn count_bits(&self, gi: &mut GranuleChannelState) -> u32;

    /// Final region subdivision once quantization is done; updates `part2_3_length`
    fn finalize(&self, gi: &mut GranuleChannelState);
}

/// Bit counter over the standard Layer III code books
#[derive(Debug, Clone)]
pub struct HuffmanBitCounter {
    bands: ScalefactorBands,
    /// Default (region0_count, region1_count) for a big-values area ending at line 2i
    region_split: Vec<(usize, usize)>,
}

impl HuffmanBitCounter {
    pub fn new(bands: &ScalefactorBands) -> Self {
        let l = &bands.l;
        let mut region_split = vec![(0, 0); GRANULE_SIZE / 2 + 1];

        for (pairs, split) in region_split.iter_mut().enumerate().skip(1) {
            let end = pairs * 2;
            let mut spanned = 1;
            while spanned < SBMAX_L && l[spanned] < end {
                spanned += 1;
            }
            let (r0_default, r1_default) = SUBDV_TABLE[spanned];

            let mut r0 = r0_default as isize;
            while r0 >= 0 && l[(r0 + 1) as usize] > end {
                r0 -= 1;
            }
            if r0 < 0 {
                r0 = r0_default as isize;
            }

            let mut r1 = r1_default as isize;
            while r1 >= 0 && l[(r0 + r1 + 2) as usize] > end {
                r1 -= 1;
            }
            if r1 < 0 {
                r1 = r1_default as isize;
            }
            *split = (r0 as usize, r1 as usize);
        }

        Self {
            bands: bands.clone(),
            region_split,
        }
    }

    /// Region boundaries in lines for a granule whose big-values area ends at `end`
    fn region_bounds(&self, gi: &mut GranuleChannelState, end: usize) -> (usize, usize) {
        match gi.block_type {
            BlockType::Short => {
                gi.region0_count = 8;
                gi.region1_count = 36;
                ((3 * self.bands.s[3]).min(end), end)
            }
            BlockType::Start | BlockType::Stop => {
                gi.region0_count = 7;
                gi.region1_count = 13;
                (self.bands.l[8].min(end), end)
            }
            BlockType::Normal => {
                let (r0, r1) = self.region_split[end / 2];
                gi.region0_count = r0 as u32;
                gi.region1_count = r1 as u32;
                (self.bands.l[r0 + 1].min(end), self.bands.l[r0 + r1 + 2].min(end))
            }
        }
    }
}

impl BitCostEstimator for HuffmanBitCounter {
    fn count_bits(&self, gi: &mut GranuleChannelState) -> u32 {
        let (count1_end, big_end) = run_lengths(&gi.l3_enc);

        let (count1bits, count1_table) = count1_bitcount(&gi.l3_enc[big_end..count1_end]);
        gi.count1 = ((count1_end - big_end) / 4) as u32;
        gi.count1bits = count1bits;
        gi.count1table_select = count1_table;
        gi.big_values = (big_end / 2) as u32;
        gi.table_select = [0; 3];

        if big_end == 0 {
            return count1bits;
        }

        let (a1, a2) = self.region_bounds(gi, big_end);
        let mut bits = count1bits;
        for (region, (start, stop)) in [(0, a1), (a1, a2), (a2, big_end)].into_iter().enumerate() {
            if start >= stop {
                continue;
            }
            let (table, region_bits) = choose_table(&gi.l3_enc[start..stop]);
            if region_bits >= LARGE_BITS {
                return LARGE_BITS;
            }
            gi.table_select[region] = table;
            bits += region_bits;
        }
        bits
    }

    fn finalize(&self, gi: &mut GranuleChannelState) {
        let bits = self.count_bits(gi);
        if bits >= LARGE_BITS {
            return;
        }
        gi.part2_3_length = bits;
        if gi.block_type != BlockType::Normal || gi.big_values == 0 {
            return;
        }

        let big_end = gi.big_values as usize * 2;
        let l = &self.bands.l;
        let mut best = (bits - gi.count1bits, gi.region0_count, gi.region1_count, gi.table_select);

        for r0 in 0..16usize {
            let a1 = l[r0 + 1];
            if a1 >= big_end {
                break;
            }
            let (t0, b0) = choose_table(&gi.l3_enc[..a1]);
            for r1 in 0..8usize {
                let a2 = l[(r0 + r1 + 2).min(SBMAX_L)];
                if a2 > big_end {
                    break;
                }
                let (t1, b1) = choose_table(&gi.l3_enc[a1..a2]);
                let (t2, b2) = choose_table(&gi.l3_enc[a2..big_end]);
                let total = b0 + b1 + b2;
                if total < best.0 {
                    best = (total, r0 as u32, r1 as u32, [t0, t1, t2]);
                }
            }
        }

        let (big_bits, r0, r1, tables) = best;
        gi.region0_count = r0;
        gi.region1_count = r1;
        gi.table_select = tables;
        gi.part2_3_length = big_bits + gi.count1bits;
        log::trace!(
            "huffman regions {}/{}, tables {:?}, {} bits",
            r0,
            r1,
            tables,
            gi.part2_3_length
        );
    }
}

/// End of the count1 region and of the big-values region, in lines
///
/// Trailing zero pairs are dropped first, then quadruples whose magnitudes are
/// all at most one move into the count1 region.
pub fn run_lengths(ix: &[i32; GRANULE_SIZE]) -> (usize, usize) {
    let mut i = GRANULE_SIZE;
    while i > 1 && ix[i - 1] == 0 && ix[i - 2] == 0 {
        i -= 2;
    }
    let count1_end = i;
    while i > 3 && ix[i - 4..i].iter().all(|&v| v <= 1) {
        i -= 4;
    }
    (count1_end, i)
}

/// Bits of the count1 region under the cheaper of books A and B
fn count1_bitcount(quads: &[i32]) -> (u32, u32) {
    let (mut sum_a, mut sum_b) = (0u32, 0u32);
    for q in quads.chunks_exact(4) {
        let p = (q[0] * 8 + q[1] * 4 + q[2] * 2 + q[3]) as usize;
        let signs = q.iter().filter(|&&v| v != 0).count() as u32;
        sum_a += COUNT1_LENGTHS[0][p] as u32 + signs;
        sum_b += COUNT1_LENGTHS[1][p] as u32 + signs;
    }
    if sum_a <= sum_b {
        (sum_a, 0)
    } else {
        (sum_b, 1)
    }
}

/// Cheapest code book for a region and its bit count
fn choose_table(values: &[i32]) -> (u32, u32) {
    let max = values.iter().copied().max().unwrap_or(0).max(0);
    if max == 0 {
        return (0, 0);
    }
    if max > IXMAX_VAL {
        return (0, LARGE_BITS);
    }
    let max = max as u32;

    let exact = PAIR_TABLES
        .iter()
        .enumerate()
        .filter_map(|(t, book)| book.map(|b| (t, b)))
        .filter(|(_, book)| book.xlen as u32 > max)
        .map(|(t, book)| (t as u32, pair_bits(values, book.xlen, book.lengths)))
        .min_by_key(|&(_, bits)| bits);
    if let Some(best) = exact {
        return best;
    }

    let (steep, flat) = if max <= 7 {
        (10, 12)
    } else if max <= ESCAPE_LIMIT {
        (13, 15)
    } else {
        let needed = 32 - (max - ESCAPE_LIMIT).leading_zeros();
        let fits = |first: usize| (first..first + 8).find(|&t| LINBITS[t - 16] >= needed);
        match (fits(16), fits(24)) {
            (Some(a), Some(b)) => (a, b),
            _ => return (0, LARGE_BITS),
        }
    };
    let steep_bits = modelled_bits(values, false, linbits(steep));
    let flat_bits = modelled_bits(values, true, linbits(flat));
    if steep_bits <= flat_bits {
        (steep as u32, steep_bits)
    } else {
        (flat as u32, flat_bits)
    }
}

fn linbits(table: usize) -> u32 {
    if table >= 16 {
        LINBITS[table - 16]
    } else {
        0
    }
}

fn pair_bits(values: &[i32], xlen: usize, lengths: &[u8]) -> u32 {
    values
        .chunks(2)
        .map(|pair| {
            let x = pair[0] as usize;
            let y = pair.get(1).copied().unwrap_or(0) as usize;
            lengths[x * xlen + y] as u32 + (x != 0) as u32 + (y != 0) as u32
        })
        .sum()
}

/// Closed-form code length of one magnitude in the larger books
///
/// Steep books spend few bits on small values, flat books spread lengths evenly.
/// Both bound the exact lengths of books 7..=9 from above.
fn modelled_length(v: u32, flat: bool) -> u32 {
    let magnitude = 32 - v.leading_zeros();
    if flat {
        3 + magnitude
    } else {
        2 + 2 * magnitude
    }
}

fn modelled_bits(values: &[i32], flat: bool, linbits: u32) -> u32 {
    values
        .iter()
        .map(|&v| {
            let v = v.max(0) as u32;
            let escape = if v >= ESCAPE_LIMIT { linbits } else { 0 };
            modelled_length(v.min(ESCAPE_LIMIT), flat) + escape + (v != 0) as u32
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn counter() -> HuffmanBitCounter {
        HuffmanBitCounter::new(&ScalefactorBands::for_index(0).unwrap())
    }

    fn granule(values: &[(usize, i32)]) -> GranuleChannelState {
        let mut gi = GranuleChannelState::default();
        for &(i, v) in values {
            gi.l3_enc[i] = v;
        }
        gi
    }

    #[test]
    fn test_silence_costs_nothing() {
        let mut gi = granule(&[]);
        assert_eq!(counter().count_bits(&mut gi), 0);
        assert_eq!(gi.big_values, 0);
        assert_eq!(gi.count1, 0);
    }

    #[test]
    fn test_run_lengths() {
        let mut ix = [0i32; GRANULE_SIZE];
        ix[0] = 3;
        ix[5] = 1;
        ix[9] = 1;
        // zeros above line 10, quadruples 2..6 and 6..10 hold ones only
        assert_eq!(run_lengths(&ix), (10, 2));
    }

    #[test]
    fn test_count1_only_granule() {
        let mut gi = granule(&[(0, 1), (1, 1), (2, 1), (3, 1)]);
        let bits = counter().count_bits(&mut gi);
        assert_eq!(gi.big_values, 0);
        assert_eq!(gi.count1, 1);
        // book B: 4 bits plus four signs
        assert_eq!(bits, 8);
        assert_eq!(gi.count1table_select, 1);
    }

    #[test]
    fn test_single_pair_uses_smallest_book() {
        let mut gi = granule(&[(0, 2), (1, 0)]);
        let bits = counter().count_bits(&mut gi);
        assert_eq!(gi.big_values, 1);
        // (2, 0) is a 4-bit code in book 6, plus one sign
        assert_eq!(gi.table_select[0], 6);
        assert_eq!(bits, 5);
    }

    #[test]
    fn test_escape_values_use_escape_books() {
        let mut gi = granule(&[(0, 100), (1, 20)]);
        let bits = counter().count_bits(&mut gi);
        assert!(gi.table_select[0] >= 16);
        assert!(bits < LARGE_BITS);

        let mut gi = granule(&[(0, IXMAX_VAL + 1)]);
        assert_eq!(counter().count_bits(&mut gi), LARGE_BITS);
    }

    #[test]
    fn test_flat_spectrum_cost_grows_with_magnitude() {
        let c = counter();
        let mut last = 0;
        for v in 1..40 {
            let mut gi = GranuleChannelState::default();
            gi.l3_enc = [v; GRANULE_SIZE];
            let bits = c.count_bits(&mut gi);
            assert!(bits >= last, "magnitude {} cost {} < {}", v, bits, last);
            last = bits;
        }
    }

    #[test]
    fn test_short_block_regions() {
        let mut gi = granule(&[(100, 5)]);
        gi.block_type = BlockType::Short;
        counter().count_bits(&mut gi);
        assert_eq!(gi.region0_count, 8);
        assert_eq!(gi.region1_count, 36);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 100,
            failure_persistence: None,
            .. ProptestConfig::default()
        })]

        #[test]
        fn test_finalize_never_costs_more(values in prop::collection::vec(0i32..20, GRANULE_SIZE)) {
            let c = counter();
            let mut gi = GranuleChannelState::default();
            gi.l3_enc.copy_from_slice(&values);
            let counted = c.count_bits(&mut gi);
            c.finalize(&mut gi);
            prop_assert!(gi.part2_3_length <= counted);
        }

        #[test]
        fn test_regions_stay_inside_big_values(end in 1usize..=288) {
            let c = counter();
            let (r0, r1) = c.region_split[end];
            prop_assert!(r0 < 16);
            prop_assert!(r1 < 8);
            prop_assert!(r0 + r1 + 2 <= SBMAX_L);
        }
    }
}
