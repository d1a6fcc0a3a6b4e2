//! Quantization comparison strategies
//!
//! The outer loop keeps the best quantization seen so far; these strategies
//! decide whether a new candidate replaces it. Each numbered heuristic is its
//! own type, picked once from the configuration.

use crate::quantize::NoiseResult;
use crate::types::SFBMAX;

/// Decides whether a candidate quantization beats the current best
pub trait NoiseComparison: Send + Sync {
    /// Heuristic verdict, before the bit count rule
    ///
    /// May rewrite fields of `calc` that the heuristic defines differently.
    fn prefers(&self, best: &NoiseResult, calc: &mut NoiseResult, distort: &[f32; SFBMAX], psymax: usize) -> bool;

    /// Verdict including the rule that, once no band is distorted, a
    /// candidate must also use fewer bits
    fn is_better(&self, best: &NoiseResult, calc: &mut NoiseResult, distort: &[f32; SFBMAX], psymax: usize) -> bool {
        let better = self.prefers(best, calc, distort, psymax);
        if best.over_count == 0 {
            better && calc.bits < best.bits
        } else {
            better
        }
    }

    fn id(&self) -> u8;
}

/// Strategy for a comparison id; ids above 9 fall back to 9
pub fn from_id(id: u8) -> Box<dyn NoiseComparison> {
    match id {
        0 => Box::new(OverCountThenNoise),
        1 => Box::new(MaxNoise),
        2 => Box::new(TotalNoise),
        3 => Box::new(TotalAndMaxNoise),
        4 => Box::new(GradedMaxNoise),
        5 => Box::new(OverNoiseThenTotal),
        6 => Box::new(OverNoiseThenMax),
        7 => Box::new(OverCountOrNoise),
        8 => Box::new(KlemmPenalty),
        _ => Box::new(OverSsdThenBits),
    }
}

/// Fewer distorted bands, then less noise over the threshold, then less total noise
#[derive(Debug, Clone, Copy, Default)]
pub struct OverCountThenNoise;

impl NoiseComparison for OverCountThenNoise {
    fn prefers(&self, best: &NoiseResult, calc: &mut NoiseResult, _: &[f32; SFBMAX], _: usize) -> bool {
        calc.over_count < best.over_count
            || (calc.over_count == best.over_count && calc.over_noise < best.over_noise)
            || (calc.over_count == best.over_count
                && calc.over_noise == best.over_noise
                && calc.tot_noise < best.tot_noise)
    }

    fn id(&self) -> u8 {
        0
    }
}

/// Lower worst-band noise
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxNoise;

impl NoiseComparison for MaxNoise {
    fn prefers(&self, best: &NoiseResult, calc: &mut NoiseResult, _: &[f32; SFBMAX], _: usize) -> bool {
        calc.max_noise < best.max_noise
    }

    fn id(&self) -> u8 {
        1
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TotalNoise;

impl NoiseComparison for TotalNoise {
    fn prefers(&self, best: &NoiseResult, calc: &mut NoiseResult, _: &[f32; SFBMAX], _: usize) -> bool {
        calc.tot_noise < best.tot_noise
    }

    fn id(&self) -> u8 {
        2
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TotalAndMaxNoise;

impl NoiseComparison for TotalAndMaxNoise {
    fn prefers(&self, best: &NoiseResult, calc: &mut NoiseResult, _: &[f32; SFBMAX], _: usize) -> bool {
        calc.tot_noise < best.tot_noise && calc.max_noise < best.max_noise
    }

    fn id(&self) -> u8 {
        3
    }
}

/// Worst-band noise with tolerance windows traded against total noise
#[derive(Debug, Clone, Copy, Default)]
pub struct GradedMaxNoise;

impl NoiseComparison for GradedMaxNoise {
    fn prefers(&self, best: &NoiseResult, calc: &mut NoiseResult, _: &[f32; SFBMAX], _: usize) -> bool {
        let (c, b) = (calc, best);
        (c.max_noise <= 0.0 && b.max_noise > 0.2)
            || (c.max_noise <= 0.0
                && b.max_noise < 0.0
                && b.max_noise > c.max_noise - 0.2
                && c.tot_noise < b.tot_noise)
            || (c.max_noise <= 0.0
                && b.max_noise > 0.0
                && b.max_noise > c.max_noise - 0.2
                && c.tot_noise < b.tot_noise + b.over_noise)
            || (c.max_noise > 0.0
                && b.max_noise > -0.05
                && b.max_noise > c.max_noise - 0.1
                && c.tot_noise + c.over_noise < b.tot_noise + b.over_noise)
            || (c.max_noise > 0.0
                && b.max_noise > -0.1
                && b.max_noise > c.max_noise - 0.15
                && c.tot_noise + 2.0 * c.over_noise < b.tot_noise + 2.0 * b.over_noise)
    }

    fn id(&self) -> u8 {
        4
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OverNoiseThenTotal;

impl NoiseComparison for OverNoiseThenTotal {
    fn prefers(&self, best: &NoiseResult, calc: &mut NoiseResult, _: &[f32; SFBMAX], _: usize) -> bool {
        calc.over_noise < best.over_noise
            || (calc.over_noise == best.over_noise && calc.tot_noise < best.tot_noise)
    }

    fn id(&self) -> u8 {
        5
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OverNoiseThenMax;

impl NoiseComparison for OverNoiseThenMax {
    fn prefers(&self, best: &NoiseResult, calc: &mut NoiseResult, _: &[f32; SFBMAX], _: usize) -> bool {
        calc.over_noise < best.over_noise
            || (calc.over_noise == best.over_noise
                && (calc.max_noise < best.max_noise
                    || (calc.max_noise == best.max_noise && calc.tot_noise <= best.tot_noise)))
    }

    fn id(&self) -> u8 {
        6
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OverCountOrNoise;

impl NoiseComparison for OverCountOrNoise {
    fn prefers(&self, best: &NoiseResult, calc: &mut NoiseResult, _: &[f32; SFBMAX], _: usize) -> bool {
        calc.over_count < best.over_count || calc.over_noise < best.over_noise
    }

    fn id(&self) -> u8 {
        7
    }
}

/// Worst-band comparison on a perceptual penalty summed over all bands
///
/// Replaces the candidate's `max_noise` with the penalty sum.
#[derive(Debug, Clone, Copy, Default)]
pub struct KlemmPenalty;

impl KlemmPenalty {
    pub fn noise(distort: &[f32; SFBMAX], psymax: usize) -> f32 {
        let sum = distort[..psymax.min(SFBMAX)]
            .iter()
            .map(|&d| {
                let d = d as f64;
                (0.368 + 0.632 * d * d * d).log10()
            })
            .fold(1e-37, |acc, p| acc + p);
        sum.max(1e-20) as f32
    }
}

impl NoiseComparison for KlemmPenalty {
    fn prefers(&self, best: &NoiseResult, calc: &mut NoiseResult, distort: &[f32; SFBMAX], psymax: usize) -> bool {
        calc.max_noise = Self::noise(distort, psymax);
        calc.max_noise < best.max_noise
    }

    fn id(&self) -> u8 {
        8
    }
}

/// Squared excess over the threshold while bands are distorted; otherwise
/// worst-band noise weighed against bits
#[derive(Debug, Clone, Copy, Default)]
pub struct OverSsdThenBits;

impl NoiseComparison for OverSsdThenBits {
    fn prefers(&self, best: &NoiseResult, calc: &mut NoiseResult, _: &[f32; SFBMAX], _: usize) -> bool {
        if best.over_count > 0 {
            if calc.over_ssd == best.over_ssd {
                calc.bits < best.bits
            } else {
                calc.over_ssd < best.over_ssd
            }
        } else {
            calc.max_noise < 0.0
                && calc.max_noise * 10.0 + calc.bits as f32 <= best.max_noise * 10.0 + best.bits as f32
        }
    }

    fn id(&self) -> u8 {
        9
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn noise(over_count: i32, over_ssd: i32, max_noise: f32, tot_noise: f32, bits: i32) -> NoiseResult {
        NoiseResult {
            over_count,
            max_noise,
            over_noise: max_noise.max(0.0),
            tot_noise,
            over_ssd,
            bits,
        }
    }

    #[test]
    fn test_ids_round_trip_and_fall_back() {
        for id in 0..=9 {
            assert_eq!(from_id(id).id(), id);
        }
        assert_eq!(from_id(42).id(), 9);
    }

    #[test]
    fn test_over_ssd_decides_while_distorted() {
        let cmp = OverSsdThenBits;
        let d = [0.0; SFBMAX];
        let best = noise(3, 40, 0.5, 1.0, 900);
        assert!(cmp.is_better(&best, &mut noise(3, 30, 0.9, 2.0, 1200), &d, 21));
        assert!(!cmp.is_better(&best, &mut noise(1, 50, 0.1, 0.0, 100), &d, 21));
        // equal excess falls back to bits
        assert!(cmp.is_better(&best, &mut noise(2, 40, 0.5, 1.0, 800), &d, 21));
        assert!(!cmp.is_better(&best, &mut noise(2, 40, 0.5, 1.0, 950), &d, 21));
    }

    #[test]
    fn test_clean_best_requires_fewer_bits() {
        let d = [0.0; SFBMAX];
        let best = noise(0, 0, -0.5, -8.0, 1000);
        for id in 0..=9 {
            let cmp = from_id(id);
            let mut costly = noise(0, 0, -3.0, -30.0, 1001);
            assert!(!cmp.is_better(&best, &mut costly, &d, 21), "mode {} accepted more bits", id);
        }
        assert!(OverCountThenNoise.is_better(&best, &mut noise(0, 0, -3.0, -30.0, 990), &d, 21));
    }

    #[test]
    fn test_klemm_rewrites_max_noise() {
        let mut d = [0.0; SFBMAX];
        d[..21].fill(1.0);
        let best = noise(5, 10, 100.0, 0.0, 500);
        let mut calc = noise(5, 10, 7.0, 0.0, 500);
        assert!(KlemmPenalty.is_better(&best, &mut calc, &d, 21));
        // log10(0.368 + 0.632) = 0 for every band
        assert!((calc.max_noise - 1e-20).abs() < 1e-19);
    }

    #[test]
    fn test_graded_max_noise_accepts_newly_clean() {
        let d = [0.0; SFBMAX];
        let best = noise(2, 10, 0.5, 3.0, 700);
        let mut clean = noise(0, 0, -0.1, 5.0, 800);
        assert!(GradedMaxNoise.is_better(&best, &mut clean, &d, 21));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 100,
            failure_persistence: None,
            .. ProptestConfig::default()
        })]

        #[test]
        fn test_identical_candidate_never_wins(
            id in 0u8..=9,
            over in 0i32..20,
            ssd in 0i32..500,
            max_noise in -5.0f32..5.0,
            tot in -50.0f32..50.0,
            bits in 0i32..4095,
        ) {
            let d = [0.5; SFBMAX];
            let cmp = from_id(id);
            let best = noise(over, ssd, max_noise, tot, bits);
            let mut calc = best;
            // the penalty heuristic compares a different quantity than max_noise
            prop_assume!(id != 8);
            prop_assert!(!cmp.is_better(&best, &mut calc, &d, 21) || id == 6);
        }
    }
}
