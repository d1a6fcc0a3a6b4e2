//! Interchannel masking adjustment
//!
//! Runs after the per-channel analysis of a granule. Channel indices follow the
//! analyzer: 0 left, 1 right, 2 mid, 3 side.

use crate::partition::PartitionTables;
use crate::types::{MaskingRatio, BLKSIZE, BLKSIZE_S, SBMAX_L, SBMAX_S};

/// Left/right thresholds further apart than this ratio (about 2 dB) are left alone
const DEMASK_LIMIT: f32 = 1.58;

/// Adds cross-channel masking and tightens mid/side thresholds
#[derive(Debug, Clone, PartialEq)]
pub struct InterchannelMaskingAdjuster {
    /// Fraction of the opposite channel's threshold added to each channel
    pub interch_ratio: f32,
    /// Mid/side fixup factor, 0 disables
    pub msfix: f32,
    /// Linear threshold-in-quiet scale
    pub ath_factor: f32,
}

impl InterchannelMaskingAdjuster {
    pub fn new(interch_ratio: f32, msfix: f32, ath_factor: f32) -> Self {
        Self {
            interch_ratio,
            msfix,
            ath_factor,
        }
    }

    /// Apply every enabled adjustment to the ratios of one granule
    ///
    /// `ratios` holds two entries for a left/right pair or four when mid/side
    /// channels were analysed as well. The mid/side thresholds are only touched
    /// when `msfix` is set.
    pub fn adjust(&self, tables: &PartitionTables, ratios: &mut [MaskingRatio]) {
        if ratios.len() < 2 {
            return;
        }
        if self.interch_ratio != 0.0 {
            let (left, rest) = ratios.split_at_mut(1);
            mix_thresholds(&mut left[0], &mut rest[0], self.interch_ratio);
        }
        if ratios.len() == 4 && self.msfix != 0.0 {
            demask_mid_side(tables, ratios);
            self.fix_mid_side(tables, ratios);
        }
    }

    /// Cap mid+side thresholds against the lower left/right threshold
    ///
    /// Each threshold is floored at the threshold in quiet before the comparison.
    /// The result never exceeds the original mid or side threshold.
    pub fn fix_mid_side(&self, tables: &PartitionTables, ratios: &mut [MaskingRatio]) {
        let msfix = self.msfix * 2.0;

        for sb in 0..SBMAX_L {
            let ath = tables.long.ath[tables.long.bm[sb]] * self.ath_factor;
            let (m, s) = scaled_pair(
                ratios[0].thm.l[sb],
                ratios[1].thm.l[sb],
                ratios[2].thm.l[sb],
                ratios[3].thm.l[sb],
                ath,
                msfix,
            );
            ratios[2].thm.l[sb] = m.min(ratios[2].thm.l[sb]);
            ratios[3].thm.l[sb] = s.min(ratios[3].thm.l[sb]);
        }

        let ath_factor = self.ath_factor * (BLKSIZE_S as f32 / BLKSIZE as f32);
        for sb in 0..SBMAX_S {
            let ath = tables.short.ath[tables.short.bm[sb]] * ath_factor;
            for w in 0..3 {
                let (m, s) = scaled_pair(
                    ratios[0].thm.s[sb][w],
                    ratios[1].thm.s[sb][w],
                    ratios[2].thm.s[sb][w],
                    ratios[3].thm.s[sb][w],
                    ath,
                    msfix,
                );
                ratios[2].thm.s[sb][w] = m.min(ratios[2].thm.s[sb][w]);
                ratios[3].thm.s[sb][w] = s.min(ratios[3].thm.s[sb][w]);
            }
        }
    }
}

fn scaled_pair(l: f32, r: f32, m: f32, s: f32, ath: f32, msfix: f32) -> (f32, f32) {
    let thm_lr = l.max(ath).min(r.max(ath));
    let mut thm_m = m.max(ath);
    let mut thm_s = s.max(ath);
    if thm_lr * msfix < thm_m + thm_s {
        let f = thm_lr * msfix / (thm_m + thm_s);
        thm_m *= f;
        thm_s *= f;
    }
    (thm_m, thm_s)
}

/// Add `ratio` times the opposite channel's threshold to each channel
pub fn mix_thresholds(left: &mut MaskingRatio, right: &mut MaskingRatio, ratio: f32) {
    for sb in 0..SBMAX_L {
        let (l, r) = (left.thm.l[sb], right.thm.l[sb]);
        left.thm.l[sb] += r * ratio;
        right.thm.l[sb] += l * ratio;
    }
    for sb in 0..SBMAX_S {
        for w in 0..3 {
            let (l, r) = (left.thm.s[sb][w], right.thm.s[sb][w]);
            left.thm.s[sb][w] += r * ratio;
            right.thm.s[sb][w] += l * ratio;
        }
    }
}

/// Binaural masking level difference bound on mid/side thresholds
///
/// Only applied where the left and right thresholds are within about 2 dB.
pub fn demask_mid_side(tables: &PartitionTables, ratios: &mut [MaskingRatio]) {
    for sb in 0..SBMAX_L {
        let (l, r) = (ratios[0].thm.l[sb], ratios[1].thm.l[sb]);
        if l > DEMASK_LIMIT * r || r > DEMASK_LIMIT * l {
            continue;
        }
        let mld = tables.long.mld[sb];
        let (m, s) = (ratios[2].thm.l[sb], ratios[3].thm.l[sb]);
        let rmid = m.max(s.min(mld * ratios[3].en.l[sb]));
        let rside = s.max(m.min(mld * ratios[2].en.l[sb]));
        ratios[2].thm.l[sb] = rmid;
        ratios[3].thm.l[sb] = rside;
    }

    for sb in 0..SBMAX_S {
        let mld = tables.short.mld[sb];
        for w in 0..3 {
            let (l, r) = (ratios[0].thm.s[sb][w], ratios[1].thm.s[sb][w]);
            if l > DEMASK_LIMIT * r || r > DEMASK_LIMIT * l {
                continue;
            }
            let (m, s) = (ratios[2].thm.s[sb][w], ratios[3].thm.s[sb][w]);
            let rmid = m.max(s.min(mld * ratios[3].en.s[sb][w]));
            let rside = s.max(m.min(mld * ratios[2].en.s[sb][w]));
            ratios[2].thm.s[sb][w] = rmid;
            ratios[3].thm.s[sb][w] = rside;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PsyConfig;
    use crate::tables::ScalefactorBands;
    use crate::types::SfbValues;
    use proptest::prelude::*;

    fn tables() -> PartitionTables {
        let bands = ScalefactorBands::for_index(0).unwrap();
        PartitionTables::new(44100, &bands, &PsyConfig::default()).unwrap()
    }

    fn ratio(en: f32, thm: f32) -> MaskingRatio {
        MaskingRatio {
            en: SfbValues::filled(en),
            thm: SfbValues::filled(thm),
        }
    }

    #[test]
    fn test_mixing_is_symmetric() {
        let mut left = ratio(1.0, 10.0);
        let mut right = ratio(1.0, 20.0);
        mix_thresholds(&mut left, &mut right, 0.5);
        assert_eq!(left.thm.l[3], 20.0);
        assert_eq!(right.thm.l[3], 25.0);
        assert_eq!(right.thm.s[2][1], 25.0);
    }

    #[test]
    fn test_zero_ratio_and_no_msfix_keep_equal_mid_side() {
        let t = tables();
        let adjuster = InterchannelMaskingAdjuster::new(0.0, 0.0, 1.0);
        let mut ratios = [ratio(1e6, 100.0), ratio(1e6, 100.0), ratio(1e6, 40.0), ratio(1e5, 40.0)];
        let before = ratios;
        adjuster.adjust(&t, &mut ratios);
        assert_eq!(ratios, before);
    }

    #[test]
    fn test_no_msfix_keeps_unequal_mid_side() {
        let t = tables();
        let adjuster = InterchannelMaskingAdjuster::new(0.0, 0.0, 1.0);
        let mut ratios = [ratio(1e12, 100.0), ratio(1e12, 100.0), ratio(1e12, 10.0), ratio(1e12, 40.0)];
        let before = ratios;
        adjuster.adjust(&t, &mut ratios);
        assert_eq!(ratios[2], before[2]);
        assert_eq!(ratios[3], before[3]);
    }

    #[test]
    fn test_msfix_reduces_mid_side_sum() {
        let t = tables();
        let adjuster = InterchannelMaskingAdjuster::new(0.0, 0.5, 0.0);
        let mut ratios = [ratio(1e6, 100.0), ratio(1e6, 100.0), ratio(1e6, 90.0), ratio(1e5, 90.0)];
        adjuster.adjust(&t, &mut ratios);
        for sb in 0..SBMAX_L {
            let sum = ratios[2].thm.l[sb] + ratios[3].thm.l[sb];
            assert!(sum < 180.0);
            assert!((sum - 100.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_demasking_skips_dissimilar_channels() {
        let t = tables();
        let mut ratios = [ratio(1e6, 100.0), ratio(1e6, 1000.0), ratio(1e6, 1.0), ratio(1e6, 50.0)];
        demask_mid_side(&t, &mut ratios);
        assert_eq!(ratios[2].thm.l[5], 1.0);
        assert_eq!(ratios[3].thm.l[5], 50.0);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 100,
            failure_persistence: None,
            .. ProptestConfig::default()
        })]

        #[test]
        fn test_msfix_never_raises_thresholds(
            lr in 1.0f32..1e4,
            m in 1.0f32..1e4,
            s in 1.0f32..1e4,
            msfix in 0.1f32..4.0,
        ) {
            let t = tables();
            let adjuster = InterchannelMaskingAdjuster::new(0.0, msfix, 1.0);
            let mut ratios = [ratio(1e6, lr), ratio(1e6, lr), ratio(1e6, m), ratio(1e6, s)];
            adjuster.fix_mid_side(&t, &mut ratios);
            for sb in 0..SBMAX_L {
                prop_assert!(ratios[2].thm.l[sb] <= m);
                prop_assert!(ratios[3].thm.l[sb] <= s);
                prop_assert!(ratios[2].thm.l[sb] >= 0.0);
            }
        }
    }
}
