//! Interchannel masking adjustment on hand-built threshold sets

mod common;

use psyquant::config::PsyConfig;
use psyquant::interchannel::InterchannelMaskingAdjuster;
use psyquant::partition::PartitionTables;
use psyquant::tables::ScalefactorBands;
use psyquant::types::{MaskingRatio, SfbValues};

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

/// Left/right thresholds far below mid/side ones
fn quad() -> Vec<MaskingRatio> {
    vec![ratio(1e12, 1e8), ratio(1e12, 1e8), ratio(1e14, 1e12), ratio(1e14, 1e12)]
}

fn mid_side_sum(ratios: &[MaskingRatio]) -> f64 {
    ratios[2..]
        .iter()
        .flat_map(|r| r.thm.l.iter().chain(r.thm.s.iter().flatten()))
        .map(|&t| t as f64)
        .sum()
}

#[test]
fn test_disabled_adjuster_leaves_pair_unchanged() {
    common::init_logging();
    let t = tables();
    let mut pair = vec![ratio(1e10, 1e6), ratio(1e9, 1e7)];
    let before = pair.clone();
    InterchannelMaskingAdjuster::new(0.0, 0.0, 1.0).adjust(&t, &mut pair);
    assert_eq!(pair, before);
}

#[test]
fn test_disabled_fixup_leaves_unequal_mid_side_unchanged() {
    let t = tables();
    let mut ratios = vec![ratio(1e12, 100.0), ratio(1e12, 100.0), ratio(1e12, 10.0), ratio(1e12, 40.0)];
    let before = ratios.clone();
    InterchannelMaskingAdjuster::new(0.0, 0.0, 1.0).adjust(&t, &mut ratios);
    assert_eq!(ratios, before);
}

#[test]
fn test_interchannel_ratio_mixes_thresholds() {
    let t = tables();
    let mut pair = vec![ratio(1e10, 1e6), ratio(1e10, 1e8)];
    InterchannelMaskingAdjuster::new(0.3, 0.0, 1.0).adjust(&t, &mut pair);
    assert!(pair[0].thm.l[5] > 1e6);
    assert!(pair[1].thm.l[5] < 1e8);
}

#[test]
fn test_fixup_never_raises_mid_side_thresholds() {
    let t = tables();
    let mut plain = quad();
    InterchannelMaskingAdjuster::new(0.0, 0.0, 1.0).adjust(&t, &mut plain);
    assert_eq!(plain, quad());

    let mut fixed = quad();
    InterchannelMaskingAdjuster::new(0.0, 1.5, 1.0).adjust(&t, &mut fixed);
    for ch in 2..4 {
        for sb in 0..plain[ch].thm.l.len() {
            assert!(fixed[ch].thm.l[sb] <= plain[ch].thm.l[sb]);
        }
    }
    assert!(mid_side_sum(&fixed) < mid_side_sum(&plain));
    assert_eq!(fixed[0], plain[0]);
    assert_eq!(fixed[1], plain[1]);
}

#[test]
fn test_lower_msfix_allows_less_noise() {
    let t = tables();
    let mut tight = quad();
    InterchannelMaskingAdjuster::new(0.0, 1.0, 1.0).adjust(&t, &mut tight);
    let mut loose = quad();
    InterchannelMaskingAdjuster::new(0.0, 3.0, 1.0).adjust(&t, &mut loose);
    assert!(mid_side_sum(&tight) <= mid_side_sum(&loose));
}
