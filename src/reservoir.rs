//! Bit reservoir
//!
//! Frames may borrow bits left unused by earlier frames, up to what
//! `main_data_begin` can address and a decoder can buffer. Each granule and
//! channel is charged as soon as it is quantized; the frame's own bits are
//! added and the surplus settled once all of them are done.

use crate::bit_allocation::FrameGeometry;
use crate::types::GranuleChannelState;

/// Main data buffer a decoder must hold, in bits
pub const MAX_MP3_BUFFER_BITS: i32 = 8 * 1440;

/// Bit totals of one frame at a given bitrate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameBits {
    /// Main data bits the frame may spend, reservoir included
    pub frame_bits: i32,
    /// Main data bits of one granule at the frame's bitrate
    pub mean_bits: i32,
}

/// Rolling surplus of bits carried between frames
pub trait BitReservoir {
    /// Start a frame at `bitrate_index`
    fn begin_frame(&mut self, bitrate_index: usize) -> FrameBits;

    /// Target and extra bits one granule may use: `(targ_bits, extra_bits)`
    fn max_bits(&self, mean_bits: i32, cbr: bool) -> (i32, i32);

    /// Account for the bits spent on one granule/channel
    fn adjust(&mut self, gi: &GranuleChannelState);

    /// Close the frame; returns the stuffing bits written to keep byte alignment
    /// and the reservoir within its limit
    fn end_frame(&mut self, mean_bits: i32) -> i32;

    /// Bits currently held
    fn size(&self) -> i32;

    /// Largest number of bits the reservoir may hold this frame
    fn capacity(&self) -> i32;
}

/// Reservoir limited by `main_data_begin` and the decoder buffer
#[derive(Debug, Clone)]
pub struct Reservoir {
    geometry: FrameGeometry,
    resv_size: i32,
    resv_max: i32,
    main_data_begin: i32,
    /// Keep a tenth of the reservoir free and skip the slow build-up
    substep_shaping: bool,
    /// Fractional slot per frame of a constant bitrate stream and its running lag
    frac_spf: i64,
    slot_lag: i64,
    padding: bool,
    drain_pre: i32,
}

impl Reservoir {
    /// `cbr_kbps` enables padding slots for constant bitrate streams
    pub fn new(geometry: FrameGeometry, cbr_kbps: Option<u32>) -> Self {
        let frac_spf = cbr_kbps
            .map(|kbps| geometry.slot_multiplier() as i64 * kbps as i64 % geometry.sample_rate as i64)
            .unwrap_or(0);
        Self {
            geometry,
            resv_size: 0,
            resv_max: 0,
            main_data_begin: 0,
            substep_shaping: false,
            frac_spf,
            slot_lag: frac_spf,
            padding: false,
            drain_pre: 0,
        }
    }

    pub fn with_substep_shaping(mut self, enabled: bool) -> Self {
        self.substep_shaping = enabled;
        self
    }

    /// Bytes of the previous frames the current frame's main data starts in
    pub fn main_data_begin(&self) -> i32 {
        self.main_data_begin
    }

    /// Whether the current frame carries a padding slot
    pub fn padding(&self) -> bool {
        self.padding
    }

    /// Stuffing bits of the last frame written into earlier frames' space
    pub fn drain_pre(&self) -> i32 {
        self.drain_pre
    }
}

impl BitReservoir for Reservoir {
    fn begin_frame(&mut self, bitrate_index: usize) -> FrameBits {
        self.padding = false;
        if self.frac_spf != 0 {
            self.slot_lag -= self.frac_spf;
            if self.slot_lag < 0 {
                self.slot_lag += self.geometry.sample_rate as i64;
                self.padding = true;
            }
        }

        let granules = self.geometry.granules as i32;
        let frame_length = self.geometry.frame_bits(bitrate_index, self.padding) as i32;
        let mean_bits = (frame_length - self.geometry.sideinfo_len as i32 * 8) / granules;

        let resv_limit = 8 * 256 * granules - 8;
        self.resv_max = (MAX_MP3_BUFFER_BITS - frame_length).min(resv_limit).max(0);
        self.main_data_begin = self.resv_size / 8;

        let frame_bits = (mean_bits * granules + self.resv_size.min(self.resv_max)).min(MAX_MP3_BUFFER_BITS);
        log::trace!(
            "reservoir frame begin: index {}, {} frame bits, {} held of {}",
            bitrate_index,
            frame_bits,
            self.resv_size,
            self.resv_max
        );
        FrameBits { frame_bits, mean_bits }
    }

    fn max_bits(&self, mean_bits: i32, cbr: bool) -> (i32, i32) {
        let mut resv_size = self.resv_size;
        let mut resv_max = self.resv_max;
        if cbr {
            resv_size += mean_bits;
        }
        if self.substep_shaping {
            resv_max = (resv_max as f32 * 0.9) as i32;
        }

        let mut targ_bits = mean_bits;
        let add_bits = if resv_size * 10 > resv_max * 9 {
            let add = resv_size - (resv_max * 9) / 10;
            targ_bits += add;
            add
        } else {
            // Builds the reservoir up slowly
            if !self.substep_shaping {
                targ_bits = (targ_bits as f32 - 0.1 * mean_bits as f32) as i32;
            }
            0
        };

        // At most 6/10 of the reservoir may go to one granule
        let extra_bits = (resv_size.min((self.resv_max * 6) / 10) - add_bits).max(0);
        (targ_bits, extra_bits)
    }

    fn adjust(&mut self, gi: &GranuleChannelState) {
        self.resv_size -= gi.total_bits() as i32;
    }

    fn end_frame(&mut self, mean_bits: i32) -> i32 {
        self.resv_size += mean_bits * self.geometry.granules as i32;

        let mut stuffing = self.resv_size.rem_euclid(8);
        let over_bits = self.resv_size - stuffing - self.resv_max;
        if over_bits > 0 {
            stuffing += over_bits;
        }

        // Stuffing goes into the previous frame's space first
        let mdb_bytes = (self.main_data_begin * 8).min(stuffing) / 8;
        self.drain_pre = 8 * mdb_bytes;
        self.resv_size -= 8 * mdb_bytes;
        self.main_data_begin -= mdb_bytes;
        let drain_post = stuffing - 8 * mdb_bytes;
        self.resv_size -= drain_post;

        if stuffing > 0 {
            log::trace!("reservoir stuffing: {} pre, {} post", self.drain_pre, drain_post);
        }
        stuffing
    }

    fn size(&self) -> i32 {
        self.resv_size
    }

    fn capacity(&self) -> i32 {
        self.resv_max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, RateControl};
    use proptest::prelude::*;

    fn geometry(sample_rate: u32, channels: u8) -> FrameGeometry {
        let mut config = Config::new();
        config.wave.sample_rate = sample_rate;
        config.wave.channels = channels.into();
        if channels == 1 {
            config.wave.mode = crate::config::ChannelMode::Mono;
        }
        FrameGeometry::from_config(&config)
    }

    fn spend(bits: u32) -> GranuleChannelState {
        GranuleChannelState {
            part2_3_length: bits,
            ..GranuleChannelState::default()
        }
    }

    #[test]
    fn test_first_frame_at_128_kbps() {
        let mut reservoir = Reservoir::new(geometry(44100, 2), Some(128));
        let bits = reservoir.begin_frame(9);
        assert!(!reservoir.padding());
        // 417 bytes, minus 36 bytes of header and side information, over two granules
        assert_eq!(bits.mean_bits, (417 * 8 - 36 * 8) / 2);
        assert_eq!(bits.frame_bits, bits.mean_bits * 2);
        assert_eq!(reservoir.capacity(), 4088);

        reservoir.end_frame(bits.mean_bits);
        reservoir.begin_frame(9);
        assert!(reservoir.padding());
    }

    #[test]
    fn test_unused_bits_are_carried_over() {
        let mut reservoir = Reservoir::new(geometry(44100, 2), None);
        let bits = reservoir.begin_frame(9);
        for _ in 0..4 {
            reservoir.adjust(&spend(bits.mean_bits as u32 / 4));
        }
        let stuffing = reservoir.end_frame(bits.mean_bits);
        assert_eq!(stuffing % 8, stuffing.rem_euclid(8));
        assert!(reservoir.size() > 0);
        let next = reservoir.begin_frame(9);
        assert!(next.frame_bits > next.mean_bits * 2);
        assert_eq!(reservoir.main_data_begin(), reservoir.size() / 8);
    }

    #[test]
    fn test_extra_bits_limited_to_six_tenths() {
        let mut reservoir = Reservoir::new(geometry(44100, 2), None);
        let bits = reservoir.begin_frame(9);
        reservoir.resv_size = reservoir.capacity();
        let (_, extra) = reservoir.max_bits(bits.mean_bits, false);
        assert!(extra <= reservoir.capacity() * 6 / 10);
    }

    #[test]
    fn test_empty_reservoir_builds_up_slowly() {
        let mut reservoir = Reservoir::new(geometry(44100, 2), None);
        let bits = reservoir.begin_frame(9);
        let (targ, extra) = reservoir.max_bits(bits.mean_bits, false);
        assert_eq!(extra, 0);
        assert!(targ < bits.mean_bits);

        let shaped = reservoir.clone().with_substep_shaping(true);
        let (targ, _) = shaped.max_bits(bits.mean_bits, false);
        assert_eq!(targ, bits.mean_bits);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 100,
            failure_persistence: None,
            .. ProptestConfig::default()
        })]

        #[test]
        fn test_frame_end_keeps_reservoir_aligned_and_bounded(
            sample_rate in prop::sample::select(&[44100u32, 48000, 32000, 22050, 24000, 16000]),
            channels in 1u8..=2,
            bitrate_index in 1usize..=8,
            usage in prop::collection::vec(0.0f32..=1.0, 1..8),
        ) {
            let g = geometry(sample_rate, channels);
            let mut reservoir = Reservoir::new(g, None);
            for fraction in usage {
                let bits = reservoir.begin_frame(bitrate_index);
                let per_channel = bits.frame_bits / (g.granules * g.channels) as i32;
                for _ in 0..g.granules * g.channels {
                    reservoir.adjust(&spend((per_channel as f32 * fraction) as u32));
                }
                let stuffing = reservoir.end_frame(bits.mean_bits);
                prop_assert!(stuffing >= 0);
                prop_assert_eq!(reservoir.size() % 8, 0);
                prop_assert!(reservoir.size() >= 0);
                prop_assert!(reservoir.size() <= reservoir.capacity());
            }
        }

        #[test]
        fn test_cbr_padding_rate_matches_fraction(frames in 10usize..200) {
            let mut config = Config::new();
            config.rate = RateControl::Cbr { bitrate: 128 };
            let mut reservoir = Reservoir::new(FrameGeometry::from_config(&config), Some(128));
            let padded = (0..frames)
                .filter(|_| {
                    reservoir.begin_frame(9);
                    reservoir.padding()
                })
                .count();
            // 42300 of every 44100 frames carry a padding byte
            let expected = frames as f64 * 42300.0 / 44100.0;
            prop_assert!((padded as f64 - expected).abs() <= 1.0);
        }
    }
}
