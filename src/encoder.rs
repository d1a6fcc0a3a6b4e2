//! Perceptual encoder core
//!
//! `PerceptualEncoder` owns everything that lives for the length of a stream:
//! the partition tables, the analyzer history, the reservoir and the
//! quantizers. Encoding a frame takes two steps. `analyze_granule` runs the
//! psychoacoustic model on the analysis spectra of one granule and returns the
//! result for the previous one; `encode_frame` takes the MDCT coefficients of a
//! frame together with those delayed results and quantizes it.

use crate::bit_allocation::{BitAllocationPlanner, FrameGeometry};
use crate::config::{ChannelMode, Config, RateControl};
use crate::controllers::{self, ControllerContext, FramePlan, GranuleReport, RateController};
use crate::error::{ConfigError, EncodingResult, InputDataError};
use crate::huffman::{BitCostEstimator, HuffmanBitCounter};
use crate::outer_loop::GranuleQuantizer;
use crate::partition::PartitionTables;
use crate::psymodel::{AnalysisContext, PsyGranuleResult, PsychoacousticAnalyzer};
use crate::quantize::{QuantizeContext, StepSearchState};
use crate::reservoir::{BitReservoir, Reservoir};
use crate::tables::ScalefactorBands;
use crate::types::{
    BlockType, ChannelSpectrum, FrameSideInfo, GranuleChannelState, SpectralEnergyProvider, GRANULE_SIZE,
    MAX_CHANNELS, MAX_GRANULES,
};

#[cfg(feature = "diagnostics")]
use crate::diagnostics::DiagnosticsCollector;

/// Pre-echo clamp strength of variable and average bitrate streams
const PCFACT_VBR: f32 = 0.6;
const PCFACT_ABR: f32 = 1.0;

/// Quantizer input of one granule
#[derive(Debug, Clone)]
pub struct GranuleAnalysis {
    /// MDCT coefficients per channel; short blocks interleaved as `xr[3 * line + window]`
    pub xr: Vec<[f32; GRANULE_SIZE]>,
    /// Analyzer result describing this granule
    pub psy: PsyGranuleResult,
}

/// Quantizer input of one frame
#[derive(Debug, Clone, Default)]
pub struct FrameAnalysis {
    pub granules: Vec<GranuleAnalysis>,
}

/// One quantized frame, ready for the bitstream writer
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub side: FrameSideInfo,
    pub bitrate_index: usize,
    pub mid_side: bool,
    pub padding: bool,
    /// Bytes of earlier frames the main data starts in
    pub main_data_begin: i32,
    pub stuffing_bits: i32,
    pub used_bits: i32,
    pub reports: [[GranuleReport; MAX_CHANNELS]; MAX_GRANULES],
}

/// Psychoacoustic analysis and quantization of one stream
pub struct PerceptualEncoder {
    config: Config,
    tables: PartitionTables,
    analyzer: PsychoacousticAnalyzer,
    planner: BitAllocationPlanner,
    quantizer: GranuleQuantizer,
    reservoir: Reservoir,
    controller: Box<dyn RateController>,
    step: [StepSearchState; MAX_CHANNELS],
    frames: u64,
    #[cfg(feature = "diagnostics")]
    diagnostics: Option<DiagnosticsCollector>,
}

impl PerceptualEncoder {
    /// Encoder counting bits with the standard Layer III code books
    pub fn new(config: Config) -> EncodingResult<Self> {
        let bands = Self::bands_for(&config)?;
        let estimator = Box::new(HuffmanBitCounter::new(&bands));
        Self::with_estimator(config, estimator)
    }

    /// Encoder counting bits with a caller-supplied estimator
    pub fn with_estimator(config: Config, estimator: Box<dyn BitCostEstimator>) -> EncodingResult<Self> {
        config.validate()?;
        let bands = Self::bands_for(&config)?;
        let tables = PartitionTables::new(config.wave.sample_rate, &bands, &config.psy)?;

        let ctx = QuantizeContext::new(&config, &tables);
        let quantizer = GranuleQuantizer::new(&config, ctx, estimator);
        let cbr_kbps = match config.rate {
            RateControl::Cbr { bitrate } => Some(bitrate),
            _ => None,
        };
        let reservoir = Reservoir::new(FrameGeometry::from_config(&config), cbr_kbps)
            .with_substep_shaping(config.quant.substep_shaping & 1 != 0);

        log::debug!(
            "encoder: {} Hz, {} channels, {:?}, {:?}",
            config.wave.sample_rate,
            config.channels(),
            config.wave.mode,
            config.rate
        );
        Ok(Self {
            analyzer: PsychoacousticAnalyzer::new(&config),
            planner: BitAllocationPlanner::new(&config),
            controller: controllers::for_config(&config),
            step: [StepSearchState::default(); MAX_CHANNELS],
            frames: 0,
            #[cfg(feature = "diagnostics")]
            diagnostics: None,
            config,
            tables,
            quantizer,
            reservoir,
        })
    }

    fn bands_for(config: &Config) -> EncodingResult<ScalefactorBands> {
        ScalefactorBands::for_index(config.samplerate_index())
            .ok_or_else(|| ConfigError::UnsupportedSampleRate(config.wave.sample_rate).into())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tables(&self) -> &PartitionTables {
        &self.tables
    }

    pub fn reservoir(&self) -> &Reservoir {
        &self.reservoir
    }

    /// Frames encoded so far
    pub fn frames_encoded(&self) -> u64 {
        self.frames
    }

    #[cfg(feature = "diagnostics")]
    pub fn enable_diagnostics(&mut self) {
        self.diagnostics = Some(DiagnosticsCollector::new(&self.config));
    }

    #[cfg(feature = "diagnostics")]
    pub fn diagnostics(&self) -> Option<&DiagnosticsCollector> {
        self.diagnostics.as_ref()
    }

    /// Pre-echo clamp strength for the next analysis
    ///
    /// A constant bitrate stream can afford the clamp only as far as its
    /// reservoir is filled.
    fn pcfact(&self) -> f32 {
        match self.config.rate {
            RateControl::Cbr { .. } => {
                let capacity = self.reservoir.capacity();
                if capacity > 0 {
                    (self.reservoir.size() as f32 / capacity as f32 * 0.5).clamp(0.0, 0.5)
                } else {
                    0.0
                }
            }
            RateControl::Abr { .. } => PCFACT_ABR,
            RateControl::Vbr { .. } => PCFACT_VBR,
        }
    }

    /// Analyse the spectra of one granule; returns the result of the previous one
    pub fn analyze_granule(&mut self, spectra: &[ChannelSpectrum]) -> EncodingResult<PsyGranuleResult> {
        let ctx = AnalysisContext {
            tables: &self.tables,
            pcfact: self.pcfact(),
            masking_lower: self.planner.masking_lower(BlockType::Normal),
        };
        Ok(self.analyzer.analyze(&ctx, spectra)?)
    }

    /// Analyse block `block` as supplied by `provider`, one spectrum per channel
    pub fn analyze_from<P: SpectralEnergyProvider + ?Sized>(
        &mut self,
        provider: &mut P,
        block: usize,
    ) -> EncodingResult<PsyGranuleResult> {
        let spectra: Vec<ChannelSpectrum> = (0..self.config.channels())
            .map(|channel| provider.compute_spectrum(block, channel))
            .collect();
        self.analyze_granule(&spectra)
    }

    /// Quantize one frame and settle it with the reservoir
    pub fn encode_frame(&mut self, frame: FrameAnalysis) -> EncodingResult<EncodedFrame> {
        self.validate_frame(&frame)?;
        let mut plan = self.plan(&frame);
        let mid_side = plan.mid_side;

        let cx = ControllerContext {
            quantizer: &self.quantizer,
            planner: &self.planner,
            reservoir: &mut self.reservoir,
            step: &mut self.step,
        };
        let outcome = self.controller.encode_frame(cx, &mut plan)?;
        self.frames += 1;
        log::debug!(
            "frame {}: index {}, {} bits used, {} stuffing{}",
            self.frames,
            outcome.bitrate_index,
            outcome.used_bits,
            outcome.stuffing_bits,
            if mid_side { ", mid/side" } else { "" }
        );

        let encoded = EncodedFrame {
            side: plan.side,
            bitrate_index: outcome.bitrate_index,
            mid_side,
            padding: self.reservoir.padding(),
            main_data_begin: self.reservoir.main_data_begin(),
            stuffing_bits: outcome.stuffing_bits,
            used_bits: outcome.used_bits,
            reports: outcome.reports,
        };

        #[cfg(feature = "diagnostics")]
        if let Some(collector) = self.diagnostics.as_mut() {
            collector.record(self.frames, &frame, &encoded);
        }

        Ok(encoded)
    }

    fn validate_frame(&self, frame: &FrameAnalysis) -> EncodingResult<()> {
        let granules = self.config.granules_per_frame();
        if frame.granules.len() != granules {
            return Err(InputDataError::InvalidGranuleCount {
                expected: granules,
                actual: frame.granules.len(),
            }
            .into());
        }
        let channels = self.config.channels();
        for granule in &frame.granules {
            if granule.xr.len() != channels {
                return Err(InputDataError::InvalidChannelCount {
                    expected: channels,
                    actual: granule.xr.len(),
                }
                .into());
            }
            for xr in &granule.xr {
                if let Some(index) = xr.iter().position(|v| !v.is_finite()) {
                    return Err(InputDataError::NonFinite { index }.into());
                }
            }
        }
        Ok(())
    }

    /// Mid/side when every granule agrees on the block types and the mid/side
    /// pair needs no more entropy than left/right
    fn use_mid_side(&self, frame: &FrameAnalysis) -> bool {
        if self.config.wave.mode != ChannelMode::StereoMs || self.config.channels() != 2 {
            return false;
        }
        let (mut pe_ms, mut pe_lr) = (0.0, 0.0);
        for granule in &frame.granules {
            let psy = &granule.psy;
            if psy.block_type[0] != psy.block_type[1] {
                return false;
            }
            pe_ms += psy.pe_ms[0] + psy.pe_ms[1];
            pe_lr += psy.pe[0] + psy.pe[1];
        }
        pe_ms <= pe_lr
    }

    fn plan(&self, frame: &FrameAnalysis) -> FramePlan {
        let mid_side = self.use_mid_side(frame);
        let mut plan = FramePlan {
            side: FrameSideInfo::default(),
            ratio: Default::default(),
            pe: [[0.0; MAX_CHANNELS]; MAX_GRANULES],
            ms_ener_ratio: [0.5; MAX_GRANULES],
            mid_side,
        };
        for (gr, granule) in frame.granules.iter().enumerate() {
            let psy = &granule.psy;
            let (ratio, pe) = if mid_side {
                (&psy.masking_ms, &psy.pe_ms)
            } else {
                (&psy.masking, &psy.pe)
            };
            plan.ms_ener_ratio[gr] = psy.ms_ener_ratio();
            for (ch, xr) in granule.xr.iter().enumerate() {
                plan.side.gr[gr][ch] = GranuleChannelState::new(xr, psy.block_type[ch]);
                plan.ratio[gr][ch] = ratio[ch];
                plan.pe[gr][ch] = pe[ch];
            }
        }
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VbrSolver;
    use crate::error::EncoderError;

    fn silent_frame(config: &Config, psy: &PsyGranuleResult) -> FrameAnalysis {
        FrameAnalysis {
            granules: (0..config.granules_per_frame())
                .map(|_| GranuleAnalysis {
                    xr: vec![[0.0; GRANULE_SIZE]; config.channels()],
                    psy: psy.clone(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_rejects_wrong_granule_count() {
        let config = Config::new();
        let mut encoder = PerceptualEncoder::new(config.clone()).unwrap();
        let psy = encoder.analyze_granule(&[ChannelSpectrum::silent(), ChannelSpectrum::silent()]).unwrap();
        let mut frame = silent_frame(&config, &psy);
        frame.granules.pop();
        assert!(matches!(
            encoder.encode_frame(frame),
            Err(EncoderError::InputData(InputDataError::InvalidGranuleCount { expected: 2, actual: 1 }))
        ));
    }

    #[test]
    fn test_rejects_non_finite_coefficients() {
        let config = Config::new();
        let mut encoder = PerceptualEncoder::new(config.clone()).unwrap();
        let psy = encoder.analyze_granule(&[ChannelSpectrum::silent(), ChannelSpectrum::silent()]).unwrap();
        let mut frame = silent_frame(&config, &psy);
        frame.granules[1].xr[0][17] = f32::NAN;
        assert!(matches!(
            encoder.encode_frame(frame),
            Err(EncoderError::InputData(InputDataError::NonFinite { index: 17 }))
        ));
    }

    #[test]
    fn test_silent_frames_for_every_mode() {
        for config in [Config::new(), Config::abr(96), Config::vbr(5, VbrSolver::Direct)] {
            let mut encoder = PerceptualEncoder::new(config.clone()).unwrap();
            for _ in 0..3 {
                let psy = encoder.analyze_granule(&[ChannelSpectrum::silent(), ChannelSpectrum::silent()]).unwrap();
                let frame = encoder.encode_frame(silent_frame(&config, &psy)).unwrap();
                assert_eq!(frame.used_bits, 0);
                assert!(frame.stuffing_bits >= 0);
            }
            assert_eq!(encoder.frames_encoded(), 3);
        }
    }

    /// Alternates loud and silent blocks and records every request
    struct AlternatingSource {
        requests: Vec<(usize, usize)>,
    }

    impl SpectralEnergyProvider for AlternatingSource {
        fn compute_spectrum(&mut self, block: usize, channel: usize) -> ChannelSpectrum {
            self.requests.push((block, channel));
            let mut spectrum = ChannelSpectrum::silent();
            if block % 2 == 0 {
                for (k, v) in spectrum.long.iter_mut().enumerate() {
                    *v = 4000.0 / (1.0 + k as f32 * 0.05) * if k % 3 == 0 { 1.0 } else { -0.5 };
                }
                for window in spectrum.short.iter_mut() {
                    for (k, v) in window.iter_mut().enumerate() {
                        *v = 1000.0 / (1.0 + k as f32 * 0.1);
                    }
                }
            }
            spectrum
        }
    }

    #[test]
    fn test_provider_feeds_every_channel() {
        let config = Config::new();
        let mut from_provider = PerceptualEncoder::new(config.clone()).unwrap();
        let mut direct = PerceptualEncoder::new(config).unwrap();
        let mut source = AlternatingSource { requests: Vec::new() };
        let mut reference = AlternatingSource { requests: Vec::new() };

        for block in 0..3 {
            let a = from_provider.analyze_from(&mut source, block).unwrap();
            let spectra = [reference.compute_spectrum(block, 0), reference.compute_spectrum(block, 1)];
            let b = direct.analyze_granule(&spectra).unwrap();
            assert_eq!(a, b);
        }
        assert_eq!(source.requests, vec![(0, 0), (0, 1), (1, 0), (1, 1), (2, 0), (2, 1)]);
    }

    #[test]
    fn test_pcfact_follows_rate_mode() {
        let cbr = PerceptualEncoder::new(Config::new()).unwrap();
        assert_eq!(cbr.pcfact(), 0.0);
        let vbr = PerceptualEncoder::new(Config::vbr(2, VbrSolver::OuterLoop)).unwrap();
        assert_eq!(vbr.pcfact(), PCFACT_VBR);
        let abr = PerceptualEncoder::new(Config::abr(160)).unwrap();
        assert_eq!(abr.pcfact(), PCFACT_ABR);
    }

    #[test]
    fn test_mid_side_needs_matching_block_types() {
        let mut config = Config::new();
        config.wave.mode = ChannelMode::StereoMs;
        let encoder = PerceptualEncoder::new(config.clone()).unwrap();
        let mut psy = PsyGranuleResult {
            masking: Default::default(),
            masking_ms: Default::default(),
            pe: [500.0, 500.0],
            pe_ms: [400.0, 100.0],
            energy: [1.0; 4],
            block_type: [BlockType::Normal; 2],
            ms_ratio: 0.3,
            ms_ratio_next: 0.3,
        };
        assert!(encoder.use_mid_side(&silent_frame(&config, &psy)));
        psy.block_type[1] = BlockType::Start;
        assert!(!encoder.use_mid_side(&silent_frame(&config, &psy)));
    }
}
