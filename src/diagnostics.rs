//! Per-granule trace collection
//!
//! Records the block type, entropy and quantization result of every
//! granule/channel an encoder produces, and saves them as JSON for offline
//! inspection. The collector belongs to one encoder instance.
//!
//! This module is only available when the "diagnostics" feature is enabled.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;

use crate::config::{Config, MpegVersion, RateControl};
use crate::encoder::{EncodedFrame, FrameAnalysis};

/// Quantization of one granule/channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GranuleTrace {
    pub granule: usize,
    pub channel: usize,
    pub block_type: String,
    /// Perceptual entropy the bit allocation used
    pub pe: f32,
    pub global_gain: i32,
    pub part2_3_length: u32,
    pub part2_length: u32,
    /// Bands whose noise exceeds the allowed noise
    pub over_count: i32,
    /// Worst band noise over the allowed noise, log10
    pub max_noise: f32,
}

/// One encoded frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameTrace {
    /// Frame number (1-based)
    pub frame_number: u64,
    pub bitrate_index: usize,
    pub mid_side: bool,
    pub used_bits: i32,
    pub stuffing_bits: i32,
    pub granules: Vec<GranuleTrace>,
}

/// Stream parameters of a trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceMetadata {
    /// Creation timestamp
    pub created_at: String,
    pub sample_rate: u32,
    pub channels: usize,
    pub mpeg_version: MpegVersion,
    /// Rate control mode and its parameters
    pub rate_control: String,
}

/// Complete trace of one stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsTrace {
    pub metadata: TraceMetadata,
    pub frames: Vec<FrameTrace>,
}

/// Trace collector owned by an encoder
#[derive(Debug, Clone)]
pub struct DiagnosticsCollector {
    trace: DiagnosticsTrace,
    /// Frames kept at most; later frames are dropped
    frame_limit: Option<usize>,
}

impl DiagnosticsCollector {
    pub fn new(config: &Config) -> Self {
        let rate_control = match config.rate {
            RateControl::Cbr { bitrate } => format!("cbr {} kbps", bitrate),
            RateControl::Abr { mean_bitrate, .. } => format!("abr {} kbps", mean_bitrate),
            RateControl::Vbr { quality, .. } => format!("vbr q{} {:?}", quality, config.quant.vbr_solver),
        };
        Self {
            trace: DiagnosticsTrace {
                metadata: TraceMetadata {
                    created_at: chrono::Utc::now().to_rfc3339(),
                    sample_rate: config.wave.sample_rate,
                    channels: config.channels(),
                    mpeg_version: config.mpeg_version(),
                    rate_control,
                },
                frames: Vec::new(),
            },
            frame_limit: None,
        }
    }

    pub fn with_frame_limit(mut self, limit: usize) -> Self {
        self.frame_limit = Some(limit);
        self
    }

    /// Record one encoded frame
    pub fn record(&mut self, frame_number: u64, analysis: &FrameAnalysis, encoded: &EncodedFrame) {
        if self.frame_limit.is_some_and(|limit| self.trace.frames.len() >= limit) {
            return;
        }
        let mut granules = Vec::new();
        for (gr, granule) in analysis.granules.iter().enumerate() {
            let pe = if encoded.mid_side { &granule.psy.pe_ms } else { &granule.psy.pe };
            for ch in 0..granule.xr.len() {
                let gi = &encoded.side.gr[gr][ch];
                let report = &encoded.reports[gr][ch];
                granules.push(GranuleTrace {
                    granule: gr,
                    channel: ch,
                    block_type: format!("{:?}", gi.block_type),
                    pe: pe[ch],
                    global_gain: gi.global_gain,
                    part2_3_length: gi.part2_3_length,
                    part2_length: gi.part2_length,
                    over_count: report.over_count,
                    max_noise: report.max_noise,
                });
            }
        }
        self.trace.frames.push(FrameTrace {
            frame_number,
            bitrate_index: encoded.bitrate_index,
            mid_side: encoded.mid_side,
            used_bits: encoded.used_bits,
            stuffing_bits: encoded.stuffing_bits,
            granules,
        });
    }

    pub fn trace(&self) -> &DiagnosticsTrace {
        &self.trace
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.trace)
    }

    /// Save collected data to a JSON file
    pub fn save_to_file(&self, filename: &str) -> Result<(), Box<dyn std::error::Error>> {
        let json = self.to_json()?;
        let mut file = File::create(filename)?;
        file.write_all(json.as_bytes())?;
        log::info!("Diagnostics trace saved to: {}", filename);
        Ok(())
    }

    /// Load a trace from a JSON file
    pub fn load_from_file(filename: &str) -> Result<DiagnosticsTrace, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(filename)?;
        let trace: DiagnosticsTrace = serde_json::from_str(&content)?;
        Ok(trace)
    }
}
