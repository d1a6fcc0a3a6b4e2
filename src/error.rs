//! Error types for the perceptual coding core
//!
//! Local numeric conditions (silent bands, empty reservoir) are handled in place and
//! never reach these types. What does reach them is either a setup failure, a
//! configuration mistake, or a granule the quantizer genuinely cannot represent.

use thiserror::Error;

/// Main error type for the encoder core
#[derive(Debug, Error)]
pub enum EncoderError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Table construction errors at initialization
    #[error("Setup error: {0}")]
    Setup(#[from] SetupError),

    /// Input data validation errors
    #[error("Input data error: {0}")]
    InputData(#[from] InputDataError),

    /// Quantization errors that escaped the mode controller
    #[error("Quantization error: {0}")]
    Quantization(#[from] QuantizationError),
}

/// Configuration validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Unsupported sample rate
    #[error("Unsupported sample rate: {0} Hz")]
    UnsupportedSampleRate(u32),

    /// Unsupported bitrate
    #[error("Unsupported bitrate: {0} kbps")]
    UnsupportedBitrate(u32),

    /// Incompatible sample rate and bitrate combination
    #[error("Incompatible sample rate ({sample_rate} Hz) and bitrate ({bitrate} kbps) combination")]
    IncompatibleRateCombination { sample_rate: u32, bitrate: u32 },

    /// Channel mode does not match the channel count
    #[error("Invalid channel mode {mode:?} for {channels} channels")]
    InvalidChannelMode { mode: String, channels: u8 },

    /// Quantization comparison heuristic outside 0..=9
    #[error("Unknown quantization comparison heuristic: {0}")]
    UnknownComparison(u8),

    /// VBR minimum bitrate above the maximum
    #[error("Invalid VBR bitrate range: min {min} kbps > max {max} kbps")]
    InvalidVbrRange { min: u32, max: u32 },

    /// VBR quality outside 0..=9
    #[error("VBR quality {0} out of range 0..=9")]
    InvalidVbrQuality(u8),

    /// ATH curve parameter must be finite
    #[error("Invalid ATH curve parameter: {0}")]
    InvalidAthCurve(f32),

    /// msfix must be a finite, nonnegative factor
    #[error("Invalid msfix factor: {0}")]
    InvalidMsfix(f32),

    /// Interchannel masking ratio must lie in 0..1
    #[error("Invalid interchannel masking ratio: {0}")]
    InvalidInterchannelRatio(f32),
}

/// Errors raised while building the partition and spreading tables
#[derive(Debug, Error)]
pub enum SetupError {
    /// The sparse spreading-function table could not be allocated
    #[error("Failed to allocate spreading-function table ({requested} coefficients)")]
    SpreadingTableAllocation { requested: usize },

    /// The bark partitioning produced more bands than the model supports
    #[error("Partition count {count} exceeds the supported maximum of {max}")]
    PartitionOverflow { count: usize, max: usize },
}

impl SetupError {
    /// Numeric status code reported to callers that need a C-style result
    pub fn status_code(&self) -> i32 {
        match self {
            SetupError::SpreadingTableAllocation { .. } => -1,
            SetupError::PartitionOverflow { .. } => -2,
        }
    }
}

/// Input data validation errors
#[derive(Debug, Error)]
pub enum InputDataError {
    /// Wrong number of channel spectra for the configured channel count
    #[error("Invalid channel count: expected {expected}, got {actual}")]
    InvalidChannelCount { expected: usize, actual: usize },

    /// Wrong number of granules in a frame
    #[error("Invalid granule count: expected {expected}, got {actual}")]
    InvalidGranuleCount { expected: usize, actual: usize },

    /// A spectrum does not have the long/short transform layout
    #[error("Invalid spectrum length for channel {channel}: expected {expected} bins, got {actual}")]
    InvalidSpectrumLength { channel: usize, expected: usize, actual: usize },

    /// Spectral data contains NaN or infinite values
    #[error("Non-finite spectral coefficient at index {index}")]
    NonFinite { index: usize },
}

/// Quantization failures propagated to the mode controllers
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QuantizationError {
    /// The ceiling cannot be met even at the coarsest representable gain
    #[error("Bit budget exhausted: needed {bits} bits, ceiling is {ceiling}")]
    BudgetExhausted { bits: u32, ceiling: u32 },

    /// No gain / scalefactor-scale / subblock-gain combination makes every band representable
    #[error("Scalefactors not representable for granule {granule}, channel {channel}")]
    Unrepresentable { granule: usize, channel: usize },
}

/// Specialized result types for different modules
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
pub type SetupResult<T> = std::result::Result<T, SetupError>;
pub type InputResult<T> = std::result::Result<T, InputDataError>;
pub type QuantizationResult<T> = std::result::Result<T, QuantizationError>;
pub type EncodingResult<T> = std::result::Result<T, EncoderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_status_codes_are_distinct_and_negative() {
        let alloc = SetupError::SpreadingTableAllocation { requested: 4096 };
        let overflow = SetupError::PartitionOverflow { count: 70, max: 64 };
        assert_eq!(alloc.status_code(), -1);
        assert!(overflow.status_code() < 0);
        assert_ne!(alloc.status_code(), overflow.status_code());
    }

    #[test]
    fn test_errors_convert_into_encoder_error() {
        let err: EncoderError = QuantizationError::Unrepresentable { granule: 1, channel: 0 }.into();
        assert!(matches!(err, EncoderError::Quantization(_)));
        assert!(err.to_string().contains("granule 1"));
    }
}
