//! # psyquant
//!
//! Psychoacoustic analysis and quantization for MPEG-1/2/2.5 Layer III.
//! Given the FFT/MDCT-domain view of each granule, this library computes
//! masking thresholds and perceptual entropy, chooses block types and
//! stereo coding, distributes the frame's bits across granules and
//! channels, and runs the quantization loops (CBR, ABR and VBR) that pick
//! global gain and scalefactors. Bitstream packing is left to the caller.
//!

pub mod ath;
pub mod bit_allocation;
pub mod compare;
pub mod config;
pub mod controllers;
#[cfg(feature = "diagnostics")]
pub mod diagnostics;
pub mod encoder;
pub mod error;
pub mod huffman;
pub mod interchannel;
pub mod outer_loop;
pub mod partition;
pub mod psymodel;
pub mod quantize;
pub mod reservoir;
pub mod tables;
pub mod types;
pub mod vbr;

pub use config::{Config, RateControl, VbrSolver};
pub use encoder::{EncodedFrame, FrameAnalysis, GranuleAnalysis, PerceptualEncoder};
pub use error::{EncoderError, EncodingResult};
pub use psymodel::PsyGranuleResult;
pub use types::{BlockType, ChannelSpectrum, GranuleChannelState, MaskingRatio};
