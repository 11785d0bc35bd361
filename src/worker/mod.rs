//! Local encode execution.
//!
//! - [`Transcoder`]: seam the Work Queue calls for each locally dispatched job
//! - [`FfmpegTranscoder`]: production implementation driving the external codec tool
//!
//! A transcoder runs for the full duration of the encode on its slot and streams
//! [`Progress`] updates back over a channel; the caller persists them.

pub mod executor;

pub use executor::{FfmpegTranscoder, Progress, ProgressParser, Transcoder};
