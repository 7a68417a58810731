//! Structural error types.
//!
//! Numerical non-convergence is never reported through these errors; it is
//! recorded in the status field of the affected detection or fit and callers
//! check `is_detected()` / `is_fitted()` before trusting derived values.

use thiserror::Error;

/// Errors raised by structural operations on frames, collections and scale
/// resolution. Each aborts only the requested operation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StarfitError {
    /// PSF averaging requires every fit to belong to the same model family.
    #[error("Incongruent PSF functions: cannot average Gaussian and Moffat fits")]
    IncongruentPsfFunctions,

    /// An averaging or export selection contained no fitted PSF.
    #[error("Insufficient PSF data: the selection contains no fitted PSF")]
    InsufficientPsfData,

    /// A star id that is not present in the collection.
    #[error("Unknown star id {0}")]
    UnknownStarId(u32),

    /// A scale keyword was missing or non-positive.
    #[error("Missing or non-positive value for keyword '{0}'")]
    BadScaleKeyword(String),

    /// Frame construction with channels of different shapes.
    #[error("Channel shape mismatch: {0}x{1} vs {2}x{3}")]
    ChannelShapeMismatch(usize, usize, usize, usize),

    /// Frame construction with no channels at all.
    #[error("A frame requires at least one channel")]
    EmptyFrame,

    /// Channel index outside the frame.
    #[error("Channel index {0} out of range ({1} channels)")]
    ChannelOutOfRange(usize, usize),
}
