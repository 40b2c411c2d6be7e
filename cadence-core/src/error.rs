//! Session-level error taxonomy.

use thiserror::Error;

use crate::config::ConfigError;
use crate::convert::ConvertError;
use crate::decode::DecodeError;
use crate::render::DisplayError;
use crate::source::SourceError;

/// An allocation the pipeline could not satisfy. The unit or frame that
/// needed it is discarded; the session itself keeps going.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Out of memory allocating {bytes} bytes")]
pub struct OutOfMemory {
    pub bytes: usize,
}

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error(transparent)]
    OutOfMemory(#[from] OutOfMemory),
    #[error("Decode fatal: {0}")]
    DecodeFatal(#[from] DecodeError),
    #[error("I/O fatal: {0}")]
    IoFatal(#[from] SourceError),
    #[error("Conversion failed: {0}")]
    Convert(#[from] ConvertError),
    #[error("Display failed: {0}")]
    Display(#[from] DisplayError),
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Container has no video stream")]
    NoVideoStream,
    #[error("Failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("The {0} thread panicked")]
    ThreadPanicked(&'static str),
}

impl PlaybackError {
    /// Stream-level failures end the session; everything else is absorbed
    /// per unit or per frame.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::OutOfMemory(_)
                | Self::Convert(ConvertError::OutOfMemory(_))
                | Self::IoFatal(SourceError::OutOfMemory(_))
        )
    }
}
