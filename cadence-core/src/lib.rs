//! # Cadence Core
//!
//! Decode/queue/sync engine for paced video playback.
//!
//! ```text
//! ┌──────────┐   ┌─────────────┐   ┌───────────┐   ┌────────────┐   ┌──────────┐
//! │ Demuxer  │──►│ PacketQueue │──►│ Decoder   │──►│ Converter  │──►│FrameQueue│
//! └──────────┘   └─────────────┘   └───────────┘   └────────────┘   └────┬─────┘
//!                                                                        │
//!                      ┌───────────────┐                           ┌─────▼────┐
//!                      │ PlaybackClock │◄──────────────────────────│  Render  │
//!                      └───────────────┘                           └──────────┘
//! ```

// ============================================================================
// Input
// ============================================================================
pub mod source;
pub mod packet;
pub mod demux;
pub mod y4m;

// ============================================================================
// Decode / Convert
// ============================================================================
pub mod decode;
pub mod convert;
pub mod scaler;

// ============================================================================
// Queueing / Timing
// ============================================================================
pub mod frame_queue;
pub mod clock;

// ============================================================================
// Presentation
// ============================================================================
pub mod render;
pub mod session;

// ============================================================================
// Ambient
// ============================================================================
pub mod config;
pub mod error;

pub use config::PlaybackConfig;
pub use error::{OutOfMemory, PlaybackError};
pub use session::{PlaybackSession, SessionHandle, SessionStats};

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
