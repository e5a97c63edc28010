//! # playout-audio
//!
//! Audio output engine for a video playback stack.
//!
//! Decoded PCM (or AC3-style pass-through payloads) arrives from a decoder
//! at irregular rates; the engine buffers it in a ring of per-format slots,
//! remixes it to a format the output device accepts, feeds a playback
//! device from a dedicated worker thread, and exposes a 90 kHz audio clock
//! synchronized with the video presentation clock.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use playout_audio::{AudioOut, NO_PTS};
//!
//! let audio = AudioOut::builder()
//!     .device("default")          // ALSA; "/dev/dsp" selects OSS
//!     .soft_volume(true)
//!     .build();
//!
//! audio.setup(48_000, 2, false)?;
//! audio.set_clock(first_packet_pts);
//! audio.enqueue(&pcm_bytes);      // interleaved native-endian i16
//! audio.video_ready(video_pts);   // align the start with video
//!
//! let clock = audio.clock();      // what is being heard right now
//! if clock != NO_PTS {
//!     sync_video_to(clock);
//! }
//! ```
//!
//! ## Architecture
//!
//! The engine maintains a strict thread boundary:
//!
//! - **Producer**: the decoder thread calling `enqueue`/`set_clock`/
//!   `video_ready`; it only ever touches the slot at the write index
//! - **Slot ring**: eight fixed slots, each a lock-free SPSC byte FIFO
//!   carrying exactly one playback format
//! - **Worker thread**: drains the slot at the read index into the device
//!   in bounded iterations, applying flushes and format changes at slot
//!   boundaries
//!
//! Format changes never interrupt playback: a new slot is published and
//! the worker re-configures the device once the previous slot has drained.
//!
//! Hardware backends are optional Cargo features (`alsa-backend`,
//! `oss-backend`); the crate always builds with the inert noop backend and
//! an in-memory mock for tests.

#![warn(missing_docs)]
// Audio code requires intentional numeric casts between sample formats
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_lossless
)]
// unwrap/expect allowed in tests only
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]

pub mod backend;
mod clock;
mod config;
mod control;
mod engine;
mod error;
mod filter;
mod matrix;
mod pipeline;
mod worker;

pub use backend::{Backend, MockBackend, MockHandle, NoopBackend, Pump, PumpCtx, SetupStatus};
pub use clock::{BYTES_PER_SAMPLE, NO_PTS, TICKS_PER_SECOND};
pub use config::EngineConfig;
pub use engine::{AudioOut, AudioOutBuilder, SetupOutcome};
pub use error::AudioError;

#[cfg(feature = "alsa-backend")]
pub use backend::AlsaBackend;
#[cfg(feature = "oss-backend")]
pub use backend::OssBackend;
