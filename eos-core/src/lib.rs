//! `eos-core` — manifest parsing/rewriting, live delay buffering and
//! subtitle codec core for the EOS streaming proxy (spec.md §2,
//! components C1–C5).
//!
//! Pure parsing, rewriting and buffering logic: no networking, no
//! process state. `eos-server` drives this crate's types from async
//! request handlers and background pollers.

pub mod dash;
pub mod delay_buffer;
pub mod error;
pub mod hls;
pub mod subtitle;
pub mod types;
pub mod url;

pub use delay_buffer::{DelayBuffer, DelayedView};
pub use error::{CoreError, Result};
pub use types::{
    Encryption, Fragment, Manifest, Mode, Protocol, SessionKey, Streaming, SubtitleEntry,
};
