//! Session management (C6 §4.6, C7 §4.7): dedup-by-key session lookup
//! plus per-session manifest/subtitle request handling.

pub mod manager;
pub mod session;

pub use manager::SessionManager;
pub use session::{HttpPayload, Session, SubtitleFragmentKind};
