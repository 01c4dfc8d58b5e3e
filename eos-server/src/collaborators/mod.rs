//! Bindings for the external collaborators the pipeline talks to
//! through the `SpeechRecognizer`/`Translator` traits (§4.8, §9's
//! polymorphism note). Out of scope per spec.md §1 ("the speech-to-text
//! and translation cloud SDKs"); this module is the thin REST glue that
//! fulfills the trait contract, not a reimplementation of those SDKs.

pub mod google;

pub use google::{GoogleRecognizer, GoogleTranslator};
