use thiserror::Error;

/// Core error type for manifest parsing, rewriting and subtitle packaging.
#[derive(Error, Debug)]
pub enum CoreError {
    /// The input playlist/MPD could not be parsed.
    #[error("malformed manifest: {0}")]
    MalformedManifest(String),

    /// A required rendition/adaptation-set could not be located.
    #[error("rendition not found: {0}")]
    RenditionNotFound(String),

    /// A requested fragment/segment could not be located in a buffer or list.
    #[error("fragment not found: seq/ts={0}")]
    FragmentNotFound(String),

    /// A URL could not be resolved against its parent.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// An fMP4 box tree failed to parse or did not carry the expected structure.
    #[error("fmp4 error: {0}")]
    Fmp4(String),

    /// TTML document was malformed or missing the expected body.
    #[error("ttml error: {0}")]
    Ttml(String),

    /// WebVTT document was malformed.
    #[error("webvtt error: {0}")]
    WebVtt(String),

    /// A live delay buffer invariant would have been violated by an update.
    #[error("buffer invariant violated: {0}")]
    BufferInvariant(String),

    /// Underlying I/O failure (only used by test fixtures within this crate).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
