//! Crate-wide error type.
//!
//! Mirrors the granularity of the error kinds in §7 of the design: protocol
//! violations and peer IO failures are not exposed here as they are handled
//! locally by disconnecting the offending peer rather than propagated (see
//! [`crate::peer`]). This enum covers the failures that are fatal to the
//! engine as a whole: invalid metainfo, local storage failure, and tracker
//! setup errors.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid piece index")]
    InvalidPieceIndex,

    #[error("invalid metainfo: {0}")]
    InvalidMetainfo(String),

    #[error("bencode decode error: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tracker announce url must be http(s): {0}")]
    UnsupportedTrackerScheme(String),

    #[error("invalid tracker announce url: {0}")]
    InvalidTrackerUrl(#[from] url::ParseError),

    #[error("tracker request failed: {0}")]
    TrackerRequest(#[from] reqwest::Error),

    #[error("tracker announce failed: {0}")]
    TrackerFailure(String),
}
