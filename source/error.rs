use std::{io, result};

/// Failure taxonomy for the synchronization core. `ShortRead` is a signal
/// rather than an error: the scanner raises it when a response line is still
/// incomplete and the connection simply has to read more bytes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("parse error at byte {cursor} ({reason}): {}", crate::imap::preview(buffer))]
  Parse {
    buffer: Vec<u8>,
    cursor: usize,
    reason: String,
  },
  #[error("short read (missing {hint:?} byte(s))")]
  ShortRead { hint: Option<usize> },
  #[error("protocol error: {0}")]
  Protocol(String),
  #[error("authentication failed: {0}")]
  Auth(String),
  #[error("transport error: {0}")]
  Transport(String),
  #[error("cache error: {0}")]
  Cache(#[from] rusqlite::Error),
  #[error("invalid configuration: {0}")]
  UserIntent(String),
}

impl From<io::Error> for Error {
  fn from(error: io::Error) -> Self {
    Error::Transport(error.to_string())
  }
}

impl From<rustls::Error> for Error {
  fn from(error: rustls::Error) -> Self {
    Error::Transport(error.to_string())
  }
}

pub type Result<T> = result::Result<T, Error>;
