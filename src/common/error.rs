use std::io;

use thiserror::Error;

/// Errors produced by the Sudoku transport.
///
/// Every failure is fatal to the connection it occurred on; nothing in the
/// transport retries on its own.
#[derive(Error, Debug)]
pub enum SudokuError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("handshake timestamp skew too large: {skew}s")]
    TimestampSkew { skew: i64 },

    #[error("downlink mode mismatch: server expects 0x{expected:02x}, client sent 0x{got:02x}")]
    DownlinkMismatch { expected: u8, got: u8 },

    #[error("unknown session type byte 0x{0:02x}")]
    UnknownSessionType(u8),

    #[error("unsupported {what} version {version}")]
    UnsupportedVersion { what: &'static str, version: u8 },

    #[error("handshake table selection failed")]
    ProbeExhausted,

    #[error("handshake probe exceeded {0} bytes")]
    ProbeExceeded(usize),

    #[error("replayed key exchange nonce from user {0}")]
    ReplayRejected(String),

    #[error("INVALID_SUDOKU_MAP_MISS")]
    InvalidMapMiss,

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("AEAD decryption failed")]
    DecryptFailed,

    #[error("record out of order: expected epoch {expected_epoch} seq {expected_seq}, got epoch {epoch} seq {seq}")]
    RecordOutOfOrder {
        expected_epoch: u32,
        expected_seq: u64,
        epoch: u32,
        seq: u64,
    },

    #[error("crypto error: {0}")]
    Crypto(String),
}

impl SudokuError {
    /// Recover a typed error from an `io::Error` raised by one of the stream
    /// layers. Plain transport errors come back as `SudokuError::Io`.
    pub fn from_io(err: io::Error) -> Self {
        if err
            .get_ref()
            .map(|inner| inner.is::<SudokuError>())
            .unwrap_or(false)
        {
            if let Some(inner) = err.into_inner() {
                if let Ok(typed) = inner.downcast::<SudokuError>() {
                    return *typed;
                }
            }
            return SudokuError::Handshake("malformed inner error".to_string());
        }
        SudokuError::Io(err)
    }

    pub fn kind(&self) -> SudokuErrorKind {
        match self {
            SudokuError::Io(_) => SudokuErrorKind::Transport,
            SudokuError::Config(_) => SudokuErrorKind::Config,
            SudokuError::Handshake(_)
            | SudokuError::TimestampSkew { .. }
            | SudokuError::DownlinkMismatch { .. }
            | SudokuError::UnknownSessionType(_)
            | SudokuError::UnsupportedVersion { .. }
            | SudokuError::Crypto(_) => SudokuErrorKind::Handshake,
            SudokuError::ProbeExhausted | SudokuError::ProbeExceeded(_) => {
                SudokuErrorKind::ProbeExhausted
            }
            SudokuError::ReplayRejected(_) => SudokuErrorKind::ReplayRejected,
            SudokuError::InvalidMapMiss
            | SudokuError::InvalidFrame(_)
            | SudokuError::DecryptFailed
            | SudokuError::RecordOutOfOrder { .. } => SudokuErrorKind::Decode,
        }
    }
}

/// Lightweight error category for pattern matching without borrowing the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SudokuErrorKind {
    Config,
    Handshake,
    ProbeExhausted,
    ReplayRejected,
    Decode,
    Transport,
}

impl SudokuErrorKind {
    /// Configuration problems never go away by redialing.
    pub fn is_permanent(self) -> bool {
        matches!(self, SudokuErrorKind::Config)
    }

    /// Whether the failure may indicate an active attack or probe.
    pub fn is_suspicious(self) -> bool {
        matches!(
            self,
            SudokuErrorKind::ReplayRejected
                | SudokuErrorKind::ProbeExhausted
                | SudokuErrorKind::Decode
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SudokuErrorKind::Config => "CONFIG",
            SudokuErrorKind::Handshake => "HANDSHAKE",
            SudokuErrorKind::ProbeExhausted => "PROBE_EXHAUSTED",
            SudokuErrorKind::ReplayRejected => "REPLAY_REJECTED",
            SudokuErrorKind::Decode => "DECODE",
            SudokuErrorKind::Transport => "TRANSPORT",
        }
    }
}

impl From<SudokuError> for io::Error {
    fn from(e: SudokuError) -> Self {
        match e {
            SudokuError::Io(inner) => inner,
            other => {
                let kind = match other.kind() {
                    SudokuErrorKind::Decode | SudokuErrorKind::ReplayRejected => {
                        io::ErrorKind::InvalidData
                    }
                    SudokuErrorKind::Config => io::ErrorKind::InvalidInput,
                    _ => io::ErrorKind::Other,
                };
                io::Error::new(kind, other)
            }
        }
    }
}

pub type Result<T, E = SudokuError> = std::result::Result<T, E>;
