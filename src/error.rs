use thiserror::Error;

/// Errors that can occur during store operations. Marked non-exhaustive to
/// allow future additions without breaking the API; a caller would typically
/// only branch on `NotFound` and `NoBufferMemory`, the rest are static.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// Catch-all failure, chiefly operations attempted outside the
    /// `Initialized` state.
    #[error("generic failure")]
    Generic,

    /// The transport reported a failure. The underlying value is opaque to
    /// the engine.
    #[error("nvm transport error")]
    Nvm,

    /// Zero tag, empty payload, payload over the schema maximum, or a
    /// migrator that produced an oversize result.
    #[error("invalid parameter")]
    InvalidParam,

    /// Tag absent from the schema or from the index.
    #[error("tag not found")]
    NotFound,

    /// The caller's buffer cannot hold the payload; `needed` is the size
    /// required to retry.
    #[error("buffer too small, {needed} bytes required")]
    NoBufferMemory { needed: u16 },

    /// The data region cannot hold a new block.
    #[error("no memory space")]
    NoMemorySpace,

    /// The index table is full.
    #[error("no index space")]
    NoIndexSpace,

    /// CRC mismatch on the header, the index table or a data block.
    #[error("crc check failed")]
    CrcFailed,

    /// Magic mismatch or structural inconsistency on media.
    #[error("data corrupted")]
    Corrupted,

    /// Incompatible on-media format, or an unsupported migration request
    /// (downgrade, or no migrator registered).
    #[error("version not supported")]
    Version,

    /// Stream handle failed the magic, generation or state check.
    #[error("invalid handle")]
    InvalidHandle,

    /// Engine or session not in the required state, e.g. a stream ended
    /// before all bytes were transferred.
    #[error("invalid state")]
    InvalidState,
}
