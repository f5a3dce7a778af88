use std::io;

use thiserror::Error;

/// An error produced by a `duolane` endpoint.
#[derive(Debug, Error)]
pub enum Error {
    /// A datagram was too short to contain a packet header.
    #[error("datagram of {len} bytes is too short to contain a header")]
    MalformedHeader {
        /// The size of the offending datagram.
        len: usize,
    },

    /// A datagram named a channel this protocol does not define.
    #[error("unknown channel type {0}")]
    UnknownChannel(u8),

    /// A payload would not fit in a single datagram.
    #[error("payload of {0} bytes exceeds the datagram budget")]
    PayloadTooLarge(usize),

    /// The endpoint has already been closed.
    #[error("endpoint is closed")]
    Closed,

    /// The underlying socket failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}
