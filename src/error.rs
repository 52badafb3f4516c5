//! Error types shared by the protocol and backup layers.

use std::io;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong between the NBD wire and the backup engine.
#[derive(Debug, Error)]
pub enum Error {
    /// The peer sent bytes the NBD protocol does not allow (bad magic,
    /// impossible length, malformed frame). Fatal for the connection.
    #[error("nbd protocol violation: {0}")]
    Protocol(String),

    /// The server rejected an option during handshake haggling.
    #[error("server rejected option {option} with reply {reply:#x}")]
    Option {
        /// The option that was rejected.
        option: u32,
        /// The server's error reply type (error bit included).
        reply: u32,
    },

    /// The server answered an option the client did not just send.
    #[error("reply to option {received}, expected a reply to option {expected}")]
    UnexpectedOptionReply {
        /// Option id the client last sent.
        expected: u32,
        /// Option id the server replied to.
        received: u32,
    },

    /// A transmission reply carried a handle that does not match the
    /// outstanding request.
    #[error("reply for handle {received}, expected handle {expected}")]
    UnexpectedHandle {
        /// Handle of the outstanding request.
        expected: u64,
        /// Handle carried by the reply.
        received: u64,
    },

    /// The server returned a non-zero errno for a request. The socket is
    /// still usable for further requests.
    #[error("server returned error {errno} during transmission")]
    Transmission {
        /// Errno value from the reply header.
        errno: u32,
    },

    /// A read or write was attempted with an offset or length that is not a
    /// multiple of 512. Caller bug; nothing was sent on the socket.
    #[error("{name}={value} is not a multiple of 512")]
    Unaligned {
        /// Which argument was misaligned.
        name: &'static str,
        /// The offending value.
        value: u64,
    },

    /// The peer closed the connection in the middle of a frame.
    #[error("unexpected end of stream from NBD peer")]
    Eof,

    /// A socket operation exceeded the configured timeout.
    #[error("timed out talking to NBD peer")]
    Timeout,

    /// The client has already been closed.
    #[error("operation on a closed NBD client")]
    Closed,

    /// TLS was requested but cannot be used (oldstyle handshake).
    #[error("TLS is not supported with the oldstyle handshake")]
    TlsUnsupported,

    /// The TLS upgrade failed.
    #[error("TLS handshake failed: {0}")]
    Tls(String),

    /// The local file checksum does not match the server-side checksum.
    #[error("checksum mismatch: local {local}, server {remote}")]
    ChecksumMismatch {
        /// MD5 of the backup file on disk.
        local: String,
        /// MD5 reported by the server.
        remote: String,
    },

    /// The incremental base chosen from the local backup set cannot be
    /// matched against the server's snapshot chain.
    #[error("backup chain broken: {0}")]
    ChainBroken(String),

    /// The management API reported a failure.
    #[error("management API failure: {0}")]
    Api(String),

    /// Anything the underlying transport or filesystem reports.
    #[error(transparent)]
    Io(io::Error),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => Error::Eof,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::Timeout,
            _ => Error::Io(err),
        }
    }
}

impl Error {
    pub(crate) fn protocol<S: AsRef<str>>(msg: S) -> Self {
        Error::Protocol(msg.as_ref().to_string())
    }
}
