use std::{fmt, io};

/// Convenience alias for results produced by the transport.
pub type Result<T> = std::result::Result<T, ErrorKind>;

/// Errors that can occur inside the transport engine.
///
/// Routine network conditions (loss, reordering, duplicates) are handled by
/// the retransmission and reordering logic and never surface here; only
/// connection-level failures and defensive checks do.
#[derive(Debug)]
pub enum ErrorKind {
    /// A sequence index fell outside the addressable window of a packet
    /// buffer. Treated as a protocol violation by the caller; the offending
    /// packet is dropped, never stored into an unrelated slot.
    OutOfWindow {
        /// The offending sequence number.
        sequence: u16,
        /// The window cursor at the time of the failure.
        cursor: u16,
        /// The window span at the time of the failure.
        span: u16,
    },
    /// The packet pool could not serve a request, either because the
    /// requested size exceeds the largest slab or the underlying allocation
    /// failed. Propagated as a connection-level failure; a packet is never
    /// silently truncated to fit.
    AllocationFailure {
        /// The requested allocation size in bytes.
        requested: usize,
        /// The largest slab size available.
        largest: usize,
    },
    /// The peer performed an unexpected state transition, such as sending
    /// DATA after FIN. Causes an immediate transition to `Closed` with a
    /// RESET sent if possible.
    ProtocolViolation(&'static str),
    /// A packet header could not be decoded.
    CouldNotReadHeader(String),
    /// Wrapper around a `std::io::Error` from the underlying transport.
    IoError(io::Error),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::OutOfWindow { sequence, cursor, span } => write!(
                f,
                "Sequence {} is outside the addressable window (cursor: {}, span: {})",
                sequence, cursor, span
            ),
            ErrorKind::AllocationFailure { requested, largest } => write!(
                f,
                "Pool cannot serve an allocation of {} bytes (largest slab: {})",
                requested, largest
            ),
            ErrorKind::ProtocolViolation(reason) => {
                write!(f, "Protocol violation: {}", reason)
            }
            ErrorKind::CouldNotReadHeader(reason) => {
                write!(f, "Could not read packet header: {}", reason)
            }
            ErrorKind::IoError(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for ErrorKind {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ErrorKind::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ErrorKind {
    fn from(e: io::Error) -> Self {
        ErrorKind::IoError(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_out_of_window() {
        let err = ErrorKind::OutOfWindow { sequence: 7, cursor: 100, span: 16 };
        let text = err.to_string();
        assert!(text.contains("7"));
        assert!(text.contains("100"));
    }

    #[test]
    fn test_io_error_source() {
        use std::error::Error;
        let err = ErrorKind::from(io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(err.source().is_some());
    }
}
