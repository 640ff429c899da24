use crate::protocol::ExceptionCode;

/// Errors reported by the frame codec, the transports and the driver session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The reply is shorter than the smallest frame or than the expected reply.
    #[error("Truncated frame - expected at least {expected} bytes, received {received}")]
    Truncated { expected: usize, received: usize },
    /// The trailing CRC16 does not match the one calculated over the frame.
    #[error("Checksum mismatch - calculated={calculated:04X} received={received:04X}")]
    ChecksumMismatch { calculated: u16, received: u16 },
    /// The reply came from another slave than the one addressed.
    #[error("Unexpected slave address - expected={expected:#04X} received={received:#04X}")]
    UnexpectedAddress { expected: u8, received: u8 },
    /// The reply carries a function code that belongs to neither the request nor its exception.
    #[error("Unexpected function code - expected={expected:#04X} received={received:#04X}")]
    UnexpectedFunction { expected: u8, received: u8 },
    /// The byte count field of a read reply disagrees with the payload length.
    #[error("Malformed length - declared {declared} bytes, got {actual}")]
    MalformedLength { declared: usize, actual: usize },
    /// The device answered with an exception reply.
    #[error("Device exception: {0}")]
    DeviceException(ExceptionCode),
    /// A write reply did not echo the request.
    #[error("Write reply does not echo the request")]
    EchoMismatch,
    /// No address has been confirmed by the device yet.
    #[error("Device address not resolved, read the address register first")]
    NotResolved,
    /// The address is not allowed for the requested operation.
    #[error("Address {0:#04X} out of range")]
    InvalidAddressRange(u8),
    /// Nothing arrived before the receive timeout elapsed.
    #[error("Transport timeout")]
    TransportTimeout,
    /// I/O failure of the transport, serial port errors included.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
