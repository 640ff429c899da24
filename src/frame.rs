//! Modbus-RTU request encoding and reply validation.
//!
//! A frame is `[address][function][payload..][crc_lo][crc_hi]`.

use crate::{
    crc::{append_crc16, crc16},
    protocol::{
        Address, ExceptionCode, EXCEPTION_FLAG, READ_HOLDING_REGISTERS, READ_INPUT_REGISTERS,
    },
    Error,
};

/// Address, function code and CRC.
pub const MIN_FRAME_LEN: usize = 4;
const CRC_LEN: usize = 2;
const HEADER_LEN: usize = 2;

/// Size of an exception reply.
pub const EXCEPTION_REPLY_LEN: usize = HEADER_LEN + 1 + CRC_LEN;

fn create_request(address: Address, function_code: u8, payload: &[u8]) -> Vec<u8> {
    let mut tx_buffer = Vec::with_capacity(HEADER_LEN + payload.len() + CRC_LEN);
    tx_buffer.push(*address);
    tx_buffer.push(function_code);
    tx_buffer.extend_from_slice(payload);
    append_crc16(&mut tx_buffer);
    tx_buffer
}

/// Builds a read input/holding registers request.
pub fn encode_read(
    address: Address,
    function_code: u8,
    register_addr: u16,
    register_count: u16,
) -> Vec<u8> {
    let mut payload = [0; 4];
    payload[..2].copy_from_slice(&register_addr.to_be_bytes());
    payload[2..].copy_from_slice(&register_count.to_be_bytes());
    create_request(address, function_code, &payload)
}

/// Builds a single register write request.
pub fn encode_write(
    address: Address,
    function_code: u8,
    register_addr: u16,
    value: u16,
) -> Vec<u8> {
    let mut payload = [0; 4];
    payload[..2].copy_from_slice(&register_addr.to_be_bytes());
    payload[2..].copy_from_slice(&value.to_be_bytes());
    create_request(address, function_code, &payload)
}

/// Builds the energy counter reset command, it has no payload.
pub fn encode_reset_energy(address: Address) -> Vec<u8> {
    create_request(address, crate::protocol::RESET_ENERGY, &[])
}

/// Size of the reply to a read of `register_count` registers.
pub fn read_reply_len(register_count: u16) -> usize {
    HEADER_LEN + 1 + register_count as usize * 2 + CRC_LEN
}

/// A single register write is answered with an echo of the request.
pub const WRITE_REPLY_LEN: usize = HEADER_LEN + 4 + CRC_LEN;

/// The reset command is acknowledged by a frame without payload.
pub const RESET_REPLY_LEN: usize = HEADER_LEN + CRC_LEN;

fn validate_len(rx_buffer: &[u8]) -> Result<(), Error> {
    if rx_buffer.len() < MIN_FRAME_LEN {
        log::warn!(
            "Invalid frame size - required={} received={}",
            MIN_FRAME_LEN,
            rx_buffer.len()
        );
        return Err(Error::Truncated {
            expected: MIN_FRAME_LEN,
            received: rx_buffer.len(),
        });
    }
    Ok(())
}

fn validate_checksum(rx_buffer: &[u8]) -> Result<(), Error> {
    let (frame, crc) = rx_buffer.split_at(rx_buffer.len() - CRC_LEN);
    let calculated = crc16(frame);
    let received = u16::from_le_bytes([crc[0], crc[1]]);
    if calculated != received {
        log::warn!(
            "Invalid checksum - calculated={calculated:04X} received={received:04X} buffer={rx_buffer:02X?}"
        );
        return Err(Error::ChecksumMismatch {
            calculated,
            received,
        });
    }
    Ok(())
}

fn validate_address(received: u8, expected: Address) -> Result<(), Error> {
    // Nobody answers a broadcast, and the single slave behind the general
    // address replies with its own address.
    let accepted = if expected.is_broadcast() {
        true
    } else if expected.is_general() {
        Address::from(received).is_unicast() || received == *expected
    } else {
        received == *expected
    };
    if !accepted {
        log::warn!("Unexpected slave address - expected={expected} received={received:#04X}");
        return Err(Error::UnexpectedAddress {
            expected: *expected,
            received,
        });
    }
    Ok(())
}

/// Validates a reply frame and returns the bytes between function code and CRC.
///
/// Checks are applied in the order length, checksum, address, function code
/// and, for read replies, the byte count.
pub fn decode_response(
    raw: &[u8],
    expected_address: Address,
    expected_function: u8,
) -> Result<&[u8], Error> {
    validate_len(raw)?;
    validate_checksum(raw)?;
    validate_address(raw[0], expected_address)?;

    let function = raw[1];
    let payload = &raw[HEADER_LEN..raw.len() - CRC_LEN];
    if function == expected_function | EXCEPTION_FLAG {
        let code = payload.first().copied().ok_or(Error::Truncated {
            expected: EXCEPTION_REPLY_LEN,
            received: raw.len(),
        })?;
        let exception = ExceptionCode::from(code);
        log::warn!("Device exception for function {expected_function:#04X}: {exception}");
        return Err(Error::DeviceException(exception));
    }
    if function != expected_function {
        return Err(Error::UnexpectedFunction {
            expected: expected_function,
            received: function,
        });
    }

    if matches!(expected_function, READ_HOLDING_REGISTERS | READ_INPUT_REGISTERS) {
        let declared = payload.first().copied().ok_or(Error::MalformedLength {
            declared: 1,
            actual: 0,
        })? as usize;
        let actual = payload.len() - 1;
        if declared != actual {
            log::warn!("Invalid byte count - declared={declared} actual={actual}");
            return Err(Error::MalformedLength { declared, actual });
        }
    }
    Ok(payload)
}

/// Strips the byte count from the payload of a validated read reply.
pub fn register_data(payload: &[u8]) -> &[u8] {
    payload.get(1..).unwrap_or_default()
}
