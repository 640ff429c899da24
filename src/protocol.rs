use crate::Error;
use std::{fmt, ops::Deref, time::Duration};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

// https://minimalmodbus.readthedocs.io/en/stable/serialcommunication.html#timing-of-the-serial-communications
// minimum delay 4ms by baud rate 9600
pub const MINIMUM_DELAY: Duration = Duration::from_millis(4);

/// Receive timeout used when the caller does not configure one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

pub const READ_HOLDING_REGISTERS: u8 = 0x03;
pub const READ_INPUT_REGISTERS: u8 = 0x04;
pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const RESET_ENERGY: u8 = 0x42;
/// Set in the function code of an exception reply.
pub const EXCEPTION_FLAG: u8 = 0x80;

/// A Modbus-RTU slave address as it appears on the wire.
///
/// Any byte can be held; use [`Address::unicast`] to get one that is valid
/// as the address of a single device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Address(u8);

impl Address {
    /// Every slave executes the request, none of them replies.
    pub const BROADCAST: Address = Address(0x00);
    /// Only usable when exactly one slave is connected to the bus.
    pub const GENERAL: Address = Address(0xF8);
    pub const MIN: u8 = 0x01;
    pub const MAX: u8 = 0xF7;

    /// Validates `address` against the unicast range 0x01..=0xF7.
    pub fn unicast(address: u8) -> Result<Self, Error> {
        if (Self::MIN..=Self::MAX).contains(&address) {
            Ok(Self(address))
        } else {
            Err(Error::InvalidAddressRange(address))
        }
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_general(&self) -> bool {
        *self == Self::GENERAL
    }

    pub fn is_unicast(&self) -> bool {
        (Self::MIN..=Self::MAX).contains(&self.0)
    }
}

impl Default for Address {
    fn default() -> Self {
        Self::GENERAL
    }
}

impl Deref for Address {
    type Target = u8;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<u8> for Address {
    fn from(address: u8) -> Self {
        Self(address)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#04X}", self.0)
    }
}

/// Exception code carried by an error reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalAddress,
    IllegalData,
    SlaveError,
    Other(u8),
}

impl ExceptionCode {
    pub fn code(&self) -> u8 {
        match self {
            ExceptionCode::IllegalFunction => 0x01,
            ExceptionCode::IllegalAddress => 0x02,
            ExceptionCode::IllegalData => 0x03,
            ExceptionCode::SlaveError => 0x04,
            ExceptionCode::Other(code) => *code,
        }
    }
}

impl From<u8> for ExceptionCode {
    fn from(code: u8) -> Self {
        match code {
            0x01 => ExceptionCode::IllegalFunction,
            0x02 => ExceptionCode::IllegalAddress,
            0x03 => ExceptionCode::IllegalData,
            0x04 => ExceptionCode::SlaveError,
            other => ExceptionCode::Other(other),
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExceptionCode::IllegalFunction => write!(f, "Illegal function"),
            ExceptionCode::IllegalAddress => write!(f, "Illegal register address"),
            ExceptionCode::IllegalData => write!(f, "Illegal data value"),
            ExceptionCode::SlaveError => write!(f, "Slave device failure"),
            ExceptionCode::Other(code) => write!(f, "Unknown exception code {code:#04X}"),
        }
    }
}

/// Order of the two words of a 32 bit register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordOrder {
    HighWordFirst,
    LowWordFirst,
}

/// An entry of the device register map.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Register {
    pub address: u16,
    /// Width in 16 bit words, 1 or 2.
    pub words: u16,
    /// The raw value is divided by this to get the physical value.
    pub divisor: f32,
    pub signed: bool,
    pub word_order: WordOrder,
}

impl Register {
    const fn word(address: u16, divisor: f32) -> Self {
        Self {
            address,
            words: 1,
            divisor,
            signed: false,
            word_order: WordOrder::HighWordFirst,
        }
    }

    const fn double_word(address: u16, divisor: f32) -> Self {
        Self {
            address,
            words: 2,
            divisor,
            signed: false,
            word_order: WordOrder::LowWordFirst,
        }
    }

    /// Number of payload bytes the register occupies.
    pub const fn byte_len(&self) -> usize {
        self.words as usize * 2
    }
}

pub const VOLTAGE: Register = Register::word(0x0000, 10.0);
pub const CURRENT: Register = Register::double_word(0x0001, 1000.0);
pub const POWER: Register = Register::double_word(0x0003, 10.0);
pub const ENERGY: Register = Register::double_word(0x0005, 1.0);
pub const FREQUENCY: Register = Register::word(0x0007, 10.0);
pub const POWER_FACTOR: Register = Register::word(0x0008, 100.0);
pub const ALARM: Register = Register::word(0x0009, 1.0);

/// All measurement input registers are read in a single request.
pub const MEASUREMENTS_REG_ADDR: u16 = 0x0000;
pub const MEASUREMENTS_REG_QUAN: u16 = 10;

pub const THRESHOLD: Register = Register::word(0x0001, 1.0);
pub const SLAVE_ADDRESS: Register = Register::word(0x0002, 1.0);

const ALARM_ON: u32 = 0xFFFF;

/// Reads the raw, unscaled value of `register` from its big-endian payload bytes.
pub fn decode_raw(payload: &[u8], register: &Register) -> Result<u32, Error> {
    if payload.len() != register.byte_len() {
        return Err(Error::MalformedLength {
            declared: register.byte_len(),
            actual: payload.len(),
        });
    }
    let first = u16::from_be_bytes([payload[0], payload[1]]) as u32;
    if register.words == 1 {
        return Ok(first);
    }
    let second = u16::from_be_bytes([payload[2], payload[3]]) as u32;
    Ok(match register.word_order {
        WordOrder::HighWordFirst => first << 16 | second,
        WordOrder::LowWordFirst => second << 16 | first,
    })
}

/// Decodes `register` from its payload bytes and scales it to the physical unit.
pub fn decode(payload: &[u8], register: &Register) -> Result<f32, Error> {
    let raw = decode_raw(payload, register)?;
    let value = match (register.signed, register.words) {
        (true, 1) => raw as u16 as i16 as f32,
        (true, _) => raw as i32 as f32,
        (false, _) => raw as f32,
    };
    Ok(value / register.divisor)
}

/// Slices the bytes of `register` out of a block read starting at `block_address`.
fn register_bytes<'a>(
    data: &'a [u8],
    block_address: u16,
    register: &Register,
) -> Result<&'a [u8], Error> {
    let start = (register.address - block_address) as usize * 2;
    data.get(start..start + register.byte_len())
        .ok_or(Error::MalformedLength {
            declared: start + register.byte_len(),
            actual: data.len(),
        })
}

/// Snapshot of all values measured by the device.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Measurements {
    /// Volt
    pub voltage: f32,
    /// Ampere
    pub current: f32,
    /// Watt
    pub power: f32,
    /// Watt hours
    pub energy: f32,
    /// Hertz
    pub frequency: f32,
    pub power_factor: f32,
    /// Active power exceeded the threshold stored on the device.
    pub alarm: bool,
}

impl Measurements {
    pub const ADDRESS: u16 = MEASUREMENTS_REG_ADDR;
    pub const QUANTITY: u16 = MEASUREMENTS_REG_QUAN;

    /// Decodes the register data of a read of [`Self::QUANTITY`] input registers.
    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        let expected = Self::QUANTITY as usize * 2;
        if data.len() != expected {
            return Err(Error::MalformedLength {
                declared: expected,
                actual: data.len(),
            });
        }
        let field = |register: &Register| -> Result<f32, Error> {
            decode(register_bytes(data, Self::ADDRESS, register)?, register)
        };
        let alarm = decode_raw(register_bytes(data, Self::ADDRESS, &ALARM)?, &ALARM)?;
        if alarm != 0 && alarm != ALARM_ON {
            log::warn!("Unexpected alarm status {alarm:#06X}, treated as alarm");
        }
        Ok(Self {
            voltage: field(&VOLTAGE)?,
            current: field(&CURRENT)?,
            power: field(&POWER)?,
            energy: field(&ENERGY)?,
            frequency: field(&FREQUENCY)?,
            power_factor: field(&POWER_FACTOR)?,
            alarm: alarm != 0,
        })
    }
}

impl fmt::Display for Measurements {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Voltage[V]: {:.1}\tCurrent[A]: {:.3}\tPower[W]: {:.1}\tEnergy[Wh]: {}\tFrequency[Hz]: {:.1}\tPowerFactor: {:.2}\tAlarm: {}",
            self.voltage,
            self.current,
            self.power,
            self.energy,
            self.frequency,
            self.power_factor,
            self.alarm
        )
    }
}

/// Decodes the value of a single holding register read.
pub fn decode_holding_register(data: &[u8], register: &Register) -> Result<u16, Error> {
    Ok(decode_raw(data, register)? as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaling() {
        assert_eq!(decode(&[0x00, 0x96], &VOLTAGE).unwrap(), 15.0);
        assert_eq!(decode(&[0x00, 0x64], &POWER_FACTOR).unwrap(), 1.0);
        assert_eq!(decode(&[0x01, 0xF4], &FREQUENCY).unwrap(), 50.0);
    }

    #[test]
    fn double_word_order() {
        // 0x0001_86A0 = 100000
        assert_eq!(decode_raw(&[0x86, 0xA0, 0x00, 0x01], &CURRENT).unwrap(), 100000);
        let high_first = Register {
            word_order: WordOrder::HighWordFirst,
            ..CURRENT
        };
        assert_eq!(
            decode_raw(&[0x00, 0x01, 0x86, 0xA0], &high_first).unwrap(),
            100000
        );
        assert_eq!(decode(&[0x86, 0xA0, 0x00, 0x01], &CURRENT).unwrap(), 100.0);
    }

    #[test]
    fn signed_values() {
        let signed = Register {
            signed: true,
            ..VOLTAGE
        };
        assert_eq!(decode(&[0xFF, 0x9C], &signed).unwrap(), -10.0);
        assert_eq!(decode(&[0xFF, 0x9C], &VOLTAGE).unwrap(), 6543.6);
    }

    #[test]
    fn wrong_width() {
        assert!(matches!(
            decode(&[0x00], &VOLTAGE),
            Err(Error::MalformedLength {
                declared: 2,
                actual: 1
            })
        ));
        assert!(matches!(
            decode(&[0x00, 0x01], &ENERGY),
            Err(Error::MalformedLength { .. })
        ));
    }

    #[test]
    fn measurements() {
        let data = [
            0x08, 0xFD, // 230.1 V
            0x01, 0xF4, 0x00, 0x00, // 0.5 A
            0x04, 0x7E, 0x00, 0x00, // 115.0 W
            0x30, 0x39, 0x00, 0x00, // 12345 Wh
            0x01, 0xF4, // 50.0 Hz
            0x00, 0x5F, // 0.95
            0x00, 0x00, // no alarm
        ];
        let m = Measurements::decode(&data).unwrap();
        assert_eq!(m.voltage, 230.1);
        assert_eq!(m.current, 0.5);
        assert_eq!(m.power, 115.0);
        assert_eq!(m.energy, 12345.0);
        assert_eq!(m.frequency, 50.0);
        assert_eq!(m.power_factor, 0.95);
        assert!(!m.alarm);

        let mut alarm = data;
        alarm[18] = 0xFF;
        alarm[19] = 0xFF;
        assert!(Measurements::decode(&alarm).unwrap().alarm);

        assert!(matches!(
            Measurements::decode(&data[..18]),
            Err(Error::MalformedLength {
                declared: 20,
                actual: 18
            })
        ));
    }

    #[test]
    fn unicast_address() {
        assert!(matches!(
            Address::unicast(0x00),
            Err(Error::InvalidAddressRange(0x00))
        ));
        assert!(matches!(Address::unicast(0x01), Ok(a) if *a == 0x01));
        assert!(matches!(Address::unicast(0xF7), Ok(a) if *a == 0xF7));
        assert!(matches!(
            Address::unicast(0xF8),
            Err(Error::InvalidAddressRange(0xF8))
        ));
        assert!(matches!(
            Address::unicast(0xFF),
            Err(Error::InvalidAddressRange(0xFF))
        ));
        assert!(Address::default().is_general());
        assert!(Address::from(0).is_broadcast());
    }

    #[test]
    fn exception_codes() {
        assert_eq!(ExceptionCode::from(0x02), ExceptionCode::IllegalAddress);
        assert_eq!(ExceptionCode::from(0x17), ExceptionCode::Other(0x17));
        assert_eq!(ExceptionCode::from(0x04).code(), 0x04);
    }
}
