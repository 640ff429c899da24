use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use pzem_lib::protocol::Address;
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

fn parse_address(s: &str) -> Result<Address, String> {
    let address_val =
        clap_num::maybe_hex::<u8>(s).map_err(|e| format!("Invalid address format: {e}"))?;
    let address = Address::from(address_val);
    if address.is_unicast() || address.is_general() {
        Ok(address)
    } else {
        Err(format!(
            "Address {address} must be between {:#04X} and {:#04X} or the general address {}",
            Address::MIN,
            Address::MAX,
            Address::GENERAL
        ))
    }
}

fn parse_u8(s: &str) -> Result<u8, String> {
    clap_num::maybe_hex::<u8>(s).map_err(|e| format!("Invalid address format: {e}"))
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Show voltage, current, power, energy, frequency, power factor and alarm status
    Read,
    /// Show the Modbus-RTU address reported by the device
    Address,
    /// Change the Modbus-RTU address of the device (0x01 - 0xF7)
    SetAddress {
        /// The new address, decimal or hexadecimal (e.g. 5 or 0x05)
        #[arg(value_parser = parse_u8)]
        address: u8,
    },
    /// Show the power alarm threshold in watts
    Threshold,
    /// Set the power alarm threshold in watts
    SetThreshold {
        /// Threshold in watts (e.g. 2300)
        watts: u16,
    },
    /// Reset the energy counter of the device
    ResetEnergy,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum OutputFormat {
    Text,
    Json,
}

const fn about_text() -> &'static str {
    "PZEM-004T energy meter command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Serial port device path (e.g., /dev/ttyUSB0 on Linux, COM1 on Windows)
    #[arg(short, long, default_value_t = default_device_name())]
    pub device: String,

    /// Modbus-RTU address of the device, 0xF8 works when it is the only one on the bus
    #[arg(short, long, value_parser = parse_address, default_value = "0xF8")]
    pub address: Address,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Timeout for a reply from the device (e.g., "500ms", "1s")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "500ms")]
    pub timeout: Duration,

    // Some USB - RS485 dongles requires at least 10ms to switch between TX and RX, so use a save delay between frames
    /// Delay between two requests (e.g., "50ms", "100ms")
    /// (useful for some serial adapters that need time to switch between TX/RX)
    #[arg(value_parser = humantime::parse_duration, long, default_value = "15ms")]
    pub delay: Duration,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}
