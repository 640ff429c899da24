#![cfg_attr(docsrs, feature(doc_cfg))]
//! # pzem_lib
//!
//! This crate provides a library for reading PZEM-004T v3.0 energy meters over Modbus-RTU.
//!
//! The frame protocol is implemented here: request encoding, CRC16, reply
//! validation and register decoding. The byte channel is injected through the
//! [`transport::Transport`] trait, a serial port implementation is available
//! behind a feature.
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `pzem` command-line tool and pulls in `serialport` and `serde`.
//!
//! ### Transport Features
//! - `serialport`: Enables [`serialport::SerialTransport`] using the `serialport` crate.
//!
//! ### Utility Features
//! - `serde`: Enables `serde` support for serializing/deserializing data structures.
//! - `bin-dependencies`: Enables all features required by the `pzem` binary executable.

/// Modbus CRC16.
pub mod crc;
/// Contains error types for the library.
mod error;
/// Request encoding and reply validation.
pub mod frame;
/// Register map and value decoding of the PZEM-004T.
pub mod protocol;
pub mod session;
pub mod transport;

pub use error::Error;

/// Serial port transport.
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
#[cfg(feature = "serialport")]
pub mod serialport;
