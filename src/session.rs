//! One PZEM-004T on the bus.
//!
//! A [`Pzem`] resolves the slave address when it is created and keeps the
//! last successfully read [`Measurements`]. Every operation performs exactly
//! one request/reply exchange and never retries; the caller decides how to
//! react to a failure.
//!
//! ```no_run
//! use pzem_lib::{protocol::Address, serialport::SerialTransport, session::Pzem};
//!
//! fn main() -> Result<(), pzem_lib::Error> {
//!     let transport = SerialTransport::new("/dev/ttyUSB0")?;
//!     let mut pzem = Pzem::new(transport, Address::GENERAL);
//!     pzem.set_address(0x05)?;
//!     println!("{}", pzem.read()?);
//!     Ok(())
//! }
//! ```

use crate::{
    frame,
    protocol::{
        decode_holding_register, Address, Measurements, DEFAULT_TIMEOUT, READ_HOLDING_REGISTERS,
        READ_INPUT_REGISTERS, RESET_ENERGY, SLAVE_ADDRESS, THRESHOLD, WRITE_SINGLE_REGISTER,
    },
    transport::Transport,
    Error,
};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// The device has not confirmed an address yet.
    Unresolved,
    /// The last operation succeeded.
    Resolved,
    /// The last operation failed, the address is still assumed valid.
    Faulted,
}

#[derive(Debug)]
pub struct Pzem<T: Transport> {
    transport: T,
    address: Address,
    state: State,
    timeout: Duration,
    measurements: Option<Measurements>,
    threshold: Option<u16>,
    reading_time: Duration,
}

impl<T: Transport> Pzem<T> {
    /// Creates a session and searches the device at `address`.
    ///
    /// `address` may be [`Address::GENERAL`] when the device is alone on the
    /// bus. If the device does not answer, the session stays
    /// [`State::Unresolved`] until [`Pzem::resolve_address`] succeeds.
    ///
    /// A broadcast or reserved `address` can never be resolved: the session
    /// stays [`State::Unresolved`] for good and nothing is ever sent. Check
    /// [`Pzem::state`] after construction.
    pub fn new(transport: T, address: Address) -> Self {
        Self::with_timeout(transport, address, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(transport: T, address: Address, timeout: Duration) -> Self {
        let mut pzem = Self {
            transport,
            address,
            state: State::Unresolved,
            timeout,
            measurements: None,
            threshold: None,
            reading_time: Duration::ZERO,
        };
        match pzem.resolve_address() {
            Err(Error::InvalidAddressRange(_)) => {
                log::error!("Address {address} cannot be used to search a device")
            }
            Err(err) => log::warn!("No device found at address {address}: {err}"),
            Ok(_) => {}
        }
        pzem
    }

    /// Reads the address register and adopts the address the device reports.
    ///
    /// Fails with [`Error::InvalidAddressRange`] without touching the bus when
    /// the session was created for a broadcast or reserved address.
    pub fn resolve_address(&mut self) -> Result<Address, Error> {
        if !(self.address.is_unicast() || self.address.is_general()) {
            return Err(Error::InvalidAddressRange(*self.address));
        }
        let request = frame::encode_read(
            self.address,
            READ_HOLDING_REGISTERS,
            SLAVE_ADDRESS.address,
            SLAVE_ADDRESS.words,
        );
        let result = self
            .exchange(&request, READ_HOLDING_REGISTERS, frame::read_reply_len(1))
            .and_then(|payload| {
                let value =
                    decode_holding_register(frame::register_data(&payload), &SLAVE_ADDRESS)?;
                Address::unicast(value.to_be_bytes()[1])
            });
        let address = self.track(result)?;
        if address != self.address {
            log::debug!("Device at {} reports address {address}", self.address);
        }
        self.address = address;
        Ok(address)
    }

    /// Reads all measurement registers in one exchange.
    ///
    /// On failure the previous snapshot is kept.
    pub fn read(&mut self) -> Result<&Measurements, Error> {
        self.ensure_resolved()?;
        let request = frame::encode_read(
            self.address,
            READ_INPUT_REGISTERS,
            Measurements::ADDRESS,
            Measurements::QUANTITY,
        );
        let result = self
            .exchange(
                &request,
                READ_INPUT_REGISTERS,
                frame::read_reply_len(Measurements::QUANTITY),
            )
            .and_then(|payload| Measurements::decode(frame::register_data(&payload)));
        let measurements = self.track(result)?;
        Ok(self.measurements.insert(measurements))
    }

    /// Changes the slave address of the device, valid range is 0x01..=0xF7.
    ///
    /// The device answers only to the new address afterwards, so the session
    /// follows it.
    pub fn set_address(&mut self, address: u8) -> Result<(), Error> {
        let address = Address::unicast(address)?;
        self.ensure_resolved()?;
        let request = frame::encode_write(
            self.address,
            WRITE_SINGLE_REGISTER,
            SLAVE_ADDRESS.address,
            u16::from(*address),
        );
        let result = self.write(&request);
        self.track(result)?;
        log::debug!("Slave address changed from {} to {address}", self.address);
        self.address = address;
        Ok(())
    }

    /// Writes the power alarm threshold in watts.
    pub fn set_threshold(&mut self, watts: u16) -> Result<(), Error> {
        self.ensure_resolved()?;
        let request =
            frame::encode_write(self.address, WRITE_SINGLE_REGISTER, THRESHOLD.address, watts);
        let result = self.write(&request);
        self.track(result)?;
        self.threshold = Some(watts);
        Ok(())
    }

    /// Reads the power alarm threshold in watts.
    pub fn read_threshold(&mut self) -> Result<u16, Error> {
        self.ensure_resolved()?;
        let request = frame::encode_read(
            self.address,
            READ_HOLDING_REGISTERS,
            THRESHOLD.address,
            THRESHOLD.words,
        );
        let result = self
            .exchange(&request, READ_HOLDING_REGISTERS, frame::read_reply_len(1))
            .and_then(|payload| {
                decode_holding_register(frame::register_data(&payload), &THRESHOLD)
            });
        let watts = self.track(result)?;
        self.threshold = Some(watts);
        Ok(watts)
    }

    /// Zeroes the energy counter of the device.
    ///
    /// The local snapshot keeps the old energy value until the next [`Pzem::read`].
    pub fn reset_energy(&mut self) -> Result<(), Error> {
        self.ensure_resolved()?;
        let request = frame::encode_reset_energy(self.address);
        let result = self
            .exchange(&request, RESET_ENERGY, frame::RESET_REPLY_LEN)
            .map(|_| ());
        self.track(result)
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        log::trace!("set timeout to {timeout:?}");
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The last successful reading, `None` before the first one.
    pub fn measurements(&self) -> Option<&Measurements> {
        self.measurements.as_ref()
    }

    /// Alarm status reported by the device with the last reading.
    pub fn alarm(&self) -> bool {
        self.measurements.as_ref().is_some_and(|m| m.alarm)
    }

    pub fn voltage(&self) -> Option<f32> {
        self.measurements.as_ref().map(|m| m.voltage)
    }

    pub fn current(&self) -> Option<f32> {
        self.measurements.as_ref().map(|m| m.current)
    }

    pub fn power(&self) -> Option<f32> {
        self.measurements.as_ref().map(|m| m.power)
    }

    pub fn energy(&self) -> Option<f32> {
        self.measurements.as_ref().map(|m| m.energy)
    }

    pub fn frequency(&self) -> Option<f32> {
        self.measurements.as_ref().map(|m| m.frequency)
    }

    pub fn power_factor(&self) -> Option<f32> {
        self.measurements.as_ref().map(|m| m.power_factor)
    }

    /// The last threshold read from or written to the device.
    pub fn threshold(&self) -> Option<u16> {
        self.threshold
    }

    /// Duration of the last exchange, from sending the request until the reply was decoded.
    pub fn reading_time(&self) -> Duration {
        self.reading_time
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    fn ensure_resolved(&self) -> Result<(), Error> {
        match self.state {
            State::Unresolved => Err(Error::NotResolved),
            State::Resolved | State::Faulted => Ok(()),
        }
    }

    fn track<R>(&mut self, result: Result<R, Error>) -> Result<R, Error> {
        let state = match (&result, self.state) {
            (Ok(_), _) => State::Resolved,
            (Err(_), State::Unresolved) => State::Unresolved,
            (Err(_), _) => State::Faulted,
        };
        if state != self.state {
            log::debug!("Session {} state {:?} -> {state:?}", self.address, self.state);
            self.state = state;
        }
        result
    }

    fn exchange(
        &mut self,
        request: &[u8],
        function: u8,
        reply_len: usize,
    ) -> Result<Vec<u8>, Error> {
        let address = self.address;
        let start = Instant::now();
        let result = self
            .transport
            .transact(request, reply_len, self.timeout)
            .and_then(|rx_buffer| {
                let decoded = frame::decode_response(&rx_buffer, address, function);
                let received = rx_buffer.len();
                match decoded {
                    // an exception reply is shorter than the regular one
                    Err(Error::DeviceException(code)) => Err(Error::DeviceException(code)),
                    _ if received < reply_len => {
                        log::warn!("Incomplete reply - expected={reply_len} received={received}");
                        Err(Error::Truncated {
                            expected: reply_len,
                            received,
                        })
                    }
                    decoded => decoded.map(<[u8]>::to_vec),
                }
            });
        self.reading_time = start.elapsed();
        result
    }

    fn write(&mut self, request: &[u8]) -> Result<(), Error> {
        let payload = self.exchange(request, WRITE_SINGLE_REGISTER, frame::WRITE_REPLY_LEN)?;
        if payload != request[2..request.len() - 2] {
            log::warn!("Write reply {payload:02X?} does not echo request {request:02X?}");
            return Err(Error::EchoMismatch);
        }
        Ok(())
    }
}

/// Resets the energy counter of every device on the bus; nobody replies.
pub fn broadcast_reset_energy<T: Transport>(transport: &mut T) -> Result<(), Error> {
    let request = frame::encode_reset_energy(Address::BROADCAST);
    transport.transact(&request, 0, Duration::ZERO)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{crc::append_crc16, protocol::ExceptionCode, transport::mock::MockTransport};
    use std::sync::{Arc, Mutex};

    fn frame(bytes: &[u8]) -> Vec<u8> {
        let mut frame = bytes.to_vec();
        append_crc16(&mut frame);
        frame
    }

    fn address_reply(address: u8) -> Vec<u8> {
        frame(&[address, 0x03, 0x02, 0x00, address])
    }

    fn measurements_reply(address: u8, voltage: u16) -> Vec<u8> {
        let [hi, lo] = voltage.to_be_bytes();
        frame(&[
            address, 0x04, 0x14, hi, lo, 0x01, 0xF4, 0x00, 0x00, 0x04, 0x7E, 0x00, 0x00, 0x30,
            0x39, 0x00, 0x00, 0x01, 0xF4, 0x00, 0x5F, 0xFF, 0xFF,
        ])
    }

    fn resolved(address: u8) -> Pzem<MockTransport> {
        let mut transport = MockTransport::default();
        transport.reply(address_reply(address));
        let pzem = Pzem::new(transport, Address::GENERAL);
        assert_eq!(pzem.state(), State::Resolved);
        pzem
    }

    #[test]
    fn resolves_through_general_address() {
        let pzem = resolved(0x01);
        assert_eq!(pzem.address(), Address::from(0x01));
        assert!(pzem.measurements().is_none());
        let transport = pzem.into_inner();
        assert_eq!(
            transport.sent,
            vec![vec![0xF8, 0x03, 0x00, 0x02, 0x00, 0x01, 0x31, 0xA3]]
        );
    }

    #[test]
    fn unresolved_until_address_read() {
        let mut transport = MockTransport::default();
        transport.timeout();
        let mut pzem = Pzem::new(transport, Address::from(0x01));
        assert_eq!(pzem.state(), State::Unresolved);

        assert!(matches!(pzem.read(), Err(Error::NotResolved)));
        assert!(matches!(pzem.reset_energy(), Err(Error::NotResolved)));
        assert!(matches!(pzem.read_threshold(), Err(Error::NotResolved)));
        assert!(matches!(pzem.set_threshold(100), Err(Error::NotResolved)));
        assert!(matches!(pzem.set_address(0x02), Err(Error::NotResolved)));

        pzem.transport.reply(address_reply(0x01));
        assert_eq!(pzem.resolve_address().unwrap(), Address::from(0x01));
        assert_eq!(pzem.state(), State::Resolved);
        // one failed and one successful address read
        assert_eq!(pzem.into_inner().sent.len(), 2);
    }

    #[test]
    fn invalid_requested_address_sends_nothing() {
        for address in [0x00, 0xF9, 0xFF] {
            let mut pzem = Pzem::new(MockTransport::default(), Address::from(address));
            assert_eq!(pzem.state(), State::Unresolved);
            assert!(matches!(
                pzem.resolve_address(),
                Err(Error::InvalidAddressRange(a)) if a == address
            ));
            assert!(matches!(pzem.read(), Err(Error::NotResolved)));
            assert_eq!(pzem.state(), State::Unresolved);
            assert!(pzem.into_inner().sent.is_empty());
        }
    }

    #[test]
    fn set_address_rejects_out_of_range() {
        let mut pzem = resolved(0x01);
        for address in [0x00, 0xF8, 0xFF] {
            assert!(matches!(
                pzem.set_address(address),
                Err(Error::InvalidAddressRange(a)) if a == address
            ));
        }
        assert_eq!(pzem.transport.sent.len(), 1);
        assert_eq!(pzem.address(), Address::from(0x01));
        assert_eq!(pzem.state(), State::Resolved);
    }

    #[test]
    fn set_address_follows_device() {
        let mut pzem = resolved(0x01);
        pzem.transport
            .reply(frame(&[0x01, 0x06, 0x00, 0x02, 0x00, 0x05]))
            .reply(measurements_reply(0x05, 2301));
        pzem.set_address(0x05).unwrap();
        assert_eq!(pzem.address(), Address::from(0x05));
        assert_eq!(pzem.transport.sent[1][..6], [0x01, 0x06, 0x00, 0x02, 0x00, 0x05]);

        pzem.read().unwrap();
        assert_eq!(
            pzem.transport.sent[2],
            frame(&[0x05, 0x04, 0x00, 0x00, 0x00, 0x0A])
        );
    }

    #[test]
    fn set_address_echo_mismatch() {
        let mut pzem = resolved(0x01);
        pzem.transport.reply(frame(&[0x01, 0x06, 0x00, 0x02, 0x00, 0x06]));
        assert!(matches!(pzem.set_address(0x05), Err(Error::EchoMismatch)));
        assert_eq!(pzem.address(), Address::from(0x01));
        assert_eq!(pzem.state(), State::Faulted);
    }

    #[test]
    fn read_measurements() {
        let mut pzem = resolved(0x01);
        pzem.transport.reply(measurements_reply(0x01, 2301));
        let m = pzem.read().unwrap().clone();
        assert_eq!(m.voltage, 230.1);
        assert_eq!(m.current, 0.5);
        assert_eq!(m.power, 115.0);
        assert_eq!(m.energy, 12345.0);
        assert_eq!(m.frequency, 50.0);
        assert_eq!(m.power_factor, 0.95);
        assert!(pzem.alarm());
        assert_eq!(pzem.voltage(), Some(230.1));
        assert_eq!(
            pzem.transport.sent[1],
            [0x01, 0x04, 0x00, 0x00, 0x00, 0x0A, 0x70, 0x0D]
        );
    }

    #[test]
    fn failed_read_keeps_snapshot() {
        let mut pzem = resolved(0x01);
        pzem.transport.reply(measurements_reply(0x01, 2301));
        let first = pzem.read().unwrap().clone();

        pzem.transport.timeout();
        assert!(matches!(pzem.read(), Err(Error::TransportTimeout)));
        assert_eq!(pzem.state(), State::Faulted);
        assert_eq!(pzem.measurements(), Some(&first));

        let mut corrupted = measurements_reply(0x01, 2400);
        corrupted[4] ^= 0x01;
        pzem.transport.reply(corrupted);
        assert!(matches!(pzem.read(), Err(Error::ChecksumMismatch { .. })));
        assert_eq!(pzem.measurements(), Some(&first));

        pzem.transport.reply(measurements_reply(0x01, 2400));
        assert_eq!(pzem.read().unwrap().voltage, 240.0);
        assert_eq!(pzem.state(), State::Resolved);
    }

    #[test]
    fn truncated_read() {
        let mut pzem = resolved(0x01);
        let reply = measurements_reply(0x01, 2301);
        pzem.transport.reply(reply[..12].to_vec());
        assert!(matches!(
            pzem.read(),
            Err(Error::Truncated {
                expected: 25,
                received: 12
            })
        ));
        assert_eq!(pzem.state(), State::Faulted);
        pzem.transport.reply(reply[..3].to_vec());
        assert!(matches!(
            pzem.read(),
            Err(Error::Truncated {
                expected: 25,
                received: 3
            })
        ));
        assert!(pzem.measurements().is_none());
    }

    #[test]
    fn truncated_write_reply() {
        let mut pzem = resolved(0x01);
        let echo = frame(&[0x01, 0x06, 0x00, 0x01, 0x08, 0xFC]);
        pzem.transport.reply(echo[..6].to_vec());
        assert!(matches!(
            pzem.set_threshold(2300),
            Err(Error::Truncated {
                expected: 8,
                received: 6
            })
        ));
        assert_eq!(pzem.threshold(), None);
    }

    #[test]
    fn device_exception_faults_session() {
        let mut pzem = resolved(0x01);
        pzem.transport.reply(frame(&[0x01, 0x84, 0x02]));
        assert!(matches!(
            pzem.read(),
            Err(Error::DeviceException(ExceptionCode::IllegalAddress))
        ));
        assert_eq!(pzem.state(), State::Faulted);
        assert_eq!(pzem.address(), Address::from(0x01));
    }

    #[test]
    fn threshold() {
        let mut pzem = resolved(0x01);
        assert_eq!(pzem.threshold(), None);
        pzem.transport
            .reply(frame(&[0x01, 0x06, 0x00, 0x01, 0x08, 0xFC]))
            .reply(frame(&[0x01, 0x03, 0x02, 0x00, 0x64]));
        pzem.set_threshold(2300).unwrap();
        assert_eq!(pzem.threshold(), Some(2300));
        assert_eq!(
            pzem.transport.sent[1],
            [0x01, 0x06, 0x00, 0x01, 0x08, 0xFC, 0xDF, 0x8B]
        );
        assert_eq!(pzem.read_threshold().unwrap(), 100);
        assert_eq!(pzem.threshold(), Some(100));
        assert_eq!(
            pzem.transport.sent[2],
            frame(&[0x01, 0x03, 0x00, 0x01, 0x00, 0x01])
        );
    }

    #[test]
    fn reset_energy_keeps_snapshot() {
        let mut pzem = resolved(0x01);
        pzem.transport
            .reply(measurements_reply(0x01, 2301))
            .reply(frame(&[0x01, 0x42]));
        pzem.read().unwrap();
        pzem.reset_energy().unwrap();
        assert_eq!(pzem.transport.sent[2], [0x01, 0x42, 0x80, 0x11]);
        assert_eq!(pzem.energy(), Some(12345.0));
    }

    #[test]
    fn broadcast_reset() {
        let mut transport = MockTransport::default();
        broadcast_reset_energy(&mut transport).unwrap();
        assert_eq!(transport.sent, vec![frame(&[0x00, 0x42])]);
    }

    #[test]
    fn reading_time_of_every_exchange() {
        let latency = Duration::from_millis(30);
        let mut pzem = resolved(0x01);
        pzem.transport
            .reply(measurements_reply(0x01, 2301))
            .reply(frame(&[0x01, 0x06, 0x00, 0x01, 0x08, 0xFC]))
            .reply(frame(&[0x01, 0x42]));

        pzem.transport.latency = latency;
        pzem.read().unwrap();
        assert!(pzem.reading_time() >= latency);

        pzem.transport.latency = Duration::ZERO;
        pzem.set_threshold(2300).unwrap();
        assert!(pzem.reading_time() < latency);

        pzem.transport.latency = latency;
        pzem.reset_energy().unwrap();
        assert!(pzem.reading_time() >= latency);
    }

    #[test]
    fn timeout_reaches_transport() {
        let mut transport = MockTransport::default();
        transport.reply(address_reply(0x01));
        let mut pzem = Pzem::with_timeout(transport, Address::GENERAL, Duration::from_millis(80));
        assert_eq!(pzem.timeout(), Duration::from_millis(80));
        pzem.set_timeout(Duration::from_millis(20));
        pzem.transport.timeout();
        pzem.transport.latency = Duration::from_secs(1);
        assert!(matches!(pzem.read(), Err(Error::TransportTimeout)));
        assert!(pzem.reading_time() < Duration::from_secs(1));
        assert_eq!(
            pzem.into_inner().timeouts,
            [Duration::from_millis(80), Duration::from_millis(20)]
        );
    }

    #[test]
    fn borrowed_transport() {
        let mut transport = MockTransport::default();
        transport
            .reply(address_reply(0x01))
            .reply(measurements_reply(0x01, 2301));
        let mut pzem = Pzem::new(&mut transport, Address::GENERAL);
        assert_eq!(pzem.read().unwrap().voltage, 230.1);
        drop(pzem);

        broadcast_reset_energy(&mut transport).unwrap();
        assert_eq!(transport.sent.len(), 3);
        assert_eq!(transport.timeouts, [DEFAULT_TIMEOUT, DEFAULT_TIMEOUT]);
    }

    #[test]
    fn sessions_share_one_bus() {
        let bus = Arc::new(Mutex::new(MockTransport::default()));
        bus.lock()
            .unwrap()
            .reply(address_reply(0x01))
            .reply(address_reply(0x02))
            .reply(measurements_reply(0x02, 2200))
            .reply(measurements_reply(0x01, 2301));

        let mut first = Pzem::new(Arc::clone(&bus), Address::from(0x01));
        let mut second = Pzem::new(Arc::clone(&bus), Address::from(0x02));
        assert_eq!(second.read().unwrap().voltage, 220.0);
        assert_eq!(first.read().unwrap().voltage, 230.1);

        let bus = bus.lock().unwrap();
        let sent = &bus.sent;
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[2][0], 0x02);
        assert_eq!(sent[3][0], 0x01);
    }
}
