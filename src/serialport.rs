use crate::{protocol::MINIMUM_DELAY, transport::Transport, Error};
use std::{
    io::{self, ErrorKind, Read, Write},
    time::{Duration, Instant},
};

/// Silence kept on the bus after the last frame, sent or received.
#[derive(Debug)]
struct FrameSpacing {
    last_execution: Instant,
    delay: Duration,
}

impl FrameSpacing {
    fn remaining(&self, now: Instant) -> Duration {
        let last_exec_diff = now.saturating_duration_since(self.last_execution);
        self.delay.saturating_sub(last_exec_diff)
    }

    fn await_delay(&self) {
        let time_until_delay_reached = self.remaining(Instant::now());
        if !time_until_delay_reached.is_zero() {
            std::thread::sleep(time_until_delay_reached);
        }
    }

    fn mark(&mut self) {
        self.spacing.mark();
    }
}

/// Serial line transport, 9600 baud 8N1 as the PZEM-004T expects.
#[derive(Debug)]
pub struct SerialTransport {
    serial: Box<dyn serialport::SerialPort>,
    spacing: FrameSpacing,
}

impl SerialTransport {
    pub fn new(port: &str) -> Result<Self, Error> {
        let serial = serialport::new(port, 9600)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()
            .inspect_err(|err| log::error!("Cannot open serial port '{port}': {err}"))
            .map_err(io::Error::from)?;
        Ok(Self {
            serial,
            spacing: FrameSpacing {
                last_execution: Instant::now(),
                delay: MINIMUM_DELAY,
            },
        })
    }

    /// Sets the minimum silence between the last frame on the bus and the next request.
    ///
    /// Values below [`MINIMUM_DELAY`] are raised to it.
    pub fn set_delay(&mut self, delay: Duration) {
        if delay < MINIMUM_DELAY {
            log::warn!("delay {delay:?} lower minimum {MINIMUM_DELAY:?}, use minimum");
            self.spacing.delay = MINIMUM_DELAY;
        } else {
            self.spacing.delay = delay;
        }
        log::trace!("set delay to {:?}", self.spacing.delay);
    }

    fn drain_pending(&mut self) -> Result<(), Error> {
        // A late reply to a timed out request must not be taken for the next one.
        loop {
            let pending = self.serial.bytes_to_read().map_err(io::Error::from)?;
            if pending == 0 {
                return Ok(());
            }
            log::trace!("Got {pending} pending bytes");
            let mut buf: Vec<u8> = vec![0; pending as usize];
            let received = self.serial.read(buf.as_mut_slice())?;
            log::trace!("Dropped {} pending bytes: {:02X?}", received, &buf[..received]);
        }
    }
}

impl Transport for SerialTransport {
    fn send(&mut self, frame: &[u8]) -> Result<(), Error> {
        self.drain_pending()?;
        self.spacing.await_delay();

        log::trace!("write bytes: {frame:02X?}");
        self.serial.write_all(frame)?;
        // a broadcast is not followed by a reply, the silence counts from here
        self.spacing.mark();
        Ok(())
    }

    fn receive(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, Error> {
        let deadline = Instant::now() + timeout;
        let mut rx_buffer = vec![0; max_len];
        let mut received = 0;

        while received < max_len {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            self.serial
                .set_timeout(remaining)
                .map_err(io::Error::from)?;
            match self.serial.read(&mut rx_buffer[received..]) {
                Ok(0) => break,
                Ok(n) => received += n,
                Err(err) if err.kind() == ErrorKind::TimedOut => break,
                Err(err) => return Err(err.into()),
            }
        }
        self.spacing.mark();

        rx_buffer.truncate(received);
        log::trace!("receive_bytes: {rx_buffer:02X?}");
        if rx_buffer.is_empty() {
            return Err(Error::TransportTimeout);
        }
        Ok(rx_buffer)
    }
}
