//! The byte channel a [`crate::session::Pzem`] talks through.
//!
//! The bus is half-duplex and shared by all slaves, so at most one request may
//! be in flight per transport. [`Transport::transact`] is the unit of work: one
//! request and its reply. Wrap a transport in `Arc<Mutex<_>>` to share it
//! between several sessions; the lock is then held for the whole exchange.

use crate::Error;
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

pub trait Transport {
    /// Writes a complete request frame.
    fn send(&mut self, frame: &[u8]) -> Result<(), Error>;

    /// Returns whatever arrived within `timeout`, at most `max_len` bytes.
    ///
    /// The result may be shorter than a complete frame. Implementations return
    /// [`Error::TransportTimeout`] when nothing arrived at all.
    fn receive(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, Error>;

    /// Sends `request` and waits for a reply of up to `reply_len` bytes.
    ///
    /// With `reply_len == 0` no reply is awaited and an empty buffer is returned.
    fn transact(
        &mut self,
        request: &[u8],
        reply_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, Error> {
        self.send(request)?;
        if reply_len == 0 {
            return Ok(Vec::new());
        }
        self.receive(reply_len, timeout)
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send(&mut self, frame: &[u8]) -> Result<(), Error> {
        (**self).send(frame)
    }

    fn receive(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, Error> {
        (**self).receive(max_len, timeout)
    }

    fn transact(
        &mut self,
        request: &[u8],
        reply_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, Error> {
        (**self).transact(request, reply_len, timeout)
    }
}

impl<T: Transport> Transport for Arc<Mutex<T>> {
    fn send(&mut self, frame: &[u8]) -> Result<(), Error> {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(frame)
    }

    fn receive(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, Error> {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .receive(max_len, timeout)
    }

    fn transact(
        &mut self,
        request: &[u8],
        reply_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, Error> {
        // Keep the bus for the whole exchange so replies cannot be interleaved.
        let mut transport = self.lock().unwrap_or_else(PoisonError::into_inner);
        transport.transact(request, reply_len, timeout)
    }
}
