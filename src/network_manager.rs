//! Network Interface Holder
//!
//! # Design
//! The transport is abstracted away into a separate struct to facilitate simple ownership
//! semantics of reading and writing. This allows the transport to be used to transmit buffers that
//! are stored internally in other structs without violating Rust's borrow rules.
//!
//! A packet that could only be partially written is buffered here and must be flushed before any
//! other packet is written, so packets are never interleaved on the wire.
use embedded_nal::{nb, SocketAddr, TcpClientStack};
use heapless::Vec;

use crate::{EncodeError, Error};

/// A reliable, in-order byte stream to the broker.
pub trait Transport {
    type Error;

    /// Write as much of `data` as possible without blocking.
    ///
    /// # Returns
    /// The number of bytes accepted. Zero indicates the transport cannot accept data right now.
    fn send(&mut self, data: &[u8]) -> Result<usize, Self::Error>;

    /// Read any available bytes into `buf`.
    ///
    /// # Returns
    /// The number of bytes read. Zero indicates no data is available yet.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;
}

/// A [Transport] over a connected `embedded-nal` TCP socket.
pub struct NalTransport<S: TcpClientStack> {
    stack: S,
    socket: S::TcpSocket,
}

impl<S: TcpClientStack> NalTransport<S> {
    /// Wrap an already connected socket.
    pub fn new(stack: S, socket: S::TcpSocket) -> Self {
        Self { stack, socket }
    }

    /// Allocate a socket and connect it to the broker, blocking until the connection completes.
    pub fn connect(mut stack: S, remote: SocketAddr) -> Result<Self, S::Error> {
        let mut socket = stack.socket()?;
        if let Err(err) = nb::block!(stack.connect(&mut socket, remote)) {
            stack.close(socket).ok();
            return Err(err);
        }

        Ok(Self { stack, socket })
    }

    /// Close the socket and return the network stack.
    pub fn close(mut self) -> Result<S, S::Error> {
        self.stack.close(self.socket)?;
        Ok(self.stack)
    }
}

impl<S: TcpClientStack> Transport for NalTransport<S> {
    type Error = S::Error;

    fn send(&mut self, data: &[u8]) -> Result<usize, S::Error> {
        self.stack
            .send(&mut self.socket, data)
            .or_else(|err| match err {
                nb::Error::WouldBlock => Ok(0),
                nb::Error::Other(err) => Err(err),
            })
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, S::Error> {
        self.stack
            .receive(&mut self.socket, buf)
            .or_else(|err| match err {
                nb::Error::WouldBlock => Ok(0),
                nb::Error::Other(err) => Err(err),
            })
    }
}

/// Simple structure for maintaining state of the network connection.
pub(crate) struct InterfaceHolder<T: Transport, const MSG_SIZE: usize> {
    transport: T,
    pending_write: Option<Vec<u8, MSG_SIZE>>,
}

impl<T, const MSG_SIZE: usize> InterfaceHolder<T, MSG_SIZE>
where
    T: Transport,
{
    /// Construct a new network holder utility.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            pending_write: None,
        }
    }

    /// Determine if a new packet may be written.
    pub fn ready(&self) -> bool {
        self.pending_write.is_none()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Write a complete packet to the interface.
    ///
    /// # Note
    /// Any unwritten tail is kept and written by [InterfaceHolder::finish_write]. The interface
    /// must be [InterfaceHolder::ready] before calling this.
    pub fn write(&mut self, data: &[u8]) -> Result<(), Error<T::Error>> {
        debug_assert!(self.pending_write.is_none());

        let written = self.transport.send(data).map_err(Error::Network)?;
        trace!("Wrote: {:0x?}", &data[..written]);

        if written < data.len() {
            let tail = Vec::from_slice(&data[written..])
                .map_err(|_| Error::Encode(EncodeError::BufferTooSmall))?;
            self.pending_write.replace(tail);
        }

        Ok(())
    }

    /// Finish writing a partially written packet if one exists.
    ///
    /// # Returns
    /// True if the interface is ready for a new packet.
    pub fn finish_write(&mut self) -> Result<bool, Error<T::Error>> {
        if let Some(packet) = self.pending_write.take() {
            self.write(&packet)?;
        }

        Ok(self.ready())
    }

    /// Drop any partially written packet. Used when the connection is torn down.
    pub fn discard_pending(&mut self) {
        if self.pending_write.take().is_some() {
            warn!("Discarding partially written packet");
        }
    }

    /// Read data from the transport.
    ///
    /// # Returns
    /// The number of bytes successfully read.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error<T::Error>> {
        let received = self.transport.recv(buf).map_err(Error::Network)?;
        if received > 0 {
            trace!("Read: {:0x?}", &buf[..received]);
        }

        Ok(received)
    }
}
