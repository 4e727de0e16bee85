// Licensed under the Apache-2.0 license

//! Pull side of an image download.
//!
//! A [`FetchSession`] wraps one transport [`Connection`] and decides when the
//! body is complete. A zero length read only means "nothing yet"; the stream
//! ends when the declared length has been consumed or the transport reports
//! the end of a body of unknown length.

use log::debug;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("image source {0} is unreachable")]
    Unreachable(String),
    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("server answered with status {0}")]
    UnexpectedStatus(u16),
    #[error("read failed: {0}")]
    Stream(StreamError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("connection reset by peer")]
    Reset,
    #[error("read timed out")]
    Timeout,
    #[error("source sent more than the declared {declared} bytes")]
    Overrun { declared: u64 },
    #[error("session is closed")]
    Closed,
    #[error("{0}")]
    Io(String),
}

/// An open transport delivering the image body.
pub trait Connection {
    /// Reads up to `buf.len()` bytes. `Ok(0)` means no data is available yet.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError>;

    /// Body length announced by the source, if any.
    fn content_length(&self) -> Option<u64>;

    /// Transport level end-of-body marker for bodies without a declared length.
    fn body_finished(&self) -> bool;

    fn close(&mut self) {}
}

/// Where images come from.
pub trait ImageSource {
    type Connection: Connection;

    fn connect(&self) -> Result<Self::Connection, FetchError>;

    /// Human readable location used in logs.
    fn location(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunk {
    /// This many bytes were placed at the start of the caller's buffer.
    Data(usize),
    /// No data right now; poll again.
    Pending,
    EndOfStream,
}

pub struct FetchSession<C: Connection> {
    connection: Option<C>,
    declared_len: Option<u64>,
    received: u64,
}

impl<C: Connection> FetchSession<C> {
    pub fn open<S>(source: &S) -> Result<Self, FetchError>
    where
        S: ImageSource<Connection = C>,
    {
        let connection = source.connect()?;
        let declared_len = connection.content_length();
        debug!(
            "Connected to {}, declared length {:?}",
            source.location(),
            declared_len
        );
        Ok(FetchSession {
            connection: Some(connection),
            declared_len,
            received: 0,
        })
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<Chunk, StreamError> {
        let declared_len = self.declared_len;
        let received = self.received;
        let connection = self.connection.as_mut().ok_or(StreamError::Closed)?;
        if complete(declared_len, received, connection) {
            return Ok(Chunk::EndOfStream);
        }
        match connection.read(buf) {
            Ok(0) if complete(declared_len, received, connection) => Ok(Chunk::EndOfStream),
            Ok(0) => Ok(Chunk::Pending),
            Ok(n) => {
                self.received += n as u64;
                match declared_len {
                    Some(declared) if self.received > declared => {
                        Err(StreamError::Overrun { declared })
                    }
                    _ => Ok(Chunk::Data(n)),
                }
            }
            Err(StreamError::Reset | StreamError::Timeout)
                if complete(declared_len, received, connection) =>
            {
                Ok(Chunk::EndOfStream)
            }
            Err(err) => Err(err),
        }
    }

    /// True once the whole body has been received.
    pub fn is_complete(&self) -> bool {
        match &self.connection {
            Some(connection) => complete(self.declared_len, self.received, connection),
            None => self
                .declared_len
                .is_some_and(|declared| self.received >= declared),
        }
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn declared_len(&self) -> Option<u64> {
        self.declared_len
    }

    /// Releases the connection. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close();
            debug!("Fetch session closed after {} bytes", self.received);
        }
    }
}

impl<C: Connection> Drop for FetchSession<C> {
    fn drop(&mut self) {
        self.close();
    }
}

fn complete<C: Connection>(declared_len: Option<u64>, received: u64, connection: &C) -> bool {
    match declared_len {
        Some(declared) => received >= declared,
        None => connection.body_finished(),
    }
}
