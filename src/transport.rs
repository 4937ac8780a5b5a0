//! The serial transport seam.
//!
//! The bus owns exactly one [`Transport`] and touches it only from the
//! dispatcher worker. Implementations wrap whatever carries the bytes: a
//! real serial port, a pty, or an in-memory link in tests.

use std::io;
use std::time::Duration;

/// Byte-oriented duplex serial channel, consumed exclusively by the bus
/// dispatcher.
pub trait Transport: Send {
    /// Open the channel. Called from [`Bus::start`](crate::Bus::start)
    /// before the dispatcher launches.
    fn open(&mut self) -> io::Result<()>;

    /// Close the channel. Called after the dispatcher has exited.
    fn close(&mut self);

    /// Write all of `data`, blocking until the driver has accepted it.
    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Read available bytes, blocking up to `timeout`. Returns `Ok(0)` on
    /// timeout; that is not an error.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;
}

/// Parity setting for [`PortSettings`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

/// Serial line parameters. Defaults to 38400 baud, 8 data bits, no parity,
/// one stop bit; the host application maps these onto its serial driver
/// when opening the transport.
#[derive(Debug, Clone)]
pub struct PortSettings {
    pub path: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
}

impl PortSettings {
    pub fn new(path: impl Into<String>) -> PortSettings {
        PortSettings {
            path: path.into(),
            baud_rate: 38_400,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
        }
    }
}
