//! Master-station engine for multidrop BISYNC links.
//!
//! A [`Bus`] owns one half-duplex serial [`Transport`] and runs the link
//! from a dedicated dispatcher thread: it selects a secondary station
//! before sending, polls stations for their data, and retries failed
//! exchanges with NAK/ACK handshaking. Applications talk to individual
//! stations through [`Node`] handles whose `send` and `receive` calls are
//! decoupled from the wire by bounded ring buffers.
//!
//! The crate is transport-agnostic: anything implementing [`Transport`]
//! can carry the bytes, from a serial port to an in-memory test link.
//!
//! ```
//! use std::io;
//! use std::time::Duration;
//! use bisync_bus::{addr, Bus, Transport};
//!
//! struct Silent;
//!
//! impl Transport for Silent {
//!     fn open(&mut self) -> io::Result<()> {
//!         Ok(())
//!     }
//!     fn close(&mut self) {}
//!     fn write(&mut self, _data: &[u8]) -> io::Result<()> {
//!         Ok(())
//!     }
//!     fn read(&mut self, _buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
//!         std::thread::sleep(timeout);
//!         Ok(0)
//!     }
//! }
//!
//! # fn main() -> Result<(), bisync_bus::Error> {
//! let mut bus = Bus::new(Silent, Duration::from_millis(10));
//! bus.start()?;
//! let node = bus.create_node_default(addr(5))?;
//! node.send(b"ping", Some(Duration::ZERO))?;
//! bus.stop();
//! # Ok(())
//! # }
//! ```

mod buffer;
mod bus;
mod crc;
mod frame;
mod node;
mod nom_parser;
mod transport;
mod types;

pub use buffer::BoundedBuffer;
pub use bus::Bus;
pub use crc::Crc16;
pub use node::Node;
pub use transport::{Parity, PortSettings, Transport};
pub use types::{addr, Address, Error, IntoAddress};
