//! Range-checked link addresses and the crate-wide error type.

use snafu::{ensure, OptionExt, Snafu};

use core::convert::{TryFrom, TryInto};
use core::fmt;
use core::ops::Deref;

/// Error type for the bus, its nodes and buffers.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    /// The operation did not complete within the caller-supplied timeout.
    #[snafu(display("Operation timed out"))]
    Timeout,
    /// The dispatcher worker did not signal readiness in time.
    #[snafu(display("Timeout while starting the bus dispatcher"))]
    StartupTimeout,
    /// The value isn't a valid BISYNC link address.
    #[snafu(display("Invalid link address"))]
    InvalidAddress,
    /// A node with this address is already registered on the bus.
    #[snafu(display("A node with address {address} is already registered"))]
    DuplicateAddress {
        /// The contested link address.
        address: u8,
    },
    /// The buffer has been closed.
    #[snafu(display("The buffer has been closed"))]
    Closed,
    /// The node has been closed.
    #[snafu(display("The node has been closed"))]
    Disposed,
    /// The requested size exceeds what the buffer can hold or commit.
    #[snafu(display("Size is greater than the available data or capacity"))]
    OutOfRange,
    /// The serial transport failed.
    #[snafu(display("I/O error on the bus transport"))]
    Io {
        /// Underlying transport error.
        source: std::io::Error,
    },
}

const fn invalid_address() -> InvalidAddressSnafu {
    InvalidAddressSnafu
}

/// `Address` is a range-checked [1, 15] integer, the link address of a
/// secondary station. The wire header carries only the low nibble, and
/// address 0 is reserved.
///
/// ## Example
/// ```
/// use bisync_bus::Address;
/// use std::convert::TryInto;
/// let addr = Address::new(10).unwrap();
/// let addr: Address = 10.try_into().unwrap();
/// ```
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Copy, Clone, Hash)]
#[repr(transparent)]
pub struct Address(u8);

/// Create a new [`Address`], panics if it is out of range.
pub const fn addr(a: u8) -> Address {
    if a >= 1 && a <= 15 {
        return Address(a);
    }
    panic!("Invalid link address.")
}

impl Address {
    /// Create a new address, checking that it is in \[1, 15\].
    /// # Errors
    /// Returns [`Error::InvalidAddress`] if `address` is out of range.
    pub fn new(address: impl TryInto<u8>) -> Result<Self, Error> {
        let address = address.try_into().ok().with_context(invalid_address)?;
        ensure!((1..=15).contains(&address), invalid_address());
        Ok(Self(address))
    }

    /// The select request header byte: `0x80 | address`, sent twice for
    /// error resilience.
    pub(crate) const fn select_header(self) -> u8 {
        0x80 | self.0
    }

    /// The poll request header byte: `0xC0 | address`.
    pub(crate) const fn poll_header(self) -> u8 {
        0xC0 | self.0
    }
}

impl Deref for Address {
    type Target = u8;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl PartialEq<u8> for Address {
    fn eq(&self, other: &u8) -> bool {
        self.0 == *other
    }
}

/// Trait to convert `T: TryInto<u8>` into an [`Address`].
pub trait IntoAddress {
    /// Convert self to an Address.
    /// # Errors
    /// Returns [`Error::InvalidAddress`] if self isn't a valid address.
    fn into_address(self) -> Result<Address, Error>;
}

impl IntoAddress for Address {
    fn into_address(self) -> Result<Address, Error> {
        Ok(self)
    }
}

impl<T> IntoAddress for T
where
    T: TryInto<u8>,
{
    fn into_address(self) -> Result<Address, Error> {
        Address::new(self)
    }
}

impl TryFrom<usize> for Address {
    type Error = Error;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}
