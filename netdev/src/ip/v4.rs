//! IPv4 address and endpoint.

use std::{fmt, mem, net::Ipv4Addr};

use super::{Net16, Net32};

/// Native `AF_INET` value.
#[cfg(linux)]
pub const PROTOCOL_ID: u16 = libc::AF_INET as u16;
#[cfg(windows)]
pub const PROTOCOL_ID: u16 = windows_sys::Win32::Networking::WinSock::AF_INET;

/// IPv4 address, 4 bytes in network order.
///
/// The same storage can be viewed as bytes, as two 16 bit words or as one
/// 32 bit word; the word views are network-order integers.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(C, align(4))]
pub struct Address {
  octets: [u8; 4],
}

impl Address {
  pub const UNSPECIFIED: Self = Self::new([0, 0, 0, 0]);
  pub const LOCALHOST: Self = Self::new([127, 0, 0, 1]);

  pub const fn new(octets: [u8; 4]) -> Self {
    Self { octets }
  }

  pub const fn octets(&self) -> [u8; 4] {
    self.octets
  }

  pub fn octets_mut(&mut self) -> &mut [u8; 4] {
    &mut self.octets
  }

  /// 16 bit word `index` (0 or 1).
  ///
  /// # Panics
  ///
  /// Panics if `index > 1`.
  pub fn u16(&self, index: usize) -> Net16 {
    let at = index * 2;
    Net16::from_bytes([self.octets[at], self.octets[at + 1]])
  }

  pub fn u32(&self) -> Net32 {
    Net32::from_bytes(self.octets)
  }

  pub fn set_u32(&mut self, value: Net32) {
    self.octets = value.to_bytes();
  }

  /// Parses dotted-decimal text, `None` if it is not a valid IPv4 address.
  pub fn parse(text: &str) -> Option<Self> {
    text.parse::<Ipv4Addr>().ok().map(Self::from)
  }

  pub fn is_unspecified(&self) -> bool {
    self.octets == [0; 4]
  }

  pub fn is_loopback(&self) -> bool {
    self.octets[0] == 127
  }
}

impl From<Ipv4Addr> for Address {
  fn from(value: Ipv4Addr) -> Self {
    Self::new(value.octets())
  }
}

impl From<Address> for Ipv4Addr {
  fn from(value: Address) -> Self {
    Ipv4Addr::from(value.octets)
  }
}

impl fmt::Display for Address {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(&Ipv4Addr::from(*self), f)
  }
}

impl fmt::Debug for Address {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(self, f)
  }
}

/// IPv4 endpoint with the layout of the native `sockaddr_in`.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct Endpoint {
  family: u16,
  pub port: Net16,
  pub address: Address,
  zero: [u8; 8],
}

impl Endpoint {
  pub const fn new(address: Address, port: u16) -> Self {
    Self { family: PROTOCOL_ID, port: Net16::new(port), address, zero: [0; 8] }
  }

  pub const fn protocol_id(&self) -> u16 {
    self.family
  }
}

impl Default for Endpoint {
  fn default() -> Self {
    Self::new(Address::UNSPECIFIED, 0)
  }
}

impl PartialEq for Endpoint {
  fn eq(&self, other: &Self) -> bool {
    self.address == other.address && self.port == other.port
  }
}

impl Eq for Endpoint {}

impl fmt::Display for Endpoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.address, self.port)
  }
}

impl fmt::Debug for Endpoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(self, f)
  }
}

const _: () = assert!(mem::size_of::<Address>() == 4);
const _: () = assert!(mem::size_of::<Endpoint>() == 16);
const _: () = assert!(mem::offset_of!(Endpoint, port) == 2);
const _: () = assert!(mem::offset_of!(Endpoint, address) == 4);

#[cfg(linux)]
const _: () = {
  assert!(mem::size_of::<Endpoint>() == mem::size_of::<libc::sockaddr_in>());
  assert!(mem::offset_of!(libc::sockaddr_in, sin_family) == 0);
  assert!(mem::offset_of!(libc::sockaddr_in, sin_port) == 2);
  assert!(mem::offset_of!(libc::sockaddr_in, sin_addr) == 4);
};

#[cfg(windows)]
const _: () = {
  use windows_sys::Win32::Networking::WinSock::SOCKADDR_IN;
  assert!(mem::size_of::<Endpoint>() == mem::size_of::<SOCKADDR_IN>());
  assert!(mem::offset_of!(SOCKADDR_IN, sin_port) == 2);
  assert!(mem::offset_of!(SOCKADDR_IN, sin_addr) == 4);
};
