//! Wire-exact IPv4/IPv6 addresses and endpoints.
//!
//! Every type in here has the same memory layout as the native socket
//! address structures of the target platform, so an [`Endpoint`] can be
//! handed to `bind`/`connect`/`sendto`/`recvfrom` (or their io_uring/IOCP
//! equivalents) by pointer.
//!
//! Multi-byte fields are stored in network byte order through [`Net16`] and
//! [`Net32`], which convert to host order on access.

use std::{cmp::Ordering, fmt};

mod endpoint;
pub mod v4;
pub mod v6;

pub use endpoint::Endpoint;

/// 16 bit integer that is stored in network byte order.
///
/// ```
/// use netdev::ip::Net16;
///
/// let port = Net16::new(80);
/// assert_eq!(port.get(), 80);
/// assert_eq!(port.raw(), 80u16.to_be());
/// ```
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Net16(u16);

impl Net16 {
  /// Stores the host-order value `value`.
  #[inline]
  pub const fn new(value: u16) -> Self {
    Self(value.to_be())
  }

  /// Wraps a value that already is in network byte order.
  #[inline]
  pub const fn from_raw(raw: u16) -> Self {
    Self(raw)
  }

  /// Host-order value.
  #[inline]
  pub const fn get(self) -> u16 {
    u16::from_be(self.0)
  }

  /// The stored network-order representation.
  #[inline]
  pub const fn raw(self) -> u16 {
    self.0
  }

  #[inline]
  pub fn set(&mut self, value: u16) {
    self.0 = value.to_be();
  }

  pub(crate) const fn from_bytes(bytes: [u8; 2]) -> Self {
    Self(u16::from_ne_bytes(bytes))
  }
}

impl From<u16> for Net16 {
  fn from(value: u16) -> Self {
    Self::new(value)
  }
}

impl From<Net16> for u16 {
  fn from(value: Net16) -> Self {
    value.get()
  }
}

impl PartialEq<u16> for Net16 {
  fn eq(&self, other: &u16) -> bool {
    self.get() == *other
  }
}

impl PartialOrd for Net16 {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for Net16 {
  fn cmp(&self, other: &Self) -> Ordering {
    self.get().cmp(&other.get())
  }
}

impl fmt::Debug for Net16 {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Debug::fmt(&self.get(), f)
  }
}

impl fmt::Display for Net16 {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(&self.get(), f)
  }
}

/// 32 bit integer that is stored in network byte order.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Net32(u32);

impl Net32 {
  /// Stores the host-order value `value`.
  #[inline]
  pub const fn new(value: u32) -> Self {
    Self(value.to_be())
  }

  /// Wraps a value that already is in network byte order.
  #[inline]
  pub const fn from_raw(raw: u32) -> Self {
    Self(raw)
  }

  /// Host-order value.
  #[inline]
  pub const fn get(self) -> u32 {
    u32::from_be(self.0)
  }

  /// The stored network-order representation.
  #[inline]
  pub const fn raw(self) -> u32 {
    self.0
  }

  #[inline]
  pub fn set(&mut self, value: u32) {
    self.0 = value.to_be();
  }

  pub(crate) const fn from_bytes(bytes: [u8; 4]) -> Self {
    Self(u32::from_ne_bytes(bytes))
  }

  pub(crate) const fn to_bytes(self) -> [u8; 4] {
    self.0.to_ne_bytes()
  }
}

impl From<u32> for Net32 {
  fn from(value: u32) -> Self {
    Self::new(value)
  }
}

impl From<Net32> for u32 {
  fn from(value: Net32) -> Self {
    value.get()
  }
}

impl PartialEq<u32> for Net32 {
  fn eq(&self, other: &u32) -> bool {
    self.get() == *other
  }
}

impl PartialOrd for Net32 {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for Net32 {
  fn cmp(&self, other: &Self) -> Ordering {
    self.get().cmp(&other.get())
  }
}

impl fmt::Debug for Net32 {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:#010x}", self.get())
  }
}

impl fmt::Display for Net32 {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(&self.get(), f)
  }
}

/// IP protocol family of a socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Family {
  V4,
  V6,
}

impl Family {
  /// Native address-family constant (`AF_INET` / `AF_INET6`).
  pub const fn protocol_id(self) -> u16 {
    match self {
      Self::V4 => v4::PROTOCOL_ID,
      Self::V6 => v6::PROTOCOL_ID,
    }
  }

  /// Maps a native address-family constant back to a [`Family`].
  pub const fn from_protocol_id(id: u16) -> Option<Self> {
    if id == v4::PROTOCOL_ID {
      Some(Self::V4)
    } else if id == v6::PROTOCOL_ID {
      Some(Self::V6)
    } else {
      None
    }
  }
}
