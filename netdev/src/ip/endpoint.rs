use std::{
  fmt, mem,
  net::{SocketAddr, SocketAddrV4, SocketAddrV6},
};

use super::{Family, Net16, v4, v6};

/// Storage shared by every endpoint variant.
///
/// Every variant starts with the 16 bit family tag followed by the port, so
/// both can be read without knowing the variant.
#[derive(Clone, Copy)]
#[repr(C)]
union Repr {
  generic: Generic,
  v4: v4::Endpoint,
  v6: v6::Endpoint,
  bytes: [u8; mem::size_of::<v6::Endpoint>()],
}

#[derive(Clone, Copy)]
#[repr(C)]
struct Generic {
  family: u16,
  port: Net16,
}

/// Either an IPv4 or an IPv6 endpoint, selected by the leading family tag.
///
/// The value is always fully initialized, so it can be handed to the kernel
/// as a `sockaddr` of [`Endpoint::len`] bytes and be overwritten by it (the
/// source address of a received datagram).
///
/// ```
/// use netdev::ip::{Endpoint, Family, v4};
///
/// let ep = Endpoint::from(v4::Endpoint::new(v4::Address::LOCALHOST, 1337));
/// assert_eq!(ep.family(), Some(Family::V4));
/// assert_eq!(ep.port(), 1337);
/// ```
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct Endpoint(Repr);

const _: () = assert!(mem::size_of::<Endpoint>() == 28);
const _: () = assert!(mem::align_of::<Endpoint>() == 4);

impl Endpoint {
  /// An endpoint whose family tag is 0; not usable for any socket call.
  pub const fn empty() -> Self {
    Self(Repr { bytes: [0; mem::size_of::<v6::Endpoint>()] })
  }

  /// The wildcard address of `family`, used when binding a local port.
  pub fn unspecified(family: Family, port: u16) -> Self {
    match family {
      Family::V4 => v4::Endpoint::new(v4::Address::UNSPECIFIED, port).into(),
      Family::V6 => v6::Endpoint::new(v6::Address::UNSPECIFIED, port).into(),
    }
  }

  /// The raw family tag.
  pub fn protocol_id(&self) -> u16 {
    // SAFETY: every variant starts with the tag and the storage is always
    // fully initialized.
    unsafe { self.0.generic.family }
  }

  pub fn family(&self) -> Option<Family> {
    Family::from_protocol_id(self.protocol_id())
  }

  pub fn port(&self) -> u16 {
    self.raw_port().get()
  }

  pub fn raw_port(&self) -> Net16 {
    // SAFETY: see `protocol_id`.
    unsafe { self.0.generic.port }
  }

  pub fn set_port(&mut self, port: u16) {
    // SAFETY: writing a plain integer field of an initialized union.
    unsafe { self.0.generic.port.set(port) }
  }

  pub fn as_v4(&self) -> Option<&v4::Endpoint> {
    match self.family() {
      // SAFETY: the tag says this is the v4 variant.
      Some(Family::V4) => Some(unsafe { &self.0.v4 }),
      _ => None,
    }
  }

  pub fn as_v4_mut(&mut self) -> Option<&mut v4::Endpoint> {
    match self.family() {
      // SAFETY: the tag says this is the v4 variant.
      Some(Family::V4) => Some(unsafe { &mut self.0.v4 }),
      _ => None,
    }
  }

  pub fn as_v6(&self) -> Option<&v6::Endpoint> {
    match self.family() {
      // SAFETY: the tag says this is the v6 variant.
      Some(Family::V6) => Some(unsafe { &self.0.v6 }),
      _ => None,
    }
  }

  pub fn as_v6_mut(&mut self) -> Option<&mut v6::Endpoint> {
    match self.family() {
      // SAFETY: the tag says this is the v6 variant.
      Some(Family::V6) => Some(unsafe { &mut self.0.v6 }),
      _ => None,
    }
  }

  /// Native socket address length for the family, the full storage size if
  /// the family is unknown.
  pub fn len(&self) -> usize {
    match self.family() {
      Some(Family::V4) => mem::size_of::<v4::Endpoint>(),
      Some(Family::V6) | None => mem::size_of::<v6::Endpoint>(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.protocol_id() == 0
  }

  /// Storage capacity, what a receive may write into.
  pub const fn capacity() -> usize {
    mem::size_of::<Self>()
  }

  pub fn as_ptr(&self) -> *const u8 {
    (self as *const Self).cast()
  }

  pub fn as_mut_ptr(&mut self) -> *mut u8 {
    (self as *mut Self).cast()
  }

  pub fn to_socket_addr(&self) -> Option<SocketAddr> {
    if let Some(ep) = self.as_v4() {
      return Some(SocketAddr::V4(SocketAddrV4::new(
        ep.address.into(),
        ep.port.get(),
      )));
    }
    let ep = self.as_v6()?;
    Some(SocketAddr::V6(SocketAddrV6::new(
      ep.address.into(),
      ep.port.get(),
      ep.flow_info.get(),
      ep.scope_id,
    )))
  }
}

impl Default for Endpoint {
  fn default() -> Self {
    Self::empty()
  }
}

impl From<v4::Endpoint> for Endpoint {
  fn from(value: v4::Endpoint) -> Self {
    let mut ep = Self::empty();
    ep.0.v4 = value;
    ep
  }
}

impl From<v6::Endpoint> for Endpoint {
  fn from(value: v6::Endpoint) -> Self {
    Self(Repr { v6: value })
  }
}

impl From<SocketAddr> for Endpoint {
  fn from(value: SocketAddr) -> Self {
    match value {
      SocketAddr::V4(addr) => {
        v4::Endpoint::new((*addr.ip()).into(), addr.port()).into()
      }
      SocketAddr::V6(addr) => {
        let mut ep = v6::Endpoint::new((*addr.ip()).into(), addr.port());
        ep.flow_info.set(addr.flowinfo());
        ep.scope_id = addr.scope_id();
        ep.into()
      }
    }
  }
}

impl PartialEq for Endpoint {
  fn eq(&self, other: &Self) -> bool {
    if self.protocol_id() != other.protocol_id() {
      return false;
    }
    match (self.as_v4(), other.as_v4(), self.as_v6(), other.as_v6()) {
      (Some(a), Some(b), _, _) => a == b,
      (_, _, Some(a), Some(b)) => a == b,
      _ => self.raw_port() == other.raw_port(),
    }
  }
}

impl Eq for Endpoint {}

impl fmt::Display for Endpoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if let Some(ep) = self.as_v4() {
      fmt::Display::fmt(ep, f)
    } else if let Some(ep) = self.as_v6() {
      fmt::Display::fmt(ep, f)
    } else {
      write!(f, "<family {}>:{}", self.protocol_id(), self.port())
    }
  }
}

impl fmt::Debug for Endpoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(self, f)
  }
}
