//! IPv6 address and endpoint.

use std::{fmt, mem, net::Ipv6Addr};

use super::{Net16, Net32};

/// Native `AF_INET6` value.
#[cfg(linux)]
pub const PROTOCOL_ID: u16 = libc::AF_INET6 as u16;
#[cfg(windows)]
pub const PROTOCOL_ID: u16 = windows_sys::Win32::Networking::WinSock::AF_INET6;

/// IPv6 address, 16 bytes in network order.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(C, align(4))]
pub struct Address {
  octets: [u8; 16],
}

impl Address {
  pub const UNSPECIFIED: Self = Self::new([0; 16]);
  pub const LOCALHOST: Self =
    Self::new([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);

  pub const fn new(octets: [u8; 16]) -> Self {
    Self { octets }
  }

  pub const fn octets(&self) -> [u8; 16] {
    self.octets
  }

  pub fn octets_mut(&mut self) -> &mut [u8; 16] {
    &mut self.octets
  }

  /// 16 bit word `index` (0..8).
  pub fn u16(&self, index: usize) -> Net16 {
    let at = index * 2;
    Net16::from_bytes([self.octets[at], self.octets[at + 1]])
  }

  /// 32 bit word `index` (0..4).
  pub fn u32(&self, index: usize) -> Net32 {
    let at = index * 4;
    let mut word = [0; 4];
    word.copy_from_slice(&self.octets[at..at + 4]);
    Net32::from_bytes(word)
  }

  pub fn set_u32(&mut self, index: usize, value: Net32) {
    let at = index * 4;
    self.octets[at..at + 4].copy_from_slice(&value.to_bytes());
  }

  /// `fe80::/64`.
  pub fn is_link_local(&self) -> bool {
    self.u32(0) == 0xfe80_0000 && self.u32(1) == 0
  }

  pub fn is_multicast(&self) -> bool {
    self.octets[0] == 0xff
  }

  /// Parses colon-hex text, `None` if it is not a valid IPv6 address.
  pub fn parse(text: &str) -> Option<Self> {
    text.parse::<Ipv6Addr>().ok().map(Self::from)
  }
}

impl From<Ipv6Addr> for Address {
  fn from(value: Ipv6Addr) -> Self {
    Self::new(value.octets())
  }
}

impl From<Address> for Ipv6Addr {
  fn from(value: Address) -> Self {
    Ipv6Addr::from(value.octets)
  }
}

impl fmt::Display for Address {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(&Ipv6Addr::from(*self), f)
  }
}

impl fmt::Debug for Address {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(self, f)
  }
}

/// IPv6 endpoint with the layout of the native `sockaddr_in6`.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct Endpoint {
  family: u16,
  pub port: Net16,
  pub flow_info: Net32,
  pub address: Address,
  pub scope_id: u32,
}

impl Endpoint {
  pub const fn new(address: Address, port: u16) -> Self {
    Self {
      family: PROTOCOL_ID,
      port: Net16::new(port),
      flow_info: Net32::new(0),
      address,
      scope_id: 0,
    }
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

// flow info and scope id are not part of the identity
impl PartialEq for Endpoint {
  fn eq(&self, other: &Self) -> bool {
    self.address == other.address && self.port == other.port
  }
}

impl Eq for Endpoint {}

impl fmt::Display for Endpoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.scope_id != 0 {
      write!(f, "[{}%{}]:{}", self.address, self.scope_id, self.port)
    } else {
      write!(f, "[{}]:{}", self.address, self.port)
    }
  }
}

impl fmt::Debug for Endpoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(self, f)
  }
}

const _: () = assert!(mem::size_of::<Address>() == 16);
const _: () = assert!(mem::size_of::<Endpoint>() == 28);
const _: () = assert!(mem::offset_of!(Endpoint, flow_info) == 4);
const _: () = assert!(mem::offset_of!(Endpoint, address) == 8);
const _: () = assert!(mem::offset_of!(Endpoint, scope_id) == 24);

#[cfg(linux)]
const _: () = {
  assert!(mem::size_of::<Endpoint>() == mem::size_of::<libc::sockaddr_in6>());
  assert!(mem::offset_of!(libc::sockaddr_in6, sin6_port) == 2);
  assert!(mem::offset_of!(libc::sockaddr_in6, sin6_flowinfo) == 4);
  assert!(mem::offset_of!(libc::sockaddr_in6, sin6_addr) == 8);
  assert!(mem::offset_of!(libc::sockaddr_in6, sin6_scope_id) == 24);
};

#[cfg(windows)]
const _: () = {
  use windows_sys::Win32::Networking::WinSock::SOCKADDR_IN6;
  assert!(mem::size_of::<Endpoint>() == mem::size_of::<SOCKADDR_IN6>());
  assert!(mem::offset_of!(SOCKADDR_IN6, sin6_flowinfo) == 4);
  assert!(mem::offset_of!(SOCKADDR_IN6, sin6_addr) == 8);
  assert!(mem::offset_of!(SOCKADDR_IN6, Anonymous) == 24);
};

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;

  #[test]
  fn localhost_views() {
    let a = Address::parse("::1").unwrap();

    assert_eq!(a, Address::LOCALHOST);
    assert_eq!(a.octets()[15], 1);
    assert!(a.octets()[..15].iter().all(|b| *b == 0));
    assert_eq!(a.u16(7), 1);
    assert_eq!(a.u32(3), 1);
  }

  #[test]
  fn link_local_prefix() {
    assert!(Address::parse("fe80::1").unwrap().is_link_local());
    assert!(Address::parse("fe80::abcd:1234").unwrap().is_link_local());
    assert!(!Address::parse("fe80:0:0:1::1").unwrap().is_link_local());
    assert!(!Address::parse("fe81::1").unwrap().is_link_local());
    assert!(!Address::LOCALHOST.is_link_local());
  }

  #[test]
  fn rejects_garbage() {
    assert_eq!(Address::parse("1::2::3"), None);
    assert_eq!(Address::parse("127.0.0.1"), None);
    assert_eq!(Address::parse("gggg::"), None);
  }

  #[test]
  fn endpoint_equality_ignores_flow_and_scope() {
    let mut a = Endpoint::new(Address::LOCALHOST, 1337);
    let b = Endpoint::new(Address::LOCALHOST, 1337);
    a.flow_info = Net32::new(7);
    a.scope_id = 3;

    assert_eq!(a, b);
    assert_ne!(a, Endpoint::new(Address::UNSPECIFIED, 1337));
    assert_eq!(a.protocol_id(), PROTOCOL_ID);
  }

  proptest! {
    #[test]
    fn text_round_trip(octets: [u8; 16]) {
      let a = Address::new(octets);
      prop_assert_eq!(Address::parse(&a.to_string()), Some(a));
    }

    #[test]
    fn word_views_share_storage(octets: [u8; 16], index in 0usize..4) {
      let a = Address::new(octets);
      let hi = a.u16(index * 2).get() as u32;
      let lo = a.u16(index * 2 + 1).get() as u32;
      prop_assert_eq!(a.u32(index).get(), (hi << 16) | lo);
    }
  }
}
