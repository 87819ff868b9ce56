use std::ops::Deref;

use crate::{
  EventLoop, PoolConfig,
  device::Device,
  error::Result,
  ip::{Endpoint, Family, v6},
  sys::Protocol,
};

/// Connectionless datagram device.
///
/// Before a send the destination goes into the buffer header; after a
/// receive the header holds the source of the datagram.
///
/// ```no_run
/// use netdev::{EventLoop, PoolConfig, UdpSocket};
/// use netdev::ip::{Endpoint, Family};
///
/// let lp = EventLoop::new()?;
/// let socket = UdpSocket::new(&lp, PoolConfig::default())?;
/// socket.open(Family::V6, 1337)?;
///
/// let rx = socket.buffer(0).unwrap();
/// rx.read()?;
/// let done = lp.block_on(rx.ready())?;
/// println!("{} bytes from {}", done.size, rx.header()?);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug)]
pub struct UdpSocket {
  device: Device,
}

impl UdpSocket {
  pub fn new(lp: &EventLoop, pool: PoolConfig) -> Result<Self> {
    Ok(Self { device: Device::new(lp, Protocol::Udp, true, &pool)? })
  }

  /// Binds `local_port` (0 picks one) on the wildcard address of `family`.
  pub fn open(&self, family: Family, local_port: u16) -> Result<()> {
    self.open_on(&Endpoint::unspecified(family, local_port))
  }

  /// Binds an explicit local endpoint, e.g. loopback only.
  pub fn open_on(&self, local: &Endpoint) -> Result<()> {
    self.device.open(local, None)
  }

  /// Joins an IPv6 multicast group on the default interface.
  pub fn join(&self, group: &v6::Address) -> Result<()> {
    self.device.join(group)
  }
}

impl Deref for UdpSocket {
  type Target = Device;

  fn deref(&self) -> &Device {
    &self.device
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{DeviceState, Error, backends::dummy::DummyDriver, ip::v4};

  fn socket() -> UdpSocket {
    let (driver, _script) = DummyDriver::new();
    let lp = EventLoop::with_driver(Box::new(driver));
    UdpSocket::new(&lp, PoolConfig::default()).unwrap()
  }

  #[test]
  fn open_goes_straight_to_ready() {
    let socket = socket();
    assert!(socket.is_connectionless());
    socket.open(Family::V4, 0).unwrap();
    assert_eq!(socket.state(), DeviceState::Ready);
    assert_eq!(socket.local_endpoint().unwrap().family(), Some(Family::V4));

    socket.close();
    assert_eq!(socket.state(), DeviceState::Disabled);
  }

  #[test]
  fn join_needs_an_open_socket() {
    let socket = socket();
    let group = v6::Address::parse("ff02::1:3").unwrap();
    assert!(matches!(socket.join(&group), Err(Error::NotOpen)));
  }

  #[test]
  fn open_on_keeps_the_address() {
    let socket = socket();
    let local = Endpoint::from(v4::Endpoint::new(v4::Address::LOCALHOST, 0));
    socket.open_on(&local).unwrap();

    let bound = socket.local_endpoint().unwrap();
    let address = bound.as_v4().map(|ep| ep.address);
    assert_eq!(address, Some(v4::Address::LOCALHOST));
    assert_ne!(bound.port(), 0);
  }
}
