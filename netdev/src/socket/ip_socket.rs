use std::ops::Deref;

use crate::{
  EventLoop, PoolConfig,
  device::Device,
  error::{Error, Result},
  ip::Endpoint,
  sys::Protocol,
};

/// Device connected to one fixed peer.
///
/// A TCP socket goes through OPENING until the handshake completes; a UDP
/// socket with a fixed peer is READY as soon as `connect` returns.
///
/// ```no_run
/// use netdev::{DeviceState, EventLoop, IpSocket, PoolConfig};
/// use netdev::ip::{Endpoint, v4};
///
/// let lp = EventLoop::new()?;
/// let socket = IpSocket::tcp(&lp, PoolConfig::default())?;
/// let peer = Endpoint::from(v4::Endpoint::new(v4::Address::LOCALHOST, 8080));
/// socket.connect(&peer, 0)?;
/// lp.block_on(socket.until(DeviceState::Ready))?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug)]
pub struct IpSocket {
  device: Device,
}

impl IpSocket {
  pub fn tcp(lp: &EventLoop, pool: PoolConfig) -> Result<Self> {
    Ok(Self { device: Device::new(lp, Protocol::Tcp, false, &pool)? })
  }

  pub fn udp(lp: &EventLoop, pool: PoolConfig) -> Result<Self> {
    Ok(Self { device: Device::new(lp, Protocol::Udp, false, &pool)? })
  }

  /// Binds `local_port` (0 picks one) on the wildcard address of `remote`'s
  /// family and connects to `remote`.
  pub fn connect(&self, remote: &Endpoint, local_port: u16) -> Result<()> {
    let family = remote
      .family()
      .ok_or(Error::UnsupportedFamily(remote.protocol_id()))?;
    let local = Endpoint::unspecified(family, local_port);
    self.device.open(&local, Some(remote))
  }
}

impl Deref for IpSocket {
  type Target = Device;

  fn deref(&self) -> &Device {
    &self.device
  }
}
