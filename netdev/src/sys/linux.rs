use std::{io, mem, os::fd::RawFd};

use super::Protocol;
use crate::ip::{Endpoint, Family, v6};

macro_rules! syscall {
  ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
      #[allow(unused_unsafe)]
      let res = unsafe { libc::$fn($($arg, )*) };
      if res == -1 {
          Err(std::io::Error::last_os_error())
      } else {
          Ok(res)
      }
  }};
}

pub(crate) type RawSocket = RawFd;

/// Owned, non-blocking socket; closed on drop.
#[derive(Debug)]
pub(crate) struct Socket {
  fd: RawFd,
}

impl Socket {
  pub fn new(family: Family, protocol: Protocol) -> io::Result<Self> {
    let (ty, proto) = match protocol {
      Protocol::Tcp => (libc::SOCK_STREAM, libc::IPPROTO_TCP),
      Protocol::Udp => (libc::SOCK_DGRAM, libc::IPPROTO_UDP),
    };
    let domain = family.protocol_id() as libc::c_int;
    let fd = syscall!(socket(
      domain,
      ty | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
      proto
    ))?;
    Ok(Self { fd })
  }

  pub fn raw(&self) -> RawSocket {
    self.fd
  }

  pub fn set_reuse_address(&self) -> io::Result<()> {
    let on: libc::c_int = 1;
    syscall!(setsockopt(
      self.fd,
      libc::SOL_SOCKET,
      libc::SO_REUSEADDR,
      (&on as *const libc::c_int).cast(),
      mem::size_of::<libc::c_int>() as libc::socklen_t
    ))?;
    Ok(())
  }

  pub fn bind(&self, local: &Endpoint) -> io::Result<()> {
    syscall!(bind(
      self.fd,
      local.as_ptr().cast::<libc::sockaddr>(),
      local.len() as libc::socklen_t
    ))?;
    Ok(())
  }

  /// Connect that completes immediately (datagram sockets).
  pub fn connect(&self, remote: &Endpoint) -> io::Result<()> {
    syscall!(connect(
      self.fd,
      remote.as_ptr().cast::<libc::sockaddr>(),
      remote.len() as libc::socklen_t
    ))?;
    Ok(())
  }

  pub fn join_v6(&self, group: &v6::Address) -> io::Result<()> {
    let mreq = libc::ipv6_mreq {
      ipv6mr_multiaddr: libc::in6_addr { s6_addr: group.octets() },
      ipv6mr_interface: 0,
    };
    syscall!(setsockopt(
      self.fd,
      libc::IPPROTO_IPV6,
      libc::IPV6_ADD_MEMBERSHIP,
      (&mreq as *const libc::ipv6_mreq).cast(),
      mem::size_of::<libc::ipv6_mreq>() as libc::socklen_t
    ))?;
    Ok(())
  }

  pub fn local_endpoint(&self) -> io::Result<Endpoint> {
    let mut ep = Endpoint::empty();
    let mut len = Endpoint::capacity() as libc::socklen_t;
    syscall!(getsockname(
      self.fd,
      ep.as_mut_ptr().cast::<libc::sockaddr>(),
      &mut len
    ))?;
    Ok(ep)
  }
}

impl Drop for Socket {
  fn drop(&mut self) {
    if let Err(err) = syscall!(close(self.fd)) {
      tracing::warn!(fd = self.fd, error = %err, "close failed");
    }
  }
}
