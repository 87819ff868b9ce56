use std::{io, mem, ptr, sync::Mutex};

use windows_sys::Win32::Networking::WinSock::{
  INVALID_SOCKET, IN6_ADDR, IN6_ADDR_0, IPPROTO_IPV6, IPPROTO_TCP,
  IPPROTO_UDP, IPV6_JOIN_GROUP, IPV6_MREQ, SOCK_DGRAM, SOCK_STREAM, SOCKADDR,
  SOCKET, SOCKET_ERROR, SOL_SOCKET, SO_REUSEADDR, WSA_FLAG_OVERLAPPED,
  WSACleanup, WSADATA, WSAGetLastError, WSASocketW, WSAStartup, bind,
  closesocket, connect, getsockname, setsockopt,
};

use super::Protocol;
use crate::ip::{Endpoint, Family, v6};

pub(crate) type RawSocket = SOCKET;

/// Converts a Winsock status code (0 = success) into a `Result`.
pub(crate) fn status_code_to_result(status: i32) -> io::Result<()> {
  if status == 0 { Ok(()) } else { Err(last_error()) }
}

pub(crate) fn last_error() -> io::Error {
  // SAFETY: plain FFI call.
  io::Error::from_raw_os_error(unsafe { WSAGetLastError() })
}

static WINSOCK_USERS: Mutex<usize> = Mutex::new(0);

/// Process-wide Winsock start-up, reference counted.
///
/// The first guard starts Winsock 2.2, the last one to drop cleans it up.
pub(crate) struct Guard(());

impl Guard {
  pub fn acquire() -> io::Result<Self> {
    let mut users = WINSOCK_USERS.lock().unwrap_or_else(|e| e.into_inner());
    if *users == 0 {
      // SAFETY: zeroed WSADATA is a valid out parameter.
      let mut data: WSADATA = unsafe { mem::zeroed() };
      // SAFETY: valid pointer to WSADATA.
      let status = unsafe { WSAStartup(0x202, &mut data) };
      if status != 0 {
        return Err(io::Error::from_raw_os_error(status));
      }
      tracing::debug!("winsock started");
    }
    *users += 1;
    Ok(Self(()))
  }
}

impl Drop for Guard {
  fn drop(&mut self) {
    let mut users = WINSOCK_USERS.lock().unwrap_or_else(|e| e.into_inner());
    *users -= 1;
    if *users == 0 {
      // SAFETY: balanced with the WSAStartup of the first guard.
      unsafe { WSACleanup() };
      tracing::debug!("winsock cleaned up");
    }
  }
}

/// Owned overlapped socket; closed on drop.
#[derive(Debug)]
pub(crate) struct Socket {
  socket: SOCKET,
}

impl Socket {
  pub fn new(family: Family, protocol: Protocol) -> io::Result<Self> {
    let (ty, proto) = match protocol {
      Protocol::Tcp => (SOCK_STREAM, IPPROTO_TCP),
      Protocol::Udp => (SOCK_DGRAM, IPPROTO_UDP),
    };
    // SAFETY: no protocol info, overlapped flag only.
    let socket = unsafe {
      WSASocketW(
        family.protocol_id() as i32,
        ty,
        proto,
        ptr::null(),
        0,
        WSA_FLAG_OVERLAPPED,
      )
    };
    if socket == INVALID_SOCKET {
      return Err(last_error());
    }
    Ok(Self { socket })
  }

  pub fn raw(&self) -> RawSocket {
    self.socket
  }

  pub fn set_reuse_address(&self) -> io::Result<()> {
    let on: i32 = 1;
    // SAFETY: pointer and length describe `on`.
    status_code_to_result(unsafe {
      setsockopt(
        self.socket,
        SOL_SOCKET,
        SO_REUSEADDR,
        (&on as *const i32).cast(),
        mem::size_of::<i32>() as i32,
      )
    })
  }

  pub fn bind(&self, local: &Endpoint) -> io::Result<()> {
    // SAFETY: the endpoint is a valid sockaddr of `len` bytes.
    status_code_to_result(unsafe {
      bind(self.socket, local.as_ptr().cast::<SOCKADDR>(), local.len() as i32)
    })
  }

  /// Connect that completes immediately (datagram sockets).
  pub fn connect(&self, remote: &Endpoint) -> io::Result<()> {
    // SAFETY: the endpoint is a valid sockaddr of `len` bytes.
    status_code_to_result(unsafe {
      connect(
        self.socket,
        remote.as_ptr().cast::<SOCKADDR>(),
        remote.len() as i32,
      )
    })
  }

  pub fn join_v6(&self, group: &v6::Address) -> io::Result<()> {
    let mreq = IPV6_MREQ {
      ipv6mr_multiaddr: IN6_ADDR { u: IN6_ADDR_0 { Byte: group.octets() } },
      ipv6mr_interface: 0,
    };
    // SAFETY: pointer and length describe `mreq`.
    status_code_to_result(unsafe {
      setsockopt(
        self.socket,
        IPPROTO_IPV6,
        IPV6_JOIN_GROUP,
        (&mreq as *const IPV6_MREQ).cast(),
        mem::size_of::<IPV6_MREQ>() as i32,
      )
    })
  }

  pub fn local_endpoint(&self) -> io::Result<Endpoint> {
    let mut ep = Endpoint::empty();
    let mut len = Endpoint::capacity() as i32;
    // SAFETY: the endpoint has room for `len` bytes.
    status_code_to_result(unsafe {
      getsockname(self.socket, ep.as_mut_ptr().cast::<SOCKADDR>(), &mut len)
    })?;
    Ok(ep)
  }
}

impl Drop for Socket {
  fn drop(&mut self) {
    // SAFETY: the socket is owned and closed exactly once.
    if unsafe { closesocket(self.socket) } == SOCKET_ERROR {
      tracing::warn!(socket = self.socket, error = %last_error(), "closesocket failed");
    }
  }
}
