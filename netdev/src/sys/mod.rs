//! Native socket setup.
//!
//! Everything here is synchronous: creating, configuring and binding the
//! socket of a device. Transfers go through the completion backends.

#[cfg(linux)]
mod linux;
#[cfg(linux)]
pub(crate) use linux::*;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub(crate) use windows::*;

/// Transport protocol of a device socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
  Tcp,
  Udp,
}

impl Protocol {
  /// Whether a connect goes through a handshake.
  pub const fn is_stream(self) -> bool {
    matches!(self, Self::Tcp)
  }
}
