//! Operation flags and transfer outcomes.

use std::{fmt, ops};

/// Operation flags of a buffer.
///
/// A started operation carries exactly one of [`Op::READ`] or [`Op::WRITE`];
/// [`Op::CANCEL`] is added when cancellation has been requested.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Op(u8);

impl Op {
  pub const NONE: Self = Self(0);
  /// Receive into the buffer.
  pub const READ: Self = Self(1 << 0);
  /// Send the buffer contents.
  pub const WRITE: Self = Self(1 << 1);
  /// Cancellation has been requested.
  pub const CANCEL: Self = Self(1 << 2);

  pub const fn or(self, other: Self) -> Self {
    Self(self.0 | other.0)
  }

  pub const fn without(self, other: Self) -> Self {
    Self(self.0 & !other.0)
  }

  pub const fn contains(self, other: Self) -> bool {
    (self.0 & other.0) == other.0
  }

  pub const fn bits(self) -> u8 {
    self.0
  }

  pub const fn is_read(self) -> bool {
    self.contains(Self::READ)
  }

  pub const fn is_write(self) -> bool {
    self.contains(Self::WRITE)
  }

  /// Exactly one direction and nothing else.
  pub const fn is_transfer(self) -> bool {
    self.0 == Self::READ.0 || self.0 == Self::WRITE.0
  }
}

impl ops::BitOr for Op {
  type Output = Self;
  fn bitor(self, rhs: Self) -> Self::Output {
    self.or(rhs)
  }
}

impl ops::BitOrAssign for Op {
  fn bitor_assign(&mut self, rhs: Self) {
    *self = self.or(rhs);
  }
}

impl fmt::Debug for Op {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut list = f.debug_set();
    if self.is_read() {
      list.entry(&format_args!("READ"));
    }
    if self.is_write() {
      list.entry(&format_args!("WRITE"));
    }
    if self.contains(Self::CANCEL) {
      list.entry(&format_args!("CANCEL"));
    }
    list.finish()
  }
}

/// Lifecycle of a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceState {
  /// No socket.
  Disabled,
  /// Connect in progress.
  Opening,
  Ready,
}

/// Lifecycle of a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferState {
  /// The owning device is not usable.
  Disabled,
  /// Idle, holds the previous result.
  Ready,
  /// An operation was started and has not finished yet.
  Busy,
}

/// How the last operation of a buffer ended.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TransferResult {
  #[default]
  Success,
  /// Cancelled by request or by closing the device.
  Cancelled,
  /// The datagram did not fit the buffer (receive) or the path (send).
  Oversize,
  Failed,
}

/// Snapshot of a buffer taken when it left BUSY.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transfer {
  pub state: BufferState,
  pub size: usize,
  pub result: TransferResult,
}

impl Transfer {
  pub fn is_success(&self) -> bool {
    self.result == TransferResult::Success
  }
}
