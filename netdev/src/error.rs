use thiserror::Error;

/// Failure of a device or buffer call.
///
/// Contract violations (starting a busy buffer, cancelling an idle one) and
/// setup failures are reported here. Failed or cancelled transfers are not:
/// they finish the buffer with a [`TransferResult`](crate::TransferResult).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
  /// `open`/`connect` on a device that already owns a socket.
  #[error("device already owns a socket")]
  AlreadyOpen,

  /// The call needs an open socket.
  #[error("device is not open")]
  NotOpen,

  /// `start` on a buffer that is not READY.
  #[error("buffer is not ready")]
  NotReady,

  /// `cancel` on a buffer that is not BUSY.
  #[error("buffer has no operation in flight")]
  NotBusy,

  /// Payload or header access while the kernel may still touch the memory.
  #[error("buffer is owned by an in-flight operation")]
  Busy,

  /// The requested direction is not exactly one of read or write.
  #[error("operation must be exactly one of read or write")]
  InvalidOp,

  /// A connectionless send without a destination endpoint in the header.
  #[error("connectionless send needs a destination endpoint")]
  MissingEndpoint,

  /// A connectionless send with nothing to send.
  #[error("connectionless send needs a payload")]
  EmptyPayload,

  #[error("unsupported address family {0}")]
  UnsupportedFamily(u16),

  #[error("{requested} bytes do not fit a {capacity} byte buffer")]
  Capacity { requested: usize, capacity: usize },

  /// Per-buffer endpoints only exist on connectionless devices.
  #[error("device is not connectionless")]
  NotConnectionless,

  /// A connect cancelled by `close` has not been returned by the kernel yet.
  #[error("previous connect is still draining")]
  Draining,

  /// Socket creation, option, bind or registration failure.
  #[error(transparent)]
  Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for std::io::Error {
  fn from(value: Error) -> Self {
    use std::io::ErrorKind;

    match value {
      Error::Io(error) => error,
      Error::AlreadyOpen => Self::new(ErrorKind::AlreadyExists, value),
      Error::NotOpen => Self::new(ErrorKind::NotConnected, value),
      Error::Busy | Error::Draining => Self::new(ErrorKind::WouldBlock, value),
      Error::UnsupportedFamily(_) => Self::new(ErrorKind::Unsupported, value),
      _ => Self::new(ErrorKind::InvalidInput, value),
    }
  }
}
