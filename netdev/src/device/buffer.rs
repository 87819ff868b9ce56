use std::{
  fmt,
  future::Future,
  pin::Pin,
  rc::Rc,
  task::{Context, Poll},
};

use super::{Shared, Slot};
use crate::{
  error::{Error, Result},
  ip::Endpoint,
  op::{BufferState, Op, Transfer, TransferResult},
};

/// Handle to one buffer of a [`Device`](crate::Device).
///
/// Cheap to clone; all handles of a buffer see the same state. The payload
/// and the endpoint header can only be accessed while no operation holds
/// the memory, otherwise [`Error::Busy`] is returned.
///
/// The closures given to [`Buffer::with_payload`] and
/// [`Buffer::with_data_mut`] run while the device is borrowed and must not
/// call back into it.
#[derive(Clone)]
pub struct Buffer {
  shared: Rc<Shared>,
  index: u16,
}

impl Buffer {
  pub(super) fn new(shared: Rc<Shared>, index: u16) -> Self {
    Self { shared, index }
  }

  fn with_slot<R>(&self, f: impl FnOnce(&Slot) -> R) -> R {
    f(&self.shared.core().slots[self.index as usize])
  }

  /// Runs `f` on the slot if the caller may touch its memory.
  fn with_idle<R>(&self, f: impl FnOnce(&mut Slot) -> Result<R>) -> Result<R> {
    let mut core = self.shared.core();
    let slot = &mut core.slots[self.index as usize];
    if !slot.is_idle() {
      return Err(Error::Busy);
    }
    f(slot)
  }

  pub fn index(&self) -> usize {
    self.index as usize
  }

  pub fn state(&self) -> BufferState {
    self.with_slot(|slot| slot.state)
  }

  pub fn capacity(&self) -> usize {
    self.with_slot(|slot| slot.data.len())
  }

  /// Bytes transferred by the last operation, or staged for the next write.
  pub fn size(&self) -> usize {
    self.with_slot(|slot| slot.size)
  }

  pub fn result(&self) -> TransferResult {
    self.with_slot(|slot| slot.result)
  }

  pub fn op(&self) -> Op {
    self.with_slot(|slot| slot.op)
  }

  pub fn transfer(&self) -> Transfer {
    self.with_slot(Slot::transfer)
  }

  /// Starts `op`, exactly one of [`Op::READ`] or [`Op::WRITE`].
  ///
  /// The operation is issued at once if the device is READY, and queued
  /// until it gets there otherwise.
  pub fn start(&self, op: Op) -> Result<()> {
    self.shared.start(self.index, op)
  }

  /// Starts a receive into the whole buffer.
  pub fn read(&self) -> Result<()> {
    self.start(Op::READ)
  }

  /// Copies `payload` into the buffer and starts sending it.
  ///
  /// Nothing is copied when the send would be rejected.
  pub fn write(&self, payload: &[u8]) -> Result<()> {
    let connectionless = self.shared.connectionless;
    self.with_idle(|slot| {
      let capacity = slot.data.len();
      if payload.len() > capacity {
        return Err(Error::Capacity { requested: payload.len(), capacity });
      }
      if slot.state != BufferState::Ready {
        return Err(Error::NotReady);
      }
      if connectionless && slot.header.is_empty() {
        return Err(Error::MissingEndpoint);
      }
      if connectionless && payload.is_empty() {
        return Err(Error::EmptyPayload);
      }
      slot.data[..payload.len()].copy_from_slice(payload);
      slot.size = payload.len();
      Ok(())
    })?;
    self.start(Op::WRITE)
  }

  /// Requests cancellation of the running operation. The buffer stays BUSY
  /// until the operation has actually finished.
  pub fn cancel(&self) -> Result<()> {
    self.shared.cancel(self.index)
  }

  /// Resolves once the buffer is no longer BUSY and its memory is free,
  /// i.e. also after an operation abandoned by `close` has come back.
  pub fn ready(&self) -> BufferReady {
    BufferReady { buffer: self.clone() }
  }

  /// Sets how many bytes of the buffer the next write sends.
  pub fn set_size(&self, size: usize) -> Result<()> {
    self.with_idle(|slot| {
      let capacity = slot.data.len();
      if size > capacity {
        return Err(Error::Capacity { requested: size, capacity });
      }
      slot.size = size;
      Ok(())
    })
  }

  /// Runs `f` on the first [`Buffer::size`] bytes.
  pub fn with_payload<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
    self.with_idle(|slot| Ok(f(&slot.data[..slot.size])))
  }

  /// Runs `f` on the whole buffer, e.g. to fill it before
  /// [`Buffer::set_size`] and a write.
  pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
    self.with_idle(|slot| Ok(f(&mut slot.data)))
  }

  pub fn to_vec(&self) -> Result<Vec<u8>> {
    self.with_payload(<[u8]>::to_vec)
  }

  /// Peer of the last receive, or destination of the next send.
  pub fn header(&self) -> Result<Endpoint> {
    self.connectionless()?;
    self.with_idle(|slot| Ok(slot.header))
  }

  pub fn set_header(&self, endpoint: &Endpoint) -> Result<()> {
    self.connectionless()?;
    self.with_idle(|slot| {
      slot.header = *endpoint;
      Ok(())
    })
  }

  fn connectionless(&self) -> Result<()> {
    if self.shared.connectionless {
      Ok(())
    } else {
      Err(Error::NotConnectionless)
    }
  }
}

impl fmt::Debug for Buffer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.with_slot(|slot| {
      f.debug_struct("Buffer")
        .field("index", &self.index)
        .field("state", &slot.state)
        .field("op", &slot.op)
        .field("size", &slot.size)
        .field("result", &slot.result)
        .finish()
    })
  }
}

/// Future of [`Buffer::ready`].
#[must_use = "futures do nothing unless polled"]
pub struct BufferReady {
  buffer: Buffer,
}

impl Future for BufferReady {
  type Output = Transfer;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Transfer> {
    let mut core = self.buffer.shared.core();
    let slot = &mut core.slots[self.buffer.index as usize];
    if slot.is_idle() {
      return Poll::Ready(slot.transfer());
    }
    slot.waiters.register(cx.waker());
    Poll::Pending
  }
}
