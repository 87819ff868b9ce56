//! Waiter lists and the deferred wake-up batch.
//!
//! State-machine steps run while the device core is borrowed. Wakers are
//! therefore only collected during a step and woken once the borrow has been
//! released, so a woken task may call straight back into the device.

use std::{
  mem,
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  task::{Wake, Waker},
};

use crossbeam_channel::Sender;

use crate::op::DeviceState;

/// Tasks suspended on one buffer or one device.
#[derive(Default)]
pub(crate) struct Waiters {
  list: Vec<Waker>,
}

impl Waiters {
  pub fn register(&mut self, waker: &Waker) {
    if !self.list.iter().any(|w| w.will_wake(waker)) {
      self.list.push(waker.clone());
    }
  }

  #[cfg(test)]
  pub fn is_empty(&self) -> bool {
    self.list.is_empty()
  }

  fn drain_into(&mut self, out: &mut Vec<Waker>) {
    out.append(&mut self.list);
  }
}

/// Channel subscribers of device state transitions.
#[derive(Default)]
pub(crate) struct Subscribers {
  list: Vec<Sender<DeviceState>>,
}

impl Subscribers {
  pub fn add(&mut self, tx: Sender<DeviceState>) {
    self.list.push(tx);
  }

  /// Sends `state` to every subscriber, dropping the disconnected ones.
  pub fn broadcast(&mut self, state: DeviceState) {
    self.list.retain(|tx| tx.send(state).is_ok());
  }

  #[cfg(test)]
  pub fn len(&self) -> usize {
    self.list.len()
  }
}

/// Wake-ups collected during one state-machine step.
#[derive(Default)]
#[must_use = "collected wake-ups must be fired"]
pub(crate) struct Wakeups {
  buffers: Vec<Waker>,
  device: Vec<Waker>,
}

impl Wakeups {
  pub fn buffer(&mut self, waiters: &mut Waiters) {
    waiters.drain_into(&mut self.buffers);
  }

  pub fn device(&mut self, waiters: &mut Waiters) {
    waiters.drain_into(&mut self.device);
  }

  /// Buffer waiters first, so device waiters see settled buffers.
  pub fn fire(mut self) {
    for waker in mem::take(&mut self.buffers) {
      waker.wake();
    }
    for waker in mem::take(&mut self.device) {
      waker.wake();
    }
  }
}

/// Waker used by `block_on`, remembers whether it was woken.
#[derive(Default)]
pub(crate) struct Flag(AtomicBool);

impl Flag {
  pub fn take(&self) -> bool {
    self.0.swap(false, Ordering::AcqRel)
  }

  pub fn waker(self: &Arc<Self>) -> Waker {
    Waker::from(Arc::clone(self))
  }
}

impl Wake for Flag {
  fn wake(self: Arc<Self>) {
    self.0.store(true, Ordering::Release);
  }

  fn wake_by_ref(self: &Arc<Self>) {
    self.0.store(true, Ordering::Release);
  }
}
