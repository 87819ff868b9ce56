//! Scripted driver for testing the device state machine.
//!
//! Nothing reaches the kernel: submissions are recorded, and completions are
//! whatever the test pushes through the [`Script`] handle.

use std::{cell::RefCell, collections::VecDeque, io, rc::Rc, time::Duration};

use super::{
  CancelIo, Completion, ConnectIo, Driver, HandlerId, Origin, Outcome,
  TransferIo,
};
use crate::sys::RawSocket;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Submission {
  pub handler: HandlerId,
  pub origin: Origin,
  pub read: bool,
}

#[derive(Default)]
struct State {
  registered: Vec<(RawSocket, HandlerId)>,
  submitted: Vec<Submission>,
  cancels: Vec<Origin>,
  ready: VecDeque<Completion>,
  fail_transfers: bool,
  fail_register: bool,
  flushes: usize,
}

/// Test-side handle of a [`DummyDriver`].
#[derive(Clone, Default)]
pub(crate) struct Script(Rc<RefCell<State>>);

impl Script {
  pub fn push(&self, completion: Completion) {
    self.0.borrow_mut().ready.push_back(completion);
  }

  /// Completes the most recent submission for `origin`.
  pub fn complete(&self, origin: Origin, outcome: Outcome) {
    let handler = {
      let state = self.0.borrow();
      state
        .submitted
        .iter()
        .rev()
        .find(|s| s.origin == origin)
        .map(|s| s.handler)
        .expect("nothing was submitted for this origin")
    };
    self.push(Completion { handler, origin, outcome });
  }

  pub fn submitted(&self) -> Vec<Submission> {
    self.0.borrow().submitted.clone()
  }

  pub fn cancels(&self) -> Vec<Origin> {
    self.0.borrow().cancels.clone()
  }

  pub fn registered(&self) -> usize {
    self.0.borrow().registered.len()
  }

  pub fn flushes(&self) -> usize {
    self.0.borrow().flushes
  }

  pub fn fail_transfers(&self, fail: bool) {
    self.0.borrow_mut().fail_transfers = fail;
  }

  pub fn fail_register(&self, fail: bool) {
    self.0.borrow_mut().fail_register = fail;
  }
}

pub(crate) struct DummyDriver {
  script: Script,
}

impl DummyDriver {
  pub fn new() -> (Self, Script) {
    let script = Script::default();
    (Self { script: script.clone() }, script)
  }
}

impl Driver for DummyDriver {
  fn name(&self) -> &'static str {
    "dummy"
  }

  fn register(
    &mut self,
    socket: RawSocket,
    handler: HandlerId,
  ) -> io::Result<()> {
    let mut state = self.script.0.borrow_mut();
    if state.fail_register {
      return Err(io::Error::other("scripted register failure"));
    }
    state.registered.push((socket, handler));
    Ok(())
  }

  fn transfer(&mut self, transfer: TransferIo<'_>) -> io::Result<()> {
    let mut state = self.script.0.borrow_mut();
    if state.fail_transfers {
      return Err(io::Error::other("scripted submit failure"));
    }
    state.submitted.push(Submission {
      handler: transfer.handler,
      origin: Origin::Slot(transfer.index),
      read: transfer.read,
    });
    Ok(())
  }

  fn connect(
    &mut self,
    handler: HandlerId,
    _socket: RawSocket,
    _io: &mut ConnectIo,
  ) -> io::Result<()> {
    self.script.0.borrow_mut().submitted.push(Submission {
      handler,
      origin: Origin::Connect,
      read: false,
    });
    Ok(())
  }

  fn cancel(&mut self, target: CancelIo) -> io::Result<()> {
    self.script.0.borrow_mut().cancels.push(target.origin);
    Ok(())
  }

  fn flush(&mut self) -> io::Result<()> {
    self.script.0.borrow_mut().flushes += 1;
    Ok(())
  }

  fn wait(
    &mut self,
    _timeout: Option<Duration>,
    out: &mut Vec<Completion>,
  ) -> io::Result<()> {
    out.extend(self.script.0.borrow_mut().ready.drain(..));
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backends::EventLoop;

  #[test]
  fn scripted_completions_are_drained_once() {
    let (driver, script) = DummyDriver::new();
    let lp = EventLoop::with_driver(Box::new(driver));
    let handler = HandlerId::from_u32(1);

    script.push(Completion {
      handler,
      origin: Origin::Connect,
      outcome: Outcome::success(0),
    });
    script.push(Completion {
      handler,
      origin: Origin::Slot(0),
      outcome: Outcome::failed(None),
    });

    assert_eq!(lp.run_once(None).unwrap(), 2);
    assert_eq!(lp.run_once(None).unwrap(), 0);
  }
}
