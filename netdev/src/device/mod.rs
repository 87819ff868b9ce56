//! Device and buffer state machine.
//!
//! A [`Device`] owns one socket and a fixed pool of transfer buffers. Both
//! have a small lifecycle:
//!
//! ```text
//! device:  DISABLED -> OPENING -> READY -> DISABLED
//! buffer:  DISABLED -> READY <-> BUSY,  any -> DISABLED on close
//! ```
//!
//! Buffers are slots of an index-based arena; the ones engaged in an
//! operation are tracked in a [`PendingSet`]. The backend only submits,
//! cancels and reports completions, every decision is taken here so both
//! native models share one state machine.
//!
//! A buffer whose kernel operation was abandoned by `close` is *orphaned*:
//! its memory stays untouched until that completion is returned. It stays
//! DISABLED until then, also across a re-open, and becomes READY when the
//! abandoned operation comes back.

mod buffer;
mod pending;

use std::{
  cell::{RefCell, RefMut},
  fmt,
  future::Future,
  mem,
  pin::Pin,
  rc::{Rc, Weak},
  task::{Context, Poll},
};

use crossbeam_channel::Receiver;
use tracing::{Level, event};

pub use self::buffer::{Buffer, BufferReady};
use self::pending::PendingSet;
use crate::{
  backends::{
    CancelIo, Completion, CompletionHandler, ConnectIo, EventLoop, HandlerId,
    LoopInner, Origin, Outcome, SlotIo, TransferIo,
  },
  error::{Error, Result},
  ip::{Endpoint, v6},
  op::{BufferState, DeviceState, Op, Transfer, TransferResult},
  signal::{Subscribers, Waiters, Wakeups},
  sys::{Protocol, Socket},
};

/// Largest buffer pool, indices must fit 16 bits with one value spare.
const MAX_BUFFERS: usize = u16::MAX as usize - 1;
/// Largest buffer, native transfer lengths are 32 bit.
const MAX_CAPACITY: usize = i32::MAX as usize;

/// Buffer pool settings of a device.
///
/// ```
/// use netdev::PoolConfig;
///
/// let pool = PoolConfig::default().buffers(4).capacity(9000);
/// assert_eq!(pool.get_buffers(), 4);
/// assert_eq!(pool.get_capacity(), 9000);
/// ```
#[derive(Clone, Debug)]
pub struct PoolConfig {
  buffers: usize,
  capacity: usize,
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self { buffers: 2, capacity: 1500 }
  }
}

impl PoolConfig {
  /// Number of buffers, at least one.
  pub fn buffers(mut self, buffers: usize) -> Self {
    self.buffers = buffers.clamp(1, MAX_BUFFERS);
    self
  }

  /// Bytes per buffer, at least one.
  pub fn capacity(mut self, capacity: usize) -> Self {
    self.capacity = capacity.clamp(1, MAX_CAPACITY);
    self
  }

  pub fn get_buffers(&self) -> usize {
    self.buffers
  }

  pub fn get_capacity(&self) -> usize {
    self.capacity
  }
}

/// One transfer buffer.
///
/// Lives in a boxed slice that is never reallocated, so the addresses of
/// `data`, `header` and `io` stay valid for the kernel.
pub(crate) struct Slot {
  data: Box<[u8]>,
  size: usize,
  header: Endpoint,
  op: Op,
  state: BufferState,
  result: TransferResult,
  /// The kernel holds an operation on this slot.
  in_kernel: bool,
  /// That operation was abandoned by `close`.
  orphaned: bool,
  io: SlotIo,
  waiters: Waiters,
}

impl Slot {
  fn new(capacity: usize) -> Self {
    Self {
      data: vec![0; capacity].into_boxed_slice(),
      size: 0,
      header: Endpoint::empty(),
      op: Op::NONE,
      state: BufferState::Disabled,
      result: TransferResult::Success,
      in_kernel: false,
      orphaned: false,
      io: SlotIo::new(),
      waiters: Waiters::default(),
    }
  }

  fn transfer(&self) -> Transfer {
    Transfer { state: self.state, size: self.size, result: self.result }
  }

  /// Payload and header may be touched by the caller.
  fn is_idle(&self) -> bool {
    self.state != BufferState::Busy && !self.in_kernel
  }

  /// Idle buffers of an opening or open device become READY.
  fn enable(&mut self, wakeups: &mut Wakeups) {
    if self.is_idle() {
      self.result = TransferResult::Success;
      self.reset(BufferState::Ready, wakeups);
    }
  }

  fn reset(&mut self, state: BufferState, wakeups: &mut Wakeups) {
    self.state = state;
    self.size = 0;
    self.op = Op::NONE;
    wakeups.buffer(&mut self.waiters);
  }
}

struct Core {
  socket: Option<Socket>,
  state: DeviceState,
  slots: Box<[Slot]>,
  pending: PendingSet,
  connect: Box<ConnectIo>,
  /// The kernel holds the stream connect.
  connect_in_kernel: bool,
  waiters: Waiters,
  subscribers: Subscribers,
  transitions: u64,
}

impl Core {
  fn enter(&mut self, state: DeviceState, wakeups: &mut Wakeups) {
    self.state = state;
    self.transitions += 1;
    self.subscribers.broadcast(state);
    wakeups.device(&mut self.waiters);
  }

  /// Leaves BUSY with the final result of the slot's operation.
  fn finish(
    &mut self,
    index: u16,
    result: TransferResult,
    size: usize,
    wakeups: &mut Wakeups,
  ) {
    self.pending.remove(index);
    let slot = &mut self.slots[index as usize];
    slot.size = size;
    slot.result = result;
    slot.state = BufferState::Ready;
    slot.op = slot.op.without(Op::CANCEL);
    wakeups.buffer(&mut slot.waiters);
  }

  /// Maps a completion origin to the connect or a slot.
  fn resolve(&self, origin: Origin) -> Option<Origin> {
    match origin {
      Origin::Slot(_) | Origin::Connect => Some(origin),
      Origin::Cancel => None,
      Origin::Record(record) => {
        if self.connect.record() == record {
          return Some(Origin::Connect);
        }
        let matches = |index: &u16| {
          let slot = &self.slots[*index as usize];
          slot.in_kernel && slot.io.record() == record
        };
        self
          .pending
          .iter()
          .find(matches)
          // orphaned operations are no longer pending
          .or_else(|| (0..self.slots.len() as u16).find(matches))
          .map(Origin::Slot)
      }
    }
  }

  /// Completions the kernel still owes this device.
  fn outstanding(&self) -> usize {
    let slots = self.slots.iter().filter(|slot| slot.in_kernel).count();
    slots + usize::from(self.connect_in_kernel)
  }
}

pub(crate) struct Shared {
  lp: Rc<LoopInner>,
  id: HandlerId,
  protocol: Protocol,
  connectionless: bool,
  core: RefCell<Core>,
}

impl Shared {
  fn core(&self) -> RefMut<'_, Core> {
    self.core.borrow_mut()
  }

  fn open(&self, local: &Endpoint, remote: Option<&Endpoint>) -> Result<()> {
    let family = local
      .family()
      .ok_or(Error::UnsupportedFamily(local.protocol_id()))?;
    if let Some(remote) = remote {
      if remote.family() != Some(family) {
        return Err(Error::UnsupportedFamily(remote.protocol_id()));
      }
    }

    let mut wakeups = Wakeups::default();
    let opened = self.open_core(&mut self.core(), local, remote, &mut wakeups);
    wakeups.fire();
    opened
  }

  fn open_core(
    &self,
    core: &mut Core,
    local: &Endpoint,
    remote: Option<&Endpoint>,
    wakeups: &mut Wakeups,
  ) -> Result<()> {
    if core.socket.is_some() {
      return Err(Error::AlreadyOpen);
    }
    if core.connect_in_kernel {
      return Err(Error::Draining);
    }

    let socket = self.setup(local)?;
    match remote {
      Some(remote) if self.protocol.is_stream() => {
        core.connect.endpoint = *remote;
        self.lp.driver().connect(self.id, socket.raw(), &mut core.connect)?;
        event!(
          Level::DEBUG,
          message = "connecting",
          handler = self.id.as_u32(),
          remote = %remote,
        );
        core.socket = Some(socket);
        core.connect_in_kernel = true;
        for slot in core.slots.iter_mut() {
          slot.enable(wakeups);
        }
        core.enter(DeviceState::Opening, wakeups);
      }
      Some(remote) => {
        socket.connect(remote)?;
        core.socket = Some(socket);
        self.enter_ready(core, wakeups);
      }
      None => {
        core.socket = Some(socket);
        self.enter_ready(core, wakeups);
      }
    }
    Ok(())
  }

  /// Creates, binds and registers a socket. Dropped (closed) on failure.
  fn setup(&self, local: &Endpoint) -> Result<Socket> {
    let family = local
      .family()
      .ok_or(Error::UnsupportedFamily(local.protocol_id()))?;
    let socket = Socket::new(family, self.protocol)?;
    socket.set_reuse_address()?;
    socket.bind(local)?;
    self.lp.driver().register(socket.raw(), self.id)?;
    event!(
      Level::DEBUG,
      message = "socket bound",
      handler = self.id.as_u32(),
      protocol = ?self.protocol,
      local = %local,
    );
    Ok(socket)
  }

  fn enter_ready(&self, core: &mut Core, wakeups: &mut Wakeups) {
    for slot in core.slots.iter_mut() {
      slot.enable(wakeups);
    }
    for index in 0..core.slots.len() as u16 {
      if core.slots[index as usize].state == BufferState::Busy {
        self.issue(core, index, wakeups);
      }
    }
    core.enter(DeviceState::Ready, wakeups);
    event!(Level::TRACE, message = "device ready", handler = self.id.as_u32());
  }

  /// Hands a started operation to the kernel.
  fn issue(&self, core: &mut Core, index: u16, wakeups: &mut Wakeups) {
    let Some(socket) = core.socket.as_ref().map(Socket::raw) else {
      return;
    };
    let slot = &mut core.slots[index as usize];
    debug_assert!(!slot.in_kernel);

    let read = slot.op.is_read();
    let len = if read { slot.data.len() } else { slot.size };
    let data = slot.data.as_mut_ptr();
    let name = if !self.connectionless {
      None
    } else if read {
      Some((&mut slot.header as *mut Endpoint, Endpoint::capacity()))
    } else {
      Some((&mut slot.header as *mut Endpoint, slot.header.len()))
    };
    slot.io.prepare(data, len, name);

    let submitted = self.lp.driver().transfer(TransferIo {
      handler: self.id,
      index,
      socket,
      read,
      io: &mut slot.io,
    });
    match submitted {
      Ok(()) => {
        slot.in_kernel = true;
        event!(
          Level::TRACE,
          message = "transfer issued",
          handler = self.id.as_u32(),
          index,
          read,
          len,
        );
      }
      Err(err) => {
        event!(
          Level::WARN,
          message = "transfer submission failed",
          handler = self.id.as_u32(),
          index,
          error = %err,
        );
        core.finish(index, TransferResult::Failed, 0, wakeups);
      }
    }
  }

  fn start(&self, index: u16, op: Op) -> Result<()> {
    let mut wakeups = Wakeups::default();
    let started = {
      let mut core = self.core();
      let core = &mut *core;
      let slot = &mut core.slots[index as usize];
      if slot.state != BufferState::Ready {
        Err(Error::NotReady)
      } else if !op.is_transfer() {
        Err(Error::InvalidOp)
      } else if self.connectionless && op.is_write() && slot.header.is_empty()
      {
        Err(Error::MissingEndpoint)
      } else if self.connectionless && op.is_write() && slot.size == 0 {
        Err(Error::EmptyPayload)
      } else {
        slot.op = op;
        slot.state = BufferState::Busy;
        core.pending.insert(index);
        if core.state == DeviceState::Ready {
          self.issue(core, index, &mut wakeups);
        }
        Ok(())
      }
    };
    wakeups.fire();
    started
  }

  fn cancel(&self, index: u16) -> Result<()> {
    let mut wakeups = Wakeups::default();
    let cancelled = {
      let mut core = self.core();
      let core = &mut *core;
      let slot = &mut core.slots[index as usize];
      if slot.state != BufferState::Busy {
        Err(Error::NotBusy)
      } else if slot.op.contains(Op::CANCEL) {
        Ok(())
      } else {
        slot.op |= Op::CANCEL;
        match core.socket.as_ref().map(Socket::raw) {
          Some(socket) if slot.in_kernel => {
            let target = CancelIo {
              handler: self.id,
              origin: Origin::Slot(index),
              socket,
              record: slot.io.record(),
            };
            if let Err(err) = self.lp.driver().cancel(target) {
              event!(
                Level::WARN,
                message = "cancel request failed",
                handler = self.id.as_u32(),
                index,
                error = %err,
              );
            }
          }
          // never reached the kernel
          _ => core.finish(index, TransferResult::Cancelled, 0, &mut wakeups),
        }
        Ok(())
      }
    };
    wakeups.fire();
    cancelled
  }

  fn close(&self) {
    let mut wakeups = Wakeups::default();
    self.close_core(&mut self.core(), &mut wakeups);
    wakeups.fire();
  }

  fn close_core(&self, core: &mut Core, wakeups: &mut Wakeups) {
    let Some(socket) = core.socket.take() else {
      return;
    };

    {
      let mut driver = self.lp.driver();
      let raw = socket.raw();
      for (index, slot) in core.slots.iter_mut().enumerate() {
        if !slot.in_kernel || slot.orphaned {
          continue;
        }
        slot.orphaned = true;
        let target = CancelIo {
          handler: self.id,
          origin: Origin::Slot(index as u16),
          socket: raw,
          record: slot.io.record(),
        };
        if let Err(err) = driver.cancel(target) {
          event!(
            Level::WARN,
            message = "cancel on close failed",
            handler = self.id.as_u32(),
            index,
            error = %err,
          );
        }
      }
      if core.connect_in_kernel && core.state == DeviceState::Opening {
        let target = CancelIo {
          handler: self.id,
          origin: Origin::Connect,
          socket: raw,
          record: core.connect.record(),
        };
        if let Err(err) = driver.cancel(target) {
          event!(
            Level::WARN,
            message = "connect cancel failed",
            handler = self.id.as_u32(),
            error = %err,
          );
        }
      }
      // cancels must reach the kernel before the descriptor can be reused
      if let Err(err) = driver.flush() {
        event!(Level::WARN, message = "flush on close failed", error = %err);
      }
    }
    drop(socket);

    for slot in core.slots.iter_mut() {
      slot.result = TransferResult::Cancelled;
      slot.reset(BufferState::Disabled, wakeups);
    }
    core.pending.clear();
    core.enter(DeviceState::Disabled, wakeups);
    event!(Level::DEBUG, message = "device closed", handler = self.id.as_u32());
  }

  fn complete_slot(
    &self,
    core: &mut Core,
    index: u16,
    outcome: Outcome,
    wakeups: &mut Wakeups,
  ) {
    let Some(slot) = core.slots.get_mut(index as usize) else {
      event!(
        Level::WARN,
        message = "completion for unknown buffer",
        handler = self.id.as_u32(),
        index,
      );
      return;
    };
    if !slot.in_kernel {
      event!(
        Level::WARN,
        message = "completion for idle buffer",
        handler = self.id.as_u32(),
        index,
      );
      return;
    }
    slot.in_kernel = false;

    if slot.orphaned {
      slot.orphaned = false;
      event!(
        Level::TRACE,
        message = "orphaned transfer returned",
        handler = self.id.as_u32(),
        index,
      );
      if core.state == DeviceState::Disabled {
        wakeups.buffer(&mut slot.waiters);
      } else {
        slot.enable(wakeups);
      }
      return;
    }

    // a truncating receive may report the full datagram length
    let capacity = slot.data.len();
    let (result, size) = match outcome.result {
      TransferResult::Success
        if slot.io.truncated() || outcome.size > capacity =>
      {
        (TransferResult::Oversize, outcome.size.min(capacity))
      }
      result @ (TransferResult::Success | TransferResult::Oversize) => {
        (result, outcome.size)
      }
      result => (result, 0),
    };
    if result == TransferResult::Failed {
      event!(
        Level::WARN,
        message = "transfer failed",
        handler = self.id.as_u32(),
        index,
        code = ?outcome.code,
      );
    } else {
      event!(
        Level::TRACE,
        message = "transfer complete",
        handler = self.id.as_u32(),
        index,
        result = ?result,
        size,
      );
    }
    core.finish(index, result, size, wakeups);
  }

  fn complete_connect(
    &self,
    core: &mut Core,
    outcome: Outcome,
    wakeups: &mut Wakeups,
  ) {
    if !core.connect_in_kernel {
      event!(
        Level::WARN,
        message = "unexpected connect completion",
        handler = self.id.as_u32(),
      );
      return;
    }
    core.connect_in_kernel = false;
    if core.state != DeviceState::Opening {
      // closed while connecting
      return;
    }

    let connected = match (outcome.result, core.socket.as_ref()) {
      (TransferResult::Success, Some(socket)) => self
        .lp
        .driver()
        .connected(socket.raw())
        .map_err(|err| err.raw_os_error()),
      _ => Err(outcome.code),
    };
    match connected {
      Ok(()) => self.enter_ready(core, wakeups),
      Err(code) => {
        event!(
          Level::WARN,
          message = "connect failed",
          handler = self.id.as_u32(),
          code = ?code,
        );
        self.close_core(core, wakeups);
      }
    }
  }
}

impl CompletionHandler for Shared {
  fn complete(&self, completion: Completion) {
    let mut wakeups = Wakeups::default();
    {
      let mut core = self.core();
      let core = &mut *core;
      match core.resolve(completion.origin) {
        Some(Origin::Slot(index)) => {
          self.complete_slot(core, index, completion.outcome, &mut wakeups)
        }
        Some(Origin::Connect) => {
          self.complete_connect(core, completion.outcome, &mut wakeups)
        }
        Some(_) => {}
        None if completion.origin == Origin::Cancel => {}
        None => event!(
          Level::WARN,
          message = "completion for unknown record",
          handler = self.id.as_u32(),
          origin = ?completion.origin,
        ),
      }
    }
    wakeups.fire();
  }
}

impl Drop for Shared {
  fn drop(&mut self) {
    let mut wakeups = Wakeups::default();
    let mut core = self.core.borrow_mut();
    self.close_core(&mut core, &mut wakeups);
    wakeups.fire();

    let outstanding = core.outstanding();
    let mut registry = self.lp.registry();
    if outstanding == 0 {
      registry.remove(self.id);
      return;
    }

    // the kernel may still write into these
    let slots = mem::take(&mut core.slots);
    let connect = mem::replace(&mut core.connect, Box::new(ConnectIo::new()));
    registry.retire(self.id, Box::new((slots, connect)), outstanding);
    event!(
      Level::DEBUG,
      message = "device retired",
      handler = self.id.as_u32(),
      outstanding,
    );
  }
}

/// Socket plus a fixed pool of transfer buffers, driven by an [`EventLoop`].
///
/// Created through [`IpSocket`](crate::IpSocket) or
/// [`UdpSocket`](crate::UdpSocket), which deref to this type.
pub struct Device {
  shared: Rc<Shared>,
}

impl Device {
  pub(crate) fn new(
    lp: &EventLoop,
    protocol: Protocol,
    connectionless: bool,
    pool: &PoolConfig,
  ) -> Result<Self> {
    let inner = Rc::clone(lp.inner());
    let id = inner.registry().reserve()?;

    let slots: Box<[Slot]> =
      (0..pool.buffers).map(|_| Slot::new(pool.capacity)).collect();
    let core = Core {
      socket: None,
      state: DeviceState::Disabled,
      pending: PendingSet::new(slots.len()),
      slots,
      connect: Box::new(ConnectIo::new()),
      connect_in_kernel: false,
      waiters: Waiters::default(),
      subscribers: Subscribers::default(),
      transitions: 0,
    };

    let shared = Rc::new(Shared {
      lp: Rc::clone(&inner),
      id,
      protocol,
      connectionless,
      core: RefCell::new(core),
    });
    let handler: Weak<dyn CompletionHandler> = Rc::downgrade(&shared) as _;
    inner.registry().attach(id, handler);

    Ok(Self { shared })
  }

  /// Opens the socket bound to `local`. With `remote`, stream sockets start
  /// connecting and datagram sockets fix their peer.
  pub(crate) fn open(
    &self,
    local: &Endpoint,
    remote: Option<&Endpoint>,
  ) -> Result<()> {
    self.shared.open(local, remote)
  }

  pub(crate) fn join(&self, group: &v6::Address) -> Result<()> {
    let core = self.shared.core();
    let socket = core.socket.as_ref().ok_or(Error::NotOpen)?;
    socket.join_v6(group)?;
    Ok(())
  }

  pub fn state(&self) -> DeviceState {
    self.shared.core().state
  }

  pub fn protocol(&self) -> Protocol {
    self.shared.protocol
  }

  /// Buffers carry their own peer endpoint.
  pub fn is_connectionless(&self) -> bool {
    self.shared.connectionless
  }

  /// Closes the socket. Busy buffers are finished as cancelled; their
  /// kernel operations are abandoned. No-op when already closed.
  pub fn close(&self) {
    self.shared.close();
  }

  pub fn buffer_count(&self) -> usize {
    self.shared.core().slots.len()
  }

  pub fn buffer(&self, index: usize) -> Option<Buffer> {
    if index >= self.buffer_count() {
      return None;
    }
    Some(Buffer::new(Rc::clone(&self.shared), index as u16))
  }

  pub fn buffers(&self) -> impl Iterator<Item = Buffer> + '_ {
    (0..self.buffer_count())
      .map(|index| Buffer::new(Rc::clone(&self.shared), index as u16))
  }

  /// Number of buffers currently engaged in an operation.
  pub fn pending(&self) -> usize {
    self.shared.core().pending.len()
  }

  /// Address the socket is bound to.
  pub fn local_endpoint(&self) -> Result<Endpoint> {
    let core = self.shared.core();
    let socket = core.socket.as_ref().ok_or(Error::NotOpen)?;
    Ok(socket.local_endpoint()?)
  }

  /// Resolves once the device is in `state`.
  pub fn until(&self, state: DeviceState) -> Until {
    Until { shared: Rc::clone(&self.shared), state }
  }

  /// Resolves at the next state transition with the entered state.
  pub fn changed(&self) -> Changed {
    let seen = self.shared.core().transitions;
    Changed { shared: Rc::clone(&self.shared), seen }
  }

  /// Every state entered from now on is sent to the returned channel.
  pub fn subscribe(&self) -> Receiver<DeviceState> {
    let (tx, rx) = crossbeam_channel::unbounded();
    self.shared.core().subscribers.add(tx);
    rx
  }
}

impl fmt::Debug for Device {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let core = self.shared.core.borrow();
    f.debug_struct("Device")
      .field("handler", &self.shared.id.as_u32())
      .field("protocol", &self.shared.protocol)
      .field("connectionless", &self.shared.connectionless)
      .field("state", &core.state)
      .field("buffers", &core.slots.len())
      .field("pending", &core.pending.len())
      .finish()
  }
}

/// Future of [`Device::until`].
#[must_use = "futures do nothing unless polled"]
pub struct Until {
  shared: Rc<Shared>,
  state: DeviceState,
}

impl Future for Until {
  type Output = ();

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
    let mut core = self.shared.core();
    if core.state == self.state {
      return Poll::Ready(());
    }
    core.waiters.register(cx.waker());
    Poll::Pending
  }
}

/// Future of [`Device::changed`].
#[must_use = "futures do nothing unless polled"]
pub struct Changed {
  shared: Rc<Shared>,
  seen: u64,
}

impl Future for Changed {
  type Output = DeviceState;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<DeviceState> {
    let mut core = self.shared.core();
    if core.transitions != self.seen {
      return Poll::Ready(core.state);
    }
    core.waiters.register(cx.waker());
    Poll::Pending
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;
  use crate::{
    backends::dummy::{DummyDriver, Script},
    ip::{Family, v4},
  };

  fn device(
    protocol: Protocol,
    connectionless: bool,
  ) -> (EventLoop, Script, Device) {
    let (driver, script) = DummyDriver::new();
    let lp = EventLoop::with_driver(Box::new(driver));
    let dev = Device::new(&lp, protocol, connectionless, &PoolConfig::default())
      .unwrap();
    (lp, script, dev)
  }

  fn open_udp() -> (EventLoop, Script, Device) {
    let (lp, script, dev) = device(Protocol::Udp, true);
    dev.open(&Endpoint::unspecified(Family::V4, 0), None).unwrap();
    (lp, script, dev)
  }

  /// Opening stream device; the connect goes nowhere.
  fn opening_tcp() -> (EventLoop, Script, Device) {
    let (lp, script, dev) = device(Protocol::Tcp, false);
    let remote = Endpoint::from(v4::Endpoint::new(v4::Address::LOCALHOST, 9));
    dev.open(&Endpoint::unspecified(Family::V4, 0), Some(&remote)).unwrap();
    (lp, script, dev)
  }

  fn tick(lp: &EventLoop) {
    lp.run_once(Some(Duration::ZERO)).unwrap();
  }

  fn slot_submissions(script: &Script, index: u16) -> usize {
    script
      .submitted()
      .iter()
      .filter(|s| s.origin == Origin::Slot(index))
      .count()
  }

  #[test]
  fn pool_config_bounds() {
    let pool = PoolConfig::default();
    assert_eq!((pool.get_buffers(), pool.get_capacity()), (2, 1500));
    assert_eq!(PoolConfig::default().buffers(0).get_buffers(), 1);
    assert_eq!(PoolConfig::default().capacity(0).get_capacity(), 1);
    assert_eq!(
      PoolConfig::default().buffers(usize::MAX).get_buffers(),
      MAX_BUFFERS
    );
  }

  #[test]
  fn new_device_is_disabled() {
    let (_lp, _script, dev) = device(Protocol::Udp, true);
    assert_eq!(dev.state(), DeviceState::Disabled);
    assert_eq!(dev.buffer_count(), 2);
    assert!(dev.buffer(2).is_none());
    assert!(matches!(dev.local_endpoint(), Err(Error::NotOpen)));
    for buf in dev.buffers() {
      assert_eq!(buf.state(), BufferState::Disabled);
      assert!(matches!(buf.read(), Err(Error::NotReady)));
    }
  }

  #[test]
  fn open_datagram_is_ready() {
    let (_lp, script, dev) = open_udp();
    assert_eq!(dev.state(), DeviceState::Ready);
    assert_eq!(script.registered(), 1);
    assert_ne!(dev.local_endpoint().unwrap().port(), 0);
    for buf in dev.buffers() {
      assert_eq!(buf.state(), BufferState::Ready);
      assert_eq!(buf.size(), 0);
    }
    assert!(matches!(
      dev.open(&Endpoint::unspecified(Family::V4, 0), None),
      Err(Error::AlreadyOpen)
    ));
  }

  #[test]
  fn open_rejects_unknown_family() {
    let (_lp, _script, dev) = device(Protocol::Udp, true);
    assert!(matches!(
      dev.open(&Endpoint::empty(), None),
      Err(Error::UnsupportedFamily(0))
    ));
    assert_eq!(dev.state(), DeviceState::Disabled);
  }

  #[test]
  fn failed_registration_leaves_device_closed() {
    let (_lp, script, dev) = device(Protocol::Udp, true);
    script.fail_register(true);
    let local = Endpoint::unspecified(Family::V4, 0);
    assert!(matches!(dev.open(&local, None), Err(Error::Io(_))));
    assert_eq!(dev.state(), DeviceState::Disabled);

    script.fail_register(false);
    dev.open(&local, None).unwrap();
    assert_eq!(dev.state(), DeviceState::Ready);
  }

  #[test]
  fn start_validates_direction_and_state() {
    let (_lp, script, dev) = open_udp();
    let buf = dev.buffer(0).unwrap();

    assert!(matches!(buf.start(Op::NONE), Err(Error::InvalidOp)));
    assert!(matches!(buf.start(Op::READ | Op::WRITE), Err(Error::InvalidOp)));
    assert!(matches!(buf.start(Op::READ | Op::CANCEL), Err(Error::InvalidOp)));
    assert_eq!(buf.state(), BufferState::Ready);

    buf.read().unwrap();
    assert_eq!(buf.state(), BufferState::Busy);
    assert!(matches!(buf.read(), Err(Error::NotReady)));
    assert_eq!(dev.pending(), 1);
    assert_eq!(slot_submissions(&script, 0), 1);
  }

  #[test]
  fn connectionless_write_needs_endpoint_and_payload() {
    let (_lp, script, dev) = open_udp();
    let buf = dev.buffer(1).unwrap();

    buf.set_size(4).unwrap();
    assert!(matches!(buf.start(Op::WRITE), Err(Error::MissingEndpoint)));

    let peer = v4::Endpoint::new(v4::Address::LOCALHOST, 1337);
    buf.set_header(&peer.into()).unwrap();
    buf.set_size(0).unwrap();
    assert!(matches!(buf.start(Op::WRITE), Err(Error::EmptyPayload)));

    buf.write(b"ping").unwrap();
    assert_eq!(buf.state(), BufferState::Busy);
    let last = script.submitted().pop().map(|s| (s.origin, s.read));
    assert_eq!(last, Some((Origin::Slot(1), false)));
  }

  #[test]
  fn completion_finishes_buffer() {
    let (lp, script, dev) = open_udp();
    let buf = dev.buffer(0).unwrap();
    buf.read().unwrap();

    script.complete(Origin::Slot(0), Outcome::success(5));
    tick(&lp);
    assert_eq!(
      buf.transfer(),
      Transfer {
        state: BufferState::Ready,
        size: 5,
        result: TransferResult::Success
      }
    );
    assert_eq!(dev.pending(), 0);
  }

  #[test]
  fn failures_report_zero_size() {
    let (lp, script, dev) = open_udp();
    let buf = dev.buffer(0).unwrap();
    buf.read().unwrap();
    script.complete(Origin::Slot(0), Outcome::failed(Some(1)));
    tick(&lp);
    assert_eq!((buf.size(), buf.result()), (0, TransferResult::Failed));

    buf.read().unwrap();
    script.complete(Origin::Slot(0), Outcome::oversize(7, None));
    tick(&lp);
    assert_eq!((buf.size(), buf.result()), (7, TransferResult::Oversize));

    // full datagram length reported past the end of the buffer
    buf.read().unwrap();
    script.complete(Origin::Slot(0), Outcome::success(4000));
    tick(&lp);
    assert_eq!((buf.size(), buf.result()), (1500, TransferResult::Oversize));
  }

  #[test]
  fn submission_failure_finishes_as_failed() {
    let (_lp, script, dev) = open_udp();
    script.fail_transfers(true);
    let buf = dev.buffer(0).unwrap();

    buf.read().unwrap();
    assert_eq!(buf.state(), BufferState::Ready);
    assert_eq!(buf.result(), TransferResult::Failed);
    assert_eq!(dev.pending(), 0);
  }

  #[test]
  fn queued_during_opening_is_issued_on_ready() {
    let (lp, script, dev) = opening_tcp();
    assert_eq!(dev.state(), DeviceState::Opening);

    let buf = dev.buffer(0).unwrap();
    buf.read().unwrap();
    assert_eq!(buf.state(), BufferState::Busy);
    assert_eq!(slot_submissions(&script, 0), 0);

    script.complete(Origin::Connect, Outcome::success(0));
    tick(&lp);
    assert_eq!(dev.state(), DeviceState::Ready);
    assert_eq!(slot_submissions(&script, 0), 1);
    assert_eq!(buf.state(), BufferState::Busy);
    assert_eq!(dev.buffer(1).unwrap().state(), BufferState::Ready);
  }

  #[test]
  fn failed_connect_closes_device() {
    let (lp, script, dev) = opening_tcp();
    let states = dev.subscribe();
    let buf = dev.buffer(0).unwrap();
    buf.read().unwrap();

    script.complete(Origin::Connect, Outcome::failed(Some(111)));
    tick(&lp);
    assert_eq!(dev.state(), DeviceState::Disabled);
    assert_eq!(
      buf.transfer(),
      Transfer {
        state: BufferState::Disabled,
        size: 0,
        result: TransferResult::Cancelled
      }
    );
    assert_eq!(dev.pending(), 0);
    assert_eq!(states.try_iter().collect::<Vec<_>>(), [DeviceState::Disabled]);
  }

  #[test]
  fn cancel_is_idempotent() {
    let (lp, script, dev) = open_udp();
    let buf = dev.buffer(0).unwrap();
    assert!(matches!(buf.cancel(), Err(Error::NotBusy)));

    buf.read().unwrap();
    buf.cancel().unwrap();
    buf.cancel().unwrap();
    assert_eq!(script.cancels(), [Origin::Slot(0)]);
    assert_eq!(buf.state(), BufferState::Busy);
    assert!(buf.op().contains(Op::CANCEL));

    script.complete(Origin::Slot(0), Outcome::cancelled(None));
    tick(&lp);
    assert_eq!((buf.state(), buf.size()), (BufferState::Ready, 0));
    assert_eq!(buf.result(), TransferResult::Cancelled);
    assert!(!buf.op().contains(Op::CANCEL));
    assert!(matches!(buf.cancel(), Err(Error::NotBusy)));
  }

  #[test]
  fn cancel_of_queued_operation_finishes_at_once() {
    let (_lp, script, dev) = opening_tcp();
    let buf = dev.buffer(0).unwrap();
    buf.read().unwrap();

    buf.cancel().unwrap();
    assert!(script.cancels().is_empty());
    assert_eq!(buf.state(), BufferState::Ready);
    assert_eq!(buf.result(), TransferResult::Cancelled);
    assert_eq!(dev.pending(), 0);
  }

  #[test]
  fn close_disables_busy_buffers() {
    let (lp, script, dev) = open_udp();
    for buf in dev.buffers() {
      buf.read().unwrap();
    }

    dev.close();
    assert_eq!(dev.state(), DeviceState::Disabled);
    assert_eq!(script.cancels().len(), 2);
    assert!(script.flushes() >= 1);
    for buf in dev.buffers() {
      assert_eq!(
        buf.transfer(),
        Transfer {
          state: BufferState::Disabled,
          size: 0,
          result: TransferResult::Cancelled
        }
      );
    }

    // late completions are absorbed
    script.complete(Origin::Slot(0), Outcome::success(9));
    script.complete(Origin::Slot(1), Outcome::cancelled(None));
    tick(&lp);
    assert_eq!(dev.buffer(0).unwrap().size(), 0);

    dev.close();
    assert_eq!(script.cancels().len(), 2);
  }

  #[test]
  fn orphaned_buffer_is_ready_once_its_operation_returns() {
    let (lp, script, dev) = open_udp();
    let orphan = dev.buffer(0).unwrap();
    orphan.read().unwrap();
    dev.close();

    dev.open(&Endpoint::unspecified(Family::V4, 0), None).unwrap();
    assert_eq!(dev.state(), DeviceState::Ready);
    assert_eq!(orphan.state(), BufferState::Disabled);
    assert!(matches!(orphan.read(), Err(Error::NotReady)));
    assert!(matches!(orphan.set_size(1), Err(Error::Busy)));
    assert_eq!(dev.buffer(1).unwrap().state(), BufferState::Ready);

    let pending = lp.block_on_timeout(orphan.ready(), Duration::ZERO);
    assert!(pending.unwrap().is_none());

    // the abandoned receive returns and frees the buffer
    script.complete(Origin::Slot(0), Outcome::success(9));
    assert_eq!(
      lp.block_on(orphan.ready()).unwrap(),
      Transfer {
        state: BufferState::Ready,
        size: 0,
        result: TransferResult::Success
      }
    );

    let peer = v4::Endpoint::new(v4::Address::LOCALHOST, 9);
    orphan.set_header(&peer.into()).unwrap();
    orphan.write(b"x").unwrap();
    assert_eq!(slot_submissions(&script, 0), 2);
  }

  #[test]
  fn orphan_returning_while_closed_stays_disabled() {
    let (lp, script, dev) = open_udp();
    let buf = dev.buffer(0).unwrap();
    buf.read().unwrap();
    dev.close();

    script.complete(Origin::Slot(0), Outcome::cancelled(None));
    tick(&lp);
    assert_eq!(buf.state(), BufferState::Disabled);
    buf.set_size(0).unwrap();

    dev.open(&Endpoint::unspecified(Family::V4, 0), None).unwrap();
    assert_eq!(buf.state(), BufferState::Ready);
  }

  #[test]
  fn reopen_waits_for_cancelled_connect() {
    let (lp, script, dev) = opening_tcp();
    dev.close();
    assert_eq!(script.cancels(), [Origin::Connect]);

    let remote = Endpoint::from(v4::Endpoint::new(v4::Address::LOCALHOST, 9));
    let local = Endpoint::unspecified(Family::V4, 0);
    assert!(matches!(dev.open(&local, Some(&remote)), Err(Error::Draining)));

    script.complete(Origin::Connect, Outcome::cancelled(None));
    tick(&lp);
    assert_eq!(dev.state(), DeviceState::Disabled);
    dev.open(&local, Some(&remote)).unwrap();
    assert_eq!(dev.state(), DeviceState::Opening);
  }

  #[test]
  fn native_records_resolve_to_slots() {
    let (lp, script, dev) = open_udp();
    let buf = dev.buffer(1).unwrap();
    buf.read().unwrap();
    let handler = script.submitted()[0].handler;
    let record = dev.shared.core().slots[1].io.record();

    script.push(Completion {
      handler,
      origin: Origin::Record(record),
      outcome: Outcome::success(2),
    });
    tick(&lp);
    assert_eq!((buf.state(), buf.size()), (BufferState::Ready, 2));
  }

  #[test]
  fn dropping_busy_device_retires_its_buffers() {
    let (lp, script, dev) = open_udp();
    dev.buffer(0).unwrap().read().unwrap();
    let handler = script.submitted()[0].handler;
    drop(dev);

    assert_eq!(lp.inner().registry().outstanding(), 1);
    script.push(Completion {
      handler,
      origin: Origin::Cancel,
      outcome: Outcome::success(0),
    });
    script.push(Completion {
      handler,
      origin: Origin::Slot(0),
      outcome: Outcome::cancelled(None),
    });
    tick(&lp);
    assert_eq!(lp.inner().registry().outstanding(), 0);
  }

  #[test]
  fn futures_follow_transitions() {
    let (lp, script, dev) = opening_tcp();
    let changed = dev.changed();
    script.complete(Origin::Connect, Outcome::success(0));
    assert_eq!(lp.block_on(changed).unwrap(), DeviceState::Ready);
    lp.block_on(dev.until(DeviceState::Ready)).unwrap();

    let buf = dev.buffer(0).unwrap();
    buf.read().unwrap();
    script.complete(Origin::Slot(0), Outcome::success(4));
    let done = lp.block_on(buf.ready()).unwrap();
    assert_eq!(done.size, 4);
    assert!(done.is_success());
  }

  #[test]
  fn subscribers_see_every_state() {
    let (lp, script, dev) = device(Protocol::Tcp, false);
    let states = dev.subscribe();
    let remote = Endpoint::from(v4::Endpoint::new(v4::Address::LOCALHOST, 9));
    dev.open(&Endpoint::unspecified(Family::V4, 0), Some(&remote)).unwrap();
    script.complete(Origin::Connect, Outcome::success(0));
    tick(&lp);
    dev.close();

    assert_eq!(
      states.try_iter().collect::<Vec<_>>(),
      [DeviceState::Opening, DeviceState::Ready, DeviceState::Disabled]
    );

    drop(states);
    dev.open(&Endpoint::unspecified(Family::V4, 0), Some(&remote)).unwrap();
    assert_eq!(dev.shared.core().subscribers.len(), 0);
  }
}
