//! Completion backends and the event loop that drives them.
//!
//! A backend ([`Driver`]) only knows how to hand a prepared operation to the
//! kernel, how to ask for its cancellation and how to collect completions.
//! What a completion *means* is decided by the device state machine; the
//! loop merely routes each completion to the device that submitted it.

use std::{
  cell::RefCell,
  future::Future,
  io,
  pin::pin,
  rc::Rc,
  sync::Arc,
  task::{Context, Poll},
  time::{Duration, Instant},
};

use tracing::{Level, event};

use crate::{op::TransferResult, signal::Flag, sys::RawSocket};

mod store;
pub(crate) use store::{CompletionHandler, HandlerId, Registry, Route};

#[cfg(linux)]
mod io_uring;
#[cfg(linux)]
pub(crate) use self::io_uring::{ConnectIo, IoUring as Native, SlotIo};

#[cfg(windows)]
mod iocp;
#[cfg(windows)]
pub(crate) use self::iocp::{ConnectIo, Iocp as Native, SlotIo};

#[cfg(test)]
pub(crate) mod dummy;

/// What a completion refers to, inside the handler that submitted it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Origin {
  /// Transfer of the buffer with this index.
  Slot(u16),
  /// The device's stream connect.
  Connect,
  /// A cancel request; carries no storage.
  Cancel,
  /// Address of the native per-operation record (completion ports only
  /// return that), resolved by the device.
  #[cfg_attr(not(windows), allow(dead_code))]
  Record(usize),
}

/// Backend-neutral outcome of a native operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Outcome {
  pub result: TransferResult,
  pub size: usize,
  /// Native error code, kept for logging.
  pub code: Option<i32>,
}

impl Outcome {
  pub const fn success(size: usize) -> Self {
    Self { result: TransferResult::Success, size, code: None }
  }

  pub const fn cancelled(code: Option<i32>) -> Self {
    Self { result: TransferResult::Cancelled, size: 0, code }
  }

  pub const fn oversize(size: usize, code: Option<i32>) -> Self {
    Self { result: TransferResult::Oversize, size, code }
  }

  pub const fn failed(code: Option<i32>) -> Self {
    Self { result: TransferResult::Failed, size: 0, code }
  }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Completion {
  pub handler: HandlerId,
  pub origin: Origin,
  pub outcome: Outcome,
}

/// A transfer ready for submission: the record has been prepared by the
/// device and stays in place until the completion arrives.
pub(crate) struct TransferIo<'a> {
  pub handler: HandlerId,
  pub index: u16,
  pub socket: RawSocket,
  pub read: bool,
  pub io: &'a mut SlotIo,
}

/// Target of a cancel request.
pub(crate) struct CancelIo {
  pub handler: HandlerId,
  pub origin: Origin,
  #[cfg_attr(not(windows), allow(dead_code))]
  pub socket: RawSocket,
  /// Address of the native record of the operation.
  #[cfg_attr(not(windows), allow(dead_code))]
  pub record: usize,
}

/// Native completion facility.
pub(crate) trait Driver {
  fn name(&self) -> &'static str;

  /// Routes completions of `socket` to `handler`.
  fn register(&mut self, socket: RawSocket, handler: HandlerId)
  -> io::Result<()>;

  /// Queues a send or receive. `Ok` means a completion will arrive.
  fn transfer(&mut self, transfer: TransferIo<'_>) -> io::Result<()>;

  /// Starts a stream connect to `io`'s endpoint.
  fn connect(
    &mut self,
    handler: HandlerId,
    socket: RawSocket,
    io: &mut ConnectIo,
  ) -> io::Result<()>;

  /// Called once a stream connect succeeded, before any transfer.
  fn connected(&mut self, _socket: RawSocket) -> io::Result<()> {
    Ok(())
  }

  /// Asks the kernel to abort an operation. Advisory: the operation still
  /// completes, possibly successfully.
  fn cancel(&mut self, target: CancelIo) -> io::Result<()>;

  /// Hands queued requests to the kernel now.
  fn flush(&mut self) -> io::Result<()>;

  /// Waits up to `timeout` (forever on `None`) for at least one completion
  /// and appends everything available to `out`.
  fn wait(
    &mut self,
    timeout: Option<Duration>,
    out: &mut Vec<Completion>,
  ) -> io::Result<()>;
}

/// Event loop settings.
///
/// ```
/// use std::time::Duration;
/// use netdev::LoopConfig;
///
/// let config = LoopConfig::default()
///   .entries(512)
///   .poll_interval(Duration::from_millis(1));
/// assert_eq!(config.get_entries(), 512);
/// ```
#[derive(Clone, Debug)]
pub struct LoopConfig {
  entries: u32,
  poll_interval: Duration,
}

impl Default for LoopConfig {
  fn default() -> Self {
    Self { entries: 256, poll_interval: Duration::from_millis(10) }
  }
}

impl LoopConfig {
  /// Submission ring size (io_uring only).
  pub fn entries(mut self, entries: u32) -> Self {
    self.entries = entries.max(1);
    self
  }

  /// Longest single wait inside [`EventLoop::block_on`].
  pub fn poll_interval(mut self, interval: Duration) -> Self {
    self.poll_interval = interval;
    self
  }

  pub fn get_entries(&self) -> u32 {
    self.entries
  }

  pub fn get_poll_interval(&self) -> Duration {
    self.poll_interval
  }
}

/// Bound on the completion waits done while dropping a loop that still has
/// retired buffers.
const DRAIN_ROUNDS: usize = 100;

pub(crate) struct LoopInner {
  driver: RefCell<Box<dyn Driver>>,
  registry: RefCell<Registry>,
  scratch: RefCell<Vec<Completion>>,
  config: LoopConfig,
  #[cfg(windows)]
  _winsock: crate::sys::Guard,
}

impl LoopInner {
  pub fn driver(&self) -> std::cell::RefMut<'_, Box<dyn Driver>> {
    self.driver.borrow_mut()
  }

  pub fn registry(&self) -> std::cell::RefMut<'_, Registry> {
    self.registry.borrow_mut()
  }

  fn run_once(&self, timeout: Option<Duration>) -> io::Result<usize> {
    let mut completions = std::mem::take(&mut *self.scratch.borrow_mut());
    completions.clear();

    let waited = self.driver.borrow_mut().wait(timeout, &mut completions);
    if let Err(err) = waited {
      *self.scratch.borrow_mut() = completions;
      return Err(err);
    }

    let count = completions.len();
    for completion in completions.drain(..) {
      let route =
        self.registry.borrow_mut().route(completion.handler, completion.origin);
      match route {
        Route::Live(handler) => handler.complete(completion),
        Route::Absorbed => event!(
          Level::TRACE,
          message = "completion absorbed",
          handler = completion.handler.as_u32(),
          origin = ?completion.origin,
        ),
        Route::Unknown => event!(
          Level::WARN,
          message = "completion for unknown handler",
          handler = completion.handler.as_u32(),
          origin = ?completion.origin,
        ),
      }
    }

    *self.scratch.borrow_mut() = completions;
    Ok(count)
  }
}

impl Drop for LoopInner {
  fn drop(&mut self) {
    for _ in 0..DRAIN_ROUNDS {
      if self.registry.borrow().outstanding() == 0 {
        return;
      }
      if let Err(err) = self.run_once(Some(self.config.poll_interval)) {
        event!(Level::WARN, message = "drain failed", error = %err);
        break;
      }
    }

    let leaked = self.registry.borrow_mut().leak_retired();
    if leaked > 0 {
      event!(
        Level::WARN,
        message = "leaking buffers still held by the kernel",
        devices = leaked,
      );
    }
  }
}

/// Single-threaded event loop: owns the native completion facility and
/// dispatches every completion to the device that submitted it.
///
/// Devices keep the loop alive; all of them must be used on the thread that
/// created the loop.
#[derive(Clone)]
pub struct EventLoop {
  inner: Rc<LoopInner>,
}

impl EventLoop {
  /// Creates a loop on the native backend with default settings.
  pub fn new() -> io::Result<Self> {
    Self::with_config(LoopConfig::default())
  }

  pub fn with_config(config: LoopConfig) -> io::Result<Self> {
    #[cfg(windows)]
    let winsock = crate::sys::Guard::acquire()?;
    let driver = Native::new(&config)?;
    event!(
      Level::DEBUG,
      message = "event loop created",
      backend = driver.name(),
      entries = config.entries,
    );
    Ok(Self::assemble(
      Box::new(driver),
      config,
      #[cfg(windows)]
      winsock,
    ))
  }

  #[cfg(test)]
  pub(crate) fn with_driver(driver: Box<dyn Driver>) -> Self {
    Self::assemble(
      driver,
      LoopConfig::default(),
      #[cfg(windows)]
      crate::sys::Guard::acquire().expect("winsock start-up"),
    )
  }

  fn assemble(
    driver: Box<dyn Driver>,
    config: LoopConfig,
    #[cfg(windows)] winsock: crate::sys::Guard,
  ) -> Self {
    Self {
      inner: Rc::new(LoopInner {
        driver: RefCell::new(driver),
        registry: RefCell::new(Registry::new()),
        scratch: RefCell::new(Vec::new()),
        config,
        #[cfg(windows)]
        _winsock: winsock,
      }),
    }
  }

  pub(crate) fn inner(&self) -> &Rc<LoopInner> {
    &self.inner
  }

  pub fn config(&self) -> &LoopConfig {
    &self.inner.config
  }

  /// Flushes queued submissions, waits up to `timeout` (forever on `None`)
  /// and dispatches every available completion. Returns how many were
  /// dispatched.
  pub fn run_once(&self, timeout: Option<Duration>) -> io::Result<usize> {
    self.inner.run_once(timeout)
  }

  /// Drives the loop until `future` resolves.
  pub fn block_on<F: Future>(&self, future: F) -> io::Result<F::Output> {
    self
      .drive(future, None)?
      .ok_or_else(|| io::Error::from(io::ErrorKind::TimedOut))
  }

  /// Like [`EventLoop::block_on`], `None` once `timeout` has passed.
  pub fn block_on_timeout<F: Future>(
    &self,
    future: F,
    timeout: Duration,
  ) -> io::Result<Option<F::Output>> {
    self.drive(future, Some(Instant::now() + timeout))
  }

  fn drive<F: Future>(
    &self,
    future: F,
    deadline: Option<Instant>,
  ) -> io::Result<Option<F::Output>> {
    let mut future = pin!(future);
    let flag = Arc::new(Flag::default());
    let waker = flag.waker();
    let mut cx = Context::from_waker(&waker);
    let mut poll = true;

    loop {
      if poll {
        if let Poll::Ready(out) = future.as_mut().poll(&mut cx) {
          return Ok(Some(out));
        }
      }

      let mut wait = self.inner.config.poll_interval;
      if let Some(deadline) = deadline {
        let now = Instant::now();
        if now >= deadline {
          return Ok(None);
        }
        wait = wait.min(deadline - now);
      }

      self.run_once(Some(wait))?;
      poll = flag.take();
    }
  }
}

impl std::fmt::Debug for EventLoop {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("EventLoop")
      .field("backend", &self.inner.driver.borrow().name())
      .field("config", &self.inner.config)
      .finish()
  }
}
