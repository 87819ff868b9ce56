//! io_uring backend for Linux.
//!
//! Every buffer submits its own `RECVMSG`/`SENDMSG` tagged with the handler
//! id and buffer index, so completions route straight back to the buffer
//! without a lookup. Cancellation is an `ASYNC_CANCEL` request addressed by
//! that same tag.

use std::{io, mem, time::Duration};

use io_uring::{cqueue, opcode, squeue, types};
use tracing::{Level, event};

use super::{
  CancelIo, Completion, Driver, HandlerId, LoopConfig, Origin, Outcome,
  TransferIo,
};
use crate::{ip::Endpoint, sys::RawSocket};

const CONNECT: u32 = 0xFFFF_FFFE;
const CANCEL: u32 = 0xFFFF_FFFF;
/// Wake-up timeout on kernels without `IORING_FEAT_EXT_ARG`. No handler id
/// packs to this, the registry never hands out slot `0xFFFF`.
const TIMER: u64 = u64::MAX;

/// Packs handler id (high half) and origin (low half) into `user_data`.
fn pack(handler: HandlerId, origin: Origin) -> u64 {
  let tag = match origin {
    Origin::Slot(index) => index as u32,
    Origin::Connect => CONNECT,
    Origin::Cancel | Origin::Record(_) => CANCEL,
  };
  ((handler.as_u32() as u64) << 32) | tag as u64
}

fn unpack(user_data: u64) -> (HandlerId, Origin) {
  let handler = HandlerId::from_u32((user_data >> 32) as u32);
  let origin = match user_data as u32 {
    CONNECT => Origin::Connect,
    CANCEL => Origin::Cancel,
    tag => Origin::Slot(tag as u16),
  };
  (handler, origin)
}

/// Maps a CQE result to an outcome.
fn translate(res: i32) -> Outcome {
  if res >= 0 {
    return Outcome::success(res as usize);
  }
  match -res {
    libc::ECANCELED => Outcome::cancelled(Some(-res)),
    libc::EMSGSIZE => Outcome::oversize(0, Some(-res)),
    errno => Outcome::failed(Some(errno)),
  }
}

/// Message header of one buffer; the kernel reads it at submission and
/// writes the source address and flags back on receive.
pub(crate) struct SlotIo {
  msg: libc::msghdr,
  iov: libc::iovec,
}

impl SlotIo {
  pub fn new() -> Self {
    // SAFETY: msghdr and iovec are plain C structs, all-zero is valid.
    unsafe { mem::zeroed() }
  }

  /// Points the header at `len` bytes of `data` and, for connectionless
  /// devices, at the endpoint (`name_len` bytes of it).
  pub fn prepare(
    &mut self,
    data: *mut u8,
    len: usize,
    name: Option<(*mut Endpoint, usize)>,
  ) {
    self.iov = libc::iovec { iov_base: data.cast(), iov_len: len };
    // SAFETY: see `new`.
    self.msg = unsafe { mem::zeroed() };
    self.msg.msg_iov = &mut self.iov;
    self.msg.msg_iovlen = 1;
    if let Some((name, name_len)) = name {
      self.msg.msg_name = name.cast();
      self.msg.msg_namelen = name_len as libc::socklen_t;
    }
  }

  /// The received datagram was longer than the buffer.
  pub fn truncated(&self) -> bool {
    self.msg.msg_flags & libc::MSG_TRUNC != 0
  }

  pub fn record(&self) -> usize {
    self as *const Self as usize
  }
}

/// Destination of a stream connect, read by the kernel until completion.
pub(crate) struct ConnectIo {
  pub endpoint: Endpoint,
}

impl ConnectIo {
  pub fn new() -> Self {
    Self { endpoint: Endpoint::empty() }
  }

  pub fn record(&self) -> usize {
    self as *const Self as usize
  }
}

pub(crate) struct IoUring {
  ring: io_uring::IoUring,
  ext_arg: bool,
  timer: Box<types::Timespec>,
}

impl IoUring {
  pub fn new(config: &LoopConfig) -> io::Result<Self> {
    let ring = io_uring::IoUring::new(config.get_entries())?;
    let ext_arg = ring.params().is_feature_ext_arg();
    Ok(Self { ring, ext_arg, timer: Box::new(types::Timespec::new()) })
  }

  fn push(&mut self, entry: squeue::Entry) -> io::Result<()> {
    if self.ring.submission().is_full() {
      self.ring.submit()?;
    }
    // SAFETY: every entry references memory owned by a device record that
    // stays in place until the matching completion has been returned.
    unsafe { self.ring.submission().push(&entry) }.map_err(|_| {
      io::Error::new(io::ErrorKind::WouldBlock, "submission queue full")
    })
  }

  fn submit_and_wait(&mut self, timeout: Duration) -> io::Result<usize> {
    let timespec = types::Timespec::new()
      .sec(timeout.as_secs())
      .nsec(timeout.subsec_nanos());

    if self.ext_arg {
      let args = types::SubmitArgs::new().timespec(&timespec);
      return self.ring.submitter().submit_with_args(1, &args);
    }

    *self.timer = timespec;
    let entry = opcode::Timeout::new(&*self.timer).build().user_data(TIMER);
    self.push(entry)?;
    self.ring.submit_and_wait(1)
  }

  fn reap(&mut self, out: &mut Vec<Completion>) {
    for cqe in self.ring.completion() {
      if let Some(completion) = decode(&cqe) {
        out.push(completion);
      }
    }
  }
}

fn decode(cqe: &cqueue::Entry) -> Option<Completion> {
  if cqe.user_data() == TIMER {
    return None;
  }
  let (handler, origin) = unpack(cqe.user_data());
  let outcome = translate(cqe.result());
  event!(
    Level::TRACE,
    message = "cqe",
    handler = handler.as_u32(),
    origin = ?origin,
    res = cqe.result(),
  );
  Some(Completion { handler, origin, outcome })
}

impl Driver for IoUring {
  fn name(&self) -> &'static str {
    "io_uring"
  }

  fn register(
    &mut self,
    _socket: RawSocket,
    _handler: HandlerId,
  ) -> io::Result<()> {
    // submissions carry their own completion identity
    Ok(())
  }

  fn transfer(&mut self, transfer: TransferIo<'_>) -> io::Result<()> {
    let TransferIo { handler, index, socket, read, io } = transfer;
    // datagram receives report the full length; on streams MSG_TRUNC
    // would discard data
    let flags = if io.msg.msg_name.is_null() { 0 } else { libc::MSG_TRUNC };
    let msg: *mut libc::msghdr = &mut io.msg;
    let entry = if read {
      opcode::RecvMsg::new(types::Fd(socket), msg).flags(flags as u32).build()
    } else {
      opcode::SendMsg::new(types::Fd(socket), msg).build()
    };
    self.push(entry.user_data(pack(handler, Origin::Slot(index))))
  }

  fn connect(
    &mut self,
    handler: HandlerId,
    socket: RawSocket,
    io: &mut ConnectIo,
  ) -> io::Result<()> {
    let entry = opcode::Connect::new(
      types::Fd(socket),
      io.endpoint.as_ptr().cast::<libc::sockaddr>(),
      io.endpoint.len() as libc::socklen_t,
    )
    .build()
    .user_data(pack(handler, Origin::Connect));
    self.push(entry)
  }

  fn cancel(&mut self, target: CancelIo) -> io::Result<()> {
    let entry = opcode::AsyncCancel::new(pack(target.handler, target.origin))
      .build()
      .user_data(pack(target.handler, Origin::Cancel));
    self.push(entry)
  }

  fn flush(&mut self) -> io::Result<()> {
    self.ring.submit()?;
    Ok(())
  }

  fn wait(
    &mut self,
    timeout: Option<Duration>,
    out: &mut Vec<Completion>,
  ) -> io::Result<()> {
    let submitted = match timeout {
      None => self.ring.submit_and_wait(1),
      Some(timeout) if timeout.is_zero() => self.ring.submit(),
      Some(timeout) => self.submit_and_wait(timeout),
    };

    if let Err(err) = submitted {
      match err.raw_os_error() {
        Some(libc::ETIME) | Some(libc::EINTR) | Some(libc::EBUSY) => {}
        _ => return Err(err),
      }
    }

    self.reap(out);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn user_data_round_trip() {
    let handler = HandlerId::from_u32(0x0003_0007);
    for origin in [Origin::Slot(0), Origin::Slot(12), Origin::Connect] {
      assert_eq!(unpack(pack(handler, origin)), (handler, origin));
    }
    assert_eq!(unpack(pack(handler, Origin::Cancel)).1, Origin::Cancel);
    assert_ne!(pack(HandlerId::from_u32(0xFFFE_FFFE), Origin::Cancel), TIMER);
  }

  #[test]
  fn result_codes() {
    use crate::TransferResult;

    assert_eq!(translate(4), Outcome::success(4));
    assert_eq!(translate(-libc::ECANCELED).result, TransferResult::Cancelled);
    assert_eq!(translate(-libc::EMSGSIZE).result, TransferResult::Oversize);
    assert_eq!(
      translate(-libc::ECONNREFUSED),
      Outcome::failed(Some(libc::ECONNREFUSED))
    );
  }

  #[test]
  fn prepare_points_at_data() {
    let mut data = [0u8; 8];
    let mut name = Endpoint::empty();
    let name: *mut Endpoint = &mut name;
    let mut io = Box::new(SlotIo::new());
    io.prepare(data.as_mut_ptr(), 8, Some((name, Endpoint::capacity())));

    assert_eq!(io.msg.msg_iovlen, 1);
    assert_eq!(io.iov.iov_len, 8);
    assert_eq!(io.msg.msg_namelen as usize, Endpoint::capacity());
    assert!(!io.truncated());
  }

  #[test]
  fn init() {
    // io_uring may be disabled in sandboxes
    match IoUring::new(&LoopConfig::default()) {
      Ok(mut ring) => {
        let mut out = Vec::new();
        ring.wait(Some(Duration::ZERO), &mut out).unwrap();
        assert!(out.is_empty());
      }
      Err(err) => eprintln!("io_uring unavailable: {err}"),
    }
  }
}
