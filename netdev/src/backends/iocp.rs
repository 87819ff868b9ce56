//! I/O completion port backend for Windows.
//!
//! Sockets are associated with the port once, keyed by the handler id of the
//! owning device. Every operation carries an `OVERLAPPED` embedded at the
//! start of its record; the port returns that address and the device finds
//! the matching record itself.

use std::{ffi::c_void, io, mem, ptr, time::Duration};

use tracing::{Level, event};
use windows_sys::{
  Win32::{
    Foundation::{
      CloseHandle, ERROR_MORE_DATA, ERROR_OPERATION_ABORTED, FALSE,
      GetLastError, HANDLE, INVALID_HANDLE_VALUE, WAIT_TIMEOUT,
    },
    Networking::WinSock::{
      LPFN_CONNECTEX, SIO_GET_EXTENSION_FUNCTION_POINTER, SOCKADDR,
      SOCKET_ERROR, SOL_SOCKET, SO_UPDATE_CONNECT_CONTEXT, WSA_IO_PENDING,
      WSABUF, WSAEMSGSIZE, WSAGetLastError, WSAID_CONNECTEX, WSAIoctl,
      WSARecv, WSARecvFrom, WSASend, WSASendTo, setsockopt,
    },
    System::IO::{
      CancelIoEx, CreateIoCompletionPort, GetQueuedCompletionStatus,
      OVERLAPPED,
    },
  },
  core::GUID,
};

use super::{
  CancelIo, Completion, Driver, HandlerId, LoopConfig, Origin, Outcome,
  TransferIo,
};
use crate::{
  ip::Endpoint,
  sys::{RawSocket, last_error},
};

/// Completions taken per `wait`.
const BATCH: usize = 256;

/// Maps a Win32/Winsock error code of a completed operation.
fn translate(code: u32, transferred: usize) -> Outcome {
  match code {
    0 => Outcome::success(transferred),
    ERROR_OPERATION_ABORTED => Outcome::cancelled(Some(code as i32)),
    ERROR_MORE_DATA => Outcome::oversize(transferred, Some(code as i32)),
    code if code == WSAEMSGSIZE as u32 => {
      Outcome::oversize(transferred, Some(code as i32))
    }
    code => Outcome::failed(Some(code as i32)),
  }
}

/// `OVERLAPPED` record of one buffer, plus the Winsock parameters that have
/// to stay alive while the operation is pending.
#[repr(C)]
pub(crate) struct SlotIo {
  overlapped: OVERLAPPED,
  buf: WSABUF,
  flags: u32,
  name_len: i32,
  name: *mut Endpoint,
}

impl SlotIo {
  pub fn new() -> Self {
    // SAFETY: plain C data, all-zero is valid.
    unsafe { mem::zeroed() }
  }

  pub fn prepare(
    &mut self,
    data: *mut u8,
    len: usize,
    name: Option<(*mut Endpoint, usize)>,
  ) {
    // SAFETY: see `new`.
    self.overlapped = unsafe { mem::zeroed() };
    self.buf = WSABUF { len: len as u32, buf: data };
    self.flags = 0;
    (self.name, self.name_len) = match name {
      Some((name, len)) => (name, len as i32),
      None => (ptr::null_mut(), 0),
    };
  }

  /// Truncation is reported through the completion status instead.
  pub fn truncated(&self) -> bool {
    false
  }

  pub fn record(&self) -> usize {
    self as *const Self as usize
  }
}

#[repr(C)]
pub(crate) struct ConnectIo {
  overlapped: OVERLAPPED,
  pub endpoint: Endpoint,
}

impl ConnectIo {
  pub fn new() -> Self {
    // SAFETY: plain C data, all-zero is valid.
    let mut io: Self = unsafe { mem::zeroed() };
    io.endpoint = Endpoint::empty();
    io
  }

  pub fn record(&self) -> usize {
    self as *const Self as usize
  }
}

pub(crate) struct Iocp {
  port: HANDLE,
  connect_ex: LPFN_CONNECTEX,
}

impl Iocp {
  pub fn new(_config: &LoopConfig) -> io::Result<Self> {
    // SAFETY: creates a fresh port, no handle is associated yet.
    let port = unsafe {
      CreateIoCompletionPort(INVALID_HANDLE_VALUE, ptr::null_mut(), 0, 1)
    };
    if port.is_null() {
      return Err(io::Error::last_os_error());
    }
    Ok(Self { port, connect_ex: None })
  }

  /// `ConnectEx` is an extension function, resolved through the socket.
  fn connect_ex(&mut self, socket: RawSocket) -> io::Result<LPFN_CONNECTEX> {
    if self.connect_ex.is_some() {
      return Ok(self.connect_ex);
    }
    let guid: GUID = WSAID_CONNECTEX;
    let mut function: LPFN_CONNECTEX = None;
    let mut bytes = 0u32;
    // SAFETY: in and out buffers are valid for their sizes.
    let status = unsafe {
      WSAIoctl(
        socket,
        SIO_GET_EXTENSION_FUNCTION_POINTER,
        (&guid as *const GUID).cast::<c_void>(),
        mem::size_of::<GUID>() as u32,
        (&mut function as *mut LPFN_CONNECTEX).cast::<c_void>(),
        mem::size_of::<LPFN_CONNECTEX>() as u32,
        &mut bytes,
        ptr::null_mut(),
        None,
      )
    };
    if status == SOCKET_ERROR {
      return Err(last_error());
    }
    self.connect_ex = function;
    Ok(function)
  }

  /// Takes one completion, `None` on timeout.
  fn dequeue(&mut self, millis: u32) -> io::Result<Option<Completion>> {
    let mut transferred = 0u32;
    let mut key = 0usize;
    let mut overlapped: *mut OVERLAPPED = ptr::null_mut();
    // SAFETY: out parameters point to locals.
    let ok = unsafe {
      GetQueuedCompletionStatus(
        self.port,
        &mut transferred,
        &mut key,
        &mut overlapped,
        millis,
      )
    };

    if overlapped.is_null() {
      // nothing dequeued
      // SAFETY: plain FFI call.
      let code = unsafe { GetLastError() };
      return if ok == FALSE && code != WAIT_TIMEOUT {
        Err(io::Error::from_raw_os_error(code as i32))
      } else {
        Ok(None)
      };
    }

    // SAFETY: plain FFI call.
    let code = if ok == FALSE { unsafe { GetLastError() } } else { 0 };
    let outcome = translate(code, transferred as usize);
    event!(
      Level::TRACE,
      message = "completion",
      key,
      code,
      transferred,
    );
    Ok(Some(Completion {
      handler: HandlerId::from_u32(key as u32),
      origin: Origin::Record(overlapped as usize),
      outcome,
    }))
  }
}

/// `Ok` if the call started an overlapped operation; a synchronous success
/// still posts a completion.
fn started(status: i32) -> io::Result<()> {
  if status == 0 {
    return Ok(());
  }
  // SAFETY: plain FFI call.
  match unsafe { WSAGetLastError() } {
    WSA_IO_PENDING => Ok(()),
    code => Err(io::Error::from_raw_os_error(code)),
  }
}

impl Driver for Iocp {
  fn name(&self) -> &'static str {
    "iocp"
  }

  fn register(
    &mut self,
    socket: RawSocket,
    handler: HandlerId,
  ) -> io::Result<()> {
    // SAFETY: associates an owned socket with our port.
    let port = unsafe {
      CreateIoCompletionPort(
        socket as HANDLE,
        self.port,
        handler.as_u32() as usize,
        0,
      )
    };
    if port.is_null() {
      return Err(io::Error::last_os_error());
    }
    Ok(())
  }

  fn transfer(&mut self, transfer: TransferIo<'_>) -> io::Result<()> {
    let TransferIo { socket, read, io, .. } = transfer;
    let overlapped: *mut OVERLAPPED = &mut io.overlapped;
    // SAFETY: the record, its buffer and endpoint stay in place until the
    // completion has been dequeued.
    let status = unsafe {
      match (read, io.name.is_null()) {
        (true, true) => WSARecv(
          socket,
          &io.buf,
          1,
          ptr::null_mut(),
          &mut io.flags,
          overlapped,
          None,
        ),
        (true, false) => WSARecvFrom(
          socket,
          &io.buf,
          1,
          ptr::null_mut(),
          &mut io.flags,
          io.name.cast::<SOCKADDR>(),
          &mut io.name_len,
          overlapped,
          None,
        ),
        (false, true) => {
          WSASend(socket, &io.buf, 1, ptr::null_mut(), 0, overlapped, None)
        }
        (false, false) => WSASendTo(
          socket,
          &io.buf,
          1,
          ptr::null_mut(),
          0,
          io.name.cast::<SOCKADDR>(),
          io.name_len,
          overlapped,
          None,
        ),
      }
    };
    started(status)
  }

  fn connect(
    &mut self,
    _handler: HandlerId,
    socket: RawSocket,
    io: &mut ConnectIo,
  ) -> io::Result<()> {
    let Some(connect_ex) = self.connect_ex(socket)? else {
      return Err(io::Error::from(io::ErrorKind::Unsupported));
    };
    // SAFETY: see `new`.
    io.overlapped = unsafe { mem::zeroed() };
    // SAFETY: the record stays in place until the completion is dequeued.
    let ok = unsafe {
      connect_ex(
        socket,
        io.endpoint.as_ptr().cast::<SOCKADDR>(),
        io.endpoint.len() as i32,
        ptr::null(),
        0,
        ptr::null_mut(),
        &mut io.overlapped,
      )
    };
    if ok != FALSE {
      return Ok(());
    }
    started(SOCKET_ERROR)
  }

  fn connected(&mut self, socket: RawSocket) -> io::Result<()> {
    // SAFETY: option without a value.
    let status = unsafe {
      setsockopt(socket, SOL_SOCKET, SO_UPDATE_CONNECT_CONTEXT, ptr::null(), 0)
    };
    if status == SOCKET_ERROR { Err(last_error()) } else { Ok(()) }
  }

  fn cancel(&mut self, target: CancelIo) -> io::Result<()> {
    // SAFETY: the record address was produced by the device for an
    // operation on this socket.
    let ok = unsafe {
      CancelIoEx(target.socket as HANDLE, target.record as *const OVERLAPPED)
    };
    if ok == FALSE {
      return Err(io::Error::last_os_error());
    }
    Ok(())
  }

  fn flush(&mut self) -> io::Result<()> {
    // calls are issued immediately
    Ok(())
  }

  fn wait(
    &mut self,
    timeout: Option<Duration>,
    out: &mut Vec<Completion>,
  ) -> io::Result<()> {
    let millis = match timeout {
      None => u32::MAX,
      Some(timeout) => timeout.as_millis().min(u32::MAX as u128 - 1) as u32,
    };

    let Some(first) = self.dequeue(millis)? else {
      return Ok(());
    };
    out.push(first);

    while out.len() < BATCH {
      match self.dequeue(0)? {
        Some(next) => out.push(next),
        None => break,
      }
    }
    Ok(())
  }
}

impl Drop for Iocp {
  fn drop(&mut self) {
    // SAFETY: the port is owned and closed exactly once.
    unsafe { CloseHandle(self.port) };
  }
}
