#![cfg_attr(docsrs, feature(doc_cfg))]

//! # netdev - completion-driven network devices
//!
//! A [`Device`] is a socket with a fixed pool of transfer [`Buffer`]s. Each
//! buffer runs one send or receive at a time; the operation is handed to the
//! kernel's completion facility and the buffer is resumed when the kernel
//! reports the result. There is no thread per operation and no readiness
//! polling.
//!
//! ## Platform support
//!
//! | Platform | I/O Mechanism         |
//! |----------|-----------------------|
//! | Linux    | io_uring              |
//! | Windows  | I/O completion ports  |
//!
//! ## Quick Start
//!
//! ```no_run
//! use netdev::{EventLoop, PoolConfig, UdpSocket};
//! use netdev::ip::{Endpoint, Family, v6};
//!
//! let lp = EventLoop::new()?;
//! let socket = UdpSocket::new(&lp, PoolConfig::default())?;
//! socket.open(Family::V6, 1337)?;
//!
//! let tx = socket.buffer(1).unwrap();
//! tx.set_header(&v6::Endpoint::new(v6::Address::LOCALHOST, 1337).into())?;
//! tx.write(b"ping")?;
//!
//! let rx = socket.buffer(0).unwrap();
//! rx.read()?;
//! let done = lp.block_on(rx.ready())?;
//! assert_eq!(done.size, 4);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Threading
//!
//! Everything is single threaded: an [`EventLoop`], its devices and their
//! buffers live on the thread that created the loop. Completions are
//! dispatched from [`EventLoop::run_once`], which [`EventLoop::block_on`]
//! drives for you.
//!
//! ## Errors
//!
//! Misuse (starting a busy buffer, cancelling an idle one) and socket setup
//! failures are returned as [`Error`]. A transfer that fails or is cancelled
//! is not an error: the buffer becomes ready again and reports a
//! [`TransferResult`].

#[cfg(not(any(linux, windows)))]
compile_error!("netdev supports Linux (io_uring) and Windows (IOCP) only");

mod backends;
mod device;
mod error;
pub mod ip;
mod op;
mod signal;
mod socket;
mod sys;

pub use backends::{EventLoop, LoopConfig};
pub use device::{Buffer, BufferReady, Changed, Device, PoolConfig, Until};
pub use error::{Error, Result};
pub use op::{BufferState, DeviceState, Op, Transfer, TransferResult};
pub use socket::{IpSocket, UdpSocket};
pub use sys::Protocol;
