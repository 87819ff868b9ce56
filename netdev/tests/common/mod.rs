#![allow(dead_code)]

use std::time::Duration;

use netdev::{
  EventLoop,
  ip::{Endpoint, Family, v4, v6},
};

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// The native loop, or `None` when the kernel refuses to create it (e.g.
/// io_uring blocked by seccomp).
pub fn event_loop() -> Option<EventLoop> {
  match EventLoop::new() {
    Ok(lp) => Some(lp),
    Err(err) => {
      eprintln!("skipping, no completion facility: {err}");
      None
    }
  }
}

pub fn loopback(family: Family, port: u16) -> Endpoint {
  match family {
    Family::V4 => v4::Endpoint::new(v4::Address::LOCALHOST, port).into(),
    Family::V6 => v6::Endpoint::new(v6::Address::LOCALHOST, port).into(),
  }
}

pub fn payload(len: usize) -> Vec<u8> {
  let mut rng = fastrand::Rng::with_seed(len as u64);
  (0..len).map(|_| rng.u8(..)).collect()
}
