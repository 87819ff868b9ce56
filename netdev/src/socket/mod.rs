//! Socket flavours of [`Device`](crate::Device).
//!
//! - [`IpSocket`]: one fixed peer, buffers carry payload only.
//! - [`UdpSocket`]: every buffer carries its own peer endpoint.

mod ip_socket;
mod udp_socket;

pub use ip_socket::IpSocket;
pub use udp_socket::UdpSocket;
