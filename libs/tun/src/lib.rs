//! A thin, blocking-free handle onto a TUN character device.
//!
//! Reads return exactly one L3 packet, writes accept exactly one. The caller
//! is responsible for multiplexing readiness (e.g. via `epoll`); every
//! operation here is non-blocking.

#[cfg(target_os = "linux")]
pub mod ioctl;
#[cfg(target_family = "unix")]
mod unix;

#[cfg(target_family = "unix")]
pub use unix::Tun;
