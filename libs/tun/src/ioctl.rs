use std::{io, os::fd::RawFd};

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

/// The `TUNSETIFF` request that turns a fresh `/dev/net/tun` fd into a
/// named, packet-per-read TUN device.
///
/// Layout matches the kernel's `struct ifreq` with the flags payload.
#[repr(C)]
pub struct SetTunFlagsRequest {
    name: [std::ffi::c_uchar; libc::IF_NAMESIZE],
    flags: std::ffi::c_short,
}

impl SetTunFlagsRequest {
    pub fn new(name: &str) -> Self {
        let name_as_bytes = name.as_bytes();
        debug_assert!(name_as_bytes.len() < libc::IF_NAMESIZE);

        let mut padded = [0u8; libc::IF_NAMESIZE];
        padded[..name_as_bytes.len()].copy_from_slice(name_as_bytes);

        Self {
            name: padded,
            flags: (libc::IFF_TUN | libc::IFF_NO_PI) as _,
        }
    }

    /// Executes the request against `fd`.
    ///
    /// # Safety
    ///
    /// The file descriptor must be open.
    pub unsafe fn exec(&mut self, fd: RawFd) -> io::Result<()> {
        let ret = unsafe { libc::ioctl(fd, TUNSETIFF as _, self) };

        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }
}
