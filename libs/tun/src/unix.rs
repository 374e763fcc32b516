use anyhow::{Context as _, Result};
use std::io::{self, IoSlice};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd as _, OwnedFd, RawFd};

#[cfg(target_os = "linux")]
use crate::ioctl;

#[cfg(target_os = "linux")]
const TUN_DEV: &std::ffi::CStr = c"/dev/net/tun";

/// A non-blocking TUN device.
#[derive(Debug)]
pub struct Tun {
    fd: OwnedFd,
    name: String,
}

impl Tun {
    /// Creates a new TUN device with the given interface name.
    ///
    /// Requires `CAP_NET_ADMIN`. The device disappears once the returned
    /// handle is dropped.
    #[cfg(target_os = "linux")]
    pub fn create(name: &str) -> Result<Self> {
        anyhow::ensure!(
            name.len() < libc::IF_NAMESIZE,
            "interface name `{name}` exceeds {} bytes",
            libc::IF_NAMESIZE - 1
        );

        let fd = match unsafe { libc::open(TUN_DEV.as_ptr(), libc::O_RDWR) } {
            -1 => {
                return Err(io::Error::last_os_error()).context("Failed to open /dev/net/tun");
            }
            fd => unsafe { OwnedFd::from_raw_fd(fd) },
        };

        let mut req = ioctl::SetTunFlagsRequest::new(name);
        unsafe { req.exec(fd.as_raw_fd()) }.context("Failed to set TUN interface flags")?;

        set_non_blocking(fd.as_raw_fd()).context("Failed to make TUN device non-blocking")?;

        Ok(Self {
            fd,
            name: name.to_owned(),
        })
    }

    /// Wraps an already-configured TUN file descriptor.
    ///
    /// The fd must deliver one whole L3 packet per read and accept one whole
    /// L3 packet per write. It is switched to non-blocking mode here.
    pub fn from_fd(fd: OwnedFd) -> Result<Self> {
        set_non_blocking(fd.as_raw_fd()).context("Failed to make TUN fd non-blocking")?;

        Ok(Self {
            fd,
            name: "tun".to_owned(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reads one packet; `Ok(0)` means the device is gone.
    pub fn read(&self, dst: &mut [u8]) -> io::Result<usize> {
        match unsafe { libc::read(self.fd.as_raw_fd(), dst.as_mut_ptr() as _, dst.len()) } {
            -1 => Err(io::Error::last_os_error()),
            n => Ok(n as usize),
        }
    }

    /// Writes one packet from a contiguous buffer.
    pub fn write(&self, src: &[u8]) -> io::Result<usize> {
        match unsafe { libc::write(self.fd.as_raw_fd(), src.as_ptr() as _, src.len()) } {
            -1 => Err(io::Error::last_os_error()),
            n => Ok(n as usize),
        }
    }

    /// Writes one packet gathered from several buffers.
    ///
    /// [`IoSlice`] is ABI-compatible with `iovec`, so the slices go straight
    /// to the kernel.
    pub fn write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        match unsafe {
            libc::writev(
                self.fd.as_raw_fd(),
                bufs.as_ptr().cast(),
                bufs.len() as libc::c_int,
            )
        } {
            -1 => Err(io::Error::last_os_error()),
            n => Ok(n as usize),
        }
    }
}

impl AsRawFd for Tun {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for Tun {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

fn set_non_blocking(fd: RawFd) -> io::Result<()> {
    match unsafe { libc::fcntl(fd, libc::F_GETFL) } {
        -1 => Err(io::Error::last_os_error()),
        flags => match unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } {
            -1 => Err(io::Error::last_os_error()),
            _ => Ok(()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixDatagram;

    #[test]
    fn wrapped_fd_round_trips_a_packet() {
        let (ours, theirs) = UnixDatagram::pair().unwrap();
        let tun = Tun::from_fd(ours.into()).unwrap();

        tun.write(b"one packet").unwrap();

        let mut buf = [0u8; 64];
        let n = theirs.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"one packet");
    }

    #[test]
    fn vectored_write_emits_a_single_packet() {
        let (ours, theirs) = UnixDatagram::pair().unwrap();
        let tun = Tun::from_fd(ours.into()).unwrap();

        let n = tun
            .write_vectored(&[IoSlice::new(b"head-"), IoSlice::new(b"tail")])
            .unwrap();
        assert_eq!(n, 9);

        let mut buf = [0u8; 64];
        let n = theirs.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"head-tail");
    }

    #[test]
    fn wrapped_fd_is_non_blocking() {
        let (ours, _theirs) = UnixDatagram::pair().unwrap();
        let tun = Tun::from_fd(ours.into()).unwrap();

        let mut buf = [0u8; 64];
        let err = tun.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
