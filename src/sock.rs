/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Stream-socket transport shared by all channels.
 *
 * Each channel owns exactly one blocking stream socket. The event loop
 * bounds its per-event work with the kernel's bytes-available count
 * instead of switching the sockets to nonblocking mode; reads inside a
 * message are exact-length and may briefly block on fragment boundaries. */

use crate::tag;
use nix::errno::Errno;
use nix::libc;
use nix::sys::socket::{self, sockopt, MsgFlags, SockFlag, SockType};
use nix::unistd;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;

/** Where a session connects to. A port of zero selects a Unix stream
 * socket at the path given as host. */
#[derive(Debug, Clone)]
pub enum Dest {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

pub fn resolve_dest(host: &str, port: u16) -> Result<Dest, String> {
    if port == 0 {
        return Ok(Dest::Unix(PathBuf::from(host)));
    }
    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(|x| tag!("Failed to resolve {}:{}: {}", host, port, x))?;
    match addrs.next() {
        Some(a) => Ok(Dest::Tcp(a)),
        None => Err(tag!("No address found for {}:{}", host, port)),
    }
}

/** Connect a fresh stream socket to `dest`. TCP sockets get `NODELAY`
 * and `QUICKACK` so small input messages are not delayed by the stack. */
pub fn stream_connect(dest: &Dest) -> Result<OwnedFd, String> {
    match dest {
        Dest::Unix(path) => {
            let sock = socket::socket(
                socket::AddressFamily::Unix,
                SockType::Stream,
                SockFlag::SOCK_CLOEXEC,
                None,
            )
            .map_err(|x| tag!("Failed to create socket: {}", x))?;
            let addr = socket::UnixAddr::new(path.as_path())
                .map_err(|x| tag!("Failed to build Unix socket address {:?}: {}", path, x))?;
            socket::connect(sock.as_raw_fd(), &addr)
                .map_err(|x| tag!("Failed to connect to socket at {:?}: {}", path, x))?;
            Ok(sock)
        }
        Dest::Tcp(addr) => {
            let family = match addr {
                SocketAddr::V4(_) => socket::AddressFamily::Inet,
                SocketAddr::V6(_) => socket::AddressFamily::Inet6,
            };
            let sock = socket::socket(family, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)
                .map_err(|x| tag!("Failed to create socket: {}", x))?;
            set_nodelay(&sock, true)?;
            set_quickack(&sock, true)?;
            match addr {
                SocketAddr::V4(a) => {
                    socket::connect(sock.as_raw_fd(), &socket::SockaddrIn::from(*a))
                }
                SocketAddr::V6(a) => {
                    socket::connect(sock.as_raw_fd(), &socket::SockaddrIn6::from(*a))
                }
            }
            .map_err(|x| tag!("Failed to connect to {}: {}", addr, x))?;
            Ok(sock)
        }
    }
}

pub fn set_nodelay(sock: &OwnedFd, on: bool) -> Result<(), String> {
    socket::setsockopt(sock, sockopt::TcpNoDelay, &on)
        .map_err(|x| tag!("Failed to set TCP_NODELAY: {}", x))
}

/** nix does not wrap TCP_QUICKACK, so set it through libc. */
pub fn set_quickack(sock: &OwnedFd, on: bool) -> Result<(), String> {
    let flag: libc::c_int = on as libc::c_int;
    // SAFETY: the option value is a c_int and the length matches it;
    // setsockopt only reads within those bounds
    let r = unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_QUICKACK,
            &flag as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if r != 0 {
        return Err(tag!("Failed to set TCP_QUICKACK: {}", Errno::last()));
    }
    Ok(())
}

/** Number of bytes currently queued for reading on the socket. */
pub fn bytes_available(sock: &OwnedFd) -> Result<i32, String> {
    let mut avail: libc::c_int = 0;
    // SAFETY: FIONREAD writes a single c_int through the pointer
    let r = unsafe { libc::ioctl(sock.as_raw_fd(), libc::FIONREAD, &mut avail) };
    if r == -1 {
        return Err(tag!("FIONREAD failed: {}", Errno::last()));
    }
    Ok(avail)
}

/** Fill `buf` exactly. Returns Ok(true) iff the peer closed the stream
 * before any or all of the bytes arrived. `avail`, when provided, is
 * decremented by the number of bytes consumed and may go negative when a
 * message straddles what the kernel had reported ready. */
pub fn read_exact(
    sock: &OwnedFd,
    buf: &mut [u8],
    mut avail: Option<&mut i32>,
) -> Result<bool, String> {
    let mut filled = 0;
    while filled < buf.len() {
        match unistd::read(sock.as_raw_fd(), &mut buf[filled..]) {
            Ok(0) => return Ok(true),
            Ok(n) => {
                filled += n;
                if let Some(ref mut a) = avail {
                    **a -= n as i32;
                }
            }
            Err(Errno::EINTR) => continue,
            Err(x) => return Err(tag!("Read failed: {}", x)),
        }
    }
    Ok(false)
}

/** Consume and drop exactly `len` bytes. Same EOF convention as
 * `read_exact`. */
pub fn discard(sock: &OwnedFd, len: usize, mut avail: Option<&mut i32>) -> Result<bool, String> {
    let mut scratch = [0u8; 1024];
    let mut left = len;
    while left > 0 {
        let step = left.min(scratch.len());
        match unistd::read(sock.as_raw_fd(), &mut scratch[..step]) {
            Ok(0) => return Ok(true),
            Ok(n) => {
                left -= n;
                if let Some(ref mut a) = avail {
                    **a -= n as i32;
                }
            }
            Err(Errno::EINTR) => continue,
            Err(x) => return Err(tag!("Read failed while discarding: {}", x)),
        }
    }
    Ok(false)
}

/** Write one complete buffer. The protocol has no partial-write
 * recovery, so a short write is an error. */
pub fn send_all(sock: &OwnedFd, buf: &[u8]) -> Result<(), String> {
    let wrote = socket::send(sock.as_raw_fd(), buf, MsgFlags::empty())
        .map_err(|x| tag!("Send failed: {}", x))?;
    if wrote != buf.len() {
        return Err(tag!("Short write: {} of {} bytes", wrote, buf.len()));
    }
    Ok(())
}

pub fn shutdown_write(sock: &OwnedFd) {
    /* Best effort; the peer may already be gone */
    let _ = socket::shutdown(sock.as_raw_fd(), socket::Shutdown::Write);
}
