//! Socket helpers shared by both transports.

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsFd, AsRawFd, RawFd};

/// Create a non-blocking TCP listener bound to `addr`.
pub fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(
        match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        },
        Type::STREAM,
        Some(Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;

    Ok(socket.into())
}

/// Free room in the kernel send buffer of `stream`.
///
/// Computed as `SO_SNDBUF` minus the bytes still queued for sending.
/// Returns 0 if the socket cannot be queried.
pub fn send_space<S: AsFd>(stream: &S) -> usize {
    let sock = SockRef::from(stream);
    let capacity = match sock.send_buffer_size() {
        Ok(n) => n,
        Err(_) => return 0,
    };
    match queued_bytes(stream.as_fd().as_raw_fd()) {
        Ok(queued) => capacity.saturating_sub(queued),
        Err(_) => 0,
    }
}

/// Shut down both directions of `stream`, ignoring already-closed sockets.
pub fn shutdown<S: AsFd>(stream: &S) {
    let _ = SockRef::from(stream).shutdown(Shutdown::Both);
}

#[cfg(target_os = "linux")]
fn queued_bytes(fd: RawFd) -> io::Result<usize> {
    let mut queued: libc::c_int = 0;
    // SAFETY: TIOCOUTQ writes a single c_int through the provided pointer.
    let rc = unsafe { libc::ioctl(fd, libc::TIOCOUTQ, &mut queued as *mut libc::c_int) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(queued.max(0) as usize)
}

#[cfg(target_os = "macos")]
fn queued_bytes(fd: RawFd) -> io::Result<usize> {
    let mut queued: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: SO_NWRITE writes a single c_int and its length.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_NWRITE,
            &mut queued as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(queued.max(0) as usize)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn queued_bytes(_fd: RawFd) -> io::Result<usize> {
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::FRAME_LEN;
    use std::net::TcpStream;

    #[test]
    fn test_fresh_socket_has_room_for_a_line() {
        let listener = create_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).unwrap();
        assert!(send_space(&client) >= FRAME_LEN);
    }
}
