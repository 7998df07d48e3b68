//! Listening socket setup.
//!
//! std's `TcpListener::bind` neither sets `SO_REUSEADDR` on every
//! platform nor lets us pick the backlog, so the socket is built by
//! hand and then handed to std.

use std::io;
use std::net::{Ipv4Addr, TcpListener};
use std::os::unix::io::FromRawFd;

/// Bind `addr:port` (port 0 picks an ephemeral port) and start
/// listening. The returned listener is non-blocking.
pub fn bind_listener(addr: Ipv4Addr, port: u16, backlog: i32) -> io::Result<TcpListener> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let fail = |fd: i32| {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        err
    };

    let opt: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &opt as *const _ as *const libc::c_void,
            std::mem::size_of_val(&opt) as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(fail(fd));
    }

    let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_addr.s_addr = u32::from(addr).to_be();
    sin.sin_port = port.to_be();

    let ret = unsafe {
        libc::bind(
            fd,
            &sin as *const _ as *const libc::sockaddr,
            std::mem::size_of_val(&sin) as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(fail(fd));
    }

    if unsafe { libc::listen(fd, backlog) } != 0 {
        return Err(fail(fd));
    }

    let listener = unsafe { TcpListener::from_raw_fd(fd) };
    listener.set_nonblocking(true)?;
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;

    #[test]
    fn test_ephemeral_bind_accepts() {
        let listener = bind_listener(Ipv4Addr::LOCALHOST, 0, 16).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let _client = TcpStream::connect(addr).unwrap();
        // Non-blocking accept may race the handshake; retry briefly.
        let mut accepted = None;
        for _ in 0..200 {
            match listener.accept() {
                Ok(pair) => {
                    accepted = Some(pair);
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        }
        assert!(accepted.is_some());
    }

    #[test]
    fn test_reuseaddr_rebind() {
        let first = bind_listener(Ipv4Addr::LOCALHOST, 0, 16).unwrap();
        let port = first.local_addr().unwrap().port();
        drop(first);
        let again = bind_listener(Ipv4Addr::LOCALHOST, port, 16).unwrap();
        assert_eq!(again.local_addr().unwrap().port(), port);
    }
}
