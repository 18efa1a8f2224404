use std::{
    io,
    net::{SocketAddr, TcpListener},
    os::fd::FromRawFd,
};

/// Builds the master listening socket with `SO_REUSEADDR` + `SO_KEEPALIVE`
/// set before `bind`, then `listen` with an explicit backlog — none of
/// which `std::net::TcpListener::bind` exposes on its own, so this drops
/// to `libc` directly for the socket setup.
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let SocketAddr::V4(v4_addr) = addr else {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("IPv6 listener binding is not supported: {addr}"),
        ));
    };
    let family = libc::AF_INET;

    // SAFETY: `socket` either returns a valid owned fd or -1; checked below.
    let fd = unsafe { libc::socket(family, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let on: libc::c_int = 1;
    // SAFETY: fd is valid and open, `on` lives for the call.
    let err = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            std::ptr::addr_of!(on).cast(),
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if err < 0 {
        let e = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(e);
    }
    // SAFETY: same as above.
    let err = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            std::ptr::addr_of!(on).cast(),
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if err < 0 {
        let e = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(e);
    }

    let (sockaddr, socklen) = to_sockaddr(v4_addr);
    // SAFETY: `sockaddr`'s storage is valid for `socklen` bytes for the
    // duration of this call.
    let err = unsafe { libc::bind(fd, std::ptr::addr_of!(sockaddr).cast(), socklen) };
    if err < 0 {
        let e = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(e);
    }

    // SAFETY: fd is a valid, bound stream socket.
    let err = unsafe { libc::listen(fd, backlog) };
    if err < 0 {
        let e = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(e);
    }

    // SAFETY: fd was just created above and is not owned elsewhere yet.
    Ok(unsafe { TcpListener::from_raw_fd(fd) })
}

fn to_sockaddr(v4: std::net::SocketAddrV4) -> (libc::sockaddr_in, libc::socklen_t) {
    let sockaddr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: v4.port().to_be(),
        sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(v4.ip().octets()) },
        sin_zero: [0; 8],
        #[cfg(target_os = "macos")]
        sin_len: 0,
    };
    (sockaddr, size_of::<libc::sockaddr_in>() as libc::socklen_t)
}
