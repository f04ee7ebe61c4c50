//! TCP echo server on Weft fibers.
//!
//! One fiber accepts connections (multishot accept on io_uring); each
//! connection gets its own fiber echoing bytes until the peer closes.
//!
//! ```sh
//! echo [port]        # default 9999
//! ```

use std::os::unix::io::RawFd;

use log::info;

use weft::prelude::*;

fn listen(port: u16) -> weft::Result<RawFd> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(Error::last_os_error());
    }
    let one: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
    let addr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr {
            s_addr: libc::INADDR_ANY.to_be(),
        },
        sin_zero: [0; 8],
    };
    let ret = unsafe {
        libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(Error::last_os_error());
    }
    if unsafe { libc::listen(fd, 128) } != 0 {
        return Err(Error::last_os_error());
    }
    Ok(fd)
}

fn echo(conn: RawFd) -> weft::Result<()> {
    let mut buf = Vec::with_capacity(8192);
    loop {
        buf.clear();
        let n = io::recv(conn, &mut buf, 8192)?;
        if n == 0 {
            break;
        }
        io::send(conn, &buf, 0)?;
    }
    io::close(conn)
}

fn main() -> weft::Result<()> {
    env_logger::init();
    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(9999);

    weft::run_default(move || {
        let listener = listen(port)?;
        info!("echo server on 0.0.0.0:{} ({:?})", port, weft::kind()?);

        io::accept_loop(listener, |conn| {
            weft::spawn(move || echo(conn))?;
            Ok(())
        })
    })
}
