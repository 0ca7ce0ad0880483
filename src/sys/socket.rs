use std::io;
use std::time::Duration;

use socket2::Socket;

/// Applies the same socket hygiene to outbound and accepted sockets alike:
/// non-blocking, keep-alive off, hard-reset linger (no `TIME_WAIT` pileup),
/// low-delay IP ToS. Issued through `socket2::Socket` rather than raw
/// `setsockopt`-via-`libc`, since `socket2` already exposes exactly these
/// calls portably.
pub fn harden_socket(sock: &Socket) -> io::Result<()> {
    sock.set_nonblocking(true)?;
    sock.set_keepalive(false)?;
    // SO_LINGER(on=1, linger=0): close() sends RST immediately instead of
    // lingering in TIME_WAIT.
    sock.set_linger(Some(Duration::from_secs(0)))?;
    sock.set_tos(IPTOS_LOWDELAY)?;
    Ok(())
}

const IPTOS_LOWDELAY: u32 = 0x10;

/// Requests a bounded SYN retry count on an outbound socket, so a dead
/// candidate fails fast instead of riding out the kernel's full default SYN
/// backoff. Linux-only; absence of the option is not fatal, the caller only
/// logs a warning and relies on whatever SYN behavior the kernel gives it
/// instead.
#[cfg(target_os = "linux")]
pub fn set_syn_retries(sock: &socket2::Socket, retries: u32) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let retries = retries as libc::c_int;
    crate::sys::syscall!(setsockopt(
        sock.as_raw_fd(),
        libc::IPPROTO_TCP,
        libc::TCP_SYNCNT,
        &retries as *const _ as *const libc::c_void,
        std::mem::size_of::<libc::c_int>() as libc::socklen_t
    ))?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_syn_retries(_sock: &socket2::Socket, _retries: u32) -> io::Result<()> {
    Ok(())
}
