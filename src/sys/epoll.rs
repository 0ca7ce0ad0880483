use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use std::{cmp, i32};

use libc::{self, c_int};
use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

use super::syscall;
use crate::ready::Interest;
use crate::token::Token;

/// A direct `epoll_create1`/`epoll_ctl`/`epoll_wait` wrapper.
///
/// No `id()` / cross-`Poll` registration guard here: the process runs
/// exactly one `Epoll` on one thread, so a handle can never be registered
/// against the wrong instance.
pub struct Epoll {
    epfd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Epoll> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(Epoll { epfd })
    }

    /// Blocks for up to `timeout` waiting for readiness on any registered
    /// fd. `None` blocks indefinitely; this crate always passes a 1s
    /// ceiling so the reaper and factory get a chance to run even when
    /// nothing is ready.
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout = timeout
            .map(|to| cmp::min(to.as_millis(), i32::MAX as u128) as c_int)
            .unwrap_or(-1);

        let cnt = syscall!(epoll_wait(
            self.epfd,
            events.events.as_mut_ptr(),
            events.events.capacity() as i32,
            timeout
        ))?;

        unsafe { events.events.set_len(cnt as usize) };

        Ok(cnt as usize)
    }

    pub fn add(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: usize::from(token) as u64,
        };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut info))?;
        Ok(())
    }

    /// Changes the interest mask of an already-registered fd without losing
    /// its slot — used when a probe moves e.g. from waiting on writable
    /// (`INITIATED`) to waiting on readable (`SENT_CONNECT`).
    pub fn modify(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: usize::from(token) as u64,
        };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut info))?;
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let mut info = libc::epoll_event { events: 0, u64: 0 };
        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut info))?;
        Ok(())
    }
}

fn interest_to_epoll(interest: Interest) -> u32 {
    let mut kind = 0;

    if interest.is_readable() {
        kind |= EPOLLIN;
    }

    if interest.is_writable() {
        kind |= EPOLLOUT;
    }

    if interest.is_hup() {
        kind |= EPOLLRDHUP;
    }

    // Error and hangup are always reported regardless of interest; the
    // kernel delivers EPOLLERR/EPOLLHUP unconditionally, there is no mask
    // bit to request them explicitly.
    kind as u32
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.epfd);
        }
    }
}

/// A readiness event: which handle (`Token`) became ready for which
/// operations (`Interest`).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Event {
    token: Token,
    interest: Interest,
}

impl Event {
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }
}

pub struct Events {
    events: Vec<libc::epoll_event>,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Events {
        Events {
            events: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<Event> {
        self.events.get(idx).map(|raw| {
            let epoll = raw.events as c_int;
            let mut interest = Interest::empty();

            if (epoll & EPOLLIN) != 0 || (epoll & EPOLLPRI) != 0 {
                interest = interest | Interest::readable();
            }

            if (epoll & EPOLLOUT) != 0 {
                interest = interest | Interest::writable();
            }

            if (epoll & EPOLLERR) != 0 {
                interest = interest | Interest::error();
            }

            if (epoll & EPOLLRDHUP) != 0 || (epoll & EPOLLHUP) != 0 {
                interest = interest | Interest::hup();
            }

            Event {
                token: Token(raw.u64 as usize),
                interest,
            }
        })
    }

    pub fn iter(&self) -> EventsIter {
        EventsIter { events: self, pos: 0 }
    }
}

impl<'a> IntoIterator for &'a Events {
    type Item = Event;
    type IntoIter = EventsIter<'a>;

    fn into_iter(self) -> EventsIter<'a> {
        self.iter()
    }
}

pub struct EventsIter<'a> {
    events: &'a Events,
    pos: usize,
}

impl<'a> Iterator for EventsIter<'a> {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        let ev = self.events.get(self.pos);
        self.pos += 1;
        ev
    }
}
