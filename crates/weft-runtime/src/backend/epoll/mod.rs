//! Readiness-based backend on epoll.
//!
//! Every op attempts its syscall non-blockingly; on EAGAIN it registers
//! interest for the fd and direction, parks, and retries when the fd
//! reports ready. Timers come from a deadline heap that feeds the epoll
//! wait timeout; the cross-thread notifier eventfd is a permanent member
//! of the interest set.

pub mod timers;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::warn;
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use slab::Slab;

use weft_core::{Error, FiberId, Resume, Result, TraceEvent};

use crate::backend::Backend;
use crate::fiber::{current_fiber, FiberArena};
use crate::notifier::Inbox;
use crate::runtime::{try_with_rt, Runtime};
use crate::scheduler::{backend_await, schedule_raw, snooze, Base};

use timers::{TimerHandle, TimerHeap};

/// Reserved epoll token for the cross-thread notifier.
const NOTIFIER_TOKEN: u64 = 0;

const RELAY_CHUNK: usize = 1 << 16;

struct FdInterest {
    fd: RawFd,
    read: Option<FiberId>,
    write: Option<FiberId>,
}

pub(crate) struct EpollBackend {
    epoll: Epoll,
    /// fd → interest slab key; epoll token is the key + 1.
    registry: HashMap<RawFd, usize>,
    interests: Slab<FdInterest>,
    timers: TimerHeap,
    inbox: Arc<Inbox>,
    /// fds already switched to O_NONBLOCK, to skip the fcntl pair on hot
    /// paths.
    nonblock: HashSet<RawFd>,
    events: Vec<EpollEvent>,
}

fn borrowed(fd: RawFd) -> BorrowedFd<'static> {
    unsafe { BorrowedFd::borrow_raw(fd) }
}

impl EpollBackend {
    pub(crate) fn new(inbox: Arc<Inbox>) -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(errno_err)?;
        epoll
            .add(
                borrowed(inbox.notifier.fd()),
                EpollEvent::new(EpollFlags::EPOLLIN, NOTIFIER_TOKEN),
            )
            .map_err(errno_err)?;
        Ok(Self {
            epoll,
            registry: HashMap::new(),
            interests: Slab::new(),
            timers: TimerHeap::new(),
            inbox,
            nonblock: HashSet::new(),
            events: vec![EpollEvent::empty(); 256],
        })
    }

    /// Switch `fd` to O_NONBLOCK once, caching the fact.
    fn ensure_nonblock(&mut self, fd: RawFd) -> Result<()> {
        if self.nonblock.contains(&fd) {
            return Ok(());
        }
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(Error::last_os_error());
        }
        if flags & libc::O_NONBLOCK == 0
            && unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0
        {
            return Err(Error::last_os_error());
        }
        self.nonblock.insert(fd);
        Ok(())
    }

    /// Register the calling fiber's interest in `fd` becoming readable
    /// or writable.
    fn watch(&mut self, fd: RawFd, write: bool, fiber: FiberId) -> Result<()> {
        let (key, fresh) = match self.registry.get(&fd) {
            Some(&key) => (key, false),
            None => {
                let key = self.interests.insert(FdInterest {
                    fd,
                    read: None,
                    write: None,
                });
                self.registry.insert(fd, key);
                (key, true)
            }
        };
        {
            let interest = &mut self.interests[key];
            let slot = if write {
                &mut interest.write
            } else {
                &mut interest.read
            };
            if slot.is_some() {
                return Err(Error::AlreadyAwaited);
            }
            *slot = Some(fiber);
        }
        let synced = self.sync_interest(key, fresh);
        if synced.is_err() {
            // Roll the slot back so nobody is left parked on a watcher
            // the kernel never saw.
            if let Some(&key) = self.registry.get(&fd) {
                let interest = &mut self.interests[key];
                if write {
                    interest.write = None;
                } else {
                    interest.read = None;
                }
                let _ = self.sync_interest(key, false);
            }
        }
        synced
    }

    /// Drop the calling fiber's interest after its wait returned.
    fn unwatch(&mut self, fd: RawFd, write: bool) {
        if let Some(&key) = self.registry.get(&fd) {
            {
                let interest = &mut self.interests[key];
                if write {
                    interest.write = None;
                } else {
                    interest.read = None;
                }
            }
            let _ = self.sync_interest(key, false);
        }
    }

    /// Reconcile the kernel interest set with the waiter slots: add,
    /// modify or delete the fd's registration.
    fn sync_interest(&mut self, key: usize, fresh: bool) -> Result<()> {
        let (fd, flags) = {
            let interest = &self.interests[key];
            let mut flags = EpollFlags::empty();
            if interest.read.is_some() {
                flags |= EpollFlags::EPOLLIN;
            }
            if interest.write.is_some() {
                flags |= EpollFlags::EPOLLOUT;
            }
            (interest.fd, flags)
        };

        if flags.is_empty() {
            let _ = self.epoll.delete(borrowed(fd));
            self.registry.remove(&fd);
            self.interests.remove(key);
            return Ok(());
        }

        let token = key as u64 + 1;
        let mut event = EpollEvent::new(flags, token);
        if fresh {
            match self.epoll.add(borrowed(fd), event) {
                Ok(()) => Ok(()),
                Err(Errno::EEXIST) => self.epoll.modify(borrowed(fd), &mut event).map_err(errno_err),
                Err(e) => Err(errno_err(e)),
            }
        } else {
            self.epoll.modify(borrowed(fd), &mut event).map_err(errno_err)
        }
    }

    /// Closing an fd invalidates its watchers: wake them with EBADF and
    /// drop the registration and nonblock cache entry.
    fn forget_fd(&mut self, fd: RawFd, fibers: &mut FiberArena, base: &mut Base) {
        self.nonblock.remove(&fd);
        if let Some(key) = self.registry.remove(&fd) {
            let interest = self.interests.remove(key);
            let _ = self.epoll.delete(borrowed(fd));
            for fiber in [interest.read, interest.write].into_iter().flatten() {
                schedule_raw(
                    fibers,
                    base,
                    fiber,
                    Resume::Err(Error::Sys(libc::EBADF)),
                    false,
                );
            }
        }
    }

    pub(crate) fn poll(&mut self, blocking: bool, fibers: &mut FiberArena, base: &mut Base) {
        base.poll_count += 1;
        base.trace_with(|| TraceEvent::EnterPoll);

        let mut events = std::mem::take(&mut self.events);
        loop {
            let timeout = if blocking {
                match self.timers.next_deadline() {
                    Some(deadline) => {
                        let now = Instant::now();
                        let ms = deadline.saturating_duration_since(now).as_millis() as u64;
                        EpollTimeout::from(ms.min(u16::MAX as u64 - 1) as u16)
                    }
                    None => EpollTimeout::NONE,
                }
            } else {
                EpollTimeout::from(0u16)
            };

            if blocking {
                base.currently_polling = true;
                self.inbox.notifier.set_polling(true);
                if !self.inbox.is_empty() {
                    // A cross-thread schedule raced us; skip the wait.
                    self.inbox.notifier.set_polling(false);
                    base.currently_polling = false;
                    break;
                }
            }
            let waited = self.epoll.wait(&mut events, timeout);
            if blocking {
                self.inbox.notifier.set_polling(false);
                base.currently_polling = false;
            }
            match waited {
                Ok(n) => {
                    for i in 0..n {
                        let event = events[i];
                        self.dispatch_event(event, fibers, base);
                    }
                    break;
                }
                Err(Errno::EINTR) => {
                    if blocking && base.run_queue.is_empty() {
                        continue;
                    }
                    break;
                }
                Err(e) => {
                    warn!("epoll wait failed: {}", e);
                    break;
                }
            }
        }
        self.events = events;

        self.timers.fire_due(Instant::now(), fibers, base);
        base.trace_with(|| TraceEvent::LeavePoll);
    }

    fn dispatch_event(&mut self, event: EpollEvent, fibers: &mut FiberArena, base: &mut Base) {
        let token = event.data();
        if token == NOTIFIER_TOKEN {
            self.inbox.notifier.drain();
            return;
        }
        let key = (token - 1) as usize;
        let Some(interest) = self.interests.get_mut(key) else {
            return;
        };
        let flags = event.events();
        let err = flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR);
        if err || flags.intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLPRI) {
            if let Some(fiber) = interest.read.take() {
                schedule_raw(fibers, base, fiber, Resume::Unit, false);
            }
        }
        if err || flags.contains(EpollFlags::EPOLLOUT) {
            if let Some(fiber) = interest.write.take() {
                schedule_raw(fibers, base, fiber, Resume::Unit, false);
            }
        }
        let _ = self.sync_interest(key, false);
    }

    pub(crate) fn idle_compact(&mut self) {
        self.timers.compact();
        self.nonblock.shrink_to_fit();
    }

    pub(crate) fn post_fork(&mut self) -> Result<()> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(errno_err)?;
        epoll
            .add(
                borrowed(self.inbox.notifier.fd()),
                EpollEvent::new(EpollFlags::EPOLLIN, NOTIFIER_TOKEN),
            )
            .map_err(errno_err)?;
        self.epoll = epoll;
        self.registry.clear();
        self.interests.clear();
        self.timers.clear();
        self.nonblock.clear();
        Ok(())
    }
}

fn errno_err(e: Errno) -> Error {
    Error::Sys(e as i32)
}

// ─── Fiber-side access helpers ───

fn with_epoll<R>(f: impl FnOnce(&mut EpollBackend, &mut FiberArena, &mut Base) -> R) -> Result<R> {
    try_with_rt(|rt| {
        let Runtime {
            fibers,
            base,
            backend,
            ..
        } = rt;
        match backend {
            Backend::Epoll(e) => Ok(f(e, fibers, base)),
            #[cfg(target_os = "linux")]
            _ => Err(Error::BackendUnavailable("epoll")),
        }
    })?
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn would_block(errno: i32) -> bool {
    errno == libc::EAGAIN || errno == libc::EWOULDBLOCK
}

/// Park the calling fiber until `fd` is ready in the given direction.
fn wait_fd(fd: RawFd, write: bool) -> Result<()> {
    let me = current_fiber()?;
    with_epoll(|e, _, _| e.watch(fd, write, me))??;
    let resumed = backend_await();
    with_epoll(|e, _, _| e.unwatch(fd, write))?;
    resumed.into_result().map(|_| ())
}

fn ensure_nonblock(fd: RawFd) -> Result<()> {
    with_epoll(|e, _, _| e.ensure_nonblock(fd))?
}

/// One fairness switch after a syscall that succeeded without waiting.
fn snooze_unless(waited: bool) -> Result<()> {
    if !waited {
        snooze()?;
    }
    Ok(())
}

// ─── I/O ops ───

pub(crate) fn read(fd: RawFd, buf: &mut Vec<u8>, maxlen: usize, to_eof: bool) -> Result<usize> {
    current_fiber()?;
    ensure_nonblock(fd)?;
    let want = maxlen.max(1);
    let mut total = 0usize;

    loop {
        buf.reserve(want);
        let ptr = unsafe { buf.as_mut_ptr().add(buf.len()) };
        let avail = want;
        let mut waited = false;

        let n = loop {
            let n = unsafe { libc::read(fd, ptr as *mut libc::c_void, avail) };
            if n >= 0 {
                break n as usize;
            }
            let errno = last_errno();
            if would_block(errno) {
                wait_fd(fd, false)?;
                waited = true;
                continue;
            }
            if errno == libc::EINTR {
                continue;
            }
            return Err(Error::Sys(errno));
        };
        snooze_unless(waited)?;

        if n == 0 {
            break; // EOF
        }
        unsafe { buf.set_len(buf.len() + n) };
        total += n;
        if !to_eof {
            break;
        }
    }
    Ok(total)
}

pub(crate) fn write(fd: RawFd, buf: &[u8]) -> Result<usize> {
    current_fiber()?;
    ensure_nonblock(fd)?;
    let mut written = 0usize;

    while written < buf.len() {
        let mut waited = false;
        let n = loop {
            let n = unsafe {
                libc::write(
                    fd,
                    buf.as_ptr().add(written) as *const libc::c_void,
                    buf.len() - written,
                )
            };
            if n >= 0 {
                break n as usize;
            }
            let errno = last_errno();
            if would_block(errno) {
                wait_fd(fd, true)?;
                waited = true;
                continue;
            }
            if errno == libc::EINTR {
                continue;
            }
            return Err(Error::Sys(errno));
        };
        snooze_unless(waited)?;
        written += n;
    }
    Ok(buf.len())
}

pub(crate) fn writev(fd: RawFd, bufs: &[&[u8]]) -> Result<usize> {
    current_fiber()?;
    ensure_nonblock(fd)?;
    let total: usize = bufs.iter().map(|b| b.len()).sum();
    let mut iovecs: Vec<libc::iovec> = bufs
        .iter()
        .map(|b| libc::iovec {
            iov_base: b.as_ptr() as *mut libc::c_void,
            iov_len: b.len(),
        })
        .collect();
    let mut first = 0usize;
    let mut written = 0usize;

    while written < total {
        let mut waited = false;
        let n = loop {
            let n = unsafe {
                libc::writev(
                    fd,
                    iovecs.as_ptr().add(first),
                    (iovecs.len() - first) as libc::c_int,
                )
            };
            if n >= 0 {
                break n as usize;
            }
            let errno = last_errno();
            if would_block(errno) {
                wait_fd(fd, true)?;
                waited = true;
                continue;
            }
            if errno == libc::EINTR {
                continue;
            }
            return Err(Error::Sys(errno));
        };
        snooze_unless(waited)?;
        written += n;

        let mut left = n;
        while left > 0 && first < iovecs.len() {
            let iov = &mut iovecs[first];
            if left < iov.iov_len {
                iov.iov_base = unsafe { (iov.iov_base as *mut u8).add(left) } as *mut libc::c_void;
                iov.iov_len -= left;
                left = 0;
            } else {
                left -= iov.iov_len;
                first += 1;
            }
        }
    }
    Ok(total)
}

pub(crate) fn recv(fd: RawFd, buf: &mut Vec<u8>, maxlen: usize) -> Result<usize> {
    current_fiber()?;
    ensure_nonblock(fd)?;
    let want = maxlen.max(1);
    buf.reserve(want);
    let ptr = unsafe { buf.as_mut_ptr().add(buf.len()) };
    let mut waited = false;

    let n = loop {
        let n = unsafe { libc::recv(fd, ptr as *mut libc::c_void, want, 0) };
        if n >= 0 {
            break n as usize;
        }
        let errno = last_errno();
        if would_block(errno) {
            wait_fd(fd, false)?;
            waited = true;
            continue;
        }
        if errno == libc::EINTR {
            continue;
        }
        return Err(Error::Sys(errno));
    };
    snooze_unless(waited)?;
    unsafe { buf.set_len(buf.len() + n) };
    Ok(n)
}

pub(crate) fn recvmsg(
    fd: RawFd,
    buf: &mut Vec<u8>,
    maxlen: usize,
    flags: i32,
) -> Result<(usize, Vec<u8>, i32)> {
    current_fiber()?;
    ensure_nonblock(fd)?;
    let want = maxlen.max(1);
    buf.reserve(want);
    let mut name = [0u8; 128];
    let mut iov = libc::iovec {
        iov_base: unsafe { buf.as_mut_ptr().add(buf.len()) } as *mut libc::c_void,
        iov_len: want,
    };
    let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
    hdr.msg_name = name.as_mut_ptr() as *mut libc::c_void;
    hdr.msg_namelen = name.len() as libc::socklen_t;
    hdr.msg_iov = &mut iov;
    hdr.msg_iovlen = 1;
    let mut waited = false;

    let n = loop {
        let n = unsafe { libc::recvmsg(fd, &mut hdr, flags) };
        if n >= 0 {
            break n as usize;
        }
        let errno = last_errno();
        if would_block(errno) {
            wait_fd(fd, false)?;
            waited = true;
            continue;
        }
        if errno == libc::EINTR {
            continue;
        }
        return Err(Error::Sys(errno));
    };
    snooze_unless(waited)?;
    unsafe { buf.set_len(buf.len() + n) };
    let addr = name[..hdr.msg_namelen as usize].to_vec();
    Ok((n, addr, hdr.msg_flags))
}

pub(crate) fn send(fd: RawFd, buf: &[u8], flags: i32) -> Result<usize> {
    current_fiber()?;
    ensure_nonblock(fd)?;
    let mut sent = 0usize;

    while sent < buf.len() {
        let mut waited = false;
        let n = loop {
            let n = unsafe {
                libc::send(
                    fd,
                    buf.as_ptr().add(sent) as *const libc::c_void,
                    buf.len() - sent,
                    flags,
                )
            };
            if n >= 0 {
                break n as usize;
            }
            let errno = last_errno();
            if would_block(errno) {
                wait_fd(fd, true)?;
                waited = true;
                continue;
            }
            if errno == libc::EINTR {
                continue;
            }
            return Err(Error::Sys(errno));
        };
        snooze_unless(waited)?;
        sent += n;
    }
    Ok(buf.len())
}

pub(crate) fn sendmsg(fd: RawFd, buf: &[u8], flags: i32, dest: Option<&[u8]>) -> Result<usize> {
    current_fiber()?;
    ensure_nonblock(fd)?;
    let mut name = [0u8; 128];
    let mut iov = libc::iovec {
        iov_base: buf.as_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
    if let Some(dest) = dest {
        let len = dest.len().min(name.len());
        name[..len].copy_from_slice(&dest[..len]);
        hdr.msg_name = name.as_mut_ptr() as *mut libc::c_void;
        hdr.msg_namelen = len as libc::socklen_t;
    }
    hdr.msg_iov = &mut iov;
    hdr.msg_iovlen = 1;
    let mut waited = false;

    let n = loop {
        let n = unsafe { libc::sendmsg(fd, &hdr, flags) };
        if n >= 0 {
            break n as usize;
        }
        let errno = last_errno();
        if would_block(errno) {
            wait_fd(fd, true)?;
            waited = true;
            continue;
        }
        if errno == libc::EINTR {
            continue;
        }
        return Err(Error::Sys(errno));
    };
    snooze_unless(waited)?;
    Ok(n)
}

pub(crate) fn accept(server: RawFd) -> Result<RawFd> {
    current_fiber()?;
    ensure_nonblock(server)?;
    let mut waited = false;
    let fd = loop {
        let fd = unsafe { libc::accept4(server, std::ptr::null_mut(), std::ptr::null_mut(), 0) };
        if fd >= 0 {
            break fd;
        }
        let errno = last_errno();
        if would_block(errno) {
            wait_fd(server, false)?;
            waited = true;
            continue;
        }
        if errno == libc::EINTR {
            continue;
        }
        return Err(Error::Sys(errno));
    };
    snooze_unless(waited)?;
    Ok(fd)
}

pub(crate) fn accept_loop(
    server: RawFd,
    mut f: Box<dyn FnMut(RawFd) -> Result<()> + '_>,
) -> Result<()> {
    loop {
        let fd = accept(server)?;
        f(fd)?;
    }
}

pub(crate) fn connect(fd: RawFd, addr: &SocketAddr) -> Result<()> {
    current_fiber()?;
    ensure_nonblock(fd)?;
    let (storage, len) = crate::backend::sockaddr_from(addr);

    let ret = unsafe {
        libc::connect(
            fd,
            &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
        )
    };
    if ret == 0 {
        snooze()?;
        return Ok(());
    }
    let errno = last_errno();
    if errno != libc::EINPROGRESS && errno != libc::EINTR {
        return Err(Error::Sys(errno));
    }
    wait_fd(fd, true)?;

    // Connection outcome is reported through SO_ERROR.
    let mut so_error: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut so_error as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(Error::last_os_error());
    }
    if so_error != 0 {
        return Err(Error::Sys(so_error));
    }
    Ok(())
}

pub(crate) fn close(fd: RawFd) -> Result<()> {
    try_with_rt(|rt| {
        let Runtime {
            fibers,
            base,
            backend,
            ..
        } = rt;
        if let Backend::Epoll(e) = backend {
            e.forget_fd(fd, fibers, base);
        }
    })?;
    if unsafe { libc::close(fd) } < 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn wait_io(fd: RawFd, write: bool) -> Result<()> {
    wait_fd(fd, write)
}

// ─── Transfer ops ───

fn splice_once(src: RawFd, dst: RawFd, len: usize) -> Result<usize> {
    let mut wait_write = false;
    let mut waited = false;
    let n = loop {
        let n = unsafe {
            libc::splice(
                src,
                std::ptr::null_mut(),
                dst,
                std::ptr::null_mut(),
                len,
                libc::SPLICE_F_NONBLOCK,
            )
        };
        if n >= 0 {
            break n as usize;
        }
        let errno = last_errno();
        if would_block(errno) {
            // EAGAIN is either an empty source or a full destination;
            // alternate waits until one side unblocks.
            wait_fd(if wait_write { dst } else { src }, wait_write)?;
            wait_write = !wait_write;
            waited = true;
            continue;
        }
        if errno == libc::EINTR {
            continue;
        }
        return Err(Error::Sys(errno));
    };
    snooze_unless(waited)?;
    Ok(n)
}

pub(crate) fn splice(src: RawFd, dst: RawFd, maxlen: isize) -> Result<usize> {
    current_fiber()?;
    let to_eof = maxlen < 0;
    let len = maxlen.unsigned_abs();
    let mut total = 0usize;
    loop {
        let n = splice_once(src, dst, len)?;
        total += n;
        if n == 0 || !to_eof {
            return Ok(total);
        }
    }
}

pub(crate) fn tee(src: RawFd, dst: RawFd, maxlen: usize) -> Result<usize> {
    current_fiber()?;
    let mut waited = false;
    let n = loop {
        let n = unsafe { libc::tee(src, dst, maxlen, libc::SPLICE_F_NONBLOCK) };
        if n >= 0 {
            break n as usize;
        }
        let errno = last_errno();
        if would_block(errno) {
            wait_fd(src, false)?;
            waited = true;
            continue;
        }
        if errno == libc::EINTR {
            continue;
        }
        return Err(Error::Sys(errno));
    };
    snooze_unless(waited)?;
    Ok(n)
}

pub(crate) fn double_splice(src: RawFd, dst: RawFd) -> Result<usize> {
    current_fiber()?;
    let mut pipefd = [0 as RawFd; 2];
    if unsafe { libc::pipe2(pipefd.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(Error::last_os_error());
    }
    let result = (|| {
        let mut total = 0usize;
        loop {
            let n = splice_once(src, pipefd[1], RELAY_CHUNK)?;
            if n == 0 {
                return Ok(total);
            }
            let mut left = n;
            while left > 0 {
                left -= splice_once(pipefd[0], dst, left)?;
            }
            total += n;
        }
    })();
    unsafe {
        libc::close(pipefd[0]);
        libc::close(pipefd[1]);
    }
    result
}

// ─── Timing ops ───

fn register_timer(deadline: Instant, fiber: FiberId, resume: Resume) -> Result<TimerHandle> {
    with_epoll(|e, _, _| e.timers.register(deadline, fiber, resume))
}

pub(crate) fn sleep(duration: Duration) -> Result<()> {
    let me = current_fiber()?;
    let handle = register_timer(Instant::now() + duration, me, Resume::Unit)?;
    let resumed = backend_await();
    handle.cancel();
    resumed.into_result().map(|_| ())
}

pub(crate) fn timeout_race<T>(
    duration: Duration,
    f: impl FnOnce() -> Result<T>,
) -> Result<Option<T>> {
    let me = current_fiber()?;
    let handle = register_timer(
        Instant::now() + duration,
        me,
        Resume::Err(Error::Timeout),
    )?;

    let outcome = f();

    handle.cancel();
    let fired = handle.fired();
    if fired {
        crate::backend::clear_stale_timeout(me);
    }
    match outcome {
        Err(Error::Timeout) if fired => Ok(None),
        other => other.map(Some),
    }
}

pub(crate) fn timer_loop(
    interval: Duration,
    mut f: Box<dyn FnMut() -> Result<bool> + '_>,
) -> Result<()> {
    let me = current_fiber()?;
    let mut next: Option<Instant> = None;

    loop {
        let now = Instant::now();
        let target = *next.get_or_insert(now + interval);

        if target > now {
            let handle = register_timer(target, me, Resume::Unit)?;
            let resumed = backend_await();
            handle.cancel();
            resumed.into_result()?;
        } else {
            snooze()?;
        }

        if !f()? {
            return Ok(());
        }

        // Next tick relative to the previous target; ticks already in
        // the past collapse.
        let mut t = target;
        loop {
            t += interval;
            if t > now {
                break;
            }
        }
        next = Some(t);
    }
}

// ─── Parking ───

pub(crate) fn wait_event_impl() -> Result<Resume> {
    current_fiber()?;
    Ok(backend_await())
}
