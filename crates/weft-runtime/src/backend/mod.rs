//! Blocking-operation backends.
//!
//! A backend turns a blocking operation into a suspension point: the
//! completion backend batches submissions to an io_uring and parks the
//! fiber until the CQE arrives; the readiness backend attempts the
//! syscall non-blockingly and parks the fiber on an epoll watcher until
//! the fd is ready. The dispatch loop consumes only `poll` and the
//! cross-thread notifier; everything else is the op surface below.

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use weft_core::{Error, Resume, Result, TraceEvent};

use crate::config::{BackendSelect, Config};
use crate::fiber::{current_fiber, FiberArena};
use crate::notifier::Inbox;
use crate::runtime::{try_with_rt, Runtime};
use crate::scheduler::Base;

pub mod epoll;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod uring;
    }
}

/// Which mechanism the current thread's backend uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    IoUring,
    Epoll,
}

pub(crate) enum Backend {
    #[cfg(target_os = "linux")]
    Uring(uring::UringBackend),
    Epoll(epoll::EpollBackend),
}

impl Backend {
    pub(crate) fn new(config: &Config, inbox: Arc<Inbox>) -> Result<Self> {
        match config.resolved_backend() {
            #[cfg(target_os = "linux")]
            BackendSelect::IoUring => Ok(Backend::Uring(uring::UringBackend::new(
                config.ring_entries,
                inbox,
            )?)),
            #[cfg(not(target_os = "linux"))]
            BackendSelect::IoUring => Err(Error::BackendUnavailable("io_uring")),
            BackendSelect::Epoll => Ok(Backend::Epoll(epoll::EpollBackend::new(inbox)?)),
            BackendSelect::Auto => {
                #[cfg(target_os = "linux")]
                match uring::UringBackend::new(config.ring_entries, inbox.clone()) {
                    Ok(u) => return Ok(Backend::Uring(u)),
                    Err(e) => {
                        log::debug!("io_uring unavailable ({}), using epoll", e);
                    }
                }
                Ok(Backend::Epoll(epoll::EpollBackend::new(inbox)?))
            }
        }
    }

    pub(crate) fn kind(&self) -> BackendKind {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Uring(_) => BackendKind::IoUring,
            Backend::Epoll(_) => BackendKind::Epoll,
        }
    }

    /// Process kernel-reported events once. With `blocking`, wait until
    /// at least one completion/readiness (or a cross-thread wakeup)
    /// arrives.
    pub(crate) fn poll(&mut self, blocking: bool, fibers: &mut FiberArena, base: &mut Base) {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Uring(u) => u.poll(blocking, fibers, base),
            Backend::Epoll(e) => e.poll(blocking, fibers, base),
        }
    }

    /// Periodic idle task: give retained per-op memory back.
    pub(crate) fn idle_compact(&mut self) {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Uring(u) => u.idle_compact(),
            Backend::Epoll(e) => e.idle_compact(),
        }
    }

    /// Recreate kernel resources after fork; in-flight state is dropped.
    pub(crate) fn post_fork(&mut self) -> Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Uring(u) => u.post_fork(),
            Backend::Epoll(e) => e.post_fork(),
        }
    }
}

/// Kind of the current thread's backend.
pub fn kind() -> Result<BackendKind> {
    try_with_rt(|rt| rt.backend.kind())
}

macro_rules! dispatch {
    ($name:ident ( $($arg:expr),* )) => {
        match kind()? {
            #[cfg(target_os = "linux")]
            BackendKind::IoUring => uring::$name($($arg),*),
            #[cfg(not(target_os = "linux"))]
            BackendKind::IoUring => Err(Error::BackendUnavailable("io_uring")),
            BackendKind::Epoll => epoll::$name($($arg),*),
        }
    };
}

// ─── I/O ───

/// Read up to `maxlen` bytes (or, with `to_eof`, everything until EOF)
/// appending to `buf`. Returns the number of bytes read; 0 means EOF.
pub fn read(fd: RawFd, buf: &mut Vec<u8>, maxlen: usize, to_eof: bool) -> Result<usize> {
    dispatch!(read(fd, buf, maxlen, to_eof))
}

/// Read repeatedly until EOF, passing each chunk to `f`.
pub fn read_loop(fd: RawFd, maxlen: usize, mut f: impl FnMut(&[u8]) -> Result<()>) -> Result<()> {
    let mut buf = Vec::with_capacity(maxlen);
    loop {
        buf.clear();
        let n = read(fd, &mut buf, maxlen, false)?;
        if n == 0 {
            return Ok(());
        }
        f(&buf)?;
    }
}

/// Write all of `buf`, looping on partial writes.
pub fn write(fd: RawFd, buf: &[u8]) -> Result<usize> {
    dispatch!(write(fd, buf))
}

/// Gathered write of all `bufs`, looping on partial writes.
pub fn writev(fd: RawFd, bufs: &[&[u8]]) -> Result<usize> {
    dispatch!(writev(fd, bufs))
}

/// Receive once into `buf` (up to `maxlen` bytes appended).
pub fn recv(fd: RawFd, buf: &mut Vec<u8>, maxlen: usize) -> Result<usize> {
    dispatch!(recv(fd, buf, maxlen))
}

/// Receive repeatedly until EOF, passing each chunk to `f`.
pub fn recv_loop(fd: RawFd, maxlen: usize, mut f: impl FnMut(&[u8]) -> Result<()>) -> Result<()> {
    let mut buf = Vec::with_capacity(maxlen);
    loop {
        buf.clear();
        let n = recv(fd, &mut buf, maxlen)?;
        if n == 0 {
            return Ok(());
        }
        f(&buf)?;
    }
}

/// Receive a message; returns bytes appended to `buf`, the sender
/// address (raw sockaddr bytes) and the message flags.
pub fn recvmsg(
    fd: RawFd,
    buf: &mut Vec<u8>,
    maxlen: usize,
    flags: i32,
) -> Result<(usize, Vec<u8>, i32)> {
    dispatch!(recvmsg(fd, buf, maxlen, flags))
}

/// Send all of `buf` with `flags`, looping on partial sends.
pub fn send(fd: RawFd, buf: &[u8], flags: i32) -> Result<usize> {
    dispatch!(send(fd, buf, flags))
}

/// Send a message, optionally to `dest` (raw sockaddr bytes).
pub fn sendmsg(fd: RawFd, buf: &[u8], flags: i32, dest: Option<&[u8]>) -> Result<usize> {
    dispatch!(sendmsg(fd, buf, flags, dest))
}

/// Send several parts as one transmission: zero parts is a no-op, one
/// part is a plain send, more are coalesced first.
pub fn sendv(fd: RawFd, parts: &[&[u8]], flags: i32) -> Result<usize> {
    match parts.len() {
        0 => Ok(0),
        1 => send(fd, parts[0], flags),
        _ => {
            let joined: Vec<u8> = parts.concat();
            send(fd, &joined, flags)
        }
    }
}

/// Accept one connection; returns the connected socket fd.
pub fn accept(server: RawFd) -> Result<RawFd> {
    dispatch!(accept(server))
}

/// Accept connections forever (until error or interrupt), passing each
/// connected fd to `f`. On the completion backend this arms a multishot
/// accept when the kernel supports it.
pub fn accept_loop(server: RawFd, f: impl FnMut(RawFd) -> Result<()>) -> Result<()> {
    dispatch!(accept_loop(server, Box::new(f)))
}

/// Connect `fd` to `addr`.
pub fn connect(fd: RawFd, addr: &std::net::SocketAddr) -> Result<()> {
    dispatch!(connect(fd, addr))
}

/// Close `fd` through the backend.
pub fn close(fd: RawFd) -> Result<()> {
    dispatch!(close(fd))
}

/// Park until `fd` is readable (or writable with `write`).
pub fn wait_io(fd: RawFd, write: bool) -> Result<()> {
    dispatch!(wait_io(fd, write))
}

/// Wait for child `pid` to exit; returns `(pid, status)`. Reaps with
/// `WNOHANG` after pidfd readability; `ECHILD` means someone else
/// already reaped, which counts as success.
pub fn waitpid(pid: i32) -> Result<(i32, i32)> {
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) } as RawFd;
    if fd < 0 {
        return Err(Error::last_os_error());
    }
    let waited = wait_io(fd, false);
    unsafe {
        libc::close(fd);
    }
    waited?;

    let mut status: libc::c_int = 0;
    let ret = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
    if ret < 0 {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if errno == libc::ECHILD {
            return Ok((pid, status));
        }
        return Err(Error::Sys(errno));
    }
    Ok((ret, status))
}

// ─── Transfer ───

/// Move up to `maxlen` bytes from `src` to `dst` without copying through
/// user space. A negative `maxlen` splices until EOF in chunks of its
/// magnitude. Returns bytes moved; 0 means EOF.
pub fn splice(src: RawFd, dst: RawFd, maxlen: isize) -> Result<usize> {
    dispatch!(splice(src, dst, maxlen))
}

/// Splice `src` to `dst` until EOF through an internal pipe, keeping
/// both sides in flight concurrently where the backend allows it.
pub fn double_splice(src: RawFd, dst: RawFd) -> Result<usize> {
    dispatch!(double_splice(src, dst))
}

/// Duplicate up to `maxlen` pipe bytes from `src` into `dst`.
pub fn tee(src: RawFd, dst: RawFd, maxlen: usize) -> Result<usize> {
    dispatch!(tee(src, dst, maxlen))
}

/// Per-chunk text around spliced data: fixed bytes or computed from the
/// chunk length.
pub enum ChunkText<'a> {
    Bytes(&'a [u8]),
    Make(&'a dyn Fn(usize) -> Vec<u8>),
}

impl ChunkText<'_> {
    fn render(&self, chunk_len: usize) -> Vec<u8> {
        match self {
            ChunkText::Bytes(b) => b.to_vec(),
            ChunkText::Make(f) => f(chunk_len),
        }
    }
}

/// Stream `src` to `dst` in chunks, writing `prefix`/`postfix` around the
/// whole stream and `chunk_prefix`/`chunk_postfix` around each chunk. On
/// the completion backend consecutive ops are submitted as one linked
/// chain per round trip.
pub fn splice_chunks(
    src: RawFd,
    dst: RawFd,
    prefix: Option<&[u8]>,
    postfix: Option<&[u8]>,
    chunk_prefix: Option<&ChunkText>,
    chunk_postfix: Option<&ChunkText>,
    chunk_size: usize,
) -> Result<usize> {
    if chunk_size == 0 {
        return Err(Error::Arg("chunk_size must be positive"));
    }
    match kind()? {
        #[cfg(target_os = "linux")]
        BackendKind::IoUring => uring::splice_chunks(
            src,
            dst,
            prefix,
            postfix,
            chunk_prefix,
            chunk_postfix,
            chunk_size,
        ),
        _ => splice_chunks_serial(
            src,
            dst,
            prefix,
            postfix,
            chunk_prefix,
            chunk_postfix,
            chunk_size,
        ),
    }
}

/// Readiness-backend rendition: the same stream, one op at a time.
fn splice_chunks_serial(
    src: RawFd,
    dst: RawFd,
    prefix: Option<&[u8]>,
    postfix: Option<&[u8]>,
    chunk_prefix: Option<&ChunkText>,
    chunk_postfix: Option<&ChunkText>,
    chunk_size: usize,
) -> Result<usize> {
    let pipe = crate::pipe::Pipe::new()?;
    let mut total = 0usize;
    if let Some(prefix) = prefix {
        write(dst, prefix)?;
    }
    loop {
        let chunk_len = splice(src, pipe.fd(true)?, chunk_size as isize)?;
        if chunk_len == 0 {
            break;
        }
        total += chunk_len;
        if let Some(text) = chunk_prefix {
            write(dst, &text.render(chunk_len))?;
        }
        let mut left = chunk_len;
        while left > 0 {
            left -= splice(pipe.fd(false)?, dst, left as isize)?;
        }
        if let Some(text) = chunk_postfix {
            write(dst, &text.render(chunk_len))?;
        }
    }
    if let Some(postfix) = postfix {
        write(dst, postfix)?;
    }
    Ok(total)
}

// ─── Timing ───

/// Park the fiber for `duration`.
pub fn sleep(duration: Duration) -> Result<()> {
    dispatch!(sleep(duration))
}

/// Call `f` every `interval`, correcting for drift. Stops when `f`
/// returns `Ok(false)` or an error.
pub fn timer_loop(interval: Duration, f: impl FnMut() -> Result<bool>) -> Result<()> {
    if interval.is_zero() {
        return Err(Error::Arg("timer interval must be positive"));
    }
    dispatch!(timer_loop(interval, Box::new(f)))
}

/// Race `f` against a timer. `Ok(None)` means the timer won; the op `f`
/// was suspended in has been cancelled.
pub fn move_on_after<T>(duration: Duration, f: impl FnOnce() -> Result<T>) -> Result<Option<T>> {
    match kind()? {
        #[cfg(target_os = "linux")]
        BackendKind::IoUring => uring::timeout_race(duration, f),
        _ => epoll::timeout_race(duration, f),
    }
}

/// Like [`move_on_after`], but a timer win raises [`Error::Timeout`].
pub fn timeout<T>(duration: Duration, f: impl FnOnce() -> Result<T>) -> Result<T> {
    match move_on_after(duration, f)? {
        Some(v) => Ok(v),
        None => Err(Error::Timeout),
    }
}

/// After a timeout fired while the fiber was not suspended, its staged
/// error resume may still sit on the runqueue; drop it so an unrelated
/// later suspension does not observe a stale timeout.
pub(crate) fn clear_stale_timeout(me: weft_core::FiberId) {
    let _ = try_with_rt(|rt| {
        if let Some(entry) = rt.base.run_queue.delete(me) {
            if entry.value == Resume::Err(Error::Timeout) {
                if let Some(cell) = rt.fibers.get_mut(me) {
                    cell.runnable = false;
                }
            } else {
                rt.base.run_queue.push(entry.fiber, entry.value, false);
            }
        }
    });
}

// ─── Control ───

/// One explicit poll of the backend.
pub fn poll(blocking: bool) -> Result<()> {
    try_with_rt(|rt| {
        let Runtime {
            fibers,
            base,
            backend,
            ..
        } = rt;
        backend.poll(blocking, fibers, base);
    })
}

/// Force this thread's blocked poll to return (no-op when not blocked).
pub fn wakeup() -> Result<()> {
    try_with_rt(|rt| rt.inbox.wakeup())?
}

/// Park unconditionally until somebody schedules the fiber. Returns the
/// resume value; with `raise`, an error resume is raised here instead.
pub fn wait_event(raise: bool) -> Result<Resume> {
    current_fiber()?;
    let resume = dispatch!(wait_event_impl())?;
    if raise {
        return resume.into_result();
    }
    Ok(resume)
}

/// Emit a record through the installed trace hook.
pub fn trace(event: TraceEvent) -> Result<()> {
    try_with_rt(|rt| rt.base.trace_with(|| event))
}

/// A chained op descriptor: executed in order, linked into a single
/// submission chain on the completion backend.
pub enum ChainOp<'a> {
    Write { fd: RawFd, buf: &'a [u8] },
    Send { fd: RawFd, buf: &'a [u8], flags: i32 },
    Splice { src: RawFd, dst: RawFd, len: u32 },
}

/// Build a raw sockaddr for `addr`, for handing to the kernel.
pub(crate) fn sockaddr_from(
    addr: &std::net::SocketAddr,
) -> (libc::sockaddr_storage, libc::socklen_t) {
    use std::net::SocketAddr;

    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len;
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sin as *const libc::sockaddr_in as *const u8,
                    &mut storage as *mut libc::sockaddr_storage as *mut u8,
                    std::mem::size_of::<libc::sockaddr_in>(),
                );
            }
            len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sin6 as *const libc::sockaddr_in6 as *const u8,
                    &mut storage as *mut libc::sockaddr_storage as *mut u8,
                    std::mem::size_of::<libc::sockaddr_in6>(),
                );
            }
            len = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
        }
    }
    (storage, len)
}

/// Run the ops in order; returns the result of the last one.
pub fn chain(ops: &[ChainOp]) -> Result<i64> {
    if ops.is_empty() {
        return Ok(0);
    }
    match kind()? {
        #[cfg(target_os = "linux")]
        BackendKind::IoUring => uring::chain(ops),
        _ => {
            // Readiness rendition: sequential execution.
            let mut last = 0i64;
            for op in ops {
                last = match op {
                    ChainOp::Write { fd, buf } => write(*fd, buf)? as i64,
                    ChainOp::Send { fd, buf, flags } => send(*fd, buf, *flags)? as i64,
                    ChainOp::Splice { src, dst, len } => splice(*src, *dst, *len as isize)? as i64,
                };
            }
            Ok(last)
        }
    }
}
