//! Completion-based backend on io_uring.
//!
//! Submissions accumulate in the ring and are flushed when the prepared
//! limit is reached, when a cancellation needs to reach the kernel
//! immediately, or when a blocking poll is about to happen. Each op owns
//! a context shared with the kernel (see [`context`]); a fiber resumed
//! with an error before its CQE issues an async cancel and leaves its
//! buffers with the context until the kernel lets go of them.

pub mod context;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use io_uring::squeue;
use io_uring::types::{Fd, Timespec, TimeoutFlags};
use io_uring::{cqueue, opcode, IoUring, Probe};
use log::{debug, warn};

use weft_core::{Error, FiberId, Resume, Result, RingBuffer, TraceEvent};

use crate::backend::{Backend, ChainOp, ChunkText};
use crate::fiber::{current_fiber, FiberArena};
use crate::notifier::Inbox;
use crate::runtime::{try_with_rt, Runtime};
use crate::scheduler::{backend_await, schedule_raw, snooze, Base};

use context::{
    CtxKey, ContextStore, KernelBuf, MsgParts, OpType, SockaddrStore, MULTISHOT_REFCOUNT,
    NO_CONTEXT,
};

const WAKEUP_POLLIN: u32 = libc::POLLIN as u32;
const DOUBLE_SPLICE_MAXLEN: u32 = 1 << 16;

pub(crate) struct UringBackend {
    ring: IoUring,
    pub(crate) store: ContextStore,
    pending_sqes: u32,
    prepared_limit: u32,
    inbox: Arc<Inbox>,

    /// Lazy eventfd that is never signalled; parks fibers in
    /// `wait_event` while keeping a poll op in flight so the blocking
    /// wait stays interruptible.
    event_fd: RawFd,
    event_fd_ctx: Option<CtxKey>,

    /// Standing multishot poll on the cross-thread notifier.
    wakeup_ctx: Option<CtxKey>,

    /// Armed multishot accepts, keyed by listening socket.
    accept_queues: HashMap<RawFd, AcceptState>,
    multishot_accept: bool,

    comp_buf: Vec<cqueue::Entry>,
}

struct AcceptState {
    ctx: CtxKey,
    /// Accepted fds (negative values carry errno) not yet claimed.
    ready: RingBuffer<i32>,
    /// Fibers parked waiting for an accepted fd.
    waiters: RingBuffer<FiberId>,
}

impl UringBackend {
    pub(crate) fn new(ring_entries: u32, inbox: Arc<Inbox>) -> Result<Self> {
        let mut prepared_limit = ring_entries;
        let ring = loop {
            match IoUring::builder().build(prepared_limit) {
                Ok(ring) => break ring,
                Err(e) if e.raw_os_error() == Some(libc::ENOMEM) && prepared_limit > 64 => {
                    prepared_limit /= 2;
                    debug!("ring setup ENOMEM, retrying with {} entries", prepared_limit);
                }
                Err(e) => return Err(e.into()),
            }
        };

        let mut probe = Probe::new();
        let multishot_accept = ring.submitter().register_probe(&mut probe).is_ok()
            && probe.is_supported(opcode::AcceptMulti::CODE);

        let mut backend = Self {
            ring,
            store: ContextStore::new(),
            pending_sqes: 0,
            prepared_limit,
            inbox,
            event_fd: -1,
            event_fd_ctx: None,
            wakeup_ctx: None,
            accept_queues: HashMap::new(),
            multishot_accept,
            comp_buf: Vec::with_capacity(256),
        };
        backend.arm_wakeup();
        Ok(backend)
    }

    /// Keep a multishot poll on the notifier eventfd in flight, so a
    /// cross-thread write produces a CQE and breaks a blocked
    /// `submit_and_wait`.
    fn arm_wakeup(&mut self) {
        let key = self.store.acquire(OpType::Poll, None);
        self.store.get_mut(key).ref_count = MULTISHOT_REFCOUNT;
        let entry = opcode::PollAdd::new(Fd(self.inbox.notifier.fd()), WAKEUP_POLLIN)
            .multi(true)
            .build()
            .user_data(self.store.user_data(key));
        self.push_or_flush(&entry);
        self.defer_submit();
        self.wakeup_ctx = Some(key);
    }

    #[inline]
    fn try_push(&mut self, entry: &squeue::Entry) -> bool {
        unsafe { self.ring.submission().push(entry).is_ok() }
    }

    /// Push that must not fail: flush the queue first if it is full.
    fn push_or_flush(&mut self, entry: &squeue::Entry) {
        if !self.try_push(entry) {
            self.submit_now();
            if !self.try_push(entry) {
                warn!("submission queue full after flush, dropping entry");
            }
        }
    }

    fn submit_now(&mut self) {
        self.pending_sqes = 0;
        if let Err(e) = self.ring.submit() {
            if e.raw_os_error() != Some(libc::EINTR) {
                warn!("io_uring submit failed: {}", e);
            }
        }
    }

    fn defer_submit(&mut self) {
        self.pending_sqes += 1;
        if self.pending_sqes >= self.prepared_limit {
            self.submit_now();
        }
    }

    /// Submit an async cancel targeting `key`'s op and flush immediately.
    fn push_cancel(&mut self, key: CtxKey) {
        let user_data = self.store.user_data(key);
        let entry = opcode::AsyncCancel::new(user_data)
            .build()
            .user_data(NO_CONTEXT);
        self.push_or_flush(&entry);
        self.submit_now();
    }

    pub(crate) fn poll(&mut self, blocking: bool, fibers: &mut FiberArena, base: &mut Base) {
        base.poll_count += 1;
        if !blocking && self.pending_sqes > 0 {
            self.submit_now();
        }
        base.trace_with(|| TraceEvent::EnterPoll);
        if blocking {
            self.wait_cqe(base);
        }
        self.process_ready_cqes(fibers, base);
        base.trace_with(|| TraceEvent::LeavePoll);
    }

    fn wait_cqe(&mut self, base: &mut Base) {
        loop {
            base.currently_polling = true;
            self.inbox.notifier.set_polling(true);
            if !self.inbox.is_empty() {
                // A cross-thread schedule raced us; do not block.
                self.inbox.notifier.set_polling(false);
                base.currently_polling = false;
                return;
            }
            self.pending_sqes = 0;
            let waited = self.ring.submit_and_wait(1);
            self.inbox.notifier.set_polling(false);
            base.currently_polling = false;
            match waited {
                Ok(_) => return,
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => {
                    if base.run_queue.is_empty() {
                        continue;
                    }
                    return;
                }
                Err(e) => {
                    warn!("io_uring wait failed: {}", e);
                    return;
                }
            }
        }
    }

    fn process_ready_cqes(&mut self, fibers: &mut FiberArena, base: &mut Base) {
        loop {
            let mut buf = std::mem::take(&mut self.comp_buf);
            buf.clear();
            {
                let mut cq = self.ring.completion();
                for cqe in &mut cq {
                    buf.push(cqe);
                }
            }
            let empty = buf.is_empty();
            for cqe in buf.drain(..) {
                self.handle_completion(cqe, fibers, base);
            }
            self.comp_buf = buf;
            if !empty {
                continue;
            }
            // A full completion ring spills into the overflow list; ask
            // the kernel to flush it before giving up.
            if self.ring.completion().overflow() > 0 {
                let _ = self.ring.submitter().submit_and_wait(0);
                continue;
            }
            return;
        }
    }

    fn handle_completion(
        &mut self,
        cqe: cqueue::Entry,
        fibers: &mut FiberArena,
        base: &mut Base,
    ) {
        let Some(key) = self.store.check(cqe.user_data()) else {
            return;
        };
        let result = cqe.result();
        let more = cqueue::more(cqe.flags());
        self.store.get_mut(key).result = result;

        if self.store.get(key).ref_count == MULTISHOT_REFCOUNT {
            self.handle_multishot(key, result, more, fibers, base);
            return;
        }

        // Wake on the drop of the last kernel reference, but only while a
        // waiter is still attached: the cancellation paths detach the
        // fiber before issuing the cancel, so a late CQE cannot re-wake a
        // fiber that already resumed with an error.
        let ctx = self.store.get(key);
        if ctx.ref_count == 2 {
            if let Some(fiber) = ctx.fiber {
                let resume = ctx.resume.clone();
                schedule_raw(fibers, base, fiber, resume, false);
            }
        }
        self.store.release(key);
    }

    fn handle_multishot(
        &mut self,
        key: CtxKey,
        result: i32,
        more: bool,
        fibers: &mut FiberArena,
        base: &mut Base,
    ) {
        match self.store.get(key).ty {
            OpType::Poll => {
                // The cross-thread wakeup watcher.
                self.inbox.notifier.drain();
                if result == -libc::ECANCELED {
                    self.store.release(key);
                    self.wakeup_ctx = None;
                } else if !more {
                    // The kernel dropped the multishot; re-arm it.
                    let entry = opcode::PollAdd::new(Fd(self.inbox.notifier.fd()), WAKEUP_POLLIN)
                        .multi(true)
                        .build()
                        .user_data(self.store.user_data(key));
                    self.push_or_flush(&entry);
                    self.defer_submit();
                }
            }
            OpType::MultishotAccept => {
                if result == -libc::ECANCELED {
                    self.store.release(key);
                    self.accept_queues.retain(|_, st| st.ctx != key);
                    return;
                }
                if !more {
                    self.store.release(key);
                }
                let state = self
                    .accept_queues
                    .iter_mut()
                    .find(|(_, st)| st.ctx == key)
                    .map(|(fd, st)| (*fd, st));
                if let Some((listener, state)) = state {
                    state.ready.push(result);
                    if let Some(waiter) = state.waiters.shift() {
                        schedule_raw(fibers, base, waiter, Resume::Unit, false);
                    }
                    if !more {
                        // Queue lifetime is tied to the context.
                        self.accept_queues.remove(&listener);
                    }
                }
            }
            OpType::MultishotTimeout => {
                if result == -libc::ECANCELED {
                    self.store.release(key);
                    return;
                }
                let fiber = self.store.get(key).fiber;
                if !more {
                    self.store.release(key);
                }
                if let Some(fiber) = fiber {
                    schedule_raw(fibers, base, fiber, Resume::Value(more as i64), false);
                }
            }
            other => {
                warn!("unexpected multishot completion for {:?}", other);
            }
        }
    }

    pub(crate) fn idle_compact(&mut self) {
        self.store.compact();
    }

    pub(crate) fn post_fork(&mut self) -> Result<()> {
        let ring = IoUring::builder()
            .build(self.prepared_limit.max(64))
            .map_err(Error::from)?;
        self.ring = ring;
        self.store.clear();
        self.pending_sqes = 0;
        self.event_fd_ctx = None;
        if self.event_fd >= 0 {
            unsafe { libc::close(self.event_fd) };
            self.event_fd = -1;
        }
        self.accept_queues.clear();
        self.wakeup_ctx = None;
        self.arm_wakeup();
        Ok(())
    }
}

// ─── Fiber-side access helpers ───

fn with_uring<R>(f: impl FnOnce(&mut UringBackend, &mut FiberArena, &mut Base) -> R) -> Result<R> {
    try_with_rt(|rt| {
        let Runtime {
            fibers,
            base,
            backend,
            ..
        } = rt;
        match backend {
            Backend::Uring(u) => Ok(f(u, fibers, base)),
            _ => Err(Error::BackendUnavailable("io_uring")),
        }
    })?
}

fn acquire(ty: OpType, fiber: FiberId) -> Result<(CtxKey, u64)> {
    with_uring(|u, _, _| {
        let key = u.store.acquire(ty, Some(fiber));
        (key, u.store.user_data(key))
    })
}

enum PushOutcome {
    Pushed,
    Retry,
    Snooze,
}

/// Get the entry into the submission queue. A full queue with pending
/// submissions flushes; a full queue with nothing pending parks the
/// caller until the kernel drains slots.
fn push_entry(key: CtxKey, entry: &squeue::Entry) -> Result<()> {
    loop {
        let outcome = with_uring(|u, _, _| {
            if u.try_push(entry) {
                PushOutcome::Pushed
            } else if u.pending_sqes > 0 {
                u.submit_now();
                PushOutcome::Retry
            } else {
                PushOutcome::Snooze
            }
        })?;
        match outcome {
            PushOutcome::Pushed => return Ok(()),
            PushOutcome::Retry => continue,
            PushOutcome::Snooze => {
                if let Err(e) = snooze() {
                    // Interrupted before submission: no kernel op exists.
                    let _ = with_uring(|u, _, _| u.store.release_all(key));
                    return Err(e);
                }
            }
        }
    }
}

struct AwaitOutcome {
    result: i32,
    resume: Resume,
    completed: bool,
}

/// The per-op protocol after the SQE is queued: defer-submit, park, and
/// on an early (error) resume cancel the kernel side. `completed` is
/// false when the kernel still holds the context.
fn submit_and_await(key: CtxKey) -> Result<AwaitOutcome> {
    with_uring(|u, _, base| {
        base.op_count += 1;
        u.defer_submit();
    })?;

    let resume = backend_await();

    with_uring(|u, _, _| {
        if u.store.get(key).ref_count > 1 {
            // Woken before the CQE: tear the op down. Detaching the
            // fiber keeps the eventual CQE from re-waking it.
            let ctx = u.store.get_mut(key);
            ctx.result = -libc::ECANCELED;
            ctx.fiber = None;
            u.push_cancel(key);
        }
        let result = u.store.get(key).result;
        let completed = u.store.release(key);
        AwaitOutcome {
            result,
            resume,
            completed,
        }
    })
}

fn resume_error(resume: Resume) -> Error {
    match resume {
        Resume::Err(e) => e,
        _ => Error::Sys(libc::ECANCELED),
    }
}

/// An error injected into the fiber can race the op's own completion;
/// the cancellation still wins and is raised here.
fn check_injected(out: &AwaitOutcome) -> Result<()> {
    match &out.resume {
        Resume::Err(e) => Err(e.clone()),
        _ => Ok(()),
    }
}

fn attach(key: CtxKey, buf: KernelBuf) {
    let _ = with_uring(|u, _, _| u.store.get_mut(key).buffers.push(buf));
}

// ─── I/O ops ───

pub(crate) fn read(fd: RawFd, buf: &mut Vec<u8>, maxlen: usize, to_eof: bool) -> Result<usize> {
    let me = current_fiber()?;
    let mut data = std::mem::take(buf);
    let want = maxlen.max(1);
    let mut total = 0usize;

    loop {
        data.reserve(want);
        let avail = want;
        let ptr = unsafe { data.as_mut_ptr().add(data.len()) };

        let (key, user_data) = acquire(OpType::Read, me)?;
        let entry = opcode::Read::new(Fd(fd), ptr, avail as u32)
            .offset(u64::MAX)
            .build()
            .user_data(user_data);
        push_entry(key, &entry)?;
        let out = submit_and_await(key)?;
        if !out.completed {
            // The kernel may still write into `data`; it now belongs to
            // the context until the cancellation CQE.
            attach(key, KernelBuf::Bytes(data));
            return Err(resume_error(out.resume));
        }
        if let Err(e) = check_injected(&out) {
            *buf = data;
            return Err(e);
        }
        if out.result < 0 {
            *buf = data;
            return Err(Error::from_neg(out.result));
        }
        if out.result == 0 {
            break; // EOF
        }
        let n = out.result as usize;
        unsafe { data.set_len(data.len() + n) };
        total += n;
        if !to_eof {
            break;
        }
    }

    *buf = data;
    Ok(total)
}

pub(crate) fn write(fd: RawFd, buf: &[u8]) -> Result<usize> {
    let me = current_fiber()?;
    // The kernel reads from a context-ownable copy, so a cancellation
    // can never leave it reading freed caller memory.
    let data: Vec<u8> = buf.to_vec();
    let total = data.len();
    let mut written = 0usize;

    while written < total {
        let ptr = unsafe { data.as_ptr().add(written) };
        let left = total - written;

        let (key, user_data) = acquire(OpType::Write, me)?;
        let entry = opcode::Write::new(Fd(fd), ptr, left as u32)
            .offset(u64::MAX)
            .build()
            .user_data(user_data);
        push_entry(key, &entry)?;
        let out = submit_and_await(key)?;
        if !out.completed {
            attach(key, KernelBuf::Bytes(data));
            return Err(resume_error(out.resume));
        }
        check_injected(&out)?;
        if out.result < 0 {
            return Err(Error::from_neg(out.result));
        }
        written += out.result as usize;
    }
    Ok(total)
}

pub(crate) fn writev(fd: RawFd, bufs: &[&[u8]]) -> Result<usize> {
    let me = current_fiber()?;
    let parts: Vec<Vec<u8>> = bufs.iter().map(|b| b.to_vec()).collect();
    let total: usize = parts.iter().map(Vec::len).sum();
    let mut iovecs: Box<[libc::iovec]> = parts
        .iter()
        .map(|p| libc::iovec {
            iov_base: p.as_ptr() as *mut libc::c_void,
            iov_len: p.len(),
        })
        .collect();
    let mut first = 0usize;
    let mut written = 0usize;

    while written < total {
        let ptr = unsafe { iovecs.as_ptr().add(first) };
        let count = (iovecs.len() - first) as u32;

        let (key, user_data) = acquire(OpType::Writev, me)?;
        let entry = opcode::Writev::new(Fd(fd), ptr, count)
            .offset(u64::MAX)
            .build()
            .user_data(user_data);
        push_entry(key, &entry)?;
        let out = submit_and_await(key)?;
        if !out.completed {
            for part in parts {
                attach(key, KernelBuf::Bytes(part));
            }
            attach(key, KernelBuf::Iovecs(iovecs));
            return Err(resume_error(out.resume));
        }
        check_injected(&out)?;
        if out.result < 0 {
            return Err(Error::from_neg(out.result));
        }
        written += out.result as usize;

        // Recompute the iovec window after a partial write.
        let mut n = out.result as usize;
        while n > 0 && first < iovecs.len() {
            let iov = &mut iovecs[first];
            if n < iov.iov_len {
                iov.iov_base = unsafe { (iov.iov_base as *mut u8).add(n) } as *mut libc::c_void;
                iov.iov_len -= n;
                n = 0;
            } else {
                n -= iov.iov_len;
                first += 1;
            }
        }
    }
    Ok(total)
}

pub(crate) fn recv(fd: RawFd, buf: &mut Vec<u8>, maxlen: usize) -> Result<usize> {
    let me = current_fiber()?;
    let mut data = std::mem::take(buf);
    let want = maxlen.max(1);
    data.reserve(want);
    let ptr = unsafe { data.as_mut_ptr().add(data.len()) };

    let (key, user_data) = acquire(OpType::Recv, me)?;
    let entry = opcode::Recv::new(Fd(fd), ptr, want as u32)
        .build()
        .user_data(user_data);
    push_entry(key, &entry)?;
    let out = submit_and_await(key)?;
    if !out.completed {
        attach(key, KernelBuf::Bytes(data));
        return Err(resume_error(out.resume));
    }
    if let Err(e) = check_injected(&out) {
        *buf = data;
        return Err(e);
    }
    if out.result < 0 {
        *buf = data;
        return Err(Error::from_neg(out.result));
    }
    let n = out.result as usize;
    unsafe { data.set_len(data.len() + n) };
    *buf = data;
    Ok(n)
}

pub(crate) fn recvmsg(
    fd: RawFd,
    buf: &mut Vec<u8>,
    maxlen: usize,
    flags: i32,
) -> Result<(usize, Vec<u8>, i32)> {
    let me = current_fiber()?;
    let want = maxlen.max(1);
    let mut parts = Box::new(MsgParts {
        hdr: unsafe { std::mem::zeroed() },
        iov: libc::iovec {
            iov_base: std::ptr::null_mut(),
            iov_len: 0,
        },
        name: [0u8; 128],
        control: Vec::new(),
        data: Vec::with_capacity(want),
    });
    parts.iov.iov_base = parts.data.as_mut_ptr() as *mut libc::c_void;
    parts.iov.iov_len = want;
    parts.hdr.msg_name = parts.name.as_mut_ptr() as *mut libc::c_void;
    parts.hdr.msg_namelen = parts.name.len() as libc::socklen_t;
    parts.hdr.msg_iov = &mut parts.iov;
    parts.hdr.msg_iovlen = 1;

    let (key, user_data) = acquire(OpType::RecvMsg, me)?;
    let entry = opcode::RecvMsg::new(Fd(fd), &mut parts.hdr)
        .flags(flags as u32)
        .build()
        .user_data(user_data);
    push_entry(key, &entry)?;
    let out = submit_and_await(key)?;
    if !out.completed {
        attach(key, KernelBuf::Msg(parts));
        return Err(resume_error(out.resume));
    }
    check_injected(&out)?;
    if out.result < 0 {
        return Err(Error::from_neg(out.result));
    }
    let n = out.result as usize;
    unsafe { parts.data.set_len(n) };
    buf.extend_from_slice(&parts.data);
    let addr = parts.name[..parts.hdr.msg_namelen as usize].to_vec();
    Ok((n, addr, parts.hdr.msg_flags))
}

pub(crate) fn send(fd: RawFd, buf: &[u8], flags: i32) -> Result<usize> {
    let me = current_fiber()?;
    let data: Vec<u8> = buf.to_vec();
    let total = data.len();
    let mut sent = 0usize;

    while sent < total {
        let ptr = unsafe { data.as_ptr().add(sent) };
        let left = total - sent;

        let (key, user_data) = acquire(OpType::Send, me)?;
        let entry = opcode::Send::new(Fd(fd), ptr, left as u32)
            .flags(flags)
            .build()
            .user_data(user_data);
        push_entry(key, &entry)?;
        let out = submit_and_await(key)?;
        if !out.completed {
            attach(key, KernelBuf::Bytes(data));
            return Err(resume_error(out.resume));
        }
        check_injected(&out)?;
        if out.result < 0 {
            return Err(Error::from_neg(out.result));
        }
        sent += out.result as usize;
    }
    Ok(total)
}

pub(crate) fn sendmsg(fd: RawFd, buf: &[u8], flags: i32, dest: Option<&[u8]>) -> Result<usize> {
    let me = current_fiber()?;
    let mut parts = Box::new(MsgParts {
        hdr: unsafe { std::mem::zeroed() },
        iov: libc::iovec {
            iov_base: std::ptr::null_mut(),
            iov_len: 0,
        },
        name: [0u8; 128],
        control: Vec::new(),
        data: buf.to_vec(),
    });
    parts.iov.iov_base = parts.data.as_ptr() as *mut libc::c_void;
    parts.iov.iov_len = parts.data.len();
    if let Some(dest) = dest {
        let len = dest.len().min(parts.name.len());
        parts.name[..len].copy_from_slice(&dest[..len]);
        parts.hdr.msg_name = parts.name.as_mut_ptr() as *mut libc::c_void;
        parts.hdr.msg_namelen = len as libc::socklen_t;
    }
    parts.hdr.msg_iov = &mut parts.iov;
    parts.hdr.msg_iovlen = 1;

    let (key, user_data) = acquire(OpType::SendMsg, me)?;
    let entry = opcode::SendMsg::new(Fd(fd), &parts.hdr)
        .flags(flags as u32)
        .build()
        .user_data(user_data);
    push_entry(key, &entry)?;
    let out = submit_and_await(key)?;
    if !out.completed {
        attach(key, KernelBuf::Msg(parts));
        return Err(resume_error(out.resume));
    }
    check_injected(&out)?;
    if out.result < 0 {
        return Err(Error::from_neg(out.result));
    }
    Ok(out.result as usize)
}

pub(crate) fn accept(server: RawFd) -> Result<RawFd> {
    let armed = with_uring(|u, _, _| u.accept_queues.contains_key(&server))?;
    if armed {
        return accept_from_queue(server);
    }
    accept_oneshot(server)
}

fn accept_oneshot(server: RawFd) -> Result<RawFd> {
    let me = current_fiber()?;
    let (key, user_data) = acquire(OpType::Accept, me)?;
    let entry = opcode::Accept::new(Fd(server), std::ptr::null_mut(), std::ptr::null_mut())
        .build()
        .user_data(user_data);
    push_entry(key, &entry)?;
    let out = submit_and_await(key)?;
    if !out.completed {
        return Err(resume_error(out.resume));
    }
    check_injected(&out)?;
    if out.result < 0 {
        return Err(Error::from_neg(out.result));
    }
    Ok(out.result as RawFd)
}

fn accept_from_queue(server: RawFd) -> Result<RawFd> {
    let me = current_fiber()?;
    loop {
        let ready = with_uring(|u, _, _| match u.accept_queues.get_mut(&server) {
            Some(state) => match state.ready.shift() {
                Some(fd) => Some(Some(fd)),
                None => {
                    state.waiters.push(me);
                    Some(None)
                }
            },
            None => None,
        })?;
        match ready {
            None => {
                // Multishot gone (terminated by the kernel); fall back.
                return accept_oneshot(server);
            }
            Some(Some(fd)) => {
                if fd < 0 {
                    return Err(Error::from_neg(fd));
                }
                return Ok(fd as RawFd);
            }
            Some(None) => {
                let resumed = wait_event_impl();
                let _ = with_uring(|u, _, _| {
                    if let Some(state) = u.accept_queues.get_mut(&server) {
                        state.waiters.delete(&me);
                    }
                });
                resumed?.into_result()?;
            }
        }
    }
}

/// Cancels the multishot accept when the loop exits for any reason.
struct MultishotAcceptGuard {
    server: RawFd,
}

impl Drop for MultishotAcceptGuard {
    fn drop(&mut self) {
        let _ = with_uring(|u, _, _| {
            if let Some(state) = u.accept_queues.remove(&self.server) {
                u.push_cancel(state.ctx);
            }
        });
    }
}

pub(crate) fn accept_loop(
    server: RawFd,
    mut f: Box<dyn FnMut(RawFd) -> Result<()> + '_>,
) -> Result<()> {
    let multishot = with_uring(|u, _, _| u.multishot_accept)?;
    if !multishot {
        loop {
            let fd = accept_oneshot(server)?;
            f(fd)?;
        }
    }

    with_uring(|u, _, base| {
        let key = u.store.acquire(OpType::MultishotAccept, None);
        u.store.get_mut(key).ref_count = MULTISHOT_REFCOUNT;
        let entry = opcode::AcceptMulti::new(Fd(server))
            .build()
            .user_data(u.store.user_data(key));
        u.push_or_flush(&entry);
        base.op_count += 1;
        u.defer_submit();
        u.accept_queues.insert(
            server,
            AcceptState {
                ctx: key,
                ready: RingBuffer::new(),
                waiters: RingBuffer::new(),
            },
        );
    })?;
    let _guard = MultishotAcceptGuard { server };

    loop {
        let fd = accept_from_queue(server)?;
        f(fd)?;
    }
}

pub(crate) fn connect(fd: RawFd, addr: &SocketAddr) -> Result<()> {
    let me = current_fiber()?;
    let (storage, len) = crate::backend::sockaddr_from(addr);
    let store = Box::new(SockaddrStore { storage, len });
    let (key, user_data) = acquire(OpType::Connect, me)?;
    let entry = opcode::Connect::new(
        Fd(fd),
        &store.storage as *const libc::sockaddr_storage as *const libc::sockaddr,
        store.len,
    )
    .build()
    .user_data(user_data);
    push_entry(key, &entry)?;
    let out = submit_and_await(key)?;
    if !out.completed {
        attach(key, KernelBuf::Sockaddr(store));
        return Err(resume_error(out.resume));
    }
    check_injected(&out)?;
    if out.result < 0 {
        return Err(Error::from_neg(out.result));
    }
    Ok(())
}

pub(crate) fn close(fd: RawFd) -> Result<()> {
    let me = current_fiber()?;
    let (key, user_data) = acquire(OpType::Close, me)?;
    let entry = opcode::Close::new(Fd(fd)).build().user_data(user_data);
    push_entry(key, &entry)?;
    let out = submit_and_await(key)?;
    if !out.completed {
        return Err(resume_error(out.resume));
    }
    check_injected(&out)?;
    if out.result < 0 {
        return Err(Error::from_neg(out.result));
    }
    Ok(())
}

/// Park until `fd` reports the requested readiness.
fn wait_fd(fd: RawFd, write: bool) -> Result<Resume> {
    let me = current_fiber()?;
    let events = if write { libc::POLLOUT } else { libc::POLLIN } as u32;
    let (key, user_data) = acquire(OpType::Poll, me)?;
    let entry = opcode::PollAdd::new(Fd(fd), events)
        .build()
        .user_data(user_data);
    push_entry(key, &entry)?;
    let out = submit_and_await(key)?;
    if !out.completed {
        return Err(resume_error(out.resume));
    }
    Ok(out.resume)
}

pub(crate) fn wait_io(fd: RawFd, write: bool) -> Result<()> {
    wait_fd(fd, write)?.into_result().map(|_| ())
}

// ─── Transfer ops ───

pub(crate) fn splice(src: RawFd, dst: RawFd, maxlen: isize) -> Result<usize> {
    let me = current_fiber()?;
    let to_eof = maxlen < 0;
    let len = maxlen.unsigned_abs().min(u32::MAX as usize) as u32;
    let mut total = 0usize;

    loop {
        let (key, user_data) = acquire(OpType::Splice, me)?;
        let entry = opcode::Splice::new(Fd(src), -1, Fd(dst), -1, len)
            .build()
            .user_data(user_data);
        push_entry(key, &entry)?;
        let out = submit_and_await(key)?;
        if !out.completed {
            return Err(resume_error(out.resume));
        }
        check_injected(&out)?;
        if out.result < 0 {
            return Err(Error::from_neg(out.result));
        }
        total += out.result as usize;
        if out.result == 0 || !to_eof {
            return Ok(total);
        }
    }
}

pub(crate) fn tee(src: RawFd, dst: RawFd, maxlen: usize) -> Result<usize> {
    let me = current_fiber()?;
    let (key, user_data) = acquire(OpType::Splice, me)?;
    let entry = opcode::Tee::new(Fd(src), Fd(dst), maxlen.min(u32::MAX as usize) as u32)
        .build()
        .user_data(user_data);
    push_entry(key, &entry)?;
    let out = submit_and_await(key)?;
    if !out.completed {
        return Err(resume_error(out.resume));
    }
    check_injected(&out)?;
    if out.result < 0 {
        return Err(Error::from_neg(out.result));
    }
    Ok(out.result as usize)
}

/// Both halves of the src → pipe → dst relay as concurrently pending
/// splices, re-armed independently as each completes.
pub(crate) fn double_splice(src: RawFd, dst: RawFd) -> Result<usize> {
    let me = current_fiber()?;
    let mut pipefd = [0 as RawFd; 2];
    if unsafe { libc::pipe2(pipefd.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(Error::last_os_error());
    }
    let mut write_closed = false;
    let result = double_splice_inner(me, src, dst, pipefd, &mut write_closed);
    unsafe {
        libc::close(pipefd[0]);
        if !write_closed {
            libc::close(pipefd[1]);
        }
    }
    result
}

fn prep_relay_splice(
    u: &mut UringBackend,
    base: &mut Base,
    me: FiberId,
    from: RawFd,
    to: RawFd,
) -> CtxKey {
    let key = u.store.acquire(OpType::Splice, Some(me));
    let entry = opcode::Splice::new(Fd(from), -1, Fd(to), -1, DOUBLE_SPLICE_MAXLEN)
        .build()
        .user_data(u.store.user_data(key));
    u.push_or_flush(&entry);
    base.op_count += 1;
    u.defer_submit();
    key
}

/// Cancel whatever relay ops are still outstanding so no stale
/// completion can wake this fiber after the relay bailed out.
fn cancel_relay(ctx_src: &mut Option<CtxKey>, ctx_dst: &mut Option<CtxKey>) {
    let _ = with_uring(|u, _, _| {
        for key in [ctx_src.take(), ctx_dst.take()].into_iter().flatten() {
            let ctx = u.store.get_mut(key);
            ctx.result = -libc::ECANCELED;
            ctx.fiber = None;
            u.store.release(key);
            u.push_cancel(key);
        }
    });
}

fn double_splice_inner(
    me: FiberId,
    src: RawFd,
    dst: RawFd,
    pipefd: [RawFd; 2],
    write_closed: &mut bool,
) -> Result<usize> {
    let mut ctx_src =
        Some(with_uring(|u, _, base| prep_relay_splice(u, base, me, src, pipefd[1]))?);
    let mut ctx_dst =
        Some(with_uring(|u, _, base| prep_relay_splice(u, base, me, pipefd[0], dst))?);
    let mut total = 0usize;

    loop {
        let resume = backend_await();

        let (src_rc, dst_rc) = with_uring(|u, _, _| {
            (
                ctx_src.map(|k| u.store.get(k).ref_count),
                ctx_dst.map(|k| u.store.get(k).ref_count),
            )
        })?;

        let no_progress = src_rc.unwrap_or(1) == 2 && dst_rc.unwrap_or(1) == 2;
        if resume.is_err() || no_progress {
            cancel_relay(&mut ctx_src, &mut ctx_dst);
            resume.into_result()?;
            return Err(Error::Sys(libc::ECANCELED));
        }

        if let Some(key) = ctx_src {
            if src_rc == Some(1) {
                let res = with_uring(|u, _, _| {
                    let res = u.store.get(key).result;
                    u.store.release(key);
                    res
                })?;
                ctx_src = None;
                if res < 0 {
                    cancel_relay(&mut ctx_src, &mut ctx_dst);
                    return Err(Error::from_neg(res));
                }
                if res == 0 {
                    // Source hit EOF: close the pipe's write end so the
                    // drain side sees EOF too.
                    unsafe { libc::close(pipefd[1]) };
                    *write_closed = true;
                } else {
                    ctx_src = Some(with_uring(|u, _, base| {
                        prep_relay_splice(u, base, me, src, pipefd[1])
                    })?);
                }
            }
        }

        if let Some(key) = ctx_dst {
            if dst_rc == Some(1) {
                let res = with_uring(|u, _, _| {
                    let res = u.store.get(key).result;
                    u.store.release(key);
                    res
                })?;
                ctx_dst = None;
                if res < 0 {
                    cancel_relay(&mut ctx_src, &mut ctx_dst);
                    return Err(Error::from_neg(res));
                }
                if res == 0 {
                    cancel_relay(&mut ctx_src, &mut ctx_dst);
                    return Ok(total);
                }
                total += res as usize;
                ctx_dst = Some(with_uring(|u, _, base| {
                    prep_relay_splice(u, base, me, pipefd[0], dst)
                })?);
            }
        }
    }
}

// ─── Chains ───

/// Accumulates SQEs sharing one context; consecutive entries are linked
/// and awaited as a unit. The context's ref-count is the number of
/// kernel-held links plus the submitter.
struct ChainBatch {
    me: FiberId,
    key: Option<CtxKey>,
    entries: Vec<squeue::Entry>,
    bufs: Vec<Vec<u8>>,
}

impl ChainBatch {
    fn new(me: FiberId) -> Self {
        Self {
            me,
            key: None,
            entries: Vec::new(),
            bufs: Vec::new(),
        }
    }

    fn ctx(&mut self) -> Result<CtxKey> {
        match self.key {
            Some(key) => Ok(key),
            None => {
                let key = with_uring(|u, _, _| u.store.acquire(OpType::Chain, Some(self.me)))?;
                self.key = Some(key);
                Ok(key)
            }
        }
    }

    fn add_write(&mut self, fd: RawFd, data: Vec<u8>) -> Result<()> {
        let key = self.ctx()?;
        let user_data = with_uring(|u, _, _| u.store.user_data(key))?;
        let ptr = data.as_ptr();
        let len = data.len() as u32;
        self.bufs.push(data);
        self.entries.push(
            opcode::Write::new(Fd(fd), ptr, len)
                .offset(u64::MAX)
                .build()
                .user_data(user_data),
        );
        Ok(())
    }

    fn add_send(&mut self, fd: RawFd, data: Vec<u8>, flags: i32) -> Result<()> {
        let key = self.ctx()?;
        let user_data = with_uring(|u, _, _| u.store.user_data(key))?;
        let ptr = data.as_ptr();
        let len = data.len() as u32;
        self.bufs.push(data);
        self.entries.push(
            opcode::Send::new(Fd(fd), ptr, len)
                .flags(flags)
                .build()
                .user_data(user_data),
        );
        Ok(())
    }

    fn add_splice(&mut self, src: RawFd, dst: RawFd, len: u32) -> Result<()> {
        let key = self.ctx()?;
        let user_data = with_uring(|u, _, _| u.store.user_data(key))?;
        self.entries.push(
            opcode::Splice::new(Fd(src), -1, Fd(dst), -1, len)
                .build()
                .user_data(user_data),
        );
        Ok(())
    }

    /// Submit the accumulated links and park until all complete. Returns
    /// the result of the last link.
    fn await_ops(&mut self) -> Result<i32> {
        let Some(key) = self.key.take() else {
            return Ok(0);
        };
        let entries = std::mem::take(&mut self.entries);
        let link_count = entries.len() as i32;
        let last = entries.len() - 1;

        with_uring(|u, _, base| {
            u.store.get_mut(key).ref_count = link_count + 1;
            for (i, entry) in entries.into_iter().enumerate() {
                let entry = if i < last {
                    entry.flags(squeue::Flags::IO_LINK)
                } else {
                    entry
                };
                u.push_or_flush(&entry);
            }
            base.op_count += link_count as u64;
            u.defer_submit();
        })?;

        let resume = backend_await();

        let (result, completed) = with_uring(|u, _, _| {
            if u.store.get(key).ref_count > 1 {
                let ctx = u.store.get_mut(key);
                ctx.result = -libc::ECANCELED;
                ctx.fiber = None;
                u.push_cancel(key);
            }
            let result = u.store.get(key).result;
            let completed = u.store.release(key);
            (result, completed)
        })?;

        if !completed {
            for buf in self.bufs.drain(..) {
                attach(key, KernelBuf::Bytes(buf));
            }
            return Err(resume_error(resume));
        }
        self.bufs.clear();
        if result < 0 {
            return Err(Error::from_neg(result));
        }
        Ok(result)
    }
}

pub(crate) fn chain(ops: &[ChainOp]) -> Result<i64> {
    let me = current_fiber()?;
    let mut batch = ChainBatch::new(me);
    for op in ops {
        match op {
            ChainOp::Write { fd, buf } => batch.add_write(*fd, buf.to_vec())?,
            ChainOp::Send { fd, buf, flags } => batch.add_send(*fd, buf.to_vec(), *flags)?,
            ChainOp::Splice { src, dst, len } => batch.add_splice(*src, *dst, *len)?,
        }
    }
    batch.await_ops().map(|r| r as i64)
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn splice_chunks(
    src: RawFd,
    dst: RawFd,
    prefix: Option<&[u8]>,
    postfix: Option<&[u8]>,
    chunk_prefix: Option<&ChunkText>,
    chunk_postfix: Option<&ChunkText>,
    chunk_size: usize,
) -> Result<usize> {
    let me = current_fiber()?;
    let mut pipefd = [0 as RawFd; 2];
    if unsafe { libc::pipe2(pipefd.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(Error::last_os_error());
    }
    let result = splice_chunks_inner(
        me,
        src,
        dst,
        prefix,
        postfix,
        chunk_prefix,
        chunk_postfix,
        chunk_size,
        pipefd,
    );
    unsafe {
        libc::close(pipefd[0]);
        libc::close(pipefd[1]);
    }
    result
}

#[allow(clippy::too_many_arguments)]
fn splice_chunks_inner(
    me: FiberId,
    src: RawFd,
    dst: RawFd,
    prefix: Option<&[u8]>,
    postfix: Option<&[u8]>,
    chunk_prefix: Option<&ChunkText>,
    chunk_postfix: Option<&ChunkText>,
    chunk_size: usize,
    pipefd: [RawFd; 2],
) -> Result<usize> {
    let mut total = 0usize;
    let mut batch = ChainBatch::new(me);

    if let Some(prefix) = prefix {
        batch.add_write(dst, prefix.to_vec())?;
    }
    loop {
        batch.add_splice(src, pipefd[1], chunk_size.min(u32::MAX as usize) as u32)?;
        let chunk_len = batch.await_ops()? as usize;
        if chunk_len == 0 {
            break;
        }
        total += chunk_len;

        if let Some(text) = chunk_prefix {
            batch.add_write(dst, render_chunk_text(text, chunk_len))?;
        }
        batch.add_splice(pipefd[0], dst, chunk_len as u32)?;
        if let Some(text) = chunk_postfix {
            batch.add_write(dst, render_chunk_text(text, chunk_len))?;
        }
    }
    if let Some(postfix) = postfix {
        batch.add_write(dst, postfix.to_vec())?;
    }
    if batch.key.is_some() {
        batch.await_ops()?;
    }
    Ok(total)
}

fn render_chunk_text(text: &ChunkText, chunk_len: usize) -> Vec<u8> {
    match text {
        ChunkText::Bytes(b) => b.to_vec(),
        ChunkText::Make(f) => f(chunk_len),
    }
}

// ─── Timing ops ───

fn timespec(duration: Duration) -> Timespec {
    Timespec::new()
        .sec(duration.as_secs())
        .nsec(duration.subsec_nanos())
}

pub(crate) fn sleep(duration: Duration) -> Result<()> {
    let me = current_fiber()?;
    let ts = Box::new(timespec(duration));
    let (key, user_data) = acquire(OpType::Timeout, me)?;
    let entry = opcode::Timeout::new(&*ts).build().user_data(user_data);
    push_entry(key, &entry)?;
    let out = submit_and_await(key)?;
    if !out.completed {
        attach(key, KernelBuf::Timespec(ts));
        return Err(resume_error(out.resume));
    }
    check_injected(&out)?;
    // -ETIME is the normal expiry result.
    Ok(())
}

/// Tear down the armed timeout op after the race block exits. Returns
/// whether the timer actually fired (its CQE was observed), which
/// distinguishes this race's timeout from one raised by a nested race.
fn disarm_timeout(key: CtxKey) -> bool {
    with_uring(|u, _, _| {
        let fired = u.store.get(key).ref_count == 1;
        if !fired {
            let ctx = u.store.get_mut(key);
            ctx.result = -libc::ECANCELED;
            ctx.fiber = None;
            u.push_cancel(key);
        }
        u.store.release(key);
        fired
    })
    .unwrap_or(false)
}

pub(crate) fn timeout_race<T>(
    duration: Duration,
    f: impl FnOnce() -> Result<T>,
) -> Result<Option<T>> {
    let me = current_fiber()?;
    let ts = Box::new(timespec(duration));
    let (key, user_data) = with_uring(|u, _, base| {
        let key = u.store.acquire(OpType::Timeout, Some(me));
        u.store.get_mut(key).resume = Resume::Err(Error::Timeout);
        base.op_count += 1;
        (key, u.store.user_data(key))
    })?;
    let entry = opcode::Timeout::new(&*ts).build().user_data(user_data);
    push_entry(key, &entry)?;
    with_uring(|u, _, _| u.defer_submit())?;

    let outcome = f();

    let fired = disarm_timeout(key);
    drop(ts);
    if fired {
        crate::backend::clear_stale_timeout(me);
    }

    match outcome {
        Err(Error::Timeout) if fired => Ok(None),
        other => other.map(Some),
    }
}

/// Cancels a multishot timer when the loop exits, unless the kernel
/// already terminated (and thereby released) it.
struct TimerLoopGuard {
    key: CtxKey,
    armed: std::cell::Cell<bool>,
}

impl Drop for TimerLoopGuard {
    fn drop(&mut self) {
        if !self.armed.get() {
            return;
        }
        let _ = with_uring(|u, _, _| {
            // The handler releases the context when the cancellation CQE
            // arrives.
            u.push_cancel(self.key);
        });
    }
}

pub(crate) fn timer_loop(
    interval: Duration,
    mut f: Box<dyn FnMut() -> Result<bool> + '_>,
) -> Result<()> {
    let me = current_fiber()?;
    let ts = Box::new(timespec(interval));
    let (key, user_data) = with_uring(|u, _, base| {
        let key = u.store.acquire(OpType::MultishotTimeout, Some(me));
        u.store.get_mut(key).ref_count = MULTISHOT_REFCOUNT;
        base.op_count += 1;
        (key, u.store.user_data(key))
    })?;
    let entry = opcode::Timeout::new(&*ts)
        .count(0)
        .flags(TimeoutFlags::MULTISHOT)
        .build()
        .user_data(user_data);
    push_entry(key, &entry)?;
    with_uring(|u, _, _| u.defer_submit())?;
    let guard = TimerLoopGuard {
        key,
        armed: std::cell::Cell::new(true),
    };

    loop {
        let resumed = backend_await().into_result()?;
        if resumed == Resume::Value(0) {
            // The kernel ended the multishot and released the context.
            guard.armed.set(false);
            debug!("multishot timer terminated by the kernel");
            return Ok(());
        }
        if !f()? {
            return Ok(());
        }
    }
}

// ─── Parking ───

/// Park with no op of our own: poll an eventfd that is never signalled.
/// The fd and its poll context are shared by all concurrent waiters and
/// reference-counted; the last waiter out cancels the poll.
pub(crate) fn wait_event_impl() -> Result<Resume> {
    with_uring(|u, _, base| -> Result<()> {
        if u.event_fd < 0 {
            let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
            if fd < 0 {
                return Err(Error::last_os_error());
            }
            u.event_fd = fd;
        }
        match u.event_fd_ctx {
            None => {
                let key = u.store.acquire(OpType::Poll, None);
                let entry = opcode::PollAdd::new(Fd(u.event_fd), WAKEUP_POLLIN)
                    .build()
                    .user_data(u.store.user_data(key));
                u.push_or_flush(&entry);
                base.op_count += 1;
                u.defer_submit();
                u.event_fd_ctx = Some(key);
            }
            Some(key) => {
                u.store.get_mut(key).ref_count += 1;
            }
        }
        Ok(())
    })??;

    let resume = backend_await();

    with_uring(|u, _, _| {
        if let Some(key) = u.event_fd_ctx {
            if u.store.release(key) {
                // The kernel had already let go (spurious completion);
                // the context is gone.
                u.event_fd_ctx = None;
            } else if u.store.get(key).ref_count == 1 {
                // Last waiter out: only the kernel still holds the poll.
                u.push_cancel(key);
                u.event_fd_ctx = None;
            }
        }
    })?;

    Ok(resume)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timespec_zero_and_fractional() {
        let _ = timespec(Duration::ZERO);
        let _ = timespec(Duration::from_millis(1500));
    }
}
