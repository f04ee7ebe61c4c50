//! Per-operation context store for the completion backend.
//!
//! Every submission owns a context shared between the submitting fiber
//! and the kernel: the kernel's reference is dropped when its CQE is
//! observed, the fiber's when it resumes. The context returns to the free
//! list exactly when the count reaches zero; a sentinel count marks
//! multishot contexts that survive individual completions.
//!
//! Contexts live in a generational arena; SQE user_data carries the
//! packed (generation, index) so a CQE for an already-recycled context
//! fails the generation check and is dropped instead of touching a
//! reused slot.

use weft_core::{FiberId, Resume};

/// Sentinel ref-count: never auto-released on a single CQE.
pub const MULTISHOT_REFCOUNT: i32 = -1;

/// user_data value for SQEs with no context (cancellations, no-ops).
pub const NO_CONTEXT: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    Read,
    Write,
    Writev,
    Recv,
    RecvMsg,
    Send,
    SendMsg,
    Splice,
    Poll,
    Timeout,
    Accept,
    Connect,
    Close,
    Chain,
    MultishotAccept,
    MultishotTimeout,
}

/// Kernel-visible memory owned by a context. Anything the kernel may
/// still read or write after the submitting fiber unwound must live
/// here, so it is freed only when the kernel's reference is dropped.
pub enum KernelBuf {
    Bytes(Vec<u8>),
    Timespec(Box<io_uring::types::Timespec>),
    Sockaddr(Box<SockaddrStore>),
    Msg(Box<MsgParts>),
    Iovecs(Box<[libc::iovec]>),
}

#[repr(C)]
pub struct SockaddrStore {
    pub storage: libc::sockaddr_storage,
    pub len: libc::socklen_t,
}

/// Backing for a sendmsg/recvmsg: the msghdr plus everything it points
/// at. Boxed so the addresses stay stable once wired.
#[repr(C)]
pub struct MsgParts {
    pub hdr: libc::msghdr,
    pub iov: libc::iovec,
    pub name: [u8; 128],
    pub control: Vec<u8>,
    pub data: Vec<u8>,
}

pub struct OpCtx {
    /// Monotonic id, for logs.
    pub id: u64,
    pub ty: OpType,
    pub fiber: Option<FiberId>,
    /// Kernel return value of the (last) CQE.
    pub result: i32,
    /// Value the waiter is resumed with on completion.
    pub resume: Resume,
    pub ref_count: i32,
    pub buffers: Vec<KernelBuf>,
}

/// Compact key for a context slot. The generation is re-checked on every
/// lookup from a CQE.
pub type CtxKey = u32;

struct Slot {
    generation: u32,
    ctx: Option<OpCtx>,
    prev: Option<u32>,
    next: Option<u32>,
}

/// Two-list context store: `available` (free contexts kept for reuse) and
/// `taken` (in-flight), both threaded through the slots.
pub struct ContextStore {
    slots: Vec<Slot>,
    available: Option<u32>,
    taken: Option<u32>,
    taken_count: usize,
    last_id: u64,
}

impl ContextStore {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            available: None,
            taken: None,
            taken_count: 0,
            last_id: 0,
        }
    }

    /// Take a context off the free list (or allocate one), initialize it
    /// for `ty` with ref-count 2, and thread it onto the taken list.
    pub fn acquire(&mut self, ty: OpType, fiber: Option<FiberId>) -> CtxKey {
        let key = match self.available {
            Some(key) => {
                self.unlink_available(key);
                key
            }
            None => {
                let key = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    ctx: None,
                    prev: None,
                    next: None,
                });
                key
            }
        };
        self.last_id += 1;
        self.slots[key as usize].ctx = Some(OpCtx {
            id: self.last_id,
            ty,
            fiber,
            result: 0,
            resume: Resume::Unit,
            ref_count: 2,
            buffers: Vec::new(),
        });
        self.link_taken(key);
        key
    }

    /// Drop one reference. Returns `true` when the context was released
    /// back to the free list (its buffers are freed at that point).
    pub fn release(&mut self, key: CtxKey) -> bool {
        let slot = &mut self.slots[key as usize];
        let ctx = slot.ctx.as_mut().expect("release of free context");
        debug_assert!(ctx.ref_count != 0, "context over-released");
        if ctx.ref_count == MULTISHOT_REFCOUNT {
            ctx.ref_count = 1;
        }
        ctx.ref_count -= 1;
        if ctx.ref_count > 0 {
            return false;
        }
        slot.ctx = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.unlink_taken(key);
        self.link_available(key);
        true
    }

    /// Drop all remaining references, freeing the context.
    pub fn release_all(&mut self, key: CtxKey) {
        self.get_mut(key).ref_count = 1;
        self.release(key);
    }

    /// Look a CQE's user_data back up; `None` for stale or context-free
    /// completions.
    pub fn check(&self, user_data: u64) -> Option<CtxKey> {
        if user_data == NO_CONTEXT {
            return None;
        }
        let index = user_data as u32;
        let generation = (user_data >> 32) as u32;
        let slot = self.slots.get(index as usize)?;
        if slot.generation != generation || slot.ctx.is_none() {
            return None;
        }
        Some(index)
    }

    /// The packed user_data for a live context.
    pub fn user_data(&self, key: CtxKey) -> u64 {
        let slot = &self.slots[key as usize];
        debug_assert!(slot.ctx.is_some());
        ((slot.generation as u64) << 32) | key as u64
    }

    #[inline]
    pub fn get(&self, key: CtxKey) -> &OpCtx {
        self.slots[key as usize].ctx.as_ref().expect("free context")
    }

    #[inline]
    pub fn get_mut(&mut self, key: CtxKey) -> &mut OpCtx {
        self.slots[key as usize].ctx.as_mut().expect("free context")
    }

    pub fn taken_count(&self) -> usize {
        self.taken_count
    }

    /// Trim trailing free slots so a burst of ops does not pin arena
    /// memory forever. Run from the periodic idle task.
    pub fn compact(&mut self) {
        while let Some(slot) = self.slots.last() {
            if slot.ctx.is_some() {
                break;
            }
            let key = (self.slots.len() - 1) as u32;
            if !self.on_available(key) {
                break;
            }
            self.unlink_available(key);
            self.slots.pop();
        }
        self.slots.shrink_to_fit();
    }

    /// Drop everything, in-flight included. Only valid when the kernel
    /// side is gone too (post-fork reinitialization).
    pub fn clear(&mut self) {
        self.slots.clear();
        self.available = None;
        self.taken = None;
        self.taken_count = 0;
    }

    fn on_available(&self, key: CtxKey) -> bool {
        let mut cursor = self.available;
        while let Some(k) = cursor {
            if k == key {
                return true;
            }
            cursor = self.slots[k as usize].next;
        }
        false
    }

    fn link_taken(&mut self, key: CtxKey) {
        let old_head = self.taken;
        {
            let slot = &mut self.slots[key as usize];
            slot.prev = None;
            slot.next = old_head;
        }
        if let Some(next) = old_head {
            self.slots[next as usize].prev = Some(key);
        }
        self.taken = Some(key);
        self.taken_count += 1;
    }

    fn unlink_taken(&mut self, key: CtxKey) {
        let (prev, next) = {
            let slot = &mut self.slots[key as usize];
            let pair = (slot.prev, slot.next);
            slot.prev = None;
            slot.next = None;
            pair
        };
        match prev {
            Some(p) => self.slots[p as usize].next = next,
            None => self.taken = next,
        }
        if let Some(n) = next {
            self.slots[n as usize].prev = prev;
        }
        self.taken_count -= 1;
    }

    fn link_available(&mut self, key: CtxKey) {
        let old_head = self.available;
        {
            let slot = &mut self.slots[key as usize];
            slot.prev = None;
            slot.next = old_head;
        }
        if let Some(next) = old_head {
            self.slots[next as usize].prev = Some(key);
        }
        self.available = Some(key);
    }

    fn unlink_available(&mut self, key: CtxKey) {
        let (prev, next) = {
            let slot = &mut self.slots[key as usize];
            let pair = (slot.prev, slot.next);
            slot.prev = None;
            slot.next = None;
            pair
        };
        match prev {
            Some(p) => self.slots[p as usize].next = next,
            None => self.available = next,
        }
        if let Some(n) = next {
            self.slots[n as usize].prev = prev;
        }
    }
}

impl Default for ContextStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_initializes_refcount_two() {
        let mut store = ContextStore::new();
        let key = store.acquire(OpType::Read, Some(FiberId::new(0, 0)));
        assert_eq!(store.get(key).ref_count, 2);
        assert_eq!(store.taken_count(), 1);
    }

    #[test]
    fn test_release_twice_frees() {
        let mut store = ContextStore::new();
        let key = store.acquire(OpType::Write, None);
        assert!(!store.release(key));
        assert_eq!(store.taken_count(), 1);
        assert!(store.release(key));
        assert_eq!(store.taken_count(), 0);
    }

    #[test]
    fn test_stale_user_data_is_dropped() {
        let mut store = ContextStore::new();
        let key = store.acquire(OpType::Recv, None);
        let ud = store.user_data(key);
        assert_eq!(store.check(ud), Some(key));
        store.release_all(key);
        assert_eq!(store.check(ud), None);

        // Reusing the slot changes the generation, so the old user_data
        // still misses.
        let key2 = store.acquire(OpType::Recv, None);
        assert_eq!(key2, key);
        assert_eq!(store.check(ud), None);
        assert_eq!(store.check(store.user_data(key2)), Some(key2));
    }

    #[test]
    fn test_ids_are_monotonic() {
        let mut store = ContextStore::new();
        let a = store.acquire(OpType::Read, None);
        let id_a = store.get(a).id;
        store.release_all(a);
        let b = store.acquire(OpType::Read, None);
        assert!(store.get(b).id > id_a);
    }

    #[test]
    fn test_multishot_survives_single_release() {
        let mut store = ContextStore::new();
        let key = store.acquire(OpType::MultishotAccept, None);
        store.get_mut(key).ref_count = MULTISHOT_REFCOUNT;
        // The final release of a multishot frees it in one step.
        assert!(store.release(key));
        assert_eq!(store.taken_count(), 0);
    }

    #[test]
    fn test_no_context_sentinel() {
        let store = ContextStore::new();
        assert_eq!(store.check(NO_CONTEXT), None);
    }

    #[test]
    fn test_reuse_from_free_list() {
        let mut store = ContextStore::new();
        let a = store.acquire(OpType::Read, None);
        let b = store.acquire(OpType::Read, None);
        store.release_all(a);
        let c = store.acquire(OpType::Read, None);
        assert_eq!(c, a);
        store.release_all(b);
        store.release_all(c);
        assert_eq!(store.taken_count(), 0);
    }
}
