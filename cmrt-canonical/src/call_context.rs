// CMRT - cmrt-canonical
// Module: Call contexts and canonical options
//
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! Lift/lower options and the per-call context.
//!
//! The embedding engine hands the runtime three things per call: a view
//! of the guest's linear memory, a `realloc` thunk, and an optional
//! trap hook. [`LiftLowerOptions`] bundles the adjustable knobs,
//! [`CanonicalOptions`] extends them with the async surface, and
//! [`LiftLowerContext`] carries both plus the borrow-scope bookkeeping
//! that must be settled when the call exits.

use crate::async_::events::EventCode;
use crate::instance::ComponentInstance;
use crate::memory_layout::align_to;
use crate::prelude::*;
use crate::string_encoding::{HostTranscoder, StringEncoding};
use crate::types::ResourceTypeId;

/// Shared, bounds-checked view of a guest linear memory.
///
/// The backing buffer is shared with the engine for the duration of a
/// call; every access re-checks bounds against the current length, so
/// a grown memory is picked up without re-plumbing.
#[derive(Clone, Default)]
pub struct GuestMemory {
    bytes: Rc<RefCell<Vec<u8>>>,
}

impl GuestMemory {
    /// A zero-filled memory of `size` bytes
    pub fn new(size: usize) -> Self {
        Self { bytes: Rc::new(RefCell::new(vec![0; size])) }
    }

    /// Wrap an existing buffer
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes: Rc::new(RefCell::new(bytes)) }
    }

    /// Current length in bytes
    pub fn len(&self) -> usize {
        self.bytes.borrow().len()
    }

    /// Is the memory empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Trap unless `ptr` is aligned to `alignment`
    pub fn check_aligned(&self, ptr: u32, alignment: u32) -> Result<()> {
        if alignment > 1 && ptr != align_to(ptr, alignment) {
            return Err(Error::memory_misaligned("misaligned memory access"));
        }
        Ok(())
    }

    /// Trap unless `[ptr, ptr + byte_len)` lies inside the memory
    pub fn check_range(&self, ptr: u32, byte_len: u64) -> Result<()> {
        if u64::from(ptr) + byte_len > self.len() as u64 {
            return Err(Error::memory_out_of_bounds("memory access out of bounds"));
        }
        Ok(())
    }

    /// Read `len` bytes at `ptr`
    pub fn read(&self, ptr: u32, len: u32) -> Result<Vec<u8>> {
        self.check_range(ptr, u64::from(len))?;
        let bytes = self.bytes.borrow();
        Ok(bytes[ptr as usize..(ptr + len) as usize].to_vec())
    }

    /// Write `data` at `ptr`
    pub fn write(&self, ptr: u32, data: &[u8]) -> Result<()> {
        self.check_range(ptr, data.len() as u64)?;
        let mut bytes = self.bytes.borrow_mut();
        bytes[ptr as usize..ptr as usize + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Read a little-endian u32 at `ptr`
    pub fn read_u32(&self, ptr: u32) -> Result<u32> {
        let bytes = self.read(ptr, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Write a little-endian u32 at `ptr`
    pub fn write_u32(&self, ptr: u32, value: u32) -> Result<()> {
        self.write(ptr, &value.to_le_bytes())
    }

    /// Run `f` over the raw buffer
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.bytes.borrow_mut())
    }
}

impl fmt::Debug for GuestMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestMemory").field("len", &self.len()).finish()
    }
}

/// Guest allocator thunk: `(old_ptr, old_size, alignment, new_size) -> new_ptr`
pub type GuestRealloc = Rc<dyn Fn(u32, u32, u32, u32) -> Result<u32>>;

/// Hook the engine runs after a lifted function returns
pub type GuestPostReturn = Rc<dyn Fn()>;

/// Async continuation the engine registered for a lowered call
pub type GuestCallback = Rc<dyn Fn(EventCode, u32, u32)>;

/// Host hook observing every trap before it propagates
pub type TrapHook = Rc<dyn Fn(&Error)>;

/// The adjustable lift/lower knobs
#[derive(Clone)]
pub struct LiftLowerOptions {
    /// Wire encoding of strings in the guest
    pub string_encoding: StringEncoding,
    /// The guest's linear memory
    pub memory: GuestMemory,
    /// Guest allocator, when the call needs one
    pub realloc: Option<GuestRealloc>,
}

impl Default for LiftLowerOptions {
    fn default() -> Self {
        Self {
            string_encoding: StringEncoding::Utf8,
            memory: GuestMemory::default(),
            realloc: None,
        }
    }
}

impl LiftLowerOptions {
    /// Call the guest allocator and validate the returned pointer.
    pub fn realloc(
        &self,
        old_ptr: u32,
        old_size: u32,
        alignment: u32,
        new_size: u32,
    ) -> Result<u32> {
        let realloc = self
            .realloc
            .as_ref()
            .ok_or(Error::allocation_failed("no realloc provided"))?;
        let ptr = realloc(old_ptr, old_size, alignment, new_size)?;
        self.memory.check_aligned(ptr, alignment)?;
        self.memory.check_range(ptr, u64::from(new_size))?;
        Ok(ptr)
    }
}

/// Full canonical options: lift/lower knobs plus the async surface
#[derive(Clone)]
pub struct CanonicalOptions {
    /// The lift/lower knobs
    pub base: LiftLowerOptions,
    /// Hook run after a lifted function returns, to free its return area
    pub post_return: Option<GuestPostReturn>,
    /// Synchronous call?
    pub sync: bool,
    /// Async continuation for event delivery
    pub callback: Option<GuestCallback>,
    /// Always deliver results through `task.return`
    pub always_task_return: bool,
}

impl Default for CanonicalOptions {
    fn default() -> Self {
        Self {
            base: LiftLowerOptions::default(),
            post_return: None,
            sync: true,
            callback: None,
            always_task_return: false,
        }
    }
}

/// Borrow scope of a single lift/lower call.
///
/// Every borrow lowered into the guest bumps the count; every
/// `resource.drop` of that borrow releases it. The count must be back
/// to zero when the call exits.
#[derive(Debug, Default)]
pub struct CallScope {
    borrow_count: Cell<u32>,
}

impl CallScope {
    /// Current number of live borrows in this scope
    pub fn borrow_count(&self) -> u32 {
        self.borrow_count.get()
    }

    /// Record a lowered borrow
    pub fn add_borrow(&self) {
        self.borrow_count.set(self.borrow_count.get() + 1);
    }

    /// Release a dropped borrow, trapping on underflow
    pub fn release_borrow(&self) -> Result<()> {
        let count = self.borrow_count.get();
        trap_if(count == 0, "borrow scope underflow")?;
        self.borrow_count.set(count - 1);
        Ok(())
    }
}

/// An own handle that lent a borrow out of this call, recorded as
/// (resource type, slot index) in the context's instance
type Lender = (ResourceTypeId, u32);

/// Per-call lift/lower context.
///
/// Owns the options, an optional trap hook and transcoder, a
/// non-owning reference to the current instance, and the borrow
/// bookkeeping settled by [`LiftLowerContext::exit_call`].
pub struct LiftLowerContext {
    /// The active lift/lower knobs
    pub opts: LiftLowerOptions,
    /// Host string transcoder
    pub transcode: HostTranscoder,
    /// Trap hook, if the engine wants to observe traps
    pub trap_hook: Option<TrapHook>,
    /// The instance this call runs against
    pub inst: Option<Rc<ComponentInstance>>,
    canonical: Option<CanonicalOptions>,
    scope: Rc<CallScope>,
    lenders: RefCell<Vec<Lender>>,
}

impl LiftLowerContext {
    /// Context from plain lift/lower options
    pub fn new(opts: LiftLowerOptions, transcode: HostTranscoder) -> Self {
        Self {
            opts,
            transcode,
            trap_hook: None,
            inst: None,
            canonical: None,
            scope: Rc::new(CallScope::default()),
            lenders: RefCell::new(Vec::new()),
        }
    }

    /// Attach the component instance this call runs against
    pub fn with_instance(mut self, inst: Rc<ComponentInstance>) -> Self {
        self.inst = Some(inst);
        self
    }

    /// Attach a trap hook
    pub fn with_trap_hook(mut self, hook: TrapHook) -> Self {
        self.trap_hook = Some(hook);
        self
    }

    /// Install canonical options; the lift/lower knobs are taken over
    pub fn set_canonical_options(&mut self, options: CanonicalOptions) {
        self.opts = options.base.clone();
        self.canonical = Some(options);
    }

    /// The canonical options, when installed
    pub fn canonical_options(&self) -> Option<&CanonicalOptions> {
        self.canonical.as_ref()
    }

    /// Is this a synchronous call? Plain contexts are synchronous.
    pub fn is_sync(&self) -> bool {
        self.canonical.as_ref().map_or(true, |c| c.sync)
    }

    /// Run the post-return hook, when one was supplied
    pub fn invoke_post_return(&self) {
        if let Some(post_return) = self.canonical.as_ref().and_then(|c| c.post_return.as_ref()) {
            post_return();
        }
    }

    /// Deliver an async event through the registered callback.
    ///
    /// Traps when the context is synchronous; a missing callback is
    /// not an error (the guest polls instead).
    pub fn notify_async_event(&self, code: EventCode, index: u32, payload: u32) -> Result<()> {
        let Some(canonical) = self.canonical.as_ref() else {
            return Ok(());
        };
        self.trap_if(canonical.sync, || {
            Error::concurrency_violation(
                codes::SYNC_CONTEXT_VIOLATION,
                "async continuation requires async canonical options",
            )
        })?;
        if let Some(callback) = canonical.callback.as_ref() {
            callback(code, index, payload);
        }
        Ok(())
    }

    /// The borrow scope of this call
    pub fn scope(&self) -> Rc<CallScope> {
        Rc::clone(&self.scope)
    }

    /// Live borrow count of this call's scope
    pub fn borrow_count(&self) -> u32 {
        self.scope.borrow_count()
    }

    /// Record an own handle that lent a borrow out of this call
    pub fn push_lender(&self, rt: ResourceTypeId, index: u32) {
        self.lenders.borrow_mut().push((rt, index));
    }

    /// Trap when `condition` holds, routing through the trap hook.
    pub fn trap_if(&self, condition: bool, error: impl FnOnce() -> Error) -> Result<()> {
        if condition {
            return Err(self.trap(error()));
        }
        Ok(())
    }

    /// Route a trap through the hook before propagating it
    pub fn trap(&self, error: Error) -> Error {
        if let Some(hook) = self.trap_hook.as_ref() {
            hook(&error);
        }
        error
    }

    /// Settle the call's borrow bookkeeping; must run on every exit
    /// path.
    ///
    /// Traps when any borrow lowered in this call is still live, then
    /// returns every lender's lend count to its pre-call value.
    pub fn exit_call(&self) -> Result<()> {
        self.trap_if(self.scope.borrow_count() != 0, || {
            Error::resource_violation(
                codes::BORROW_SCOPE_LEAK,
                "borrow count not zero on call exit",
            )
        })?;
        let lenders = mem::take(&mut *self.lenders.borrow_mut());
        if let Some(inst) = self.inst.as_ref() {
            for (rt, index) in lenders {
                inst.handles().release_lend(rt, index)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for LiftLowerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiftLowerContext")
            .field("string_encoding", &self.opts.string_encoding)
            .field("sync", &self.is_sync())
            .field("borrow_count", &self.borrow_count())
            .finish()
    }
}

/// Host-side factory bundling the per-instance hooks.
///
/// Engines typically fix the trap hook, transcoder, and realloc once
/// per instance and stamp out a context per call.
pub struct InstanceContext {
    /// Trap hook shared by all contexts from this factory
    pub trap_hook: Option<TrapHook>,
    /// Transcoder shared by all contexts from this factory
    pub transcode: HostTranscoder,
    /// Default allocator for contexts from this factory
    pub realloc: Option<GuestRealloc>,
}

impl InstanceContext {
    /// New factory from the per-instance hooks
    pub fn new(
        trap_hook: Option<TrapHook>,
        transcode: HostTranscoder,
        realloc: Option<GuestRealloc>,
    ) -> Self {
        Self { trap_hook, transcode, realloc }
    }

    /// Stamp out a context with full canonical options.
    ///
    /// The factory's realloc fills in when the options carry none.
    pub fn create_context(&self, mut options: CanonicalOptions) -> LiftLowerContext {
        if options.base.realloc.is_none() {
            options.base.realloc = self.realloc.clone();
        }
        let mut cx = LiftLowerContext::new(options.base.clone(), Rc::clone(&self.transcode));
        cx.trap_hook = self.trap_hook.clone();
        cx.set_canonical_options(options);
        cx
    }
}
