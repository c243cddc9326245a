// CMRT - cmrt-canonical
// Module: Cooperative scheduler
//
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! Single-threaded cooperative scheduling.
//!
//! A [`Store`] owns an unordered list of pending [`Thread`]s. Each
//! tick selects the first thread whose ready predicate holds, removes
//! it, and runs its resume step; the step reports whether the thread
//! stays pending. There is no preemption and no fairness guarantee
//! beyond first-ready-wins. Hosts drive progress by ticking until the
//! pending list drains or their own awaited condition holds.
//!
//! Threads are not OS threads: a thread is a ready predicate plus a
//! resume closure, i.e. a resumable state machine driven by the store.

use crate::prelude::*;

/// Ready predicate of a parked thread
pub type ReadyFn = Box<dyn Fn() -> bool>;

/// Resume step: receives whether the thread was cancelled, reports
/// whether it stays pending
pub type ResumeFn = Box<dyn FnMut(bool) -> bool>;

/// Hook fired when cancellation is requested
pub type CancelFn = Box<dyn Fn()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadState {
    Pending,
    Running,
    Completed,
}

/// A cooperative thread: a ready predicate and a resume step
pub struct Thread {
    store: RefCell<Weak<Store>>,
    ready: RefCell<Option<ReadyFn>>,
    resume: RefCell<Option<ResumeFn>>,
    on_cancel: RefCell<Option<CancelFn>>,
    cancellable: Cell<bool>,
    cancelled: Cell<bool>,
    in_event_loop: Cell<bool>,
    state: Cell<ThreadState>,
}

impl Thread {
    /// Create a thread and schedule it on `store`
    pub fn create(
        store: &Rc<Store>,
        ready: Option<ReadyFn>,
        resume: ResumeFn,
        cancellable: bool,
        on_cancel: Option<CancelFn>,
    ) -> Rc<Thread> {
        let thread = Rc::new(Thread {
            store: RefCell::new(Rc::downgrade(store)),
            ready: RefCell::new(ready),
            resume: RefCell::new(Some(resume)),
            on_cancel: RefCell::new(on_cancel),
            cancellable: Cell::new(cancellable),
            cancelled: Cell::new(false),
            in_event_loop: Cell::new(false),
            state: Cell::new(ThreadState::Pending),
        });
        store.schedule(Rc::clone(&thread));
        thread
    }

    /// Is this thread runnable right now?
    ///
    /// A requested cancellation wakes a cancellable thread regardless
    /// of its predicate.
    pub fn ready(&self) -> bool {
        if self.state.get() != ThreadState::Pending {
            return false;
        }
        if self.cancelled.get() && self.cancellable.get() {
            return true;
        }
        match self.ready.borrow().as_ref() {
            Some(ready) => ready(),
            None => true,
        }
    }

    /// Run one resume step; reschedules when the step keeps the
    /// thread pending.
    pub fn resume(self: &Rc<Self>) {
        if self.state.get() != ThreadState::Pending {
            return;
        }
        self.state.set(ThreadState::Running);
        let was_cancelled = self.cancelled.get();
        let mut resume = self.resume.borrow_mut().take();
        let keep_pending = match resume.as_mut() {
            Some(step) => step(was_cancelled),
            None => false,
        };
        *self.resume.borrow_mut() = resume;
        if keep_pending {
            self.state.set(ThreadState::Pending);
            if let Some(store) = self.store.borrow().upgrade() {
                store.schedule(Rc::clone(self));
            }
        } else {
            self.state.set(ThreadState::Completed);
        }
    }

    /// Replace the ready predicate before parking
    pub fn park(&self, ready: ReadyFn) {
        *self.ready.borrow_mut() = Some(ready);
    }

    /// Clear the ready predicate; the thread runs on the next tick
    pub fn unpark(&self) {
        *self.ready.borrow_mut() = None;
    }

    /// Request cooperative cancellation; fires the cancel hook once
    pub fn request_cancellation(&self) {
        if self.cancelled.get() || !self.cancellable.get() {
            return;
        }
        self.cancelled.set(true);
        if let Some(hook) = self.on_cancel.borrow().as_ref() {
            hook();
        }
    }

    /// May this thread be cancelled?
    pub fn cancellable(&self) -> bool {
        self.cancellable.get()
    }

    /// Allow or forbid cancellation
    pub fn set_allow_cancellation(&self, allow: bool) {
        self.cancellable.set(allow);
    }

    /// Has cancellation been requested?
    pub fn cancelled(&self) -> bool {
        self.cancelled.get()
    }

    /// Is this thread running an event-loop callback?
    pub fn in_event_loop(&self) -> bool {
        self.in_event_loop.get()
    }

    /// Mark the thread as running an event-loop callback
    pub fn set_in_event_loop(&self, value: bool) {
        self.in_event_loop.set(value);
    }

    /// Has the thread finished?
    pub fn completed(&self) -> bool {
        self.state.get() == ThreadState::Completed
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("state", &self.state.get())
            .field("cancellable", &self.cancellable.get())
            .field("cancelled", &self.cancelled.get())
            .finish()
    }
}

/// A link in the caller chain of a task
#[derive(Debug, Default)]
pub struct Supertask {
    /// The caller's supertask, when this is not the root call
    pub parent: Option<Rc<Supertask>>,
}

/// Cancellation handle for an in-flight call
#[derive(Default)]
pub struct Call {
    request_cancellation: Option<Box<dyn Fn()>>,
}

impl Call {
    /// A handle that cancels through `f`
    pub fn new(f: impl Fn() + 'static) -> Self {
        Self { request_cancellation: Some(Box::new(f)) }
    }

    /// A handle cancelling the given thread, holding it weakly
    pub fn from_thread(thread: &Rc<Thread>) -> Self {
        let weak = Rc::downgrade(thread);
        Self::new(move || {
            if let Some(thread) = weak.upgrade() {
                thread.request_cancellation();
            }
        })
    }

    /// Request cancellation of the underlying call
    pub fn request_cancellation(&self) {
        if let Some(f) = self.request_cancellation.as_ref() {
            f();
        }
    }
}

/// Values handed to a started call
pub type OnStart = Box<dyn FnOnce() -> Vec<crate::values::Value>>;

/// Resolution callback: `Some(results)` on return, `None` on
/// cancellation
pub type OnResolve = Box<dyn FnMut(Option<Vec<crate::values::Value>>)>;

/// A function instance the store can invoke
pub type FuncInst =
    Box<dyn Fn(&Rc<Store>, Option<Rc<Supertask>>, OnStart, OnResolve) -> Call>;

/// The cooperative scheduler
#[derive(Default)]
pub struct Store {
    pending: RefCell<Vec<Rc<Thread>>>,
}

impl Store {
    /// A fresh store with no pending threads
    pub fn new() -> Rc<Store> {
        Rc::new(Store::default())
    }

    /// Add a thread to the pending list
    pub fn schedule(&self, thread: Rc<Thread>) {
        self.pending.borrow_mut().push(thread);
    }

    /// Number of pending threads
    pub fn pending_size(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Run one ready thread. Reports whether anything ran.
    pub fn tick(&self) -> bool {
        let selected = {
            let mut pending = self.pending.borrow_mut();
            let position = pending.iter().position(|t| t.ready());
            position.map(|i| pending.remove(i))
        };
        match selected {
            Some(thread) => {
                thread.resume();
                true
            }
            None => false,
        }
    }

    /// Tick until no thread is ready
    pub fn tick_until_idle(&self) {
        while self.tick() {}
    }

    /// Invoke a function instance on this store
    pub fn invoke(
        self: &Rc<Self>,
        func: &FuncInst,
        caller: Option<Rc<Supertask>>,
        on_start: OnStart,
        on_resolve: OnResolve,
    ) -> Call {
        func(self, caller, on_start, on_resolve)
    }
}
