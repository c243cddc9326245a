// CMRT - cmrt-canonical
// Module: Task lifecycle
//
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! Task lifecycle and the task-facing builtins.
//!
//! A task is created per guest call and resolved exactly once: either
//! `task.return` delivers results, or a delivered cancellation ends it
//! with `None`. Admission honors backpressure and exclusivity: a task
//! that cannot enter parks its thread on the admission predicate and
//! counts itself among the waiters.

use crate::async_::events::Waitable;
use crate::async_::scheduler::{OnResolve, Store, Supertask, Thread};
use crate::call_context::CanonicalOptions;
use crate::instance::{ensure_may_leave, ComponentInstance};
use crate::prelude::*;
use crate::values::Value;

/// Context-local storage length.
///
/// The specification allows up to two slots; this runtime provides
/// one, matching current guest toolchains.
pub const CONTEXT_LENGTH: u32 = 1;

/// Fixed-size context-local storage of a task
#[derive(Debug, Default)]
pub struct ContextLocalStorage {
    storage: [Cell<i32>; CONTEXT_LENGTH as usize],
}

impl ContextLocalStorage {
    /// Read slot `index`
    pub fn get(&self, index: u32) -> i32 {
        self.storage[index as usize].get()
    }

    /// Write slot `index`
    pub fn set(&self, index: u32, value: i32) {
        self.storage[index as usize].set(value);
    }
}

/// Task lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Running normally
    Initial,
    /// Cancellation requested but not yet deliverable
    PendingCancel,
    /// Cancellation delivered; the task must resolve via `task.cancel`
    CancelDelivered,
    /// Resolved, by return or cancellation
    Resolved,
}

/// A guest task
pub struct Task {
    opts: CanonicalOptions,
    inst: Rc<ComponentInstance>,
    supertask: RefCell<Option<Rc<Supertask>>>,
    on_resolve: RefCell<Option<OnResolve>>,
    num_borrows: Cell<u32>,
    thread: RefCell<Option<Rc<Thread>>>,
    state: Cell<TaskState>,
    entered_exclusive: Cell<bool>,
    context: ContextLocalStorage,
}

impl Task {
    /// A fresh task for a call into `inst`
    pub fn new(
        inst: Rc<ComponentInstance>,
        opts: CanonicalOptions,
        supertask: Option<Rc<Supertask>>,
        on_resolve: OnResolve,
    ) -> Rc<Task> {
        Rc::new(Task {
            opts,
            inst,
            supertask: RefCell::new(supertask),
            on_resolve: RefCell::new(Some(on_resolve)),
            num_borrows: Cell::new(0),
            thread: RefCell::new(None),
            state: Cell::new(TaskState::Initial),
            entered_exclusive: Cell::new(false),
            context: ContextLocalStorage::default(),
        })
    }

    /// The canonical options of the originating call
    pub fn options(&self) -> &CanonicalOptions {
        &self.opts
    }

    /// The instance this task runs in
    pub fn instance(&self) -> &Rc<ComponentInstance> {
        &self.inst
    }

    /// Current lifecycle state
    pub fn state(&self) -> TaskState {
        self.state.get()
    }

    /// Context-local storage of this task
    pub fn context(&self) -> &ContextLocalStorage {
        &self.context
    }

    /// Bind the task to its thread and extend the caller chain
    pub fn set_thread(&self, thread: &Rc<Thread>) {
        thread.set_allow_cancellation(!self.opts.sync);
        thread.set_in_event_loop(self.opts.callback.is_some());
        let parent = self.supertask.borrow_mut().take();
        *self.supertask.borrow_mut() = Some(Rc::new(Supertask { parent }));
        *self.thread.borrow_mut() = Some(Rc::clone(thread));
    }

    /// The task's thread, once bound
    pub fn thread(&self) -> Option<Rc<Thread>> {
        self.thread.borrow().clone()
    }

    /// Sync tasks and event-loop callbacks need the instance to
    /// themselves
    pub fn needs_exclusive(&self) -> bool {
        self.opts.sync || self.opts.callback.is_some()
    }

    /// Record a borrow lifted into this task
    pub fn incr_borrows(&self) {
        self.num_borrows.set(self.num_borrows.get() + 1);
    }

    /// Release a borrow lifted into this task
    pub fn decr_borrows(&self) {
        let n = self.num_borrows.get();
        self.num_borrows.set(n.saturating_sub(1));
    }

    /// Request cooperative cancellation.
    ///
    /// Moves the task to cancel-delivered when it is currently
    /// cancellable, otherwise parks the request as pending; either
    /// way the thread is marked cancelled.
    pub fn request_cancellation(&self) {
        if self.state.get() != TaskState::Initial {
            return;
        }
        let Some(thread) = self.thread() else {
            return;
        };
        let deliverable = thread.cancellable()
            && !(thread.in_event_loop() && self.inst.exclusive());
        self.state.set(if deliverable {
            TaskState::CancelDelivered
        } else {
            TaskState::PendingCancel
        });
        thread.request_cancellation();
    }

    /// Promote a pending cancellation at a cancellable suspension
    pub fn observe_cancellation(&self) {
        if self.state.get() == TaskState::PendingCancel {
            self.state.set(TaskState::CancelDelivered);
        }
    }

    fn ensure_resolvable(&self) -> Result<()> {
        if self.state.get() == TaskState::Resolved {
            return Err(Error::concurrency_violation(
                codes::TASK_RESOLUTION_VIOLATION,
                "task already resolved",
            ));
        }
        if self.num_borrows.get() > 0 {
            return Err(Error::concurrency_violation(
                codes::TASK_RESOLUTION_VIOLATION,
                "task has outstanding borrows",
            ));
        }
        Ok(())
    }

    /// Deliver results through the resolve callback
    pub fn return_result(&self, values: Vec<Value>) -> Result<()> {
        self.ensure_resolvable()?;
        if let Some(mut on_resolve) = self.on_resolve.borrow_mut().take() {
            on_resolve(Some(values));
        }
        self.state.set(TaskState::Resolved);
        Ok(())
    }

    /// Resolve by cancellation; only legal in cancel-delivered state
    pub fn cancel(&self) -> Result<()> {
        if self.state.get() != TaskState::CancelDelivered {
            return Err(Error::concurrency_violation(
                codes::TASK_RESOLUTION_VIOLATION,
                "task cancellation not delivered",
            ));
        }
        if self.num_borrows.get() > 0 {
            return Err(Error::concurrency_violation(
                codes::TASK_RESOLUTION_VIOLATION,
                "task has outstanding borrows",
            ));
        }
        if let Some(mut on_resolve) = self.on_resolve.borrow_mut().take() {
            on_resolve(None);
        }
        self.state.set(TaskState::Resolved);
        Ok(())
    }

    /// Leave the instance, releasing exclusivity when held
    pub fn exit(&self) {
        if self.entered_exclusive.get() {
            self.inst.set_exclusive(false);
            self.entered_exclusive.set(false);
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("state", &self.state.get())
            .field("sync", &self.opts.sync)
            .field("num_borrows", &self.num_borrows.get())
            .finish()
    }
}

/// What a task body reports after each step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPoll {
    /// The body has more steps; keep the thread pending
    Pending,
    /// The body finished
    Done,
}

/// A task body: a resumable step function
pub type TaskBody = Box<dyn FnMut(&Rc<Task>, bool) -> Result<TaskPoll>>;

/// Spawn a task on the store.
///
/// The thread first negotiates entry: while the instance reports
/// backpressure, needs the exclusive slot, or already has waiters, the
/// task joins the waiters and parks on the admission predicate. A
/// cancellation delivered during the wait aborts entry and resolves
/// the task with `None`. Once admitted (taking the exclusive slot if
/// needed), the body runs to completion across resume steps.
pub fn spawn_task(store: &Rc<Store>, task: Rc<Task>, mut body: TaskBody) -> Rc<Thread> {
    let task_for_resume = Rc::clone(&task);
    let mut entering = true;
    let mut waited = false;

    let resume = Box::new(move |was_cancelled: bool| -> bool {
        let task = &task_for_resume;
        let inst = task.instance();

        if entering {
            if was_cancelled {
                if waited {
                    inst.decr_waiting_to_enter();
                }
                task.observe_cancellation();
                if task.state() == TaskState::CancelDelivered {
                    if let Err(e) = task.cancel() {
                        log::warn!("cancelled task failed to resolve: {e}");
                    }
                }
                return false;
            }

            let blocked = inst.backpressure() > 0
                || (task.needs_exclusive() && inst.exclusive())
                || inst.num_waiting_to_enter() > 0;
            if blocked && !waited {
                waited = true;
                inst.incr_waiting_to_enter();
                let pred_inst = Rc::clone(inst);
                let needs_exclusive = task.needs_exclusive();
                if let Some(thread) = task.thread() {
                    thread.park(Box::new(move || {
                        !(pred_inst.backpressure() > 0
                            || (needs_exclusive && pred_inst.exclusive()))
                    }));
                }
                return true;
            }

            if waited {
                inst.decr_waiting_to_enter();
                waited = false;
            }
            if task.needs_exclusive() {
                inst.set_exclusive(true);
                task.entered_exclusive.set(true);
            }
            if let Some(thread) = task.thread() {
                thread.unpark();
            }
            entering = false;
        }

        match body(task, was_cancelled) {
            Ok(TaskPoll::Pending) => true,
            Ok(TaskPoll::Done) => {
                task.exit();
                false
            }
            Err(e) => {
                log::warn!("task body trapped: {e}");
                task.exit();
                false
            }
        }
    });

    let thread = Thread::create(store, None, resume, !task.options().sync, None);
    task.set_thread(&thread);
    thread
}

/// `task.return`: deliver results; traps in a synchronous context
pub fn canon_task_return(task: &Task, values: Vec<Value>) -> Result<()> {
    ensure_may_leave(task.instance())?;
    if task.options().sync && !task.options().always_task_return {
        return Err(Error::concurrency_violation(
            codes::SYNC_CONTEXT_VIOLATION,
            "task.return requires async context",
        ));
    }
    task.return_result(values)
}

/// `task.cancel`: resolve a delivered cancellation; traps in a
/// synchronous context
pub fn canon_task_cancel(task: &Task) -> Result<()> {
    ensure_may_leave(task.instance())?;
    if task.options().sync {
        return Err(Error::concurrency_violation(
            codes::SYNC_CONTEXT_VIOLATION,
            "task.cancel requires async context",
        ));
    }
    task.cancel()
}

/// `yield`: cooperative scheduling point.
///
/// Reports 1 when the suspension is cancellable and a cancellation
/// has been requested (promoting it to delivered), 0 otherwise.
pub fn canon_yield(task: &Task, cancellable: bool) -> Result<u32> {
    ensure_may_leave(task.instance())?;
    if cancellable
        && matches!(task.state(), TaskState::PendingCancel | TaskState::CancelDelivered)
    {
        task.observe_cancellation();
        return Ok(1);
    }
    Ok(0)
}

/// `context.get`: read a context-local slot
pub fn canon_context_get(task: &Task, index: u32) -> Result<i32> {
    ensure_may_leave(task.instance())?;
    if index >= CONTEXT_LENGTH {
        return Err(Error::new(
            ErrorCategory::RuntimeTrap,
            codes::CONTEXT_INDEX_OUT_OF_BOUNDS,
            "context index out of bounds",
        ));
    }
    Ok(task.context().get(index))
}

/// `context.set`: write a context-local slot
pub fn canon_context_set(task: &Task, index: u32, value: i32) -> Result<()> {
    ensure_may_leave(task.instance())?;
    if index >= CONTEXT_LENGTH {
        return Err(Error::new(
            ErrorCategory::RuntimeTrap,
            codes::CONTEXT_INDEX_OUT_OF_BOUNDS,
            "context index out of bounds",
        ));
    }
    task.context().set(index, value);
    Ok(())
}

/// An in-flight subtask call, waitable by the caller
#[derive(Debug, Default)]
pub struct Subtask {
    waitable: Waitable,
}

impl Subtask {
    /// A fresh subtask entry
    pub fn new() -> Self {
        Self::default()
    }

    /// The waitable part of this subtask
    pub fn waitable(&self) -> &Waitable {
        &self.waitable
    }
}
