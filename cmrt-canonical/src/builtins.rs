// CMRT - cmrt-canonical
// Module: Canonical built-in surface
//
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! The canonical built-ins, gathered for engine glue.
//!
//! Each function here is one entry the embedding engine binds into a
//! guest's import table. Packed return conventions:
//!
//! - `stream.new`/`future.new` return `(writable << 32) | readable`
//! - copy operations return the low 4 bits as the outcome
//!   (`Completed`/`Dropped`/`Cancelled`) and the high 28 bits as the
//!   progress count, or [`BLOCKED`](crate::async_::events::BLOCKED)
//!   when nothing completed synchronously
//!
//! | Builtin | Entry point |
//! | - | - |
//! | `resource.new` | [`canon_resource_new`] |
//! | `resource.drop` | [`canon_resource_drop`] |
//! | `resource.rep` | [`canon_resource_rep`] |
//! | `task.return` | [`canon_task_return`] |
//! | `task.cancel` | [`canon_task_cancel`] |
//! | `yield` | [`canon_yield`] |
//! | `context.get` / `context.set` | [`canon_context_get`] / [`canon_context_set`] |
//! | `backpressure.set` / `inc` / `dec` | [`canon_backpressure_set`] / [`canon_backpressure_inc`] / [`canon_backpressure_dec`] |
//! | `waitable-set.new` / `wait` / `poll` / `drop` | [`canon_waitable_set_new`] / [`canon_waitable_set_wait`] / [`canon_waitable_set_poll`] / [`canon_waitable_set_drop`] |
//! | `waitable.join` | [`canon_waitable_join`] |
//! | `stream.*` | [`canon_stream_new`] and friends |
//! | `future.*` | [`canon_future_new`] and friends |
//! | `error-context.*` | [`canon_error_context_new`] and friends |

pub use crate::async_::futures::{
    canon_future_cancel_read,
    canon_future_cancel_write,
    canon_future_drop_readable,
    canon_future_drop_writable,
    canon_future_new,
    canon_future_read,
    canon_future_write,
};
pub use crate::async_::streams::{
    canon_stream_cancel_read,
    canon_stream_cancel_write,
    canon_stream_drop_readable,
    canon_stream_drop_writable,
    canon_stream_new,
    canon_stream_read,
    canon_stream_write,
};
pub use crate::async_::task::{
    canon_context_get,
    canon_context_set,
    canon_task_cancel,
    canon_task_return,
    canon_yield,
};
pub use crate::async_::waitable::{
    canon_waitable_join,
    canon_waitable_set_drop,
    canon_waitable_set_new,
    canon_waitable_set_poll,
    canon_waitable_set_wait,
};
pub use crate::error_context_builtins::{
    canon_error_context_debug_message,
    canon_error_context_drop,
    canon_error_context_new,
};
pub use crate::instance::{
    canon_backpressure_dec,
    canon_backpressure_inc,
    canon_backpressure_set,
};
pub use crate::resources::{
    canon_resource_drop,
    canon_resource_new,
    canon_resource_rep,
};
