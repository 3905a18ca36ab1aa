//! Asynchronous primitives: operations, the controller, notifiers.
//!
//! The model is a cooperative event loop on top of OS threads. A thread
//! owns a [`Controller`] and submits [`Op`]s to backends (sockets,
//! listeners, semaphores). Backends complete operations from their own
//! threads by invoking a [`Notifier`], which routes the operation into the
//! controller's ready queue; the owning thread picks completions up with
//! [`Controller::wait`]. Cancellation is synchronous and idempotent: after
//! a cancel, the operation neither completes nor is delivered.

mod controller;
mod op;
mod semaphore;

pub use self::controller::{Controller, Notifier};
pub use self::op::{Op, OpCore, Operation, ReceiveOperation, SendOperation};
pub use self::semaphore::Semaphore;

pub(crate) use self::op::is_same;
