//! The explicit façade: every operation takes the [`Context`]/[`Scope`] it acts
//! on as an ordinary argument.
//!
//! This is the crate's native surface — [`crate::scope`] and [`crate::context`]
//! already thread everything through explicitly — so this module is a thin,
//! named re-export of it for symmetry with [`crate::implicit`], which carries
//! the same values ambiently instead.

pub use crate::context::{global_context, Context};
pub use crate::error::{Failure, ScopeError};
pub use crate::scope::{
    async_with_unmask, fork, fork_, fork_try, fork_with_unmask, fork_with_unmask_, r#async,
    scoped, Scope, Unmask,
};
pub use crate::task::{AsyncHandle, TaskId, ThreadHandle};
pub use crate::timer::sleep;
