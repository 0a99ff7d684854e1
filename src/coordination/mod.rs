//! Operation coordination
//!
//! - [`machine`] decides what each protocol event requires
//! - [`task`] carries finalized events from the listeners to the dispatcher
//! - [`dispatcher`] submits the resulting contract calls exactly once

pub mod dispatcher;
pub mod machine;
pub mod task;

#[cfg(test)]
mod scenario;

pub use dispatcher::TaskDispatcher;
pub use machine::Action;
pub use task::{DeadLetter, Task};
