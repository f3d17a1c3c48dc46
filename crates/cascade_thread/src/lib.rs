//! Worker threads for the Cascade runtime.

mod arena;
mod pool;

pub use arena::{Arena, TaskArenas};
pub use pool::{PoolError, PoolResult, Task, WorkerPool};
