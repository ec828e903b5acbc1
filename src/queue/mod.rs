// rust_connection_transport/src/queue/mod.rs

//! 发送队列模块。
//!
//! - `task_queue`: 保证写入严格串行、按提交顺序执行的有序发送队列。
//! - `monitor`: 检测发送长时间未完成的停滞监视器。

pub mod monitor;
pub mod task_queue;

pub use monitor::{StallReport, TaskQueueMonitor};
pub use task_queue::{Drained, TaskHandle, TaskQueue};
