// rust_connection_transport/src/queue/task_queue.rs

//! 有序发送队列。
//!
//! 同一时刻最多只有一个工作单元在执行，执行开始的顺序等于提交顺序。
//! 实现方式是维护一个 "队尾" 共享 future：每次入队都把新单元接在当前队尾之后，
//! 再把自己安装为新的队尾。锁只在交换队尾时持有，绝不跨越 I/O 的 `.await`。
//!
//! 某个单元失败 (返回错误或 panic) 只影响它自己的 `TaskHandle`，排在它后面的单元照常执行。

use crate::error::WsError;
use crate::queue::monitor::TaskQueueMonitor;
use futures_util::future::{self, BoxFuture, FutureExt, Shared};
use log::error;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::runtime::Handle;
use tokio::sync::oneshot;

type Tail = Shared<BoxFuture<'static, ()>>;

/// `drain` 返回的 future，在排空前已入队的所有单元完成后结束。
pub type Drained = Shared<BoxFuture<'static, ()>>;

struct QueueState {
    tail: Tail,
    drained: bool,
}

/// 串行执行异步工作单元的队列。
pub struct TaskQueue {
    state: Mutex<QueueState>,
    /// 已入队但尚未完成的单元数。
    size: Arc<AtomicUsize>,
    max_size: Option<usize>,
    monitor: Option<Arc<TaskQueueMonitor>>,
}

impl TaskQueue {
    /// 创建一个不限长度、没有监视器的队列。
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                // 初始的种子任务，让第一次入队也有可以衔接的队尾
                tail: future::ready(()).boxed().shared(),
                drained: false,
            }),
            size: Arc::new(AtomicUsize::new(0)),
            max_size: None,
            monitor: None,
        }
    }

    /// 限制同时排队 (含正在执行) 的单元数，超过时 `enqueue` 返回 `WsError::QueueFull`。
    pub fn with_max_size(mut self, max_size: Option<usize>) -> Self {
        self.max_size = max_size;
        self
    }

    /// 挂接停滞监视器，每个单元开始与结束时都会通知它。
    pub fn with_monitor(mut self, monitor: Arc<TaskQueueMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn monitor(&self) -> Option<&Arc<TaskQueueMonitor>> {
        self.monitor.as_ref()
    }

    /// 已入队但尚未完成的单元数。
    pub fn len(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 把一个工作单元接到队尾。
    ///
    /// 每个单元都会被派生为独立任务推进，即使调用方丢弃了返回的 `TaskHandle`，
    /// 单元也会按顺序执行完毕。当前线程没有 tokio 运行时时返回
    /// `WsError::RuntimeUnavailable`，队列保持不变。
    ///
    /// 返回的 `TaskHandle` 只反映本单元的结果，而不是整条链的结果。
    pub fn enqueue<S, F, Fut>(&self, work: F, state: S) -> Result<TaskHandle, WsError>
    where
        S: Send + 'static,
        F: FnOnce(S) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), WsError>> + Send + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| WsError::RuntimeUnavailable)?;
        let mut queue = self.lock_state();
        if queue.drained {
            return Err(WsError::QueueDrained);
        }
        if let Some(max_size) = self.max_size {
            if self.size.load(Ordering::SeqCst) >= max_size {
                return Err(WsError::QueueFull(max_size));
            }
        }
        self.size.fetch_add(1, Ordering::SeqCst);

        let previous = queue.tail.clone();
        let monitor = self.monitor.clone();
        let size = Arc::clone(&self.size);
        let (result_tx, result_rx) = oneshot::channel();

        let link: Tail = async move {
            previous.await;
            if let Some(monitor) = &monitor {
                monitor.task_started();
            }
            let outcome = AssertUnwindSafe(async move { work(state).await })
                .catch_unwind()
                .await;
            if let Some(monitor) = &monitor {
                monitor.task_completed();
            }
            size.fetch_sub(1, Ordering::SeqCst);
            let result = match outcome {
                Ok(result) => result,
                Err(_) => {
                    error!("[发送队列] 队列中的工作单元发生 panic，后续单元将继续执行。");
                    Err(WsError::TaskAborted)
                }
            };
            // 调用方可能已经丢弃了句柄
            let _ = result_tx.send(result);
        }
        .boxed()
        .shared();

        queue.tail = link.clone();
        drop(queue);
        runtime.spawn(link);

        Ok(TaskHandle::pending(result_rx))
    }

    /// 标记队列为已排空并返回一个在所有已入队单元完成后结束的 future。
    ///
    /// 排空之后的 `enqueue` 一律返回 `WsError::QueueDrained`。
    pub fn drain(&self) -> Drained {
        let mut queue = self.lock_state();
        queue.drained = true;
        queue.tail.clone()
    }

    pub fn is_drained(&self) -> bool {
        self.lock_state().drained
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        // 持锁期间不会 panic，中毒的锁里状态仍然一致
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// 单个工作单元的结果。
///
/// 可以独立于其他单元被等待；等待顺序不影响执行顺序。
#[derive(Debug)]
pub struct TaskHandle {
    inner: HandleInner,
}

#[derive(Debug)]
enum HandleInner {
    Pending(oneshot::Receiver<Result<(), WsError>>),
    Ready(Option<Result<(), WsError>>),
}

impl TaskHandle {
    fn pending(rx: oneshot::Receiver<Result<(), WsError>>) -> Self {
        Self {
            inner: HandleInner::Pending(rx),
        }
    }

    /// 一个已经成功完成的句柄，不对应任何队列单元。
    pub fn completed() -> Self {
        Self {
            inner: HandleInner::Ready(Some(Ok(()))),
        }
    }

    /// 一个已经失败的句柄。
    pub fn failed(error: WsError) -> Self {
        Self {
            inner: HandleInner::Ready(Some(Err(error))),
        }
    }
}

impl Future for TaskHandle {
    type Output = Result<(), WsError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.inner {
            HandleInner::Pending(rx) => Pin::new(rx)
                .poll(cx)
                .map(|received| received.unwrap_or(Err(WsError::TaskAborted))),
            HandleInner::Ready(result) => Poll::Ready(result.take().unwrap_or(Ok(()))),
        }
    }
}
