// rust_connection_transport/src/queue/monitor.rs

//! 发送队列停滞监视器。
//!
//! 监视器只负责诊断，不负责补救：它周期性地检查发送队列中 "已开始但未完成" 的任务数，
//! 如果同一个任务跨越两次连续心跳仍未完成，就报告一次 "回调过慢 / 可能死锁"。
//! 它不会取消或重试卡住的发送，那个发送可能只是在一个很慢的网络上仍在进行。
//!
//! 状态流转：
//! 空闲 (计数为 0) → 有未完成任务且未报告 → 有未完成任务且已报告 → 任务完成后回到空闲。
//! 同一个卡住的任务只报告一次；有任务完成后，新的任务需要再次经历两拍停滞才会再报告。

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// 一次停滞诊断的内容。
#[derive(Debug, Clone)]
pub struct StallReport {
    /// 所属队列的名字，通常是连接 ID。
    pub queue_name: String,
    /// 检测时未完成的任务数。
    pub outstanding: usize,
    /// 从第一次观察到该任务未完成起累计的心跳间隔。
    pub stalled_for: Duration,
    /// 检测到停滞的时间 (UTC)。
    pub detected_at: DateTime<Utc>,
}

type StallHook = Arc<dyn Fn(&StallReport) + Send + Sync>;

#[derive(Debug, Default)]
struct BeatState {
    /// 上一次心跳看到未完成任务时的完成计数。`None` 表示上一拍是空闲的。
    observed_completions: Option<u64>,
    stalled_for: Duration,
    warned: bool,
}

/// 发送队列的停滞监视器。
///
/// `task_started` / `task_completed` 可能与定时器触发的 `beat` 并发执行，
/// 计数器因此全部使用原子操作；`beat` 自身的状态只由心跳方访问。
pub struct TaskQueueMonitor {
    queue_name: String,
    outstanding: AtomicUsize,
    completions: AtomicU64,
    beat_state: Mutex<BeatState>,
    stalls_reported: AtomicU64,
    disposed: AtomicBool,
    timer: CancellationToken,
    on_stall: Option<StallHook>,
}

impl TaskQueueMonitor {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            outstanding: AtomicUsize::new(0),
            completions: AtomicU64::new(0),
            beat_state: Mutex::new(BeatState::default()),
            stalls_reported: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            timer: CancellationToken::new(),
            on_stall: None,
        }
    }

    /// 注册一个在每次停滞诊断时调用的钩子。
    pub fn with_stall_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&StallReport) + Send + Sync + 'static,
    {
        self.on_stall = Some(Arc::new(hook));
        self
    }

    pub fn task_started(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    pub fn task_completed(&self) {
        let decremented = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if decremented.is_err() {
            warn!(
                "[发送队列监视器] 队列 {} 收到了多余的任务完成通知，已忽略。",
                self.queue_name
            );
            return;
        }
        self.completions.fetch_add(1, Ordering::SeqCst);
    }

    /// 当前已开始但尚未完成的任务数。
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// 到目前为止报告过的停滞次数。
    pub fn stalls_reported(&self) -> u64 {
        self.stalls_reported.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// 执行一次心跳检查。
    ///
    /// `elapsed` 是距上一次心跳的时长。本次心跳产生了诊断时返回 `true`。
    pub fn beat(&self, elapsed: Duration) -> bool {
        if self.is_disposed() {
            return false;
        }
        let outstanding = self.outstanding();
        let completions = self.completions.load(Ordering::SeqCst);

        let report = {
            let mut state = match self.beat_state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };

            if outstanding == 0 {
                *state = BeatState::default();
                return false;
            }

            if state.observed_completions != Some(completions) {
                // 第一次看到这个任务未完成，或者两拍之间有任务完成过
                state.observed_completions = Some(completions);
                state.stalled_for = Duration::ZERO;
                state.warned = false;
                debug!(
                    "[发送队列监视器] 队列 {} 有 {} 个未完成任务，开始观察。",
                    self.queue_name, outstanding
                );
                return false;
            }

            state.stalled_for += elapsed;
            if state.warned {
                return false;
            }
            state.warned = true;
            StallReport {
                queue_name: self.queue_name.clone(),
                outstanding,
                stalled_for: state.stalled_for,
                detected_at: Utc::now(),
            }
        };

        self.stalls_reported.fetch_add(1, Ordering::SeqCst);
        error!(
            "[发送队列监视器] 队列 {} 的发送回调耗时过长，可能存在死锁。未完成任务: {}，已停滞至少 {:?} (检测时间: {})",
            report.queue_name, report.outstanding, report.stalled_for, report.detected_at
        );
        if let Some(hook) = &self.on_stall {
            hook(&report);
        }
        true
    }

    /// 启动后台定时任务，每隔 `period` 调用一次 `beat(period)`。
    ///
    /// 定时任务只持有监视器的弱引用；监视器被释放或调用 `dispose` 后定时任务随之退出。
    pub fn start(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let monitor: Weak<Self> = Arc::downgrade(self);
        let stop = self.timer.clone();
        let queue_name = self.queue_name.clone();
        info!(
            "[发送队列监视器] 队列 {} 的停滞检查定时器已启动，周期: {:?}",
            queue_name, period
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(monitor) = monitor.upgrade() else { break };
                        monitor.beat(period);
                    }
                }
            }
            debug!("[发送队列监视器] 队列 {} 的停滞检查定时器已停止。", queue_name);
        })
    }

    /// 停止定时器并抑制之后的所有诊断。
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.timer.cancel();
    }
}

impl Drop for TaskQueueMonitor {
    fn drop(&mut self) {
        self.timer.cancel();
    }
}

impl std::fmt::Debug for TaskQueueMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueueMonitor")
            .field("queue_name", &self.queue_name)
            .field("outstanding", &self.outstanding())
            .field("stalls_reported", &self.stalls_reported())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
