// rust_connection_transport/src/channel/scripted.rs

//! 按脚本回放分片的内存双工流，仅供单元测试使用。

use super::{ChannelState, CloseStatus, DuplexChannel, ReceiveResult};
use crate::error::WsError;
use crate::message::MessageKind;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// 脚本中的一步读取。
#[derive(Debug)]
pub(crate) enum Step {
    Fragment {
        kind: MessageKind,
        data: Vec<u8>,
        end: bool,
    },
    Close,
    Fail(WsError),
}

impl Step {
    pub(crate) fn text(data: &str, end: bool) -> Self {
        Step::Fragment {
            kind: MessageKind::Text,
            data: data.as_bytes().to_vec(),
            end,
        }
    }

    pub(crate) fn binary(data: &[u8], end: bool) -> Self {
        Step::Fragment {
            kind: MessageKind::Binary,
            data: data.to_vec(),
            end,
        }
    }
}

/// 写入端观察到的一次发送。
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SentFrame {
    pub payload: Vec<u8>,
    pub kind: MessageKind,
    pub end_of_message: bool,
}

pub(crate) struct ScriptedChannel {
    steps: Mutex<VecDeque<Step>>,
    state: AtomicU8,
    sent: Mutex<Vec<SentFrame>>,
    close_calls: AtomicUsize,
    probe_reads: AtomicUsize,
    full_reads: AtomicUsize,
    send_calls: AtomicUsize,
    in_flight_sends: AtomicUsize,
    max_concurrent_sends: AtomicUsize,
    send_delay: Duration,
    fail_send_at: Option<usize>,
    hang_on_close: bool,
}

impl ScriptedChannel {
    pub(crate) fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            state: AtomicU8::new(ChannelState::Open.to_u8()),
            sent: Mutex::new(Vec::new()),
            close_calls: AtomicUsize::new(0),
            probe_reads: AtomicUsize::new(0),
            full_reads: AtomicUsize::new(0),
            send_calls: AtomicUsize::new(0),
            in_flight_sends: AtomicUsize::new(0),
            max_concurrent_sends: AtomicUsize::new(0),
            send_delay: Duration::ZERO,
            fail_send_at: None,
            hang_on_close: false,
        }
    }

    /// 每次发送前等待的时长，用于放大并发写入的窗口。
    pub(crate) fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = delay;
        self
    }

    /// 第 `index` 次 (从 0 开始) 发送返回 I/O 错误。
    pub(crate) fn failing_send_at(mut self, index: usize) -> Self {
        self.fail_send_at = Some(index);
        self
    }

    /// 关闭帧永远发不出去。
    pub(crate) fn hanging_on_close(mut self) -> Self {
        self.hang_on_close = true;
        self
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        self.state.store(state.to_u8(), Ordering::SeqCst);
    }

    pub(crate) fn sent(&self) -> Vec<SentFrame> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn send_calls(&self) -> usize {
        self.send_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn probe_reads(&self) -> usize {
        self.probe_reads.load(Ordering::SeqCst)
    }

    pub(crate) fn full_reads(&self) -> usize {
        self.full_reads.load(Ordering::SeqCst)
    }

    pub(crate) fn max_concurrent_sends(&self) -> usize {
        self.max_concurrent_sends.load(Ordering::SeqCst)
    }

    fn next_step(&self, probe: bool) -> Option<Step> {
        let mut steps = self.steps.lock().ok()?;
        if probe {
            // 探测读取只在分片为空且已结束时才消费它
            if let Some(Step::Fragment { kind, data, end }) = steps.front() {
                if !(data.is_empty() && *end) {
                    return Some(Step::Fragment {
                        kind: *kind,
                        data: Vec::new(),
                        end: false,
                    });
                }
            }
        }
        steps.pop_front()
    }

    fn push_front(&self, step: Step) {
        if let Ok(mut steps) = self.steps.lock() {
            steps.push_front(step);
        }
    }
}

#[async_trait]
impl DuplexChannel for ScriptedChannel {
    async fn receive(
        &self,
        buffer: &mut [u8],
        cancel: &CancellationToken,
    ) -> Result<ReceiveResult, WsError> {
        let probe = buffer.is_empty();
        if probe {
            self.probe_reads.fetch_add(1, Ordering::SeqCst);
        } else {
            self.full_reads.fetch_add(1, Ordering::SeqCst);
        }
        match self.next_step(probe) {
            Some(Step::Fragment { kind, data, end }) => {
                if data.len() > buffer.len() && !probe {
                    let (head, tail) = data.split_at(buffer.len());
                    buffer.copy_from_slice(head);
                    self.push_front(Step::Fragment {
                        kind,
                        data: tail.to_vec(),
                        end,
                    });
                    return Ok(ReceiveResult {
                        count: head.len(),
                        kind,
                        end_of_message: false,
                    });
                }
                buffer[..data.len()].copy_from_slice(&data);
                Ok(ReceiveResult {
                    count: data.len(),
                    kind,
                    end_of_message: end,
                })
            }
            Some(Step::Close) => {
                self.set_state(ChannelState::CloseReceived);
                Ok(ReceiveResult::close())
            }
            Some(Step::Fail(error)) => Err(error),
            None => {
                cancel.cancelled().await;
                Err(WsError::Cancelled)
            }
        }
    }

    async fn send(
        &self,
        payload: &[u8],
        kind: MessageKind,
        end_of_message: bool,
        _cancel: &CancellationToken,
    ) -> Result<(), WsError> {
        let index = self.send_calls.fetch_add(1, Ordering::SeqCst);
        let now_in_flight = self.in_flight_sends.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_sends.fetch_max(now_in_flight, Ordering::SeqCst);
        if !self.send_delay.is_zero() {
            tokio::time::sleep(self.send_delay).await;
        }
        self.in_flight_sends.fetch_sub(1, Ordering::SeqCst);
        if self.fail_send_at == Some(index) {
            return Err(WsError::IoError(std::io::Error::other("脚本注入的发送失败")));
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(SentFrame {
                payload: payload.to_vec(),
                kind,
                end_of_message,
            });
        }
        Ok(())
    }

    async fn close_output(
        &self,
        _status: CloseStatus,
        _reason: &str,
        _cancel: &CancellationToken,
    ) -> Result<(), WsError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.hang_on_close {
            std::future::pending::<()>().await;
        }
        let next = match self.state() {
            ChannelState::CloseReceived => ChannelState::Closed,
            _ => ChannelState::CloseSent,
        };
        self.set_state(next);
        Ok(())
    }

    fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::SeqCst))
    }
}
