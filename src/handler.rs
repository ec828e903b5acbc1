// rust_connection_transport/src/handler.rs

//! 连接处理器。
//!
//! 每个连接对应一个 `WebSocketHandler`，它拥有该连接的有序发送队列，
//! 循环驱动消息读取器，把解码后的消息分发给用户回调，并管理打开、出错与关闭的生命周期。
//!
//! 状态机：`Unopened → Open → Closing → Closed`，`Open`/`Closing` 之外还可能进入 `Faulted`。
//! 无论读循环以何种方式结束，`on_close` 都恰好被调用一次，每个 `on_open` 都有对应的 `on_close`。
//! 处理器从不把错误抛给宿主，所有失败都通过回调与 `last_error` 暴露。

use crate::channel::{ChannelState, CloseStatus, DuplexChannel};
use crate::config::HandlerConfig;
use crate::error::WsError;
use crate::message::{InboundMessage, MessageKind, OutboundMessage};
use crate::queue::{TaskHandle, TaskQueue, TaskQueueMonitor};
use crate::reader::read_message;
use log::{debug, error, info, warn};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// 连接处理器的生命周期状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unopened,
    Open,
    Closing,
    Faulted,
    Closed,
}

impl ConnectionState {
    fn to_u8(self) -> u8 {
        match self {
            ConnectionState::Unopened => 0,
            ConnectionState::Open => 1,
            ConnectionState::Closing => 2,
            ConnectionState::Faulted => 3,
            ConnectionState::Closed => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Unopened,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            3 => ConnectionState::Faulted,
            _ => ConnectionState::Closed,
        }
    }
}

/// 上层 (集线器/分发层) 提供的连接回调。
///
/// 两个消息处理方法的默认实现返回 `WsError::UnhandledMessageKind`：
/// 只实现了文本处理的回调收到二进制消息 (或反之) 属于编程错误，会按致命错误上报，而不是静默丢弃。
pub trait ConnectionCallbacks: Send + Sync + 'static {
    /// 连接打开后、进入读循环之前调用。
    fn on_open(&self, _handler: &WebSocketHandler) {}

    /// 收到一条完整的文本消息。
    fn on_text(&self, _handler: &WebSocketHandler, _text: String) -> Result<(), WsError> {
        Err(WsError::UnhandledMessageKind(MessageKind::Text))
    }

    /// 收到一条完整的二进制消息。
    fn on_binary(&self, _handler: &WebSocketHandler, _data: Vec<u8>) -> Result<(), WsError> {
        Err(WsError::UnhandledMessageKind(MessageKind::Binary))
    }

    /// 读循环遇到致命错误。错误同时保存在 `WebSocketHandler::last_error` 中。
    fn on_error(&self, _handler: &WebSocketHandler, _error: &WsError) {}

    /// 连接关闭，每个连接恰好调用一次。`was_clean` 表示没有发生致命错误。
    fn on_close(&self, _handler: &WebSocketHandler, _was_clean: bool) {}

    /// 在 `on_close` 之后调用，用于释放回调持有的资源。
    fn dispose(&self) {}
}

struct HandlerInner {
    connection_id: Uuid,
    config: HandlerConfig,
    callbacks: Arc<dyn ConnectionCallbacks>,
    state: AtomicU8,
    channel: Mutex<Option<Arc<dyn DuplexChannel>>>,
    last_error: Mutex<Option<Arc<WsError>>>,
    send_queue: TaskQueue,
    monitor: Arc<TaskQueueMonitor>,
}

/// 单个连接的处理器。克隆得到的是同一个处理器的另一个句柄。
#[derive(Clone)]
pub struct WebSocketHandler {
    inner: Arc<HandlerInner>,
}

impl WebSocketHandler {
    /// 创建一个尚未打开的处理器。
    pub fn new(config: HandlerConfig, callbacks: Arc<dyn ConnectionCallbacks>) -> Self {
        let connection_id = Uuid::new_v4();
        let monitor = Arc::new(TaskQueueMonitor::new(connection_id.to_string()));
        let send_queue = TaskQueue::new()
            .with_max_size(config.max_send_queue_size)
            .with_monitor(Arc::clone(&monitor));
        Self {
            inner: Arc::new(HandlerInner {
                connection_id,
                config,
                callbacks,
                state: AtomicU8::new(ConnectionState::Unopened.to_u8()),
                channel: Mutex::new(None),
                last_error: Mutex::new(None),
                send_queue,
                monitor,
            }),
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.inner.connection_id
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    /// 最近一次致命错误。
    pub fn last_error(&self) -> Option<Arc<WsError>> {
        lock(&self.inner.last_error).clone()
    }

    /// 发送队列的停滞监视器。
    pub fn monitor(&self) -> &Arc<TaskQueueMonitor> {
        &self.inner.monitor
    }

    /// 发送一条文本消息。
    pub fn send_text(&self, text: impl Into<String>) -> TaskHandle {
        self.send(OutboundMessage::text(text))
    }

    /// 发送一条二进制消息。
    pub fn send_binary(&self, data: impl Into<Vec<u8>>) -> TaskHandle {
        self.send(OutboundMessage::binary(data))
    }

    /// 发送一个较大出站消息中的一个分片。
    pub fn send_fragment(
        &self,
        payload: impl Into<Vec<u8>>,
        kind: MessageKind,
        end_of_message: bool,
    ) -> TaskHandle {
        self.send(OutboundMessage::fragment(payload, kind, end_of_message))
    }

    /// 把一个出站单元交给有序发送队列。
    ///
    /// 连接未打开、已关闭或底层流不再可写时直接返回已完成的句柄，不触碰底层流。
    /// 在没有 tokio 运行时的线程上调用时，句柄以 `WsError::RuntimeUnavailable` 结束。
    pub fn send(&self, message: OutboundMessage) -> TaskHandle {
        if message.kind == MessageKind::Close {
            return TaskHandle::failed(WsError::ProtocolError(
                "出站消息只能是文本或二进制，关闭请使用 close()".to_string(),
            ));
        }
        let Some(channel) = self.writable_channel() else {
            return TaskHandle::completed();
        };
        let connection_id = self.inner.connection_id;
        let enqueued = self.inner.send_queue.enqueue(
            move |(channel, message): (Arc<dyn DuplexChannel>, OutboundMessage)| async move {
                if channel.state() != ChannelState::Open {
                    return Ok(());
                }
                // 发送不受外部关闭信号影响，由关闭握手负责收尾
                let never = CancellationToken::new();
                let result = channel
                    .send(&message.payload, message.kind, message.end_of_message, &never)
                    .await;
                if let Err(e) = &result {
                    warn!(
                        "[连接处理器] 连接 {} 发送 {:?} 消息失败: {}",
                        connection_id, message.kind, e
                    );
                }
                result
            },
            (channel, message),
        );
        match enqueued {
            Ok(handle) => handle,
            Err(e) => {
                warn!("[连接处理器] 连接 {} 的发送请求未能入队: {}", connection_id, e);
                TaskHandle::failed(e)
            }
        }
    }

    /// 通过发送队列发出关闭帧。
    ///
    /// 关闭帧与普通发送共用一个队列，因此不会与它们交错。
    /// 处理器已关闭时是空操作。关闭失败只记录日志，对端无论如何都在离开。
    /// 与 `send` 一样，没有 tokio 运行时时句柄以 `WsError::RuntimeUnavailable` 结束。
    pub fn close(&self) -> TaskHandle {
        if self.state() == ConnectionState::Closed {
            return TaskHandle::completed();
        }
        let Some(channel) = lock(&self.inner.channel).clone() else {
            return TaskHandle::completed();
        };
        let connection_id = self.inner.connection_id;
        let enqueued = self.inner.send_queue.enqueue(
            move |channel: Arc<dyn DuplexChannel>| async move {
                if !channel.state().can_close_output() {
                    return Ok(());
                }
                let never = CancellationToken::new();
                if let Err(e) = channel
                    .close_output(CloseStatus::NormalClosure, "", &never)
                    .await
                {
                    warn!("[连接处理器] 连接 {} 发送关闭帧失败 (已忽略): {}", connection_id, e);
                }
                Ok(())
            },
            channel,
        );
        enqueued.unwrap_or_else(TaskHandle::failed)
    }

    /// 在给定的双工流上运行本连接，直到连接结束。
    ///
    /// 依次调用 `on_open`、循环读取并分发消息、分类读循环的错误，
    /// 最后尝试关闭并调用 `on_close` 与 `dispose`。该方法不会返回错误。
    ///
    /// # Arguments
    /// * `channel` - 由传输宿主提供、已完成握手的双工流。
    /// * `cancel` - 外部关闭信号 (例如服务器停机)。由它引起的取消视为正常关闭。
    pub async fn process_request(
        &self,
        channel: Arc<dyn DuplexChannel>,
        cancel: CancellationToken,
    ) {
        let connection_id = self.inner.connection_id;
        {
            let mut slot = lock(&self.inner.channel);
            if self.state() != ConnectionState::Unopened || slot.is_some() {
                warn!("[连接处理器] 连接 {} 已经处理过一个底层流，拒绝再次处理。", connection_id);
                return;
            }
            *slot = Some(Arc::clone(&channel));
        }

        if let Some(period) = self.inner.config.stall_timeout() {
            self.inner.monitor.start(period);
        }
        self.set_state(ConnectionState::Open);
        info!("[连接处理器] 连接 {} 已打开。", connection_id);

        let outcome = match guard_callback("on_open", || self.inner.callbacks.on_open(self)) {
            Ok(()) => self.receive_loop(channel.as_ref(), &cancel).await,
            Err(e) => Err(e),
        };

        let fault = match outcome {
            Ok(()) => None,
            Err(e) if Self::is_fatal(&e, &cancel, channel.as_ref()) => Some(e),
            Err(WsError::Cancelled) => {
                info!("[连接处理器] 连接 {} 收到外部关闭信号。", connection_id);
                None
            }
            Err(e) => {
                warn!(
                    "[连接处理器] 连接 {} 的读循环以非致命方式结束，按正常关闭处理: {}",
                    connection_id, e
                );
                None
            }
        };
        let was_clean = fault.is_none();
        if let Some(e) = fault {
            error!("[连接处理器] 连接 {} 发生致命错误: {}", connection_id, e);
            let e = Arc::new(e);
            *lock(&self.inner.last_error) = Some(Arc::clone(&e));
            self.set_state(ConnectionState::Faulted);
            let reported = guard_callback("on_error", || self.inner.callbacks.on_error(self, &e));
            if let Err(panic) = reported {
                error!("[连接处理器] 连接 {} 的 {}", connection_id, panic);
            }
        }

        // 收尾：尝试发出关闭帧，但不会为一个已经断开的连接无限等待
        let close_timeout = self.inner.config.close_timeout();
        if tokio::time::timeout(close_timeout, self.close()).await.is_err() {
            debug!(
                "[连接处理器] 连接 {} 收尾时的关闭帧在 {:?} 内未能发出。",
                connection_id, close_timeout
            );
        }

        self.set_state(ConnectionState::Closed);
        info!("[连接处理器] 连接 {} 已关闭 (正常关闭: {})。", connection_id, was_clean);
        let closed = guard_callback("on_close", || {
            self.inner.callbacks.on_close(self, was_clean)
        });
        if let Err(panic) = closed {
            error!("[连接处理器] 连接 {} 的 {}", connection_id, panic);
        }
        if let Err(panic) = guard_callback("dispose", || self.inner.callbacks.dispose()) {
            error!("[连接处理器] 连接 {} 的 {}", connection_id, panic);
        }
        self.inner.monitor.dispose();
        lock(&self.inner.channel).take();
    }

    /// 判断读循环的错误是否需要通过 `on_error` 上报。
    ///
    /// - 外部令牌已取消时的 `Cancelled` 是预期的关闭路径；令牌未取消时的取消来自别处，按致命处理。
    /// - 读取期间底层流被释放不算错误。
    /// - 底层流判定为 "对端连接消失" 的错误按正常关闭处理。
    /// - 其余一律视为致命。
    pub fn is_fatal(
        error: &WsError,
        cancel: &CancellationToken,
        channel: &dyn DuplexChannel,
    ) -> bool {
        match error {
            WsError::Cancelled => !cancel.is_cancelled(),
            WsError::Disposed => false,
            _ => !channel.is_benign_disconnect(error),
        }
    }

    async fn receive_loop(
        &self,
        channel: &dyn DuplexChannel,
        cancel: &CancellationToken,
    ) -> Result<(), WsError> {
        let connection_id = self.inner.connection_id;
        let config = &self.inner.config;
        let callbacks = &self.inner.callbacks;
        let mut close_received = false;

        while !cancel.is_cancelled() && !close_received {
            let message = read_message(
                channel,
                config.receive_buffer_size,
                config.max_incoming_message_size,
                cancel,
            )
            .await?;
            match message {
                InboundMessage::Text(text) => {
                    debug!("[连接处理器] 连接 {} 收到文本消息，{} 字节", connection_id, text.len());
                    guard_callback("on_text", || callbacks.on_text(self, text))??;
                }
                InboundMessage::Binary(data) => {
                    debug!(
                        "[连接处理器] 连接 {} 收到二进制消息，{} 字节",
                        connection_id,
                        data.len()
                    );
                    guard_callback("on_binary", || callbacks.on_binary(self, data))??;
                }
                InboundMessage::Close => {
                    close_received = true;
                    self.set_state(ConnectionState::Closing);
                    info!("[连接处理器] 连接 {} 收到对端关闭帧，回复关闭帧。", connection_id);
                    // 给排队的关闭帧一点时间发出去，超时就放弃
                    let close_timeout = config.close_timeout();
                    match tokio::time::timeout(close_timeout, self.close()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            warn!(
                                "[连接处理器] 连接 {} 回复关闭帧失败 (已忽略): {}",
                                connection_id, e
                            );
                        }
                        Err(_) => {
                            warn!(
                                "[连接处理器] 连接 {} 回复关闭帧超时 ({:?})，直接拆除连接。",
                                connection_id, close_timeout
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn writable_channel(&self) -> Option<Arc<dyn DuplexChannel>> {
        if self.state() == ConnectionState::Closed {
            return None;
        }
        let channel = lock(&self.inner.channel).clone()?;
        (channel.state() == ChannelState::Open).then_some(channel)
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner.state.store(state.to_u8(), Ordering::SeqCst);
    }
}

impl std::fmt::Debug for WebSocketHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketHandler")
            .field("connection_id", &self.inner.connection_id)
            .field("state", &self.state())
            .field("pending_sends", &self.inner.send_queue.len())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// 调用用户回调，把其中的 panic 转换为 `WsError::CallbackPanicked`。
fn guard_callback<T>(name: &'static str, callback: impl FnOnce() -> T) -> Result<T, WsError> {
    std::panic::catch_unwind(AssertUnwindSafe(callback)).map_err(|payload| {
        WsError::CallbackPanicked(format!(
            "{} 回调发生 panic: {}",
            name,
            panic_message(payload.as_ref())
        ))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "未知的 panic".to_string()
    }
}
