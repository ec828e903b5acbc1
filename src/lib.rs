//! `rust_connection_transport` 是持久连接的传输层核心。
//!
//! 它把一条原始的双工 WebSocket 流变成按消息分帧的文本/二进制消息，
//! 提供严格有序、不会交错写入的发送队列，负责关闭握手与致命/非致命错误的分类，
//! 并监视发送队列是否长时间停滞。
//!
//! 主要模块包括：
//! - `buffer`: 多分片消息的字节累积器。
//! - `message`: 入站与出站消息类型。
//! - `reader`: 从双工流读取一条完整消息。
//! - `queue`: 有序发送队列与停滞监视器。
//! - `handler`: 每个连接的状态机与回调接口。
//! - `channel`: 双工流抽象及其 `tokio-tungstenite` 实现。
//! - `server` / `client`: 服务端监听与客户端连接。
//! - `config`: 处理器配置。
//! - `error`: 统一错误类型 `WsError`。

pub mod buffer;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod message;
pub mod queue;
pub mod reader;
pub mod server;

pub use channel::{ChannelState, CloseStatus, DuplexChannel, ReceiveResult};
pub use config::HandlerConfig;
pub use error::WsError;
pub use handler::{ConnectionCallbacks, ConnectionState, WebSocketHandler};
pub use message::{InboundMessage, MessageKind, OutboundMessage};
pub use queue::{StallReport, TaskHandle, TaskQueue, TaskQueueMonitor};
