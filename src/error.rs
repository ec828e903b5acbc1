// rust_connection_transport/src/error.rs

//! 定义传输层相关的错误类型。
//!
//! 读循环、发送队列与流适配器共用同一个 `WsError`。
//! 致命与否的判定不在这里完成，而是由连接处理器 (`handler`) 统一分类。

use crate::message::MessageKind;
use thiserror::Error;

/// 传输层的统一错误类型。
#[derive(Error, Debug)]
pub enum WsError {
    /// 累积的消息大小超过了配置的上限。
    /// 不会进行部分投递，该消息（及其连接）按致命错误处理。
    #[error("消息过大: 上限 {limit} 字节，已累积 {attempted} 字节")]
    MessageTooLarge { limit: usize, attempted: usize },

    /// 对端违反协议，例如分片消息中途切换了消息类型。
    #[error("协议错误: {0}")]
    ProtocolError(String),

    /// 文本消息不是合法的 UTF-8。
    #[error("文本消息不是合法的UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// 回调没有实现对应消息类型的处理方法却收到了该类型的消息。
    #[error("未实现的消息处理: 回调未处理 {0:?} 类型的消息")]
    UnhandledMessageKind(MessageKind),

    /// 用户回调在执行时发生 panic。
    #[error("回调异常终止: {0}")]
    CallbackPanicked(String),

    /// 读写操作被取消令牌中断。
    #[error("操作已取消")]
    Cancelled,

    /// 底层流在读取过程中已被释放。
    #[error("底层流已被释放")]
    Disposed,

    /// 对端在没有关闭握手的情况下断开了连接。
    #[error("连接已断开: {0}")]
    Disconnected(String),

    /// WebSocket 协议相关的错误。
    #[error("WebSocket协议错误: {0}")]
    WebSocketProtocolError(#[from] tokio_tungstenite::tungstenite::Error),

    /// 底层 I/O 错误。
    #[error("I/O错误: {0}")]
    IoError(#[from] std::io::Error),

    /// 发送队列中待完成的任务数已达上限。
    #[error("发送队列已满: 上限 {0}")]
    QueueFull(usize),

    /// 发送队列已被排空，不再接受新任务。
    #[error("发送队列已排空，拒绝新任务")]
    QueueDrained,

    /// 在没有 tokio 运行时的线程上提交了发送任务。
    #[error("当前线程没有可用的 tokio 运行时")]
    RuntimeUnavailable,

    /// 队列中的任务在执行时发生 panic，其结果无法送达。
    #[error("队列任务异常终止")]
    TaskAborted,

    /// 服务端 TCP 监听器绑定失败。
    #[error("TCP 监听器绑定失败: {0}")]
    TcpBindError(#[source] std::io::Error),

    /// 未连接错误，当尝试在未建立连接时进行操作。
    #[error("未连接")]
    NotConnected,

    /// 连接超时错误。
    #[error("连接超时")]
    ConnectionTimeout,

    /// 无效的 URL 格式。
    #[error("无效的URL: {0}")]
    InvalidUrl(String),

    /// 配置文件的读取或解析失败。
    #[error("配置错误: {0}")]
    ConfigError(String),
}

impl WsError {
    /// 判断该错误是否代表对端 TCP 连接的异常消失。
    ///
    /// 这是平台无关的默认判定，具体的流实现可以通过
    /// `DuplexChannel::is_benign_disconnect` 覆盖。
    pub fn is_abrupt_disconnect(&self) -> bool {
        use tokio_tungstenite::tungstenite::error::ProtocolError as TungsteniteProtocolError;
        use tokio_tungstenite::tungstenite::Error as TungsteniteError;

        match self {
            WsError::Disconnected(_) => true,
            WsError::IoError(e) => is_disconnect_io_kind(e.kind()),
            WsError::WebSocketProtocolError(e) => match e {
                TungsteniteError::ConnectionClosed | TungsteniteError::AlreadyClosed => true,
                TungsteniteError::Protocol(
                    TungsteniteProtocolError::ResetWithoutClosingHandshake,
                ) => true,
                TungsteniteError::Io(io) => is_disconnect_io_kind(io.kind()),
                _ => false,
            },
            _ => false,
        }
    }
}

fn is_disconnect_io_kind(kind: std::io::ErrorKind) -> bool {
    use std::io::ErrorKind;
    matches!(
        kind,
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
    )
}
