// rust_connection_transport/src/channel/mod.rs

//! 双工流抽象。
//!
//! 连接处理器不直接依赖某个具体的 WebSocket 库，而是通过 `DuplexChannel`
//! 读写由宿主提供的双工流。接口与常见的分片式 WebSocket API 对齐：
//! 读取时由调用方提供缓冲区，返回本次读到的字节数、消息类型与 "消息结束" 标志；
//! 允许传入长度为 0 的缓冲区作为探测读取，只获取元数据而不消费载荷。
//!
//! - `tungstenite`: 基于 `tokio-tungstenite` 的实现。

pub mod tungstenite;

#[cfg(test)]
pub(crate) mod scripted;

use crate::error::WsError;
use crate::message::MessageKind;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// 底层流当前的状态，连接处理器据此把发送/关闭短路为空操作。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// 握手完成，可以收发。
    Open,
    /// 已收到对端的关闭帧，尚未回复。
    CloseReceived,
    /// 已发送关闭帧，等待对端回复。
    CloseSent,
    /// 关闭握手已完成。
    Closed,
    /// 连接被异常中止。
    Aborted,
}

impl ChannelState {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            ChannelState::Open => 0,
            ChannelState::CloseReceived => 1,
            ChannelState::CloseSent => 2,
            ChannelState::Closed => 3,
            ChannelState::Aborted => 4,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelState::Open,
            1 => ChannelState::CloseReceived,
            2 => ChannelState::CloseSent,
            3 => ChannelState::Closed,
            _ => ChannelState::Aborted,
        }
    }

    /// 是否还可以发出关闭帧。
    pub fn can_close_output(self) -> bool {
        matches!(self, ChannelState::Open | ChannelState::CloseReceived)
    }
}

/// 关闭帧携带的状态码。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStatus {
    NormalClosure,
    EndpointUnavailable,
    ProtocolError,
    InvalidPayloadData,
    MessageTooBig,
    InternalServerError,
}

impl CloseStatus {
    /// RFC 6455 定义的数值状态码。
    pub fn code(self) -> u16 {
        match self {
            CloseStatus::NormalClosure => 1000,
            CloseStatus::EndpointUnavailable => 1001,
            CloseStatus::ProtocolError => 1002,
            CloseStatus::InvalidPayloadData => 1007,
            CloseStatus::MessageTooBig => 1009,
            CloseStatus::InternalServerError => 1011,
        }
    }
}

/// 一次分片读取的结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveResult {
    /// 写入调用方缓冲区的字节数。
    pub count: usize,
    /// 本分片所属消息的类型。
    pub kind: MessageKind,
    /// 是否为该消息的最后一个分片。
    pub end_of_message: bool,
}

impl ReceiveResult {
    pub fn close() -> Self {
        Self {
            count: 0,
            kind: MessageKind::Close,
            end_of_message: true,
        }
    }
}

/// 由传输宿主提供的双工流。
///
/// 实现必须允许一个读取与一个写入并发进行；
/// 连接处理器保证同一时刻最多只有一个读取、最多只有一个写入。
#[async_trait]
pub trait DuplexChannel: Send + Sync {
    /// 读取一个分片到 `buffer`。`buffer` 为空时是探测读取。
    async fn receive(
        &self,
        buffer: &mut [u8],
        cancel: &CancellationToken,
    ) -> Result<ReceiveResult, WsError>;

    /// 写入一个分片。
    async fn send(
        &self,
        payload: &[u8],
        kind: MessageKind,
        end_of_message: bool,
        cancel: &CancellationToken,
    ) -> Result<(), WsError>;

    /// 发出关闭帧，只关闭本端的输出方向。
    async fn close_output(
        &self,
        status: CloseStatus,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Result<(), WsError>;

    /// 底层流的当前状态。
    fn state(&self) -> ChannelState;

    /// 该错误是否只是对端连接消失，应按正常关闭处理。
    fn is_benign_disconnect(&self, error: &WsError) -> bool {
        error.is_abrupt_disconnect()
    }
}
