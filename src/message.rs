// rust_connection_transport/src/message.rs

//! 定义连接上流转的消息结构。
//!
//! - `MessageKind`: 帧/消息的类型 (文本、二进制、关闭)。
//! - `InboundMessage`: 消息读取器从一个或多个分片中还原出的一条完整入站消息。
//! - `OutboundMessage`: 提交给有序发送队列的一个不可变发送单元。

use serde::{Deserialize, Serialize};

/// 底层流上一个分片所携带的消息类型。
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Text,
    Binary,
    Close,
}

/// 一条完整的入站消息。
///
/// 由消息读取器产出，交给连接处理器立即分发，分发后不再保留。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

impl InboundMessage {
    /// 返回消息对应的类型。
    pub fn kind(&self) -> MessageKind {
        match self {
            InboundMessage::Text(_) => MessageKind::Text,
            InboundMessage::Binary(_) => MessageKind::Binary,
            InboundMessage::Close => MessageKind::Close,
        }
    }

    /// 空文本消息，单分片且长度为 0 时直接返回，无需分配缓冲区。
    pub fn empty_text() -> Self {
        InboundMessage::Text(String::new())
    }

    /// 空二进制消息。
    pub fn empty_binary() -> Self {
        InboundMessage::Binary(Vec::new())
    }
}

/// 提交给有序发送队列的一个发送单元。
///
/// 创建后不可变，被队列恰好消费一次；无论成功或失败都不会自动重试。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// 要写入的载荷字节。
    pub payload: Vec<u8>,
    /// 载荷的消息类型，只能是文本或二进制。
    pub kind: MessageKind,
    /// 是否为该逻辑消息的最后一个分片。
    pub end_of_message: bool,
}

impl OutboundMessage {
    /// 构造一个单分片的文本消息。
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            payload: text.into().into_bytes(),
            kind: MessageKind::Text,
            end_of_message: true,
        }
    }

    /// 构造一个单分片的二进制消息。
    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: data.into(),
            kind: MessageKind::Binary,
            end_of_message: true,
        }
    }

    /// 构造任意分片。
    pub fn fragment(payload: impl Into<Vec<u8>>, kind: MessageKind, end_of_message: bool) -> Self {
        Self {
            payload: payload.into(),
            kind,
            end_of_message,
        }
    }
}
