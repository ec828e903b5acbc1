// rust_connection_transport/src/reader.rs

//! 消息读取器。
//!
//! 从双工流上读出一条逻辑消息 (文本、二进制或关闭)。
//! 读取顺序：
//! 1. 先用长度为 0 的缓冲区做一次探测读取，空消息与关闭帧在这一步直接返回，不分配分片缓冲区。
//! 2. 再用分片缓冲区读取第一个真实分片；如果它已经是消息的最后一个分片，直接按类型返回。
//! 3. 否则创建 `ByteBuffer` 累积后续分片，直到看到 "消息结束" 标志。
//!    中途切换消息类型是协议错误；中途收到关闭帧则立即返回关闭消息，丢弃已累积的字节。

use crate::buffer::ByteBuffer;
use crate::channel::{DuplexChannel, ReceiveResult};
use crate::error::WsError;
use crate::message::{InboundMessage, MessageKind};
use log::debug;
use tokio_util::sync::CancellationToken;

/// 分片缓冲区的默认大小。与最大消息大小无关，后者只约束累积后的总大小。
pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 4 * 1024;

/// 读取一条完整的入站消息。
///
/// # Arguments
/// * `channel` - 底层双工流。
/// * `buffer_size` - 单次分片读取使用的缓冲区大小。
/// * `max_message_size` - 一条消息允许的最大总字节数，`None` 表示不限制。
/// * `cancel` - 外部取消令牌；被取消时返回 `WsError::Cancelled`。
pub async fn read_message(
    channel: &dyn DuplexChannel,
    buffer_size: usize,
    max_message_size: Option<usize>,
    cancel: &CancellationToken,
) -> Result<InboundMessage, WsError> {
    // 探测读取
    let mut probe: [u8; 0] = [];
    let result = receive_fragment(channel, &mut probe, cancel).await?;
    if let Some(message) = try_get_message(&result, None, max_message_size)? {
        return Ok(message);
    }

    let mut buffer = vec![0u8; buffer_size.max(1)];
    let result = receive_fragment(channel, &mut buffer, cancel).await?;
    let first = &buffer[..result.count];
    if let Some(message) = try_get_message(&result, Some(first), max_message_size)? {
        return Ok(message);
    }

    // 多分片消息，需要合并
    let original_kind = result.kind;
    let mut accumulated = ByteBuffer::new(max_message_size);
    accumulated.append(&buffer[..result.count])?;
    debug!(
        "[消息读取器] 开始累积多分片 {:?} 消息，首分片 {} 字节",
        original_kind, result.count
    );

    loop {
        let result = receive_fragment(channel, &mut buffer, cancel).await?;
        if result.kind == MessageKind::Close {
            debug!(
                "[消息读取器] 累积过程中收到关闭帧，丢弃已累积的 {} 字节",
                accumulated.len()
            );
            return Ok(InboundMessage::Close);
        }
        if result.kind != original_kind {
            return Err(WsError::ProtocolError(format!(
                "incorrect message type: 分片消息以 {:?} 开始，却收到了 {:?} 分片",
                original_kind, result.kind
            )));
        }
        accumulated.append(&buffer[..result.count])?;
        if result.end_of_message {
            return match original_kind {
                MessageKind::Text => Ok(InboundMessage::Text(accumulated.into_string()?)),
                MessageKind::Binary => Ok(InboundMessage::Binary(accumulated.into_bytes())),
                MessageKind::Close => Ok(InboundMessage::Close),
            };
        }
    }
}

async fn receive_fragment(
    channel: &dyn DuplexChannel,
    buffer: &mut [u8],
    cancel: &CancellationToken,
) -> Result<ReceiveResult, WsError> {
    // 即使实现忽略了令牌，取消也必须能打断读取
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(WsError::Cancelled),
        result = channel.receive(buffer, cancel) => result,
    }
}

/// 单分片即可确定的消息在这里直接构造。`payload` 为 `None` 表示探测读取。
fn try_get_message(
    result: &ReceiveResult,
    payload: Option<&[u8]>,
    max_message_size: Option<usize>,
) -> Result<Option<InboundMessage>, WsError> {
    if result.kind == MessageKind::Close {
        return Ok(Some(InboundMessage::Close));
    }
    if !result.end_of_message {
        return Ok(None);
    }
    let Some(payload) = payload else {
        return Ok(Some(match result.kind {
            MessageKind::Binary => InboundMessage::empty_binary(),
            _ => InboundMessage::empty_text(),
        }));
    };
    if let Some(limit) = max_message_size {
        if payload.len() > limit {
            return Err(WsError::MessageTooLarge {
                limit,
                attempted: payload.len(),
            });
        }
    }
    let message = match result.kind {
        MessageKind::Text => InboundMessage::Text(String::from_utf8(payload.to_vec())?),
        MessageKind::Binary => InboundMessage::Binary(payload.to_vec()),
        MessageKind::Close => InboundMessage::Close,
    };
    Ok(Some(message))
}
