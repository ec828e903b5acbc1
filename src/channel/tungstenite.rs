// rust_connection_transport/src/channel/tungstenite.rs

//! 基于 `tokio-tungstenite` 的 `DuplexChannel` 实现。
//!
//! tungstenite 在读取端已经把分片合并为完整消息，这里再按调用方的缓冲区大小把消息切回分片，
//! 以便消息读取器统一处理。发送端的非最终分片以原始数据帧写出，后续分片使用延续帧。

use super::{ChannelState, CloseStatus, DuplexChannel, ReceiveResult};
use crate::config::HandlerConfig;
use crate::error::WsError;
use crate::message::MessageKind;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::debug;
use std::borrow::Cow;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::error::{CapacityError, ProtocolError};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::protocol::frame::coding::{CloseCode, Data, OpCode};
use tokio_tungstenite::tungstenite::protocol::frame::{CloseFrame, Frame};
use tokio_tungstenite::tungstenite::{Error as TungsteniteError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

/// 服务端接受的连接使用的流类型。
pub type ServerChannel = TungsteniteChannel<TcpStream>;
/// 客户端建立的连接使用的流类型 (可能经过 TLS)。
pub type ClientChannel = TungsteniteChannel<MaybeTlsStream<TcpStream>>;

/// 尚未被完全读出的入站消息。
struct PendingMessage {
    kind: MessageKind,
    data: Vec<u8>,
    offset: usize,
}

struct Inbound<S> {
    stream: SplitStream<WebSocketStream<S>>,
    pending: Option<PendingMessage>,
}

struct Outbound<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
    /// 是否有一条分片发送尚未发出最终分片。
    fragmenting: bool,
}

enum NextMessage {
    Data(PendingMessage),
    Close,
}

/// 包装一个已完成握手的 `WebSocketStream`。
///
/// 读写两端分别加锁，因此读循环与发送队列可以同时工作。
pub struct TungsteniteChannel<S> {
    inbound: Mutex<Inbound<S>>,
    outbound: Mutex<Outbound<S>>,
    state: AtomicU8,
}

impl<S> TungsteniteChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(ws_stream: WebSocketStream<S>) -> Self {
        let (sink, stream) = ws_stream.split();
        Self {
            inbound: Mutex::new(Inbound {
                stream,
                pending: None,
            }),
            outbound: Mutex::new(Outbound {
                sink,
                fragmenting: false,
            }),
            state: AtomicU8::new(ChannelState::Open.to_u8()),
        }
    }

    fn set_state(&self, state: ChannelState) {
        self.state.store(state.to_u8(), Ordering::SeqCst);
    }

    /// 读取下一条数据消息或关闭帧，跳过 Ping/Pong 等控制帧。
    async fn next_message(&self, inbound: &mut Inbound<S>) -> Result<NextMessage, WsError> {
        loop {
            match inbound.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(NextMessage::Data(PendingMessage {
                        kind: MessageKind::Text,
                        data: text.into_bytes(),
                        offset: 0,
                    }));
                }
                Some(Ok(Message::Binary(data))) => {
                    return Ok(NextMessage::Data(PendingMessage {
                        kind: MessageKind::Binary,
                        data,
                        offset: 0,
                    }));
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("[WebSocket流] 收到关闭帧: {:?}", frame);
                    let next = match self.state() {
                        ChannelState::CloseSent => ChannelState::Closed,
                        _ => ChannelState::CloseReceived,
                    };
                    self.set_state(next);
                    return Ok(NextMessage::Close);
                }
                Some(Ok(Message::Ping(data))) => {
                    // Pong 由 tungstenite 自动回复
                    debug!("[WebSocket流] 收到 Ping 控制帧，{} 字节", data.len());
                }
                Some(Ok(Message::Pong(data))) => {
                    debug!("[WebSocket流] 收到 Pong 控制帧，{} 字节", data.len());
                }
                Some(Ok(Message::Frame(_))) => {
                    debug!("[WebSocket流] 跳过原始帧。");
                }
                Some(Err(TungsteniteError::Capacity(CapacityError::MessageTooLong {
                    size,
                    max_size,
                }))) => {
                    return Err(WsError::MessageTooLarge {
                        limit: max_size,
                        attempted: size,
                    });
                }
                Some(Err(e)) => {
                    let error = WsError::from(e);
                    if error.is_abrupt_disconnect() {
                        self.set_state(ChannelState::Aborted);
                    }
                    return Err(error);
                }
                None => {
                    self.set_state(ChannelState::Aborted);
                    return Err(WsError::Disconnected("接收流已结束".to_string()));
                }
            }
        }
    }

    async fn receive_inner(&self, buffer: &mut [u8]) -> Result<ReceiveResult, WsError> {
        let mut inbound = self.inbound.lock().await;
        let mut pending = match inbound.pending.take() {
            Some(pending) => pending,
            None => match self.next_message(&mut inbound).await? {
                NextMessage::Data(pending) => pending,
                NextMessage::Close => return Ok(ReceiveResult::close()),
            },
        };

        let remaining = &pending.data[pending.offset..];
        let count = remaining.len().min(buffer.len());
        buffer[..count].copy_from_slice(&remaining[..count]);
        pending.offset += count;
        let end_of_message = pending.offset == pending.data.len();
        let kind = pending.kind;
        if !end_of_message {
            inbound.pending = Some(pending);
        }
        Ok(ReceiveResult {
            count,
            kind,
            end_of_message,
        })
    }

    async fn send_inner(
        &self,
        payload: &[u8],
        kind: MessageKind,
        end_of_message: bool,
    ) -> Result<(), WsError> {
        let mut outbound = self.outbound.lock().await;
        let message = if !outbound.fragmenting && end_of_message {
            match kind {
                MessageKind::Text => Message::Text(String::from_utf8(payload.to_vec())?),
                _ => Message::Binary(payload.to_vec()),
            }
        } else {
            let data = if outbound.fragmenting {
                Data::Continue
            } else if kind == MessageKind::Text {
                Data::Text
            } else {
                Data::Binary
            };
            Message::Frame(Frame::message(
                payload.to_vec(),
                OpCode::Data(data),
                end_of_message,
            ))
        };
        outbound.sink.send(message).await.map_err(|e| {
            let error = WsError::from(e);
            if error.is_abrupt_disconnect() {
                self.set_state(ChannelState::Aborted);
            }
            error
        })?;
        outbound.fragmenting = !end_of_message;
        Ok(())
    }

    async fn close_inner(&self, status: CloseStatus, reason: &str) -> Result<(), WsError> {
        let mut outbound = self.outbound.lock().await;
        let result = if self.state() == ChannelState::CloseReceived {
            // tungstenite 收到关闭帧时已经排好了回复，这里只需要把它写出去
            outbound.sink.flush().await
        } else {
            let frame = CloseFrame {
                code: CloseCode::from(status.code()),
                reason: Cow::Owned(reason.to_string()),
            };
            outbound.sink.send(Message::Close(Some(frame))).await
        };
        match result {
            Ok(()) => {
                let next = match self.state() {
                    ChannelState::CloseReceived => ChannelState::Closed,
                    _ => ChannelState::CloseSent,
                };
                self.set_state(next);
                Ok(())
            }
            // 关闭握手已经由 tungstenite 完成
            Err(TungsteniteError::ConnectionClosed)
            | Err(TungsteniteError::AlreadyClosed)
            | Err(TungsteniteError::Protocol(ProtocolError::SendAfterClosing)) => {
                self.set_state(ChannelState::Closed);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// 根据处理器配置生成 tungstenite 的连接参数。
///
/// 入站消息的大小上限必须在 tungstenite 合并分片时就生效，
/// 否则超限的消息会先被完整缓存下来。`None` 表示不限制。
pub fn websocket_config(config: &HandlerConfig) -> WebSocketConfig {
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = config.max_incoming_message_size;
    ws_config.max_frame_size = config.max_incoming_message_size;
    ws_config
}

#[async_trait]
impl<S> DuplexChannel for TungsteniteChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn receive(
        &self,
        buffer: &mut [u8],
        cancel: &CancellationToken,
    ) -> Result<ReceiveResult, WsError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(WsError::Cancelled),
            result = self.receive_inner(buffer) => result,
        }
    }

    async fn send(
        &self,
        payload: &[u8],
        kind: MessageKind,
        end_of_message: bool,
        cancel: &CancellationToken,
    ) -> Result<(), WsError> {
        if kind == MessageKind::Close {
            return Err(WsError::ProtocolError("关闭帧必须通过 close_output 发送".to_string()));
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(WsError::Cancelled),
            result = self.send_inner(payload, kind, end_of_message) => result,
        }
    }

    async fn close_output(
        &self,
        status: CloseStatus,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Result<(), WsError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(WsError::Cancelled),
            result = self.close_inner(status, reason) => result,
        }
    }

    fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::SeqCst))
    }
}
