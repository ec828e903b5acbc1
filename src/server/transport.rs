// rust_connection_transport/src/server/transport.rs

//! 服务端监听与连接接入。

use crate::channel::DuplexChannel;
use crate::channel::tungstenite::{TungsteniteChannel, websocket_config};
use crate::error::WsError;
use crate::handler::WebSocketHandler;
use log::{error, info};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::accept_async_with_config;
use tokio_util::sync::CancellationToken;

/// `ServerTransport` 负责 WebSocket 服务端的监听和连接接受。
pub struct ServerTransport;

impl ServerTransport {
    /// 绑定 `addr` 并开始接受连接，直到 `shutdown` 被取消。
    ///
    /// 对于每一个新的 TCP 连接，先调用 `factory` 创建 `WebSocketHandler`，
    /// 再按该处理器的配置 (例如入站消息大小上限) 完成 WebSocket 握手，
    /// 最后以 `shutdown` 的子令牌运行它的 `process_request`。
    ///
    /// # Arguments
    /// * `addr` - 服务器监听的地址 (例如 "127.0.0.1:8080")。
    /// * `factory` - 根据对端地址创建连接处理器。
    /// * `shutdown` - 停机信号。取消后停止接受新连接，并等待现有连接完成关闭。
    ///
    /// # Returns
    /// 监听器绑定失败时返回 `WsError::TcpBindError`；否则在停机完成后返回 `Ok(())`。
    pub async fn start<F>(
        addr: SocketAddr,
        factory: F,
        shutdown: CancellationToken,
    ) -> Result<(), WsError>
    where
        F: Fn(SocketAddr) -> WebSocketHandler + Send + Sync + 'static,
    {
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(WsError::TcpBindError)?;
        Self::serve(listener, factory, shutdown).await
    }

    /// 在一个已经绑定的监听器上接受连接，语义与 `start` 相同。
    pub async fn serve<F>(
        listener: TcpListener,
        factory: F,
        shutdown: CancellationToken,
    ) -> Result<(), WsError>
    where
        F: Fn(SocketAddr) -> WebSocketHandler + Send + Sync + 'static,
    {
        let local_addr = listener.local_addr()?;
        info!("[服务端传输] WebSocket 服务器正在监听地址: {}", local_addr);

        let factory = Arc::new(factory);
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("[服务端传输] 收到停机信号，停止接受新连接。");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((tcp_stream, peer_addr)) => {
                        info!("[服务端传输] 从 {} 接受了新的 TCP 连接", peer_addr);
                        connections.spawn(handle_connection(
                            tcp_stream,
                            peer_addr,
                            Arc::clone(&factory),
                            shutdown.child_token(),
                        ));
                    }
                    Err(e) => {
                        // 单次 accept 失败不影响监听
                        error!("[服务端传输] 接受 TCP 连接失败: {}。服务器将继续运行。", e);
                    }
                }
            }
            while connections.try_join_next().is_some() {}
        }

        let remaining = connections.len();
        if remaining > 0 {
            info!("[服务端传输] 等待 {} 个连接完成关闭...", remaining);
        }
        while connections.join_next().await.is_some() {}
        info!("[服务端传输] 服务器 {} 已停止。", local_addr);
        Ok(())
    }
}

async fn handle_connection<F>(
    tcp_stream: TcpStream,
    peer_addr: SocketAddr,
    factory: Arc<F>,
    cancel: CancellationToken,
) where
    F: Fn(SocketAddr) -> WebSocketHandler + Send + Sync + 'static,
{
    // 处理器的配置决定了握手时交给 tungstenite 的大小上限
    let handler = (*factory)(peer_addr);
    let ws_config = websocket_config(handler.config());
    let ws_stream = tokio::select! {
        _ = cancel.cancelled() => return,
        handshake = accept_async_with_config(tcp_stream, Some(ws_config)) => match handshake {
            Ok(ws_stream) => ws_stream,
            Err(e) => {
                error!("[服务端传输] 与 {} 的 WebSocket 握手失败: {}", peer_addr, e);
                return;
            }
        }
    };
    info!(
        "[服务端传输] 与 {} 的 WebSocket 握手成功，连接 ID: {}",
        peer_addr,
        handler.connection_id()
    );
    let channel: Arc<dyn DuplexChannel> = Arc::new(TungsteniteChannel::new(ws_stream));
    handler.process_request(channel, cancel).await;
}
