// rust_connection_transport/src/client/transport.rs

//! 客户端连接建立。

use crate::channel::tungstenite::{ClientChannel, TungsteniteChannel, websocket_config};
use crate::config::HandlerConfig;
use crate::error::WsError;
use log::{debug, error, info};
use std::time::Duration;
use tokio_tungstenite::connect_async_with_config;
use url::Url;

/// 以默认的 `HandlerConfig` 异步连接到指定的 WebSocket 服务器。
///
/// # Arguments
/// * `url_str` - 服务器的完整 URL (例如 "ws://127.0.0.1:8080/ws" 或 "wss://example.com/socket")。
///
/// # Returns
/// 握手成功后返回包装好的 `ClientChannel`，交给 `WebSocketHandler::process_request` 驱动。
/// URL 无效时返回 `WsError::InvalidUrl`，连接或握手失败时返回 `WsError::WebSocketProtocolError`。
pub async fn connect_client(url_str: &str) -> Result<ClientChannel, WsError> {
    connect_client_with_config(url_str, &HandlerConfig::default()).await
}

/// 异步连接到指定的 WebSocket 服务器，并把 `config` 中的入站消息大小上限交给 tungstenite。
///
/// 驱动返回流的 `WebSocketHandler` 应使用同一份配置。
pub async fn connect_client_with_config(
    url_str: &str,
    config: &HandlerConfig,
) -> Result<ClientChannel, WsError> {
    info!("[客户端传输] 开始尝试连接到 WebSocket 服务器，URL: {}", url_str);
    let parsed_url = Url::parse(url_str)
        .map_err(|e| WsError::InvalidUrl(format!("无效的 WebSocket URL '{}': {}", url_str, e)))?;
    if !matches!(parsed_url.scheme(), "ws" | "wss") {
        return Err(WsError::InvalidUrl(format!(
            "不支持的协议 '{}'，只接受 ws 或 wss",
            parsed_url.scheme()
        )));
    }

    let ws_config = websocket_config(config);
    match connect_async_with_config(parsed_url.as_str(), Some(ws_config), false).await {
        Ok((ws_stream, response)) => {
            info!("[客户端传输] 已成功连接到 {} (HTTP 状态码: {})", url_str, response.status());
            debug!("[客户端传输] WebSocket 连接响应头: {:?}", response.headers());
            Ok(TungsteniteChannel::new(ws_stream))
        }
        Err(e) => {
            error!("[客户端传输] 连接到 {} 失败，错误: {}", url_str, e);
            Err(WsError::WebSocketProtocolError(e))
        }
    }
}

/// 与 `connect_client` 相同，但整个连接与握手过程不超过 `timeout`。
pub async fn connect_client_with_timeout(
    url_str: &str,
    timeout: Duration,
) -> Result<ClientChannel, WsError> {
    tokio::time::timeout(timeout, connect_client(url_str))
        .await
        .map_err(|_| {
            error!("[客户端传输] 连接到 {} 超时 ({:?})", url_str, timeout);
            WsError::ConnectionTimeout
        })?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn malformed_url_is_rejected() {
        assert!(matches!(
            connect_client("not a url").await,
            Err(WsError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn non_websocket_scheme_is_rejected() {
        assert!(matches!(
            connect_client("http://127.0.0.1:1/").await,
            Err(WsError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn refused_connection_is_reported() {
        let _ = env_logger::builder().is_test(true).try_init();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let url = format!("ws://{}", addr);
        let result = connect_client_with_timeout(&url, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(WsError::WebSocketProtocolError(_))));
    }
}
