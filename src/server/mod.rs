// rust_connection_transport/src/server/mod.rs

//! WebSocket 服务端宿主。
//!
//! 负责监听 TCP 端口、完成 WebSocket 升级握手，并为每个连接创建一个 `WebSocketHandler`。
//! 连接上的消息分帧、发送排队与关闭协商都交给处理器完成。

pub mod transport;
