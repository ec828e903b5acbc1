// rust_connection_transport/src/client/mod.rs

//! WebSocket 客户端接入。
//!
//! 建立到服务器的连接后返回一个 `DuplexChannel`，客户端一侧同样由 `WebSocketHandler` 驱动。

pub mod transport;
