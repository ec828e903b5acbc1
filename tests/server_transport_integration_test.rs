// rust_connection_transport/tests/server_transport_integration_test.rs

use futures_util::{SinkExt, StreamExt};
use log::{LevelFilter, info};
use rust_connection_transport::client::transport::connect_client;
use rust_connection_transport::server::transport::ServerTransport;
use rust_connection_transport::{
    ConnectionCallbacks, ConnectionState, DuplexChannel, HandlerConfig, WebSocketHandler, WsError,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message as TungsteniteMessage;
use tokio_util::sync::CancellationToken;

// 辅助函数：初始化日志，仅用于测试，避免多次初始化
fn init_test_logger() {
    let _ = env_logger::builder()
        .filter_level(LevelFilter::Info)
        .is_test(true)
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ServerEvent {
    Open(SocketAddr),
    Closed { was_clean: bool },
}

/// 把收到的每条消息加上前缀后原样发回。
struct EchoCallbacks {
    peer_addr: SocketAddr,
    events: mpsc::UnboundedSender<ServerEvent>,
}

impl ConnectionCallbacks for EchoCallbacks {
    fn on_open(&self, _handler: &WebSocketHandler) {
        let _ = self.events.send(ServerEvent::Open(self.peer_addr));
    }

    fn on_text(&self, handler: &WebSocketHandler, text: String) -> Result<(), WsError> {
        info!("[Test Server] 从 {} 收到文本消息: {}", self.peer_addr, text);
        // 不等待发送结果，读循环继续读取下一条消息
        let _ = handler.send_text(format!("Server received: {}", text));
        Ok(())
    }

    fn on_binary(&self, handler: &WebSocketHandler, data: Vec<u8>) -> Result<(), WsError> {
        let mut reversed = data;
        reversed.reverse();
        let _ = handler.send_binary(reversed);
        Ok(())
    }

    fn on_close(&self, _handler: &WebSocketHandler, was_clean: bool) {
        let _ = self.events.send(ServerEvent::Closed { was_clean });
    }
}

struct TestServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    events: mpsc::UnboundedReceiver<ServerEvent>,
    task: JoinHandle<Result<(), WsError>>,
}

async fn start_echo_server() -> TestServer {
    start_echo_server_with(HandlerConfig {
        stall_timeout_ms: 1_000,
        ..HandlerConfig::default()
    })
    .await
}

/// 以给定的处理器配置启动回显服务器，每个连接使用同一份配置。
async fn start_echo_server_with(config: HandlerConfig) -> TestServer {
    init_test_logger();
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("无法绑定到随机端口");
    let addr = listener.local_addr().expect("无法获取本地监听地址");
    let shutdown = CancellationToken::new();
    let (events_tx, events) = mpsc::unbounded_channel();

    let factory = move |peer_addr: SocketAddr| {
        WebSocketHandler::new(
            config.clone(),
            Arc::new(EchoCallbacks {
                peer_addr,
                events: events_tx.clone(),
            }),
        )
    };
    let task = tokio::spawn(ServerTransport::serve(listener, factory, shutdown.clone()));
    TestServer {
        addr,
        shutdown,
        events,
        task,
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServerEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("等待服务端事件超时")
        .expect("事件通道已关闭")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_echoes_messages_in_order_and_closes_cleanly() {
    let mut server = start_echo_server().await;
    let url = format!("ws://{}", server.addr);
    let (mut client, response) = connect_async(&url).await.expect("客户端连接失败");
    info!("[Test Main] 客户端连接成功，服务器响应状态: {}", response.status());
    assert!(matches!(next_event(&mut server.events).await, ServerEvent::Open(_)));

    for i in 0..5 {
        client
            .send(TungsteniteMessage::Text(format!("hello-{}", i)))
            .await
            .expect("客户端发送消息失败");
    }
    client
        .send(TungsteniteMessage::Binary(vec![1, 2, 3]))
        .await
        .expect("客户端发送二进制消息失败");

    for i in 0..5 {
        let reply = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("等待回显超时")
            .expect("连接意外结束")
            .expect("读取回显失败");
        assert_eq!(reply, TungsteniteMessage::Text(format!("Server received: hello-{}", i)));
    }
    let reply = client.next().await.expect("连接意外结束").expect("读取回显失败");
    assert_eq!(reply, TungsteniteMessage::Binary(vec![3, 2, 1]));

    client.close(None).await.expect("客户端关闭失败");
    assert_eq!(
        next_event(&mut server.events).await,
        ServerEvent::Closed { was_clean: true }
    );

    server.shutdown.cancel();
    let result = timeout(Duration::from_secs(5), server.task)
        .await
        .expect("服务器停机超时")
        .expect("服务器任务异常结束");
    assert!(result.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn large_message_is_reassembled_on_the_server() {
    let mut server = start_echo_server().await;
    let (mut client, _) = connect_async(&format!("ws://{}", server.addr))
        .await
        .expect("客户端连接失败");
    assert!(matches!(next_event(&mut server.events).await, ServerEvent::Open(_)));

    // 远大于 4 KB 的分片缓冲区，服务端需要多次分片读取后合并
    let payload = "x".repeat(20 * 1024);
    client
        .send(TungsteniteMessage::Text(payload.clone()))
        .await
        .expect("客户端发送消息失败");
    let reply = timeout(Duration::from_secs(5), client.next())
        .await
        .expect("等待回显超时")
        .expect("连接意外结束")
        .expect("读取回显失败");
    assert_eq!(reply, TungsteniteMessage::Text(format!("Server received: {}", payload)));

    server.shutdown.cancel();
    let _ = timeout(Duration::from_secs(5), server.task).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn message_over_the_size_limit_is_fatal() {
    let mut server = start_echo_server_with(HandlerConfig {
        max_incoming_message_size: Some(1024),
        stall_timeout_ms: 0,
        ..HandlerConfig::default()
    })
    .await;
    let (mut client, _) = connect_async(&format!("ws://{}", server.addr))
        .await
        .expect("客户端连接失败");
    assert!(matches!(next_event(&mut server.events).await, ServerEvent::Open(_)));

    client
        .send(TungsteniteMessage::Text("x".repeat(4096)))
        .await
        .expect("客户端发送消息失败");
    assert_eq!(
        next_event(&mut server.events).await,
        ServerEvent::Closed { was_clean: false }
    );

    server.shutdown.cancel();
    let _ = timeout(Duration::from_secs(5), server.task).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abrupt_client_disconnect_is_not_an_error() {
    let mut server = start_echo_server().await;
    let (client, _) = connect_async(&format!("ws://{}", server.addr))
        .await
        .expect("客户端连接失败");
    assert!(matches!(next_event(&mut server.events).await, ServerEvent::Open(_)));

    // 不经过关闭握手直接断开
    drop(client);
    assert_eq!(
        next_event(&mut server.events).await,
        ServerEvent::Closed { was_clean: true }
    );

    server.shutdown.cancel();
    let _ = timeout(Duration::from_secs(5), server.task).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_closes_active_connections() {
    let mut server = start_echo_server().await;
    let (mut client, _) = connect_async(&format!("ws://{}", server.addr))
        .await
        .expect("客户端连接失败");
    assert!(matches!(next_event(&mut server.events).await, ServerEvent::Open(_)));

    server.shutdown.cancel();
    assert_eq!(
        next_event(&mut server.events).await,
        ServerEvent::Closed { was_clean: true }
    );
    // 服务端在拆除连接前发出了关闭帧
    let frame = timeout(Duration::from_secs(5), client.next())
        .await
        .expect("等待关闭帧超时");
    assert!(matches!(frame, Some(Ok(TungsteniteMessage::Close(_)))));

    let result = timeout(Duration::from_secs(5), server.task)
        .await
        .expect("服务器停机超时")
        .expect("服务器任务异常结束");
    assert!(result.is_ok());
}

/// 客户端一侧同样由 `WebSocketHandler` 驱动。
struct GreetingClient {
    replies: mpsc::UnboundedSender<String>,
    closed: mpsc::UnboundedSender<bool>,
}

impl ConnectionCallbacks for GreetingClient {
    fn on_open(&self, handler: &WebSocketHandler) {
        let _ = handler.send_text("来自客户端处理器的问候");
    }

    fn on_text(&self, handler: &WebSocketHandler, text: String) -> Result<(), WsError> {
        let _ = self.replies.send(text);
        let _ = handler.close();
        Ok(())
    }

    fn on_close(&self, _handler: &WebSocketHandler, was_clean: bool) {
        let _ = self.closed.send(was_clean);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handler_drives_the_client_side_too() {
    let mut server = start_echo_server().await;
    let channel = connect_client(&format!("ws://{}", server.addr))
        .await
        .expect("客户端连接失败");

    let (replies_tx, mut replies) = mpsc::unbounded_channel();
    let (closed_tx, mut closed) = mpsc::unbounded_channel();
    let handler = WebSocketHandler::new(
        HandlerConfig::default(),
        Arc::new(GreetingClient {
            replies: replies_tx,
            closed: closed_tx,
        }),
    );
    let channel: Arc<dyn DuplexChannel> = Arc::new(channel);
    let client_task = {
        let handler = handler.clone();
        tokio::spawn(async move {
            handler
                .process_request(channel, CancellationToken::new())
                .await
        })
    };

    let reply = timeout(Duration::from_secs(5), replies.recv())
        .await
        .expect("等待回显超时")
        .expect("回显通道已关闭");
    assert_eq!(reply, "Server received: 来自客户端处理器的问候");

    let was_clean = timeout(Duration::from_secs(5), closed.recv())
        .await
        .expect("等待客户端关闭超时")
        .expect("关闭通道已关闭");
    assert!(was_clean);
    client_task.await.expect("客户端处理任务异常结束");
    assert_eq!(handler.state(), ConnectionState::Closed);
    assert!(handler.last_error().is_none());

    assert!(matches!(next_event(&mut server.events).await, ServerEvent::Open(_)));
    assert_eq!(
        next_event(&mut server.events).await,
        ServerEvent::Closed { was_clean: true }
    );
    server.shutdown.cancel();
    let _ = timeout(Duration::from_secs(5), server.task).await;
}
