//! 推送连接管理
//!
//! 每个会话只维护一条逻辑推送连接，调用方只能通过命令方法和只读状态访问它，
//! 不直接接触 WebSocket 句柄。
//!
//! 出站消息在未连接时进入显式队列，连接建立（`Connected`）时按 FIFO 顺序写出；
//! 每条排队消息都有自己的结果，超过 `send_timeout` 未写出的消息返回超时错误且之后不会再被发送。

use crate::im::connection::listener::ConnectionListener;
use crate::im::connection::state::{ConnectionState, ConnectionStatus, ReconnectPolicy};
use crate::im::error::{ConnectionError, SendError};
use crate::im::message::types::SendMessageRequest;
use crate::im::serialization::{compress_gzip, decompress_gzip, is_gzip};
use crate::im::types::{InboundFrame, PushFrame};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

/// WebSocket 写入端类型别名
pub type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// WebSocket 读取端类型别名
pub type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// 推送连接配置
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// 推送服务地址，例如 `ws://localhost:10001/ws`
    pub ws_url: String,
    /// 会话 token，以查询参数附加到连接地址
    pub token: String,
    /// 出站压缩方式："gzip" 或空字符串表示发送文本帧
    pub compression: String,
    /// 心跳间隔
    pub heartbeat_interval: Duration,
    /// 未连接时单条消息等待写出的最长时间
    pub send_timeout: Duration,
    /// WebSocket 握手的最长时间，超时后回到 `Disconnected`
    pub connect_timeout: Duration,
    /// 重连退避策略
    pub reconnect: ReconnectPolicy,
}

impl ConnectionConfig {
    pub fn new(ws_url: String, token: String) -> Self {
        Self {
            ws_url,
            token,
            compression: String::new(),
            heartbeat_interval: Duration::from_secs(25),
            send_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// 排队等待连接的出站帧
struct QueuedFrame {
    payload: String,
    reply: oneshot::Sender<Result<(), SendError>>,
}

#[derive(Default)]
struct SessionTasks {
    reader: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

struct Inner {
    config: ConnectionConfig,
    state: watch::Sender<ConnectionState>,
    /// 锁顺序：writer -> outbox -> tasks
    writer: Mutex<Option<WsWriter>>,
    outbox: Mutex<VecDeque<QueuedFrame>>,
    tasks: Mutex<SessionTasks>,
    /// 每次建立连接递增，用于识别过期的读任务
    session: AtomicU64,
    listener: Arc<dyn ConnectionListener>,
}

/// 推送连接管理器
///
/// 可廉价克隆，所有克隆共享同一条连接。
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

/// 可见性监听的注册凭证，drop 时注销监听任务
pub struct VisibilityGuard {
    task: JoinHandle<()>,
}

impl Drop for VisibilityGuard {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, listener: Arc<dyn ConnectionListener>) -> Self {
        let (state, _) = watch::channel(ConnectionState::new(config.reconnect.max_attempts));
        Self {
            inner: Arc::new(Inner {
                config,
                state,
                writer: Mutex::new(None),
                outbox: Mutex::new(VecDeque::new()),
                tasks: Mutex::new(SessionTasks::default()),
                session: AtomicU64::new(0),
                listener,
            }),
        }
    }

    /// 建立连接；已连接或正在连接时为空操作
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.inner.connect().await
    }

    /// 发送一条私信（type 3 帧）
    ///
    /// 未连接时消息进入发送队列并触发重连，在 `send_timeout` 内未能写出则返回
    /// [`SendError::Timeout`]，该消息之后也不会再发送。
    pub async fn send(&self, request: &SendMessageRequest) -> Result<(), SendError> {
        let payload = PushFrame::chat(request)?.to_text()?;
        self.inner.send_frame(payload).await
    }

    /// 主动关闭连接，终止所有后台任务并拒绝排队中的消息
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        {
            let mut tasks = inner.tasks.lock().await;
            if let Some(handle) = tasks.reconnect.take() {
                handle.abort();
            }
        }
        let mut writer = inner.writer.lock().await;
        let changed = inner.close_session(&mut writer, "主动关闭", true).await;
        drop(writer);
        inner.fail_outbox(|| SendError::Closed).await;
        if changed {
            inner.notify_status().await;
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// 订阅连接状态变化
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// 注册可见性监听：每当变为可见且未连接时调用 `connect()`
    ///
    /// 每个会话只应注册一次，返回的凭证被 drop 时监听随之注销。
    pub fn watch_visibility(&self, mut visibility: watch::Receiver<bool>) -> VisibilityGuard {
        let inner = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            while visibility.changed().await.is_ok() {
                let visible = *visibility.borrow_and_update();
                if !visible {
                    continue;
                }
                let Some(this) = inner.upgrade() else {
                    break;
                };
                if this.is_connected() {
                    continue;
                }
                info!("[Conn] 👀 页面恢复可见且未连接，重新连接");
                if let Err(e) = this.connect().await {
                    warn!("[Conn] 可见性触发的连接失败: {}", e);
                }
            }
        });
        VisibilityGuard { task }
    }
}

impl Inner {
    fn is_connected(&self) -> bool {
        self.state.borrow().is_connected()
    }

    fn build_url(&self) -> Result<reqwest::Url, ConnectionError> {
        reqwest::Url::parse_with_params(&self.config.ws_url, &[("token", &self.config.token)])
            .map_err(|e| ConnectionError::InvalidUrl {
                url: self.config.ws_url.clone(),
                reason: e.to_string(),
            })
    }

    async fn notify_status(&self) {
        let state = *self.state.borrow();
        debug!("[Conn] 连接状态: {}", state.status);
        self.listener.on_connection_status_changed(state).await;
    }

    /// 置为 `Disconnected`，返回状态是否发生变化
    fn set_disconnected(&self) -> bool {
        self.state.send_if_modified(|s| {
            if s.status == ConnectionStatus::Disconnected {
                false
            } else {
                s.mark_disconnected();
                true
            }
        })
    }

    async fn connect(self: &Arc<Self>) -> Result<(), ConnectionError> {
        if !self.state.send_if_modified(|s| s.begin_connect()) {
            debug!("[Conn] 连接已存在或正在建立，忽略 connect()");
            return Ok(());
        }
        self.establish().await
    }

    /// 已进入 `Connecting` 后完成握手并切换到 `Connected`
    async fn establish(self: &Arc<Self>) -> Result<(), ConnectionError> {
        self.notify_status().await;

        let url = match self.build_url() {
            Ok(url) => url,
            Err(e) => {
                error!("[Conn] ❌ {}", e);
                if self.set_disconnected() {
                    self.notify_status().await;
                }
                return Err(e);
            }
        };

        info!("[Conn] 🔗 连接推送服务: {}", self.config.ws_url);
        let handshake = timeout(self.config.connect_timeout, connect_async(url.as_str()));
        let (ws_stream, response) = match handshake.await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                warn!("[Conn] ❌ 推送连接失败: {}", e);
                if self.set_disconnected() {
                    self.notify_status().await;
                }
                return Err(ConnectionError::Handshake(e));
            }
            Err(_) => {
                warn!(
                    "[Conn] ⌛ 推送连接握手超时（{:?}）",
                    self.config.connect_timeout
                );
                if self.set_disconnected() {
                    self.notify_status().await;
                }
                return Err(ConnectionError::Timeout(self.config.connect_timeout));
            }
        };
        info!(
            "[Conn] ✅ WebSocket 连接成功, 状态: {}",
            response.status()
        );

        let (mut write, read) = ws_stream.split();
        let session = self.session.fetch_add(1, Ordering::SeqCst) + 1;

        let drained = {
            let mut writer = self.writer.lock().await;
            if self.state.borrow().status != ConnectionStatus::Connecting {
                // 握手期间被 shutdown
                let _ = write.close().await;
                return Err(ConnectionError::Dropped("握手期间连接被关闭".to_string()));
            }
            match self.drain_outbox(&mut write).await {
                Ok(count) => {
                    *writer = Some(write);
                    self.state.send_modify(|s| s.mark_connected());
                    self.start_session_tasks(session, read).await;
                    Ok(count)
                }
                Err(reason) => {
                    let _ = write.close().await;
                    self.set_disconnected();
                    Err(reason)
                }
            }
        };
        self.notify_status().await;

        match drained {
            Ok(count) => {
                if count > 0 {
                    info!("[Conn] 📤 已发送 {} 条排队消息", count);
                }
                Ok(())
            }
            Err(reason) => {
                warn!("[Conn] ❌ 排队消息写出失败，连接已关闭: {}", reason);
                self.spawn_reconnect().await;
                Err(ConnectionError::Dropped(reason))
            }
        }
    }

    async fn start_session_tasks(self: &Arc<Self>, session: u64, read: WsReader) {
        let mut tasks = self.tasks.lock().await;
        let weak = Arc::downgrade(self);
        if let Some(old) = tasks
            .reader
            .replace(tokio::spawn(read_loop(weak.clone(), read, session)))
        {
            old.abort();
        }
        if let Some(old) = tasks.heartbeat.replace(tokio::spawn(heartbeat_loop(
            weak,
            session,
            self.config.heartbeat_interval,
        ))) {
            old.abort();
        }
    }

    /// 按 FIFO 写出排队消息；调用方已超时放弃的消息直接跳过
    ///
    /// 写入失败时该条消息返回错误，其余消息留在队列中。
    async fn drain_outbox(&self, write: &mut WsWriter) -> Result<usize, String> {
        let mut outbox = self.outbox.lock().await;
        let mut sent = 0;
        while let Some(frame) = outbox.pop_front() {
            if frame.reply.is_closed() {
                debug!("[Conn] 跳过已超时的排队消息");
                continue;
            }
            match write_payload(write, &self.config.compression, &frame.payload).await {
                Ok(()) => {
                    let _ = frame.reply.send(Ok(()));
                    sent += 1;
                }
                Err(e) => {
                    let reason = e.to_string();
                    let _ = frame.reply.send(Err(e));
                    return Err(reason);
                }
            }
        }
        Ok(sent)
    }

    async fn fail_outbox(&self, error: impl Fn() -> SendError) {
        let mut outbox = self.outbox.lock().await;
        let pending = outbox.len();
        for frame in outbox.drain(..) {
            let _ = frame.reply.send(Err(error()));
        }
        if pending > 0 {
            warn!("[Conn] 🗑️ 丢弃 {} 条未发送的排队消息", pending);
        }
    }

    async fn send_frame(self: &Arc<Self>, payload: String) -> Result<(), SendError> {
        let reply = {
            let mut writer = self.writer.lock().await;
            if self.is_connected() {
                if let Some(w) = writer.as_mut() {
                    match write_payload(w, &self.config.compression, &payload).await {
                        Ok(()) => return Ok(()),
                        Err(e) => {
                            error!("[Conn] ❌ 消息写入失败: {}", e);
                            let changed = self.close_session(&mut writer, "写入失败", true).await;
                            drop(writer);
                            if changed {
                                self.notify_status().await;
                            }
                            return Err(e);
                        }
                    }
                }
            }
            let (tx, rx) = oneshot::channel();
            let mut outbox = self.outbox.lock().await;
            outbox.retain(|f| !f.reply.is_closed());
            outbox.push_back(QueuedFrame { payload, reply: tx });
            rx
        };

        info!("[Conn] ⏳ 连接未就绪，消息进入发送队列");
        self.ensure_reconnecting().await;

        match timeout(self.config.send_timeout, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SendError::Closed),
            Err(_) => {
                warn!(
                    "[Conn] ⌛ 等待连接超时（{:?}），消息未发送",
                    self.config.send_timeout
                );
                Err(SendError::Timeout(self.config.send_timeout))
            }
        }
    }

    /// 启动重连流程；已有重连任务在运行时为空操作
    async fn ensure_reconnecting(self: &Arc<Self>) {
        if self.is_connected() {
            return;
        }
        let mut tasks = self.tasks.lock().await;
        if tasks
            .reconnect
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
        {
            debug!("[Conn] 重连任务已在运行");
            return;
        }
        tasks.reconnect = Some(tokio::spawn(reconnect_loop(Arc::downgrade(self))));
    }

    /// 重连任务内部会再次进入 `establish`，这里返回显式 `Send` 的 future 以截断类型递归
    fn spawn_reconnect(self: &Arc<Self>) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.ensure_reconnecting())
    }

    /// 关闭当前会话：关闭写端、停止心跳、按需终止读任务，状态置为 `Disconnected`
    ///
    /// 调用方持有 writer 锁；返回状态是否发生变化，由调用方在释放锁后通知监听器。
    async fn close_session(
        &self,
        writer: &mut Option<WsWriter>,
        reason: &str,
        abort_reader: bool,
    ) -> bool {
        if let Some(mut w) = writer.take() {
            let _ = w.close().await;
        }
        self.session.fetch_add(1, Ordering::SeqCst);
        {
            let mut tasks = self.tasks.lock().await;
            if let Some(handle) = tasks.heartbeat.take() {
                handle.abort();
            }
            if let Some(handle) = tasks.reader.take() {
                if abort_reader {
                    handle.abort();
                }
            }
        }
        let changed = self.set_disconnected();
        if changed {
            warn!("[Conn] 👋 连接关闭: {}", reason);
        }
        changed
    }

    async fn on_reader_finished(&self, session: u64) {
        let mut writer = self.writer.lock().await;
        if self.session.load(Ordering::SeqCst) != session {
            debug!("[Conn] 忽略过期会话 {} 的关闭事件", session);
            return;
        }
        let changed = self.close_session(&mut writer, "连接已断开", false).await;
        drop(writer);
        if changed {
            self.notify_status().await;
        }
    }

    async fn dispatch_frame(&self, raw: &[u8]) {
        match PushFrame::decode(raw) {
            Ok(InboundFrame::ChatSync(message)) => {
                debug!(
                    "[Conn] 📥 私信同步: messageId={}, syncId={}, sender={}",
                    message.message_id, message.sync_id, message.sender_id
                );
                self.listener.on_push_message(message).await;
            }
            Ok(InboundFrame::Heartbeat) => {}
            Ok(InboundFrame::Unknown(frame_type)) => {
                debug!("[Conn] 未知帧类型: {}", frame_type);
            }
            Err(e) => {
                error!(
                    "[Conn] 帧解析失败，已丢弃: {}, 原始数据: {}",
                    e,
                    String::from_utf8_lossy(raw)
                );
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut();
        for handle in [
            tasks.reader.take(),
            tasks.heartbeat.take(),
            tasks.reconnect.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

async fn write_payload(
    writer: &mut WsWriter,
    compression: &str,
    payload: &str,
) -> Result<(), SendError> {
    let message = if compression == "gzip" {
        let packed =
            compress_gzip(payload.as_bytes()).map_err(|e| SendError::Write(e.to_string()))?;
        WsMessage::Binary(packed)
    } else {
        WsMessage::Text(payload.to_string())
    };
    writer
        .send(message)
        .await
        .map_err(|e| SendError::Write(e.to_string()))
}

/// 读任务（事件循环）
async fn read_loop(inner: Weak<Inner>, mut read: WsReader, session: u64) {
    while let Some(msg_result) = read.next().await {
        let Some(this) = inner.upgrade() else {
            return;
        };
        match msg_result {
            Ok(WsMessage::Text(text)) => this.dispatch_frame(text.as_bytes()).await,
            Ok(WsMessage::Binary(data)) => {
                let decoded = if is_gzip(&data) {
                    match decompress_gzip(&data) {
                        Ok(d) => d,
                        Err(e) => {
                            error!("[Conn] 解压失败，已丢弃: {}", e);
                            continue;
                        }
                    }
                } else {
                    data
                };
                this.dispatch_frame(&decoded).await;
            }
            Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {}
            Ok(WsMessage::Close(frame)) => {
                warn!("[Conn] 👋 服务器关闭连接: {:?}", frame);
                break;
            }
            Err(e) => {
                error!("[Conn] WebSocket 错误: {}", e);
                break;
            }
            _ => {}
        }
    }
    if let Some(this) = inner.upgrade() {
        this.on_reader_finished(session).await;
    }
}

/// 心跳：仅在 `Connected` 时发送 `{"type":2}`
async fn heartbeat_loop(inner: Weak<Inner>, session: u64, period: Duration) {
    let payload = match PushFrame::heartbeat().to_text() {
        Ok(p) => p,
        Err(e) => {
            error!("[Conn] 心跳帧序列化失败: {}", e);
            return;
        }
    };
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        let Some(this) = inner.upgrade() else {
            return;
        };
        if this.session.load(Ordering::SeqCst) != session {
            return;
        }
        let mut writer = this.writer.lock().await;
        if !this.is_connected() {
            continue;
        }
        let Some(w) = writer.as_mut() else {
            continue;
        };
        debug!("[Conn] 💓 发送心跳");
        if let Err(e) = write_payload(w, &this.config.compression, &payload).await {
            // 由读任务确认断开
            warn!("[Conn] 💔 心跳发送失败: {}", e);
            return;
        }
    }
}

/// 重连：剩余次数从上限开始递减，每次尝试前按退避策略等待；
/// 连接成功或次数耗尽即停止，耗尽时拒绝所有排队消息。
///
/// 只有本任务真正发起的握手才计为一次尝试；其他调用方正在连接时等待其结束。
async fn reconnect_loop(inner: Weak<Inner>) {
    let Some(policy) = inner.upgrade().map(|this| this.config.reconnect) else {
        return;
    };
    let mut remaining = policy.max_attempts;
    loop {
        let Some(this) = inner.upgrade() else {
            return;
        };
        if this.is_connected() {
            return;
        }
        if remaining == 0 {
            warn!(
                "[Conn] 🛑 重连 {} 次均失败，放弃重连",
                policy.max_attempts
            );
            this.fail_outbox(|| SendError::ReconnectExhausted).await;
            return;
        }
        let delay = policy.delay_for(remaining);
        drop(this);

        sleep(delay).await;

        let Some(this) = inner.upgrade() else {
            return;
        };
        let claimed = this.state.send_if_modified(|s| {
            if s.begin_connect() {
                s.record_attempt();
                true
            } else {
                false
            }
        });
        if !claimed {
            if this.is_connected() {
                return;
            }
            debug!("[Conn] 已有连接正在建立，等待其结束");
            let mut status = this.state.subscribe();
            drop(this);
            if status
                .wait_for(|s| s.status != ConnectionStatus::Connecting)
                .await
                .is_err()
            {
                return;
            }
            continue;
        }
        info!(
            "[Conn] 🔄 第 {}/{} 次重连（等待 {:?}）",
            policy.max_attempts - remaining + 1,
            policy.max_attempts,
            delay
        );
        if let Err(e) = this.establish().await {
            warn!("[Conn] 重连失败: {}", e);
        }
        remaining -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::message::types::DirectMessage;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_tungstenite::accept_hdr_async;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    struct RecordingListener {
        messages: mpsc::UnboundedSender<DirectMessage>,
    }

    #[async_trait]
    impl ConnectionListener for RecordingListener {
        async fn on_connection_status_changed(&self, _state: ConnectionState) {}
        async fn on_push_message(&self, message: DirectMessage) {
            let _ = self.messages.send(message);
        }
    }

    struct TestServer {
        url: String,
        frames: mpsc::UnboundedReceiver<String>,
        queries: mpsc::UnboundedReceiver<String>,
        accepted: Arc<AtomicUsize>,
    }

    async fn start_server(greeting: Vec<WsMessage>, close_after_greeting: bool) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        serve(listener, greeting, close_after_greeting)
    }

    /// 本地 WebSocket 服务：接入后先发送 `greeting`，随后把收到的文本帧转给测试
    fn serve(listener: TcpListener, greeting: Vec<WsMessage>, close_after_greeting: bool) -> TestServer {
        let addr = listener.local_addr().unwrap();
        let (frame_tx, frames) = mpsc::unbounded_channel();
        let (query_tx, queries) = mpsc::unbounded_channel();
        let accepted = Arc::new(AtomicUsize::new(0));
        let accepted_counter = accepted.clone();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accepted_counter.fetch_add(1, Ordering::SeqCst);
                let frame_tx = frame_tx.clone();
                let query_tx = query_tx.clone();
                let greeting = greeting.clone();
                tokio::spawn(async move {
                    let callback =
                        move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                            let _ = query_tx.send(req.uri().query().unwrap_or_default().to_string());
                            Ok(resp)
                        };
                    let Ok(mut ws) = accept_hdr_async(stream, callback).await else {
                        return;
                    };
                    for msg in greeting {
                        if ws.send(msg).await.is_err() {
                            return;
                        }
                    }
                    if close_after_greeting {
                        let _ = ws.close(None).await;
                        return;
                    }
                    while let Some(Ok(msg)) = ws.next().await {
                        if let WsMessage::Text(text) = msg {
                            let _ = frame_tx.send(text);
                        }
                    }
                });
            }
        });

        TestServer {
            url: format!("ws://{}", addr),
            frames,
            queries,
            accepted,
        }
    }

    fn test_config(url: &str) -> ConnectionConfig {
        ConnectionConfig::new(url.to_string(), "secret-token".to_string())
    }

    fn manager(config: ConnectionConfig) -> (ConnectionManager, mpsc::UnboundedReceiver<DirectMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = Arc::new(RecordingListener { messages: tx });
        (ConnectionManager::new(config, listener), rx)
    }

    async fn next_frame(frames: &mut mpsc::UnboundedReceiver<String>) -> serde_json::Value {
        let text = tokio::time::timeout(Duration::from_secs(5), frames.recv())
            .await
            .expect("等待帧超时")
            .expect("服务端已关闭");
        serde_json::from_str(&text).unwrap()
    }

    /// 不可连接的地址：绑定后立即释放端口
    async fn unreachable_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("ws://{}", addr)
    }

    #[tokio::test]
    async fn connect_is_idempotent_and_delivers_chat_frames() {
        let sync_frame = r#"{"type":4,"data":{"messageId":7,"syncId":3,"senderId":42,"receiverId":1,"content":"hi","messageType":0,"status":0,"createTime":1,"updateTime":1}}"#;
        let mut server = start_server(
            vec![
                WsMessage::Text("{broken".to_string()),
                WsMessage::Text(r#"{"type":99}"#.to_string()),
                WsMessage::Text(sync_frame.to_string()),
            ],
            false,
        )
        .await;
        let (manager, mut messages) = manager(test_config(&server.url));

        manager.connect().await.unwrap();
        manager.connect().await.unwrap();
        assert!(manager.is_connected());

        let received = tokio::time::timeout(Duration::from_secs(5), messages.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.message_id, 7);
        assert_eq!(received.sender_id, 42);

        let query = server.queries.recv().await.unwrap();
        assert_eq!(query, "token=secret-token");
        assert_eq!(server.accepted.load(Ordering::SeqCst), 1);

        manager.shutdown().await;
        assert_eq!(manager.state().status, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn send_writes_chat_frame_when_connected() {
        let mut server = start_server(vec![], false).await;
        let (manager, _messages) = manager(test_config(&server.url));
        manager.connect().await.unwrap();

        manager
            .send(&SendMessageRequest::text(42, "你好").reply_to(5))
            .await
            .unwrap();

        let frame = next_frame(&mut server.frames).await;
        assert_eq!(frame["type"], 3);
        assert_eq!(frame["data"]["receiverId"], 42);
        assert_eq!(frame["data"]["content"], "你好");
        assert_eq!(frame["data"]["replyMessageId"], 5);
    }

    #[tokio::test]
    async fn heartbeat_is_sent_while_connected() {
        let mut server = start_server(vec![], false).await;
        let mut config = test_config(&server.url);
        config.heartbeat_interval = Duration::from_millis(50);
        let (manager, _messages) = manager(config);
        manager.connect().await.unwrap();

        let frame = next_frame(&mut server.frames).await;
        assert_eq!(frame, serde_json::json!({ "type": 2 }));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn queued_send_is_flushed_after_reconnect() {
        let mut server = start_server(vec![], false).await;
        let (manager, _messages) = manager(test_config(&server.url));
        assert!(!manager.is_connected());

        manager
            .send(&SendMessageRequest::text(42, "queued"))
            .await
            .unwrap();

        let frame = next_frame(&mut server.frames).await;
        assert_eq!(frame["data"]["content"], "queued");
        let mut status = manager.subscribe_status();
        tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.is_connected()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(manager.state().reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn queued_send_times_out_while_unreachable() {
        let url = unreachable_url().await;
        let mut config = test_config(&url);
        config.send_timeout = Duration::from_millis(100);
        let (manager, _messages) = manager(config);

        let err = manager
            .send(&SendMessageRequest::text(42, "lost"))
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::Timeout(_)), "{:?}", err);
        assert!(!manager.is_connected());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn queued_send_fails_when_reconnect_is_exhausted() {
        let url = unreachable_url().await;
        let mut config = test_config(&url);
        config.send_timeout = Duration::from_secs(5);
        config.reconnect = ReconnectPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        };
        let (manager, _messages) = manager(config);

        let err = manager
            .send(&SendMessageRequest::text(42, "lost"))
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::ReconnectExhausted), "{:?}", err);
        assert_eq!(manager.state().reconnect_attempts, 2);
    }

    #[tokio::test]
    async fn server_close_leaves_connection_disconnected() {
        let server = start_server(vec![], true).await;
        let (manager, _messages) = manager(test_config(&server.url));
        let mut status = manager.subscribe_status();

        manager.connect().await.unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| s.status == ConnectionStatus::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();

        // 断开后不会自行重连
        sleep(Duration::from_millis(100)).await;
        assert_eq!(server.accepted.load(Ordering::SeqCst), 1);
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn visibility_triggers_connect_until_guard_dropped() {
        let server = start_server(vec![], false).await;
        let (manager, _messages) = manager(test_config(&server.url));
        let (visible_tx, visible_rx) = watch::channel(false);
        let guard = manager.watch_visibility(visible_rx);
        let mut status = manager.subscribe_status();

        visible_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.is_connected()))
            .await
            .unwrap()
            .unwrap();

        manager.shutdown().await;
        drop(guard);
        let _ = visible_tx.send(false);
        let _ = visible_tx.send(true);
        sleep(Duration::from_millis(100)).await;
        assert!(!manager.is_connected());
        assert_eq!(server.accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stalled_handshake_times_out_and_allows_retry() {
        // 只监听不 accept：TCP 建立但握手永远得不到响应
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let mut config = test_config(&url);
        config.connect_timeout = Duration::from_millis(200);
        let (manager, _messages) = manager(config);

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Timeout(_)), "{:?}", err);
        assert_eq!(manager.state().status, ConnectionStatus::Disconnected);

        // 再次调用会重新握手，而不是当作“正在连接”直接返回
        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Timeout(_)), "{:?}", err);
        drop(listener);
    }

    #[tokio::test]
    async fn timed_out_frame_is_never_written_later() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let mut config = test_config(&url);
        config.send_timeout = Duration::from_millis(100);
        let (manager, _messages) = manager(config);

        let err = manager
            .send(&SendMessageRequest::text(42, "lost"))
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::Timeout(_)), "{:?}", err);

        // 超时之后服务端才开始接入，挂起的握手随即完成
        let mut server = serve(listener, vec![], false);
        let mut status = manager.subscribe_status();
        tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.is_connected()))
            .await
            .unwrap()
            .unwrap();

        manager
            .send(&SendMessageRequest::text(42, "after"))
            .await
            .unwrap();
        let frame = next_frame(&mut server.frames).await;
        assert_eq!(frame["data"]["content"], "after");
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_rejects_queued_frames() {
        let url = unreachable_url().await;
        let mut config = test_config(&url);
        config.send_timeout = Duration::from_secs(5);
        config.reconnect = ReconnectPolicy {
            max_attempts: 12,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(1),
        };
        let (manager, _messages) = manager(config);

        let sender = manager.clone();
        let pending =
            tokio::spawn(async move { sender.send(&SendMessageRequest::text(42, "queued")).await });
        let queued = tokio::time::timeout(Duration::from_secs(5), async {
            while manager.inner.outbox.lock().await.is_empty() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(queued.is_ok());

        manager.shutdown().await;
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, SendError::Closed), "{:?}", err);
        assert!(manager.inner.outbox.lock().await.is_empty());
    }

    #[tokio::test]
    async fn close_from_superseded_session_is_ignored() {
        let server = start_server(vec![], false).await;
        let (manager, _messages) = manager(test_config(&server.url));

        manager.connect().await.unwrap();
        let first_session = manager.inner.session.load(Ordering::SeqCst);
        manager.shutdown().await;
        manager.connect().await.unwrap();
        assert_ne!(manager.inner.session.load(Ordering::SeqCst), first_session);

        // 旧读任务迟到的关闭通知不影响当前连接
        manager.inner.on_reader_finished(first_session).await;
        assert!(manager.is_connected());
        assert_eq!(server.accepted.load(Ordering::SeqCst), 2);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn reconnect_waits_for_handshake_in_progress_without_spending_attempts() {
        // 第一条 TCP 连接只接入不握手，之后的连接正常服务
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (frame_tx, mut frames) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let Ok((_stalled, _)) = listener.accept().await else {
                return;
            };
            while let Ok((stream, _)) = listener.accept().await {
                let frame_tx = frame_tx.clone();
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    while let Some(Ok(msg)) = ws.next().await {
                        if let WsMessage::Text(text) = msg {
                            let _ = frame_tx.send(text);
                        }
                    }
                });
            }
        });

        let mut config = test_config(&url);
        config.connect_timeout = Duration::from_millis(300);
        config.send_timeout = Duration::from_secs(5);
        config.reconnect = ReconnectPolicy {
            max_attempts: 1,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(5),
        };
        let (manager, _messages) = manager(config);

        let first = manager.clone();
        let stalled = tokio::spawn(async move { first.connect().await });
        let mut status = manager.subscribe_status();
        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| s.status == ConnectionStatus::Connecting),
        )
        .await
        .unwrap()
        .unwrap();

        // 唯一的一次重连机会要留到卡住的握手结束之后
        manager
            .send(&SendMessageRequest::text(42, "queued"))
            .await
            .unwrap();
        let frame = next_frame(&mut frames).await;
        assert_eq!(frame["data"]["content"], "queued");
        assert!(matches!(
            stalled.await.unwrap(),
            Err(ConnectionError::Timeout(_))
        ));
        manager.shutdown().await;
    }
}
