//! 私信客户端
//!
//! 把推送连接、历史同步和已读位置组合成界面使用的接口。
//! 一次登录对应一个会话：`connect()` 在会话内只注册一次可见性监听、只加载一次历史，
//! `logout()` 结束会话并清空所有状态。

use crate::im::connection::{
    ConnectionConfig, ConnectionListener, ConnectionManager, ConnectionState, ReconnectPolicy,
    VisibilityGuard,
};
use crate::im::conversation::{
    ContactSummary, ConversationListener, ConversationSyncer, ConversationSyncerConfig,
    ConversationView, EmptyConversationListener,
};
use crate::im::error::SendError;
use crate::im::message::api::{HistoryFetcher, HttpMessageApi, ReadPositionApi};
use crate::im::message::listener::{AdvancedMsgListener, EmptyAdvancedMsgListener};
use crate::im::message::types::{DirectMessage, SendMessageRequest, UserId};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// 客户端配置
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// 当前用户 ID
    pub user_id: UserId,
    /// 会话 token
    pub token: String,
    /// 推送服务 URL
    pub ws_url: String,
    /// HTTP API 基础地址（历史消息、已读位置）
    pub api_base_url: String,
    /// 压缩方式，例如 "gzip" 或空字符串表示不压缩
    pub compression: String,
    pub heartbeat_interval: Duration,
    pub send_timeout: Duration,
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub history_page_size: u32,
    pub history_max_pages: u32,
}

impl ClientConfig {
    /// 创建默认配置
    pub fn new(user_id: UserId, token: String) -> Self {
        Self {
            user_id,
            token,
            ws_url: "ws://localhost:10001/ws".to_string(),
            api_base_url: "http://localhost:10002".to_string(),
            compression: String::new(),
            heartbeat_interval: Duration::from_secs(25),
            send_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
            history_page_size: 50,
            history_max_pages: 20,
        }
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            ws_url: self.ws_url.clone(),
            token: self.token.clone(),
            compression: self.compression.clone(),
            heartbeat_interval: self.heartbeat_interval,
            send_timeout: self.send_timeout,
            connect_timeout: self.connect_timeout,
            reconnect: self.reconnect,
        }
    }

    pub fn syncer_config(&self) -> ConversationSyncerConfig {
        ConversationSyncerConfig {
            user_id: self.user_id,
            history_page_size: self.history_page_size,
            history_max_pages: self.history_max_pages,
        }
    }
}

/// 推送消息转交给同步器和消息监听器
struct PushBridge {
    current_user: UserId,
    syncer: ConversationSyncer,
    msg_listener: Arc<dyn AdvancedMsgListener>,
}

#[async_trait]
impl ConnectionListener for PushBridge {
    async fn on_connection_status_changed(&self, state: ConnectionState) {
        self.msg_listener.on_connection_status_changed(state).await;
    }

    async fn on_push_message(&self, message: DirectMessage) {
        let contact_id = message.counterpart(self.current_user);
        let is_new = self.syncer.on_live_message(message.clone()).await;

        if message.is_read_line_marker() {
            // 对方发出的标记即对方的已读回执
            if message.sender_id == contact_id {
                debug!(
                    "[Client] 📨 已读回执: contact={}, syncId={}",
                    contact_id, message.sync_id
                );
                self.msg_listener
                    .on_recv_c2c_read_receipt(contact_id, message.sync_id)
                    .await;
            }
        } else if is_new {
            self.msg_listener.on_recv_new_message(message).await;
        }
    }
}

#[derive(Default)]
struct ClientSession {
    visibility_guard: Option<VisibilityGuard>,
    history_task: Option<JoinHandle<()>>,
}

/// 客户端构建器
pub struct ClientBuilder {
    config: ClientConfig,
    conversation_listener: Arc<dyn ConversationListener>,
    advanced_msg_listener: Arc<dyn AdvancedMsgListener>,
    history_fetcher: Option<Arc<dyn HistoryFetcher>>,
    read_position_api: Option<Arc<dyn ReadPositionApi>>,
}

impl ClientBuilder {
    /// 注册会话监听器
    pub fn conversation_listener(mut self, listener: Arc<dyn ConversationListener>) -> Self {
        self.conversation_listener = listener;
        self
    }

    /// 注册高级消息监听器
    pub fn advanced_msg_listener(mut self, listener: Arc<dyn AdvancedMsgListener>) -> Self {
        self.advanced_msg_listener = listener;
        self
    }

    pub fn history_fetcher(mut self, fetcher: Arc<dyn HistoryFetcher>) -> Self {
        self.history_fetcher = Some(fetcher);
        self
    }

    pub fn read_position_api(mut self, api: Arc<dyn ReadPositionApi>) -> Self {
        self.read_position_api = Some(api);
        self
    }

    /// 未指定的协作方使用 `api_base_url` 上的 HTTP 实现
    pub fn build(self) -> Result<ChatClient> {
        let (history_fetcher, read_position_api) =
            match (self.history_fetcher, self.read_position_api) {
                (Some(history), Some(read)) => (history, read),
                (history, read) => {
                    let http = Arc::new(
                        HttpMessageApi::with_token(
                            self.config.api_base_url.clone(),
                            &self.config.token,
                        )
                        .context("创建 HTTP API 客户端失败")?,
                    );
                    let history: Arc<dyn HistoryFetcher> = match history {
                        Some(history) => history,
                        None => http.clone(),
                    };
                    let read: Arc<dyn ReadPositionApi> = match read {
                        Some(read) => read,
                        None => http,
                    };
                    (history, read)
                }
            };

        let syncer = ConversationSyncer::with_listener(
            self.config.syncer_config(),
            history_fetcher,
            read_position_api,
            self.conversation_listener,
        );
        let bridge = Arc::new(PushBridge {
            current_user: self.config.user_id,
            syncer: syncer.clone(),
            msg_listener: self.advanced_msg_listener,
        });
        let connection = ConnectionManager::new(self.config.connection_config(), bridge);
        let (visibility, _) = watch::channel(true);

        info!(
            "[Client] 创建私信客户端 (user={}, ws={})",
            self.config.user_id, self.config.ws_url
        );
        Ok(ChatClient {
            config: self.config,
            connection,
            syncer,
            visibility,
            session: Mutex::new(ClientSession::default()),
        })
    }
}

/// 私信客户端
pub struct ChatClient {
    config: ClientConfig,
    connection: ConnectionManager,
    syncer: ConversationSyncer,
    visibility: watch::Sender<bool>,
    session: Mutex<ClientSession>,
}

impl ChatClient {
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder {
            config,
            conversation_listener: Arc::new(EmptyConversationListener),
            advanced_msg_listener: Arc::new(EmptyAdvancedMsgListener),
            history_fetcher: None,
            read_position_api: None,
        }
    }

    /// 使用 HTTP 协作方和空监听器创建客户端
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn user_id(&self) -> UserId {
        self.config.user_id
    }

    /// 连接推送服务
    ///
    /// 会话内首次调用时注册可见性监听并在后台加载历史；历史加载失败的话下次调用会重试。
    pub async fn connect(&self) -> Result<()> {
        {
            let mut session = self.session.lock().await;
            if session.visibility_guard.is_none() {
                session.visibility_guard =
                    Some(self.connection.watch_visibility(self.visibility.subscribe()));
            }
            let history_pending = session
                .history_task
                .as_ref()
                .map_or(true, |task| task.is_finished());
            if history_pending && !self.syncer.is_history_loaded().await {
                let syncer = self.syncer.clone();
                session.history_task = Some(tokio::spawn(async move {
                    info!("[Client] 🔄 启动历史消息同步任务");
                    match syncer.load_history().await {
                        Ok(count) => info!("[Client] ✅ 历史消息同步完成: {} 条", count),
                        Err(e) => error!("[Client] ❌ 历史消息同步失败: {e}"),
                    }
                }));
            }
        }

        info!("[Client] 🔗 连接推送服务 (user={})", self.config.user_id);
        self.connection
            .connect()
            .await
            .context("连接推送服务失败")?;
        Ok(())
    }

    /// 页面可见性变化
    pub fn set_visible(&self, visible: bool) {
        self.visibility.send_if_modified(|current| {
            if *current == visible {
                false
            } else {
                *current = visible;
                true
            }
        });
    }

    /// 发送私信
    pub async fn send(&self, request: SendMessageRequest) -> Result<(), SendError> {
        self.connection.send(&request).await
    }

    /// 推进与 `contact_id` 会话的已读位置，不等待服务器应答
    pub async fn update_readline_position(&self, contact_id: UserId) {
        self.syncer.update_readline_position(contact_id).await;
    }

    /// 切换当前打开的会话
    pub async fn set_active_contact(&self, contact_id: Option<UserId>) {
        self.syncer.set_active_contact(contact_id).await;
    }

    pub async fn hide_contact(&self, contact_id: UserId) {
        self.syncer.hide_contact(contact_id).await;
    }

    /// 加载会话中更早的消息，返回是否还有更多
    pub async fn load_more(&self, contact_id: UserId) -> Result<bool> {
        self.syncer.load_more(contact_id).await
    }

    pub async fn conversations(&self) -> BTreeMap<UserId, ConversationView> {
        self.syncer.conversations().await
    }

    pub async fn contact_list(&self) -> Vec<ContactSummary> {
        self.syncer.contact_list().await
    }

    pub async fn unread_count(&self, contact_id: UserId) -> usize {
        self.syncer.unread_count(contact_id).await
    }

    pub async fn total_unread_count(&self) -> usize {
        self.syncer.total_unread_count().await
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe_status()
    }

    /// 结束会话：注销可见性监听、关闭连接、清空会话状态
    pub async fn logout(&self) {
        info!("[Client] 👋 登出 (user={})", self.config.user_id);
        {
            let mut session = self.session.lock().await;
            session.visibility_guard = None;
            if let Some(task) = session.history_task.take() {
                task.abort();
            }
        }
        self.connection.shutdown().await;
        self.syncer.reset().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::message::types::fixtures::{marker, msg};
    use crate::im::message::types::HistoryPage;
    use futures_util::{SinkExt, StreamExt};
    use std::sync::Mutex as StdMutex;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    const ME: UserId = 1;

    struct StaticHistory(Vec<DirectMessage>);

    #[async_trait]
    impl HistoryFetcher for StaticHistory {
        async fn fetch_inbox(&self, _page: u32, _page_size: u32) -> Result<HistoryPage> {
            Ok(HistoryPage {
                messages: self.0.clone(),
                has_more: false,
            })
        }

        async fn fetch_conversation(
            &self,
            _contact_id: UserId,
            _before_sync_id: Option<i64>,
            _page_size: u32,
        ) -> Result<HistoryPage> {
            Ok(HistoryPage::default())
        }
    }

    struct NoopReadApi;

    #[async_trait]
    impl ReadPositionApi for NoopReadApi {
        async fn update_read_position(&self, _contact_id: UserId) -> Result<Option<i64>> {
            Ok(None)
        }
    }

    #[derive(Default)]
    struct RecordingMsgListener {
        new_messages: StdMutex<Vec<i64>>,
        receipts: StdMutex<Vec<(i64, i64)>>,
    }

    #[async_trait]
    impl AdvancedMsgListener for RecordingMsgListener {
        async fn on_recv_new_message(&self, message: DirectMessage) {
            self.new_messages.lock().unwrap().push(message.sync_id);
        }
        async fn on_recv_c2c_read_receipt(&self, contact_id: i64, sync_id: i64) {
            self.receipts.lock().unwrap().push((contact_id, sync_id));
        }
        async fn on_connection_status_changed(&self, _state: ConnectionState) {}
    }

    fn sync_frame(message: &DirectMessage) -> WsMessage {
        WsMessage::Text(serde_json::json!({ "type": 4, "data": message }).to_string())
    }

    /// 接入后依次推送给定消息，随后保持连接
    async fn start_push_server(
        pushes: Vec<DirectMessage>,
    ) -> (String, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let pushes = pushes.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let Ok(mut ws) = accept_async(stream).await else {
                        return;
                    };
                    for message in &pushes {
                        if ws.send(sync_frame(message)).await.is_err() {
                            return;
                        }
                    }
                    while let Some(Ok(frame)) = ws.next().await {
                        if let WsMessage::Text(text) = frame {
                            let _ = tx.send(text);
                        }
                    }
                });
            }
        });
        (format!("ws://{}", addr), rx)
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..500 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("条件在超时前未满足");
    }

    #[tokio::test]
    async fn live_push_and_history_drive_unread_counts() {
        let (url, mut frames) = start_push_server(vec![
            msg(4, 42, ME),
            marker(2, ME, 42),
            marker(3, 42, ME),
        ])
        .await;
        let mut config = ClientConfig::new(ME, "token".to_string());
        config.ws_url = url;
        let msg_listener = Arc::new(RecordingMsgListener::default());
        let client = ChatClient::builder(config)
            .history_fetcher(Arc::new(StaticHistory(vec![
                msg(1, 42, ME),
                msg(2, 42, ME),
                msg(3, 42, ME),
            ])))
            .read_position_api(Arc::new(NoopReadApi))
            .advanced_msg_listener(msg_listener.clone())
            .build()
            .unwrap();

        client.connect().await.unwrap();
        assert!(client.is_connected());
        let c = &client;
        eventually(move || async move { c.unread_count(42).await == 2 }).await;
        let l = &msg_listener;
        eventually(move || async move { l.receipts.lock().unwrap().len() == 1 }).await;

        assert_eq!(*msg_listener.new_messages.lock().unwrap(), vec![4]);
        assert_eq!(*msg_listener.receipts.lock().unwrap(), vec![(42, 3)]);
        let list = client.contact_list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].peer_read_line, Some(3));

        client.set_active_contact(Some(42)).await;
        assert_eq!(client.unread_count(42).await, 0);

        client
            .send(SendMessageRequest::text(42, "收到"))
            .await
            .unwrap();
        let sent = tokio::time::timeout(Duration::from_secs(5), frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(sent.contains("\"type\":3"));

        client.logout().await;
        assert!(!client.is_connected());
        assert!(client.conversations().await.is_empty());
    }

    #[tokio::test]
    async fn connect_twice_keeps_one_session() {
        let (url, _frames) = start_push_server(vec![]).await;
        let mut config = ClientConfig::new(ME, "token".to_string());
        config.ws_url = url;
        let client = ChatClient::builder(config)
            .history_fetcher(Arc::new(StaticHistory(vec![msg(1, 42, ME)])))
            .read_position_api(Arc::new(NoopReadApi))
            .build()
            .unwrap();

        client.connect().await.unwrap();
        client.connect().await.unwrap();
        client.set_visible(false);
        client.set_visible(true);
        let c = &client;
        eventually(move || async move { c.conversations().await.len() == 1 }).await;
        assert!(client.is_connected());
        assert_eq!(client.connection_state().reconnect_attempts, 0);
        client.logout().await;
    }

    #[test]
    fn default_collaborators_are_http() {
        let client = ChatClient::new(ClientConfig::new(ME, "token".to_string()));
        assert!(client.is_ok());
        assert!(ChatClient::new(ClientConfig::new(ME, "bad\ntoken".to_string())).is_err());
    }
}
