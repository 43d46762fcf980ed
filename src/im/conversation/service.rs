//! 会话同步服务层
//!
//! 持有历史快照和实时推送快照，任一来源变化时整体重新合并，
//! 再据此计算未读数和联系人列表。监听器总是在释放锁之后回调。

use crate::im::conversation::listener::{ConversationListener, EmptyConversationListener};
use crate::im::conversation::models::{ConversationSyncerConfig, ConversationView};
use crate::im::conversation::projector::{ContactListProjector, ContactSummary};
use crate::im::conversation::read_position::ReadPositionTracker;
use crate::im::message::api::{HistoryFetcher, ReadPositionApi};
use crate::im::message::reconciler::{reconcile, ConversationLog, LiveBuffer};
use crate::im::message::types::{DirectMessage, UserId};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct SyncState {
    history: Vec<DirectMessage>,
    history_loaded: bool,
    live: LiveBuffer,
    logs: BTreeMap<UserId, ConversationLog>,
    unread: BTreeMap<UserId, usize>,
    tracker: ReadPositionTracker,
    projector: ContactListProjector,
    active_contact: Option<UserId>,
    last_total_unread: usize,
    /// reset 时递增，丢弃上一会话发起的请求结果
    epoch: u64,
}

/// 一次变更后需要通知出去的结果
struct Snapshot {
    contact_list: Vec<ContactSummary>,
    total_unread: Option<usize>,
}

impl SyncState {
    fn new(current_user: UserId) -> Self {
        Self {
            history: Vec::new(),
            history_loaded: false,
            live: LiveBuffer::new(),
            logs: BTreeMap::new(),
            unread: BTreeMap::new(),
            tracker: ReadPositionTracker::new(current_user),
            projector: ContactListProjector::new(),
            active_contact: None,
            last_total_unread: 0,
            epoch: 0,
        }
    }

    /// 清空会话数据并进入新的 epoch
    fn clear(&mut self) {
        self.history.clear();
        self.history_loaded = false;
        self.live.clear();
        self.logs.clear();
        self.unread.clear();
        self.tracker.reset();
        self.projector.reset();
        self.active_contact = None;
        self.last_total_unread = 0;
        self.epoch += 1;
    }

    /// 从两个快照重新合并
    fn recompute(&mut self, current_user: UserId) {
        self.logs = reconcile(current_user, &self.history, self.live.as_slice());
        self.tracker.absorb_markers(self.logs.values());
        self.projector.refresh_hidden(&self.logs);
        self.refresh_unread();
    }

    fn refresh_unread(&mut self) {
        self.unread = self
            .tracker
            .unread_counts(self.logs.values(), self.history_loaded);
    }

    fn mark_read_optimistically(&mut self, contact_id: UserId) -> bool {
        match self.logs.get(&contact_id) {
            Some(log) => self
                .tracker
                .mark_contact_as_read_optimistically(contact_id, log),
            None => false,
        }
    }

    fn contact_list(&self) -> Vec<ContactSummary> {
        self.projector
            .project(&self.logs, &self.unread, &self.tracker)
    }

    fn snapshot(&mut self) -> Snapshot {
        let contact_list = self.contact_list();
        let total: usize = contact_list.iter().map(|s| s.unread_count).sum();
        let total_unread = if total != self.last_total_unread {
            self.last_total_unread = total;
            Some(total)
        } else {
            None
        };
        Snapshot {
            contact_list,
            total_unread,
        }
    }
}

/// 私信会话同步器
///
/// 可廉价克隆，克隆之间共享状态。
#[derive(Clone)]
pub struct ConversationSyncer {
    config: ConversationSyncerConfig,
    history_api: Arc<dyn HistoryFetcher>,
    read_api: Arc<dyn ReadPositionApi>,
    state: Arc<RwLock<SyncState>>,
    listener: Arc<dyn ConversationListener>,
}

impl ConversationSyncer {
    /// 创建新的会话同步器（使用默认空监听器）
    pub fn new(
        config: ConversationSyncerConfig,
        history_api: Arc<dyn HistoryFetcher>,
        read_api: Arc<dyn ReadPositionApi>,
    ) -> Self {
        Self::with_listener(
            config,
            history_api,
            read_api,
            Arc::new(EmptyConversationListener),
        )
    }

    /// 创建新的会话同步器（带自定义监听器）
    pub fn with_listener(
        config: ConversationSyncerConfig,
        history_api: Arc<dyn HistoryFetcher>,
        read_api: Arc<dyn ReadPositionApi>,
        listener: Arc<dyn ConversationListener>,
    ) -> Self {
        info!("[Sync] 创建会话同步器，用户ID: {}", config.user_id);
        let state = SyncState::new(config.user_id);
        Self {
            config,
            history_api,
            read_api,
            state: Arc::new(RwLock::new(state)),
            listener,
        }
    }

    pub fn user_id(&self) -> UserId {
        self.config.user_id
    }

    async fn notify(&self, snapshot: Snapshot) {
        self.listener
            .on_conversation_changed(snapshot.contact_list)
            .await;
        if let Some(total) = snapshot.total_unread {
            debug!("[Sync] 📢 总未读数变更: {}", total);
            self.listener
                .on_total_unread_message_count_changed(total)
                .await;
        }
    }

    /// 分页拉取收件箱历史，填充历史快照
    ///
    /// 遇到 `hasMore == false`、不满一页或达到页数上限时停止。返回本次拉取的消息数；
    /// 拉取期间发生 reset 时结果被丢弃，返回 0。
    pub async fn load_history(&self) -> Result<usize> {
        info!("[Sync] 🔄 开始加载历史消息...");
        let epoch = self.state.read().await.epoch;
        self.listener.on_sync_server_start().await;

        let messages = match self.fetch_inbox_pages().await {
            Ok(messages) => messages,
            Err(e) => {
                error!("[Sync] ❌ 加载历史消息失败: {:?}", e);
                self.listener.on_sync_server_failed().await;
                return Err(e);
            }
        };
        let count = messages.len();

        let snapshot = {
            let mut state = self.state.write().await;
            if state.epoch != epoch {
                warn!("[Sync] 会话已重置，丢弃 {} 条历史消息", count);
                return Ok(0);
            }
            // 新拉取的在前，合并时同 ID 以新版本为准
            let previous = std::mem::replace(&mut state.history, messages);
            state.history.extend(previous);
            state.history_loaded = true;
            state.recompute(self.config.user_id);
            info!(
                "[Sync] ✅ 历史消息加载完成: {} 条, {} 个会话",
                count,
                state.logs.len()
            );
            state.snapshot()
        };

        self.listener.on_sync_server_finish().await;
        self.notify(snapshot).await;
        Ok(count)
    }

    async fn fetch_inbox_pages(&self) -> Result<Vec<DirectMessage>> {
        let page_size = self.config.history_page_size;
        let mut all = Vec::new();
        for page in 1..=self.config.history_max_pages {
            let resp = self
                .history_api
                .fetch_inbox(page, page_size)
                .await
                .with_context(|| format!("拉取第 {} 页历史失败", page))?;
            let fetched = resp.messages.len();
            all.extend(resp.messages);
            self.listener.on_sync_server_progress(page).await;
            debug!("[Sync] 第 {} 页: {} 条, hasMore={}", page, fetched, resp.has_more);
            if !resp.has_more || fetched < page_size as usize {
                break;
            }
            if page == self.config.history_max_pages {
                warn!(
                    "[Sync] ⚠️ 已达到历史页数上限 {}，停止拉取",
                    self.config.history_max_pages
                );
            }
        }
        Ok(all)
    }

    /// 向前加载一个会话中更早的一页消息，返回服务器是否还有更多
    ///
    /// 拉取期间发生 reset 时结果被丢弃，返回 `false`。
    pub async fn load_more(&self, contact_id: UserId) -> Result<bool> {
        let (epoch, before) = {
            let state = self.state.read().await;
            let before = state
                .logs
                .get(&contact_id)
                .and_then(|log| log.oldest_sync_id());
            (state.epoch, before)
        };
        info!(
            "[Sync] 📜 加载更早的消息: contact={}, before={:?}",
            contact_id, before
        );
        let page = self
            .history_api
            .fetch_conversation(contact_id, before, self.config.history_page_size)
            .await
            .with_context(|| format!("加载会话 {} 的更早消息失败", contact_id))?;
        let has_more = page.has_more;

        let snapshot = {
            let mut state = self.state.write().await;
            if state.epoch != epoch {
                warn!("[Sync] 会话已重置，丢弃更早的消息: contact={}", contact_id);
                return Ok(false);
            }
            state.history.extend(page.messages);
            state.recompute(self.config.user_id);
            state.snapshot()
        };
        self.notify(snapshot).await;
        Ok(has_more)
    }

    /// 处理一条实时推送消息，返回是否为新消息
    ///
    /// 属于当前打开会话的消息立即视为已读（仅本地）。
    pub async fn on_live_message(&self, message: DirectMessage) -> bool {
        let contact_id = message.counterpart(self.config.user_id);
        let (is_new, snapshot) = {
            let mut state = self.state.write().await;
            let is_new = state.live.push(self.config.user_id, message);
            state.recompute(self.config.user_id);
            if state.active_contact == Some(contact_id) && state.mark_read_optimistically(contact_id)
            {
                state.refresh_unread();
            }
            (is_new, state.snapshot())
        };
        if !is_new {
            debug!("[Sync] 重复推送，已覆盖旧版本: contact={}", contact_id);
        }
        self.notify(snapshot).await;
        is_new
    }

    /// 推进与 `contact_id` 会话的已读位置
    ///
    /// 本地乐观值同步生效，服务器调用在后台进行，返回其任务句柄。
    /// 目标是自己或 ID 非法时不做任何事。
    pub async fn update_readline_position(&self, contact_id: UserId) -> Option<JoinHandle<()>> {
        if contact_id <= 0 || contact_id == self.config.user_id {
            debug!("[ReadLine] 忽略无效的已读目标: {}", contact_id);
            return None;
        }

        let (epoch, snapshot) = {
            let mut state = self.state.write().await;
            if state.mark_read_optimistically(contact_id) {
                state.refresh_unread();
            }
            (state.epoch, state.snapshot())
        };
        self.notify(snapshot).await;

        let this = self.clone();
        Some(tokio::spawn(async move {
            this.confirm_read_position(contact_id, epoch).await;
        }))
    }

    async fn confirm_read_position(&self, contact_id: UserId, epoch: u64) {
        let sync_id = match self.read_api.update_read_position(contact_id).await {
            Ok(Some(sync_id)) => sync_id,
            Ok(None) => {
                debug!("[ReadLine] 服务器已读位置已更新: contact={}", contact_id);
                return;
            }
            Err(e) => {
                warn!(
                    "[ReadLine] ⚠️ 更新服务器已读位置失败: contact={}, {:?}",
                    contact_id, e
                );
                return;
            }
        };

        let snapshot = {
            let mut state = self.state.write().await;
            if state.epoch != epoch {
                debug!("[ReadLine] 会话已重置，丢弃已读应答: contact={}", contact_id);
                return;
            }
            if !state.tracker.record_server_read_line(contact_id, sync_id) {
                return;
            }
            info!(
                "[ReadLine] ✅ 服务器已读线: contact={}, syncId={}",
                contact_id, sync_id
            );
            state.refresh_unread();
            state.snapshot()
        };
        self.notify(snapshot).await;
    }

    /// 切换当前打开的会话：离开的和进入的会话都推进已读位置
    pub async fn set_active_contact(&self, contact_id: Option<UserId>) {
        let previous = {
            let mut state = self.state.write().await;
            std::mem::replace(&mut state.active_contact, contact_id)
        };
        if previous == contact_id {
            return;
        }
        debug!("[Sync] 当前会话: {:?} -> {:?}", previous, contact_id);
        for contact in [previous, contact_id].into_iter().flatten() {
            self.update_readline_position(contact).await;
        }
    }

    pub async fn active_contact(&self) -> Option<UserId> {
        self.state.read().await.active_contact
    }

    /// 从联系人列表隐藏，出现新消息时自动恢复
    pub async fn hide_contact(&self, contact_id: UserId) {
        let snapshot = {
            let mut state = self.state.write().await;
            let visible = state
                .logs
                .get(&contact_id)
                .map(|log| log.visible_count())
                .unwrap_or(0);
            state.projector.hide(contact_id, visible);
            info!("[Sync] 🙈 隐藏会话: contact={}, 当前消息数={}", contact_id, visible);
            state.snapshot()
        };
        self.notify(snapshot).await;
    }

    /// `contactId -> {messages, unreadCount}`，不含只有已读线标记的会话
    pub async fn conversations(&self) -> BTreeMap<UserId, ConversationView> {
        let state = self.state.read().await;
        state
            .logs
            .values()
            .filter(|log| log.visible_count() > 0)
            .map(|log| {
                (
                    log.contact_id,
                    ConversationView {
                        messages: log.messages().cloned().collect(),
                        unread_count: state.unread.get(&log.contact_id).copied().unwrap_or(0),
                    },
                )
            })
            .collect()
    }

    /// 有序联系人列表
    pub async fn contact_list(&self) -> Vec<ContactSummary> {
        self.state.read().await.contact_list()
    }

    pub async fn unread_count(&self, contact_id: UserId) -> usize {
        self.state
            .read()
            .await
            .unread
            .get(&contact_id)
            .copied()
            .unwrap_or(0)
    }

    /// 联系人列表中所有会话的未读数之和
    pub async fn total_unread_count(&self) -> usize {
        self.contact_list()
            .await
            .iter()
            .map(|s| s.unread_count)
            .sum()
    }

    pub async fn effective_read_line(&self, contact_id: UserId) -> i64 {
        self.state
            .read()
            .await
            .tracker
            .effective_read_line(contact_id)
    }

    pub async fn peer_read_line(&self, contact_id: UserId) -> Option<i64> {
        self.state.read().await.tracker.peer_read_line(contact_id)
    }

    pub async fn is_history_loaded(&self) -> bool {
        self.state.read().await.history_loaded
    }

    /// 清空所有会话状态（登出）
    pub async fn reset(&self) {
        self.state.write().await.clear();
        info!("[Sync] 🧹 会话状态已清空");
    }
}
