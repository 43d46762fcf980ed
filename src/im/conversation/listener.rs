//! 会话监听器回调接口

use crate::im::conversation::projector::ContactSummary;
use async_trait::async_trait;

/// 会话监听器回调接口
#[async_trait]
pub trait ConversationListener: Send + Sync {
    /// 开始加载历史
    async fn on_sync_server_start(&self);

    /// 历史加载完成
    async fn on_sync_server_finish(&self);

    /// 历史加载进度（已拉取的页数）
    async fn on_sync_server_progress(&self, progress: u32);

    /// 历史加载失败
    async fn on_sync_server_failed(&self);

    /// 联系人列表变更（完整的有序列表）
    async fn on_conversation_changed(&self, contact_list: Vec<ContactSummary>);

    /// 总未读消息数变更
    async fn on_total_unread_message_count_changed(&self, total_unread_count: usize);
}

/// 空实现（默认监听器）
pub struct EmptyConversationListener;

#[async_trait]
impl ConversationListener for EmptyConversationListener {
    async fn on_sync_server_start(&self) {}
    async fn on_sync_server_finish(&self) {}
    async fn on_sync_server_progress(&self, _progress: u32) {}
    async fn on_sync_server_failed(&self) {}
    async fn on_conversation_changed(&self, _contact_list: Vec<ContactSummary>) {}
    async fn on_total_unread_message_count_changed(&self, _total_unread_count: usize) {}
}
