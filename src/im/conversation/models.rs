//! 会话同步模型定义

use crate::im::message::types::{DirectMessage, UserId};
use serde::Serialize;

/// 会话同步器配置
#[derive(Debug, Clone)]
pub struct ConversationSyncerConfig {
    /// 当前用户 ID
    pub user_id: UserId,
    /// 历史分页大小
    pub history_page_size: u32,
    /// 启动时最多拉取的历史页数
    pub history_max_pages: u32,
}

impl ConversationSyncerConfig {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            history_page_size: 50,
            history_max_pages: 20,
        }
    }
}

/// 界面读取的单个会话
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationView {
    /// 可展示的消息，syncId 降序
    pub messages: Vec<DirectMessage>,
    pub unread_count: usize,
}
