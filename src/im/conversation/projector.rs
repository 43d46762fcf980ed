//! 联系人列表投影
//!
//! 把合并后的会话转成界面遍历的有序列表：
//! 没有可展示消息的会话不出现，按最新消息的 createTime 降序排列，
//! 用户隐藏的会话在出现新的可展示消息后自动恢复。

use crate::im::conversation::read_position::ReadPositionTracker;
use crate::im::message::reconciler::ConversationLog;
use crate::im::message::types::{message_type, DirectMessage, UserId};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::info;

/// 预览最大字符数
const PREVIEW_MAX_CHARS: usize = 30;

/// 联系人列表中的一项
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactSummary {
    pub contact_id: UserId,
    pub latest_message: DirectMessage,
    pub preview: String,
    pub unread_count: usize,
    /// 对方已读到我方消息的 syncId
    pub peer_read_line: Option<i64>,
}

/// 根据消息内容生成预览
pub fn build_preview(msg: &DirectMessage) -> String {
    if msg.message_type != message_type::TEXT {
        return "[新消息]".to_string();
    }
    let text = msg.content.trim();
    if text.is_empty() {
        return "[文本]".to_string();
    }
    text.chars().take(PREVIEW_MAX_CHARS).collect()
}

#[derive(Debug, Default, Clone)]
pub struct ContactListProjector {
    /// 会话对方 -> 隐藏时的可展示消息数
    hidden: HashMap<UserId, usize>,
}

impl ContactListProjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// 隐藏会话，记录当前可展示消息数作为快照
    pub fn hide(&mut self, contact_id: UserId, visible_count: usize) {
        self.hidden.insert(contact_id, visible_count);
    }

    pub fn is_hidden(&self, contact_id: UserId) -> bool {
        self.hidden.contains_key(&contact_id)
    }

    /// 可展示消息数比隐藏时多的会话自动恢复，返回被恢复的会话
    pub fn refresh_hidden(&mut self, logs: &BTreeMap<UserId, ConversationLog>) -> Vec<UserId> {
        let mut restored = Vec::new();
        self.hidden.retain(|contact_id, snapshot| {
            let grew = logs
                .get(contact_id)
                .is_some_and(|log| log.visible_count() > *snapshot);
            if grew {
                restored.push(*contact_id);
            }
            !grew
        });
        for contact_id in &restored {
            info!("[Sync] 会话 {} 有新消息，自动取消隐藏", contact_id);
        }
        restored
    }

    pub fn project(
        &self,
        logs: &BTreeMap<UserId, ConversationLog>,
        unread: &BTreeMap<UserId, usize>,
        tracker: &ReadPositionTracker,
    ) -> Vec<ContactSummary> {
        let mut list: Vec<ContactSummary> = logs
            .values()
            .filter(|log| !self.is_hidden(log.contact_id))
            .filter_map(|log| {
                let latest = log.latest_message()?;
                Some(ContactSummary {
                    contact_id: log.contact_id,
                    latest_message: latest.clone(),
                    preview: build_preview(latest),
                    unread_count: unread.get(&log.contact_id).copied().unwrap_or(0),
                    peer_read_line: tracker.peer_read_line(log.contact_id),
                })
            })
            .collect();
        list.sort_by(|a, b| {
            b.latest_message
                .create_time
                .cmp(&a.latest_message.create_time)
                .then_with(|| a.contact_id.cmp(&b.contact_id))
        });
        list
    }

    pub fn reset(&mut self) {
        self.hidden.clear();
    }
}
