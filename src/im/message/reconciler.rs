//! 历史消息与实时推送的合并
//!
//! 两个来源各自独立到达、各自乱序。合并是 `(历史快照, 实时快照)` 的纯函数，
//! 任一来源变化时整体重算，而不是增量修补：
//! - 按会话对方分组
//! - 以 messageId 去重，实时推送的版本优先
//! - 按 syncId 降序（最新在前）

use crate::im::message::types::{DirectMessage, UserId};
use std::collections::{BTreeMap, HashMap};

/// 单个会话合并后的消息列表（syncId 降序，包含已读线标记）
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationLog {
    pub contact_id: UserId,
    pub entries: Vec<DirectMessage>,
}

impl ConversationLog {
    /// 可展示的消息（排除已读线标记），保持降序
    pub fn messages(&self) -> impl Iterator<Item = &DirectMessage> {
        self.entries.iter().filter(|m| !m.is_read_line_marker())
    }

    pub fn markers(&self) -> impl Iterator<Item = &DirectMessage> {
        self.entries.iter().filter(|m| m.is_read_line_marker())
    }

    pub fn visible_count(&self) -> usize {
        self.messages().count()
    }

    /// 最新一条非标记消息
    pub fn latest_message(&self) -> Option<&DirectMessage> {
        self.messages().next()
    }

    /// 对方发来的最新一条非标记消息的 syncId
    pub fn latest_incoming_sync_id(&self) -> Option<i64> {
        self.messages()
            .filter(|m| m.sender_id == self.contact_id)
            .map(|m| m.sync_id)
            .max()
    }

    /// 已知最早的 syncId（用于向前翻页）
    pub fn oldest_sync_id(&self) -> Option<i64> {
        self.entries.iter().map(|m| m.sync_id).min()
    }
}

/// 合并两个来源，返回 `contactId -> ConversationLog`
pub fn reconcile(
    current_user: UserId,
    history: &[DirectMessage],
    live: &[DirectMessage],
) -> BTreeMap<UserId, ConversationLog> {
    let mut by_contact: BTreeMap<UserId, HashMap<i64, DirectMessage>> = BTreeMap::new();

    // 先放实时推送；同一来源内后到的同 ID 消息覆盖先到的
    for msg in live {
        by_contact
            .entry(msg.counterpart(current_user))
            .or_default()
            .insert(msg.message_id, msg.clone());
    }

    // 再补历史中尚不存在的 ID
    for msg in history {
        by_contact
            .entry(msg.counterpart(current_user))
            .or_default()
            .entry(msg.message_id)
            .or_insert_with(|| msg.clone());
    }

    by_contact
        .into_iter()
        .map(|(contact_id, map)| {
            let mut entries: Vec<DirectMessage> = map.into_values().collect();
            sort_newest_first(&mut entries);
            (contact_id, ConversationLog { contact_id, entries })
        })
        .collect()
}

/// syncId 降序；syncId 相同时按 messageId 降序，保证结果确定
pub fn sort_newest_first(entries: &mut [DirectMessage]) {
    entries.sort_by(|a, b| {
        b.sync_id
            .cmp(&a.sync_id)
            .then_with(|| b.message_id.cmp(&a.message_id))
    });
}

/// 实时推送快照
///
/// 同一会话内同一 messageId 的重复投递只保留最后一次。
#[derive(Debug, Default, Clone)]
pub struct LiveBuffer {
    entries: Vec<DirectMessage>,
    index: HashMap<(UserId, i64), usize>,
}

impl LiveBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一条推送消息，返回是否为新 ID
    pub fn push(&mut self, current_user: UserId, msg: DirectMessage) -> bool {
        let key = (msg.counterpart(current_user), msg.message_id);
        match self.index.get(&key) {
            Some(&pos) => {
                self.entries[pos] = msg;
                false
            }
            None => {
                self.index.insert(key, self.entries.len());
                self.entries.push(msg);
                true
            }
        }
    }

    pub fn as_slice(&self) -> &[DirectMessage] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }
}
