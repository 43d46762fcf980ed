//! 已读位置与未读数
//!
//! 服务器的已读线通过两种途径到达：
//! - 消息流中的已读线标记（messageType 10000），`senderId` 是读者
//! - 已读位置接口的直接应答
//!
//! 两者都写入 [`ReadLineBook`]，按 `(读者, 会话对方)` 记录且只增不减。
//! 本地乐观值在服务器确认前先行生效，有效已读线取两者较大值。

use crate::im::message::reconciler::ConversationLog;
use crate::im::message::types::UserId;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// 已读线账本：`(readerId, contactId) -> syncId`
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReadLineBook {
    lines: HashMap<(UserId, UserId), i64>,
}

impl ReadLineBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录 `reader` 在与 `contact` 的会话中已读到 `sync_id`，返回是否推进
    pub fn record(&mut self, reader: UserId, contact: UserId, sync_id: i64) -> bool {
        let line = self.lines.entry((reader, contact)).or_insert(i64::MIN);
        if sync_id > *line {
            *line = sync_id;
            true
        } else {
            false
        }
    }

    pub fn get(&self, reader: UserId, contact: UserId) -> Option<i64> {
        self.lines.get(&(reader, contact)).copied()
    }

    /// 从合并后的会话中解析已读线标记
    pub fn absorb_markers<'a>(&mut self, logs: impl IntoIterator<Item = &'a ConversationLog>) {
        for log in logs {
            for marker in log.markers() {
                self.record(marker.sender_id, marker.receiver_id, marker.sync_id);
            }
        }
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

/// 未读数计算
#[derive(Debug, Clone)]
pub struct ReadPositionTracker {
    current_user: UserId,
    book: ReadLineBook,
    /// 会话对方 -> 本地乐观已读线
    optimistic: HashMap<UserId, i64>,
    /// 最近一次可信的未读数
    last_good: Option<BTreeMap<UserId, usize>>,
}

impl ReadPositionTracker {
    pub fn new(current_user: UserId) -> Self {
        Self {
            current_user,
            book: ReadLineBook::new(),
            optimistic: HashMap::new(),
            last_good: None,
        }
    }

    pub fn absorb_markers<'a>(&mut self, logs: impl IntoIterator<Item = &'a ConversationLog>) {
        self.book.absorb_markers(logs);
    }

    /// 记录服务器确认的当前用户已读线
    pub fn record_server_read_line(&mut self, contact_id: UserId, sync_id: i64) -> bool {
        self.book.record(self.current_user, contact_id, sync_id)
    }

    /// 服务器记录的当前用户已读线
    pub fn server_read_line(&self, contact_id: UserId) -> Option<i64> {
        self.book.get(self.current_user, contact_id)
    }

    /// 对方对我方消息的已读线
    pub fn peer_read_line(&self, contact_id: UserId) -> Option<i64> {
        self.book.get(contact_id, self.current_user)
    }

    pub fn optimistic_read_line(&self, contact_id: UserId) -> Option<i64> {
        self.optimistic.get(&contact_id).copied()
    }

    /// `max(服务器已读线, 乐观已读线)`，两者都没有时为 0
    pub fn effective_read_line(&self, contact_id: UserId) -> i64 {
        self.server_read_line(contact_id)
            .into_iter()
            .chain(self.optimistic_read_line(contact_id))
            .max()
            .unwrap_or(0)
    }

    /// 对方发来、非标记、且 syncId 超过有效已读线的消息数
    pub fn unread_count(&self, contact_id: UserId, log: &ConversationLog) -> usize {
        let line = self.effective_read_line(contact_id);
        log.messages()
            .filter(|m| m.is_incoming_from(contact_id) && m.sync_id > line)
            .count()
    }

    /// 把乐观已读线提升到对方最新一条消息，只增不减；返回是否推进
    pub fn mark_contact_as_read_optimistically(
        &mut self,
        contact_id: UserId,
        log: &ConversationLog,
    ) -> bool {
        let Some(latest) = log.latest_incoming_sync_id() else {
            return false;
        };
        let current = self.optimistic.entry(contact_id).or_insert(i64::MIN);
        if latest > *current {
            debug!(
                "[ReadLine] 乐观已读线推进: contact={}, {} -> {}",
                contact_id,
                if *current == i64::MIN { 0 } else { *current },
                latest
            );
            *current = latest;
            true
        } else {
            false
        }
    }

    /// 所有会话的未读数
    ///
    /// 历史尚未加载完成时返回上一次可信的结果（冷启动时为空），
    /// 避免服务器标记到达前闪现错误的计数。
    pub fn unread_counts<'a>(
        &mut self,
        logs: impl IntoIterator<Item = &'a ConversationLog>,
        history_loaded: bool,
    ) -> BTreeMap<UserId, usize> {
        if !history_loaded {
            return self.last_good.clone().unwrap_or_default();
        }
        let counts: BTreeMap<UserId, usize> = logs
            .into_iter()
            .map(|log| (log.contact_id, self.unread_count(log.contact_id, log)))
            .collect();
        self.last_good = Some(counts.clone());
        counts
    }

    /// 登出时清空
    pub fn reset(&mut self) {
        self.book.clear();
        self.optimistic.clear();
        self.last_good = None;
    }
}
