//! 私信数据结构

use serde::{Deserialize, Serialize};

/// 用户 ID
pub type UserId = i64;

/// 消息类型常量
pub mod message_type {
    /// 普通文本
    pub const TEXT: i32 = 0;
    /// 已读线标记：服务器代当前用户发出的合成消息，
    /// 表示"本会话中 syncId 不超过该值的消息都已读"。从不展示，也不计入未读。
    pub const READ_LINE_MARKER: i32 = 10000;
}

/// 私信
///
/// 可以直接从历史接口和推送帧的 JSON 反序列化，缺失的可选字段使用默认值。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectMessage {
    /// 会话内唯一的消息 ID
    pub message_id: i64,
    /// 单调递增的同步序号
    pub sync_id: i64,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub message_type: i32,
    #[serde(default)]
    pub reply_message_id: Option<i64>,
    #[serde(default)]
    pub status: i32,
    #[serde(default)]
    pub extra: Option<serde_json::Value>,
    /// 创建时间（毫秒时间戳）
    #[serde(default)]
    pub create_time: i64,
    /// 更新时间（毫秒时间戳）
    #[serde(default)]
    pub update_time: i64,
}

impl DirectMessage {
    pub fn is_read_line_marker(&self) -> bool {
        self.message_type == message_type::READ_LINE_MARKER
    }

    /// 相对当前用户的会话对方 ID
    pub fn counterpart(&self, current_user: UserId) -> UserId {
        if self.sender_id == current_user {
            self.receiver_id
        } else {
            self.sender_id
        }
    }

    /// 是否为 `contact_id` 发来的普通消息（计入未读的候选）
    pub fn is_incoming_from(&self, contact_id: UserId) -> bool {
        self.sender_id == contact_id && !self.is_read_line_marker()
    }
}

/// type 3 发送帧的载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub receiver_id: UserId,
    pub content: String,
    pub message_type: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_message_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

impl SendMessageRequest {
    /// 构造文本消息
    pub fn text(receiver_id: UserId, content: impl Into<String>) -> Self {
        Self {
            receiver_id,
            content: content.into(),
            message_type: message_type::TEXT,
            reply_message_id: None,
            extra: None,
        }
    }

    pub fn reply_to(mut self, message_id: i64) -> Self {
        self.reply_message_id = Some(message_id);
        self
    }
}

/// 一页历史消息
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    #[serde(default)]
    pub messages: Vec<DirectMessage>,
    #[serde(default)]
    pub has_more: bool,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// 测试用消息构造：message_id 与 sync_id 相同，create_time = sync_id * 1000
    pub fn msg(sync_id: i64, sender_id: UserId, receiver_id: UserId) -> DirectMessage {
        DirectMessage {
            message_id: sync_id,
            sync_id,
            sender_id,
            receiver_id,
            content: format!("msg-{}", sync_id),
            message_type: message_type::TEXT,
            reply_message_id: None,
            status: 0,
            extra: None,
            create_time: sync_id * 1000,
            update_time: sync_id * 1000,
        }
    }

    /// 当前用户发出的已读线标记
    pub fn marker(sync_id: i64, sender_id: UserId, receiver_id: UserId) -> DirectMessage {
        DirectMessage {
            content: String::new(),
            message_type: message_type::READ_LINE_MARKER,
            // 标记消息的 ID 与普通消息错开
            message_id: 1_000_000 + sync_id,
            ..msg(sync_id, sender_id, receiver_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn counterpart_is_the_other_party() {
        let incoming = msg(1, 42, 1);
        let outgoing = msg(2, 1, 42);
        assert_eq!(incoming.counterpart(1), 42);
        assert_eq!(outgoing.counterpart(1), 42);
    }

    #[test]
    fn marker_is_never_incoming() {
        let m = marker(3, 42, 1);
        assert!(m.is_read_line_marker());
        assert!(!m.is_incoming_from(42));
        assert!(msg(3, 42, 1).is_incoming_from(42));
    }

    #[test]
    fn deserializes_with_missing_optional_fields() {
        let json = r#"{"messageId":1,"syncId":2,"senderId":3,"receiverId":4}"#;
        let m: DirectMessage = serde_json::from_str(json).unwrap();
        assert_eq!(m.content, "");
        assert_eq!(m.message_type, message_type::TEXT);
        assert!(m.extra.is_none());
        assert_eq!(m.create_time, 0);
    }
}
