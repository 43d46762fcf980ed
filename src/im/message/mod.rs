//! 消息模块
//!
//! 私信数据结构、历史/已读位置协作方接口以及两个消息来源的合并

pub mod api;
pub mod listener;
pub mod reconciler;
pub mod types;

// 重新导出主要类型和函数
pub use api::{HistoryFetcher, HttpMessageApi, ReadPositionApi};
pub use listener::{AdvancedMsgListener, EmptyAdvancedMsgListener};
pub use reconciler::{reconcile, ConversationLog, LiveBuffer};
pub use types::{message_type, DirectMessage, HistoryPage, SendMessageRequest, UserId};
