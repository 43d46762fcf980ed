//! 高级消息监听器
//!
//! 此模块定义了面向 UI 层的消息回调接口。

use crate::im::connection::state::ConnectionState;
use crate::im::message::types::DirectMessage;
use async_trait::async_trait;

/// 高级消息监听器
#[async_trait]
pub trait AdvancedMsgListener: Send + Sync {
    /// 收到新消息（在线推送，已读线标记不会回调）
    async fn on_recv_new_message(&self, message: DirectMessage);

    /// 收到对方的已读线（对方已读到 `sync_id`）
    async fn on_recv_c2c_read_receipt(&self, contact_id: i64, sync_id: i64);

    /// 连接状态变化
    async fn on_connection_status_changed(&self, state: ConnectionState);
}

/// 空的消息监听器实现（默认实现）
pub struct EmptyAdvancedMsgListener;

#[async_trait]
impl AdvancedMsgListener for EmptyAdvancedMsgListener {
    async fn on_recv_new_message(&self, _message: DirectMessage) {}
    async fn on_recv_c2c_read_receipt(&self, _contact_id: i64, _sync_id: i64) {}
    async fn on_connection_status_changed(&self, _state: ConnectionState) {}
}
