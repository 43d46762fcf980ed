//! 推送连接回调接口

use crate::im::connection::state::ConnectionState;
use crate::im::message::types::DirectMessage;
use async_trait::async_trait;

/// 推送连接监听器
///
/// 回调在读任务内按到达顺序依次 await，实现方不应长时间阻塞。
#[async_trait]
pub trait ConnectionListener: Send + Sync {
    /// 连接状态变化
    async fn on_connection_status_changed(&self, state: ConnectionState);

    /// 收到 type 4 私信同步帧
    async fn on_push_message(&self, message: DirectMessage);
}
