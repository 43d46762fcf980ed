//! 推送连接与发送的错误类型

use std::time::Duration;
use thiserror::Error;

/// 建立推送连接失败
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("无效的推送地址 {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("推送连接握手失败: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("推送连接握手超时（{0:?}）")]
    Timeout(Duration),

    #[error("连接建立后立即断开: {0}")]
    Dropped(String),
}

/// 单条消息发送失败，调用方可据此决定是否提示用户
#[derive(Debug, Error)]
pub enum SendError {
    #[error("消息序列化失败: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("等待连接超时（{0:?}），消息未发送")]
    Timeout(Duration),

    #[error("重连次数已耗尽，消息未发送")]
    ReconnectExhausted,

    #[error("连接已关闭，消息未发送")]
    Closed,

    #[error("写入推送连接失败: {0}")]
    Write(String),
}
