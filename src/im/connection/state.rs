//! 连接状态机与重连退避
//!
//! 推送连接只有三种状态：
//! - `Disconnected`：无连接句柄
//! - `Connecting`：握手中，`connect()` 在此状态下是空操作
//! - `Connected`：可写，心跳运行中
//!
//! 重连尝试计数随状态一起发布，上限由 [`ReconnectPolicy`] 决定。

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// 未连接
    Disconnected,
    /// 连接中
    Connecting,
    /// 已连接
    Connected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "未连接"),
            ConnectionStatus::Connecting => write!(f, "连接中"),
            ConnectionStatus::Connected => write!(f, "已连接"),
        }
    }
}

/// 连接状态快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// 当前这一轮重连已经发起的次数，连接成功后归零
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
    /// 连接建立时间（UTC毫秒时间戳）
    pub connected_at: Option<i64>,
}

impl ConnectionState {
    pub fn new(max_reconnect_attempts: u32) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            reconnect_attempts: 0,
            max_reconnect_attempts,
            connected_at: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    /// `Disconnected -> Connecting`；其他状态下返回 false
    pub fn begin_connect(&mut self) -> bool {
        if self.status != ConnectionStatus::Disconnected {
            return false;
        }
        self.status = ConnectionStatus::Connecting;
        true
    }

    pub fn mark_connected(&mut self) {
        self.status = ConnectionStatus::Connected;
        self.reconnect_attempts = 0;
        self.connected_at = Some(Utc::now().timestamp_millis());
    }

    pub fn mark_disconnected(&mut self) {
        self.status = ConnectionStatus::Disconnected;
        self.connected_at = None;
    }

    /// 记录一次重连尝试，不超过上限
    pub fn record_attempt(&mut self) {
        self.reconnect_attempts = (self.reconnect_attempts + 1).min(self.max_reconnect_attempts);
    }
}

/// 重连退避策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// 最大尝试次数
    pub max_attempts: u32,
    /// 基础延迟
    pub base_delay: Duration,
    /// 延迟上限
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 12,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// 剩余 `remaining` 次时下一次尝试前的等待时间：
    /// `min(base * 2^(max - remaining), max_delay)`
    pub fn delay_for(&self, remaining: u32) -> Duration {
        let exponent = self.max_attempts.saturating_sub(remaining).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}
