//! 推送连接模块
//!
//! 维护单条推送连接的生命周期：连接、心跳、退避重连、出站队列

pub mod listener;
pub mod manager;
pub mod state;

// 重新导出主要类型
pub use listener::ConnectionListener;
pub use manager::{ConnectionConfig, ConnectionManager, VisibilityGuard};
pub use state::{ConnectionState, ConnectionStatus, ReconnectPolicy};
