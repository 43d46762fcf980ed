pub mod client;
pub mod connection;
pub mod conversation;
pub mod error;
pub mod message;
pub mod serialization;
pub mod types;

// 重新导出客户端入口
pub use client::{ChatClient, ClientBuilder, ClientConfig};
