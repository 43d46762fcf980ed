//! 私信同步 CLI 客户端（测试版）
//!
//! 非交互式 CLI：通过命令行参数指定用户和 token，自动连接并加载历史，
//! 展示收到的私信、已读回执和联系人列表；可选发送一条测试消息。

use anyhow::{Context, Result};
use clap::Parser;
use dm_sync_core::im::client::{ChatClient, ClientConfig};
use dm_sync_core::im::connection::{ConnectionState, ConnectionStatus};
use dm_sync_core::im::conversation::{ContactSummary, ConversationListener};
use dm_sync_core::im::message::{AdvancedMsgListener, DirectMessage, SendMessageRequest};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

/// 私信同步 CLI 客户端
#[derive(Parser, Debug)]
#[command(name = "dm-sync-cli")]
#[command(about = "私信同步 CLI 客户端 - 用于测试推送连接和未读计数", long_about = None)]
struct Args {
    /// 推送服务地址
    #[arg(long, default_value = "ws://localhost:10001/ws")]
    ws_url: String,

    /// HTTP API 基础地址
    #[arg(long, default_value = "http://localhost:10002")]
    api_base_url: String,

    /// 当前用户 ID
    #[arg(short, long)]
    user_id: i64,

    /// 会话 token
    #[arg(short, long)]
    token: String,

    /// 连接后向该用户发送一条测试消息
    #[arg(long)]
    send_to: Option<i64>,

    /// 测试消息内容
    #[arg(long, default_value = "hello from dm-sync-cli")]
    text: String,

    /// 运行时长（秒），0 表示持续运行
    #[arg(short, long, default_value = "0")]
    duration: u64,

    /// 日志级别（默认: info,dm_sync_core=debug）
    #[arg(long, default_value = "info,dm_sync_core=debug")]
    log_level: String,
}

/// 初始化日志（同时输出到 stdout 和文件）
fn init_logger(log_level: &str) -> Result<()> {
    use std::fs::OpenOptions;
    use std::io;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    // 优先使用环境变量 RUST_LOG（如果设置了），否则使用命令行参数
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    // 创建日志文件（追加模式）
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open("debug.log")
        .context("无法创建日志文件 debug.log")?;

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(true);

    // 文件不需要颜色
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    info!("[CLI] 📝 日志已同时输出到控制台和文件: debug.log");
    Ok(())
}

fn log_contact_list(contact_list: &[ContactSummary]) {
    info!("[CLI] 📋 联系人列表（共 {} 个）:", contact_list.len());
    for summary in contact_list.iter().take(5) {
        info!(
            "[CLI]   - {} | 未读: {} | 最新: {}",
            summary.contact_id, summary.unread_count, summary.preview
        );
    }
}

struct CliConversationListener;

#[async_trait::async_trait]
impl ConversationListener for CliConversationListener {
    async fn on_sync_server_start(&self) {
        info!("[CLI/Conversation] 🔄 历史同步开始");
    }

    async fn on_sync_server_finish(&self) {
        info!("[CLI/Conversation] ✅ 历史同步完成");
    }

    async fn on_sync_server_progress(&self, progress: u32) {
        info!("[CLI/Conversation] 📊 已拉取 {} 页", progress);
    }

    async fn on_sync_server_failed(&self) {
        error!("[CLI/Conversation] ❌ 历史同步失败");
    }

    async fn on_conversation_changed(&self, contact_list: Vec<ContactSummary>) {
        log_contact_list(&contact_list);
    }

    async fn on_total_unread_message_count_changed(&self, total_unread_count: usize) {
        info!("[CLI/Conversation] 📬 总未读数: {}", total_unread_count);
    }
}

struct CliAdvancedMsgListener;

#[async_trait::async_trait]
impl AdvancedMsgListener for CliAdvancedMsgListener {
    async fn on_recv_new_message(&self, message: DirectMessage) {
        info!(
            "[CLI/Message] 📨 收到新消息: from={} syncId={} {}",
            message.sender_id, message.sync_id, message.content
        );
    }

    async fn on_recv_c2c_read_receipt(&self, contact_id: i64, sync_id: i64) {
        info!(
            "[CLI/Message] 📖 已读回执: contact={} 已读到 {}",
            contact_id, sync_id
        );
    }

    async fn on_connection_status_changed(&self, state: ConnectionState) {
        match state.status {
            ConnectionStatus::Connected => info!("[CLI/Message] 🔗 已连接"),
            ConnectionStatus::Connecting => info!(
                "[CLI/Message] 🔗 连接中（重连 {}/{}）",
                state.reconnect_attempts, state.max_reconnect_attempts
            ),
            ConnectionStatus::Disconnected => error!("[CLI/Message] 🔗 断开连接"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logger(&args.log_level)?;

    info!("[CLI] 🚀 私信同步 CLI 客户端（测试模式）");
    info!("[CLI] 👤 用户ID: {}", args.user_id);
    info!("[CLI] ⏱️  运行时长: {} 秒（0=持续运行）", args.duration);

    let mut config = ClientConfig::new(args.user_id, args.token.clone());
    config.ws_url = args.ws_url.clone();
    config.api_base_url = args.api_base_url.clone();

    let client = ChatClient::builder(config)
        .conversation_listener(Arc::new(CliConversationListener))
        .advanced_msg_listener(Arc::new(CliAdvancedMsgListener))
        .build()?;

    info!("[CLI] 🔗 正在连接服务器...");
    client
        .connect()
        .await
        .map_err(|e| anyhow::anyhow!("连接失败: {:#}", e))?;
    info!("[CLI] ✅ 连接成功！");

    if let Some(receiver_id) = args.send_to {
        match client
            .send(SendMessageRequest::text(receiver_id, args.text.clone()))
            .await
        {
            Ok(()) => info!("[CLI] 📤 测试消息已发送给 {}", receiver_id),
            Err(e) => warn!("[CLI] ⚠️ 测试消息发送失败: {}", e),
        }
    }

    info!("[CLI] 📥 开始监听消息...");
    if args.duration > 0 {
        info!("[CLI] ⏰ {} 秒后自动退出", args.duration);
        sleep(Duration::from_secs(args.duration)).await;
    } else {
        info!("[CLI] ⏰ 持续运行中，按 Ctrl+C 退出");
        tokio::signal::ctrl_c()
            .await
            .context("监听 Ctrl+C 失败")?;
    }

    log_contact_list(&client.contact_list().await);
    info!("[CLI] 📬 总未读数: {}", client.total_unread_count().await);
    client.logout().await;
    info!("[CLI] 👋 程序退出");
    Ok(())
}
