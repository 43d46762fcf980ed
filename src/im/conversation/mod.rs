//! 会话模块
//!
//! 在合并后的私信之上计算已读位置、未读数和联系人列表

pub mod listener;
pub mod models;
pub mod projector;
pub mod read_position;
pub mod service;

// 重新导出主要类型和函数
pub use listener::{ConversationListener, EmptyConversationListener};
pub use models::{ConversationSyncerConfig, ConversationView};
pub use projector::{ContactListProjector, ContactSummary};
pub use read_position::{ReadLineBook, ReadPositionTracker};
pub use service::ConversationSyncer;
