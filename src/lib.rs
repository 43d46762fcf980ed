pub mod im;

// 重新导出常用类型和函数，方便外部使用
pub use im::{
    client::{ChatClient, ClientBuilder, ClientConfig},
    connection::{ConnectionManager, ConnectionState, ConnectionStatus},
    conversation::{ContactSummary, ConversationSyncer, ConversationView},
    error::{ConnectionError, SendError},
    message::{DirectMessage, SendMessageRequest, UserId},
};
