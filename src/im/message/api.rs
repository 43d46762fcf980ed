//! 私信 HTTP API 客户端
//!
//! 历史消息和已读位置这两个外部协作方都是请求/响应式调用。
//! 同步层只依赖下面两个 trait，默认实现走 HTTP。

use crate::im::message::types::{HistoryPage, UserId};
use crate::im::types::handle_http_response;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

/// 历史消息来源（分页）
#[async_trait]
pub trait HistoryFetcher: Send + Sync {
    /// 当前用户收件箱的一页历史，用于会话启动时填充
    async fn fetch_inbox(&self, page: u32, page_size: u32) -> Result<HistoryPage>;

    /// 单个会话中 syncId 小于 `before_sync_id` 的一页更早消息
    async fn fetch_conversation(
        &self,
        contact_id: UserId,
        before_sync_id: Option<i64>,
        page_size: u32,
    ) -> Result<HistoryPage>;
}

/// 已读位置的权威来源
#[async_trait]
pub trait ReadPositionApi: Send + Sync {
    /// 推进服务器端与 `contact_id` 会话的已读线
    ///
    /// 服务器若返回新的已读 syncId 则透传，否则为 `None`。
    async fn update_read_position(&self, contact_id: UserId) -> Result<Option<i64>>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadLineResp {
    #[serde(default)]
    sync_id: Option<i64>,
}

/// 私信相关的 HTTP API 客户端
pub struct HttpMessageApi {
    client: reqwest::Client,
    api_base_url: String,
}

impl HttpMessageApi {
    /// `client` 应该已经在外部配置好认证头
    pub fn new(client: reqwest::Client, api_base_url: String) -> Self {
        Self {
            client,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
        }
    }

    /// 创建带 token 认证头的 HTTP 客户端
    pub fn with_token(api_base_url: String, token: &str) -> Result<Self> {
        let http_client = reqwest::ClientBuilder::new()
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert(
                    reqwest::header::HeaderName::from_static("token"),
                    reqwest::header::HeaderValue::from_str(token).context("无效的 token")?,
                );
                headers
            })
            .build()
            .context("创建 HTTP 客户端失败")?;
        Ok(Self::new(http_client, api_base_url))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base_url, path)
    }
}

#[async_trait]
impl HistoryFetcher for HttpMessageApi {
    async fn fetch_inbox(&self, page: u32, page_size: u32) -> Result<HistoryPage> {
        let operation_id = Uuid::new_v4().to_string();
        let url = self.url("/direct-message/inbox");
        debug!(
            "[MsgAPI/Inbox] 📡 请求收件箱 page={}, pageSize={}, operationID={}",
            page, page_size, operation_id
        );

        let response = self
            .client
            .get(&url)
            .header("operationID", &operation_id)
            .query(&[("page", page), ("pageSize", page_size)])
            .send()
            .await
            .context("请求收件箱失败")?;

        let resp = handle_http_response::<HistoryPage>(response, "收件箱").await?;
        let page_data = resp.data.unwrap_or_default();
        info!(
            "[MsgAPI/Inbox] 📥 收到 {} 条历史消息, hasMore={}",
            page_data.messages.len(),
            page_data.has_more
        );
        Ok(page_data)
    }

    async fn fetch_conversation(
        &self,
        contact_id: UserId,
        before_sync_id: Option<i64>,
        page_size: u32,
    ) -> Result<HistoryPage> {
        let operation_id = Uuid::new_v4().to_string();
        let url = self.url(&format!("/direct-message/{}/history", contact_id));
        debug!(
            "[MsgAPI/History] 📡 请求会话历史 contact={}, before={:?}",
            contact_id, before_sync_id
        );

        let mut query = vec![("pageSize", page_size.to_string())];
        if let Some(before) = before_sync_id {
            query.push(("beforeSyncId", before.to_string()));
        }

        let response = self
            .client
            .get(&url)
            .header("operationID", &operation_id)
            .query(&query)
            .send()
            .await
            .context("请求会话历史失败")?;

        let resp = handle_http_response::<HistoryPage>(response, "会话历史").await?;
        Ok(resp.data.unwrap_or_default())
    }
}

#[async_trait]
impl ReadPositionApi for HttpMessageApi {
    async fn update_read_position(&self, contact_id: UserId) -> Result<Option<i64>> {
        let operation_id = Uuid::new_v4().to_string();
        let url = self.url(&format!("/direct-message/{}/readline", contact_id));
        debug!(
            "[MsgAPI/ReadLine] 📡 更新已读线 contact={}, operationID={}",
            contact_id, operation_id
        );

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("operationID", &operation_id)
            .json(&serde_json::json!({ "contactId": contact_id }))
            .send()
            .await
            .context("更新已读线请求失败")?;

        let resp = handle_http_response::<ReadLineResp>(response, "更新已读线").await?;
        Ok(resp.data.and_then(|d| d.sync_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let api = HttpMessageApi::new(reqwest::Client::new(), "http://localhost:10002/".into());
        assert_eq!(
            api.url("/direct-message/inbox"),
            "http://localhost:10002/direct-message/inbox"
        );
    }

    #[test]
    fn invalid_token_is_rejected() {
        assert!(HttpMessageApi::with_token("http://localhost".into(), "bad\ntoken").is_err());
    }

    #[test]
    fn readline_response_tolerates_missing_sync_id() {
        let resp: ReadLineResp = serde_json::from_str("{}").unwrap();
        assert_eq!(resp.sync_id, None);
        let resp: ReadLineResp = serde_json::from_str(r#"{"syncId":9}"#).unwrap();
        assert_eq!(resp.sync_id, Some(9));
    }
}
