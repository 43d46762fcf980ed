use crate::im::message::types::{DirectMessage, SendMessageRequest};
use serde::{Deserialize, Serialize};

/// 推送通道帧类型标识符
pub mod frame_type {
    /// 心跳（无 data）
    pub const HEARTBEAT: i32 = 2;
    /// 客户端发出的私信
    pub const CHAT_SEND: i32 = 3;
    /// 服务器推送的私信同步
    pub const CHAT_SYNC: i32 = 4;
}

/// 推送通道上的 JSON 帧：`{type, data?}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushFrame {
    #[serde(rename = "type")]
    pub frame_type: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// 解析后的入站帧
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// type 4：单条私信
    ChatSync(DirectMessage),
    /// type 2：服务器回显的心跳
    Heartbeat,
    /// 其他类型，记录后忽略
    Unknown(i32),
}

impl PushFrame {
    /// 心跳帧 `{"type":2}`
    pub fn heartbeat() -> Self {
        Self {
            frame_type: frame_type::HEARTBEAT,
            data: None,
        }
    }

    /// 私信发送帧 `{"type":3,"data":{...}}`
    pub fn chat(request: &SendMessageRequest) -> Result<Self, serde_json::Error> {
        Ok(Self {
            frame_type: frame_type::CHAT_SEND,
            data: Some(serde_json::to_value(request)?),
        })
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// 从原始字节解析入站帧
    ///
    /// type 4 缺少 data 或 data 不是合法的私信结构时返回错误，调用方负责记录并丢弃。
    pub fn decode(raw: &[u8]) -> anyhow::Result<InboundFrame> {
        let frame: PushFrame = serde_json::from_slice(raw)?;
        match frame.frame_type {
            frame_type::CHAT_SYNC => {
                let data = frame
                    .data
                    .ok_or_else(|| anyhow::anyhow!("type 4 帧缺少 data 字段"))?;
                let message: DirectMessage = serde_json::from_value(data)?;
                Ok(InboundFrame::ChatSync(message))
            }
            frame_type::HEARTBEAT => Ok(InboundFrame::Heartbeat),
            other => Ok(InboundFrame::Unknown(other)),
        }
    }
}

/// 统一的 API 响应包装结构体（包含 errCode、errMsg、data）
/// data 字段可能为 null 或缺失，因此使用 Option<T>
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    #[serde(rename = "errCode")]
    pub err_code: i32,
    #[serde(rename = "errMsg", default)]
    pub err_msg: String,
    pub data: Option<T>,
}

/// 通用 HTTP 响应处理函数：直接反序列化为统一的响应结构体
///
/// HTTP 状态码非 2xx 或 errCode 非 0 时返回错误。
pub async fn handle_http_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    operation_name: &str,
) -> anyhow::Result<ApiResponse<T>> {
    use anyhow::Context;
    use tracing::{debug, error};

    let status = response.status();

    // body 只能读取一次
    let body_bytes = response.bytes().await.context("读取响应 body 失败")?;
    let body_str = String::from_utf8_lossy(&body_bytes);
    debug!("[HTTP] {}响应 Body: {}", operation_name, body_str);

    if !status.is_success() {
        error!(
            "[HTTP] {}请求失败，HTTP状态: {}, 响应: {}",
            operation_name, status, body_str
        );
        return Err(anyhow::anyhow!("HTTP 错误 {}: {}", status, body_str));
    }

    let api_resp: ApiResponse<T> = serde_json::from_slice(&body_bytes).map_err(|e| {
        error!(
            "[HTTP] {}反序列化失败: {:?}\n原始响应: {}",
            operation_name, e, body_str
        );
        anyhow::anyhow!("反序列化响应失败: {:?}", e)
    })?;

    if api_resp.err_code != 0 {
        error!(
            "[HTTP] {}服务器错误，错误码: {}, 错误信息: {}",
            operation_name, api_resp.err_code, api_resp.err_msg
        );
        return Err(anyhow::anyhow!(
            "服务器错误 {}: {}",
            api_resp.err_code,
            api_resp.err_msg
        ));
    }

    Ok(api_resp)
}
