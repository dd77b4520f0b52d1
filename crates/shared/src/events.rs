//! 消息事件模型
//!
//! 定义入站聊天消息与出站推送负载的统一格式。入站消息由发送方写入队列，
//! 扇出服务在接收时为其分配唯一 ID 与序列号；推送负载携带原始消息字节
//! 和解析出的设备令牌，交给下游推送服务投递。

use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn default_content_type() -> String {
    "text".to_string()
}

// ---------------------------------------------------------------------------
// ChatMessage: 入站聊天消息
// ---------------------------------------------------------------------------

/// 入站聊天消息
///
/// `id`、`msg_id`、`seq` 由扇出服务在接收时分配，发送方写入的值会被覆盖。
/// 同一会话内以 `seq` 作为排序依据，而非落库顺序。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub id: Uuid,
    #[serde(default)]
    pub msg_id: String,
    pub chat_id: String,
    #[serde(default)]
    pub seq: u64,
    pub sender_id: String,
    pub content: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

impl ChatMessage {
    pub fn new(
        chat_id: impl Into<String>,
        sender_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::nil(),
            msg_id: String::new(),
            chat_id: chat_id.into(),
            seq: 0,
            sender_id: sender_id.into(),
            content: content.into(),
            content_type: default_content_type(),
        }
    }

    /// 是否已分配服务端身份
    pub fn is_stamped(&self) -> bool {
        !self.id.is_nil() && self.seq > 0
    }
}

// ---------------------------------------------------------------------------
// PushPayload: 出站推送负载
// ---------------------------------------------------------------------------

/// 出站推送负载
///
/// `msg` 是入站队列中的原始字节，未经过服务端打标，
/// 下游推送消费者看到的是发送方写入的原始消息。
///
/// 线上格式中 `msg` 为标准 base64 字符串（带填充），与下游按字节数组解码的约定一致。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushPayload {
    #[serde(with = "base64_bytes")]
    pub msg: Vec<u8>,
    pub device_tokens: Vec<String>,
}

impl PushPayload {
    /// 只有存在至少一个设备令牌时才构造负载，空负载永不发布
    pub fn new(msg: &[u8], device_tokens: Vec<String>) -> Option<Self> {
        if device_tokens.is_empty() {
            return None;
        }
        Some(Self {
            msg: msg.to_vec(),
            device_tokens,
        })
    }
}

/// `Vec<u8>` 与 base64 字符串互转
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded.as_bytes()).map_err(de::Error::custom)
    }
}
