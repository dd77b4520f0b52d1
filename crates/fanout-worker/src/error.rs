//! 扇出服务错误类型
//!
//! 按管道阶段划分错误，任何错误都只终止当前消息的处理，
//! 不会影响其他消息，也不会导致进程退出。

use chat_shared::error::ChatError;

/// 扇出处理错误
#[derive(Debug, thiserror::Error)]
pub enum FanoutError {
    /// 入站负载无法解析，直接丢弃，不触达任何下游依赖
    #[error("消息反序列化失败: {0}")]
    MalformedMessage(String),

    /// 接收端异常，不属于消息内容本身
    #[error("消息接收失败: {0}")]
    Receive(String),

    #[error("消息落库失败: {0}")]
    Persist(String),

    #[error("会话成员查询失败: {0}")]
    Membership(String),

    #[error("设备令牌查询失败: {0}")]
    EndpointLookup(String),

    #[error("推送负载序列化失败: {0}")]
    Serialize(String),

    #[error("推送负载发布失败: {0}")]
    Publish(String),

    /// 单次下游调用超过其独立的超时上限
    #[error("{stage} 阶段超时: {timeout_ms}ms")]
    Timeout { stage: &'static str, timeout_ms: u64 },

    /// 透传共享库错误，避免在每个 match 分支手动转换
    #[error(transparent)]
    Shared(#[from] ChatError),
}

impl FanoutError {
    /// 出错的管道阶段，用于日志字段和指标标签
    pub fn stage(&self) -> &'static str {
        match self {
            Self::MalformedMessage(_) => "deserialize",
            Self::Receive(_) => "receive",
            Self::Persist(_) => "persist",
            Self::Membership(_) => "membership",
            Self::EndpointLookup(_) => "endpoints",
            Self::Serialize(_) => "serialize",
            Self::Publish(_) => "publish",
            Self::Timeout { stage, .. } => *stage,
            Self::Shared(_) => "infrastructure",
        }
    }

    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedMessage(_) => "MALFORMED_MESSAGE",
            Self::Receive(_) => "RECEIVE_FAILED",
            Self::Persist(_) => "PERSIST_FAILED",
            Self::Membership(_) => "MEMBERSHIP_LOOKUP_FAILED",
            Self::EndpointLookup(_) => "ENDPOINT_LOOKUP_FAILED",
            Self::Serialize(_) => "SERIALIZE_FAILED",
            Self::Publish(_) => "PUBLISH_FAILED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Shared(e) => e.code(),
        }
    }

    pub(crate) fn timeout(stage: &'static str, limit: std::time::Duration) -> Self {
        Self::Timeout {
            stage,
            timeout_ms: limit.as_millis() as u64,
        }
    }

    /// 将适配器透传上来的基础设施错误归入指定阶段，其余错误保持原样
    pub(crate) fn or_stage(self, wrap: fn(String) -> Self) -> Self {
        match self {
            Self::Shared(e) => wrap(e.to_string()),
            other => other,
        }
    }
}
