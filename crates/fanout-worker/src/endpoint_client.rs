//! 设备令牌查询客户端
//!
//! 通过 EndpointResolver trait 抽象用户服务调用，便于测试时注入 mock 实现。
//! 生产实现以 HTTP 批量接口一次性查询全部成员的推送令牌。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chat_shared::config::EndpointServiceConfig;
use chat_shared::error::ChatError;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::FanoutError;

const SERVICE_NAME: &str = "device-token-service";

// ---------------------------------------------------------------------------
// Trait 抽象
// ---------------------------------------------------------------------------

/// 设备令牌查询接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EndpointResolver: Send + Sync {
    /// 返回 用户 ID -> 设备令牌列表，未注册设备的用户可以缺席或对应空列表
    async fn device_tokens(
        &self,
        user_ids: &[String],
    ) -> Result<HashMap<String, Vec<String>>, FanoutError>;
}

// ---------------------------------------------------------------------------
// HTTP 实现
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct DeviceTokensRequest<'a> {
    user_ids: &'a [String],
}

#[derive(Debug, Deserialize)]
struct UserDeviceTokens {
    user_id: String,
    #[serde(default)]
    tokens: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DeviceTokensResponse {
    #[serde(default)]
    user_device_tokens: Vec<UserDeviceTokens>,
}

impl DeviceTokensResponse {
    fn into_map(self) -> HashMap<String, Vec<String>> {
        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        for entry in self.user_device_tokens {
            map.entry(entry.user_id).or_default().extend(entry.tokens);
        }
        map
    }
}

/// 基于 HTTP 的设备令牌查询客户端
///
/// reqwest::Client 内部带连接池，clone 是廉价操作。
/// 不会在启动时建立连接，首次调用时按需连接。
#[derive(Clone)]
pub struct HttpEndpointResolver {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpEndpointResolver {
    pub fn new(config: &EndpointServiceConfig) -> Result<Self, FanoutError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| ChatError::Internal(format!("创建 HTTP 客户端失败: {e}")))?;

        let endpoint = format!(
            "{}/v1/device-tokens/batch",
            config.base_url.trim_end_matches('/')
        );

        info!(endpoint = %endpoint, "设备令牌客户端已初始化");
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl EndpointResolver for HttpEndpointResolver {
    async fn device_tokens(
        &self,
        user_ids: &[String],
    ) -> Result<HashMap<String, Vec<String>>, FanoutError> {
        debug!(user_count = user_ids.len(), "查询设备令牌");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&DeviceTokensRequest { user_ids })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ChatError::ExternalServiceTimeout {
                        service: SERVICE_NAME.to_string(),
                    }
                } else {
                    ChatError::ExternalService {
                        service: SERVICE_NAME.to_string(),
                        message: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FanoutError::EndpointLookup(format!(
                "{SERVICE_NAME} 返回状态码 {status}"
            )));
        }

        let body: DeviceTokensResponse = response
            .json()
            .await
            .map_err(|e| FanoutError::EndpointLookup(format!("响应解析失败: {e}")))?;

        Ok(body.into_map())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_into_map_keeps_empty_users() {
        let body: DeviceTokensResponse = serde_json::from_str(
            r#"{"user_device_tokens":[
                {"user_id":"u1","tokens":["t1"]},
                {"user_id":"u2","tokens":[]},
                {"user_id":"u3"}
            ]}"#,
        )
        .unwrap();

        let map = body.into_map();
        assert_eq!(map["u1"], vec!["t1"]);
        assert!(map["u2"].is_empty());
        assert!(map["u3"].is_empty());
    }

    #[test]
    fn test_response_merges_duplicate_users() {
        let body: DeviceTokensResponse = serde_json::from_str(
            r#"{"user_device_tokens":[
                {"user_id":"u1","tokens":["t1"]},
                {"user_id":"u1","tokens":["t2"]}
            ]}"#,
        )
        .unwrap();

        assert_eq!(body.into_map()["u1"], vec!["t1", "t2"]);
    }

    #[test]
    fn test_request_serialization() {
        let ids = vec!["u1".to_string(), "u2".to_string()];
        let json = serde_json::to_string(&DeviceTokensRequest { user_ids: &ids }).unwrap();
        assert_eq!(json, r#"{"user_ids":["u1","u2"]}"#);
    }

    #[test]
    fn test_endpoint_url_normalized() {
        let resolver = HttpEndpointResolver::new(&EndpointServiceConfig {
            base_url: "http://users.internal:8081/".to_string(),
            request_timeout_ms: 1_000,
        })
        .unwrap();
        assert_eq!(
            resolver.endpoint,
            "http://users.internal:8081/v1/device-tokens/batch"
        );
    }

    #[tokio::test]
    async fn test_unreachable_service_is_error() {
        let resolver = HttpEndpointResolver::new(&EndpointServiceConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            request_timeout_ms: 500,
        })
        .unwrap();

        let result = resolver.device_tokens(&["u1".to_string()]).await;
        assert!(result.is_err());
    }
}
