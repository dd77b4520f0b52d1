//! 测试工具模块
//!
//! 提供集成测试使用的内存版协作方实现，可记录调用、注入失败和延迟，
//! 无需数据库、Kafka 或用户服务即可驱动完整管道。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chat_shared::events::{ChatMessage, PushPayload};
use parking_lot::Mutex;

use crate::endpoint_client::EndpointResolver;
use crate::error::FanoutError;
use crate::pipeline::{FanoutDeps, FanoutPipeline, PipelineSettings};
use crate::publisher::{DeliveryCallback, PushPublisher};
use crate::store::{MessageStore, RecipientResolver};

// ==================== 消息存储 ====================

/// 内存版消息存储与成员表
#[derive(Default)]
pub struct InMemoryStore {
    messages: Mutex<Vec<ChatMessage>>,
    members: Mutex<HashMap<String, Vec<String>>>,
    insert_calls: AtomicUsize,
    page_calls: Mutex<Vec<(u32, u64)>>,
    fail_inserts: AtomicBool,
    insert_delay: Mutex<Option<Duration>>,
    page_delay: Mutex<Option<Duration>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置会话成员，顺序即分页顺序
    pub fn with_members(self, chat_id: &str, members: impl IntoIterator<Item = String>) -> Self {
        self.members
            .lock()
            .insert(chat_id.to_string(), members.into_iter().collect());
        self
    }

    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn set_insert_delay(&self, delay: Duration) {
        *self.insert_delay.lock() = Some(delay);
    }

    /// 每次成员分页查询前的等待
    pub fn set_page_delay(&self, delay: Duration) {
        *self.page_delay.lock() = Some(delay);
    }

    /// 已落库的消息快照
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.messages.lock().clone()
    }

    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    /// 每次分页调用的 (limit, offset)
    pub fn page_calls(&self) -> Vec<(u32, u64)> {
        self.page_calls.lock().clone()
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn insert_messages(&self, batch: &[ChatMessage]) -> Result<(), FanoutError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.insert_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(FanoutError::Persist("injected failure".to_string()));
        }
        self.messages.lock().extend_from_slice(batch);
        Ok(())
    }
}

#[async_trait]
impl RecipientResolver for InMemoryStore {
    async fn list_members(
        &self,
        chat_id: &str,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<String>, FanoutError> {
        self.page_calls.lock().push((limit, offset));

        let delay = *self.page_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let members = self.members.lock();
        let page = members
            .get(chat_id)
            .map(|all| {
                all.iter()
                    .skip(offset as usize)
                    .take(limit as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(page)
    }
}

// ==================== 设备令牌 ====================

/// 固定映射的设备令牌查询
#[derive(Default)]
pub struct StaticEndpointResolver {
    tokens: HashMap<String, Vec<String>>,
    calls: AtomicUsize,
    fail: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl StaticEndpointResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens(mut self, user_id: &str, tokens: &[&str]) -> Self {
        self.tokens.insert(
            user_id.to_string(),
            tokens.iter().map(|t| t.to_string()).collect(),
        );
        self
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EndpointResolver for StaticEndpointResolver {
    async fn device_tokens(
        &self,
        user_ids: &[String],
    ) -> Result<HashMap<String, Vec<String>>, FanoutError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail.load(Ordering::SeqCst) {
            return Err(FanoutError::EndpointLookup("injected failure".to_string()));
        }

        Ok(user_ids
            .iter()
            .filter_map(|id| self.tokens.get(id).map(|t| (id.clone(), t.clone())))
            .collect())
    }
}

// ==================== 发布 ====================

/// 记录发布调用的发布器
///
/// 回调在调用线程上立即完成，`fail_deliveries` 控制回调收到的结果。
#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<(String, Vec<u8>)>>,
    fail_deliveries: AtomicBool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_deliveries(&self, fail: bool) {
        self.fail_deliveries.store(fail, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().clone()
    }

    /// 按发布顺序解析出的推送负载
    pub fn payloads(&self) -> Vec<PushPayload> {
        self.published
            .lock()
            .iter()
            .filter_map(|(_, bytes)| serde_json::from_slice(bytes).ok())
            .collect()
    }
}

impl PushPublisher for RecordingPublisher {
    fn publish(&self, key: &str, payload: Vec<u8>, _timeout: Duration, on_complete: DeliveryCallback) {
        self.published.lock().push((key.to_string(), payload));
        if self.fail_deliveries.load(Ordering::SeqCst) {
            on_complete(Err(FanoutError::Publish("injected failure".to_string())));
        } else {
            on_complete(Ok(()));
        }
    }
}

// ==================== 组装 ====================

/// 以内存协作方组装的测试管道
pub struct TestHarness {
    pub store: Arc<InMemoryStore>,
    pub endpoints: Arc<StaticEndpointResolver>,
    pub publisher: Arc<RecordingPublisher>,
    pub pipeline: Arc<FanoutPipeline>,
}

impl TestHarness {
    pub fn new(store: InMemoryStore, endpoints: StaticEndpointResolver) -> Self {
        Self::with_settings(store, endpoints, PipelineSettings::default())
    }

    pub fn with_settings(
        store: InMemoryStore,
        endpoints: StaticEndpointResolver,
        settings: PipelineSettings,
    ) -> Self {
        let store = Arc::new(store);
        let endpoints = Arc::new(endpoints);
        let publisher = Arc::new(RecordingPublisher::new());
        let pipeline = Arc::new(FanoutPipeline::new(
            FanoutDeps {
                store: store.clone(),
                recipients: store.clone(),
                endpoints: endpoints.clone(),
                publisher: publisher.clone(),
            },
            settings,
        ));
        Self {
            store,
            endpoints,
            publisher,
            pipeline,
        }
    }
}

/// 构造入站消息的原始字节
pub fn raw_message(chat_id: &str, sender_id: &str, content: &str) -> Vec<u8> {
    serde_json::json!({
        "chat_id": chat_id,
        "sender_id": sender_id,
        "content": content,
    })
    .to_string()
    .into_bytes()
}
