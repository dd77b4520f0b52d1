//! 消息扇出管道
//!
//! 每条入站消息按顺序经过：反序列化 -> 打标 -> 落库 -> 成员分页查询 ->
//! 设备令牌查询 -> 构造推送负载 -> 发布。
//!
//! 任一阶段失败都只终止当前消息：记录日志后丢弃，不重试，不影响其他消息。
//! 会话无成员或成员均无设备属于正常结果，静默结束且不发布。

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chat_shared::config::FanoutConfig;
use chat_shared::events::{ChatMessage, PushPayload};
use chat_shared::observability::metrics;
use tracing::{Instrument, Span, debug, error, field, info, info_span};

use crate::endpoint_client::EndpointResolver;
use crate::error::FanoutError;
use crate::pool::BufferPool;
use crate::publisher::{DeliveryCallback, PushPublisher};
use crate::sequence::SequenceGenerator;
use crate::store::{MessageStore, RecipientResolver};

/// 管道依赖的外部协作方
///
/// 由调用方显式构造并注入，管道在进程生命周期内独占持有。
#[derive(Clone)]
pub struct FanoutDeps {
    pub store: Arc<dyn MessageStore>,
    pub recipients: Arc<dyn RecipientResolver>,
    pub endpoints: Arc<dyn EndpointResolver>,
    pub publisher: Arc<dyn PushPublisher>,
}

/// 管道运行参数
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub member_page_size: u32,
    pub persist_timeout: Duration,
    pub membership_timeout: Duration,
    pub endpoint_timeout: Duration,
    pub publish_timeout: Duration,
    pub buffer_pool_max_idle: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&FanoutConfig::default())
    }
}

impl From<&FanoutConfig> for PipelineSettings {
    fn from(config: &FanoutConfig) -> Self {
        Self {
            member_page_size: config.member_page_size.max(1),
            persist_timeout: config.persist_timeout(),
            membership_timeout: config.membership_timeout(),
            endpoint_timeout: config.endpoint_timeout(),
            publish_timeout: config.publish_timeout(),
            buffer_pool_max_idle: config.buffer_pool_max_idle,
        }
    }
}

/// 单条消息的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FanoutOutcome {
    /// 已发出发布调用，投递结果由回调异步记录
    Published { recipients: usize, endpoints: usize },
    /// 会话没有成员
    NoRecipients,
    /// 所有成员都没有可用的设备令牌
    NoEndpoints { recipients: usize },
}

impl FanoutOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Published { .. } => "published",
            Self::NoRecipients => "no_recipients",
            Self::NoEndpoints { .. } => "no_endpoints",
        }
    }
}

/// 消息扇出管道
pub struct FanoutPipeline {
    deps: FanoutDeps,
    settings: PipelineSettings,
    buffers: BufferPool,
    sequence: SequenceGenerator,
}

impl FanoutPipeline {
    pub fn new(deps: FanoutDeps, settings: PipelineSettings) -> Self {
        let buffers = BufferPool::new(settings.buffer_pool_max_idle);
        Self {
            deps,
            settings,
            buffers,
            sequence: SequenceGenerator::new(),
        }
    }

    /// 落库缓冲池，用于观察借出/归还情况
    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    /// 处理单条入站消息
    ///
    /// 错误在这里统一记录日志和指标后原样返回，调用方无需重复记录。
    pub async fn handle(&self, raw: &[u8]) -> Result<FanoutOutcome, FanoutError> {
        let span = info_span!(
            "fanout_message",
            msg_id = field::Empty,
            chat_id = field::Empty,
            seq = field::Empty,
        );

        async {
            let started = Instant::now();
            let result = self.run(raw).await;
            let elapsed = started.elapsed().as_secs_f64();

            match &result {
                Ok(outcome) => {
                    metrics::record_pipeline_outcome(outcome.label(), elapsed);
                    debug!(outcome = ?outcome, "消息扇出完成");
                }
                Err(e) => {
                    metrics::record_pipeline_outcome(&format!("failed_{}", e.stage()), elapsed);
                    error!(
                        stage = e.stage(),
                        code = e.code(),
                        error = %e,
                        payload_len = raw.len(),
                        "消息扇出终止"
                    );
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run(&self, raw: &[u8]) -> Result<FanoutOutcome, FanoutError> {
        let mut msg: ChatMessage = serde_json::from_slice(raw)
            .map_err(|e| FanoutError::MalformedMessage(e.to_string()))?;

        self.sequence.stamp(&mut msg);
        let span = Span::current();
        span.record("msg_id", msg.msg_id.as_str());
        span.record("chat_id", msg.chat_id.as_str());
        span.record("seq", msg.seq);

        let msg_id = msg.msg_id.clone();
        let chat_id = msg.chat_id.clone();

        self.persist(msg).await?;

        let members = self.resolve_members(&chat_id).await?;
        if members.is_empty() {
            debug!("会话无成员，跳过推送");
            return Ok(FanoutOutcome::NoRecipients);
        }
        let recipients = members.len();

        let tokens = self.resolve_endpoints(members).await?;
        metrics::record_endpoints_resolved(tokens.len());

        // 负载只携带原始入站字节，下游看到的是发送方写入的消息
        let Some(payload) = PushPayload::new(raw, tokens) else {
            debug!(recipients, "成员均无可用设备，跳过推送");
            return Ok(FanoutOutcome::NoEndpoints { recipients });
        };
        let endpoints = payload.device_tokens.len();

        let bytes =
            serde_json::to_vec(&payload).map_err(|e| FanoutError::Serialize(e.to_string()))?;

        self.deps.publisher.publish(
            &msg_id,
            bytes,
            self.settings.publish_timeout,
            delivery_logger(msg_id.clone(), chat_id),
        );

        info!(recipients, endpoints, "推送负载已提交发布");
        Ok(FanoutOutcome::Published {
            recipients,
            endpoints,
        })
    }

    /// 借出缓冲写入消息后批量落库，缓冲在任何结果下都会归还
    async fn persist(&self, msg: ChatMessage) -> Result<(), FanoutError> {
        let mut batch = self.buffers.acquire();
        batch.push(msg);

        bounded(
            "persist",
            self.settings.persist_timeout,
            self.deps.store.insert_messages(&batch),
        )
        .await
        .map_err(|e| e.or_stage(FanoutError::Persist))
    }

    /// 按固定页大小从偏移 0 开始分页，某页不足页大小即为末页
    ///
    /// 任一页失败都放弃整条消息，不向不完整的成员列表推送。
    async fn resolve_members(&self, chat_id: &str) -> Result<Vec<String>, FanoutError> {
        let page_size = self.settings.member_page_size;
        let mut members = Vec::with_capacity(page_size as usize);
        let mut offset: u64 = 0;

        loop {
            let page = bounded(
                "membership",
                self.settings.membership_timeout,
                self.deps.recipients.list_members(chat_id, page_size, offset),
            )
            .await
            .map_err(|e| e.or_stage(FanoutError::Membership))?;

            let fetched = page.len();
            members.extend(page);
            if fetched < page_size as usize {
                break;
            }
            offset += u64::from(page_size);
        }

        debug!(member_count = members.len(), "会话成员解析完成");
        Ok(members)
    }

    /// 一次性查询全部成员的设备令牌并展平
    ///
    /// 按成员顺序拼接各自的令牌列表，设备列表为空的成员不贡献任何令牌。
    /// 不做去重，多个成员共用的令牌会出现多次。
    async fn resolve_endpoints(&self, members: Vec<String>) -> Result<Vec<String>, FanoutError> {
        let mut by_user = bounded(
            "endpoints",
            self.settings.endpoint_timeout,
            self.deps.endpoints.device_tokens(&members),
        )
        .await
        .map_err(|e| e.or_stage(FanoutError::EndpointLookup))?;

        let mut tokens = Vec::new();
        for user_id in &members {
            let Some(user_tokens) = by_user.remove(user_id) else {
                continue;
            };
            if user_tokens.is_empty() {
                continue;
            }
            tokens.extend(user_tokens);
        }

        Ok(tokens)
    }
}

/// 为单次下游调用加上独立的超时上限
async fn bounded<T, F>(stage: &'static str, limit: Duration, call: F) -> Result<T, FanoutError>
where
    F: Future<Output = Result<T, FanoutError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(FanoutError::timeout(stage, limit)),
    }
}

/// 发布回调：只记录投递结果，不重试
fn delivery_logger(msg_id: String, chat_id: String) -> DeliveryCallback {
    Box::new(move |result| match result {
        Ok(()) => {
            metrics::record_publish_delivery("ok");
            debug!(msg_id = %msg_id, chat_id = %chat_id, "推送负载投递成功");
        }
        Err(e) => {
            metrics::record_publish_delivery("failed");
            error!(
                msg_id = %msg_id,
                chat_id = %chat_id,
                error = %e,
                "推送负载投递失败"
            );
        }
    })
}
