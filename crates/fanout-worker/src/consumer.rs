//! 入站消息消费者
//!
//! 从 Kafka 订阅入站聊天消息，每次投递都交给工作池异步处理。
//! 工作池已满时直接丢弃该投递并记录，消费循环本身从不阻塞在管道上。
//! 停机时先停止接收，再在限定时间内等待已提交的消息处理完毕。

use std::sync::Arc;
use std::time::Duration;

use chat_shared::config::{FanoutConfig, KafkaConfig};
use chat_shared::kafka::KafkaConsumer;
use chat_shared::observability::metrics;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::FanoutError;
use crate::pipeline::FanoutPipeline;
use crate::pool::{PoolError, WorkerPool};

/// 投递分发结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// 已提交到工作池
    Submitted,
    /// 接收端错误，记录后跳过
    ReceiveFailed,
    /// 工作池已满或已关闭，投递被丢弃
    Dropped,
}

/// 将单次投递提交到工作池
///
/// 与 Kafka 解耦，测试中可以直接喂入原始字节。
#[derive(Clone)]
pub struct Dispatcher {
    pipeline: Arc<FanoutPipeline>,
    pool: WorkerPool,
}

impl Dispatcher {
    pub fn new(pipeline: Arc<FanoutPipeline>, pool: WorkerPool) -> Self {
        Self { pipeline, pool }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// 分发一次投递，永不等待管道执行完成
    pub fn dispatch(&self, delivery: Result<Vec<u8>, FanoutError>) -> DispatchOutcome {
        let raw = match delivery {
            Ok(raw) => raw,
            Err(e) => {
                error!(code = e.code(), error = %e, "接收入站消息失败");
                metrics::record_message_dropped("receive_error");
                return DispatchOutcome::ReceiveFailed;
            }
        };

        let pipeline = Arc::clone(&self.pipeline);
        let submitted = self.pool.try_submit(async move {
            // 错误已在管道内记录
            let _ = pipeline.handle(&raw).await;
        });

        match submitted {
            Ok(_) => DispatchOutcome::Submitted,
            Err(PoolError::Saturated { capacity }) => {
                warn!(capacity, "工作池已满，丢弃入站消息");
                metrics::record_message_dropped("pool_saturated");
                DispatchOutcome::Dropped
            }
            Err(PoolError::Closed) => {
                warn!("工作池已关闭，丢弃入站消息");
                metrics::record_message_dropped("pool_closed");
                DispatchOutcome::Dropped
            }
        }
    }

    /// 关闭工作池并等待在途消息处理完毕
    ///
    /// 在 `grace` 内全部完成返回 true，否则记录剩余数量并返回 false。
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.pool.close();
        let in_flight = self.pool.in_flight();
        if in_flight > 0 {
            info!(in_flight, grace_ms = grace.as_millis() as u64, "等待在途消息处理完毕");
        }

        let drained = self.pool.drain(grace).await;
        if !drained {
            warn!(
                remaining = self.pool.in_flight(),
                grace_ms = grace.as_millis() as u64,
                "停机等待超时，仍有消息在处理中"
            );
        }
        drained
    }
}

/// 入站消息消费者
pub struct FanoutConsumer {
    consumer: KafkaConsumer,
    topic: String,
    dispatcher: Dispatcher,
    shutdown_grace: Duration,
}

impl FanoutConsumer {
    pub fn new(
        kafka: &KafkaConfig,
        fanout: &FanoutConfig,
        dispatcher: Dispatcher,
    ) -> Result<Self, FanoutError> {
        let consumer = KafkaConsumer::new(kafka, Some("messages"))?;
        Ok(Self {
            consumer,
            topic: fanout.inbound_topic.clone(),
            dispatcher,
            shutdown_grace: fanout.shutdown_grace(),
        })
    }

    /// 启动消费循环，直到收到 shutdown 信号
    ///
    /// 退出前关闭工作池，并在 `shutdown_grace` 内等待已提交的管道跑完。
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), FanoutError> {
        self.consumer.subscribe(&[self.topic.as_str()])?;

        info!(
            topic = %self.topic,
            pool_capacity = self.dispatcher.pool().capacity(),
            "扇出消费者已启动"
        );

        let dispatcher = self.dispatcher;
        self.consumer
            .start(shutdown, |delivery| {
                let delivery = delivery
                    .map(|msg| msg.payload)
                    .map_err(|e| FanoutError::Receive(e.to_string()));
                dispatcher.dispatch(delivery);
                std::future::ready(Ok(()))
            })
            .await;

        let drained = dispatcher.shutdown(self.shutdown_grace).await;
        info!(drained, "扇出消费者已停止");
        Ok(())
    }
}
