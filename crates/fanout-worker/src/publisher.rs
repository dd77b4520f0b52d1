//! 推送负载发布
//!
//! 发布是异步的：调用立即返回，投递结果通过回调通知。
//! 管道在发出发布调用后即视为完成，不等待投递回执，也不重试。
//! 停机时 `KafkaPushPublisher::drain` 等待已发出的投递拿到结果。

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chat_shared::kafka::KafkaProducer;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::FanoutError;

/// 投递完成回调
pub type DeliveryCallback = Box<dyn FnOnce(Result<(), FanoutError>) + Send + 'static>;

/// 推送负载发布接口
pub trait PushPublisher: Send + Sync {
    /// 异步发布负载，`timeout` 限定本次投递尝试的最长时间
    fn publish(&self, key: &str, payload: Vec<u8>, timeout: Duration, on_complete: DeliveryCallback);
}

/// 尚未拿到结果的投递计数
#[derive(Default)]
struct PendingSends {
    count: AtomicUsize,
    idle: Notify,
}

impl PendingSends {
    fn begin(self: &Arc<Self>) -> PendingGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        PendingGuard(Arc::clone(self))
    }

    fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    async fn wait_idle(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            // 先登记再检查，避免错过检查与等待之间的唤醒
            let idle = self.idle.notified();
            if self.len() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                return self.len() == 0;
            }
        }
    }
}

/// 投递任务结束（含 panic）时递减计数
struct PendingGuard(Arc<PendingSends>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// 基于 Kafka 的推送负载发布器
pub struct KafkaPushPublisher {
    producer: KafkaProducer,
    topic: String,
    pending: Arc<PendingSends>,
}

impl KafkaPushPublisher {
    pub fn new(producer: KafkaProducer, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
            pending: Arc::new(PendingSends::default()),
        }
    }

    /// 已发出但回调尚未执行的投递数
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// 等待所有已发出的投递拿到结果，最多等待 `limit`
    pub async fn drain(&self, limit: Duration) -> bool {
        self.pending.wait_idle(limit).await
    }
}

impl PushPublisher for KafkaPushPublisher {
    fn publish(&self, key: &str, payload: Vec<u8>, timeout: Duration, on_complete: DeliveryCallback) {
        let producer = self.producer.clone();
        let topic = self.topic.clone();
        let key = key.to_string();
        let guard = self.pending.begin();

        tokio::spawn(async move {
            let _guard = guard;
            let result =
                match tokio::time::timeout(timeout, producer.send(&topic, &key, &payload)).await {
                    Ok(Ok((partition, offset))) => {
                        debug!(topic = %topic, key = %key, partition, offset, "推送负载已投递");
                        Ok(())
                    }
                    Ok(Err(e)) => Err(FanoutError::Publish(e.to_string())),
                    Err(_) => Err(FanoutError::timeout("publish", timeout)),
                };
            on_complete(result);
        });
    }
}
