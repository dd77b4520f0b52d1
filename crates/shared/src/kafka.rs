//! Kafka 收发封装
//!
//! 入站聊天消息和出站推送负载都走 Kafka。这里只暴露扇出服务需要的两件事：
//! 按 key 发送原始字节，以及把每次投递（含接收错误）交给回调处理的消费循环。

use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::error::ChatError;

/// 生产者本地队列满时的最长等待
const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// 一次入站投递
///
/// 从 `BorrowedMessage` 复制出所需字段，脱离消费者缓冲区的生命周期。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

impl ConsumerMessage {
    fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key: msg.key().map(<[u8]>::to_vec),
            // 空负载原样交给管道，由反序列化阶段判定为非法消息
            payload: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        }
    }
}

// ---------------------------------------------------------------------------
// 生产者
// ---------------------------------------------------------------------------

/// Kafka 生产者，clone 共享同一个底层连接
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
}

impl KafkaProducer {
    /// `delivery_timeout` 写入 `message.timeout.ms`
    ///
    /// 超过该时间仍未确认的记录由 librdkafka 判定失败并从本地队列移除，
    /// 调用方的等待上限应与之相同，否则会出现"已报超时但稍后送达"。
    pub fn new(config: &KafkaConfig, delivery_timeout: Duration) -> Result<Self, ChatError> {
        let producer: FutureProducer = producer_config(config, delivery_timeout)
            .create()
            .map_err(|e| ChatError::Kafka(format!("创建生产者失败: {e}")))?;

        info!(
            brokers = %config.brokers,
            delivery_timeout_ms = delivery_timeout.as_millis() as u64,
            "Kafka 生产者已初始化"
        );
        Ok(Self { producer })
    }

    /// 发送一条消息并等待 broker 回执，返回 (partition, offset)
    pub async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<(i32, i64), ChatError> {
        let record = FutureRecord::to(topic).key(key).payload(payload);

        let delivery = self
            .producer
            .send(record, ENQUEUE_TIMEOUT)
            .await
            .map_err(|(e, _)| ChatError::Kafka(format!("发送消息失败: {e}")))?;

        Ok((delivery.partition, delivery.offset))
    }
}

// ---------------------------------------------------------------------------
// 消费者
// ---------------------------------------------------------------------------

/// Kafka 消费者，offset 自动提交
pub struct KafkaConsumer {
    consumer: StreamConsumer,
    group_id: String,
}

impl KafkaConsumer {
    /// `group_id_suffix` 追加在配置的消费组之后，如 "chat-fanout.messages"
    pub fn new(config: &KafkaConfig, group_id_suffix: Option<&str>) -> Result<Self, ChatError> {
        let group_id = group_id(&config.consumer_group, group_id_suffix);

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &group_id)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "true")
            .create()
            .map_err(|e| ChatError::Kafka(format!("创建消费者失败: {e}")))?;

        info!(brokers = %config.brokers, group_id = %group_id, "Kafka 消费者已初始化");
        Ok(Self { consumer, group_id })
    }

    pub fn subscribe(&self, topics: &[&str]) -> Result<(), ChatError> {
        self.consumer
            .subscribe(topics)
            .map_err(|e| ChatError::Kafka(format!("订阅 topic 失败: {e}")))?;

        info!(?topics, group_id = %self.group_id, "已订阅 Kafka topics");
        Ok(())
    }

    /// 消费循环，直到 shutdown 置为 true 或消息流结束
    ///
    /// 接收错误同样作为一次投递交给 handler，循环不会因单次投递中断。
    pub async fn start<F, Fut>(self, mut shutdown: watch::Receiver<bool>, handler: F)
    where
        F: Fn(Result<ConsumerMessage, ChatError>) -> Fut,
        Fut: std::future::Future<Output = Result<(), ChatError>>,
    {
        use futures::StreamExt;

        let stream = self.consumer.stream();
        futures::pin_mut!(stream);
        info!(group_id = %self.group_id, "Kafka 消费循环已启动");

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    // 发送端被丢弃同样视为关闭
                    if changed.is_err() || *shutdown.borrow() {
                        info!("收到关闭信号，Kafka 消费循环退出");
                        break;
                    }
                }

                next = stream.next() => {
                    let Some(next) = next else {
                        warn!("Kafka 消息流意外结束");
                        break;
                    };

                    let delivery = next
                        .map(|msg| ConsumerMessage::from_borrowed(&msg))
                        .map_err(|e| ChatError::Kafka(format!("接收消息出错: {e}")));

                    if let Ok(msg) = &delivery {
                        debug!(
                            topic = %msg.topic,
                            partition = msg.partition,
                            offset = msg.offset,
                            "收到 Kafka 消息"
                        );
                    }

                    if let Err(e) = handler(delivery).await {
                        error!(error = %e, "处理 Kafka 投递失败");
                    }
                }
            }
        }
    }
}

fn producer_config(config: &KafkaConfig, delivery_timeout: Duration) -> ClientConfig {
    // librdkafka 不接受 0，至少 1ms
    let timeout_ms = delivery_timeout.as_millis().max(1);
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", &config.brokers)
        .set("message.timeout.ms", timeout_ms.to_string());
    client
}

fn group_id(base: &str, suffix: Option<&str>) -> String {
    match suffix {
        Some(suffix) => format!("{base}.{suffix}"),
        None => base.to_string(),
    }
}
