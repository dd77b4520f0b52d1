//! 扇出服务入口
//!
//! 组装存储、设备令牌客户端、发布器和管道后启动 Kafka 消费循环，
//! 收到 Ctrl+C 或 SIGTERM 时停止消费，并在限定时间内等待在途消息处理完毕。

use std::sync::Arc;

use anyhow::Result;
use chat_shared::{
    config::AppConfig,
    database::Database,
    kafka::KafkaProducer,
    observability,
};
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

use fanout_worker::{
    Dispatcher, FanoutConsumer, FanoutDeps, FanoutPipeline, PipelineSettings, WorkerPool,
    endpoint_client::HttpEndpointResolver, publisher::KafkaPushPublisher, store::PgMessageStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载配置并初始化可观测性
    let config = AppConfig::load("fanout-worker")?;
    let _guard = observability::init(&config.service_name, &config.observability).await?;

    info!(
        environment = %config.environment,
        inbound_topic = %config.fanout.inbound_topic,
        outbound_topic = %config.fanout.outbound_topic,
        "Starting fanout-worker..."
    );

    // 2. 初始化下游依赖
    let db = Database::connect(&config.database).await?;
    let store = Arc::new(PgMessageStore::new(db.pool().clone()));
    info!("Database connection established");

    let endpoints = Arc::new(HttpEndpointResolver::new(&config.endpoint_service)?);

    let producer = KafkaProducer::new(&config.kafka, config.fanout.publish_timeout())?;
    let publisher = Arc::new(KafkaPushPublisher::new(
        producer,
        config.fanout.outbound_topic.clone(),
    ));

    // 3. 组装管道与工作池
    let pipeline = Arc::new(FanoutPipeline::new(
        FanoutDeps {
            store: store.clone(),
            recipients: store,
            endpoints,
            publisher: publisher.clone(),
        },
        PipelineSettings::from(&config.fanout),
    ));
    let pool = WorkerPool::new(config.fanout.worker_pool_size);
    let dispatcher = Dispatcher::new(pipeline, pool);

    // 4. 启动消费循环
    let consumer = FanoutConsumer::new(&config.kafka, &config.fanout, dispatcher)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    if let Err(e) = consumer.run(shutdown_rx).await {
        warn!(error = %e, "消费者异常退出");
    }

    // 5. 等待已发出的推送拿到回执，再断开数据库
    if !publisher.drain(config.fanout.shutdown_grace()).await {
        warn!(pending = publisher.pending(), "停机时仍有推送未确认");
    }

    db.close().await;
    info!("fanout-worker stopped");
    Ok(())
}

/// 优雅关闭信号处理
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}
