//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。
//! 未安装 recorder 时各记录函数为空操作，测试中可直接调用。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Metrics 资源守卫
pub struct MetricsHandle {
    _server_handle: tokio::task::JoinHandle<()>,
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(service_name: &str, port: u16) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    register_fanout_metrics(service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle {
        _server_handle: server_handle,
    })
}

/// 注册扇出管道指标描述
fn register_fanout_metrics(service_name: &str) {
    metrics::describe_counter!(
        "fanout_messages_total",
        "Inbound messages handled by the fan-out pipeline, by outcome"
    );
    metrics::describe_histogram!(
        "fanout_pipeline_duration_seconds",
        "Fan-out pipeline run duration in seconds"
    );
    metrics::describe_histogram!(
        "fanout_endpoints_per_message",
        "Device endpoints resolved per published message"
    );
    metrics::describe_counter!(
        "fanout_dropped_total",
        "Deliveries dropped before entering the pipeline, by reason"
    );
    metrics::describe_counter!(
        "fanout_publish_deliveries_total",
        "Push payload publish completions, by status"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 启动指标 HTTP 服务器
async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录一次管道执行结果
#[inline]
pub fn record_pipeline_outcome(outcome: &str, duration_secs: f64) {
    metrics::counter!("fanout_messages_total", "outcome" => outcome.to_string()).increment(1);
    metrics::histogram!("fanout_pipeline_duration_seconds", "outcome" => outcome.to_string())
        .record(duration_secs);
}

/// 记录单条消息解析出的设备令牌数量
#[inline]
pub fn record_endpoints_resolved(count: usize) {
    metrics::histogram!("fanout_endpoints_per_message").record(count as f64);
}

/// 记录进入管道前被丢弃的投递
#[inline]
pub fn record_message_dropped(reason: &str) {
    metrics::counter!("fanout_dropped_total", "reason" => reason.to_string()).increment(1);
}

/// 记录推送负载的投递回执
#[inline]
pub fn record_publish_delivery(status: &str) {
    metrics::counter!("fanout_publish_deliveries_total", "status" => status.to_string())
        .increment(1);
}
