//! 聊天消息扇出服务
//!
//! 消费入站聊天消息，落库后解析会话成员及其设备令牌，
//! 将原始消息连同令牌列表发布给下游推送服务。
//! 每条消息独立处理，单条失败不影响其他消息。

pub mod consumer;
pub mod endpoint_client;
pub mod error;
pub mod pipeline;
pub mod pool;
pub mod publisher;
pub mod sequence;
pub mod store;
pub mod test_utils;

pub use consumer::{DispatchOutcome, Dispatcher, FanoutConsumer};
pub use error::FanoutError;
pub use pipeline::{FanoutDeps, FanoutOutcome, FanoutPipeline, PipelineSettings};
pub use pool::{BufferPool, PoolError, WorkerPool};
