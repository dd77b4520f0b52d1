//! 消息打标
//!
//! 在消息被接收时一次性分配唯一 ID 与序列号。序列号以纳秒时间戳为基础，
//! 当时钟回拨或同一纳秒内并发打标时退化为 `上一个值 + 1`，保证严格递增。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chat_shared::events::ChatMessage;
use uuid::Uuid;

/// 进程内严格递增的序列号生成器
#[derive(Debug, Default)]
pub struct SequenceGenerator {
    last: AtomicU64,
}

impl SequenceGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 生成下一个序列号
    pub fn next(&self) -> u64 {
        let now = now_nanos();
        let mut current = self.last.load(Ordering::Relaxed);
        loop {
            // 计数到顶后停在 u64::MAX，不回绕
            let candidate = now.max(current.saturating_add(1));
            match self.last.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(observed) => current = observed,
            }
        }
    }

    /// 为消息分配服务端身份，覆盖发送方写入的任何值
    pub fn stamp(&self, msg: &mut ChatMessage) {
        msg.id = Uuid::now_v7();
        msg.msg_id = msg.id.to_string();
        msg.seq = self.next();
    }
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
