//! 消息存储与会话成员查询
//!
//! 通过 trait 抽象持久化层，管道只依赖接口，测试时注入 mock 实现。
//! 生产实现基于 PostgreSQL：消息写入 `chat_messages`，成员从 `chat_members` 分页读取。

use async_trait::async_trait;
use chat_shared::error::ChatError;
use chat_shared::events::ChatMessage;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::debug;

use crate::error::FanoutError;

// ---------------------------------------------------------------------------
// Trait 抽象
// ---------------------------------------------------------------------------

/// 消息存储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// 批量写入消息，单次往返
    async fn insert_messages(&self, batch: &[ChatMessage]) -> Result<(), FanoutError>;
}

/// 会话成员查询接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecipientResolver: Send + Sync {
    /// 分页返回会话成员的用户 ID，返回条数少于 `limit` 表示已到末页
    async fn list_members(
        &self,
        chat_id: &str,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<String>, FanoutError>;
}

// ---------------------------------------------------------------------------
// PostgreSQL 实现
// ---------------------------------------------------------------------------

/// 基于 PostgreSQL 的消息存储
///
/// 同一实例同时承担消息写入和成员查询，共享连接池。
pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn insert_messages(&self, batch: &[ChatMessage]) -> Result<(), FanoutError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut rows = Vec::with_capacity(batch.len());
        for msg in batch {
            let seq = i64::try_from(msg.seq)
                .map_err(|_| FanoutError::Persist(format!("序列号越界: {}", msg.seq)))?;
            rows.push((msg, seq));
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO chat_messages (id, msg_id, chat_id, seq, sender_id, content, content_type) ",
        );
        builder.push_values(rows, |mut row, (msg, seq)| {
            row.push_bind(msg.id)
                .push_bind(&msg.msg_id)
                .push_bind(&msg.chat_id)
                .push_bind(seq)
                .push_bind(&msg.sender_id)
                .push_bind(&msg.content)
                .push_bind(&msg.content_type);
        });
        // 上游重投同一条原始消息会得到新的 ID，这里只防御同 ID 的重复写入
        builder.push(" ON CONFLICT (id) DO NOTHING");

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(ChatError::from)?;

        debug!(
            batch_size = batch.len(),
            rows_affected = result.rows_affected(),
            "消息已写入"
        );
        Ok(())
    }
}

#[async_trait]
impl RecipientResolver for PgMessageStore {
    async fn list_members(
        &self,
        chat_id: &str,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<String>, FanoutError> {
        let offset = i64::try_from(offset)
            .map_err(|_| FanoutError::Membership(format!("分页偏移越界: {offset}")))?;

        let members = sqlx::query_scalar::<_, String>(
            r#"
            SELECT user_id
            FROM chat_members
            WHERE chat_id = $1
            ORDER BY user_id
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(chat_id)
        .bind(i64::from(limit))
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(ChatError::from)?;

        Ok(members)
    }
}
