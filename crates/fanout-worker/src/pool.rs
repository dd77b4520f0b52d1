//! 资源池管理
//!
//! - `WorkerPool`: 限制同时处理中的消息数量。提交是非阻塞的，池满时直接拒绝，
//!   被拒绝的消息由上游队列的重投机制兜底，本地不做无界排队。
//! - `BufferPool`: 复用落库批次使用的临时缓冲，借出后无论成功失败都会归还。

use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chat_shared::events::ChatMessage;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, TryAcquireError};
use tokio::task::JoinHandle;

/// 新建缓冲的初始容量，覆盖单条落库和少量批量的常见情况
const BUFFER_CAPACITY: usize = 3;

/// 工作池提交错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("工作池已满: capacity={capacity}")]
    Saturated { capacity: usize },

    #[error("工作池已关闭")]
    Closed,
}

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

/// 有界、非阻塞的任务池
///
/// 每个任务持有一个信号量许可，任务结束（包括 panic 展开）时许可随之释放。
/// 关闭后拒绝新任务，`drain` 通过一次性取回全部许可等待存量任务结束。
#[derive(Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    closed: Arc<AtomicBool>,
    capacity: usize,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            closed: Arc::new(AtomicBool::new(false)),
            capacity,
        }
    }

    /// 尝试提交任务，池满或已关闭时立即返回错误
    pub fn try_submit<F>(&self, task: F) -> Result<JoinHandle<()>, PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        let permit = Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .map_err(|e| match e {
                TryAcquireError::NoPermits => PoolError::Saturated {
                    capacity: self.capacity,
                },
                TryAcquireError::Closed => PoolError::Closed,
            })?;

        Ok(tokio::spawn(async move {
            let _permit = permit;
            task.await;
        }))
    }

    /// 停止接收新任务，已在执行的任务不受影响
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// 等待所有执行中的任务结束，最多等待 `limit`
    ///
    /// 全部任务结束返回 true。成功后信号量随即关闭，池不可再用；
    /// 超时返回 false，剩余任务继续在运行时中执行。
    pub async fn drain(&self, limit: Duration) -> bool {
        let all = u32::try_from(self.capacity).unwrap_or(u32::MAX);
        match tokio::time::timeout(limit, self.semaphore.acquire_many(all)).await {
            Ok(Ok(permits)) => {
                drop(permits);
                self.semaphore.close();
                true
            }
            // 信号量已被先前的 drain 关闭，说明早已排空
            Ok(Err(_)) => true,
            Err(_) => false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 当前执行中的任务数
    pub fn in_flight(&self) -> usize {
        self.capacity.saturating_sub(self.semaphore.available_permits())
    }
}

// ---------------------------------------------------------------------------
// BufferPool
// ---------------------------------------------------------------------------

/// 落库批次缓冲池
///
/// 空闲列表的锁只在取出/放回时短暂持有，从不跨越 await。
pub struct BufferPool {
    idle: Mutex<Vec<Vec<ChatMessage>>>,
    max_idle: usize,
    outstanding: AtomicUsize,
}

impl BufferPool {
    pub fn new(max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            max_idle,
            outstanding: AtomicUsize::new(0),
        }
    }

    /// 借出一个空缓冲，守卫 drop 时自动归还
    pub fn acquire(&self) -> PooledBuffer<'_> {
        let buf = self
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(BUFFER_CAPACITY));
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        PooledBuffer { buf, pool: self }
    }

    fn release(&self, mut buf: Vec<ChatMessage>) {
        buf.clear();
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
    }

    /// 空闲缓冲数量
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    /// 已借出未归还的缓冲数量
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// 借出的缓冲
pub struct PooledBuffer<'a> {
    buf: Vec<ChatMessage>,
    pool: &'a BufferPool,
}

impl Deref for PooledBuffer<'_> {
    type Target = Vec<ChatMessage>;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_buffer_returned_on_drop() {
        let pool = BufferPool::new(8);
        {
            let mut buf = pool.acquire();
            buf.push(ChatMessage::new("C1", "u-1", "hi"));
            assert_eq!(pool.outstanding(), 1);
            assert_eq!(pool.idle(), 0);
        }
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.idle(), 1);

        // 复用的缓冲已被清空
        let buf = pool.acquire();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= BUFFER_CAPACITY);
    }

    #[test]
    fn test_idle_list_is_capped() {
        let pool = BufferPool::new(2);
        let bufs: Vec<_> = (0..5).map(|_| pool.acquire()).collect();
        assert_eq!(pool.outstanding(), 5);
        drop(bufs);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_buffer_returned_during_unwind() {
        let pool = BufferPool::new(8);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _buf = pool.acquire();
            panic!("boom");
        }));
        assert!(result.is_err());
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_worker_pool_rejects_when_saturated() {
        let pool = WorkerPool::new(2);
        let gate = Arc::new(Semaphore::new(0));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let gate = Arc::clone(&gate);
                pool.try_submit(async move {
                    let _ = gate.acquire().await;
                })
                .unwrap()
            })
            .collect();

        assert_eq!(pool.in_flight(), 2);
        assert_eq!(
            pool.try_submit(async {}).unwrap_err(),
            PoolError::Saturated { capacity: 2 }
        );

        gate.add_permits(2);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(pool.in_flight(), 0);
        pool.try_submit(async {}).unwrap().await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_pool_releases_permit_on_panic() {
        let pool = WorkerPool::new(1);
        let handle = pool.try_submit(async { panic!("task failed") }).unwrap();
        assert!(handle.await.is_err());
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_worker_pool_closed() {
        let pool = WorkerPool::new(4);
        pool.close();
        assert_eq!(pool.try_submit(async {}).unwrap_err(), PoolError::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_running_tasks() {
        let pool = WorkerPool::new(4);
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        pool.try_submit(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();

        pool.close();
        assert!(pool.drain(Duration::from_secs(5)).await);
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(pool.in_flight(), 0);

        // 再次排空立即返回
        assert!(pool.drain(Duration::from_secs(5)).await);
        assert_eq!(pool.try_submit(async {}).unwrap_err(), PoolError::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_gives_up_after_limit() {
        let pool = WorkerPool::new(2);
        pool.try_submit(tokio::time::sleep(Duration::from_secs(60)))
            .unwrap();
        pool.close();

        let started = tokio::time::Instant::now();
        assert!(!pool.drain(Duration::from_secs(1)).await);
        assert_eq!(started.elapsed(), Duration::from_secs(1));
        assert_eq!(pool.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_drain_idle_pool_returns_immediately() {
        let pool = WorkerPool::new(8);
        pool.close();
        assert!(pool.drain(Duration::ZERO).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_does_not_block() {
        let pool = WorkerPool::new(1);
        let _running = pool
            .try_submit(tokio::time::sleep(Duration::from_secs(60)))
            .unwrap();

        // 池满时提交立即返回，不等待正在执行的任务
        let started = tokio::time::Instant::now();
        assert!(pool.try_submit(async {}).is_err());
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
