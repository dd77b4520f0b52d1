//! 扇出管道集成测试
//!
//! 以内存协作方驱动完整管道，覆盖端到端推送、成员分页、
//! 失败短路、缓冲归还和并发打标。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chat_shared::events::PushPayload;
use fanout_worker::test_utils::{InMemoryStore, StaticEndpointResolver, TestHarness, raw_message};
use fanout_worker::{Dispatcher, FanoutError, FanoutOutcome, PipelineSettings, WorkerPool};
use tokio_test::{assert_err, assert_ok};

fn members(prefix: &str, count: usize) -> Vec<String> {
    (0..count).map(|i| format!("{prefix}{i:03}")).collect()
}

// ============================================================================
// 端到端
// ============================================================================

mod end_to_end {
    use super::*;

    #[tokio::test]
    async fn test_publishes_raw_body_with_flattened_tokens() {
        let h = TestHarness::new(
            InMemoryStore::new().with_members("C1", vec!["u1".to_string(), "u2".to_string()]),
            StaticEndpointResolver::new()
                .with_tokens("u1", &["t1"])
                .with_tokens("u2", &["t2", "t3"]),
        );
        let raw = raw_message("C1", "u1", "hello");

        let outcome = h.pipeline.handle(&raw).await.unwrap();

        assert_eq!(
            outcome,
            FanoutOutcome::Published {
                recipients: 2,
                endpoints: 3
            }
        );

        let stored = h.store.messages();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].is_stamped());
        assert_eq!(stored[0].content, "hello");

        let published = h.publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, stored[0].msg_id);

        let payload: PushPayload = serde_json::from_slice(&published[0].1).unwrap();
        // 负载中是原始字节，不含服务端分配的字段
        assert_eq!(payload.msg, raw);
        let tokens: HashSet<_> = payload.device_tokens.into_iter().collect();
        assert_eq!(
            tokens,
            HashSet::from(["t1".to_string(), "t2".to_string(), "t3".to_string()])
        );
    }

    #[tokio::test]
    async fn test_failed_delivery_does_not_fail_message() {
        let h = TestHarness::new(
            InMemoryStore::new().with_members("C1", vec!["u1".to_string()]),
            StaticEndpointResolver::new().with_tokens("u1", &["t1"]),
        );
        h.publisher.fail_deliveries(true);

        let outcome = assert_ok!(h.pipeline.handle(&raw_message("C1", "u1", "hi")).await);
        assert!(matches!(outcome, FanoutOutcome::Published { .. }));
    }

    #[tokio::test]
    async fn test_chat_without_members_stops_after_persist() {
        let h = TestHarness::new(InMemoryStore::new(), StaticEndpointResolver::new());

        let outcome = h.pipeline.handle(&raw_message("empty", "u1", "hi")).await.unwrap();

        assert_eq!(outcome, FanoutOutcome::NoRecipients);
        assert_eq!(h.store.messages().len(), 1);
        assert_eq!(h.endpoints.calls(), 0);
        assert!(h.publisher.published().is_empty());
    }
}

// ============================================================================
// 成员分页
// ============================================================================

mod paging {
    use super::*;

    #[tokio::test]
    async fn test_120_members_fetch_three_pages() {
        let h = TestHarness::new(
            InMemoryStore::new().with_members("C1", members("u", 120)),
            StaticEndpointResolver::new(),
        );

        h.pipeline.handle(&raw_message("C1", "u000", "hi")).await.unwrap();

        assert_eq!(h.store.page_calls(), vec![(50, 0), (50, 50), (50, 100)]);
    }

    #[tokio::test]
    async fn test_exact_multiple_needs_trailing_empty_page() {
        let h = TestHarness::new(
            InMemoryStore::new().with_members("C1", members("u", 100)),
            StaticEndpointResolver::new(),
        );

        let outcome = h.pipeline.handle(&raw_message("C1", "u000", "hi")).await.unwrap();

        assert_eq!(h.store.page_calls(), vec![(50, 0), (50, 50), (50, 100)]);
        assert_eq!(outcome, FanoutOutcome::NoEndpoints { recipients: 100 });
    }

    #[tokio::test]
    async fn test_custom_page_size() {
        let settings = PipelineSettings {
            member_page_size: 7,
            ..Default::default()
        };
        let h = TestHarness::with_settings(
            InMemoryStore::new().with_members("C1", members("u", 10)),
            StaticEndpointResolver::new(),
            settings,
        );

        h.pipeline.handle(&raw_message("C1", "u000", "hi")).await.unwrap();

        assert_eq!(h.store.page_calls(), vec![(7, 0), (7, 7)]);
    }
}

// ============================================================================
// 设备令牌
// ============================================================================

mod endpoints {
    use super::*;

    #[tokio::test]
    async fn test_users_with_empty_token_lists_contribute_nothing() {
        let h = TestHarness::new(
            InMemoryStore::new().with_members(
                "C1",
                vec!["a".to_string(), "b".to_string(), "c".to_string()],
            ),
            StaticEndpointResolver::new()
                .with_tokens("a", &[])
                .with_tokens("b", &["tb"]),
        );

        h.pipeline.handle(&raw_message("C1", "a", "hi")).await.unwrap();

        let payloads = h.publisher.payloads();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].device_tokens, vec!["tb"]);
    }

    #[tokio::test]
    async fn test_no_tokens_anywhere_publishes_nothing() {
        let h = TestHarness::new(
            InMemoryStore::new().with_members("C1", vec!["a".to_string()]),
            StaticEndpointResolver::new().with_tokens("a", &[]),
        );

        let outcome = h.pipeline.handle(&raw_message("C1", "a", "hi")).await.unwrap();

        assert_eq!(outcome, FanoutOutcome::NoEndpoints { recipients: 1 });
        assert!(h.publisher.published().is_empty());
    }

    #[tokio::test]
    async fn test_endpoint_failure_aborts_without_publish() {
        let h = TestHarness::new(
            InMemoryStore::new().with_members("C1", vec!["a".to_string()]),
            StaticEndpointResolver::new().with_tokens("a", &["ta"]),
        );
        h.endpoints.fail(true);

        let err = h.pipeline.handle(&raw_message("C1", "a", "hi")).await.unwrap_err();

        assert_eq!(err.stage(), "endpoints");
        assert!(h.publisher.published().is_empty());
    }
}

// ============================================================================
// 失败短路
// ============================================================================

mod failures {
    use super::*;

    #[tokio::test]
    async fn test_malformed_input_calls_nothing() {
        let h = TestHarness::new(
            InMemoryStore::new().with_members("C1", vec!["a".to_string()]),
            StaticEndpointResolver::new().with_tokens("a", &["ta"]),
        );

        let err = assert_err!(h.pipeline.handle(b"\x00\x01 not json").await);

        assert!(matches!(err, FanoutError::MalformedMessage(_)));
        assert_eq!(h.store.insert_calls(), 0);
        assert!(h.store.page_calls().is_empty());
        assert_eq!(h.endpoints.calls(), 0);
        assert!(h.publisher.published().is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_skips_everything_downstream() {
        let h = TestHarness::new(
            InMemoryStore::new().with_members("C1", vec!["a".to_string()]),
            StaticEndpointResolver::new().with_tokens("a", &["ta"]),
        );
        h.store.fail_inserts(true);

        let err = assert_err!(h.pipeline.handle(&raw_message("C1", "a", "hi")).await);

        assert_eq!(err.stage(), "persist");
        assert!(h.store.page_calls().is_empty());
        assert_eq!(h.endpoints.calls(), 0);
        assert!(h.publisher.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_times_out() {
        let store = InMemoryStore::new().with_members("C1", vec!["a".to_string()]);
        store.set_insert_delay(Duration::from_secs(31));
        let h = TestHarness::new(store, StaticEndpointResolver::new().with_tokens("a", &["ta"]));

        let err = h.pipeline.handle(&raw_message("C1", "a", "hi")).await.unwrap_err();

        assert!(matches!(err, FanoutError::Timeout { stage: "persist", .. }));
        assert!(h.store.page_calls().is_empty());
        assert_eq!(h.pipeline.buffers().outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_membership_times_out_before_endpoints() {
        let store = InMemoryStore::new().with_members("C1", vec!["a".to_string()]);
        store.set_page_delay(Duration::from_secs(11));
        let h = TestHarness::new(store, StaticEndpointResolver::new().with_tokens("a", &["ta"]));

        let started = tokio::time::Instant::now();
        let err = assert_err!(h.pipeline.handle(&raw_message("C1", "a", "hi")).await);

        assert!(matches!(err, FanoutError::Timeout { stage: "membership", .. }));
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        // 消息已落库，但不再查询令牌和发布
        assert_eq!(h.store.messages().len(), 1);
        assert_eq!(h.store.page_calls(), vec![(50, 0)]);
        assert_eq!(h.endpoints.calls(), 0);
        assert!(h.publisher.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_endpoint_lookup_times_out_without_publish() {
        let endpoints = StaticEndpointResolver::new().with_tokens("a", &["ta"]);
        endpoints.set_delay(Duration::from_secs(11));
        let h = TestHarness::new(
            InMemoryStore::new().with_members("C1", vec!["a".to_string()]),
            endpoints,
        );

        let started = tokio::time::Instant::now();
        let err = assert_err!(h.pipeline.handle(&raw_message("C1", "a", "hi")).await);

        assert!(matches!(err, FanoutError::Timeout { stage: "endpoints", .. }));
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert_eq!(h.endpoints.calls(), 1);
        assert!(h.publisher.published().is_empty());
        assert_eq!(h.pipeline.buffers().outstanding(), 0);
    }
}

// ============================================================================
// 资源与并发
// ============================================================================

mod resources {
    use super::*;

    #[tokio::test]
    async fn test_buffers_returned_after_mixed_runs() {
        let h = TestHarness::new(
            InMemoryStore::new().with_members("C1", vec!["a".to_string()]),
            StaticEndpointResolver::new().with_tokens("a", &["ta"]),
        );

        let _ = h.pipeline.handle(&raw_message("C1", "a", "ok")).await;
        let _ = h.pipeline.handle(b"garbage").await;
        h.store.fail_inserts(true);
        let _ = h.pipeline.handle(&raw_message("C1", "a", "fails")).await;

        assert_eq!(h.pipeline.buffers().outstanding(), 0);
        // 顺序执行只会用到同一个缓冲
        assert_eq!(h.pipeline.buffers().idle(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_messages_get_unique_ids_and_seqs() {
        let h = TestHarness::new(
            InMemoryStore::new().with_members("C1", vec!["a".to_string()]),
            StaticEndpointResolver::new().with_tokens("a", &["ta"]),
        );
        let pipeline = Arc::clone(&h.pipeline);

        let handles: Vec<_> = (0..200)
            .map(|i| {
                let pipeline = Arc::clone(&pipeline);
                tokio::spawn(async move {
                    pipeline
                        .handle(&raw_message("C1", "a", &format!("m{i}")))
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stored = h.store.messages();
        assert_eq!(stored.len(), 200);
        let ids: HashSet<_> = stored.iter().map(|m| m.id).collect();
        let seqs: HashSet<_> = stored.iter().map(|m| m.seq).collect();
        assert_eq!(ids.len(), 200);
        assert_eq!(seqs.len(), 200);
        assert_eq!(h.pipeline.buffers().outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatcher_drops_when_saturated() {
        let store = InMemoryStore::new().with_members("C1", vec!["a".to_string()]);
        store.set_insert_delay(Duration::from_secs(1));
        let h = TestHarness::new(store, StaticEndpointResolver::new().with_tokens("a", &["ta"]));
        let dispatcher = Dispatcher::new(Arc::clone(&h.pipeline), WorkerPool::new(2));

        let outcomes: Vec<_> = (0..5)
            .map(|i| dispatcher.dispatch(Ok(raw_message("C1", "a", &format!("m{i}")))))
            .collect();
        let submitted = outcomes
            .iter()
            .filter(|o| **o == fanout_worker::DispatchOutcome::Submitted)
            .count();
        assert_eq!(submitted, 2);

        tokio::time::sleep(Duration::from_secs(2)).await;
        while dispatcher.pool().in_flight() > 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.publisher.published().len(), 2);
    }
}
