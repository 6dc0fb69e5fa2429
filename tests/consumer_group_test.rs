//! 消费者组生命周期测试
//!
//! 使用脚本化的模拟客户端代替 broker：每个脚本会话交付一批消息后结束（模拟再均衡），
//! 脚本用完后会话一直持续到上下文被取消。

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use uranus_core::error::{FatalPhase, UranusError};
use uranus_core::kafka::{
    ClientError, ConsumerGroupConfig, ConsumerGroupHandler, ConsumerGroupManager, ConsumerRecord,
    ConsumerState, GroupClient, GroupSession, HandlerError, MessageHandler, PartitionClaim,
    handler_fn,
};
use uranus_core::runtime::{ServiceHost, ShutdownPolicy};

type Marks = Arc<Mutex<Vec<(String, i32, i64)>>>;

struct MockSession {
    generation: i32,
    ctx: CancellationToken,
    marks: Marks,
}

impl GroupSession for MockSession {
    fn member_id(&self) -> &str {
        "member-1"
    }

    fn generation_id(&self) -> i32 {
        self.generation
    }

    fn context(&self) -> &CancellationToken {
        &self.ctx
    }

    fn mark_record(&self, record: &ConsumerRecord) {
        self.marks
            .lock()
            .unwrap()
            .push((record.topic.clone(), record.partition, record.offset));
    }
}

#[derive(Default)]
struct MockClient {
    scripts: Mutex<VecDeque<Vec<ConsumerRecord>>>,
    marks: Marks,
    consume_calls: AtomicUsize,
    active_sessions: AtomicUsize,
    max_active_sessions: AtomicUsize,
    pause_calls: Mutex<Vec<&'static str>>,
    close_calls: AtomicUsize,
    completed_claims: AtomicUsize,
    fail_close: bool,
    fail_session: bool,
}

impl MockClient {
    fn with_sessions(sessions: Vec<Vec<ConsumerRecord>>) -> Self {
        Self {
            scripts: Mutex::new(sessions.into()),
            ..Self::default()
        }
    }

    fn marks(&self) -> Vec<(String, i32, i64)> {
        self.marks.lock().unwrap().clone()
    }
}

#[async_trait]
impl GroupClient for MockClient {
    async fn consume(
        &self,
        _topics: &[String],
        shutdown: &CancellationToken,
        handler: Arc<dyn ConsumerGroupHandler>,
    ) -> Result<(), ClientError> {
        let generation = self.consume_calls.fetch_add(1, Ordering::SeqCst) as i32 + 1;
        let active = self.active_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_sessions.fetch_max(active, Ordering::SeqCst);

        if self.fail_session {
            self.active_sessions.fetch_sub(1, Ordering::SeqCst);
            return Err(ClientError::Broker("coordinator not available".into()));
        }

        let ctx = shutdown.child_token();
        let session: Arc<dyn GroupSession> = Arc::new(MockSession {
            generation,
            ctx: ctx.clone(),
            marks: self.marks.clone(),
        });
        handler.setup(session.clone()).await.unwrap();

        let script = self.scripts.lock().unwrap().pop_front();
        match script {
            Some(records) => {
                let mut partitions: BTreeMap<(String, i32), Vec<ConsumerRecord>> = BTreeMap::new();
                for record in records {
                    partitions
                        .entry((record.topic.clone(), record.partition))
                        .or_default()
                        .push(record);
                }
                let claims = partitions.into_iter().map(|((topic, partition), records)| {
                    let (tx, rx) = mpsc::channel(records.len().max(1));
                    let first_offset = records.first().map(|r| r.offset).unwrap_or_default();
                    for record in records {
                        tx.try_send(record).unwrap();
                    }
                    drop(tx);
                    let claim = PartitionClaim::new(topic, partition, first_offset, rx);
                    handler.consume_claim(session.clone(), claim)
                });
                for result in join_all(claims).await {
                    result.unwrap();
                    self.completed_claims.fetch_add(1, Ordering::SeqCst);
                }
            }
            None => ctx.cancelled().await,
        }

        handler.cleanup(session).await.unwrap();
        self.active_sessions.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn pause_all(&self) {
        self.pause_calls.lock().unwrap().push("pause");
    }

    fn resume_all(&self) {
        self.pause_calls.lock().unwrap().push("resume");
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(ClientError::Broker("leave group failed".into()));
        }
        Ok(())
    }
}

fn config(topics: &[&str]) -> ConsumerGroupConfig {
    ConsumerGroupConfig::new(["localhost:9092"], topics.iter().copied(), "uranus", "roundrobin", "oldest")
        .unwrap()
}

async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

struct Recording {
    seen: Arc<Mutex<Vec<(String, String)>>>,
    marks: Marks,
    marked_before_handle: Arc<Mutex<Vec<bool>>>,
    fail_offsets: Vec<i64>,
}

#[async_trait]
impl MessageHandler for Recording {
    async fn handle_message(&self, record: &ConsumerRecord) -> Result<(), HandlerError> {
        let marked = self
            .marks
            .lock()
            .unwrap()
            .contains(&(record.topic.clone(), record.partition, record.offset));
        self.marked_before_handle.lock().unwrap().push(marked);
        self.seen
            .lock()
            .unwrap()
            .push((record.topic.clone(), record.value_str().into_owned()));
        if self.fail_offsets.contains(&record.offset) {
            return Err(format!("cannot process offset {}", record.offset).into());
        }
        Ok(())
    }
}

#[tokio::test]
async fn rebalance_requests_exactly_one_new_session() {
    let client = Arc::new(MockClient::with_sessions(vec![Vec::new()]));
    let manager = Arc::new(
        ConsumerGroupManager::builder(config(&["orders"]), client.clone())
            .pause_on_user_signal(false)
            .build(),
    );
    let shutdown = CancellationToken::new();
    let running = tokio::spawn({
        let manager = manager.clone();
        let shutdown = shutdown.clone();
        async move { manager.run(shutdown).await }
    });

    eventually(|| client.consume_calls.load(Ordering::SeqCst) == 2).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(client.consume_calls.load(Ordering::SeqCst), 2);
    assert_eq!(manager.sessions_requested(), 2);
    assert!(!running.is_finished());
    assert!(manager.ready().is_closed());
    assert_eq!(manager.state(), ConsumerState::Ready);

    shutdown.cancel();
    running.await.unwrap().unwrap();
    assert_eq!(client.max_active_sessions.load(Ordering::SeqCst), 1);
    assert_eq!(client.close_calls.load(Ordering::SeqCst), 1);
    assert_eq!(manager.state(), ConsumerState::Closed);
}

#[tokio::test]
async fn offsets_are_committed_once_even_when_handler_fails() {
    let records = vec![
        ConsumerRecord::new("orders", 0, 10, "a"),
        ConsumerRecord::new("orders", 0, 11, "b"),
        ConsumerRecord::new("orders", 0, 12, "c"),
        ConsumerRecord::new("audit", 1, 3, "unhandled"),
    ];
    let client = Arc::new(MockClient::with_sessions(vec![records]));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let marked_before_handle = Arc::new(Mutex::new(Vec::new()));
    let failures = Arc::new(Mutex::new(Vec::new()));

    let manager = ConsumerGroupManager::builder(config(&["orders", "audit"]), client.clone())
        .pause_on_user_signal(false)
        .register_handler(
            "orders",
            Recording {
                seen: seen.clone(),
                marks: client.marks.clone(),
                marked_before_handle: marked_before_handle.clone(),
                fail_offsets: vec![11],
            },
        )
        .on_error({
            let failures = failures.clone();
            move |record: &ConsumerRecord, err: HandlerError| {
                failures.lock().unwrap().push((record.offset, err.to_string()));
            }
        })
        .build();

    let shutdown = CancellationToken::new();
    let run = manager.run(shutdown.clone());
    tokio::pin!(run);
    tokio::select! {
        result = &mut run => panic!("manager exited early: {result:?}"),
        _ = eventually(|| client.consume_calls.load(Ordering::SeqCst) == 2) => {}
    }
    shutdown.cancel();
    run.await.unwrap();

    let mut marks = client.marks();
    marks.sort();
    assert_eq!(
        marks,
        vec![
            ("audit".to_string(), 1, 3),
            ("orders".to_string(), 0, 10),
            ("orders".to_string(), 0, 11),
            ("orders".to_string(), 0, 12),
        ]
    );
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            ("orders".to_string(), "a".to_string()),
            ("orders".to_string(), "b".to_string()),
            ("orders".to_string(), "c".to_string()),
        ]
    );
    assert_eq!(*marked_before_handle.lock().unwrap(), vec![true, true, true]);
    assert_eq!(
        *failures.lock().unwrap(),
        vec![(11, "cannot process offset 11".to_string())]
    );
}

#[tokio::test]
async fn orders_handler_observes_delivered_message() {
    let client = Arc::new(MockClient::with_sessions(vec![vec![ConsumerRecord::new(
        "orders", 0, 0, "x",
    )]]));
    let observed = Arc::new(Mutex::new(Vec::new()));
    let received = Arc::new(AtomicUsize::new(0));

    let manager = ConsumerGroupManager::builder(config(&["orders"]), client.clone())
        .pause_on_user_signal(false)
        .register_handler(
            "orders",
            handler_fn({
                let observed = observed.clone();
                move |record: ConsumerRecord| {
                    let observed = observed.clone();
                    async move {
                        observed
                            .lock()
                            .unwrap()
                            .push((record.topic.clone(), record.value_str().into_owned()));
                        Err::<(), HandlerError>("downstream unavailable".into())
                    }
                }
            }),
        )
        .on_receive({
            let received = received.clone();
            move |_record: &ConsumerRecord| {
                received.fetch_add(1, Ordering::SeqCst);
            }
        })
        .on_error(|_record: &ConsumerRecord, _err: HandlerError| {})
        .build();

    let shutdown = CancellationToken::new();
    let run = manager.run(shutdown.clone());
    tokio::pin!(run);
    tokio::select! {
        result = &mut run => panic!("manager exited early: {result:?}"),
        _ = eventually(|| !client.marks().is_empty()) => {}
    }
    shutdown.cancel();
    run.await.unwrap();

    assert_eq!(
        *observed.lock().unwrap(),
        vec![("orders".to_string(), "x".to_string())]
    );
    assert_eq!(client.marks(), vec![("orders".to_string(), 0, 0)]);
    assert_eq!(received.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn pause_signal_toggles() {
    let client = Arc::new(MockClient::default());
    let manager = ConsumerGroupManager::builder(config(&["orders"]), client.clone())
        .pause_on_user_signal(false)
        .build();

    assert!(!manager.is_paused());
    for n in 1..=5 {
        manager.toggle_pause();
        assert_eq!(manager.is_paused(), n % 2 == 1, "after {n} signals");
    }
    assert_eq!(
        *client.pause_calls.lock().unwrap(),
        vec!["pause", "resume", "pause", "resume", "pause"]
    );
}

#[tokio::test]
async fn readiness_gate_closes_on_first_session_only() {
    let client = Arc::new(MockClient::with_sessions(vec![Vec::new(), Vec::new(), Vec::new()]));
    let manager = Arc::new(
        ConsumerGroupManager::builder(config(&["orders"]), client.clone())
            .pause_on_user_signal(false)
            .build(),
    );
    let ready = manager.ready();
    assert!(!ready.is_closed());

    let shutdown = CancellationToken::new();
    let running = tokio::spawn({
        let manager = manager.clone();
        let shutdown = shutdown.clone();
        async move { manager.run(shutdown).await }
    });

    tokio::time::timeout(Duration::from_secs(5), ready.wait())
        .await
        .expect("consumer never became ready");
    eventually(|| client.consume_calls.load(Ordering::SeqCst) == 4).await;
    assert!(ready.is_closed());
    assert!(!ready.close());

    shutdown.cancel();
    running.await.unwrap().unwrap();

    let second_run = manager.run(CancellationToken::new()).await;
    assert!(matches!(second_run, Err(UranusError::InvalidConfig(_))));
}

#[tokio::test]
async fn close_failure_is_fatal() {
    let client = Arc::new(MockClient {
        fail_close: true,
        ..MockClient::default()
    });
    let manager = ConsumerGroupManager::builder(config(&["orders"]), client.clone())
        .pause_on_user_signal(false)
        .build();

    let shutdown = CancellationToken::new();
    shutdown.cancel();
    let err = manager.run(shutdown).await.unwrap_err();

    assert!(matches!(err, UranusError::ClientClose(_)));
    assert_eq!(err.phase(), FatalPhase::Shutdown);
    assert_eq!(client.close_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn session_error_is_fatal_and_still_closes() {
    let client = Arc::new(MockClient {
        fail_session: true,
        ..MockClient::default()
    });
    let manager = ConsumerGroupManager::builder(config(&["orders"]), client.clone())
        .pause_on_user_signal(false)
        .build();

    let err = manager.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, UranusError::Session(_)));
    assert_eq!(client.consume_calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.close_calls.load(Ordering::SeqCst), 1);
    assert_eq!(manager.state(), ConsumerState::Closed);
}

#[tokio::test]
async fn manager_runs_as_hosted_task() {
    let client = Arc::new(MockClient::default());
    let manager = Arc::new(
        ConsumerGroupManager::builder(config(&["orders"]), client.clone())
            .pause_on_user_signal(false)
            .build(),
    );
    let ready = manager.ready();

    ServiceHost::builder()
        .with_graceful_shutdown(
            ShutdownPolicy::default()
                .with_drain_wait(Duration::from_millis(10))
                .with_delay(Duration::ZERO),
        )
        .with_task(Box::new(manager.clone()))
        .build()
        .run_until(async move { ready.wait().await })
        .await
        .unwrap();

    assert_eq!(client.close_calls.load(Ordering::SeqCst), 1);
    assert_eq!(manager.state(), ConsumerState::Closed);
}

#[tokio::test]
async fn stuck_handler_does_not_hold_up_shutdown() {
    let client = Arc::new(MockClient::with_sessions(vec![vec![ConsumerRecord::new(
        "orders", 0, 7, "slow",
    )]]));
    let started = Arc::new(AtomicUsize::new(0));

    let manager = Arc::new(
        ConsumerGroupManager::builder(config(&["orders"]), client.clone())
            .pause_on_user_signal(false)
            .register_handler(
                "orders",
                handler_fn({
                    let started = started.clone();
                    move |_record: ConsumerRecord| {
                        started.fetch_add(1, Ordering::SeqCst);
                        std::future::pending::<Result<(), HandlerError>>()
                    }
                }),
            )
            .build(),
    );

    let shutdown = CancellationToken::new();
    let running = tokio::spawn({
        let manager = manager.clone();
        let shutdown = shutdown.clone();
        async move { manager.run(shutdown).await }
    });

    eventually(|| started.load(Ordering::SeqCst) == 1).await;
    assert_eq!(client.completed_claims.load(Ordering::SeqCst), 0);
    shutdown.cancel();

    tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .expect("manager did not return after cancellation")
        .unwrap()
        .unwrap();
    assert_eq!(client.marks(), vec![("orders".to_string(), 0, 7)]);
    assert_eq!(client.completed_claims.load(Ordering::SeqCst), 1);
    assert_eq!(client.close_calls.load(Ordering::SeqCst), 1);
}
