//! Integration tests for the stateful processors: aggregator, idempotent
//! consumer, and resequencer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use rf_core::processor::header_expression;
use rf_core::{propkeys, Exchange, Message, Processor, Result, RouteflowError};
use rf_processor::{
    AggregateConfig, AggregateProcessor, AggregationStrategy, IdempotentConfig,
    IdempotentConsumer, InMemoryIdempotentRepository, NumericSequenceComparator,
    BatchResequencer, StreamResequencer,
};

/// Terminal processor recording every exchange it sees.
#[derive(Default)]
struct Recorder {
    exchanges: Mutex<Vec<Exchange>>,
}

impl Recorder {
    fn received(&self) -> Vec<Exchange> {
        self.exchanges.lock().clone()
    }

    fn count(&self) -> usize {
        self.exchanges.lock().len()
    }

    fn bodies(&self) -> Vec<String> {
        self.exchanges
            .lock()
            .iter()
            .map(|e| e.current().body().unwrap().get::<String>().unwrap())
            .collect()
    }

    fn sequences(&self) -> Vec<i64> {
        self.exchanges
            .lock()
            .iter()
            .map(|e| e.current().headers.get_as::<i64>("seq").unwrap())
            .collect()
    }

    async fn await_count(&self, expected: usize, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while self.count() < expected {
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {expected} exchanges, got {}",
                self.count()
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl Processor for Recorder {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        self.exchanges.lock().push(exchange.clone());
        Ok(())
    }
}

/// Concatenates string bodies with '+'; fails on a body of "bad".
#[derive(Default)]
struct ConcatStrategy {
    invocations: AtomicUsize,
}

impl AggregationStrategy for ConcatStrategy {
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> Result<Exchange> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let new_body: String = new.current().body().unwrap().get().unwrap();
        if new_body == "bad" {
            return Err(RouteflowError::permanent("strategy rejected exchange"));
        }
        match old {
            None => Ok(new),
            Some(mut group) => {
                let old_body: String = group.current().body().unwrap().get().unwrap();
                group
                    .current_mut()
                    .set_body(format!("{old_body}+{new_body}"));
                Ok(group)
            }
        }
    }
}

fn keyed_exchange(key: &str, body: &str) -> Exchange {
    let mut message = Message::with_body(body);
    message.headers.set("group", key);
    Exchange::new(message)
}

fn sequenced_exchange(seq: i64) -> Exchange {
    let mut message = Message::with_body(format!("msg-{seq}"));
    message.headers.set("seq", seq);
    Exchange::new(message)
}

#[tokio::test]
async fn aggregator_completes_by_size_with_one_merge_per_input() {
    let recorder = Arc::new(Recorder::default());
    let strategy = Arc::new(ConcatStrategy::default());
    let config =
        AggregateConfig::new(header_expression("group")).completion_size(3);
    let aggregator =
        AggregateProcessor::new(config, strategy.clone(), recorder.clone()).unwrap();

    for body in ["a", "b", "c"] {
        let mut exchange = keyed_exchange("orders", body);
        aggregator.process(&mut exchange).await.unwrap();
    }

    // Exactly one strategy application per input exchange.
    assert_eq!(strategy.invocations.load(Ordering::SeqCst), 3);

    let received = recorder.received();
    assert_eq!(received.len(), 1);
    let emitted = &received[0];
    assert_eq!(
        emitted.current().body().unwrap().get::<String>().as_deref(),
        Some("a+b+c")
    );
    assert_eq!(
        emitted.property_as::<i64>(propkeys::AGGREGATED_SIZE),
        Some(3)
    );
    assert_eq!(
        emitted
            .property_as::<String>(propkeys::AGGREGATED_COMPLETED_BY)
            .as_deref(),
        Some("size")
    );
}

#[tokio::test]
async fn aggregator_times_out_via_background_sweep() {
    let recorder = Arc::new(Recorder::default());
    let strategy = Arc::new(ConcatStrategy::default());
    let config = AggregateConfig::new(header_expression("group"))
        .completion_timeout(Duration::from_millis(50))
        .sweep_interval(Duration::from_millis(10));
    let aggregator =
        AggregateProcessor::new(config, strategy, recorder.clone()).unwrap();
    aggregator.start().await.unwrap();

    let mut first = keyed_exchange("slow", "x");
    aggregator.process(&mut first).await.unwrap();
    let mut second = keyed_exchange("slow", "y");
    aggregator.process(&mut second).await.unwrap();

    recorder.await_count(1, Duration::from_secs(2)).await;
    let emitted = &recorder.received()[0];
    assert_eq!(
        emitted.current().body().unwrap().get::<String>().as_deref(),
        Some("x+y")
    );
    assert_eq!(
        emitted
            .property_as::<String>(propkeys::AGGREGATED_COMPLETED_BY)
            .as_deref(),
        Some("timeout")
    );

    aggregator.stop().await;
}

#[tokio::test]
async fn aggregator_strategy_failure_leaves_group_unmodified() {
    let recorder = Arc::new(Recorder::default());
    let strategy = Arc::new(ConcatStrategy::default());
    let config =
        AggregateConfig::new(header_expression("group")).completion_size(2);
    let aggregator =
        AggregateProcessor::new(config, strategy, recorder.clone()).unwrap();

    let mut good = keyed_exchange("k", "a");
    aggregator.process(&mut good).await.unwrap();

    let mut bad = keyed_exchange("k", "bad");
    assert!(aggregator.process(&mut bad).await.is_err());
    // The failing exchange was not merged; the group still needs one more.
    assert_eq!(recorder.count(), 0);

    let mut good = keyed_exchange("k", "b");
    aggregator.process(&mut good).await.unwrap();

    assert_eq!(recorder.bodies(), vec!["a+b".to_string()]);
}

#[tokio::test]
async fn aggregator_force_complete_emits_partial_group() {
    let recorder = Arc::new(Recorder::default());
    let strategy = Arc::new(ConcatStrategy::default());
    let config =
        AggregateConfig::new(header_expression("group")).completion_size(100);
    let aggregator =
        AggregateProcessor::new(config, strategy, recorder.clone()).unwrap();

    let mut exchange = keyed_exchange("partial", "only");
    aggregator.process(&mut exchange).await.unwrap();

    assert!(aggregator.force_complete("partial").await.unwrap());
    assert!(!aggregator.force_complete("partial").await.unwrap());

    let emitted = &recorder.received()[0];
    assert_eq!(
        emitted
            .property_as::<String>(propkeys::AGGREGATED_COMPLETED_BY)
            .as_deref(),
        Some("force")
    );
}

#[tokio::test]
async fn aggregator_completes_group_when_marker_property_set() {
    let recorder = Arc::new(Recorder::default());
    let strategy = Arc::new(ConcatStrategy::default());
    let config =
        AggregateConfig::new(header_expression("group")).completion_size(100);
    let aggregator =
        AggregateProcessor::new(config, strategy, recorder.clone()).unwrap();

    let mut first = keyed_exchange("orders", "a");
    aggregator.process(&mut first).await.unwrap();
    assert_eq!(recorder.count(), 0);

    let mut last = keyed_exchange("orders", "b");
    last.set_property(propkeys::AGGREGATION_COMPLETE_GROUP, true);
    aggregator.process(&mut last).await.unwrap();

    let emitted = &recorder.received()[0];
    assert_eq!(
        emitted.current().body().unwrap().get::<String>().as_deref(),
        Some("a+b")
    );
    assert_eq!(
        emitted
            .property_as::<String>(propkeys::AGGREGATED_COMPLETED_BY)
            .as_deref(),
        Some("force")
    );
}

/// Child processor that fails its first `fail_first` invocations.
struct FlakyChild {
    calls: AtomicUsize,
    fail_first: usize,
}

#[async_trait]
impl Processor for FlakyChild {
    async fn process(&self, _exchange: &mut Exchange) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            Err(RouteflowError::transient("downstream unavailable"))
        } else {
            Ok(())
        }
    }
}

#[tokio::test]
async fn idempotent_passes_once_and_suppresses_duplicate() {
    let recorder = Arc::new(Recorder::default());
    let repository = Arc::new(InMemoryIdempotentRepository::new(100));
    let consumer = IdempotentConsumer::new(
        IdempotentConfig::new(header_expression("group")),
        repository,
        recorder.clone(),
    );

    let mut first = keyed_exchange("msg-1", "payload");
    consumer.process(&mut first).await.unwrap();

    let mut second = keyed_exchange("msg-1", "payload");
    consumer.process(&mut second).await.unwrap();

    assert_eq!(recorder.count(), 1);
    assert_eq!(second.property_as::<bool>(propkeys::DUPLICATE_MESSAGE), Some(true));
}

#[tokio::test]
async fn idempotent_rolls_back_tentative_mark_on_failure() {
    let child = Arc::new(FlakyChild {
        calls: AtomicUsize::new(0),
        fail_first: 1,
    });
    let repository = Arc::new(InMemoryIdempotentRepository::new(100));
    let consumer = IdempotentConsumer::new(
        IdempotentConfig::new(header_expression("group")),
        repository.clone(),
        child.clone(),
    );

    let mut attempt = keyed_exchange("msg-7", "payload");
    assert!(consumer.process(&mut attempt).await.is_err());
    // The failed attempt must not leave the key marked.
    assert!(!rf_core::IdempotentRepository::contains(&*repository, "msg-7")
        .await
        .unwrap());

    let mut retry = keyed_exchange("msg-7", "payload");
    consumer.process(&mut retry).await.unwrap();
    assert_eq!(child.calls.load(Ordering::SeqCst), 2);

    let mut duplicate = keyed_exchange("msg-7", "payload");
    consumer.process(&mut duplicate).await.unwrap();
    assert_eq!(child.calls.load(Ordering::SeqCst), 2);
}

/// Repository whose backing store is down.
struct BrokenRepository;

#[async_trait]
impl rf_core::IdempotentRepository for BrokenRepository {
    async fn add(&self, _key: &str) -> Result<bool> {
        Err(RouteflowError::Repository("store unavailable".to_string()))
    }
    async fn contains(&self, _key: &str) -> Result<bool> {
        Err(RouteflowError::Repository("store unavailable".to_string()))
    }
    async fn confirm(&self, _key: &str) -> Result<bool> {
        Err(RouteflowError::Repository("store unavailable".to_string()))
    }
    async fn remove(&self, _key: &str) -> Result<bool> {
        Err(RouteflowError::Repository("store unavailable".to_string()))
    }
}

#[tokio::test]
async fn idempotent_fails_open_when_repository_is_down() {
    let recorder = Arc::new(Recorder::default());
    let consumer = IdempotentConsumer::new(
        IdempotentConfig::new(header_expression("group")),
        Arc::new(BrokenRepository),
        recorder.clone(),
    );

    let mut exchange = keyed_exchange("msg-9", "payload");
    consumer.process(&mut exchange).await.unwrap();
    assert_eq!(recorder.count(), 1);
}

#[tokio::test]
async fn stream_resequencer_reorders_out_of_order_arrivals() {
    let recorder = Arc::new(Recorder::default());
    let comparator = Arc::new(NumericSequenceComparator::with_start(
        header_expression("seq"),
        1,
    ));
    let resequencer =
        StreamResequencer::new(comparator, Duration::from_secs(30), recorder.clone());

    for seq in [3, 1, 2] {
        let mut exchange = sequenced_exchange(seq);
        resequencer.process(&mut exchange).await.unwrap();
    }

    assert_eq!(recorder.sequences(), vec![1, 2, 3]);
    assert_eq!(resequencer.pending_count(), 0);
}

#[tokio::test]
async fn stream_resequencer_times_out_gaps_without_blocking() {
    let recorder = Arc::new(Recorder::default());
    let comparator = Arc::new(NumericSequenceComparator::with_start(
        header_expression("seq"),
        1,
    ));
    let resequencer = StreamResequencer::new(
        comparator,
        Duration::from_millis(50),
        recorder.clone(),
    );
    resequencer.start().await.unwrap();

    let mut first = sequenced_exchange(1);
    resequencer.process(&mut first).await.unwrap();
    // 1 starts the sequence: emitted immediately.
    assert_eq!(recorder.sequences(), vec![1]);

    let mut third = sequenced_exchange(3);
    resequencer.process(&mut third).await.unwrap();
    // 2 is missing; 3 is held until its timeout forces emission.
    assert_eq!(recorder.count(), 1);

    recorder.await_count(2, Duration::from_secs(2)).await;
    assert_eq!(recorder.sequences(), vec![1, 3]);

    // The straggler arrives after the gap was given up on: emitted exactly
    // once, immediately, never again by the sweep.
    let mut second = sequenced_exchange(2);
    resequencer.process(&mut second).await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(recorder.sequences(), vec![1, 3, 2]);

    resequencer.stop().await;
}

#[tokio::test]
async fn batch_resequencer_sorts_full_window() {
    let recorder = Arc::new(Recorder::default());
    let comparator = Arc::new(NumericSequenceComparator::new(header_expression("seq")));
    let resequencer = BatchResequencer::new(
        comparator,
        3,
        Duration::from_secs(30),
        recorder.clone(),
    )
    .unwrap();

    for seq in [2, 3, 1] {
        let mut exchange = sequenced_exchange(seq);
        resequencer.process(&mut exchange).await.unwrap();
    }

    assert_eq!(recorder.sequences(), vec![1, 2, 3]);
}

#[tokio::test]
async fn batch_resequencer_flushes_partial_window_on_timeout() {
    let recorder = Arc::new(Recorder::default());
    let comparator = Arc::new(NumericSequenceComparator::new(header_expression("seq")));
    let resequencer = BatchResequencer::new(
        comparator,
        10,
        Duration::from_millis(50),
        recorder.clone(),
    )
    .unwrap();
    resequencer.start().await.unwrap();

    for seq in [2, 1] {
        let mut exchange = sequenced_exchange(seq);
        resequencer.process(&mut exchange).await.unwrap();
    }
    assert_eq!(recorder.count(), 0);

    recorder.await_count(2, Duration::from_secs(2)).await;
    assert_eq!(recorder.sequences(), vec![1, 2]);

    resequencer.stop().await;
}
