//! End-to-end broadcast delivery scenarios

mod common;

use common::{ subscriber, wait_until, LONG_WAIT, SETTLE };
use riffle::{ BroadcastProcessor, ProcessorConfig, RiffleError, WaitStrategyKind };

fn processor(buffer_size: usize) -> BroadcastProcessor<u64> {
    BroadcastProcessor::create(
        ProcessorConfig::new("bcast")
            .with_buffer_size(buffer_size)
            .unwrap()
            .with_wait_strategy(WaitStrategyKind::Yielding)
    ).unwrap()
}

#[test]
fn two_subscribers_see_every_event_in_order() {
    let processor = processor(8);
    let (first, first_handle) = subscriber::<u64>(i64::MAX).build();
    let (second, second_handle) = subscriber::<u64>(i64::MAX).build();
    processor.subscribe(first).unwrap();
    processor.subscribe(second).unwrap();

    for value in 0..1000u64 {
        processor.publish(value).unwrap();
    }
    processor.complete();

    assert!(
        wait_until(LONG_WAIT, || {
            first_handle.completions() == 1 && second_handle.completions() == 1
        })
    );

    let expected: Vec<u64> = (0..1000).collect();
    assert_eq!(first_handle.received(), expected);
    assert_eq!(second_handle.received(), expected);
    assert!(first_handle.errors().is_empty());

    processor.await_termination();
}

#[test]
fn single_slot_buffer_still_conveys_everything() {
    let processor = processor(1);
    let (sub, handle) = subscriber::<u64>(i64::MAX).build();
    processor.subscribe(sub).unwrap();

    for value in 0..50u64 {
        processor.publish(value).unwrap();
    }
    processor.complete();

    assert!(wait_until(LONG_WAIT, || handle.completions() == 1));
    assert_eq!(handle.received(), (0..50).collect::<Vec<u64>>());
    processor.await_termination();
}

#[test]
fn producer_error_reaches_every_subscriber_after_drain() {
    let processor = processor(32);
    let handles: Vec<_> = (0..3)
        .map(|_| {
            let (sub, handle) = subscriber::<u64>(i64::MAX).build();
            processor.subscribe(sub).unwrap();
            handle
        })
        .collect();

    for value in 0..10u64 {
        processor.publish(value).unwrap();
    }
    processor.error(RiffleError::state("upstream failed"));

    assert!(wait_until(LONG_WAIT, || handles.iter().all(|h| h.errors().len() == 1)));
    for handle in &handles {
        assert_eq!(handle.received(), (0..10).collect::<Vec<u64>>());
        assert_eq!(handle.completions(), 0);
        assert!(handle.errors()[0].contains("upstream failed"));
    }
    processor.await_termination();
}

#[test]
fn cancel_mid_stream_releases_the_producer() {
    let processor = processor(8);
    let (sub, handle) = subscriber::<u64>(i64::MAX).cancel_after(42).build();
    processor.subscribe(sub).unwrap();

    // The producer would block forever on a full ring if the cancelled
    // subscriber kept gating it
    let producer = {
        let processor = processor.clone();
        std::thread::spawn(move || {
            for value in 0..1000u64 {
                if processor.publish(value).is_err() {
                    break;
                }
            }
        })
    };

    producer.join().unwrap();

    // At most one in-flight delivery after the cancelling one
    let received = handle.received();
    assert!(received.len() >= 42);
    assert!(received.len() <= 43, "got {} deliveries after cancel", received.len());
    std::thread::sleep(SETTLE);
    assert_eq!(handle.received_len(), received.len());
    assert_eq!(handle.completions(), 0);
    assert!(handle.errors().is_empty());

    processor.complete();
    processor.await_termination();
}

#[test]
fn late_subscriber_after_completion_gets_terminal_only() {
    let processor = processor(8);
    processor.publish(1).unwrap();
    processor.complete();

    let (sub, handle) = subscriber::<u64>(i64::MAX).build();
    processor.subscribe(sub).unwrap();

    assert!(wait_until(LONG_WAIT, || handle.completions() == 1));
    assert!(handle.received().is_empty());
    processor.await_termination();
}

#[test]
fn failing_subscriber_is_cancelled_and_told_why() {
    let processor = processor(8);
    let (sub, handle) = subscriber::<u64>(i64::MAX)
        .fail_when(|value| *value == 3)
        .build();
    processor.subscribe(sub).unwrap();

    for value in 0..10u64 {
        processor.publish(value).unwrap();
    }

    assert!(wait_until(LONG_WAIT, || handle.errors().len() == 1));
    assert_eq!(handle.received(), vec![0, 1, 2]);
    // The routed error names the offending value
    assert!(handle.errors()[0].contains('3'));
    assert_eq!(handle.completions(), 0);

    processor.complete();
    processor.await_termination();
}

#[test]
fn panicking_subscriber_reaches_uncaught_handler() {
    use std::sync::atomic::{ AtomicUsize, Ordering };
    use std::sync::Arc;

    let processor = processor(8);
    let panics = Arc::new(AtomicUsize::new(0));
    {
        let panics = panics.clone();
        processor.set_uncaught_handler(
            Arc::new(move |_err| {
                panics.fetch_add(1, Ordering::AcqRel);
            })
        );
    }

    struct Exploding;
    impl riffle::Subscriber<u64> for Exploding {
        fn on_subscribe(&mut self, subscription: Arc<dyn riffle::Subscription>) {
            subscription.request(i64::MAX);
        }
        fn on_next(&mut self, value: u64) -> riffle::Result<()> {
            if value == 3 {
                panic!("handler blew up on {value}");
            }
            Ok(())
        }
        fn on_error(&mut self, _error: Arc<riffle::RiffleError>) {}
        fn on_complete(&mut self) {}
    }
    processor.subscribe(Exploding).unwrap();

    // The dead worker must release its gate: far more events than the
    // ring holds still go through
    for value in 0..100u64 {
        processor.publish(value).unwrap();
    }

    assert!(wait_until(LONG_WAIT, || panics.load(Ordering::Acquire) == 1));
    processor.complete();
    processor.await_termination();
}

#[test]
fn chained_processors_relay_signals() {
    let upstream = processor(16);
    let downstream = processor(16);
    let (sub, handle) = subscriber::<u64>(i64::MAX).build();
    downstream.subscribe(sub).unwrap();

    // The downstream processor subscribes to the upstream one
    upstream.subscribe(downstream.clone()).unwrap();

    for value in 0..100u64 {
        upstream.publish(value).unwrap();
    }
    upstream.complete();

    assert!(wait_until(LONG_WAIT, || handle.completions() == 1));
    assert_eq!(handle.received(), (0..100).collect::<Vec<u64>>());

    upstream.await_termination();
    downstream.await_termination();
}

#[test]
fn multi_producer_share_preserves_per_producer_order() {
    let processor: BroadcastProcessor<u64> = BroadcastProcessor::share(
        ProcessorConfig::new("mp")
            .with_buffer_size(256)
            .unwrap()
            .with_wait_strategy(WaitStrategyKind::Yielding)
    ).unwrap();
    let (sub, handle) = subscriber::<u64>(i64::MAX).build();
    processor.subscribe(sub).unwrap();

    let producers: Vec<_> = (0..4u64)
        .map(|p| {
            let processor = processor.clone();
            std::thread::spawn(move || {
                for i in 0..250u64 {
                    processor.publish(p * 1000 + i).unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }
    processor.complete();

    assert!(wait_until(LONG_WAIT, || handle.completions() == 1));
    let received = handle.received();
    assert_eq!(received.len(), 1000);

    // No duplicates, and each producer's values arrive in its own order
    let mut sorted = received.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), 1000);
    for p in 0..4u64 {
        let stream: Vec<u64> = received
            .iter()
            .copied()
            .filter(|v| v / 1000 == p)
            .collect();
        let expected: Vec<u64> = (0..250).map(|i| p * 1000 + i).collect();
        assert_eq!(stream, expected);
    }
    processor.await_termination();
}

#[test]
fn auto_cancel_propagates_to_upstream() {
    let upstream = processor(16);
    let downstream: BroadcastProcessor<u64> = BroadcastProcessor::create(
        ProcessorConfig::new("down")
            .with_buffer_size(16)
            .unwrap()
            .with_wait_strategy(WaitStrategyKind::Yielding)
            .with_auto_cancel(true)
    ).unwrap();

    let (sub, handle) = subscriber::<u64>(i64::MAX).cancel_after(5).build();
    downstream.subscribe(sub).unwrap();
    upstream.subscribe(downstream.clone()).unwrap();

    for value in 0..20u64 {
        upstream.publish(value).unwrap();
    }

    // The sole downstream subscriber cancels; auto-cancel must sever the
    // downstream processor from the upstream publisher
    assert!(wait_until(LONG_WAIT, || handle.received_len() >= 5));
    assert!(wait_until(LONG_WAIT, || upstream.subscriber_count() == 0));

    upstream.complete();
    upstream.await_termination();
}
