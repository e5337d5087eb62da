use std::sync::Arc;
use ultrasonic_core::broadcast::Broadcaster;
use ultrasonic_core::frame::WireFrame;

fn wire(sequence_id: u64) -> Arc<WireFrame> {
    Arc::new(WireFrame {
        sequence_id,
        timestamp: 1_700_000_000_000 + sequence_id,
        sample_rate: 384_000,
        fft_size: 8192,
        bins_count: 4096,
        peak_frequency_hz: 41_000.0,
        peak_magnitude_db: -20.0,
        spl_db: -8.0,
        fps: 30.0,
        data_compressed: String::new(),
        data_size_bytes: 0,
        original_size_bytes: 4096 * 4,
    })
}

#[tokio::test]
async fn late_subscriber_first_sees_the_cached_latest() {
    let hub = Broadcaster::new(4);
    for seq in 1..=3 {
        hub.publish(wire(seq));
    }
    let mut sub = hub.subscribe();
    let first = sub.next().await.unwrap();
    assert_eq!(first.sequence_id, 3);
}

#[tokio::test]
async fn frames_arrive_in_strictly_increasing_order() {
    let hub = Broadcaster::new(8);
    let mut sub = hub.subscribe();
    // Sequence gaps from throttling are preserved, never reordered.
    for seq in [1u64, 2, 5, 9, 10] {
        hub.publish(wire(seq));
    }
    let mut seen = Vec::new();
    for _ in 0..5 {
        seen.push(sub.next().await.unwrap().sequence_id);
    }
    assert_eq!(seen, vec![1, 2, 5, 9, 10]);
}

#[tokio::test]
async fn slow_subscriber_loses_oldest_frames_not_newest() {
    let hub = Broadcaster::new(4);
    let mut sub = hub.subscribe();

    for seq in 1..=50 {
        hub.publish(wire(seq));
    }

    // The queue held 4; everything older was dropped while we slept.
    let mut received = Vec::new();
    while let Some(frame) = sub.next().await {
        received.push(frame.sequence_id);
        if frame.sequence_id == 50 {
            break;
        }
    }
    assert_eq!(received, vec![47, 48, 49, 50]);
    assert_eq!(sub.dropped_by_lag(), 46);

    let snap = hub.snapshot();
    assert_eq!(snap.total_published, 50);
    assert_eq!(snap.total_dropped, 46);
    assert_eq!(snap.latest_sequence, 50);
}

#[tokio::test]
async fn dropping_a_subscription_unsubscribes() {
    let hub = Broadcaster::new(4);
    let a = hub.subscribe();
    let b = hub.subscribe();
    assert_eq!(hub.subscriber_count(), 2);
    drop(a);
    assert_eq!(hub.subscriber_count(), 1);
    drop(b);
    assert_eq!(hub.subscriber_count(), 0);
}

#[tokio::test]
async fn lag_on_one_subscriber_does_not_starve_another() {
    let hub = Broadcaster::new(4);
    let mut slow = hub.subscribe();
    let mut fast = hub.subscribe();

    for seq in 1..=20 {
        hub.publish(wire(seq));
        // The fast consumer keeps up frame by frame.
        assert_eq!(fast.next().await.unwrap().sequence_id, seq);
    }
    assert_eq!(fast.dropped_by_lag(), 0);

    let first_slow = slow.next().await.unwrap();
    assert!(first_slow.sequence_id >= 17);
    assert!(slow.dropped_by_lag() >= 16);
}
