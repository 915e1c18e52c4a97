//! Metadata broadcast service tests

use std::sync::Arc;
use std::time::Duration;

use devicecast_core::config::BroadcastConfig;
use devicecast_core::test_helpers::{FakeFrameSource, RecordingPublisher};
use devicecast_core::{
    BroadcastPublisher, BroadcastState, DeviceId, FrameSource, MetadataBroadcaster, Publisher,
    StreamMetadata,
    METADATA_EVENT,
};

fn config() -> BroadcastConfig {
    BroadcastConfig {
        period_ms: 5,
        stop_timeout_ms: 1000,
        channel_capacity: 64,
    }
}

fn metadata(frame_number: u64) -> StreamMetadata {
    StreamMetadata {
        timestamp: 1_700_000_000_000.0,
        frame_number,
        width: 848,
        height: 480,
        motion_data: None,
        point_cloud: None,
    }
}

fn device_of(event: &devicecast_core::PublishedEvent) -> String {
    event.data["device_id"].as_str().unwrap_or_default().to_string()
}

#[tokio::test]
async fn test_switching_target_never_interleaves_devices() {
    let source = Arc::new(FakeFrameSource::new());
    source.set_streaming("camA", &["depth"]);
    source.set_streaming("camB", &["depth"]);
    source.set_metadata("camA", "depth", metadata(1));
    source.set_metadata("camB", "depth", metadata(2));

    let publisher = Arc::new(RecordingPublisher::new());
    let broadcaster = MetadataBroadcaster::new(
        Arc::clone(&source) as Arc<dyn FrameSource>,
        Arc::clone(&publisher) as Arc<dyn Publisher>,
        config(),
    );

    broadcaster.start(DeviceId::from("camA")).await;
    assert!(publisher.wait_for(3, Duration::from_secs(2)).await);

    broadcaster.start(DeviceId::from("camB")).await;
    let before_b = publisher.len();
    assert!(publisher.wait_for(before_b + 5, Duration::from_secs(2)).await);
    broadcaster.stop().await;

    let devices: Vec<String> = publisher.events().iter().map(device_of).collect();
    let first_b = devices
        .iter()
        .position(|d| d == "camB")
        .expect("camB published");
    assert!(first_b > 0);
    assert!(devices[..first_b].iter().all(|d| d == "camA"));
    assert!(devices[first_b..].iter().all(|d| d == "camB"));

    for event in publisher.events() {
        assert_eq!(event.event, METADATA_EVENT);
        let device = device_of(&event);
        let expected_frame = if device == "camA" { 1 } else { 2 };
        assert_eq!(
            event.data["metadata_streams"]["depth"]["frame_number"],
            expected_frame
        );
    }
}

#[tokio::test]
async fn test_restart_same_device_keeps_single_loop() {
    let source = Arc::new(FakeFrameSource::new());
    source.set_streaming("camA", &["color"]);
    let publisher = Arc::new(RecordingPublisher::new());
    let broadcaster = MetadataBroadcaster::new(
        source,
        Arc::clone(&publisher) as Arc<dyn Publisher>,
        BroadcastConfig {
            period_ms: 20,
            ..config()
        },
    );

    broadcaster.start(DeviceId::from("camA")).await;
    broadcaster.start(DeviceId::from("camA")).await;
    assert_eq!(
        broadcaster.state(),
        BroadcastState::Broadcasting {
            device_id: DeviceId::from("camA")
        }
    );

    // Two loops would publish about twice as often
    publisher.wait_for(1, Duration::from_secs(1)).await;
    let start = publisher.len();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let published = publisher.len() - start;
    assert!(published <= 15, "published {published} ticks in 200ms");

    broadcaster.stop().await;
}

#[tokio::test]
async fn test_stop_observed_mid_sleep() {
    let source = Arc::new(FakeFrameSource::new());
    let publisher = Arc::new(RecordingPublisher::new());
    let broadcaster = MetadataBroadcaster::new(
        source,
        Arc::clone(&publisher) as Arc<dyn Publisher>,
        BroadcastConfig {
            period_ms: 10_000,
            stop_timeout_ms: 1000,
            channel_capacity: 8,
        },
    );

    broadcaster.start(DeviceId::from("camA")).await;
    assert!(publisher.wait_for(1, Duration::from_secs(1)).await);

    let started = std::time::Instant::now();
    assert!(broadcaster.stop().await);
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(publisher.len(), 1);
}

#[tokio::test]
async fn test_events_reach_channel_subscribers() {
    let source = Arc::new(FakeFrameSource::new());
    source.stop_streaming("camA");
    let publisher = Arc::new(BroadcastPublisher::new(16));
    let mut rx = publisher.subscribe();
    let broadcaster = MetadataBroadcaster::new(source, Arc::clone(&publisher) as Arc<dyn Publisher>, config());

    broadcaster.start(DeviceId::from("camA")).await;
    let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    broadcaster.stop().await;

    assert_eq!(event.event, METADATA_EVENT);
    assert_eq!(event.data["is_streaming"], false);
    assert!(event.data["metadata_streams"].as_object().unwrap().is_empty());
}

#[tokio::test]
async fn test_stop_gives_up_on_hung_publish() {
    let source = Arc::new(FakeFrameSource::new());
    source.set_streaming("camA", &["depth"]);
    source.set_streaming("camB", &["depth"]);

    let publisher = Arc::new(RecordingPublisher::new());
    publisher.hold();
    let broadcaster = MetadataBroadcaster::new(
        Arc::clone(&source) as Arc<dyn FrameSource>,
        Arc::clone(&publisher) as Arc<dyn Publisher>,
        BroadcastConfig {
            period_ms: 5,
            stop_timeout_ms: 50,
            channel_capacity: 64,
        },
    );

    broadcaster.start(DeviceId::from("camA")).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while publisher.attempts() == 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(publisher.attempts(), 1);

    let started = std::time::Instant::now();
    assert!(broadcaster.stop().await);
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(50));
    assert!(waited < Duration::from_millis(500));
    assert_eq!(broadcaster.state(), BroadcastState::Stopped);

    // The hung camA tick still owns the publish gate
    broadcaster.start(DeviceId::from("camB")).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(publisher.attempts(), 1);
    assert!(publisher.is_empty());

    publisher.release();
    assert!(publisher.wait_for(3, Duration::from_secs(2)).await);
    broadcaster.stop().await;

    let devices: Vec<String> = publisher.events().iter().map(device_of).collect();
    assert_eq!(devices[0], "camA");
    assert!(devices[1..].iter().all(|d| d == "camB"));
}
