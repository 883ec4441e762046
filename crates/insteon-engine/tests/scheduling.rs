//! Request queue and scheduler timing, driven with paused tokio time.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use insteon_engine::handlers::SwitchRequestReplyHandler;
use insteon_engine::{
    AddressId, ChannelLink, DeviceEntity, DeviceFeature, EngineConfig, FeatureState,
    InsteonAddress, Link, LinkError, MessageClass, QueryStatus, RequestScheduler, SentFrame,
    WireMessage, MAX_WAIT,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

const DEVICE: InsteonAddress = InsteonAddress::new(0x11, 0x22, 0x33);
const STEP: Duration = Duration::from_millis(10);

struct Rig {
    scheduler: RequestScheduler,
    device: Arc<DeviceEntity>,
    frames: UnboundedReceiver<SentFrame>,
    t0: Instant,
}

impl Rig {
    fn new(config: EngineConfig, features: Vec<DeviceFeature>) -> Self {
        let (link, frames) = ChannelLink::new();
        Self::with_link(config, features, Arc::new(link), frames)
    }

    fn with_link(
        config: EngineConfig,
        features: Vec<DeviceFeature>,
        link: Arc<dyn Link>,
        frames: UnboundedReceiver<SentFrame>,
    ) -> Self {
        let scheduler = RequestScheduler::new(&config);
        let mut builder = DeviceEntity::builder(AddressId::Insteon(DEVICE), "test");
        for feature in features {
            builder = builder.feature(feature);
        }
        let device = builder.build(link, scheduler.handle(), Arc::new(config));
        Self {
            scheduler,
            device,
            frames,
            t0: Instant::now(),
        }
    }

    /// Tick the scheduler every 10ms until `ms` after the start.
    async fn run_until(&self, ms: u64) {
        let end = self.t0 + Duration::from_millis(ms);
        while Instant::now() <= end {
            self.scheduler.service_due(Instant::now()).await;
            tokio::time::advance(STEP).await;
        }
    }

    /// Frames sent so far as (ms since start, cmd2).
    fn sent(&mut self) -> Vec<(u64, u8)> {
        let mut sent = Vec::new();
        while let Ok(frame) = self.frames.try_recv() {
            let at = frame.at.duration_since(self.t0).as_millis() as u64;
            sent.push((at, frame.msg.cmd2()));
        }
        sent
    }
}

/// Fails the first `failures` writes, then forwards.
struct FlakyLink {
    failures: AtomicUsize,
    inner: ChannelLink,
}

#[async_trait]
impl Link for FlakyLink {
    async fn send_frame(&self, target: &AddressId, msg: &WireMessage) -> Result<(), LinkError> {
        let failing = self
            .failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(LinkError::Io("serial port unplugged".to_string()));
        }
        self.inner.send_frame(target, msg).await
    }
}

/// Hangs on the first write, then forwards.
struct StallingLink {
    stall: AtomicBool,
    inner: ChannelLink,
}

#[async_trait]
impl Link for StallingLink {
    async fn send_frame(&self, target: &AddressId, msg: &WireMessage) -> Result<(), LinkError> {
        if self.stall.swap(false, Ordering::AcqRel) {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        self.inner.send_frame(target, msg).await
    }
}

fn stalling_link() -> (Arc<dyn Link>, UnboundedReceiver<SentFrame>) {
    let (inner, frames) = ChannelLink::new();
    let link = StallingLink {
        stall: AtomicBool::new(true),
        inner,
    };
    (Arc::new(link), frames)
}

fn status_feature(name: &str) -> DeviceFeature {
    DeviceFeature::new(name)
        .with_default_message_handler(Box::new(SwitchRequestReplyHandler::default()))
}

fn query(cmd2: u8) -> WireMessage {
    WireMessage::direct(DEVICE, 0x19, cmd2)
}

fn ack(cmd2: u8) -> WireMessage {
    WireMessage::standard(
        DEVICE,
        InsteonAddress::default(),
        MessageClass::AckOfDirect,
        0x19,
        cmd2,
    )
}

#[tokio::test(start_paused = true)]
async fn test_entries_drain_by_not_before_time() {
    let config = EngineConfig {
        broadcast_quiet_time_ms: 10,
        ..EngineConfig::default()
    };
    let mut rig = Rig::new(config, vec![DeviceFeature::new("scene")]);

    for (delay, cmd2) in [(100, 1), (50, 2), (200, 3)] {
        rig.device.enqueue_for(
            "scene",
            WireMessage::group_broadcast(1, 0x11, cmd2),
            Duration::from_millis(delay),
        );
    }
    assert_eq!(rig.device.queue_len(), 3);

    rig.run_until(400).await;
    assert_eq!(rig.sent(), vec![(50, 2), (100, 1), (200, 3)]);
    assert_eq!(rig.device.queue_len(), 0);
    assert_eq!(rig.scheduler.scheduled_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_direct_sends_respect_quiet_time() {
    let config = EngineConfig {
        ack_timeout_ms: 100,
        ..EngineConfig::default()
    };
    let mut rig = Rig::new(
        config,
        vec![
            DeviceFeature::new("a").with_ack_timeout(Duration::from_millis(100)),
            DeviceFeature::new("b").with_ack_timeout(Duration::from_millis(100)),
        ],
    );
    rig.device.enqueue_for("a", query(1), Duration::ZERO);
    rig.device.enqueue_for("b", query(2), Duration::ZERO);

    rig.run_until(2000).await;
    let sent = rig.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0], (0, 1));
    assert_eq!(sent[1].1, 2);
    assert!(sent[1].0 >= 500, "second frame at {}ms", sent[1].0);
}

#[tokio::test(start_paused = true)]
async fn test_reply_releases_next_request() {
    let mut rig = Rig::new(
        EngineConfig::default(),
        vec![status_feature("first"), status_feature("second")],
    );
    rig.device.enqueue_for("first", query(1), Duration::ZERO);
    rig.device.enqueue_for("second", query(2), Duration::ZERO);

    let first = rig.device.feature("first").unwrap();
    let second = rig.device.feature("second").unwrap();
    assert_eq!(first.query_status(), QueryStatus::QueryCreated);

    rig.run_until(2990).await;
    assert_eq!(rig.sent(), vec![(0, 1)]);
    assert_eq!(rig.device.outstanding_feature().as_deref(), Some("first"));
    assert_eq!(first.query_status(), QueryStatus::QueryPending);

    // now at 3000ms
    rig.device.handle_message(&ack(0xFF));
    assert_eq!(first.query_status(), QueryStatus::QueryAnswered);
    assert_eq!(first.state(), Some(FeatureState::on()));
    assert_eq!(rig.scheduler.due_time(&rig.device.address()), Some(Instant::now()));

    rig.run_until(3100).await;
    assert_eq!(rig.sent(), vec![(3000, 2)]);
    assert_eq!(rig.device.outstanding_feature().as_deref(), Some("second"));
    assert_eq!(second.query_status(), QueryStatus::QueryPending);
    assert_eq!(rig.device.failed_queries(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_nack_releases_next_request() {
    let mut rig = Rig::new(
        EngineConfig::default(),
        vec![status_feature("first"), status_feature("second")],
    );
    rig.device.enqueue_for("first", query(1), Duration::ZERO);
    rig.device.enqueue_for("second", query(2), Duration::ZERO);
    rig.run_until(990).await;
    assert_eq!(rig.sent(), vec![(0, 1)]);

    let nack = WireMessage::standard(
        DEVICE,
        InsteonAddress::default(),
        MessageClass::NackOfDirect,
        0x19,
        0xFB,
    );
    rig.device.handle_message(&nack);
    let first = rig.device.feature("first").unwrap();
    assert_eq!(first.query_status(), QueryStatus::NeverQueried);
    assert_eq!(first.state(), None);

    rig.run_until(1100).await;
    assert_eq!(rig.sent(), vec![(1000, 2)]);
}

#[tokio::test(start_paused = true)]
async fn test_reply_answers_query_when_same_feature_is_requeued() {
    let mut rig = Rig::new(EngineConfig::default(), vec![status_feature("light")]);
    let light = rig.device.feature("light").unwrap();
    rig.device.enqueue_for("light", query(0), Duration::ZERO);
    rig.run_until(90).await;
    assert_eq!(rig.sent(), vec![(0, 0)]);

    // now at 100ms, a second query for the same feature while the first is in flight
    rig.device.enqueue_for("light", query(1), Duration::ZERO);
    assert_eq!(light.query_status(), QueryStatus::QueryPending);

    rig.run_until(190).await;
    // now at 200ms
    rig.device.handle_message(&ack(0xFF));
    assert_eq!(rig.device.outstanding_feature(), None);
    assert_eq!(light.state(), Some(FeatureState::on()));

    rig.run_until(700).await;
    assert_eq!(rig.sent(), vec![(500, 1)]);
    assert_eq!(rig.device.failed_queries(), 0);
    assert_eq!(light.query_status(), QueryStatus::QueryPending);
}

#[tokio::test(start_paused = true)]
async fn test_huge_ack_timeout_is_capped() {
    let mut rig = Rig::new(
        EngineConfig::default(),
        vec![
            status_feature("first").with_ack_timeout(Duration::MAX),
            status_feature("second"),
        ],
    );
    rig.device.enqueue_for("first", query(1), Duration::ZERO);
    rig.device.enqueue_for("second", query(2), Duration::ZERO);

    rig.run_until(2000).await;
    assert_eq!(rig.sent(), vec![(0, 1)]);
    assert_eq!(rig.device.outstanding_feature().as_deref(), Some("first"));
    assert_eq!(
        rig.scheduler.due_time(&rig.device.address()),
        Some(rig.t0 + MAX_WAIT)
    );
}

#[tokio::test(start_paused = true)]
async fn test_link_error_drops_entry_and_moves_on() {
    let (inner, frames) = ChannelLink::new();
    let link = FlakyLink {
        failures: AtomicUsize::new(1),
        inner,
    };
    let mut rig = Rig::with_link(
        EngineConfig::default(),
        vec![status_feature("first"), status_feature("second")],
        Arc::new(link),
        frames,
    );
    rig.device.enqueue_for("first", query(1), Duration::ZERO);
    rig.device.enqueue_for("second", query(2), Duration::ZERO);

    rig.run_until(2000).await;
    assert_eq!(rig.sent(), vec![(500, 2)]);
    let first = rig.device.feature("first").unwrap();
    assert_eq!(first.query_status(), QueryStatus::NeverQueried);
    assert_eq!(rig.device.outstanding_feature().as_deref(), Some("second"));
    assert_eq!(rig.device.queue_len(), 0);

    // the failed request is not sent again
    rig.run_until(10_000).await;
    assert!(rig.sent().is_empty());
    assert_eq!(rig.device.failed_queries(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_write_timeout_drops_entry_and_moves_on() {
    let (link, frames) = stalling_link();
    let mut rig = Rig::with_link(
        EngineConfig::default(),
        vec![status_feature("first"), status_feature("second")],
        link,
        frames,
    );
    rig.device.enqueue_for("first", query(1), Duration::ZERO);
    rig.device.enqueue_for("second", query(2), Duration::ZERO);

    rig.run_until(3000).await;
    let sent = rig.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, 2);
    assert!((2000..2100).contains(&sent[0].0), "second frame at {}ms", sent[0].0);

    let first = rig.device.feature("first").unwrap();
    assert_eq!(first.query_status(), QueryStatus::NeverQueried);
    assert_eq!(rig.device.outstanding_feature().as_deref(), Some("second"));
}

#[tokio::test(start_paused = true)]
async fn test_query_deadline_counts_from_actual_send() {
    let config = Arc::new(EngineConfig::default());
    let (link, _frames) = stalling_link();
    let scheduler = RequestScheduler::new(&config);
    let t0 = Instant::now();

    let devices: Vec<_> = [1u8, 2]
        .into_iter()
        .map(|low| {
            DeviceEntity::builder(AddressId::insteon(0x11, 0x22, low), "test")
                .feature(status_feature("light"))
                .build(link.clone(), scheduler.handle(), config.clone())
        })
        .collect();
    for device in &devices {
        device.enqueue_for("light", query(0), Duration::ZERO);
    }

    // the first device's write stalls until the 2s write timeout
    scheduler.service_due(Instant::now()).await;
    assert!(Instant::now() >= t0 + Duration::from_millis(2000));
    let light = devices[1].feature("light").unwrap();
    assert_eq!(light.query_status(), QueryStatus::QueryPending);

    while Instant::now() <= t0 + Duration::from_millis(7000) {
        scheduler.service_due(Instant::now()).await;
        tokio::time::advance(STEP).await;
    }
    assert_eq!(light.query_status(), QueryStatus::QueryPending);

    while Instant::now() <= t0 + Duration::from_millis(8100) {
        scheduler.service_due(Instant::now()).await;
        tokio::time::advance(STEP).await;
    }
    assert_eq!(light.query_status(), QueryStatus::NeverQueried);
    assert_eq!(devices[1].failed_queries(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_moves_on_without_retry() {
    let mut rig = Rig::new(
        EngineConfig::default(),
        vec![status_feature("first"), status_feature("second")],
    );
    rig.device.enqueue_for("first", query(1), Duration::ZERO);
    rig.device.enqueue_for("second", query(2), Duration::ZERO);

    rig.run_until(5990).await;
    assert_eq!(rig.sent(), vec![(0, 1)]);

    rig.run_until(6010).await;
    assert_eq!(rig.sent(), vec![(6000, 2)]);
    let first = rig.device.feature("first").unwrap();
    assert_eq!(first.query_status(), QueryStatus::NeverQueried);
    assert_eq!(rig.device.failed_queries(), 1);

    rig.run_until(20_000).await;
    assert!(rig.sent().is_empty());
    assert_eq!(rig.device.outstanding_feature(), None);
    assert_eq!(rig.device.failed_queries(), 2);
    assert!(rig.device.is_responding());
}

#[tokio::test(start_paused = true)]
async fn test_equal_request_replaces_queued_one() {
    let mut rig = Rig::new(EngineConfig::default(), vec![status_feature("light")]);
    rig.device.enqueue_for("light", query(0), Duration::from_millis(300));
    rig.device.enqueue_for("light", query(0), Duration::from_millis(100));
    assert_eq!(rig.device.queue_len(), 1);

    rig.run_until(500).await;
    assert_eq!(rig.sent(), vec![(100, 0)]);
}

#[tokio::test(start_paused = true)]
async fn test_poll_spaces_features_by_quiet_time() {
    use insteon_engine::handlers::{DefaultPollHandler, FlexPollHandler};
    use insteon_engine::Configurable;

    let mut flex = FlexPollHandler::default();
    flex.configure("cmd2", "0x01").unwrap();
    let timeout = Duration::from_millis(100);
    let mut rig = Rig::new(
        EngineConfig::default(),
        vec![
            status_feature("a")
                .with_ack_timeout(timeout)
                .with_poll_handler(Box::new(DefaultPollHandler)),
            DeviceFeature::new("not_pollable"),
            status_feature("b")
                .with_ack_timeout(timeout)
                .with_poll_handler(Box::new(flex)),
        ],
    );
    rig.device.do_poll(Duration::ZERO);
    assert_eq!(rig.device.queue_len(), 2);
    assert!(rig.device.last_polled().is_some());

    rig.run_until(1000).await;
    assert_eq!(rig.sent(), vec![(0, 0x00), (500, 0x01)]);
}

#[tokio::test(start_paused = true)]
async fn test_link_spacing_between_devices() {
    let config = EngineConfig {
        broadcast_quiet_time_ms: 10,
        link_spacing_ms: 300,
        ..EngineConfig::default()
    };
    let (link, mut frames) = ChannelLink::new();
    let link = Arc::new(link);
    let scheduler = RequestScheduler::new(&config);
    let config = Arc::new(config);
    let t0 = Instant::now();

    let devices: Vec<_> = [1u8, 2, 3]
        .into_iter()
        .map(|low| {
            DeviceEntity::builder(AddressId::insteon(0x11, 0x22, low), "test")
                .feature(DeviceFeature::new("scene"))
                .build(link.clone(), scheduler.handle(), config.clone())
        })
        .collect();
    for device in &devices {
        device.enqueue_for("scene", WireMessage::group_broadcast(1, 0x11, 0), Duration::ZERO);
    }

    while Instant::now() <= t0 + Duration::from_millis(1000) {
        scheduler.service_due(Instant::now()).await;
        tokio::time::advance(STEP).await;
    }

    let mut at = Vec::new();
    while let Ok(frame) = frames.try_recv() {
        at.push(frame.at.duration_since(t0).as_millis() as u64);
    }
    assert_eq!(at, vec![0, 300, 600]);
}

#[tokio::test(start_paused = true)]
async fn test_disposed_device_sends_nothing() {
    let mut rig = Rig::new(EngineConfig::default(), vec![status_feature("light")]);
    rig.device.enqueue_for("light", query(0), Duration::from_millis(100));
    rig.device.dispose();
    rig.device.enqueue_for("light", query(1), Duration::ZERO);

    rig.run_until(500).await;
    assert!(rig.sent().is_empty());
    assert!(rig.device.is_removed());
    assert_eq!(rig.scheduler.due_time(&rig.device.address()), None);
}
