mod common;

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use common::{config, eventually, start, wait_status, MockConnector, MockProvider, MockRemote};
use tether_fc::RemoteSystem;
use tether_link::Permission;
use tether_proto::telemetry::{FlightMode, Position, VelocityNed};
use tether_proto::{Feed, TelemetryChannel, TelemetryValue};
use tether_session::{SessionState, TelemetryCache, TelemetryConfig};

fn new_cache(remote: &Arc<MockRemote>, sample_ms: u64) -> TelemetryCache {
    TelemetryCache::new(
        remote.clone() as Arc<dyn RemoteSystem>,
        TelemetryConfig { sample_interval_ms: Some(sample_ms) },
    )
}

fn position(i: u32) -> TelemetryValue {
    TelemetryValue::Position(Position {
        lat_deg: 37.0 + i as f64 * 1e-5,
        lon_deg: 127.0,
        abs_alt_m: 50.0,
        rel_alt_m: i as f32,
    })
}

#[tokio::test]
async fn same_channel_shares_one_pipeline() {
    let remote = MockRemote::new();
    let cache = new_cache(&remote, 20);

    let a = cache.get(TelemetryChannel::Position);
    let b = cache.get(TelemetryChannel::Position);
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(remote.subscribe_count(Feed::Position), 1);

    cache.get(TelemetryChannel::Battery);
    assert_eq!(cache.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_access_creates_one_subscription() {
    let remote = MockRemote::new();
    let cache = Arc::new(new_cache(&remote, 20));

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get(TelemetryChannel::Attitude) })
        })
        .collect();
    let mut streams = Vec::new();
    for t in tasks {
        streams.push(t.await.unwrap());
    }

    assert!(streams.iter().all(|s| Arc::ptr_eq(s, &streams[0])));
    assert_eq!(remote.subscribe_count(Feed::Attitude), 1);
}

#[tokio::test]
async fn flight_mode_emits_only_on_change() {
    let remote = MockRemote::new();
    let cache = new_cache(&remote, 20);
    let mut rx = cache.get(TelemetryChannel::FlightMode).subscribe();

    remote.push(TelemetryValue::FlightMode(FlightMode::Hold));
    timeout(Duration::from_secs(2), rx.changed()).await.unwrap().unwrap();
    assert_eq!(*rx.borrow_and_update(), Some(TelemetryValue::FlightMode(FlightMode::Hold)));

    remote.push(TelemetryValue::FlightMode(FlightMode::Hold));
    assert!(timeout(Duration::from_millis(100), rx.changed()).await.is_err());

    remote.push(TelemetryValue::FlightMode(FlightMode::Mission));
    timeout(Duration::from_secs(2), rx.changed()).await.unwrap().unwrap();
    assert_eq!(*rx.borrow_and_update(), Some(TelemetryValue::FlightMode(FlightMode::Mission)));
}

#[tokio::test]
async fn sampled_channel_publishes_the_latest_value() {
    let remote = MockRemote::new();
    let cache = new_cache(&remote, 50);
    let stream = cache.get(TelemetryChannel::Position);
    let mut rx = stream.subscribe();

    for i in 0..10 {
        remote.push(position(i));
    }
    timeout(Duration::from_secs(2), rx.changed()).await.unwrap().unwrap();
    assert_eq!(*rx.borrow_and_update(), Some(position(9)));
    assert_eq!(stream.latest(), Some(position(9)));

    // nothing new arrived: the next period publishes nothing
    assert!(timeout(Duration::from_millis(150), rx.changed()).await.is_err());
}

#[tokio::test]
async fn speed_is_derived_from_velocity() {
    let remote = MockRemote::new();
    let cache = new_cache(&remote, 20);
    let mut rx = cache.get(TelemetryChannel::Speed).subscribe();
    assert_eq!(remote.subscribe_count(Feed::VelocityNed), 1);

    remote.push(TelemetryValue::VelocityNed(VelocityNed { north_m_s: 3.0, east_m_s: 4.0, down_m_s: -2.0 }));
    timeout(Duration::from_secs(2), rx.changed()).await.unwrap().unwrap();
    let Some(TelemetryValue::Speed(speed)) = *rx.borrow() else { panic!("expected speed") };
    assert_eq!(speed.horizontal_m_s, 5.0);
    assert_eq!(speed.vertical_m_s, 2.0);
}

#[tokio::test]
async fn invalidate_closes_pipelines_and_next_get_is_fresh() {
    let remote = MockRemote::new();
    let cache = new_cache(&remote, 20);
    let old = cache.get(TelemetryChannel::Battery);
    let mut old_rx = old.subscribe();

    cache.invalidate();
    assert!(cache.is_empty());
    assert!(timeout(Duration::from_secs(2), old_rx.changed()).await.unwrap().is_err());

    let new = cache.get(TelemetryChannel::Battery);
    assert!(!Arc::ptr_eq(&old, &new));
    assert_eq!(remote.subscribe_count(Feed::Battery), 2);
}

#[tokio::test]
async fn reconnect_starts_with_an_empty_cache() {
    let provider = MockProvider::with_device(Permission::Granted);
    let connector = Arc::new(MockConnector::default());
    let session = start(&provider, &connector, config(38990));

    session.connect();
    wait_status(&session, |s| s.state == SessionState::Ready).await;
    let first = session.telemetry(TelemetryChannel::ConnectionState).unwrap();
    let again = session.telemetry(TelemetryChannel::ConnectionState).unwrap();
    assert!(Arc::ptr_eq(&first, &again));

    connector.remote().push(TelemetryValue::ConnectionState(true));
    let mut rx = first.subscribe();
    timeout(Duration::from_secs(2), rx.wait_for(|v| v.is_some())).await.unwrap().unwrap();

    session.disconnect();
    wait_status(&session, |s| s.state == SessionState::Idle).await;
    assert!(session.telemetry(TelemetryChannel::ConnectionState).is_none());

    session.connect();
    wait_status(&session, |s| s.state == SessionState::Ready).await;
    let second = session.telemetry(TelemetryChannel::ConnectionState).unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(second.latest(), None);
    assert_eq!(connector.remote().subscribe_count(Feed::ConnectionState), 1);
    session.shutdown().await;
}

#[tokio::test]
async fn position_is_cached_as_soon_as_the_link_is_up() {
    let provider = MockProvider::with_device(Permission::Granted);
    let connector = Arc::new(MockConnector::default());
    let session = start(&provider, &connector, config(39020));

    session.connect();
    wait_status(&session, |s| s.state == SessionState::Ready).await;
    let remote = connector.remote();
    assert_eq!(remote.subscribe_count(Feed::Position), 1);

    // nobody has asked for the channel yet; the fix is still there on first read
    remote.push(position(3));
    eventually(|| {
        let latest = session.telemetry(TelemetryChannel::Position).and_then(|s| s.latest());
        async move { latest == Some(position(3)) }
    })
    .await;
    assert_eq!(remote.subscribe_count(Feed::Position), 1);
    session.shutdown().await;
}
