//! Integration tests for the full communication flow.
//!
//! A beacon and a phone each run a complete service over the classic
//! bridge. Their radios share an in-memory "air" where sockets are duplex
//! pipes.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use sidekick_finder::alarm::{Alarm, LogAlarm};
use sidekick_finder::bluetooth::{
    BoxedStream, BridgeState, DiscoveredDevice, GuardStatus, Peer, RfcommBridge, SocketAcceptor,
    SocketRadio, TransportBridge,
};
use sidekick_finder::service::{GuardSettings, ServiceSettings};
use sidekick_finder::{
    CheckMode, FinderResult, FinderService, Registry, Role, ServiceEvent, ServiceState,
};

const PHONE: &str = "AA:BB:CC:DD:EE:FF";
const BEACON: &str = "11:22:33:44:55:66";
const WAIT: Duration = Duration::from_secs(5);

type Incoming = mpsc::UnboundedSender<(BoxedStream, Peer)>;

/// Shared medium: listening sockets by address, plus what a scan sees.
#[derive(Clone, Default)]
struct Air {
    listeners: Arc<Mutex<HashMap<String, (String, Incoming)>>>,
    in_range: Arc<Mutex<Vec<DiscoveredDevice>>>,
}

impl Air {
    fn set_in_range(&self, devices: &[(&str, &str)]) {
        *self.in_range.lock() = devices
            .iter()
            .map(|(name, address)| DiscoveredDevice {
                name: name.to_string(),
                address: address.to_string(),
                rssi: Some(-60),
            })
            .collect();
    }
}

struct AirRadio {
    air: Air,
    name: String,
    address: String,
}

struct AirAcceptor {
    incoming: mpsc::UnboundedReceiver<(BoxedStream, Peer)>,
}

#[async_trait]
impl SocketAcceptor for AirAcceptor {
    async fn accept(&mut self) -> io::Result<(BoxedStream, Peer)> {
        self.incoming
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "listener replaced"))
    }
}

#[async_trait]
impl SocketRadio for AirRadio {
    async fn is_powered(&self) -> FinderResult<bool> {
        Ok(true)
    }

    async fn bind(&self) -> io::Result<Box<dyn SocketAcceptor>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.air
            .listeners
            .lock()
            .insert(self.address.clone(), (self.name.clone(), tx));
        Ok(Box::new(AirAcceptor { incoming: rx }))
    }

    async fn connect(&self, address: &str) -> io::Result<(BoxedStream, Peer)> {
        let (name, incoming) = self
            .air
            .listeners
            .lock()
            .get(address)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "nobody listening"))?;

        let (local, remote) = tokio::io::duplex(1024);
        let me = Peer {
            name: self.name.clone(),
            address: self.address.clone(),
        };
        incoming
            .send((Box::new(remote), me))
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener closed"))?;
        Ok((
            Box::new(local),
            Peer {
                name,
                address: address.to_string(),
            },
        ))
    }

    async fn discover(&self, found: mpsc::Sender<DiscoveredDevice>) -> FinderResult<()> {
        let devices = self.air.in_range.lock().clone();
        for device in devices {
            let _ = found.send(device).await;
        }
        Ok(())
    }
}

struct Node {
    service: FinderService,
    bridge: Arc<RfcommBridge<AirRadio>>,
    alarm: Arc<LogAlarm>,
    events: broadcast::Receiver<ServiceEvent>,
}

fn node(air: &Air, name: &str, address: &str, settings: ServiceSettings) -> Node {
    let radio = AirRadio {
        air: air.clone(),
        name: name.to_string(),
        address: address.to_string(),
    };
    let bridge = Arc::new(RfcommBridge::with_timeout(radio, Duration::from_secs(2)));
    let alarm = Arc::new(LogAlarm::new());
    let service = FinderService::new(
        bridge.clone(),
        Arc::new(Registry::new()),
        alarm.clone(),
        settings,
    );
    let events = service.subscribe();
    Node {
        service,
        bridge,
        alarm,
        events,
    }
}

/// Wait for the first event matching `pred`.
async fn expect_event<F>(events: &mut broadcast::Receiver<ServiceEvent>, pred: F) -> ServiceEvent
where
    F: Fn(&ServiceEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event bus closed: {}", e),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_for_bridge(bridge: &RfcommBridge<AirRadio>, state: BridgeState) {
    tokio::time::timeout(WAIT, async {
        while bridge.state() != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("bridge never reached state");
}

/// Beacon in Setup with the phone registered to it.
async fn registered_pair(air: &Air) -> (Node, Node) {
    let mut beacon = node(air, "sidekick", BEACON, ServiceSettings::default());
    let mut phone = node(air, "phone1", PHONE, ServiceSettings::default());

    beacon.service.set_role(Role::Sidekick);
    beacon.service.start_setup_mode().await.unwrap();
    expect_event(&mut beacon.events, |e| *e == ServiceEvent::RegistrationStarted).await;
    wait_for_bridge(&beacon.bridge, BridgeState::Listening).await;

    phone.service.set_role(Role::Mobile);
    phone.service.start_setup_mode().await.unwrap();
    phone.service.send_register_request(BEACON).await.unwrap();

    expect_event(&mut beacon.events, |e| {
        *e == ServiceEvent::Registered {
            name: "phone1".to_string(),
            address: PHONE.to_string(),
        }
    })
    .await;
    expect_event(&mut phone.events, |e| {
        matches!(e, ServiceEvent::Registered { address, .. } if address == BEACON)
    })
    .await;

    (beacon, phone)
}

#[tokio::test]
async fn test_register_scenario() {
    let air = Air::default();
    let (beacon, phone) = registered_pair(&air).await;

    let items = beacon.service.registry().guarded_items();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].name(), "phone1");
    assert_eq!(items[0].address(), PHONE);
    let remaining = items[0].report_window_deadline - tokio::time::Instant::now();
    assert!(remaining > Duration::from_secs(8) && remaining <= Duration::from_secs(10));

    assert_eq!(phone.service.state(), ServiceState::Report);
    assert_eq!(phone.service.report_window_ms(), 10_000);
    assert_eq!(beacon.service.state(), ServiceState::Setup);

    // One link on each side.
    assert_eq!(phone.bridge.connections().len(), 1);
    assert_eq!(phone.bridge.connections()[0].address, BEACON);
    assert_eq!(beacon.bridge.connections().len(), 1);
    assert_eq!(beacon.bridge.connections()[0].address, PHONE);

    beacon.service.stop().await;
    phone.service.stop().await;
    assert_eq!(beacon.bridge.state(), BridgeState::Unknown);
    assert!(phone.bridge.connections().is_empty());
    assert_eq!(phone.service.state(), ServiceState::Unknown);
}

#[tokio::test]
async fn test_list_and_partial_delete() {
    let air = Air::default();
    let (beacon, mut phone) = registered_pair(&air).await;
    let mut beacon_events = beacon.service.subscribe();

    phone.service.send_get_list_request(BEACON).await.unwrap();
    let list = expect_event(&mut phone.events, |e| {
        matches!(e, ServiceEvent::ListReceived { .. })
    })
    .await;
    match list {
        ServiceEvent::ListReceived { items } => {
            assert_eq!(items.len(), 1);
            assert_eq!(items[0].name, "phone1");
            assert_eq!(items[0].status, GuardStatus::Guarded);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    let stranger = "00:11:22:33:44:55".to_string();
    phone
        .service
        .send_unregister_request(BEACON, &[PHONE.to_string(), stranger.clone()])
        .await
        .unwrap();

    let reply = expect_event(&mut phone.events, |e| {
        matches!(e, ServiceEvent::PeerReply { .. })
    })
    .await;
    assert_eq!(
        reply,
        ServiceEvent::PeerReply {
            ok: false,
            detail: stranger,
        }
    );
    expect_event(&mut beacon_events, |e| {
        *e == ServiceEvent::Unregistered {
            address: PHONE.to_string(),
        }
    })
    .await;
    assert!(beacon.service.registry().guarded_items().is_empty());

    beacon.service.stop().await;
    phone.service.stop().await;
}

#[tokio::test]
async fn test_list_with_crowded_neighbourhood() {
    let air = Air::default();
    let (beacon, mut phone) = registered_pair(&air).await;
    for i in 0..8 {
        beacon.service.registry().upsert_known(
            &format!("neighbour-device-{}", i),
            &format!("00:00:00:00:01:{:02X}", i),
        );
    }

    phone.service.send_get_list_request(BEACON).await.unwrap();
    let list = expect_event(&mut phone.events, |e| {
        matches!(
            e,
            ServiceEvent::ListReceived { .. } | ServiceEvent::Disconnected { .. }
        )
    })
    .await;
    match list {
        ServiceEvent::ListReceived { items } => {
            assert!(items.len() > 1);
            assert_eq!(items[0].address, PHONE);
            assert_eq!(items[0].status, GuardStatus::Guarded);
            assert!(items[1..].iter().all(|i| i.status == GuardStatus::NotGuarded));
        }
        other => panic!("unexpected event: {:?}", other),
    }
    assert!(phone.bridge.is_connected_to(BEACON));

    beacon.service.stop().await;
    phone.service.stop().await;
}

#[tokio::test]
async fn test_registration_window_closes_without_activity() {
    let air = Air::default();
    let settings = ServiceSettings {
        registration_wait: Duration::from_millis(100),
        ..ServiceSettings::default()
    };
    let mut beacon = node(&air, "sidekick", BEACON, settings);

    beacon.service.set_role(Role::Sidekick);
    beacon.service.start_setup_mode().await.unwrap();
    expect_event(&mut beacon.events, |e| *e == ServiceEvent::RegistrationStarted).await;
    expect_event(&mut beacon.events, |e| *e == ServiceEvent::RegistrationFinished).await;
    assert_eq!(beacon.service.state(), ServiceState::Setup);

    beacon.service.stop().await;
}

#[tokio::test]
async fn test_report_mode_checks_in_periodically() {
    let air = Air::default();
    let (mut beacon, mut phone) = registered_pair(&air).await;
    beacon.service.start_guard_mode().await.unwrap();

    phone.service.start_report_mode(BEACON, 100).await.unwrap();
    for _ in 0..2 {
        expect_event(&mut beacon.events, |e| {
            matches!(
                e,
                ServiceEvent::DataReceived { address, text, .. }
                    if address == PHONE && text == "REPORT"
            )
        })
        .await;
        let window = expect_event(&mut phone.events, |e| {
            matches!(e, ServiceEvent::ReportWindow { .. })
        })
        .await;
        assert_eq!(window, ServiceEvent::ReportWindow { window_ms: 10_000 });
    }

    phone.service.stop().await;
    beacon.service.stop().await;
}

#[tokio::test]
async fn test_report_check_in_during_guard() {
    let air = Air::default();
    let (beacon, mut phone) = registered_pair(&air).await;

    beacon.service.start_guard_mode().await.unwrap();
    assert_eq!(beacon.service.state(), ServiceState::Guard);

    phone.service.send_report_request(BEACON).await.unwrap();
    let window = expect_event(&mut phone.events, |e| {
        matches!(e, ServiceEvent::ReportWindow { .. })
    })
    .await;
    assert_eq!(window, ServiceEvent::ReportWindow { window_ms: 10_000 });
    assert_eq!(phone.service.state(), ServiceState::Report);

    beacon.service.stop().await;
    phone.service.stop().await;
}

#[tokio::test]
async fn test_register_refused_outside_setup() {
    let air = Air::default();
    let beacon = node(&air, "sidekick", BEACON, ServiceSettings::default());
    let mut phone = node(&air, "phone1", PHONE, ServiceSettings::default());

    // A guarding beacon still listens, but will not take registrations.
    beacon.service.set_role(Role::Sidekick);
    beacon.service.start_guard_mode().await.unwrap();
    wait_for_bridge(&beacon.bridge, BridgeState::Listening).await;

    phone.service.set_role(Role::Mobile);
    phone.service.start_setup_mode().await.unwrap();
    phone.service.send_register_request(BEACON).await.unwrap();

    let reply = expect_event(&mut phone.events, |e| {
        matches!(e, ServiceEvent::PeerReply { .. })
    })
    .await;
    assert!(matches!(reply, ServiceEvent::PeerReply { ok: false, .. }));
    assert_eq!(phone.service.state(), ServiceState::Setup);
    assert!(beacon.service.registry().guarded_items().is_empty());
    assert!(!beacon.alarm.is_playing());

    beacon.service.stop().await;
    phone.service.stop().await;
}

#[tokio::test]
async fn test_guard_detects_lost_and_found() {
    let air = Air::default();
    let settings = ServiceSettings {
        guard: GuardSettings {
            sleep_time: Duration::from_millis(50),
            alarm_enabled: true,
            check_mode: CheckMode::Discovery,
        },
        ..ServiceSettings::default()
    };
    let mut beacon = node(&air, "sidekick", BEACON, settings);
    let window = Duration::from_secs(10);
    beacon.service.registry().restore(
        &[
            ("a".to_string(), "00:00:00:00:00:0A".to_string()),
            ("b".to_string(), "00:00:00:00:00:0B".to_string()),
        ],
        window,
    );
    air.set_in_range(&[("a", "00:00:00:00:00:0A")]);

    beacon.service.set_role(Role::Sidekick);
    beacon.service.start_guard_mode().await.unwrap();

    expect_event(&mut beacon.events, |e| {
        *e == ServiceEvent::UpdateLost {
            name: "b".to_string(),
            address: "00:00:00:00:00:0B".to_string(),
            lost: true,
        }
    })
    .await;
    assert!(beacon.alarm.is_playing());

    air.set_in_range(&[("a", "00:00:00:00:00:0A"), ("b", "00:00:00:00:00:0B")]);
    expect_event(&mut beacon.events, |e| {
        *e == ServiceEvent::UpdateLost {
            name: "b".to_string(),
            address: "00:00:00:00:00:0B".to_string(),
            lost: false,
        }
    })
    .await;
    tokio::time::timeout(WAIT, async {
        while beacon.alarm.is_playing() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("alarm kept playing");

    beacon.service.stop().await;
    assert!(!beacon.alarm.is_playing());
    assert_eq!(beacon.service.state(), ServiceState::Unknown);
}

#[tokio::test]
async fn test_connect_failure_is_surfaced() {
    let air = Air::default();
    let phone = node(&air, "phone1", PHONE, ServiceSettings::default());
    phone.service.set_role(Role::Mobile);
    phone.service.start_setup_mode().await.unwrap();

    assert!(phone.service.send_register_request(BEACON).await.is_err());
    assert_eq!(phone.service.state(), ServiceState::Setup);
    assert!(phone.bridge.connections().is_empty());
    assert_eq!(phone.bridge.state(), BridgeState::Disconnected);
}
