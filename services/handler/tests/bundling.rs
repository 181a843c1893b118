//! Handler uplink path: copies of one uplink are merged into a single
//! application delivery and at most one downlink.
use std::sync::Arc;
use std::time::Duration;

use handler::{DevStorage, Handler, HandlerOptions};
use lw_core::{Eui64, MType, MacPayload, PhyPayload};
use lw_dutycycle::Region;
use lw_protocol::{
    APacket, Activation, Adapter, DutyState, ErrorKind, HPacket, Metadata, Packet, Recipient,
    Registration, marshal,
};
use lw_storage::KvStore;
use lw_test_utils::{
    DeviceKeys, FaultyStore, MockAdapter, MockSubscriber, RecordingAckNacker, eu_metadata,
    uplink_frame,
};

fn start() -> Handler {
    start_on(KvStore::open_in_memory().unwrap())
}

fn start_on(store: KvStore) -> Handler {
    Handler::start(
        DevStorage::new(store),
        HandlerOptions {
            bundle_delay: Duration::from_millis(50),
            processed_capacity: 100,
            region: Region::Europe,
            recipient: Recipient::from_name("handler-1"),
        },
    )
    .unwrap()
}

async fn register(handler: &Handler, keys: &DeviceKeys) {
    let an = RecordingAckNacker::new();
    handler
        .register(
            Registration::Handler {
                app_eui: keys.app_eui,
                dev_eui: keys.dev_eui,
                activation: Activation::Abp {
                    dev_addr: keys.dev_addr,
                    nwk_skey: keys.nwk_skey,
                    app_skey: keys.app_skey,
                },
            },
            &an,
            &MockSubscriber::new(),
        )
        .await
        .unwrap();
}

fn gateway(n: u8) -> Eui64 {
    Eui64::new([0xaa, 0x55, 0x5a, 0, 0, 0, 0, n])
}

fn copy_metadata(n: u8, rssi: i32, duty: DutyState) -> Metadata {
    let mut md = eu_metadata(868.1, rssi, 7.0);
    md.duty_rx1 = Some(duty);
    md.duty_rx2 = Some(duty);
    md.gateway = Some(gateway(n));
    md
}

fn copy(keys: &DeviceKeys, fcnt: u32, confirmed: bool, metadata: Metadata) -> Vec<u8> {
    marshal(&Packet::H(HPacket {
        app_eui: keys.app_eui,
        dev_eui: keys.dev_eui,
        payload: uplink_frame(keys, fcnt, b"temp=21", confirmed),
        metadata,
    }))
    .unwrap()
}

fn queue_downlink(keys: &DeviceKeys, payload: &[u8]) -> Vec<u8> {
    marshal(&Packet::A(APacket {
        app_eui: keys.app_eui,
        dev_eui: keys.dev_eui,
        payload: payload.to_vec(),
        metadata: Vec::new(),
    }))
    .unwrap()
}

fn app_deliveries(app: &MockAdapter) -> Vec<APacket> {
    app.sent()
        .into_iter()
        .map(|s| match s.packet {
            Packet::A(a) => a,
            other => panic!("expected apacket, got {other:?}"),
        })
        .collect()
}

#[tokio::test]
async fn copies_are_delivered_once_with_all_metadata() {
    let handler = start();
    let keys = DeviceKeys::sample(1);
    register(&handler, &keys).await;
    let app = Arc::new(MockAdapter::new());
    let up: Arc<dyn Adapter> = app.clone();

    let ans: Vec<RecordingAckNacker> = (0..3).map(|_| RecordingAckNacker::new()).collect();
    let datas: Vec<Vec<u8>> = [-90, -40, -70]
        .iter()
        .zip(1u8..)
        .map(|(rssi, n)| copy(&keys, 5, false, copy_metadata(n, *rssi, DutyState::HighlyAvailable)))
        .collect();

    let (a, b, c) = tokio::join!(
        handler.handle_up(&datas[0], &ans[0], up.clone()),
        handler.handle_up(&datas[1], &ans[1], up.clone()),
        handler.handle_up(&datas[2], &ans[2], up.clone()),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();

    for an in &ans {
        assert_eq!(an.acked(), None);
    }
    let delivered = app_deliveries(&app);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].payload, b"temp=21");
    assert_eq!(delivered[0].metadata.len(), 3);
    assert_eq!(app.sent()[0].recipients, vec![Recipient(keys.app_eui.0.to_vec())]);

    let device = handler.storage().lookup(keys.app_eui, keys.dev_eui).await.unwrap();
    assert_eq!(device.fcnt_up, 5);
}

#[tokio::test]
async fn queued_downlink_goes_to_the_strongest_copy_only() {
    let handler = start();
    let keys = DeviceKeys::sample(2);
    register(&handler, &keys).await;
    let down_an = RecordingAckNacker::new();
    handler
        .handle_down(&queue_downlink(&keys, b"pong"), &down_an)
        .await
        .unwrap();
    assert_eq!(down_an.acked(), None);

    let up: Arc<dyn Adapter> = Arc::new(MockAdapter::new());
    let weak = RecordingAckNacker::new();
    let strong = RecordingAckNacker::new();
    let weak_packet = copy(&keys, 9, false, copy_metadata(1, -100, DutyState::HighlyAvailable));
    let strong_packet = copy(&keys, 9, false, copy_metadata(2, -35, DutyState::HighlyAvailable));
    let (w, s) = tokio::join!(
        handler.handle_up(
            &weak_packet,
            &weak,
            up.clone()
        ),
        handler.handle_up(
            &strong_packet,
            &strong,
            up.clone()
        ),
    );
    w.unwrap();
    s.unwrap();

    assert_eq!(weak.acked(), None);
    let Some(Packet::B(downlink)) = strong.acked() else {
        panic!("expected the downlink on the strongest copy");
    };
    assert_eq!(downlink.metadata.gateway, Some(gateway(2)));
    assert_eq!(downlink.metadata.freq, Some(868.1));
    assert_eq!(downlink.metadata.tmst, Some(3_512_348_611 + 1_000_000));
    assert_eq!(
        downlink.payload.decrypt_frm_payload(&keys.app_skey).unwrap(),
        b"pong"
    );

    let err = handler
        .storage()
        .peek(keys.app_eui, keys.dev_eui)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
    let device = handler.storage().lookup(keys.app_eui, keys.dev_eui).await.unwrap();
    assert_eq!(device.fcnt_down, 1);
}

#[tokio::test]
async fn slow_datarates_answer_in_rx2() {
    let handler = start();
    let keys = DeviceKeys::sample(3);
    register(&handler, &keys).await;
    handler
        .handle_down(&queue_downlink(&keys, b"cfg"), &RecordingAckNacker::new())
        .await
        .unwrap();

    let mut md = copy_metadata(1, -80, DutyState::Available);
    md.datr = Some("SF10BW125".to_owned());
    let an = RecordingAckNacker::new();
    handler
        .handle_up(&copy(&keys, 1, false, md), &an, Arc::new(MockAdapter::new()))
        .await
        .unwrap();

    let Some(Packet::B(downlink)) = an.acked() else {
        panic!("expected a downlink");
    };
    assert_eq!(downlink.metadata.freq, Some(869.525));
    assert_eq!(downlink.metadata.datr.as_deref(), Some("SF9BW125"));
    assert_eq!(downlink.metadata.tmst, Some(3_512_348_611 + 2_000_000));
}

#[tokio::test]
async fn confirmed_uplink_is_acknowledged_without_queued_data() {
    let handler = start();
    let keys = DeviceKeys::sample(4);
    register(&handler, &keys).await;
    let an = RecordingAckNacker::new();
    handler
        .handle_up(
            &copy(&keys, 3, true, copy_metadata(1, -50, DutyState::HighlyAvailable)),
            &an,
            Arc::new(MockAdapter::new()),
        )
        .await
        .unwrap();

    let Some(Packet::B(downlink)) = an.acked() else {
        panic!("expected an ack-only downlink");
    };
    let mac = downlink.payload.mac_payload().unwrap();
    assert!(mac.fctrl.ack);
    assert!(mac.frm_payload.is_empty());
}

#[tokio::test]
async fn blocked_gateways_get_no_downlink_and_keep_the_queue() {
    let handler = start();
    let keys = DeviceKeys::sample(5);
    register(&handler, &keys).await;
    handler
        .handle_down(&queue_downlink(&keys, b"later"), &RecordingAckNacker::new())
        .await
        .unwrap();

    let an = RecordingAckNacker::new();
    handler
        .handle_up(
            &copy(&keys, 2, true, copy_metadata(1, -50, DutyState::Blocked)),
            &an,
            Arc::new(MockAdapter::new()),
        )
        .await
        .unwrap();
    assert_eq!(an.acked(), None);
    assert_eq!(
        handler
            .storage()
            .peek(keys.app_eui, keys.dev_eui)
            .await
            .unwrap(),
        b"later"
    );
}

#[tokio::test]
async fn port_zero_uplinks_are_decrypted_with_the_network_key() {
    let handler = start();
    let keys = DeviceKeys::sample(9);
    register(&handler, &keys).await;

    let mut mac = MacPayload::new(keys.dev_addr, 1);
    mac.fport = Some(0);
    mac.frm_payload = vec![0x02, 0x03];
    let mut frame = PhyPayload::data(MType::UnconfirmedDataUp, mac);
    frame.encrypt_frm_payload(&keys.nwk_skey);
    frame.set_mic(&keys.nwk_skey).unwrap();
    let data = marshal(&Packet::H(HPacket {
        app_eui: keys.app_eui,
        dev_eui: keys.dev_eui,
        payload: frame,
        metadata: copy_metadata(1, -50, DutyState::HighlyAvailable),
    }))
    .unwrap();

    let app = Arc::new(MockAdapter::new());
    handler
        .handle_up(&data, &RecordingAckNacker::new(), app.clone())
        .await
        .unwrap();
    assert_eq!(app_deliveries(&app)[0].payload, vec![0x02, 0x03]);
}

#[tokio::test]
async fn failed_device_write_keeps_the_queued_downlink() {
    let faults = FaultyStore::new();
    let handler = start_on(faults.open());
    let keys = DeviceKeys::sample(10);
    register(&handler, &keys).await;
    handler
        .handle_down(&queue_downlink(&keys, b"cmd"), &RecordingAckNacker::new())
        .await
        .unwrap();

    faults.fail_writes("devices", None);
    let an = RecordingAckNacker::new();
    handler
        .handle_up(
            &copy(&keys, 1, false, copy_metadata(1, -50, DutyState::HighlyAvailable)),
            &an,
            Arc::new(MockAdapter::new()),
        )
        .await
        .unwrap_err();
    assert_eq!(an.nacked().kind, ErrorKind::Operational);
    faults.heal();

    assert_eq!(
        handler
            .storage()
            .peek(keys.app_eui, keys.dev_eui)
            .await
            .unwrap(),
        b"cmd"
    );
    let device = handler.storage().lookup(keys.app_eui, keys.dev_eui).await.unwrap();
    assert_eq!(device.fcnt_down, 0);
}

#[tokio::test]
async fn late_copy_after_flush_is_rejected() {
    let handler = start();
    let keys = DeviceKeys::sample(6);
    register(&handler, &keys).await;
    let up: Arc<dyn Adapter> = Arc::new(MockAdapter::new());
    let data = copy(&keys, 11, false, copy_metadata(1, -50, DutyState::HighlyAvailable));

    handler
        .handle_up(&data, &RecordingAckNacker::new(), up.clone())
        .await
        .unwrap();

    let late = RecordingAckNacker::new();
    let err = handler.handle_up(&data, &late, up.clone()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Behavioural);
    assert_eq!(late.nacked().message, "already processed");

    // The next frame is a new bundle.
    let next = copy(&keys, 12, false, copy_metadata(1, -50, DutyState::HighlyAvailable));
    handler
        .handle_up(&next, &RecordingAckNacker::new(), up)
        .await
        .unwrap();
}

#[tokio::test]
async fn application_failure_is_sent_to_every_copy() {
    let handler = start();
    let keys = DeviceKeys::sample(7);
    register(&handler, &keys).await;
    let app = MockAdapter::new();
    app.push_response(Err(lw_protocol::Error::operational("application offline")));
    let up: Arc<dyn Adapter> = Arc::new(app);

    let first = RecordingAckNacker::new();
    let second = RecordingAckNacker::new();
    let first_packet = copy(&keys, 1, false, copy_metadata(1, -60, DutyState::HighlyAvailable));
    let second_packet = copy(&keys, 1, false, copy_metadata(2, -61, DutyState::HighlyAvailable));
    let (a, b) = tokio::join!(
        handler.handle_up(
            &first_packet,
            &first,
            up.clone()
        ),
        handler.handle_up(
            &second_packet,
            &second,
            up.clone()
        ),
    );
    assert!(a.is_err() && b.is_err());
    assert_eq!(first.nacked().kind, ErrorKind::Operational);
    assert_eq!(second.nacked().kind, ErrorKind::Operational);
}

#[tokio::test]
async fn unknown_devices_are_not_found() {
    let handler = start();
    let keys = DeviceKeys::sample(8);
    let an = RecordingAckNacker::new();
    handler
        .handle_up(
            &copy(&keys, 1, false, copy_metadata(1, -60, DutyState::HighlyAvailable)),
            &an,
            Arc::new(MockAdapter::new()),
        )
        .await
        .unwrap_err();
    assert_eq!(an.nacked().kind, ErrorKind::NotFound);

    let down = RecordingAckNacker::new();
    handler
        .handle_down(&queue_downlink(&keys, b"x"), &down)
        .await
        .unwrap_err();
    assert_eq!(down.nacked().kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn wrong_packet_kinds_are_structural() {
    let handler = start();
    let keys = DeviceKeys::sample(1);
    let an = RecordingAckNacker::new();
    handler
        .handle_up(&queue_downlink(&keys, b"x"), &an, Arc::new(MockAdapter::new()))
        .await
        .unwrap_err();
    assert_eq!(an.nacked().kind, ErrorKind::Structural);
}

#[tokio::test]
async fn registrations_subscribe_upstream() {
    let handler = start();
    let keys = DeviceKeys::sample(1);
    let subscriber = MockSubscriber::new();

    handler
        .register(
            Registration::Handler {
                app_eui: keys.app_eui,
                dev_eui: keys.dev_eui,
                activation: Activation::Abp {
                    dev_addr: keys.dev_addr,
                    nwk_skey: keys.nwk_skey,
                    app_skey: keys.app_skey,
                },
            },
            &RecordingAckNacker::new(),
            &subscriber,
        )
        .await
        .unwrap();
    let otaa_dev = Eui64::new([0, 0, 0, 0, 0, 0, 0, 0x42]);
    handler
        .register(
            Registration::Handler {
                app_eui: keys.app_eui,
                dev_eui: otaa_dev,
                activation: Activation::Otaa {
                    app_key: keys.nwk_skey,
                },
            },
            &RecordingAckNacker::new(),
            &subscriber,
        )
        .await
        .unwrap();

    let regs = subscriber.registrations();
    assert_eq!(
        regs[0],
        Registration::Broker {
            app_eui: keys.app_eui,
            dev_eui: keys.dev_eui,
            dev_addr: keys.dev_addr,
            nwk_skey: keys.nwk_skey,
            recipient: Recipient::from_name("handler-1"),
        }
    );
    assert_eq!(
        regs[1],
        Registration::Application {
            app_eui: keys.app_eui,
            recipient: Recipient::from_name("handler-1"),
        }
    );
    assert!(
        !handler
            .storage()
            .lookup(keys.app_eui, otaa_dev)
            .await
            .unwrap()
            .is_abp()
    );
}

#[tokio::test]
async fn failed_subscription_and_foreign_registrations_are_nacked() {
    let handler = start();
    let keys = DeviceKeys::sample(1);

    let an = RecordingAckNacker::new();
    handler
        .register(
            Registration::Handler {
                app_eui: keys.app_eui,
                dev_eui: keys.dev_eui,
                activation: Activation::Otaa {
                    app_key: keys.app_skey,
                },
            },
            &an,
            &MockSubscriber::failing(lw_protocol::Error::operational("broker unreachable")),
        )
        .await
        .unwrap_err();
    assert_eq!(an.nacked().kind, ErrorKind::Operational);

    let foreign = RecordingAckNacker::new();
    handler
        .register(
            Registration::Router {
                dev_eui: keys.dev_eui,
                recipient: Recipient::from_name("x"),
            },
            &foreign,
            &MockSubscriber::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(foreign.nacked().kind, ErrorKind::Structural);
}
