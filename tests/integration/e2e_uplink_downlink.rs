//! Whole pipeline in one process: a gateway uplink travels Router → Broker →
//! Handler → application, and a queued downlink travels back.
use std::time::Duration;

use lorawan_stack::config::{DeviceConfig, StackConfig, load_config_from_str};
use lorawan_stack::node::{Node, NodeStores};
use lw_core::{Eui64, MType};
use lw_dutycycle::SubBand;
use lw_protocol::{ErrorKind, Packet, RPacket};
use lw_test_utils::{DeviceKeys, eu_metadata, uplink_frame};

const GW: Eui64 = Eui64::new([0xaa, 0x55, 0x5a, 0, 0, 0, 0, 1]);
const TMST: u32 = 3_512_348_611;

fn config(duty_cycle_secs: u64) -> StackConfig {
    load_config_from_str(&format!(
        "schema_version = 1\n\
         [router]\nduty_cycle_secs = {duty_cycle_secs}\n\
         [handler]\nbundle_delay_ms = 50\n\
         [transport]\nresponse_timeout_ms = 2000\n"
    ))
    .unwrap()
}

fn device(keys: &DeviceKeys) -> DeviceConfig {
    DeviceConfig {
        app_eui: keys.app_eui,
        dev_eui: keys.dev_eui,
        dev_addr: keys.dev_addr,
        nwk_skey: keys.nwk_skey,
        app_skey: keys.app_skey,
    }
}

async fn node_with(keys: &DeviceKeys, duty_cycle_secs: u64) -> Node {
    let node = Node::start(NodeStores::in_memory().unwrap(), &config(duty_cycle_secs)).unwrap();
    node.register_device(&device(keys)).await.unwrap();
    node
}

fn uplink(keys: &DeviceKeys, fcnt: u32, clear: &[u8]) -> Packet {
    Packet::R(RPacket {
        gateway_id: GW,
        payload: uplink_frame(keys, fcnt, clear, false),
        metadata: eu_metadata(868.1, -40, 8.0),
    })
}

fn downlink(answer: Option<Packet>) -> RPacket {
    match answer {
        Some(Packet::R(p)) => p,
        other => panic!("expected a downlink, got {other:?}"),
    }
}

#[tokio::test]
async fn uplink_reaches_the_application() {
    let keys = DeviceKeys::sample(1);
    let node = node_with(&keys, 3600).await;
    let mut feed = node.sink().subscribe();

    let answer = node.uplink(&uplink(&keys, 1, b"temp=21")).await.unwrap();
    assert_eq!(answer, None);

    let apacket = tokio::time::timeout(Duration::from_secs(1), feed.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(apacket.dev_eui, keys.dev_eui);
    assert_eq!(apacket.payload, b"temp=21");
    assert_eq!(apacket.metadata.len(), 1);
    assert_eq!(apacket.metadata[0].gateway, Some(GW));

    let entry = node.broker().controller().lookup_devices(keys.dev_addr).await.unwrap();
    assert_eq!(entry[0].fcnt_up, 1);
    node.shutdown().await;
}

#[tokio::test]
async fn queued_downlink_is_sent_in_rx1_and_accounted() {
    let keys = DeviceKeys::sample(1);
    let node = node_with(&keys, 3600).await;
    node.enqueue_downlink(keys.app_eui, keys.dev_eui, b"on".to_vec())
        .await
        .unwrap();

    let answer = downlink(node.uplink(&uplink(&keys, 1, b"temp=21")).await.unwrap());
    assert_eq!(answer.gateway_id, GW);
    assert_eq!(answer.payload.mtype(), MType::UnconfirmedDataDown);
    assert!(answer.payload.validate_mic(&keys.nwk_skey).unwrap());
    assert_eq!(answer.payload.decrypt_frm_payload(&keys.app_skey).unwrap(), b"on");
    assert_eq!(answer.payload.fcnt(), Some(0));
    assert_eq!(answer.metadata.freq, Some(868.1));
    assert_eq!(answer.metadata.tmst, Some(TMST + 1_000_000));

    let cycles = node.router().duty().lookup(GW).await.unwrap();
    assert!(cycles.contains_key(&SubBand::G1));

    let device = node.handler().storage().lookup(keys.app_eui, keys.dev_eui).await.unwrap();
    assert_eq!(device.fcnt_down, 1);
    assert_eq!(device.fcnt_up, 1);
    node.shutdown().await;
}

#[tokio::test]
async fn busy_rx1_band_moves_the_downlink_to_rx2() {
    let keys = DeviceKeys::sample(1);
    // A 2 s cycle makes a single SF7 downlink exhaust the 1% of band G1.
    let node = node_with(&keys, 2).await;

    node.enqueue_downlink(keys.app_eui, keys.dev_eui, b"one".to_vec())
        .await
        .unwrap();
    let first = downlink(node.uplink(&uplink(&keys, 1, b"a")).await.unwrap());
    assert_eq!(first.metadata.freq, Some(868.1));

    node.enqueue_downlink(keys.app_eui, keys.dev_eui, b"two".to_vec())
        .await
        .unwrap();
    let second = downlink(node.uplink(&uplink(&keys, 2, b"b")).await.unwrap());
    assert_eq!(second.metadata.freq, Some(869.525));
    assert_eq!(second.metadata.datr.as_deref(), Some("SF9BW125"));
    assert_eq!(second.metadata.tmst, Some(TMST + 2_000_000));
    assert_eq!(second.payload.fcnt(), Some(1));
    assert_eq!(second.payload.decrypt_frm_payload(&keys.app_skey).unwrap(), b"two");
    node.shutdown().await;
}

#[tokio::test]
async fn unknown_device_is_not_found() {
    let keys = DeviceKeys::sample(1);
    let node = node_with(&keys, 3600).await;
    let stranger = DeviceKeys::sample(9).with_dev_addr(lw_core::DevAddr([1, 2, 3, 4]));

    let err = node.uplink(&uplink(&stranger, 1, b"x")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
    node.shutdown().await;
}

#[tokio::test]
async fn replayed_frame_is_refused() {
    let keys = DeviceKeys::sample(1);
    let node = node_with(&keys, 3600).await;

    node.uplink(&uplink(&keys, 4, b"once")).await.unwrap();
    let err = node.uplink(&uplink(&keys, 4, b"once")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Behavioural);
    node.shutdown().await;
}

#[tokio::test]
async fn downlink_for_unknown_device_is_refused() {
    let keys = DeviceKeys::sample(1);
    let node = node_with(&keys, 3600).await;
    let err = node
        .enqueue_downlink(keys.app_eui, Eui64::new([9; 8]), b"x".to_vec())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
    node.shutdown().await;
}
