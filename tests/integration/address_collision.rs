//! Devices sharing a device address are told apart by their MIC.
use std::time::Duration;

use lorawan_stack::config::{DeviceConfig, load_config_from_str};
use lorawan_stack::node::{Node, NodeStores};
use lw_core::{DevAddr, Eui64};
use lw_protocol::{APacket, ErrorKind, Packet, RPacket};
use lw_test_utils::{DeviceKeys, eu_metadata, uplink_frame};
use tokio::sync::broadcast;

const GW: Eui64 = Eui64::new([0xaa, 0x55, 0x5a, 0, 0, 0, 0, 7]);

fn device(keys: &DeviceKeys) -> DeviceConfig {
    DeviceConfig {
        app_eui: keys.app_eui,
        dev_eui: keys.dev_eui,
        dev_addr: keys.dev_addr,
        nwk_skey: keys.nwk_skey,
        app_skey: keys.app_skey,
    }
}

async fn start(devices: &[&DeviceKeys]) -> Node {
    let config = load_config_from_str("schema_version = 1\n[handler]\nbundle_delay_ms = 30\n").unwrap();
    let node = Node::start(NodeStores::in_memory().unwrap(), &config).unwrap();
    for keys in devices {
        node.register_device(&device(keys)).await.unwrap();
    }
    node
}

fn uplink(keys: &DeviceKeys, fcnt: u32, clear: &[u8]) -> Packet {
    Packet::R(RPacket {
        gateway_id: GW,
        payload: uplink_frame(keys, fcnt, clear, false),
        metadata: eu_metadata(867.1, -60, 7.5),
    })
}

async fn next(feed: &mut broadcast::Receiver<APacket>) -> APacket {
    tokio::time::timeout(Duration::from_secs(1), feed.recv())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn each_device_is_resolved_by_its_own_keys() {
    let first = DeviceKeys::sample(1);
    let second = DeviceKeys::sample(2);
    assert_eq!(first.dev_addr, second.dev_addr);
    let node = start(&[&first, &second]).await;
    let mut feed = node.sink().subscribe();

    node.uplink(&uplink(&second, 12, b"from-second")).await.unwrap();
    let apacket = next(&mut feed).await;
    assert_eq!(apacket.dev_eui, second.dev_eui);
    assert_eq!(apacket.payload, b"from-second");

    node.uplink(&uplink(&first, 3, b"from-first")).await.unwrap();
    let apacket = next(&mut feed).await;
    assert_eq!(apacket.dev_eui, first.dev_eui);
    assert_eq!(apacket.payload, b"from-first");

    let entries = node
        .broker()
        .controller()
        .lookup_devices(first.dev_addr)
        .await
        .unwrap();
    let counter = |dev_eui: Eui64| {
        entries
            .iter()
            .find(|e| e.dev_eui == dev_eui)
            .map(|e| e.fcnt_up)
    };
    assert_eq!(counter(first.dev_eui), Some(3));
    assert_eq!(counter(second.dev_eui), Some(12));
    node.shutdown().await;
}

#[tokio::test]
async fn unregistered_keys_on_a_shared_address_match_nobody() {
    let first = DeviceKeys::sample(1);
    let second = DeviceKeys::sample(2);
    let intruder = DeviceKeys::sample(3);
    let node = start(&[&first, &second]).await;

    let err = node.uplink(&uplink(&intruder, 1, b"x")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
    node.shutdown().await;
}

#[tokio::test]
async fn readdressed_device_leaves_its_old_address() {
    let first = DeviceKeys::sample(1);
    let second = DeviceKeys::sample(2);
    let node = start(&[&first, &second]).await;
    let mut feed = node.sink().subscribe();

    let moved = first.clone().with_dev_addr(DevAddr([0x26, 0x01, 0x99, 0x99]));
    node.register_device(&device(&moved)).await.unwrap();

    let left = node
        .broker()
        .controller()
        .lookup_devices(second.dev_addr)
        .await
        .unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].dev_eui, second.dev_eui);

    node.uplink(&uplink(&moved, 1, b"moved")).await.unwrap();
    let apacket = next(&mut feed).await;
    assert_eq!(apacket.dev_eui, first.dev_eui);
    assert_eq!(apacket.payload, b"moved");
    node.shutdown().await;
}
