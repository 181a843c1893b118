//! One uplink heard by several gateways: a single application delivery and a
//! single downlink, sent by the gateway with the best reception.
use std::time::Duration;

use lorawan_stack::config::{DeviceConfig, load_config_from_str};
use lorawan_stack::node::{Node, NodeStores};
use lw_core::Eui64;
use lw_protocol::{Packet, RPacket};
use lw_test_utils::{DeviceKeys, eu_metadata, uplink_frame};
use tokio::sync::broadcast::error::TryRecvError;

fn gateway(n: u8) -> Eui64 {
    Eui64::new([0xaa, 0x55, 0x5a, 0, 0, 0, 0, n])
}

async fn start(keys: &DeviceKeys) -> Node {
    let config = load_config_from_str(
        "schema_version = 1\n[handler]\nbundle_delay_ms = 100\n[transport]\nresponse_timeout_ms = 2000\n",
    )
    .unwrap();
    let node = Node::start(NodeStores::in_memory().unwrap(), &config).unwrap();
    node.register_device(&DeviceConfig {
        app_eui: keys.app_eui,
        dev_eui: keys.dev_eui,
        dev_addr: keys.dev_addr,
        nwk_skey: keys.nwk_skey,
        app_skey: keys.app_skey,
    })
    .await
    .unwrap();
    node
}

fn copy(keys: &DeviceKeys, gw: u8, rssi: i32, lsnr: f64) -> Packet {
    Packet::R(RPacket {
        gateway_id: gateway(gw),
        payload: uplink_frame(keys, 7, b"door=open", false),
        metadata: eu_metadata(868.3, rssi, lsnr),
    })
}

#[tokio::test]
async fn copies_are_merged_into_one_delivery() {
    let keys = DeviceKeys::sample(3);
    let node = start(&keys).await;
    let mut feed = node.sink().subscribe();

    let (p1, p2, p3) = (
        copy(&keys, 1, -90, 2.0),
        copy(&keys, 2, -40, 9.0),
        copy(&keys, 3, -70, 4.0),
    );
    let (a, b, c) = tokio::join!(node.uplink(&p1), node.uplink(&p2), node.uplink(&p3));
    assert_eq!(a.unwrap(), None);
    assert_eq!(b.unwrap(), None);
    assert_eq!(c.unwrap(), None);

    let apacket = tokio::time::timeout(Duration::from_secs(1), feed.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(apacket.payload, b"door=open");
    let mut seen: Vec<_> = apacket.metadata.iter().filter_map(|m| m.gateway).collect();
    seen.sort();
    assert_eq!(seen, vec![gateway(1), gateway(2), gateway(3)]);
    assert!(matches!(feed.try_recv(), Err(TryRecvError::Empty)));
    node.shutdown().await;
}

#[tokio::test]
async fn downlink_goes_through_the_strongest_gateway_only() {
    let keys = DeviceKeys::sample(3);
    let node = start(&keys).await;
    node.enqueue_downlink(keys.app_eui, keys.dev_eui, b"lock".to_vec())
        .await
        .unwrap();

    let (p1, p2, p3) = (
        copy(&keys, 1, -90, 2.0),
        copy(&keys, 2, -40, 9.0),
        copy(&keys, 3, -70, 4.0),
    );
    let (a, b, c) = tokio::join!(node.uplink(&p1), node.uplink(&p2), node.uplink(&p3));
    let answers: Vec<_> = [a, b, c].into_iter().map(Result::unwrap).collect();
    let downlinks: Vec<RPacket> = answers
        .into_iter()
        .filter_map(|answer| match answer {
            Some(Packet::R(p)) => Some(p),
            _ => None,
        })
        .collect();
    assert_eq!(downlinks.len(), 1);
    assert_eq!(downlinks[0].gateway_id, gateway(2));
    assert_eq!(
        downlinks[0].payload.decrypt_frm_payload(&keys.app_skey).unwrap(),
        b"lock"
    );

    // Only the elected gateway spent airtime.
    assert!(!node.router().duty().lookup(gateway(2)).await.unwrap().is_empty());
    assert!(node.router().duty().lookup(gateway(1)).await.unwrap().is_empty());
    assert!(node.router().duty().lookup(gateway(3)).await.unwrap().is_empty());
    node.shutdown().await;
}

#[tokio::test]
async fn copy_arriving_after_the_flush_is_refused() {
    let keys = DeviceKeys::sample(3);
    let node = start(&keys).await;

    node.uplink(&copy(&keys, 1, -60, 6.0)).await.unwrap();
    let err = node.uplink(&copy(&keys, 2, -50, 6.0)).await.unwrap_err();
    assert_eq!(err.kind, lw_protocol::ErrorKind::Behavioural);
    node.shutdown().await;
}
