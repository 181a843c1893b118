//! SemTech UDP front end against a real socket: acks, uplink delivery and a
//! PULL_RESP downlink to the gateway's pull address.
use std::net::SocketAddr;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use lorawan_stack::config::{DeviceConfig, load_config_from_str};
use lorawan_stack::node::{Node, NodeStores};
use lw_core::{Eui64, PhyPayload};
use lw_test_utils::{DeviceKeys, uplink_frame};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const GW: [u8; 8] = [0xaa, 0x55, 0x5a, 0, 0, 0, 0, 0x42];
const TMST: u32 = 1_000_000;

struct Harness {
    node: Node,
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    server: JoinHandle<std::io::Result<()>>,
}

impl Harness {
    async fn start(keys: &DeviceKeys) -> Self {
        let config = load_config_from_str(
            "schema_version = 1\n[handler]\nbundle_delay_ms = 50\n[transport]\nresponse_timeout_ms = 2000\n",
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
        let server = node.bind_gateway("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let (shutdown, rx) = watch::channel(false);
        let server = tokio::spawn(server.run(rx));
        Self {
            node,
            addr,
            shutdown,
            server,
        }
    }

    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        self.server.await.unwrap().unwrap();
        self.node.shutdown().await;
    }
}

fn datagram(token: [u8; 2], command: u8, json: Option<&str>) -> Vec<u8> {
    let mut buf = vec![0x02, token[0], token[1], command];
    buf.extend_from_slice(&GW);
    if let Some(json) = json {
        buf.extend_from_slice(json.as_bytes());
    }
    buf
}

fn rxpk_json(frame: &PhyPayload) -> String {
    let data = B64.encode(frame.encode().unwrap());
    format!(
        r#"{{"rxpk":[{{"tmst":{TMST},"chan":0,"rfch":0,"freq":868.1,"stat":1,"modu":"LORA",
            "datr":"SF7BW125","codr":"4/5","rssi":-42,"lsnr":8.5,"size":20,"data":"{data}"}}]}}"#
    )
}

async fn recv(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = vec![0u8; 2048];
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .expect("no datagram from the gateway server")
        .unwrap();
    buf.truncate(len);
    buf
}

#[tokio::test]
async fn pull_and_push_are_acknowledged() {
    let keys = DeviceKeys::sample(4);
    let harness = Harness::start(&keys).await;
    let gateway = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    gateway
        .send_to(&datagram([0xab, 0xcd], 0x02, None), harness.addr)
        .await
        .unwrap();
    assert_eq!(recv(&gateway).await, vec![0x02, 0xab, 0xcd, 0x04]);

    let stat = r#"{"stat":{"time":"2014-01-12 08:59:28 GMT","rxnb":2,"rxok":2,"rxfw":2,"ackr":100.0,"dwnb":2,"txnb":2}}"#;
    gateway
        .send_to(&datagram([0x01, 0x02], 0x00, Some(stat)), harness.addr)
        .await
        .unwrap();
    assert_eq!(recv(&gateway).await, vec![0x02, 0x01, 0x02, 0x01]);
    harness.stop().await;
}

#[tokio::test]
async fn junk_does_not_stop_the_listener() {
    let keys = DeviceKeys::sample(4);
    let harness = Harness::start(&keys).await;
    let gateway = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    gateway.send_to(&[0x09, 0x00], harness.addr).await.unwrap();
    gateway
        .send_to(&datagram([0, 1], 0x00, Some("{not json")), harness.addr)
        .await
        .unwrap();
    gateway
        .send_to(&datagram([0, 2], 0x02, None), harness.addr)
        .await
        .unwrap();
    assert_eq!(recv(&gateway).await, vec![0x02, 0x00, 0x02, 0x04]);
    harness.stop().await;
}

#[tokio::test]
async fn uplink_is_delivered_and_downlink_pulled_back() {
    let keys = DeviceKeys::sample(4);
    let harness = Harness::start(&keys).await;
    let mut feed = harness.node.sink().subscribe();
    harness
        .node
        .enqueue_downlink(keys.app_eui, keys.dev_eui, b"reboot".to_vec())
        .await
        .unwrap();

    let gateway = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    gateway
        .send_to(&datagram([0, 9], 0x02, None), harness.addr)
        .await
        .unwrap();
    assert_eq!(recv(&gateway).await[3], 0x04);

    let frame = uplink_frame(&keys, 1, b"hello", false);
    gateway
        .send_to(&datagram([0x12, 0x34], 0x00, Some(&rxpk_json(&frame))), harness.addr)
        .await
        .unwrap();
    assert_eq!(recv(&gateway).await, vec![0x02, 0x12, 0x34, 0x01]);

    let resp = recv(&gateway).await;
    assert_eq!(resp[0], 0x02);
    assert_eq!(resp[3], 0x03);
    let json: serde_json::Value = serde_json::from_slice(&resp[4..]).unwrap();
    let txpk = &json["txpk"];
    assert_eq!(txpk["freq"].as_f64(), Some(868.1));
    assert_eq!(txpk["tmst"].as_u64(), Some(u64::from(TMST) + 1_000_000));
    assert_eq!(txpk["datr"], "SF7BW125");
    assert_eq!(txpk["ipol"], true);

    let bytes = B64.decode(txpk["data"].as_str().unwrap()).unwrap();
    let downlink = PhyPayload::decode(&bytes).unwrap();
    assert!(downlink.validate_mic(&keys.nwk_skey).unwrap());
    assert_eq!(downlink.decrypt_frm_payload(&keys.app_skey).unwrap(), b"reboot");

    let apacket = tokio::time::timeout(Duration::from_secs(1), feed.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(apacket.payload, b"hello");
    assert_eq!(apacket.metadata[0].gateway, Some(Eui64::new(GW)));
    harness.stop().await;
}
