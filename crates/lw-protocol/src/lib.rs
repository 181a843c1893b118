// lw-protocol: packets, registrations and component contracts.
//
// Every component of the pipeline speaks in terms of the closed `Packet` and
// `Registration` variants defined here, classifies failures with `ErrorKind`,
// and talks to its neighbours through the `Adapter` / `AckNacker` /
// `Subscriber` traits.

pub mod adapter;
pub mod errors;
pub mod metadata;
pub mod packets;
pub mod registration;

pub use adapter::{
    AckGuard, AckNacker, AckReceiver, Adapter, BoxFuture, OneshotAckNacker, Subscriber,
    ensure_ack_nack,
};
pub use errors::{Error, ErrorKind, Result};
pub use metadata::{DutyState, GatewayStats, Metadata};
pub use packets::{
    APacket, BPacket, HPacket, JPacket, Packet, RPacket, SPacket, WIRE_VERSION, advance_counter,
    marshal, unmarshal, whole_counter,
};
pub use registration::{Activation, Recipient, Registration};
