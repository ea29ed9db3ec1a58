//! The `broker` module is the relay's side of the MQTT conversation: topic
//! matching, message types, per-broker sessions and the supervisor that
//! owns them.

pub mod message;
pub mod session;
pub mod supervisor;
pub mod topic;

pub use message::{InboundMessage, Payload, QoS};
pub use session::{ClientSession, MessageHandler};
pub use supervisor::{BrokerStatus, OverallStatus, RelayStatus, Supervisor};
pub use topic::topic_matches;
