// # -----------------------------
// # crates/common/src/lib.rs
// # -----------------------------
//! Shared control-plane building blocks: message envelope and addressing,
//! the bus contract, the permission store, the satellite registry, the
//! correlation/promise table and the external collaborator boundaries.

pub mod bus;
pub mod envelope;
pub mod error;
pub mod permissions;
pub mod promise;
pub mod providers;
pub mod registry;
pub mod tcp_bus;

pub use bus::{Bus, BusError, Exchange, MemoryBus};
pub use envelope::{
    is_pool_name, now_ts, topic_matches, Envelope, MessageKind, RoutingKey, HQ_KEY,
    MANAGERS_TOPIC, STDOUT_KEY, WORKERS_TOPIC,
};
pub use error::ControlError;
pub use permissions::{PermissionStore, Screen, ScreenKey, ALL_PERMISSION};
pub use promise::{PromiseTable, Receipt, ReceiptStatus};
pub use providers::{
    AccountProvisioner, ObjectStore, ObjectStoreCreds, ProviderFault, ServerSupervisor,
};
pub use registry::{Registration, SatelliteRegistry};
pub use tcp_bus::TcpBus;
