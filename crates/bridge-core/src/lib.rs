//! ShadowBridge relay core: pending-request lifecycle, device sessions,
//! and the remote-approval coordinator. Transport and persistence are
//! seams; the relay binary supplies the websocket transport and this crate
//! ships an in-memory ledger.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod ledger;
pub mod notifier;
pub mod registry;
pub mod request;
pub mod transport;

pub use config::BridgeConfig;
pub use coordinator::Coordinator;
pub use error::{BridgeError, BridgeResult};
pub use ledger::{InMemoryLedger, RequestLedger};
pub use notifier::{BridgeEvent, EventFilter, EventStream, Notifier};
pub use registry::{ConnectivityState, Device, SessionRegistry};
pub use request::{OperationKind, Request, RequestStatus, Resolver};
pub use transport::{ChannelTransport, DeviceTransport};
