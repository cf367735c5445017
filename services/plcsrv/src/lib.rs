//! PLC communication core (`plcsrv`)
//!
//! Talks Modbus TCP to a press controller and exposes its process variables as
//! named, typed signals.
//!
//! - [`address`]: vendor memory areas (Omron, Siemens, Mitsubishi) to Modbus addresses
//! - [`transport`]: serialized Modbus client with timeouts, retries and auto-reconnect
//! - [`signal`]: signal definitions, register codec and the signal registry
//! - [`poller`]: periodic sampling with change detection
//! - [`service`]: the facade that owns one transport and wires the rest around it

pub mod address;
pub mod config;
pub mod device;
pub mod error;
pub mod poller;
pub mod service;
pub mod signal;
pub mod transport;

pub use address::{AddressTranslator, AreaType, ProcessorType};
pub use config::PlcsrvConfig;
pub use device::DeviceConfig;
pub use error::{PlcError, Result};
pub use poller::{Poller, PollerEvent};
pub use service::{PlcService, SignalSummary};
pub use signal::{SignalDefinition, SignalRegistry, SignalValue};
pub use transport::{ConnectionState, TransportClient, TransportConfig, TransportEvent};
