//! Service facade
//!
//! Owns the one [`TransportClient`] and wires the registry and poller around
//! it. External layers (CLI, bridges) talk to the PLC only through this type.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::address::AddressTranslator;
use crate::config::PlcsrvConfig;
use crate::device::DeviceConfig;
use crate::error::{PlcError, Result};
use crate::poller::Poller;
use crate::signal::{DataType, Direction, SignalDefinition, SignalRegistry, SignalValue};
use crate::transport::{Connector, TransportClient};

/// Per-signal row handed to display layers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalSummary {
    pub id: i64,
    pub signal_code: String,
    pub signal_name: String,
    pub signal_type: Direction,
    pub data_type: DataType,
    pub unit: String,
    pub param_group: String,
    pub is_active: bool,
    /// Last polled value, if any
    pub value: Option<SignalValue>,
}

pub struct PlcService {
    config: PlcsrvConfig,
    transport: TransportClient,
    registry: Arc<SignalRegistry>,
    poller: Poller,
}

impl std::fmt::Debug for PlcService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlcService")
            .field("transport", &self.transport)
            .field("registry", &self.registry)
            .field("poller", &self.poller)
            .finish()
    }
}

impl PlcService {
    /// Service over the Modbus TCP backend
    pub fn new(config: PlcsrvConfig) -> Self {
        let transport = TransportClient::tcp(config.transport_config());
        Self::assemble(config, transport)
    }

    /// Service over a custom backend
    pub fn with_connector(config: PlcsrvConfig, connector: Arc<dyn Connector>) -> Self {
        let transport = TransportClient::with_connector(connector, config.transport_config());
        Self::assemble(config, transport)
    }

    fn assemble(config: PlcsrvConfig, transport: TransportClient) -> Self {
        let translator = AddressTranslator::new(config.processor());
        let registry = Arc::new(SignalRegistry::new(
            transport.clone(),
            translator,
            config.registry_options(),
        ));
        let poller = Poller::new(Arc::clone(&registry));
        Self {
            config,
            transport,
            registry,
            poller,
        }
    }

    pub fn config(&self) -> &PlcsrvConfig {
        &self.config
    }

    pub fn device(&self) -> &DeviceConfig {
        &self.config.device
    }

    pub fn transport(&self) -> &TransportClient {
        &self.transport
    }

    pub fn registry(&self) -> &Arc<SignalRegistry> {
        &self.registry
    }

    pub fn poller(&self) -> &Poller {
        &self.poller
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Connect, load signals and start polling as configured.
    ///
    /// Connection progress is asynchronous; an unreachable device is retried
    /// by the reconnect timer rather than failing here.
    pub fn start(&self) -> Result<()> {
        self.transport
            .set_auto_reconnect(self.config.reconnect.enabled, self.config.reconnect_interval());
        self.connect_device()?;

        if self.config.signals_file.is_some() {
            let count = self.reload_signals()?;
            if count == 0 {
                warn!("No signals loaded, polling will publish nothing");
            }
        }

        if self.config.polling.autostart {
            self.poller.start(self.config.poll_interval());
        }
        Ok(())
    }

    /// Open the configured device. Returns false when a connection is already
    /// in progress or established.
    pub fn connect_device(&self) -> Result<bool> {
        let (host, port, slave_id) = self.config.device.endpoint()?;
        info!(
            "Connecting to device {} ({}) at {}:{} slave {}",
            self.config.device.device_id, self.config.device.device_name, host, port, slave_id
        );
        Ok(self.transport.connect(&host, port, slave_id))
    }

    /// Reload definitions from the configured signals file
    pub fn reload_signals(&self) -> Result<usize> {
        let path = self
            .config
            .signals_file
            .as_ref()
            .ok_or_else(|| PlcError::config("no signals_file configured"))?;
        self.registry.load_from_file(path)
    }

    pub fn load_signals(&self, definitions: Vec<SignalDefinition>) -> usize {
        self.registry.load(definitions)
    }

    /// Stop polling, cancel reconnects and close the link
    pub async fn shutdown(&self) {
        self.poller.stop();
        self.transport
            .set_auto_reconnect(false, self.config.reconnect_interval());
        self.transport.disconnect().await;
        info!("PLC service stopped");
    }

    // ========================================================================
    // Data access
    // ========================================================================

    /// Raw holding register read; empty on failure
    pub async fn read_data(&self, address: u16, count: u16) -> Vec<u16> {
        self.transport.read_holding_registers(address, count).await
    }

    /// Raw holding register write
    pub async fn write_data(&self, address: u16, values: &[u16]) -> bool {
        self.transport.write(address, values).await
    }

    pub async fn read_signal(&self, code: &str) -> Result<SignalValue> {
        self.registry.read_one(code).await
    }

    pub async fn write_signal(&self, code: &str, value: &SignalValue) -> Result<()> {
        self.registry.write_one(code, value).await
    }

    /// Every loaded signal with its last polled value
    pub fn signal_summaries(&self) -> Vec<SignalSummary> {
        let snapshot = self.poller.snapshot();
        self.registry
            .signals()
            .values()
            .map(|def| SignalSummary {
                id: def.id,
                signal_code: def.code.clone(),
                signal_name: def.name.clone(),
                signal_type: def.direction,
                data_type: def.data_type.clone(),
                unit: def.unit.clone(),
                param_group: def.param_group.clone(),
                is_active: def.is_active,
                value: snapshot.get(&def.code).copied(),
            })
            .collect()
    }
}
