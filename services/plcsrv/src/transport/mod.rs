//! Modbus TCP transport
//!
//! [`TransportClient`] owns the connection to one Modbus slave. It is a cheap,
//! clonable handle: the signal registry, the poller and the service all hold a
//! clone of the same client and every request goes through one async mutex, so
//! requests never overlap on the wire.
//!
//! Connection lifecycle:
//!
//! ```text
//! Disconnected --connect()--> Connecting --ok--> Connected
//!      ^                          |                  |
//!      +-------- failure ---------+--- error/close --+
//! ```
//!
//! With auto-reconnect enabled, every transition into `Disconnected` that was not
//! caused by [`TransportClient::disconnect`] arms a single repeating timer that
//! re-issues the connect with the last endpoint until the link comes back.
//!
//! The wire itself sits behind [`Connector`] / [`ModbusIo`] so tests can swap the
//! `tokio-modbus` backend for [`mock::MockPlc`].

pub mod mock;
pub mod tcp;

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::error::{PlcError, Result};

pub use tcp::TcpConnector;

/// Default Modbus TCP port
pub const DEFAULT_PORT: u16 = 502;
/// Default slave (unit) id
pub const DEFAULT_SLAVE_ID: u8 = 1;
/// Default auto-reconnect interval
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(5000);

const EVENT_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// Types
// ============================================================================

/// Connection state of the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Modbus data table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegisterKind {
    Coil,
    DiscreteInput,
    HoldingRegister,
    InputRegister,
}

impl fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterKind::Coil => write!(f, "coils"),
            RegisterKind::DiscreteInput => write!(f, "discrete inputs"),
            RegisterKind::HoldingRegister => write!(f, "holding registers"),
            RegisterKind::InputRegister => write!(f, "input registers"),
        }
    }
}

/// Notifications published by the transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    Error(String),
    ReconnectAttempt(u32),
}

/// Remote slave address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub slave_id: u8,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} (slave {})", self.host, self.port, self.slave_id)
    }
}

/// Per-request limits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Time allowed for a single request attempt
    pub timeout: Duration,
    /// Extra attempts after a request times out
    pub retries: u32,
    /// Time allowed for establishing the TCP session
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(3000),
            retries: 3,
            connect_timeout: Duration::from_millis(3000),
        }
    }
}

// ============================================================================
// Backend seam
// ============================================================================

/// One established Modbus session.
///
/// Implementations report a Modbus exception response as
/// [`PlcError::ProtocolError`] and anything that breaks the session as
/// [`PlcError::ConnectionError`].
#[async_trait]
pub trait ModbusIo: Send {
    /// Coil and discrete input reads return 0/1 per bit
    async fn read(&mut self, kind: RegisterKind, address: u16, count: u16) -> Result<Vec<u16>>;

    async fn write_registers(&mut self, address: u16, values: &[u16]) -> Result<()>;

    async fn write_coil(&mut self, address: u16, value: bool) -> Result<()>;

    async fn write_coils(&mut self, address: u16, values: &[bool]) -> Result<()>;

    async fn disconnect(&mut self);
}

/// Opens sessions to an endpoint
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn ModbusIo>>;
}

#[derive(Debug, Clone)]
enum Request {
    Read {
        kind: RegisterKind,
        address: u16,
        count: u16,
    },
    WriteRegisters {
        address: u16,
        values: Vec<u16>,
    },
    WriteCoil {
        address: u16,
        value: bool,
    },
    WriteCoils {
        address: u16,
        values: Vec<bool>,
    },
}

impl Request {
    async fn perform(&self, io: &mut dyn ModbusIo) -> Result<Vec<u16>> {
        match self {
            Request::Read {
                kind,
                address,
                count,
            } => io.read(*kind, *address, *count).await,
            Request::WriteRegisters { address, values } => {
                io.write_registers(*address, values).await.map(|_| Vec::new())
            },
            Request::WriteCoil { address, value } => {
                io.write_coil(*address, *value).await.map(|_| Vec::new())
            },
            Request::WriteCoils { address, values } => {
                io.write_coils(*address, values).await.map(|_| Vec::new())
            },
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Read {
                kind,
                address,
                count,
            } => write!(f, "read {} {}@{}", count, kind, address),
            Request::WriteRegisters { address, values } => {
                write!(f, "write {} holding registers@{}", values.len(), address)
            },
            Request::WriteCoil { address, .. } => write!(f, "write coil@{}", address),
            Request::WriteCoils { address, values } => {
                write!(f, "write {} coils@{}", values.len(), address)
            },
        }
    }
}

// ============================================================================
// Client
// ============================================================================

#[derive(Debug)]
struct Status {
    state: ConnectionState,
    endpoint: Option<Endpoint>,
    slave_id: u8,
    reconnect_attempts: u32,
    last_error: Option<String>,
    auto_reconnect: bool,
    reconnect_interval: Duration,
    /// Set by an explicit disconnect, cleared by the next explicit connect
    user_disconnected: bool,
    /// Bumped on explicit disconnect so in-flight connects can tell they are stale
    generation: u64,
}

struct Inner {
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    link: tokio::sync::Mutex<Option<Box<dyn ModbusIo>>>,
    status: RwLock<Status>,
    events: broadcast::Sender<TransportEvent>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the single Modbus TCP connection
#[derive(Clone)]
pub struct TransportClient {
    inner: Arc<Inner>,
}

impl fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.inner.status.read();
        f.debug_struct("TransportClient")
            .field("state", &status.state)
            .field("endpoint", &status.endpoint)
            .field("reconnect_attempts", &status.reconnect_attempts)
            .field("auto_reconnect", &status.auto_reconnect)
            .finish()
    }
}

impl TransportClient {
    /// Client backed by the `tokio-modbus` TCP implementation
    pub fn tcp(config: TransportConfig) -> Self {
        Self::with_connector(Arc::new(TcpConnector), config)
    }

    pub fn with_connector(connector: Arc<dyn Connector>, config: TransportConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                connector,
                config,
                link: tokio::sync::Mutex::new(None),
                status: RwLock::new(Status {
                    state: ConnectionState::Disconnected,
                    endpoint: None,
                    slave_id: DEFAULT_SLAVE_ID,
                    reconnect_attempts: 0,
                    last_error: None,
                    auto_reconnect: false,
                    reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
                    user_disconnected: false,
                    generation: 0,
                }),
                events,
                reconnect_task: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start connecting to `host:port`.
    ///
    /// Returns whether the attempt was dispatched. The outcome arrives later as
    /// a [`TransportEvent::StateChanged`]. Must be called inside a tokio runtime,
    /// and only while disconnected.
    pub fn connect(&self, host: &str, port: u16, slave_id: u8) -> bool {
        {
            let mut status = self.inner.status.write();
            if status.state != ConnectionState::Disconnected {
                debug!(state = %status.state, "Connect ignored, transport busy");
                return false;
            }
            status.endpoint = Some(Endpoint {
                host: host.trim().to_string(),
                port,
                slave_id,
            });
            status.slave_id = slave_id;
            status.reconnect_attempts = 0;
            status.user_disconnected = false;
        }
        self.inner.dispatch_connect()
    }

    /// Close the connection. Auto-reconnect stays quiet until the next `connect`.
    pub async fn disconnect(&self) {
        {
            let mut status = self.inner.status.write();
            status.user_disconnected = true;
            status.generation += 1;
        }
        self.inner.cancel_reconnect();

        let mut link = self.inner.link.lock().await;
        if let Some(mut io) = link.take() {
            io.disconnect().await;
        }
        drop(link);

        if self.inner.set_state(ConnectionState::Disconnected) {
            info!("Disconnected from PLC");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.status.read().state
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        self.inner.status.read().endpoint.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.status.read().last_error.clone()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.status.read().reconnect_attempts
    }

    pub fn slave_id(&self) -> u8 {
        self.inner.status.read().slave_id
    }

    /// Takes effect on the next connect
    pub fn set_slave_id(&self, slave_id: u8) {
        let mut status = self.inner.status.write();
        status.slave_id = slave_id;
        if let Some(endpoint) = status.endpoint.as_mut() {
            endpoint.slave_id = slave_id;
        }
    }

    pub fn auto_reconnect(&self) -> bool {
        self.inner.status.read().auto_reconnect
    }

    /// Enable or disable the reconnect timer.
    ///
    /// Enabling while already disconnected (and not by request) arms the timer
    /// right away. Disabling cancels it.
    pub fn set_auto_reconnect(&self, enabled: bool, interval: Duration) {
        let (interval_changed, arm) = {
            let mut status = self.inner.status.write();
            let interval_changed = status.reconnect_interval != interval;
            status.auto_reconnect = enabled;
            status.reconnect_interval = interval;
            let arm = enabled
                && status.state == ConnectionState::Disconnected
                && status.endpoint.is_some()
                && !status.user_disconnected;
            (interval_changed, arm)
        };

        info!(enabled, interval_ms = interval.as_millis() as u64, "Auto-reconnect configured");

        // A running timer keeps the period it was built with
        if !enabled || interval_changed {
            self.inner.cancel_reconnect();
        }
        if arm {
            self.inner.arm_reconnect();
        }
    }

    // ------------------------------------------------------------------
    // Strict primitives
    // ------------------------------------------------------------------

    /// Read `count` items from `kind` starting at `address`
    pub async fn try_read(&self, kind: RegisterKind, address: u16, count: u16) -> Result<Vec<u16>> {
        let words = self
            .execute(Request::Read {
                kind,
                address,
                count,
            })
            .await?;
        if words.is_empty() {
            let err = PlcError::TransportFailure(format!("empty reply for {}@{}", kind, address));
            self.inner.record_error(&err);
            return Err(err);
        }
        Ok(words)
    }

    pub async fn try_write_registers(&self, address: u16, values: &[u16]) -> Result<()> {
        self.execute(Request::WriteRegisters {
            address,
            values: values.to_vec(),
        })
        .await
        .map(|_| ())
    }

    pub async fn try_write_coil(&self, address: u16, value: bool) -> Result<()> {
        self.execute(Request::WriteCoil { address, value })
            .await
            .map(|_| ())
    }

    pub async fn try_write_coils(&self, address: u16, values: &[bool]) -> Result<()> {
        self.execute(Request::WriteCoils {
            address,
            values: values.to_vec(),
        })
        .await
        .map(|_| ())
    }

    // ------------------------------------------------------------------
    // Soft-fail primitives: empty / false on failure, error kept in last_error
    // ------------------------------------------------------------------

    pub async fn read(&self, kind: RegisterKind, address: u16, count: u16) -> Vec<u16> {
        self.try_read(kind, address, count).await.unwrap_or_default()
    }

    pub async fn read_coils(&self, address: u16, count: u16) -> Vec<u16> {
        self.read(RegisterKind::Coil, address, count).await
    }

    pub async fn read_discrete_inputs(&self, address: u16, count: u16) -> Vec<u16> {
        self.read(RegisterKind::DiscreteInput, address, count).await
    }

    pub async fn read_holding_registers(&self, address: u16, count: u16) -> Vec<u16> {
        self.read(RegisterKind::HoldingRegister, address, count).await
    }

    pub async fn read_input_registers(&self, address: u16, count: u16) -> Vec<u16> {
        self.read(RegisterKind::InputRegister, address, count).await
    }

    pub async fn write(&self, address: u16, values: &[u16]) -> bool {
        self.try_write_registers(address, values).await.is_ok()
    }

    pub async fn write_coil(&self, address: u16, value: bool) -> bool {
        self.try_write_coil(address, value).await.is_ok()
    }

    pub async fn write_coils(&self, address: u16, values: &[bool]) -> bool {
        self.try_write_coils(address, values).await.is_ok()
    }

    // ------------------------------------------------------------------
    // Request path
    // ------------------------------------------------------------------

    async fn execute(&self, request: Request) -> Result<Vec<u16>> {
        if !self.is_connected() {
            let err = PlcError::NotConnected;
            self.inner.record_error(&err);
            return Err(err);
        }

        let mut link = self.inner.link.lock().await;
        let Some(io) = link.as_mut() else {
            let err = PlcError::NotConnected;
            self.inner.record_error(&err);
            return Err(err);
        };

        let limit = self.inner.config.timeout;
        let retries = self.inner.config.retries;
        let mut attempt = 0u32;
        loop {
            match timeout(limit, request.perform(io.as_mut())).await {
                Ok(Ok(words)) => {
                    trace!("{} ok", request);
                    return Ok(words);
                },
                Ok(Err(PlcError::ProtocolError(msg))) => {
                    let err = PlcError::protocol(format!("{}: {}", request, msg));
                    drop(link);
                    self.inner.record_error(&err);
                    return Err(err);
                },
                Ok(Err(e)) => {
                    warn!("{} failed, dropping link: {}", request, e);
                    if let Some(mut io) = link.take() {
                        io.disconnect().await;
                    }
                    drop(link);
                    self.inner.on_link_lost(&e);
                    return Err(e);
                },
                Err(_) if attempt < retries => {
                    attempt += 1;
                    debug!("{} timed out, retry {}/{}", request, attempt, retries);
                },
                Err(_) => {
                    // A late reply would still be queued on the session; start over
                    let err = PlcError::timeout(format!(
                        "{} timed out after {} attempts",
                        request,
                        attempt + 1
                    ));
                    warn!("{}, dropping link", err);
                    if let Some(mut io) = link.take() {
                        io.disconnect().await;
                    }
                    drop(link);
                    self.inner.on_link_lost(&err);
                    return Err(err);
                },
            }
        }
    }
}

impl Inner {
    /// Returns true when the state actually changed
    fn set_state(&self, state: ConnectionState) -> bool {
        {
            let mut status = self.status.write();
            if status.state == state {
                return false;
            }
            status.state = state;
        }
        let _ = self.events.send(TransportEvent::StateChanged(state));
        true
    }

    fn record_error(&self, err: &PlcError) {
        let msg = err.to_string();
        self.status.write().last_error = Some(msg.clone());
        let _ = self.events.send(TransportEvent::Error(msg));
    }

    fn dispatch_connect(self: &Arc<Self>) -> bool {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                self.record_error(&PlcError::connection(format!("no async runtime: {}", e)));
                return false;
            },
        };

        let (endpoint, generation) = {
            let status = self.status.read();
            match &status.endpoint {
                Some(endpoint) => (endpoint.clone(), status.generation),
                None => return false,
            }
        };

        self.set_state(ConnectionState::Connecting);
        debug!("Connecting to {}", endpoint);

        let inner = Arc::clone(self);
        handle.spawn(async move {
            let outcome = timeout(
                inner.config.connect_timeout,
                inner.connector.connect(&endpoint),
            )
            .await
            .unwrap_or_else(|_| Err(PlcError::timeout(format!("connect to {}", endpoint))));

            if inner.status.read().generation != generation {
                // Disconnected while the attempt was in flight
                if let Ok(mut io) = outcome {
                    io.disconnect().await;
                }
                return;
            }

            match outcome {
                Ok(mut io) => {
                    // `disconnect` bumps the generation before it takes the link
                    // lock, so checking again under the lock orders us before it
                    let mut link = inner.link.lock().await;
                    if inner.status.read().generation != generation {
                        drop(link);
                        io.disconnect().await;
                        return;
                    }
                    *link = Some(io);
                    inner.on_connected(&endpoint);
                },
                Err(e) => {
                    warn!("Connect to {} failed: {}", endpoint, e);
                    inner.on_link_lost(&e);
                },
            }
        });
        true
    }

    fn on_connected(&self, endpoint: &Endpoint) {
        self.status.write().reconnect_attempts = 0;
        self.cancel_reconnect();
        if self.set_state(ConnectionState::Connected) {
            info!("Connected to {}", endpoint);
        }
    }

    fn on_link_lost(self: &Arc<Self>, err: &PlcError) {
        self.record_error(err);
        self.set_state(ConnectionState::Disconnected);

        let arm = {
            let status = self.status.read();
            status.auto_reconnect && !status.user_disconnected
        };
        if arm {
            self.arm_reconnect();
        }
    }

    fn arm_reconnect(self: &Arc<Self>) {
        let mut slot = self.reconnect_task.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let period = self.status.read().reconnect_interval;
        let weak: Weak<Inner> = Arc::downgrade(self);
        debug!(interval_ms = period.as_millis() as u64, "Reconnect timer armed");

        *slot = Some(handle.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if !inner.reconnect_tick() {
                    break;
                }
            }
        }));
    }

    /// One reconnect timer tick. Returns false when the timer should stop.
    fn reconnect_tick(self: &Arc<Self>) -> bool {
        let attempt = {
            let mut status = self.status.write();
            if !status.auto_reconnect || status.user_disconnected {
                return false;
            }
            match status.state {
                ConnectionState::Connected => return false,
                // Previous attempt still in flight
                ConnectionState::Connecting => return true,
                ConnectionState::Disconnected => {},
            }
            status.reconnect_attempts += 1;
            status.reconnect_attempts
        };

        info!("Reconnect attempt {}", attempt);
        let _ = self.events.send(TransportEvent::ReconnectAttempt(attempt));
        self.dispatch_connect()
    }

    fn cancel_reconnect(&self) {
        if let Some(task) = self.reconnect_task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.reconnect_task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::mock::{MockFault, MockPlc, MockRequest};
    use super::*;

    fn client_for(plc: &MockPlc) -> TransportClient {
        TransportClient::with_connector(plc.connector(), TransportConfig::default())
    }

    async fn wait_for(client: &TransportClient, state: ConnectionState) {
        for _ in 0..500 {
            if client.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("transport never reached {state}, still {}", client.state());
    }

    async fn connected(plc: &MockPlc) -> TransportClient {
        let client = client_for(plc);
        assert!(client.connect("10.0.0.5", DEFAULT_PORT, DEFAULT_SLAVE_ID));
        wait_for(&client, ConnectionState::Connected).await;
        client
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_reports_transitions() {
        let plc = MockPlc::new();
        let client = client_for(&plc);
        let mut events = client.subscribe();

        assert!(client.connect("10.0.0.5", 502, 1));
        wait_for(&client, ConnectionState::Connected).await;

        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::StateChanged(ConnectionState::Connecting)
        );
        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::StateChanged(ConnectionState::Connected)
        );
        assert_eq!(
            client.endpoint(),
            Some(Endpoint {
                host: "10.0.0.5".to_string(),
                port: 502,
                slave_id: 1
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_while_busy_is_rejected() {
        let plc = MockPlc::new();
        plc.set_connect_delay(Duration::from_millis(200));
        let client = client_for(&plc);

        assert!(client.connect("10.0.0.5", 502, 1));
        assert_eq!(client.state(), ConnectionState::Connecting);
        assert!(!client.connect("10.0.0.6", 502, 1));

        wait_for(&client, ConnectionState::Connected).await;
        assert!(!client.connect("10.0.0.6", 502, 1));
        assert_eq!(plc.connect_count(), 1);
    }

    #[test]
    fn test_connect_outside_runtime_is_not_dispatched() {
        let plc = MockPlc::new();
        let client = client_for(&plc);
        assert!(!client.connect("10.0.0.5", 502, 1));
        assert!(client.last_error().is_some());
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_io_while_disconnected_fails_soft() {
        let plc = MockPlc::new();
        let client = client_for(&plc);

        assert!(client.read_holding_registers(0, 2).await.is_empty());
        assert_eq!(client.last_error().as_deref(), Some("Not connected"));
        assert!(!client.write(0, &[1]).await);
        assert!(!client.write_coil(0, true).await);
        assert!(!client.write_coils(0, &[true]).await);
        assert!(matches!(
            client.try_read(RegisterKind::Coil, 0, 1).await,
            Err(PlcError::NotConnected)
        ));
        assert_eq!(plc.request_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_and_write_primitives() {
        let plc = MockPlc::new();
        plc.set_holding(100, &[500, 600]);
        plc.set_input(10, &[7]);
        plc.set_discrete(3, true);
        let client = connected(&plc).await;

        assert_eq!(client.read_holding_registers(100, 2).await, vec![500, 600]);
        assert_eq!(client.read_input_registers(10, 1).await, vec![7]);
        assert_eq!(client.read_discrete_inputs(2, 2).await, vec![0, 1]);

        assert!(client.write(200, &[1, 2, 3]).await);
        assert_eq!(plc.holding(202), 3);
        assert!(client.write_coil(5, true).await);
        assert!(client.write_coils(6, &[true, false]).await);
        assert_eq!(client.read_coils(5, 3).await, vec![1, 1, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_are_retried() {
        let plc = MockPlc::new();
        plc.set_holding(0, &[42]);
        let client = connected(&plc).await;

        plc.push_fault(MockFault::Timeout);
        plc.push_fault(MockFault::Timeout);
        assert_eq!(client.read_holding_registers(0, 1).await, vec![42]);
        assert_eq!(plc.request_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_after_all_retries_drops_link() {
        let plc = MockPlc::new();
        let client = connected(&plc).await;

        for _ in 0..4 {
            plc.push_fault(MockFault::Timeout);
        }
        let started = Instant::now();
        let res = client.try_read(RegisterKind::HoldingRegister, 0, 1).await;
        assert!(matches!(res, Err(PlcError::TimeoutError(_))));
        // One attempt plus three retries, 3000 ms each
        assert!(started.elapsed() >= Duration::from_millis(12_000));
        assert_eq!(plc.request_count(), 4);
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.last_error().unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exception_keeps_link() {
        let plc = MockPlc::new();
        let client = connected(&plc).await;
        let mut events = client.subscribe();

        plc.push_fault(MockFault::Exception);
        assert!(!client.write(0, &[1]).await);
        assert!(client.is_connected());
        assert!(matches!(events.recv().await.unwrap(), TransportEvent::Error(msg) if msg.contains("Protocol error")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_read_is_transport_failure() {
        let plc = MockPlc::new();
        let client = connected(&plc).await;

        plc.push_fault(MockFault::Empty);
        assert!(matches!(
            client.try_read(RegisterKind::HoldingRegister, 0, 1).await,
            Err(PlcError::TransportFailure(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_failure_disconnects() {
        let plc = MockPlc::new();
        let client = connected(&plc).await;

        plc.drop_links();
        assert!(client.read_holding_registers(0, 1).await.is_empty());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.last_error().unwrap().contains("reset"));
        // Auto-reconnect is off, nothing else happens
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(plc.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_reconnect_until_connected() {
        let plc = MockPlc::new();
        let client = connected(&plc).await;
        client.set_auto_reconnect(true, Duration::from_millis(1000));
        let mut events = client.subscribe();

        plc.set_reachable(false);
        plc.push_fault(MockFault::LinkDown);
        assert!(client.read_holding_registers(0, 1).await.is_empty());
        assert_eq!(client.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_millis(1050)).await;
        assert_eq!(client.reconnect_attempts(), 1);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(client.reconnect_attempts(), 2);

        plc.set_reachable(true);
        wait_for(&client, ConnectionState::Connected).await;
        assert_eq!(client.reconnect_attempts(), 0);

        let mut attempts = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let TransportEvent::ReconnectAttempt(n) = event {
                attempts.push(n);
            }
        }
        assert_eq!(attempts, vec![1, 2, 3]);

        // Timer stopped once connected
        let connects = plc.connect_count();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(plc.connect_count(), connects);
        assert_eq!(client.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_initial_connect_arms_reconnect() {
        let plc = MockPlc::new();
        plc.refuse_connects(1);
        let client = client_for(&plc);
        client.set_auto_reconnect(true, Duration::from_millis(500));

        assert!(client.connect("10.0.0.5", 502, 1));
        wait_for(&client, ConnectionState::Connected).await;
        assert_eq!(plc.connect_count(), 2);
        assert_eq!(client.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_disconnect_does_not_reconnect() {
        let plc = MockPlc::new();
        let client = connected(&plc).await;
        client.set_auto_reconnect(true, Duration::from_millis(1000));

        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(plc.connect_count(), 1);
        assert_eq!(client.reconnect_attempts(), 0);
        assert!(client.read_holding_registers(0, 1).await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disconnect_racing_connect_stays_down() {
        let plc = MockPlc::new();
        plc.set_connect_delay(Duration::from_millis(2));
        let client = client_for(&plc);
        client.set_auto_reconnect(true, Duration::from_millis(5));

        for round in 0..40u64 {
            assert!(client.connect("10.0.0.5", 502, 1));
            tokio::time::sleep(Duration::from_micros(round * 100)).await;
            client.disconnect().await;

            tokio::time::sleep(Duration::from_millis(15)).await;
            assert_eq!(client.state(), ConnectionState::Disconnected, "round {round}");
            assert!(client.try_read(RegisterKind::HoldingRegister, 0, 1).await.is_err());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabling_auto_reconnect_stops_timer() {
        let plc = MockPlc::new();
        plc.set_reachable(false);
        let client = client_for(&plc);
        client.set_auto_reconnect(true, Duration::from_millis(1000));
        assert!(client.connect("10.0.0.5", 502, 1));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(client.reconnect_attempts(), 1);

        client.set_auto_reconnect(false, Duration::from_millis(1000));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(client.reconnect_attempts(), 1);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enabling_auto_reconnect_while_down_arms_timer() {
        let plc = MockPlc::new();
        let client = connected(&plc).await;
        plc.drop_links();
        assert!(!client.write_coil(0, true).await);
        assert_eq!(client.state(), ConnectionState::Disconnected);

        client.set_auto_reconnect(true, Duration::from_millis(1000));
        wait_for(&client, ConnectionState::Connected).await;
        assert_eq!(plc.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_are_serialized() {
        let plc = MockPlc::new();
        plc.set_holding(0, &[1, 2]);
        let client = connected(&plc).await;

        let a = client.clone();
        let b = client.clone();
        let (ra, rb) = tokio::join!(
            a.read_holding_registers(0, 1),
            b.write(1, &[9])
        );
        assert_eq!(ra, vec![1]);
        assert!(rb);
        let requests = plc.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests.contains(&MockRequest::WriteRegisters {
            address: 1,
            values: vec![9]
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slave_id_update() {
        let plc = MockPlc::new();
        let client = connected(&plc).await;
        client.set_slave_id(7);
        assert_eq!(client.slave_id(), 7);
        assert_eq!(client.endpoint().unwrap().slave_id, 7);
    }
}
