//! In-memory Modbus slave for testing
//!
//! [`MockPlc`] is both the register bank and the [`Connector`]. Clones share the
//! same state, so a test keeps one clone to poke registers and inject faults
//! while the transport under test holds another.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Connector, Endpoint, ModbusIo, RegisterKind};
use crate::error::{PlcError, Result};

/// Failure injected into the next request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFault {
    /// Never answer; the transport timeout fires
    Timeout,
    /// Answer with an exception response
    Exception,
    /// Reset the session
    LinkDown,
    /// Answer a read with zero items
    Empty,
}

/// Request as seen by the slave
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockRequest {
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

#[derive(Debug)]
struct MockState {
    holding: BTreeMap<u16, u16>,
    input: BTreeMap<u16, u16>,
    coils: BTreeMap<u16, bool>,
    discrete: BTreeMap<u16, bool>,
    reachable: bool,
    refuse_connects: u32,
    connect_delay: Duration,
    connects: u32,
    faults: VecDeque<MockFault>,
    requests: Vec<MockRequest>,
    /// Bumped to invalidate every open link
    session: u64,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            holding: BTreeMap::new(),
            input: BTreeMap::new(),
            coils: BTreeMap::new(),
            discrete: BTreeMap::new(),
            reachable: true,
            refuse_connects: 0,
            connect_delay: Duration::ZERO,
            connects: 0,
            faults: VecDeque::new(),
            requests: Vec::new(),
            session: 0,
        }
    }
}

/// Shared in-memory slave
#[derive(Debug, Clone, Default)]
pub struct MockPlc {
    state: Arc<Mutex<MockState>>,
}

impl MockPlc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    // ------------------------------------------------------------------
    // Register bank
    // ------------------------------------------------------------------

    pub fn set_holding(&self, address: u16, values: &[u16]) {
        let mut state = self.state.lock();
        for (addr, value) in (address..).zip(values) {
            state.holding.insert(addr, *value);
        }
    }

    pub fn holding(&self, address: u16) -> u16 {
        self.state.lock().holding.get(&address).copied().unwrap_or(0)
    }

    pub fn set_input(&self, address: u16, values: &[u16]) {
        let mut state = self.state.lock();
        for (addr, value) in (address..).zip(values) {
            state.input.insert(addr, *value);
        }
    }

    pub fn set_coil(&self, address: u16, value: bool) {
        self.state.lock().coils.insert(address, value);
    }

    pub fn coil(&self, address: u16) -> bool {
        self.state.lock().coils.get(&address).copied().unwrap_or(false)
    }

    pub fn set_discrete(&self, address: u16, value: bool) {
        self.state.lock().discrete.insert(address, value);
    }

    // ------------------------------------------------------------------
    // Connection behavior
    // ------------------------------------------------------------------

    /// While unreachable every connect is refused
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    /// Refuse the next `count` connects
    pub fn refuse_connects(&self, count: u32) {
        self.state.lock().refuse_connects = count;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = delay;
    }

    /// Connects attempted so far, successful or not
    pub fn connect_count(&self) -> u32 {
        self.state.lock().connects
    }

    /// Reset every open session; the next request on them fails
    pub fn drop_links(&self) {
        self.state.lock().session += 1;
    }

    pub fn push_fault(&self, fault: MockFault) {
        self.state.lock().faults.push_back(fault);
    }

    // ------------------------------------------------------------------
    // Request history
    // ------------------------------------------------------------------

    pub fn requests(&self) -> Vec<MockRequest> {
        self.state.lock().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().requests.len()
    }

    pub fn clear_requests(&self) {
        self.state.lock().requests.clear();
    }
}

#[async_trait]
impl Connector for MockPlc {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn ModbusIo>> {
        let (delay, accepted, session) = {
            let mut state = self.state.lock();
            state.connects += 1;
            let accepted = if !state.reachable {
                false
            } else if state.refuse_connects > 0 {
                state.refuse_connects -= 1;
                false
            } else {
                true
            };
            (state.connect_delay, accepted, state.session)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !accepted {
            return Err(PlcError::connection(format!(
                "connection refused by {}",
                endpoint
            )));
        }
        Ok(Box::new(MockLink {
            plc: self.clone(),
            session,
        }))
    }
}

struct MockLink {
    plc: MockPlc,
    session: u64,
}

enum Outcome {
    Reply(Result<Vec<u16>>),
    Hang,
}

impl MockLink {
    async fn handle(&mut self, request: MockRequest) -> Result<Vec<u16>> {
        let outcome = {
            let mut state = self.plc.state.lock();
            if state.session != self.session {
                Outcome::Reply(Err(PlcError::connection("connection reset by peer")))
            } else {
                state.requests.push(request.clone());
                match state.faults.pop_front() {
                    Some(MockFault::Timeout) => Outcome::Hang,
                    Some(MockFault::Exception) => {
                        Outcome::Reply(Err(PlcError::protocol("exception IllegalDataAddress")))
                    },
                    Some(MockFault::LinkDown) => {
                        state.session += 1;
                        Outcome::Reply(Err(PlcError::connection("connection reset by peer")))
                    },
                    Some(MockFault::Empty) => Outcome::Reply(Ok(Vec::new())),
                    None => Outcome::Reply(apply(&mut state, &request)),
                }
            }
        };

        match outcome {
            Outcome::Reply(reply) => reply,
            Outcome::Hang => std::future::pending().await,
        }
    }
}

fn addresses(address: u16, count: usize) -> Result<impl Iterator<Item = u16>> {
    let last = usize::from(address) + count;
    if last > usize::from(u16::MAX) + 1 {
        return Err(PlcError::protocol("exception IllegalDataAddress"));
    }
    Ok((0..count).map(move |i| address + i as u16))
}

fn apply(state: &mut MockState, request: &MockRequest) -> Result<Vec<u16>> {
    match request {
        MockRequest::Read {
            kind,
            address,
            count,
        } => {
            let addrs = addresses(*address, usize::from(*count))?;
            let words = match kind {
                RegisterKind::HoldingRegister => addrs
                    .map(|a| state.holding.get(&a).copied().unwrap_or(0))
                    .collect(),
                RegisterKind::InputRegister => addrs
                    .map(|a| state.input.get(&a).copied().unwrap_or(0))
                    .collect(),
                RegisterKind::Coil => addrs
                    .map(|a| u16::from(state.coils.get(&a).copied().unwrap_or(false)))
                    .collect(),
                RegisterKind::DiscreteInput => addrs
                    .map(|a| u16::from(state.discrete.get(&a).copied().unwrap_or(false)))
                    .collect(),
            };
            Ok(words)
        },
        MockRequest::WriteRegisters { address, values } => {
            for (a, v) in addresses(*address, values.len())?.zip(values) {
                state.holding.insert(a, *v);
            }
            Ok(Vec::new())
        },
        MockRequest::WriteCoil { address, value } => {
            state.coils.insert(*address, *value);
            Ok(Vec::new())
        },
        MockRequest::WriteCoils { address, values } => {
            for (a, v) in addresses(*address, values.len())?.zip(values) {
                state.coils.insert(a, *v);
            }
            Ok(Vec::new())
        },
    }
}

#[async_trait]
impl ModbusIo for MockLink {
    async fn read(&mut self, kind: RegisterKind, address: u16, count: u16) -> Result<Vec<u16>> {
        self.handle(MockRequest::Read {
            kind,
            address,
            count,
        })
        .await
    }

    async fn write_registers(&mut self, address: u16, values: &[u16]) -> Result<()> {
        self.handle(MockRequest::WriteRegisters {
            address,
            values: values.to_vec(),
        })
        .await
        .map(|_| ())
    }

    async fn write_coil(&mut self, address: u16, value: bool) -> Result<()> {
        self.handle(MockRequest::WriteCoil { address, value })
            .await
            .map(|_| ())
    }

    async fn write_coils(&mut self, address: u16, values: &[bool]) -> Result<()> {
        self.handle(MockRequest::WriteCoils {
            address,
            values: values.to_vec(),
        })
        .await
        .map(|_| ())
    }

    async fn disconnect(&mut self) {}
}
