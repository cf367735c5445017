//! `tokio-modbus` TCP backend

use async_trait::async_trait;
use tokio_modbus::{
    client::{tcp, Client as _, Context, Reader, Writer},
    slave::Slave,
    ExceptionCode,
};
use tracing::debug;

use super::{Connector, Endpoint, ModbusIo, RegisterKind};
use crate::error::{PlcError, Result};

/// Opens Modbus TCP sessions
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn ModbusIo>> {
        let target = format!("{}:{}", endpoint.host, endpoint.port);
        let addr = tokio::net::lookup_host(&target)
            .await
            .map_err(|e| PlcError::connection(format!("resolve {}: {}", target, e)))?
            .next()
            .ok_or_else(|| PlcError::connection(format!("no address for {}", target)))?;

        debug!("Opening Modbus TCP session to {}", addr);
        let ctx = tcp::connect_slave(addr, Slave(endpoint.slave_id))
            .await
            .map_err(|e| PlcError::connection(format!("connect {}: {}", addr, e)))?;

        Ok(Box::new(TcpLink { ctx }))
    }
}

/// Established Modbus TCP session
pub struct TcpLink {
    ctx: Context,
}

/// Split the nested `tokio-modbus` result: the outer error is the wire, the inner
/// one is an exception response from the slave.
///
/// Only an exception response leaves the session usable. A reply that does not
/// match the request (late frame, wrong transaction id) means the stream is out
/// of step, so it is reported as a connection error and the link gets replaced.
fn flatten<T>(
    res: std::result::Result<std::result::Result<T, ExceptionCode>, tokio_modbus::Error>,
) -> Result<T> {
    match res {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(code)) => Err(PlcError::protocol(format!("exception {:?}", code))),
        Err(tokio_modbus::Error::Transport(e)) => Err(PlcError::connection(e.to_string())),
        Err(e) => Err(PlcError::connection(format!("session out of sync: {}", e))),
    }
}

fn bits_to_words(bits: Vec<bool>) -> Vec<u16> {
    bits.into_iter().map(u16::from).collect()
}

#[async_trait]
impl ModbusIo for TcpLink {
    async fn read(&mut self, kind: RegisterKind, address: u16, count: u16) -> Result<Vec<u16>> {
        match kind {
            RegisterKind::Coil => {
                flatten(self.ctx.read_coils(address, count).await).map(bits_to_words)
            },
            RegisterKind::DiscreteInput => {
                flatten(self.ctx.read_discrete_inputs(address, count).await).map(bits_to_words)
            },
            RegisterKind::HoldingRegister => {
                flatten(self.ctx.read_holding_registers(address, count).await)
            },
            RegisterKind::InputRegister => {
                flatten(self.ctx.read_input_registers(address, count).await)
            },
        }
    }

    async fn write_registers(&mut self, address: u16, values: &[u16]) -> Result<()> {
        flatten(self.ctx.write_multiple_registers(address, values).await)
    }

    async fn write_coil(&mut self, address: u16, value: bool) -> Result<()> {
        flatten(self.ctx.write_single_coil(address, value).await)
    }

    async fn write_coils(&mut self, address: u16, values: &[bool]) -> Result<()> {
        flatten(self.ctx.write_multiple_coils(address, values).await)
    }

    async fn disconnect(&mut self) {
        let _ = self.ctx.disconnect().await;
    }
}
