//! Signal registry
//!
//! Holds the loaded signal set and performs typed reads and writes through the
//! shared [`TransportClient`]. A load swaps the whole set at once; readers that
//! race a reload see either the old set or the new one, never a mix.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::codec::{CodecOptions, SignalCodec};
use super::{SignalDefinition, SignalKind, SignalValue};
use crate::address::{AddressTranslator, ProcessorType};
use crate::error::{PlcError, Result};
use crate::transport::{RegisterKind, TransportClient};

/// Which definition field holds the holding register address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressMode {
    /// `registerAddress` for both coils and registers
    #[default]
    Register,
    /// `offsetValue` for holding registers, `registerAddress` for coils
    LegacyOffset,
}

/// Registry settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryOptions {
    pub codec: CodecOptions,
    pub address_mode: AddressMode,
}

/// Notifications published by the registry
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Loaded { count: usize },
    Error(String),
}

/// Code → definition map shared with readers
pub type SignalMap = BTreeMap<String, SignalDefinition>;

/// Code → decoded value
pub type ValueMap = BTreeMap<String, SignalValue>;

pub struct SignalRegistry {
    transport: TransportClient,
    translator: RwLock<AddressTranslator>,
    signals: RwLock<Arc<SignalMap>>,
    options: RegistryOptions,
    events: broadcast::Sender<RegistryEvent>,
}

impl std::fmt::Debug for SignalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalRegistry")
            .field("signals", &self.len())
            .field("processor", &self.processor_type())
            .field("options", &self.options)
            .finish()
    }
}

impl SignalRegistry {
    pub fn new(
        transport: TransportClient,
        translator: AddressTranslator,
        options: RegistryOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            transport,
            translator: RwLock::new(translator),
            signals: RwLock::new(Arc::new(SignalMap::new())),
            options,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    pub fn transport(&self) -> &TransportClient {
        &self.transport
    }

    fn emit_error(&self, err: &PlcError) {
        let _ = self.events.send(RegistryEvent::Error(err.to_string()));
    }

    // ========================================================================
    // Vendor profile
    // ========================================================================

    pub fn processor_type(&self) -> ProcessorType {
        self.translator.read().processor_type()
    }

    /// Returns false when the vendor was already active
    pub fn set_processor_type(&self, processor: ProcessorType) -> bool {
        let changed = self.translator.write().set_processor_type(processor);
        if changed {
            info!("PLC processor type: {}", processor);
        }
        changed
    }

    pub fn set_processor_type_str(&self, name: &str) -> bool {
        self.set_processor_type(ProcessorType::parse(name))
    }

    /// Copy of the active translator for diagnostics and bulk range queries
    pub fn translator(&self) -> AddressTranslator {
        self.translator.read().clone()
    }

    // ========================================================================
    // Definitions
    // ========================================================================

    /// Replace the whole signal set. Returns the number of signals kept.
    pub fn load(&self, definitions: Vec<SignalDefinition>) -> usize {
        let total = definitions.len();
        let mut map = SignalMap::new();
        for mut def in definitions {
            def.code = def.code.trim().to_string();
            if def.code.is_empty() {
                continue;
            }
            if let Err(reason) = def.check() {
                warn!("Signal {} skipped: {}", def.code, reason);
                continue;
            }
            if let Some(width) = def.data_type.register_width() {
                if i64::from(width) != def.register_count {
                    // Kept: a short reply decodes as the first raw word
                    warn!(
                        "Signal {} reads {} registers but {} needs {}",
                        def.code, def.register_count, def.data_type, width
                    );
                }
            }
            if map.contains_key(&def.code) {
                warn!("Duplicate signal code {}, keeping the later definition", def.code);
            }
            map.insert(def.code.clone(), def);
        }

        let count = map.len();
        *self.signals.write() = Arc::new(map);
        info!("Loaded {} signals ({} records)", count, total);
        let _ = self.events.send(RegistryEvent::Loaded { count });
        count
    }

    /// Load from a JSON array of signal records
    pub fn load_from_json_str(&self, json: &str) -> Result<usize> {
        let definitions: Vec<SignalDefinition> = serde_json::from_str(json)?;
        Ok(self.load(definitions))
    }

    pub fn load_from_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| PlcError::IoError(format!("{}: {}", path.display(), e)))?;
        self.load_from_json_str(&json)
    }

    pub fn clear(&self) {
        *self.signals.write() = Arc::new(SignalMap::new());
        debug!("Signal set cleared");
    }

    /// Current signal set
    pub fn signals(&self) -> Arc<SignalMap> {
        Arc::clone(&self.signals.read())
    }

    pub fn len(&self) -> usize {
        self.signals.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.read().is_empty()
    }

    pub fn get(&self, code: &str) -> Result<SignalDefinition> {
        self.signals
            .read()
            .get(code)
            .cloned()
            .ok_or_else(|| PlcError::not_found(code))
    }

    pub fn all(&self) -> Vec<SignalDefinition> {
        self.signals().values().cloned().collect()
    }

    pub fn by_group(&self, group: &str) -> Vec<SignalDefinition> {
        self.signals()
            .values()
            .filter(|d| d.param_group == group)
            .cloned()
            .collect()
    }

    // ========================================================================
    // Addressing
    // ========================================================================

    /// Modbus start address of a signal.
    ///
    /// When the signal names a PLC area and a vendor profile is active, the base
    /// address is area-relative and goes through the translator.
    pub fn resolve_address(&self, def: &SignalDefinition) -> Result<u16> {
        let base = match (self.options.address_mode, def.kind) {
            (AddressMode::LegacyOffset, SignalKind::HoldingRegister) => def.offset_value,
            _ => def.address,
        };

        let area = def.area_type.trim();
        let translator = self.translator.read();
        let (label, modbus) =
            if area.is_empty() || translator.processor_type() == ProcessorType::Unknown {
                ("modbus", base)
            } else {
                (area, i64::from(translator.to_modbus(area, base)?))
            };

        u16::try_from(modbus).map_err(|_| PlcError::out_of_range(label, base))
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn read_one(&self, code: &str) -> Result<SignalValue> {
        let def = self.get(code).inspect_err(|e| self.emit_error(e))?;
        self.read_definition(&def).await
    }

    async fn read_definition(&self, def: &SignalDefinition) -> Result<SignalValue> {
        if !def.is_active {
            return Err(PlcError::Inactive(def.code.clone()));
        }

        let address = self.resolve_address(def)?;
        let count = def.register_count.clamp(1, 4) as u16;
        let kind = match def.kind {
            SignalKind::Coil => RegisterKind::Coil,
            SignalKind::HoldingRegister => RegisterKind::HoldingRegister,
        };

        let raw = self.transport.try_read(kind, address, count).await?;
        SignalCodec::decode(def, &raw, &self.options.codec)
    }

    /// Read several signals; failures are left out of the result
    pub async fn read_many<S: AsRef<str>>(&self, codes: &[S]) -> ValueMap {
        let mut values = ValueMap::new();
        for code in codes {
            let code = code.as_ref();
            match self.read_one(code).await {
                Ok(value) => {
                    values.insert(code.to_string(), value);
                },
                Err(e) => log_skipped(code, &e),
            }
        }
        values
    }

    /// Read every active signal, regardless of direction
    pub async fn read_all_active(&self) -> ValueMap {
        let signals = self.signals();
        let mut values = ValueMap::new();
        for def in signals.values().filter(|d| d.is_active) {
            match self.read_definition(def).await {
                Ok(value) => {
                    values.insert(def.code.clone(), value);
                },
                Err(e) => log_skipped(&def.code, &e),
            }
        }
        values
    }

    // ========================================================================
    // Writes
    // ========================================================================

    pub async fn write_one(&self, code: &str, value: &SignalValue) -> Result<()> {
        let def = self.get(code).inspect_err(|e| self.emit_error(e))?;
        if !def.is_writable() {
            let err = PlcError::NotWritable(def.code.clone());
            self.emit_error(&err);
            return Err(err);
        }

        let address = self.resolve_address(&def)?;
        let words = SignalCodec::encode(&def, value, &self.options.codec)
            .inspect_err(|e| self.emit_error(e))?;
        debug!(code, %value, address, ?words, "write signal");

        match def.kind {
            SignalKind::Coil => {
                let bits: Vec<bool> = words.iter().map(|w| *w != 0).collect();
                match bits.as_slice() {
                    [single] => self.transport.try_write_coil(address, *single).await,
                    _ => self.transport.try_write_coils(address, &bits).await,
                }
            },
            SignalKind::HoldingRegister => self.transport.try_write_registers(address, &words).await,
        }
    }
}

/// Link trouble is worth a warning; unknown or inactive codes are routine
fn log_skipped(code: &str, err: &PlcError) {
    if err.is_transport() {
        warn!("Read {} failed: {}", code, err);
    } else {
        debug!("Read {} skipped: {}", code, err);
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use std::time::Duration;

    use tracing_test::traced_test;

    use super::*;
    use crate::signal::{DataType, Direction};
    use crate::transport::mock::{MockPlc, MockRequest};
    use crate::transport::{ConnectionState, TransportConfig};

    fn signal(code: &str, address: i64) -> SignalDefinition {
        SignalDefinition {
            code: code.to_string(),
            address,
            ..Default::default()
        }
    }

    async fn connected(plc: &MockPlc) -> TransportClient {
        let client = TransportClient::with_connector(plc.connector(), TransportConfig::default());
        assert!(client.connect("127.0.0.1", 502, 1));
        for _ in 0..100 {
            if client.state() == ConnectionState::Connected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(client.is_connected());
        client
    }

    fn registry(client: TransportClient) -> SignalRegistry {
        SignalRegistry::new(client, AddressTranslator::default(), RegistryOptions::default())
    }

    #[tokio::test]
    async fn test_load_replaces_and_drops_empty_codes() {
        let reg = registry(TransportClient::with_connector(
            MockPlc::new().connector(),
            TransportConfig::default(),
        ));
        let mut events = reg.subscribe();

        assert_eq!(reg.load(vec![signal("A", 0), signal(" ", 1), signal("B", 2)]), 2);
        assert_eq!(events.recv().await.unwrap(), RegistryEvent::Loaded { count: 2 });
        assert!(reg.get("A").is_ok());

        assert_eq!(reg.load(vec![signal("C", 3)]), 1);
        assert!(matches!(reg.get("A"), Err(PlcError::NotFound(_))));
        assert_eq!(reg.len(), 1);

        reg.clear();
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn test_load_skips_invalid_definitions() {
        let reg = registry(TransportClient::with_connector(
            MockPlc::new().connector(),
            TransportConfig::default(),
        ));
        let bad_count = SignalDefinition {
            register_count: 3,
            ..signal("X", 0)
        };
        assert_eq!(reg.load(vec![bad_count, signal("Y", -5), signal("Z", 1)]), 1);
        assert_eq!(reg.all()[0].code, "Z");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_duplicate_codes_keep_last() {
        let reg = registry(TransportClient::with_connector(
            MockPlc::new().connector(),
            TransportConfig::default(),
        ));
        assert_eq!(reg.load(vec![signal("A", 1), signal("A", 2)]), 1);
        assert_eq!(reg.get("A").unwrap().address, 2);
        assert!(logs_contain("Duplicate signal code A"));
    }

    #[tokio::test]
    async fn test_by_group() {
        let reg = registry(TransportClient::with_connector(
            MockPlc::new().connector(),
            TransportConfig::default(),
        ));
        let grouped = |code: &str, group: &str| SignalDefinition {
            param_group: group.to_string(),
            ..signal(code, 0)
        };
        reg.load(vec![grouped("A", "mold"), grouped("B", "press"), grouped("C", "mold")]);
        let codes: Vec<String> = reg.by_group("mold").into_iter().map(|d| d.code).collect();
        assert_eq!(codes, vec!["A", "C"]);
        assert!(reg.by_group("none").is_empty());
    }

    #[tokio::test]
    async fn test_load_from_json() {
        let reg = registry(TransportClient::with_connector(
            MockPlc::new().connector(),
            TransportConfig::default(),
        ));
        let n = reg
            .load_from_json_str(
                r#"[
                    {"signalCode": "P1", "registerAddress": 100, "dataType": "word"},
                    {"signalCode": "", "registerAddress": 101},
                    {"signalCode": "V1", "registerType": "1", "dataType": "bit", "isActive": "0"}
                ]"#,
            )
            .unwrap();
        assert_eq!(n, 2);
        assert!(!reg.get("V1").unwrap().is_active);
        assert!(reg.load_from_json_str("{not json").is_err());
    }

    #[tokio::test]
    async fn test_read_unknown_code_never_touches_transport() {
        let plc = MockPlc::new();
        let reg = registry(connected(&plc).await);
        let mut events = reg.subscribe();

        assert!(matches!(reg.read_one("nope").await, Err(PlcError::NotFound(_))));
        assert_eq!(plc.request_count(), 0);
        assert!(matches!(events.recv().await.unwrap(), RegistryEvent::Error(_)));
    }

    #[tokio::test]
    async fn test_read_inactive_signal() {
        let plc = MockPlc::new();
        let reg = registry(connected(&plc).await);
        reg.load(vec![SignalDefinition {
            is_active: false,
            ..signal("P1", 100)
        }]);
        assert!(matches!(reg.read_one("P1").await, Err(PlcError::Inactive(_))));
        assert_eq!(plc.request_count(), 0);
    }

    #[tokio::test]
    async fn test_read_word_and_coil() {
        let plc = MockPlc::new();
        plc.set_holding(100, &[500]);
        plc.set_coil(8, true);
        let reg = registry(connected(&plc).await);
        reg.load(vec![
            signal("P1", 100),
            SignalDefinition {
                kind: SignalKind::Coil,
                data_type: DataType::Bit,
                ..signal("V1", 8)
            },
        ]);

        assert_eq!(reg.read_one("P1").await.unwrap(), SignalValue::Int(500));
        assert_eq!(reg.read_one("V1").await.unwrap(), SignalValue::Bool(true));
        assert_eq!(
            plc.requests(),
            vec![
                MockRequest::Read {
                    kind: RegisterKind::HoldingRegister,
                    address: 100,
                    count: 1
                },
                MockRequest::Read {
                    kind: RegisterKind::Coil,
                    address: 8,
                    count: 1
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_read_while_disconnected_is_transport_error() {
        let plc = MockPlc::new();
        let client = TransportClient::with_connector(plc.connector(), TransportConfig::default());
        let reg = registry(client.clone());
        reg.load(vec![signal("P1", 100)]);

        assert!(matches!(reg.read_one("P1").await, Err(PlcError::NotConnected)));
        assert_eq!(client.last_error().as_deref(), Some("Not connected"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_load_warns_on_register_width_mismatch() {
        let reg = registry(TransportClient::with_connector(
            MockPlc::new().connector(),
            TransportConfig::default(),
        ));
        let short_float = SignalDefinition {
            data_type: DataType::Float32,
            register_count: 1,
            ..signal("F", 0)
        };
        let word = SignalDefinition {
            register_count: 1,
            ..signal("W", 2)
        };
        assert_eq!(reg.load(vec![short_float, word]), 2);
        assert!(logs_contain("Signal F reads 1 registers but float32 needs 2"));
        assert!(!logs_contain("Signal W reads"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_read_failures_logged_by_cause() {
        let plc = MockPlc::new();
        let client = TransportClient::with_connector(plc.connector(), TransportConfig::default());
        let reg = registry(client);
        reg.load(vec![signal("P1", 100)]);

        assert!(reg.read_many(&["P1", "missing"]).await.is_empty());
        assert!(logs_contain("Read P1 failed: Not connected"));
        assert!(logs_contain("Read missing skipped"));
    }

    #[tokio::test]
    async fn test_read_many_omits_failures() {
        let plc = MockPlc::new();
        plc.set_holding(0, &[1, 2]);
        let reg = registry(connected(&plc).await);
        reg.load(vec![
            signal("A", 0),
            signal("B", 1),
            SignalDefinition {
                is_active: false,
                ..signal("C", 2)
            },
        ]);

        let values = reg.read_many(&["A", "missing", "C", "B"]).await;
        assert_eq!(values.len(), 2);
        assert_eq!(values["A"], SignalValue::Int(1));
        assert_eq!(values["B"], SignalValue::Int(2));
    }

    #[tokio::test]
    async fn test_read_all_active_includes_write_signals() {
        let plc = MockPlc::new();
        plc.set_holding(0, &[10, 20, 30]);
        let reg = registry(connected(&plc).await);
        reg.load(vec![
            signal("R", 0),
            SignalDefinition {
                direction: Direction::Write,
                ..signal("W", 1)
            },
            SignalDefinition {
                is_active: false,
                ..signal("OFF", 2)
            },
        ]);

        let values = reg.read_all_active().await;
        assert_eq!(values.keys().collect::<Vec<_>>(), vec!["R", "W"]);
        assert_eq!(plc.request_count(), 2);
    }

    #[tokio::test]
    async fn test_write_read_only_signal_is_rejected() {
        let plc = MockPlc::new();
        let reg = registry(connected(&plc).await);
        reg.load(vec![signal("P1", 100)]);

        let res = reg.write_one("P1", &SignalValue::Int(1)).await;
        assert!(matches!(res, Err(PlcError::NotWritable(_))));
        assert_eq!(plc.request_count(), 0);
        assert!(matches!(
            reg.write_one("nope", &SignalValue::Int(1)).await,
            Err(PlcError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_write_scaled_word_and_float() {
        let plc = MockPlc::new();
        let reg = registry(connected(&plc).await);
        reg.load(vec![
            SignalDefinition {
                direction: Direction::Write,
                scale_factor: 2,
                ..signal("SP", 10)
            },
            SignalDefinition {
                direction: Direction::Write,
                data_type: DataType::Float32,
                register_count: 2,
                ..signal("F", 20)
            },
        ]);

        reg.write_one("SP", &SignalValue::Float(12.34)).await.unwrap();
        assert_eq!(plc.holding(10), 1234);
        assert_eq!(reg.read_one("SP").await.unwrap(), SignalValue::Float(12.34));

        reg.write_one("F", &SignalValue::Float(-1.5)).await.unwrap();
        assert_eq!(reg.read_one("F").await.unwrap(), SignalValue::Float(-1.5));
    }

    #[tokio::test]
    async fn test_write_out_of_range_never_reaches_plc() {
        let plc = MockPlc::new();
        let reg = registry(connected(&plc).await);
        let mut events = reg.subscribe();
        reg.load(vec![
            SignalDefinition {
                direction: Direction::Write,
                scale_factor: 2,
                ..signal("SP", 10)
            },
            SignalDefinition {
                direction: Direction::Write,
                data_type: DataType::Int32,
                register_count: 2,
                ..signal("I", 20)
            },
        ]);
        assert_eq!(events.recv().await.unwrap(), RegistryEvent::Loaded { count: 2 });

        reg.write_one("SP", &SignalValue::Float(1.5)).await.unwrap();
        assert_eq!(plc.holding(10), 150);
        plc.clear_requests();

        // 700.00 scales to 70000, which a 16-bit register cannot hold
        let res = reg.write_one("SP", &SignalValue::Float(700.0)).await;
        assert!(matches!(res, Err(PlcError::ValidationError(_))));
        assert!(matches!(
            reg.write_one("SP", &SignalValue::Int(-3)).await,
            Err(PlcError::ValidationError(_))
        ));
        assert!(matches!(
            reg.write_one("I", &SignalValue::Float(f64::NAN)).await,
            Err(PlcError::ValidationError(_))
        ));
        assert_eq!(plc.request_count(), 0);
        assert_eq!(plc.holding(10), 150);
        assert!(matches!(events.recv().await.unwrap(), RegistryEvent::Error(_)));
    }

    #[tokio::test]
    async fn test_write_coil() {
        let plc = MockPlc::new();
        let reg = registry(connected(&plc).await);
        reg.load(vec![SignalDefinition {
            direction: Direction::Write,
            kind: SignalKind::Coil,
            data_type: DataType::Bit,
            ..signal("V1", 4)
        }]);

        reg.write_one("V1", &SignalValue::Bool(true)).await.unwrap();
        assert!(plc.coil(4));
        assert_eq!(
            plc.requests(),
            vec![MockRequest::WriteCoil {
                address: 4,
                value: true
            }]
        );
    }

    #[tokio::test]
    async fn test_legacy_offset_addressing() {
        let plc = MockPlc::new();
        plc.set_holding(300, &[77]);
        plc.set_coil(5, true);
        let reg = SignalRegistry::new(
            connected(&plc).await,
            AddressTranslator::default(),
            RegistryOptions {
                address_mode: AddressMode::LegacyOffset,
                ..Default::default()
            },
        );
        reg.load(vec![
            SignalDefinition {
                offset_value: 300,
                ..signal("H", 100)
            },
            SignalDefinition {
                kind: SignalKind::Coil,
                data_type: DataType::Bit,
                offset_value: 999,
                ..signal("C", 5)
            },
        ]);

        assert_eq!(reg.read_one("H").await.unwrap(), SignalValue::Int(77));
        assert_eq!(reg.read_one("C").await.unwrap(), SignalValue::Bool(true));
    }

    #[tokio::test]
    async fn test_area_addressing() {
        let plc = MockPlc::new();
        // Omron DM starts at 9216
        plc.set_holding(9316, &[123]);
        let reg = registry(connected(&plc).await);
        reg.load(vec![SignalDefinition {
            area_type: "dm".to_string(),
            ..signal("D100", 100)
        }]);

        // No vendor yet: address is used as is
        assert_eq!(reg.resolve_address(&reg.get("D100").unwrap()).unwrap(), 100);

        assert!(reg.set_processor_type_str("omron"));
        assert!(!reg.set_processor_type(ProcessorType::Omron));
        assert_eq!(reg.read_one("D100").await.unwrap(), SignalValue::Int(123));

        // DM is not a Siemens area
        reg.set_processor_type(ProcessorType::Siemens);
        assert!(matches!(reg.read_one("D100").await, Err(PlcError::UnknownArea(_))));
    }

    #[tokio::test]
    async fn test_area_beyond_modbus_space_is_out_of_range() {
        let plc = MockPlc::new();
        let reg = SignalRegistry::new(
            connected(&plc).await,
            AddressTranslator::new(ProcessorType::Omron),
            RegistryOptions::default(),
        );
        // EM 30000 → 72000, past the 16-bit address space
        reg.load(vec![SignalDefinition {
            area_type: "EM".to_string(),
            ..signal("E", 30000)
        }]);
        assert!(matches!(
            reg.read_one("E").await,
            Err(PlcError::AddressOutOfRange { .. })
        ));
        assert_eq!(plc.request_count(), 0);
    }
}
