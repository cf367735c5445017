//! PLC memory area to Modbus address translation
//!
//! Each vendor exposes its controller memory as named areas (Omron `DM`, Siemens
//! `DB`, Mitsubishi `D`, ...). The gateway in front of the PLC re-bases every area
//! onto one flat Modbus register space. The tables below are fixed per vendor.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PlcError, Result};

/// Controller vendor family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorType {
    Omron,
    Siemens,
    Mitsubishi,
    #[default]
    Unknown,
}

impl ProcessorType {
    /// Parse a vendor name. Unrecognized names map to `Unknown`.
    ///
    /// Accepted synonyms: `cj` for Omron, `s7` for Siemens, `q` for Mitsubishi.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "omron" | "cj" => ProcessorType::Omron,
            "siemens" | "s7" => ProcessorType::Siemens,
            "mitsubishi" | "q" => ProcessorType::Mitsubishi,
            _ => ProcessorType::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessorType::Omron => "omron",
            ProcessorType::Siemens => "siemens",
            ProcessorType::Mitsubishi => "mitsubishi",
            ProcessorType::Unknown => "unknown",
        }
    }

    /// Area table for this vendor
    pub fn ranges(&self) -> &'static [AddressRange] {
        match self {
            ProcessorType::Omron => OMRON_RANGES,
            ProcessorType::Siemens => SIEMENS_RANGES,
            ProcessorType::Mitsubishi => MITSUBISHI_RANGES,
            ProcessorType::Unknown => &[],
        }
    }

    /// Resolve a vendor-neutral area tag to this vendor's area.
    ///
    /// Mitsubishi calls its internal relays `M`, which shares the tag with the
    /// Siemens marker area; under Mitsubishi `M` means `MR`.
    fn canonical_area(&self, area: AreaType) -> AreaType {
        match (self, area) {
            (ProcessorType::Mitsubishi, AreaType::M) => AreaType::Mr,
            _ => area,
        }
    }
}

impl fmt::Display for ProcessorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named PLC memory area
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AreaType {
    // Omron
    Cio,
    Wr,
    Hr,
    Ar,
    Dm,
    Em,
    Tim,
    Cnt,
    // Siemens
    I,
    Q,
    M,
    Db,
    // Mitsubishi
    X,
    Y,
    Mr,
    D,
    W,
}

impl AreaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AreaType::Cio => "CIO",
            AreaType::Wr => "WR",
            AreaType::Hr => "HR",
            AreaType::Ar => "AR",
            AreaType::Dm => "DM",
            AreaType::Em => "EM",
            AreaType::Tim => "TIM",
            AreaType::Cnt => "CNT",
            AreaType::I => "I",
            AreaType::Q => "Q",
            AreaType::M => "M",
            AreaType::Db => "DB",
            AreaType::X => "X",
            AreaType::Y => "Y",
            AreaType::Mr => "MR",
            AreaType::D => "D",
            AreaType::W => "W",
        }
    }
}

impl FromStr for AreaType {
    type Err = PlcError;

    /// Case-insensitive, trimmed. Anything unrecognized is rejected.
    fn from_str(s: &str) -> Result<Self> {
        let area = match s.trim().to_uppercase().as_str() {
            "CIO" => AreaType::Cio,
            "WR" => AreaType::Wr,
            "HR" => AreaType::Hr,
            "AR" => AreaType::Ar,
            "DM" => AreaType::Dm,
            "EM" => AreaType::Em,
            "TIM" => AreaType::Tim,
            "CNT" => AreaType::Cnt,
            "I" => AreaType::I,
            "Q" => AreaType::Q,
            "M" => AreaType::M,
            "DB" => AreaType::Db,
            "X" => AreaType::X,
            "Y" => AreaType::Y,
            "MR" => AreaType::Mr,
            "D" => AreaType::D,
            "W" => AreaType::W,
            _ => return Err(PlcError::UnknownArea(s.to_string())),
        };
        Ok(area)
    }
}

impl fmt::Display for AreaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One area's window in the Modbus address space (inclusive bounds)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    pub area: AreaType,
    pub modbus_start: u32,
    pub modbus_end: u32,
    /// First PLC address of the area, subtracted before re-basing
    pub plc_offset: u32,
}

impl AddressRange {
    const fn new(area: AreaType, modbus_start: u32, modbus_end: u32) -> Self {
        Self {
            area,
            modbus_start,
            modbus_end,
            plc_offset: 0,
        }
    }

    pub fn contains(&self, modbus_address: u32) -> bool {
        (self.modbus_start..=self.modbus_end).contains(&modbus_address)
    }

    /// Number of addresses in the window
    pub fn span(&self) -> u32 {
        self.modbus_end - self.modbus_start + 1
    }
}

// TIM and CNT are valid Omron area names but the gateway does not map them.
static OMRON_RANGES: &[AddressRange] = &[
    AddressRange::new(AreaType::Cio, 0, 6143),
    AddressRange::new(AreaType::Wr, 6144, 7167),
    AddressRange::new(AreaType::Hr, 7168, 8191),
    AddressRange::new(AreaType::Ar, 8192, 9215),
    AddressRange::new(AreaType::Dm, 9216, 41983),
    AddressRange::new(AreaType::Em, 42000, 74767),
];

static SIEMENS_RANGES: &[AddressRange] = &[
    AddressRange::new(AreaType::I, 0, 1023),
    AddressRange::new(AreaType::Q, 1024, 2047),
    AddressRange::new(AreaType::M, 2048, 4095),
    AddressRange::new(AreaType::Db, 4096, 65535),
];

static MITSUBISHI_RANGES: &[AddressRange] = &[
    AddressRange::new(AreaType::X, 0, 2047),
    AddressRange::new(AreaType::Y, 2048, 4095),
    AddressRange::new(AreaType::Mr, 4096, 12287),
    AddressRange::new(AreaType::D, 12288, 45055),
    AddressRange::new(AreaType::W, 45056, 53247),
];

/// Translates between vendor area addresses and flat Modbus addresses
#[derive(Debug, Clone, Default)]
pub struct AddressTranslator {
    processor: ProcessorType,
}

impl AddressTranslator {
    pub fn new(processor: ProcessorType) -> Self {
        Self { processor }
    }

    pub fn processor_type(&self) -> ProcessorType {
        self.processor
    }

    /// Select the vendor profile. Returns false when it was already active.
    pub fn set_processor_type(&mut self, processor: ProcessorType) -> bool {
        if self.processor == processor {
            return false;
        }
        debug!(from = %self.processor, to = %processor, "Processor type changed");
        self.processor = processor;
        true
    }

    /// Select the vendor profile by name (see [`ProcessorType::parse`])
    pub fn set_processor_type_str(&mut self, name: &str) -> bool {
        self.set_processor_type(ProcessorType::parse(name))
    }

    /// Active area table
    pub fn areas(&self) -> &'static [AddressRange] {
        self.processor.ranges()
    }

    fn lookup(&self, area: AreaType) -> Result<&'static AddressRange> {
        let area = self.processor.canonical_area(area);
        self.areas()
            .iter()
            .find(|r| r.area == area)
            .ok_or_else(|| PlcError::UnknownArea(area.to_string()))
    }

    fn lookup_name(&self, area_name: &str) -> Result<&'static AddressRange> {
        self.lookup(area_name.parse()?)
    }

    /// PLC area address to Modbus address
    pub fn to_modbus(&self, area_name: &str, plc_address: i64) -> Result<u32> {
        let range = self.lookup_name(area_name)?;
        Self::rebase(range, plc_address)
    }

    /// Same as [`to_modbus`](Self::to_modbus) with an already parsed area
    pub fn area_to_modbus(&self, area: AreaType, plc_address: i64) -> Result<u32> {
        let range = self.lookup(area)?;
        Self::rebase(range, plc_address)
    }

    fn rebase(range: &AddressRange, plc_address: i64) -> Result<u32> {
        let relative = plc_address - i64::from(range.plc_offset);
        let modbus = i64::from(range.modbus_start) + relative;
        if relative < 0 || modbus > i64::from(range.modbus_end) {
            return Err(PlcError::out_of_range(range.area.as_str(), plc_address));
        }
        Ok(modbus as u32)
    }

    /// Modbus address back to (area, PLC address)
    pub fn from_modbus(&self, modbus_address: u32) -> Result<(AreaType, i64)> {
        self.areas()
            .iter()
            .find(|r| r.contains(modbus_address))
            .map(|r| {
                let plc = i64::from(modbus_address - r.modbus_start) + i64::from(r.plc_offset);
                (r.area, plc)
            })
            .ok_or_else(|| PlcError::out_of_range(self.processor.as_str(), i64::from(modbus_address)))
    }

    /// Modbus window `(start, end)` of an area, inclusive
    pub fn range_of(&self, area_name: &str) -> Result<(u32, u32)> {
        let range = self.lookup_name(area_name)?;
        Ok((range.modbus_start, range.modbus_end))
    }
}
