//! Symbolic PLC names to Modbus addresses.
//!
//! The LS PLC numbers its `M` bit devices in hex (`M0000B` is coil 11,
//! `M00020` is coil 32) while `D` word devices are usually decimal.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use super::{PlcError, Result};

/// Coil name to 0-based Modbus coil address.
pub const COIL_MAP: &[(&str, u16)] = &[
    ("R_P_SW", 0),
    ("R_V_SW", 1),
    ("F_V_SW", 2),
    ("M_V_SW", 3),
    ("V_V_SW", 4),
    ("TMP_SW", 5),
    ("SHUTTER_1_SW", 6),
    ("SHUTTER_2_SW", 7),
    ("MAIN_SHUTTER_SW", 8),
    ("POWER_1_SW", 9),
    ("POWER_2_SW", 10),
    ("FTM_SW", 11),
    ("DOOR_SW", 12),
    ("AIR_SW", 32),
    ("WATER_SW", 33),
    ("GAS_1_SW", 34),
    ("GAS_2_SW", 35),
];

/// Holding register name to 0-based Modbus register address.
pub const REGISTER_MAP: &[(&str, u16)] = &[("DAC_POWER_1", 0), ("DAC_POWER_2", 1)];

const ALIASES: &[(&str, &str)] = &[
    ("RP", "R_P_SW"),
    ("RV", "R_V_SW"),
    ("FV", "F_V_SW"),
    ("MV", "M_V_SW"),
    ("VV", "V_V_SW"),
    ("V/V", "V_V_SW"),
    ("VENT", "V_V_SW"),
    ("TMP", "TMP_SW"),
    ("SHUTTER1", "SHUTTER_1_SW"),
    ("SHUTTER2", "SHUTTER_2_SW"),
    ("MAINSHUTTER", "MAIN_SHUTTER_SW"),
    ("MS", "MAIN_SHUTTER_SW"),
    ("AIR", "AIR_SW"),
    ("WATER", "WATER_SW"),
    ("G1", "GAS_1_SW"),
    ("G2", "GAS_2_SW"),
    ("GAS1", "GAS_1_SW"),
    ("GAS2", "GAS_2_SW"),
    ("POWER1", "POWER_1_SW"),
    ("POWER2", "POWER_2_SW"),
    ("DOOR", "DOOR_SW"),
    ("FTM", "FTM_SW"),
    ("DACPOWER1", "DAC_POWER_1"),
    ("DACPOWER2", "DAC_POWER_2"),
    ("DAC1", "DAC_POWER_1"),
    ("DAC2", "DAC_POWER_2"),
];

/// A raw address or anything the resolver can turn into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlcAddress<'a> {
    Raw(u16),
    Name(&'a str),
}

impl From<u16> for PlcAddress<'_> {
    fn from(addr: u16) -> Self {
        PlcAddress::Raw(addr)
    }
}

impl<'a> From<&'a str> for PlcAddress<'a> {
    fn from(name: &'a str) -> Self {
        PlcAddress::Name(name)
    }
}

impl<'a> From<&'a String> for PlcAddress<'a> {
    fn from(name: &'a String) -> Self {
        PlcAddress::Name(name.as_str())
    }
}

impl std::fmt::Display for PlcAddress<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlcAddress::Raw(addr) => write!(f, "{}", addr),
            PlcAddress::Name(name) => write!(f, "{}", name),
        }
    }
}

/// Which address family a canonical name lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    Coil,
    Register,
}

pub struct AddressResolver {
    coils: HashMap<&'static str, u16>,
    registers: HashMap<&'static str, u16>,
    synonyms: HashMap<String, &'static str>,
}

static GLOBAL: Lazy<AddressResolver> = Lazy::new(AddressResolver::new);

impl AddressResolver {
    pub fn new() -> Self {
        let coils: HashMap<_, _> = COIL_MAP.iter().copied().collect();
        let registers: HashMap<_, _> = REGISTER_MAP.iter().copied().collect();

        let mut synonyms = HashMap::new();
        for (name, _) in COIL_MAP.iter().chain(REGISTER_MAP.iter()) {
            synonyms.insert(Self::normalize(name), *name);
        }
        for (alias, canonical) in ALIASES {
            synonyms.insert(Self::normalize(alias), *canonical);
        }

        Self {
            coils,
            registers,
            synonyms,
        }
    }

    /// Process-wide resolver built from the fixed maps.
    pub fn global() -> &'static AddressResolver {
        &GLOBAL
    }

    /// Uppercases and strips whitespace, `_`, `-` and `/`.
    pub fn normalize(name: &str) -> String {
        name.chars()
            .filter(|c| !c.is_whitespace() && !matches!(c, '_' | '-' | '/'))
            .map(|c| c.to_ascii_uppercase())
            .collect()
    }

    /// Canonical map key for a name or alias, if it is one.
    pub fn canonical(&self, name: &str) -> Option<(&'static str, AddressKind)> {
        let key = name.trim();
        if let Some((k, _)) = self.coils.get_key_value(key) {
            return Some((*k, AddressKind::Coil));
        }
        if let Some((k, _)) = self.registers.get_key_value(key) {
            return Some((*k, AddressKind::Register));
        }
        let canonical = *self.synonyms.get(&Self::normalize(key))?;
        if self.coils.contains_key(canonical) {
            Some((canonical, AddressKind::Coil))
        } else if self.registers.contains_key(canonical) {
            Some((canonical, AddressKind::Register))
        } else {
            None
        }
    }

    pub fn resolve<'a>(&self, target: impl Into<PlcAddress<'a>>) -> Result<u16> {
        let name = match target.into() {
            PlcAddress::Raw(addr) => return Ok(addr),
            PlcAddress::Name(name) => name,
        };

        let key = name.trim();
        if key.is_empty() {
            return Err(PlcError::UnknownAddress(name.to_string()));
        }

        if let Some((canonical, kind)) = self.canonical(key) {
            let map = match kind {
                AddressKind::Coil => &self.coils,
                AddressKind::Register => &self.registers,
            };
            if let Some(addr) = map.get(canonical) {
                return Ok(*addr);
            }
        }

        let upper = key.to_ascii_uppercase();
        let unknown = || PlcError::UnknownAddress(name.to_string());

        if let Some(digits) = upper.strip_prefix('M') {
            return u16::from_str_radix(digits, 16).map_err(|_| unknown());
        }
        if let Some(digits) = upper.strip_prefix('D') {
            let radix = if digits.chars().any(|c| matches!(c, 'A'..='F')) {
                16
            } else {
                10
            };
            return u16::from_str_radix(digits, radix).map_err(|_| unknown());
        }

        parse_int_literal(&upper).ok_or_else(unknown)
    }

    /// True if `target` names a holding register.
    ///
    /// Named coils never count, even when their spelling starts with `D`
    /// (`DOOR`); only raw `D` device strings use the prefix rule.
    pub fn is_register<'a>(&self, target: impl Into<PlcAddress<'a>>) -> bool {
        let name = match target.into() {
            PlcAddress::Raw(_) => return false,
            PlcAddress::Name(name) => name,
        };
        match self.canonical(name) {
            Some((_, kind)) => kind == AddressKind::Register,
            None => name.trim().to_ascii_uppercase().starts_with('D'),
        }
    }
}

impl Default for AddressResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_int_literal(s: &str) -> Option<u16> {
    let (digits, radix) = if let Some(rest) = s.strip_prefix("0X") {
        (rest, 16)
    } else if let Some(rest) = s.strip_prefix("0O") {
        (rest, 8)
    } else if let Some(rest) = s.strip_prefix("0B") {
        (rest, 2)
    } else {
        (s, 10)
    };
    u16::from_str_radix(digits, radix).ok()
}
