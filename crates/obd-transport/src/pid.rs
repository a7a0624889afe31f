//! OBD-II PID Descriptors and Decode Table
//!
//! Each parameter carries its own decode function and expected numeric
//! domain, so callers can classify a reply as in-range or garbage without
//! knowing any formula themselves.

use crate::command::{ObdCommand, PidMode};

/// Decode function: raw payload bytes to an engineering value
pub type DecodeFn = fn(&[u8]) -> Option<f64>;

/// Immutable description of one queryable parameter
#[derive(Debug, Clone)]
pub struct PidDescriptor {
    /// Canonical id, e.g. "010C"
    pub id: String,
    /// Request mode
    pub mode: PidMode,
    /// Parameter id byte
    pub pid: u8,
    /// Human-readable name, e.g. "RPM"
    pub name: String,
    /// Engineering unit, e.g. "rpm"
    pub unit: String,
    /// Decode strategy for this parameter
    pub decode: DecodeFn,
    /// Expected value domain (min, max); replies outside it are rejected
    pub domain: (f64, f64),
}

impl PidDescriptor {
    pub fn new(
        mode: PidMode,
        pid: u8,
        name: &str,
        unit: &str,
        decode: DecodeFn,
        domain: (f64, f64),
    ) -> Self {
        Self {
            id: format!("{:02X}{:02X}", mode.as_byte(), pid),
            mode,
            pid,
            name: name.to_string(),
            unit: unit.to_string(),
            decode,
            domain,
        }
    }

    /// The wire command for this parameter
    pub fn command(&self) -> ObdCommand {
        ObdCommand::read(self.mode, self.pid)
    }

    /// Decode a payload and reject values outside the expected domain
    pub fn decode_in_domain(&self, payload: &[u8]) -> Option<f64> {
        let value = (self.decode)(payload)?;
        let (min, max) = self.domain;
        if value >= min && value <= max {
            Some(value)
        } else {
            None
        }
    }
}

/// Ordered, id-unique collection of PID descriptors
#[derive(Debug, Clone, Default)]
pub struct PidSet {
    pids: Vec<PidDescriptor>,
}

impl PidSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert preserving order; duplicates by id are ignored
    pub fn insert(&mut self, pid: PidDescriptor) -> bool {
        if self.contains(&pid.id) {
            return false;
        }
        self.pids.push(pid);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pids.iter().any(|p| p.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&PidDescriptor> {
        self.pids.iter().find(|p| p.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PidDescriptor> {
        self.pids.iter()
    }

    pub fn ids(&self) -> Vec<String> {
        self.pids.iter().map(|p| p.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.pids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }
}

impl FromIterator<PidDescriptor> for PidSet {
    fn from_iter<T: IntoIterator<Item = PidDescriptor>>(iter: T) -> Self {
        let mut set = PidSet::new();
        for pid in iter {
            set.insert(pid);
        }
        set
    }
}

// Decode formulas per SAE J1979 appendix B.

fn decode_percent(b: &[u8]) -> Option<f64> {
    b.first().map(|&a| a as f64 * 100.0 / 255.0)
}

fn decode_temp(b: &[u8]) -> Option<f64> {
    b.first().map(|&a| a as f64 - 40.0)
}

fn decode_fuel_trim(b: &[u8]) -> Option<f64> {
    b.first().map(|&a| (a as f64 - 128.0) * 100.0 / 128.0)
}

fn decode_rpm(b: &[u8]) -> Option<f64> {
    match b {
        [a, rest, ..] => Some((*a as f64 * 256.0 + *rest as f64) / 4.0),
        _ => None,
    }
}

fn decode_byte(b: &[u8]) -> Option<f64> {
    b.first().map(|&a| a as f64)
}

fn decode_fuel_pressure(b: &[u8]) -> Option<f64> {
    b.first().map(|&a| a as f64 * 3.0)
}

fn decode_timing_advance(b: &[u8]) -> Option<f64> {
    b.first().map(|&a| a as f64 / 2.0 - 64.0)
}

fn decode_maf(b: &[u8]) -> Option<f64> {
    match b {
        [a, rest, ..] => Some((*a as f64 * 256.0 + *rest as f64) / 100.0),
        _ => None,
    }
}

fn decode_o2_voltage(b: &[u8]) -> Option<f64> {
    b.first().map(|&a| a as f64 / 200.0)
}

fn decode_module_voltage(b: &[u8]) -> Option<f64> {
    match b {
        [a, rest, ..] => Some((*a as f64 * 256.0 + *rest as f64) / 1000.0),
        _ => None,
    }
}

fn decode_absolute_load(b: &[u8]) -> Option<f64> {
    match b {
        [a, rest, ..] => Some((*a as f64 * 256.0 + *rest as f64) * 100.0 / 255.0),
        _ => None,
    }
}

fn decode_fuel_rate(b: &[u8]) -> Option<f64> {
    match b {
        [a, rest, ..] => Some((*a as f64 * 256.0 + *rest as f64) / 20.0),
        _ => None,
    }
}

/// The standard Mode-01 parameters this tool knows how to decode, in
/// ascending PID order
pub fn standard_registry() -> PidSet {
    use PidMode::Standard01 as M01;

    let table: [(u8, &str, &str, DecodeFn, (f64, f64)); 19] = [
        (0x04, "ENGINE_LOAD", "%", decode_percent, (0.0, 100.0)),
        (0x05, "COOLANT_TEMP", "degC", decode_temp, (-40.0, 215.0)),
        (0x06, "SHORT_FUEL_TRIM_1", "%", decode_fuel_trim, (-100.0, 99.2)),
        (0x07, "LONG_FUEL_TRIM_1", "%", decode_fuel_trim, (-100.0, 99.2)),
        (0x0A, "FUEL_PRESSURE", "kPa", decode_fuel_pressure, (0.0, 765.0)),
        (0x0B, "INTAKE_PRESSURE", "kPa", decode_byte, (0.0, 255.0)),
        (0x0C, "RPM", "rpm", decode_rpm, (0.0, 16383.75)),
        (0x0D, "SPEED", "km/h", decode_byte, (0.0, 255.0)),
        (0x0E, "TIMING_ADVANCE", "deg", decode_timing_advance, (-64.0, 63.5)),
        (0x0F, "INTAKE_TEMP", "degC", decode_temp, (-40.0, 215.0)),
        (0x10, "MAF", "g/s", decode_maf, (0.0, 655.35)),
        (0x11, "THROTTLE_POS", "%", decode_percent, (0.0, 100.0)),
        (0x14, "O2_B1S1_VOLTAGE", "V", decode_o2_voltage, (0.0, 1.275)),
        (0x2F, "FUEL_LEVEL", "%", decode_percent, (0.0, 100.0)),
        (0x42, "CONTROL_MODULE_VOLTAGE", "V", decode_module_voltage, (0.0, 65.535)),
        (0x43, "ABSOLUTE_LOAD", "%", decode_absolute_load, (0.0, 25700.0)),
        (0x46, "AMBIANT_AIR_TEMP", "degC", decode_temp, (-40.0, 215.0)),
        (0x4C, "THROTTLE_ACTUATOR", "%", decode_percent, (0.0, 100.0)),
        (0x5E, "FUEL_RATE", "L/h", decode_fuel_rate, (0.0, 3276.75)),
    ];

    table
        .into_iter()
        .map(|(pid, name, unit, decode, domain)| {
            PidDescriptor::new(M01, pid, name, unit, decode, domain)
        })
        .collect()
}
