//! This module is used to define the input registers on the PZEM-6L24 and how to decode them.
//!
//! All measurements are read with function `0x04`. Per phase values are laid out as blocks of
//! A, B, C; 32 bit values are two registers with the high word first.

use core::fmt;

use strum::IntoEnumIterator;
use strum_macros::{Display, EnumCount, EnumIter, EnumString};

use crate::codec::RegisterWords;
use crate::error::ConfigError;

/// Everything the meter can measure.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    EnumIter,
    EnumCount,
    EnumString,
    Display,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "SCREAMING_SNAKE_CASE")
)]
pub enum MeasurementKind {
    Voltage,
    Current,
    ActivePower,
    ActiveEnergy,
    ReactivePower,
    ReactiveEnergy,
    ApparentPower,
    ApparentEnergy,
    PowerFactor,
    Frequency,
    VoltagePhaseAngle,
    CurrentPhaseAngle,
}

/// Which line a measurement belongs to, or the combined value across all three.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    EnumIter,
    EnumCount,
    EnumString,
    Display,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "SCREAMING_SNAKE_CASE")
)]
pub enum Phase {
    A,
    B,
    C,
    #[default]
    Combined,
}

impl Phase {
    /// Position within a per phase register block, `None` for [`Phase::Combined`].
    pub const fn index(&self) -> Option<u16> {
        match self {
            Phase::A => Some(0),
            Phase::B => Some(1),
            Phase::C => Some(2),
            Phase::Combined => None,
        }
    }
}

/// The unit of subscription: one measurement on one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MeasurementRequest {
    pub kind: MeasurementKind,
    #[cfg_attr(feature = "serde", serde(default))]
    pub phase: Phase,
}

impl MeasurementRequest {
    pub const fn new(kind: MeasurementKind, phase: Phase) -> Self {
        Self { kind, phase }
    }

    /// Parse a request from its configuration names, e.g. `("active_power", Some("a"))`.
    ///
    /// A missing phase means [`Phase::Combined`].
    pub fn parse(kind: &str, phase: Option<&str>) -> Result<Self, ConfigError> {
        let kind = kind
            .parse::<MeasurementKind>()
            .map_err(|_| ConfigError::UnknownKind(kind.to_owned()))?;
        let phase = match phase {
            Some(name) => name
                .parse::<Phase>()
                .map_err(|_| ConfigError::UnknownPhase(name.to_owned()))?,
            None => Phase::default(),
        };
        Ok(Self { kind, phase })
    }
}

impl fmt::Display for MeasurementRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.kind, self.phase)
    }
}

/// How raw register words turn into a physical value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecodeRule {
    /// One unsigned register.
    Unsigned16 { divisor: f64 },
    /// Two registers, high word first, two's complement.
    Signed32 { divisor: f64 },
    /// Upper byte of one register.
    HighByte { divisor: f64 },
    /// Lower byte of one register.
    LowByte { divisor: f64 },
    /// Mean of `count` unsigned registers.
    Mean { divisor: f64 },
    /// No registers; phase A is the angle reference and always reads zero.
    Reference,
}

/// Where a measurement lives and how to decode it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterSpec {
    pub start: u16,
    pub count: u16,
    pub rule: DecodeRule,
}

// Resolutions of the raw registers.
const CENTI: f64 = 100.0;
const DECI: f64 = 10.0;

const VOLTAGE: u16 = 0x0000;
const CURRENT: u16 = 0x0003;
const FREQUENCY: u16 = 0x0006;
/// Phase B voltage angle. Phase A is the reference and has no register.
const VOLTAGE_ANGLE_B: u16 = 0x0009;
const CURRENT_ANGLE: u16 = 0x000B;
const ACTIVE_POWER: u16 = 0x000E;
const REACTIVE_POWER: u16 = 0x0014;
const APPARENT_POWER: u16 = 0x001A;
const ACTIVE_POWER_COMBINED: u16 = 0x0020;
const REACTIVE_POWER_COMBINED: u16 = 0x0022;
const APPARENT_POWER_COMBINED: u16 = 0x0024;
/// A in the high byte, B in the low byte.
const POWER_FACTOR_A_B: u16 = 0x0026;
/// C in the high byte, combined in the low byte.
const POWER_FACTOR_C_COMBINED: u16 = 0x0027;
const ACTIVE_ENERGY: u16 = 0x0028;
const REACTIVE_ENERGY: u16 = 0x002E;
const APPARENT_ENERGY: u16 = 0x0034;
const ACTIVE_ENERGY_COMBINED: u16 = 0x003A;
const REACTIVE_ENERGY_COMBINED: u16 = 0x003C;
const APPARENT_ENERGY_COMBINED: u16 = 0x003E;

impl RegisterSpec {
    const fn unsigned(start: u16) -> Self {
        Self {
            start,
            count: 1,
            rule: DecodeRule::Unsigned16 { divisor: CENTI },
        }
    }

    const fn signed32(start: u16) -> Self {
        Self {
            start,
            count: 2,
            rule: DecodeRule::Signed32 { divisor: DECI },
        }
    }

    /// Registers past the last one this spec reads.
    pub const fn end(&self) -> u32 {
        self.start as u32 + self.count as u32
    }

    /// Decode the words read for this spec. Yields `NaN` if fewer than `count` words are given.
    pub fn decode(&self, words: &[u16]) -> f64 {
        if words.len() < self.count as usize {
            return f64::NAN;
        }

        match self.rule {
            DecodeRule::Unsigned16 { divisor } => f64::from(words[0]) / divisor,
            DecodeRule::Signed32 { divisor } => {
                f64::from(combine_registers(words[0], words[1])) / divisor
            }
            DecodeRule::HighByte { divisor } => f64::from(words[0] >> 8) / divisor,
            DecodeRule::LowByte { divisor } => f64::from(words[0] & 0xFF) / divisor,
            DecodeRule::Mean { divisor } => {
                let words = &words[..self.count as usize];
                let sum: f64 = words.iter().copied().map(f64::from).sum();
                sum / words.len() as f64 / divisor
            }
            DecodeRule::Reference => 0.0,
        }
    }

    /// Produce the raw words a device would report for `value`. Out of range values saturate.
    pub fn encode(&self, value: f64) -> RegisterWords {
        let mut words = RegisterWords::new();
        match self.rule {
            DecodeRule::Unsigned16 { divisor } => {
                let _ = words.push((value * divisor).round() as u16);
            }
            DecodeRule::Signed32 { divisor } => {
                let raw = (value * divisor).round() as i32 as u32;
                let _ = words.push((raw >> 16) as u16);
                let _ = words.push(raw as u16);
            }
            DecodeRule::HighByte { divisor } => {
                let _ = words.push(((value * divisor).round() as u8 as u16) << 8);
            }
            DecodeRule::LowByte { divisor } => {
                let _ = words.push((value * divisor).round() as u8 as u16);
            }
            DecodeRule::Mean { divisor } => {
                let raw = (value * divisor).round() as u16;
                for _ in 0..self.count {
                    let _ = words.push(raw);
                }
            }
            DecodeRule::Reference => {}
        }
        words
    }
}

fn combine_registers(high: u16, low: u16) -> i32 {
    ((u32::from(high) << 16) | u32::from(low)) as i32
}

/// Find the registers backing a measurement.
pub fn lookup(request: MeasurementRequest) -> Result<RegisterSpec, ConfigError> {
    use MeasurementKind as MK;

    let unsupported = ConfigError::UnsupportedMeasurement {
        kind: request.kind,
        phase: request.phase,
    };

    let spec = match (request.kind, request.phase.index()) {
        (MK::Voltage, Some(i)) => RegisterSpec::unsigned(VOLTAGE + i),
        // The meter has no combined voltage register, report the mean of the three lines.
        (MK::Voltage, None) => RegisterSpec {
            start: VOLTAGE,
            count: 3,
            rule: DecodeRule::Mean { divisor: CENTI },
        },
        (MK::Current, Some(i)) => RegisterSpec::unsigned(CURRENT + i),
        (MK::Frequency, Some(i)) => RegisterSpec::unsigned(FREQUENCY + i),
        (MK::VoltagePhaseAngle, Some(0)) => RegisterSpec {
            start: VOLTAGE_ANGLE_B,
            count: 0,
            rule: DecodeRule::Reference,
        },
        (MK::VoltagePhaseAngle, Some(i)) => RegisterSpec::unsigned(VOLTAGE_ANGLE_B + i - 1),
        (MK::CurrentPhaseAngle, Some(i)) => RegisterSpec::unsigned(CURRENT_ANGLE + i),

        (MK::ActivePower, Some(i)) => RegisterSpec::signed32(ACTIVE_POWER + 2 * i),
        (MK::ActivePower, None) => RegisterSpec::signed32(ACTIVE_POWER_COMBINED),
        (MK::ReactivePower, Some(i)) => RegisterSpec::signed32(REACTIVE_POWER + 2 * i),
        (MK::ReactivePower, None) => RegisterSpec::signed32(REACTIVE_POWER_COMBINED),
        (MK::ApparentPower, Some(i)) => RegisterSpec::signed32(APPARENT_POWER + 2 * i),
        (MK::ApparentPower, None) => RegisterSpec::signed32(APPARENT_POWER_COMBINED),

        (MK::ActiveEnergy, Some(i)) => RegisterSpec::signed32(ACTIVE_ENERGY + 2 * i),
        (MK::ActiveEnergy, None) => RegisterSpec::signed32(ACTIVE_ENERGY_COMBINED),
        (MK::ReactiveEnergy, Some(i)) => RegisterSpec::signed32(REACTIVE_ENERGY + 2 * i),
        (MK::ReactiveEnergy, None) => RegisterSpec::signed32(REACTIVE_ENERGY_COMBINED),
        (MK::ApparentEnergy, Some(i)) => RegisterSpec::signed32(APPARENT_ENERGY + 2 * i),
        (MK::ApparentEnergy, None) => RegisterSpec::signed32(APPARENT_ENERGY_COMBINED),

        (MK::PowerFactor, phase) => {
            let divisor = CENTI;
            let (start, rule) = match phase {
                Some(0) => (POWER_FACTOR_A_B, DecodeRule::HighByte { divisor }),
                Some(1) => (POWER_FACTOR_A_B, DecodeRule::LowByte { divisor }),
                Some(_) => (POWER_FACTOR_C_COMBINED, DecodeRule::HighByte { divisor }),
                None => (POWER_FACTOR_C_COMBINED, DecodeRule::LowByte { divisor }),
            };
            RegisterSpec {
                start,
                count: 1,
                rule,
            }
        }

        (MK::Current | MK::Frequency | MK::VoltagePhaseAngle | MK::CurrentPhaseAngle, None) => {
            return Err(unsupported);
        }
    };
    Ok(spec)
}

/// Every measurement/phase combination the meter can report.
pub fn supported_requests() -> impl Iterator<Item = MeasurementRequest> {
    MeasurementKind::iter()
        .flat_map(|kind| Phase::iter().map(move |phase| MeasurementRequest::new(kind, phase)))
        .filter(|request| lookup(*request).is_ok())
}
