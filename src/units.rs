use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use thiserror::Error;

pub const BTU_PER_KBTU: f64 = 1_000.;
pub const BTU_PER_MMBTU: f64 = 1_000_000.;
pub const BTU_PER_KILOWATT_HOUR: f64 = 3_412.14;
pub const BTU_PER_THERM: f64 = 100_000.;
pub const KBTU_PER_MMBTU_PER_SQUARE_FOOT: f64 = 1_000.;

/// The fixed, enumerable set of IP quantities the translator converts
/// between. Conversions are only defined within a dimension; requesting a
/// cross-dimension conversion is a typed error, not a silent identity.
#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, PartialEq, Serialize,
)]
pub enum EnergyUnit {
    #[strum(serialize = "Btu")]
    #[serde(rename = "Btu")]
    Btu,
    #[strum(serialize = "kBtu")]
    #[serde(rename = "kBtu")]
    KBtu,
    #[strum(serialize = "MMBtu")]
    #[serde(rename = "MMBtu")]
    MMBtu,
    #[strum(serialize = "kWh")]
    #[serde(rename = "kWh")]
    KilowattHours,
    #[strum(serialize = "therms")]
    #[serde(rename = "therms")]
    Therms,
    #[strum(serialize = "kW")]
    #[serde(rename = "kW")]
    Kilowatts,
    #[strum(serialize = "kBtu/ft2")]
    #[serde(rename = "kBtu/ft2")]
    KBtuPerSquareFoot,
    #[strum(serialize = "MMBtu/ft2")]
    #[serde(rename = "MMBtu/ft2")]
    MMBtuPerSquareFoot,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Dimension {
    Energy,
    Power,
    EnergyIntensity,
}

impl EnergyUnit {
    fn dimension(&self) -> Dimension {
        match self {
            EnergyUnit::Btu
            | EnergyUnit::KBtu
            | EnergyUnit::MMBtu
            | EnergyUnit::KilowattHours
            | EnergyUnit::Therms => Dimension::Energy,
            EnergyUnit::Kilowatts => Dimension::Power,
            EnergyUnit::KBtuPerSquareFoot | EnergyUnit::MMBtuPerSquareFoot => {
                Dimension::EnergyIntensity
            }
        }
    }

    /// Factor taking one of this unit to the base unit of its dimension
    /// (Btu, kW, kBtu/ft²).
    fn base_factor(&self) -> f64 {
        match self {
            EnergyUnit::Btu => 1.,
            EnergyUnit::KBtu => BTU_PER_KBTU,
            EnergyUnit::MMBtu => BTU_PER_MMBTU,
            EnergyUnit::KilowattHours => BTU_PER_KILOWATT_HOUR,
            EnergyUnit::Therms => BTU_PER_THERM,
            EnergyUnit::Kilowatts => 1.,
            EnergyUnit::KBtuPerSquareFoot => 1.,
            EnergyUnit::MMBtuPerSquareFoot => KBTU_PER_MMBTU_PER_SQUARE_FOOT,
        }
    }
}

#[derive(Debug, Error)]
#[error("no conversion defined from {from} to {to}")]
pub struct UnitConversionError {
    from: EnergyUnit,
    to: EnergyUnit,
}

/// Convert `value` from one unit to another. Identity conversions are exact.
pub fn convert(value: f64, from: EnergyUnit, to: EnergyUnit) -> Result<f64, UnitConversionError> {
    if from == to {
        return Ok(value);
    }
    if from.dimension() != to.dimension() {
        return Err(UnitConversionError { from, to });
    }
    Ok(value * from.base_factor() / to.base_factor())
}
