//! ---
//! ems_section: "03-device-adapters"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "SunSpec device adapters and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! SunSpec model schema tables.
//!
//! Every point is declared with an explicit wire representation so reading
//! and synthesizing values is exhaustively checked by the compiler. The
//! logical value of a numeric point is `raw * 10^scale`.

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

use crate::{AdapterError, Result};

/// Wire representation of a point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointKind {
    /// Signed 16-bit register.
    Int16,
    /// Unsigned 16-bit register.
    Uint16,
    /// Signed 32-bit value, two registers, high word first.
    Int32,
    /// Unsigned 32-bit value, two registers, high word first.
    Uint32,
    /// Enumerated 16-bit code with model-specific meaning.
    Enum16,
    /// 32-bit flag field.
    Bitfield32,
    /// Fixed-width string, two bytes per register, NUL/space padded.
    Text {
        /// Width in registers.
        words: u16,
    },
}

impl PointKind {
    /// Number of holding registers the point occupies.
    pub fn register_count(self) -> u16 {
        match self {
            PointKind::Int16 | PointKind::Uint16 | PointKind::Enum16 => 1,
            PointKind::Int32 | PointKind::Uint32 | PointKind::Bitfield32 => 2,
            PointKind::Text { words } => words,
        }
    }
}

/// Schema entry for one point of a model.
#[derive(Debug, Clone, Copy)]
pub struct PointDef {
    /// SunSpec point identifier, used as the JSON key in telemetry.
    pub id: &'static str,
    /// Human-readable label.
    pub label: &'static str,
    /// Wire representation.
    pub kind: PointKind,
    /// Signed power-of-ten scale factor.
    pub scale: i8,
    /// Engineering unit, when one applies.
    pub unit: Option<&'static str>,
    /// Whether a valid block must carry this point.
    pub mandatory: bool,
    /// Plausible physical range for mock synthesis, in scaled units.
    pub synth_range: Option<(f64, f64)>,
}

impl PointDef {
    /// Decode this point from its register window.
    ///
    /// Returns `Ok(None)` when the device reports the not-implemented
    /// sentinel; [`DataBlock::ensure_mandatory`] turns a missing mandatory
    /// point into an error with model context.
    pub fn decode(&self, regs: &[u16]) -> Result<Option<PointValue>> {
        let needed = self.kind.register_count() as usize;
        if regs.len() < needed {
            return Err(AdapterError::Protocol(format!(
                "point {} needs {} registers, got {}",
                self.id,
                needed,
                regs.len()
            )));
        }
        let value = match self.kind {
            PointKind::Int16 => {
                let raw = regs[0] as i16;
                if raw == i16::MIN {
                    return Ok(None);
                }
                self.numeric(raw as f64)
            }
            PointKind::Uint16 => {
                let raw = regs[0];
                if raw == u16::MAX {
                    return Ok(None);
                }
                self.numeric(raw as f64)
            }
            PointKind::Int32 => {
                let raw = (((regs[0] as u32) << 16) | regs[1] as u32) as i32;
                if raw == i32::MIN {
                    return Ok(None);
                }
                self.numeric(raw as f64)
            }
            PointKind::Uint32 => {
                let raw = ((regs[0] as u32) << 16) | regs[1] as u32;
                if raw == u32::MAX {
                    return Ok(None);
                }
                self.numeric(raw as f64)
            }
            PointKind::Enum16 => {
                let raw = regs[0];
                if raw == u16::MAX {
                    return Ok(None);
                }
                PointValue::Enum(raw)
            }
            PointKind::Bitfield32 => {
                let raw = ((regs[0] as u32) << 16) | regs[1] as u32;
                if raw == u32::MAX {
                    return Ok(None);
                }
                PointValue::Bitfield(raw)
            }
            PointKind::Text { words } => {
                let mut bytes = Vec::with_capacity(words as usize * 2);
                for reg in &regs[..words as usize] {
                    bytes.push((reg >> 8) as u8);
                    bytes.push((reg & 0xff) as u8);
                }
                let text = String::from_utf8_lossy(&bytes)
                    .trim_matches(|c| c == '\0' || c == ' ')
                    .to_owned();
                if text.is_empty() {
                    return Ok(None);
                }
                PointValue::Text(text)
            }
        };
        Ok(Some(value))
    }

    fn numeric(&self, raw: f64) -> PointValue {
        if self.scale == 0 {
            PointValue::Integer(raw as i64)
        } else {
            PointValue::Decimal(raw * 10f64.powi(self.scale as i32))
        }
    }
}

/// Typed value of one point.
#[derive(Debug, Clone, PartialEq)]
pub enum PointValue {
    /// Unscaled integer.
    Integer(i64),
    /// Scaled decimal.
    Decimal(f64),
    /// Trimmed string.
    Text(String),
    /// Enumeration code.
    Enum(u16),
    /// Flag field.
    Bitfield(u32),
}

impl PointValue {
    /// Convert to the JSON representation used on the bus.
    pub fn to_json(&self) -> JsonValue {
        match self {
            PointValue::Integer(v) => JsonValue::from(*v),
            PointValue::Decimal(v) => JsonValue::from(*v),
            PointValue::Text(v) => JsonValue::from(v.clone()),
            PointValue::Enum(v) => JsonValue::from(*v),
            PointValue::Bitfield(v) => JsonValue::from(*v),
        }
    }
}

/// One SunSpec model: a protocol-defined grouping of related points.
#[derive(Debug)]
pub struct ModelDef {
    /// SunSpec model identifier.
    pub id: u16,
    /// Short key used in telemetry readings maps.
    pub key: &'static str,
    /// Human-readable label.
    pub label: &'static str,
    /// Point layout, in register order.
    pub points: &'static [PointDef],
}

impl ModelDef {
    /// Total register footprint of the model's data section.
    pub fn register_count(&self) -> u16 {
        self.points.iter().map(|p| p.kind.register_count()).sum()
    }
}

const fn point(
    id: &'static str,
    label: &'static str,
    kind: PointKind,
    scale: i8,
    unit: Option<&'static str>,
    mandatory: bool,
    synth_range: Option<(f64, f64)>,
) -> PointDef {
    PointDef {
        id,
        label,
        kind,
        scale,
        unit,
        mandatory,
        synth_range,
    }
}

/// Model 1: common identification block.
pub static COMMON: ModelDef = ModelDef {
    id: 1,
    key: "common",
    label: "Common identification",
    points: &[
        point("Mn", "Manufacturer", PointKind::Text { words: 16 }, 0, None, true, None),
        point("Md", "Model", PointKind::Text { words: 16 }, 0, None, true, None),
        point("Opt", "Options", PointKind::Text { words: 8 }, 0, None, false, None),
        point("Vr", "Version", PointKind::Text { words: 8 }, 0, None, false, None),
        point("SN", "Serial number", PointKind::Text { words: 16 }, 0, None, true, None),
        point("DA", "Device address", PointKind::Uint16, 0, None, false, Some((1.0, 247.0))),
    ],
};

/// Model 103: three-phase inverter.
pub static INVERTER_3PH: ModelDef = ModelDef {
    id: 103,
    key: "inverter",
    label: "Three-phase inverter",
    points: &[
        point("A", "AC current", PointKind::Uint16, -1, Some("A"), true, Some((0.0, 120.0))),
        point("AphA", "Phase A current", PointKind::Uint16, -1, Some("A"), false, Some((0.0, 40.0))),
        point("PhVphA", "Phase A voltage", PointKind::Uint16, -1, Some("V"), true, Some((220.0, 245.0))),
        point("W", "AC power", PointKind::Int16, 1, Some("W"), true, Some((0.0, 50_000.0))),
        point("Hz", "Line frequency", PointKind::Uint16, -2, Some("Hz"), true, Some((49.8, 50.2))),
        point("PF", "Power factor", PointKind::Int16, -2, Some("Pct"), false, Some((90.0, 100.0))),
        point("WH", "Energy yield", PointKind::Uint32, 0, Some("Wh"), true, Some((0.0, 500_000_000.0))),
        point("DCA", "DC current", PointKind::Uint16, -1, Some("A"), false, Some((0.0, 80.0))),
        point("DCV", "DC voltage", PointKind::Uint16, -1, Some("V"), false, Some((300.0, 800.0))),
        point("DCW", "DC power", PointKind::Int16, 1, Some("W"), false, Some((0.0, 52_000.0))),
        point("TmpCab", "Cabinet temperature", PointKind::Int16, -1, Some("C"), true, Some((15.0, 70.0))),
        point("St", "Operating state", PointKind::Enum16, 0, None, true, Some((1.0, 8.0))),
        point("Evt1", "Event flags", PointKind::Bitfield32, 0, None, true, Some((0.0, 0.0))),
    ],
};

/// Model 203: wye-connect three-phase meter.
pub static METER_WYE: ModelDef = ModelDef {
    id: 203,
    key: "meter",
    label: "Wye-connect meter",
    points: &[
        point("A", "Total AC current", PointKind::Int16, -1, Some("A"), true, Some((0.0, 200.0))),
        point("PhVphA", "Phase A voltage", PointKind::Int16, -1, Some("V"), true, Some((220.0, 245.0))),
        point("Hz", "Line frequency", PointKind::Int16, -2, Some("Hz"), true, Some((49.8, 50.2))),
        point("W", "Total real power", PointKind::Int16, 1, Some("W"), true, Some((-30_000.0, 30_000.0))),
        point("VA", "Apparent power", PointKind::Int16, 1, Some("VA"), false, Some((0.0, 32_000.0))),
        point("PF", "Power factor", PointKind::Int16, -2, Some("Pct"), false, Some((85.0, 100.0))),
        point("TotWhExp", "Energy exported", PointKind::Uint32, 0, Some("Wh"), true, Some((0.0, 900_000_000.0))),
        point("TotWhImp", "Energy imported", PointKind::Uint32, 0, Some("Wh"), true, Some((0.0, 900_000_000.0))),
        point("Evt", "Event flags", PointKind::Bitfield32, 0, None, true, Some((0.0, 0.0))),
    ],
};

/// Model 802: battery bank.
pub static BATTERY: ModelDef = ModelDef {
    id: 802,
    key: "battery",
    label: "Battery bank",
    points: &[
        point("SoC", "State of charge", PointKind::Uint16, 0, Some("%"), true, Some((5.0, 100.0))),
        point("SoH", "State of health", PointKind::Uint16, 0, Some("%"), false, Some((80.0, 100.0))),
        point("V", "Bank voltage", PointKind::Uint16, -1, Some("V"), true, Some((44.0, 58.0))),
        point("A", "Bank current", PointKind::Int16, -1, Some("A"), true, Some((-120.0, 120.0))),
        point("W", "Bank power", PointKind::Int16, 0, Some("W"), true, Some((-6_000.0, 6_000.0))),
        point("CellVMax", "Max cell voltage", PointKind::Uint16, -3, Some("V"), false, Some((3.0, 4.2))),
        point("CellVMin", "Min cell voltage", PointKind::Uint16, -3, Some("V"), false, Some((2.8, 4.0))),
        point("St", "Operating state", PointKind::Enum16, 0, None, true, Some((1.0, 6.0))),
        point("Evt1", "Event flags", PointKind::Bitfield32, 0, None, true, Some((0.0, 0.0))),
    ],
};

/// All models shipped with this adapter.
pub static MODELS: &[&ModelDef] = &[&COMMON, &INVERTER_3PH, &METER_WYE, &BATTERY];

/// Look up a model definition by SunSpec id.
pub fn model_by_id(id: u16) -> Option<&'static ModelDef> {
    MODELS.iter().find(|model| model.id == id).copied()
}

/// One model's points for one device at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct DataBlock {
    /// SunSpec model id.
    pub model_id: u16,
    /// Model key used in the telemetry readings map.
    pub model_key: &'static str,
    /// Point values present in this snapshot.
    pub points: BTreeMap<&'static str, PointValue>,
}

impl DataBlock {
    /// Decode a full model data section from its registers.
    pub fn decode(model: &'static ModelDef, regs: &[u16]) -> Result<Self> {
        let expected = model.register_count() as usize;
        if regs.len() < expected {
            return Err(AdapterError::Protocol(format!(
                "model {} needs {} registers, got {}",
                model.id,
                expected,
                regs.len()
            )));
        }
        let mut points = BTreeMap::new();
        let mut cursor = 0usize;
        for def in model.points {
            let width = def.kind.register_count() as usize;
            if let Some(value) = def.decode(&regs[cursor..cursor + width])? {
                points.insert(def.id, value);
            }
            cursor += width;
        }
        let block = Self {
            model_id: model.id,
            model_key: model.key,
            points,
        };
        block.ensure_mandatory(model)?;
        Ok(block)
    }

    /// Verify that every mandatory point of `model` is present.
    pub fn ensure_mandatory(&self, model: &ModelDef) -> Result<()> {
        for def in model.points {
            if def.mandatory && !self.points.contains_key(def.id) {
                return Err(AdapterError::MissingPoint {
                    model: model.id,
                    point: def.id,
                });
            }
        }
        Ok(())
    }

    /// JSON object mapping point ids to values.
    pub fn to_json(&self) -> JsonValue {
        let mut map = serde_json::Map::new();
        for (id, value) in &self.points {
            map.insert((*id).to_owned(), value.to_json());
        }
        JsonValue::Object(map)
    }
}
