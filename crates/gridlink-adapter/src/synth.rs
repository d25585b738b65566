//! ---
//! ems_section: "03-device-adapters"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Synthetic readings for mock-mode devices."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Mock device synthesis.
//!
//! Mock-mode adapters never touch a register link; they sample plausible
//! values straight from the model schema. Numeric points follow a slow
//! sine swing across their declared range with Gaussian jitter on top, so
//! dashboards fed from a bench setup look alive rather than flat.

use std::collections::BTreeMap;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::model::{DataBlock, ModelDef, PointKind, PointValue};

const SWING_PERIOD_SECS: f64 = 300.0;

/// Synthetic register-free device.
pub struct MockDevice {
    rng: StdRng,
    start: Instant,
    serial: String,
}

impl MockDevice {
    /// Create a synthesizer seeded from the device id, so repeated runs of
    /// the same fleet produce comparable traces.
    pub fn new(device_id: u32) -> Self {
        Self {
            rng: StdRng::seed_from_u64(0x6772_6964 ^ device_id as u64),
            start: Instant::now(),
            serial: format!("GL-{device_id:08}"),
        }
    }

    /// Sample one full block for `model`.
    pub fn sample_block(&mut self, model: &'static ModelDef) -> DataBlock {
        let phase = self.start.elapsed().as_secs_f64() / SWING_PERIOD_SECS;
        let swing = (phase * std::f64::consts::TAU).sin() * 0.5 + 0.5;

        let mut points = BTreeMap::new();
        for def in model.points {
            let value = match def.kind {
                PointKind::Text { .. } => Some(PointValue::Text(self.text_for(def.id))),
                PointKind::Enum16 => def.synth_range.map(|(lo, hi)| {
                    PointValue::Enum(self.rng.gen_range(lo as u16..=hi as u16))
                }),
                PointKind::Bitfield32 => Some(PointValue::Bitfield(0)),
                _ => def.synth_range.map(|range| {
                    let sampled = self.numeric_sample(range, swing);
                    if def.scale == 0 {
                        PointValue::Integer(sampled.round() as i64)
                    } else {
                        PointValue::Decimal(quantize(sampled, def.scale))
                    }
                }),
            };
            if let Some(value) = value {
                points.insert(def.id, value);
            }
        }
        DataBlock {
            model_id: model.id,
            model_key: model.key,
            points,
        }
    }

    fn numeric_sample(&mut self, (lo, hi): (f64, f64), swing: f64) -> f64 {
        if hi <= lo {
            return lo;
        }
        let span = hi - lo;
        let baseline = lo + span * swing;
        let noise = Normal::new(0.0, span * 0.02)
            .map(|dist| dist.sample(&mut self.rng))
            .unwrap_or(0.0);
        (baseline + noise).clamp(lo, hi)
    }

    fn text_for(&self, point_id: &str) -> String {
        match point_id {
            "Mn" => "GridLink".to_owned(),
            "Md" => "BenchSim".to_owned(),
            "Opt" => "mock".to_owned(),
            "Vr" => "0.1.0".to_owned(),
            "SN" => self.serial.clone(),
            other => other.to_owned(),
        }
    }
}

/// Round to the resolution implied by the scale factor, so a scale of -1
/// yields one decimal place like a real register read would.
fn quantize(value: f64, scale: i8) -> f64 {
    let step = 10f64.powi(scale as i32);
    (value / step).round() * step
}
