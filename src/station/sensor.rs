//! Material/weight sensor input.
//!
//! Real stations sit on a scale with a material classifier. The simulated
//! sensor stands in for that hardware on development machines.

use crate::ledger::Material;
use crate::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// One detection from the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub material: Material,
    /// Kilograms.
    pub weight: f64,
}

pub trait MaterialSensor: Send {
    fn name(&self) -> &str;

    fn sample(&mut self) -> Result<SensorReading>;
}

/// Random material, weight between 0.1 and 5.0 kg in 0.1 kg steps.
pub struct SimulatedSensor {
    rng: StdRng,
}

impl SimulatedSensor {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic sequence, for tests and demos.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        Self::new()
    }
}

impl MaterialSensor for SimulatedSensor {
    fn name(&self) -> &str {
        "simulated"
    }

    fn sample(&mut self) -> Result<SensorReading> {
        let material = Material::ALL[self.rng.gen_range(0..Material::ALL.len())];
        let tenths: u32 = self.rng.gen_range(1..=50);
        Ok(SensorReading {
            material,
            weight: f64::from(tenths) / 10.0,
        })
    }
}

/// Always reports the same reading.
#[derive(Debug, Clone, Copy)]
pub struct FixedSensor(pub SensorReading);

impl MaterialSensor for FixedSensor {
    fn name(&self) -> &str {
        "fixed"
    }

    fn sample(&mut self) -> Result<SensorReading> {
        Ok(self.0)
    }
}
