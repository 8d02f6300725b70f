//! Synthetic producer load.
//!
//! [`MeterReading`] is a richer producer-side type that normalizes into an
//! object [`Datum`]; [`ReadingGenerator`] produces a mix of meter readings
//! and stream datum for driving the collector during development.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::datum::{Datum, ObjectDatum, ObjectKind, StreamDatum};

/// Tag added to readings taken while a meter reports a fault.
pub const FAULT_TAG: &str = "fault";

/// Kinds of simulated meters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeterType {
    Grid,
    Solar,
    Battery,
    Load,
}

impl MeterType {
    pub fn all() -> &'static [MeterType] {
        &[
            MeterType::Grid,
            MeterType::Solar,
            MeterType::Battery,
            MeterType::Load,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            MeterType::Grid => "grid",
            MeterType::Solar => "solar",
            MeterType::Battery => "battery",
            MeterType::Load => "load",
        }
    }
}

impl std::fmt::Display for MeterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A single reading from an energy meter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterReading {
    pub node_id: i64,

    /// Meter path, e.g. `/solar/002`
    pub source_id: String,

    pub meter_type: MeterType,
    pub created: DateTime<Utc>,

    /// Instantaneous power in watts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watts: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<f64>,

    /// Lifetime energy counter in watt hours
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watt_hours: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    pub fault: bool,
}

impl MeterReading {
    pub fn new(
        node_id: i64,
        source_id: impl Into<String>,
        meter_type: MeterType,
        created: DateTime<Utc>,
    ) -> Self {
        Self {
            node_id,
            source_id: source_id.into(),
            meter_type,
            created,
            watts: None,
            voltage: None,
            current: None,
            watt_hours: None,
            phase: None,
            fault: false,
        }
    }
}

impl From<MeterReading> for ObjectDatum {
    fn from(reading: MeterReading) -> Self {
        let mut datum = ObjectDatum::new(
            ObjectKind::Node,
            reading.node_id,
            reading.source_id,
            reading.created,
        )
        .with_status("meterType", reading.meter_type.name());

        let instantaneous = [
            ("watts", reading.watts),
            ("voltage", reading.voltage),
            ("current", reading.current),
        ];
        for (name, value) in instantaneous {
            if let Some(value) = value {
                datum = datum.with_instantaneous(name, value);
            }
        }
        if let Some(watt_hours) = reading.watt_hours {
            datum = datum.with_accumulating("wattHours", watt_hours);
        }
        if let Some(phase) = reading.phase {
            datum = datum.with_status("phase", phase);
        }
        if reading.fault {
            datum = datum.with_tag(FAULT_TAG);
        }
        datum
    }
}

impl From<MeterReading> for Datum {
    fn from(reading: MeterReading) -> Self {
        Datum::Object(reading.into())
    }
}

/// Configuration for the reading generator.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Node the simulated meters belong to
    pub node_id: i64,

    /// Number of simulated meters per meter type
    pub meters_per_type: usize,

    /// Number of distinct streams for stream datum
    pub stream_count: usize,

    /// Share (0.0 - 1.0) of generated datum that are stream datum
    pub stream_ratio: f64,

    /// Share (0.0 - 1.0) of meter readings flagged as faulted
    pub fault_rate: f64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            meters_per_type: 3,
            stream_count: 4,
            stream_ratio: 0.2,
            fault_rate: 0.02,
        }
    }
}

/// Generator of synthetic datum.
///
/// Energy counters grow monotonically per meter across calls.
pub struct ReadingGenerator {
    config: GeneratorConfig,
    stream_ids: Vec<Uuid>,
    energy: Mutex<HashMap<String, f64>>,
}

impl ReadingGenerator {
    pub fn new(config: GeneratorConfig) -> Self {
        let stream_ids = (0..config.stream_count.max(1))
            .map(|_| Uuid::new_v4())
            .collect();

        Self {
            config,
            stream_ids,
            energy: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(GeneratorConfig::default())
    }

    /// Generate one datum, either a normalized meter reading or a stream
    /// datum.
    pub fn generate(&self) -> Datum {
        let mut rng = rand::thread_rng();
        if rng.gen_bool(self.config.stream_ratio.clamp(0.0, 1.0)) {
            self.generate_stream().into()
        } else {
            self.generate_reading().into()
        }
    }

    pub fn generate_batch(&self, count: usize) -> Vec<Datum> {
        (0..count).map(|_| self.generate()).collect()
    }

    /// Generate a meter reading for a random meter.
    pub fn generate_reading(&self) -> MeterReading {
        let mut rng = rand::thread_rng();

        let meter_types = MeterType::all();
        let meter_type = meter_types[rng.gen_range(0..meter_types.len())];
        let instance = rng.gen_range(1..=self.config.meters_per_type.max(1));
        let source_id = format!("/{}/{:03}", meter_type.name(), instance);

        let fault = rng.gen_bool(self.config.fault_rate.clamp(0.0, 1.0));
        let watts = if fault {
            0.0
        } else {
            self.generate_watts(&mut rng, meter_type)
        };
        let voltage = rng.gen_range(228.0..252.0);

        let mut reading = MeterReading::new(self.config.node_id, source_id, meter_type, Utc::now());
        reading.watts = Some(watts);
        reading.voltage = Some(voltage);
        reading.current = Some(watts.abs() / voltage);
        reading.watt_hours = Some(self.accumulate(&reading.source_id, watts));
        reading.phase = Some(["a", "b", "c"][rng.gen_range(0..3)].to_string());
        reading.fault = fault;
        reading
    }

    /// Generate a stream datum for one of the configured streams.
    pub fn generate_stream(&self) -> StreamDatum {
        let mut rng = rand::thread_rng();
        let stream_id = self.stream_ids[rng.gen_range(0..self.stream_ids.len())];

        StreamDatum::new(stream_id, Utc::now())
            .with_instantaneous(vec![rng.gen_range(-40.0..60.0), rng.gen_range(0.0..100.0)])
            .with_accumulating(vec![self.accumulate(&stream_id.to_string(), 1.0)])
    }

    fn generate_watts(&self, rng: &mut impl Rng, meter_type: MeterType) -> f64 {
        match meter_type {
            MeterType::Grid => rng.gen_range(-3000.0..6000.0),
            MeterType::Solar => rng.gen_range(0.0..5000.0),
            MeterType::Battery => rng.gen_range(-2500.0..2500.0),
            MeterType::Load => rng.gen_range(50.0..4000.0),
        }
    }

    /// Add one interval's energy for `source` and return the new total.
    fn accumulate(&self, source: &str, watts: f64) -> f64 {
        let mut energy = self
            .energy
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let total = energy.entry(source.to_string()).or_insert(0.0);
        *total += watts.abs() / 3600.0;
        *total
    }
}

impl Default for ReadingGenerator {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datum::DatumKey;

    #[test]
    fn test_reading_normalizes_to_object_datum() {
        let created = Utc::now();
        let mut reading = MeterReading::new(7, "/solar/001", MeterType::Solar, created);
        reading.watts = Some(1500.0);
        reading.watt_hours = Some(12.5);
        reading.phase = Some("b".to_string());
        reading.fault = true;

        let datum: ObjectDatum = reading.into();
        assert_eq!(datum.kind, ObjectKind::Node);
        assert_eq!(datum.object_id, 7);
        assert_eq!(datum.source_id, "/solar/001");
        assert_eq!(datum.samples.instantaneous.get("watts"), Some(&1500.0));
        assert!(!datum.samples.instantaneous.contains_key("voltage"));
        assert_eq!(datum.samples.accumulating.get("wattHours"), Some(&12.5));
        assert_eq!(datum.samples.status.get("phase").map(String::as_str), Some("b"));
        assert_eq!(
            datum.samples.status.get("meterType").map(String::as_str),
            Some("solar")
        );
        assert!(datum.tags.contains(FAULT_TAG));
    }

    #[test]
    fn test_reading_key_matches_source() {
        let created = Utc::now();
        let datum: Datum = MeterReading::new(2, "/grid/001", MeterType::Grid, created).into();

        assert_eq!(
            datum.key(),
            DatumKey::Object {
                kind: ObjectKind::Node,
                object_id: 2,
                source_id: "/grid/001".to_string(),
                timestamp: created,
            }
        );
    }

    #[test]
    fn test_generator_default_config() {
        let config = GeneratorConfig::default();

        assert_eq!(config.node_id, 1);
        assert_eq!(config.meters_per_type, 3);
        assert_eq!(config.stream_count, 4);
        assert!((config.fault_rate - 0.02).abs() < f64::EPSILON);
    }

    #[test]
    fn test_generated_reading_source_format() {
        let generator = ReadingGenerator::with_defaults();
        let reading = generator.generate_reading();

        let parts: Vec<&str> = reading.source_id.trim_start_matches('/').split('/').collect();
        assert_eq!(parts.len(), 2);
        assert!(MeterType::all().iter().any(|t| t.name() == parts[0]));
        assert_eq!(parts[1].len(), 3);
        assert!(parts[1].chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_energy_counter_is_monotonic() {
        let generator = ReadingGenerator::new(GeneratorConfig {
            meters_per_type: 1,
            fault_rate: 0.0,
            ..GeneratorConfig::default()
        });

        let mut last: HashMap<String, f64> = HashMap::new();
        for _ in 0..40 {
            let reading = generator.generate_reading();
            let total = reading.watt_hours.unwrap();
            if let Some(previous) = last.insert(reading.source_id.clone(), total) {
                assert!(total >= previous);
            }
        }
    }

    #[test]
    fn test_stream_ratio_extremes() {
        let streams_only = ReadingGenerator::new(GeneratorConfig {
            stream_ratio: 1.0,
            ..GeneratorConfig::default()
        });
        assert!(streams_only
            .generate_batch(20)
            .iter()
            .all(|d| matches!(d, Datum::Stream(_))));

        let readings_only = ReadingGenerator::new(GeneratorConfig {
            stream_ratio: 0.0,
            ..GeneratorConfig::default()
        });
        assert!(readings_only
            .generate_batch(20)
            .iter()
            .all(|d| matches!(d, Datum::Object(_))));
    }

    #[test]
    fn test_generated_datum_round_trips_wire_format() {
        let generator = ReadingGenerator::with_defaults();
        for datum in generator.generate_batch(10) {
            let decoded = Datum::from_json(&datum.to_json().unwrap()).unwrap();
            assert_eq!(decoded.key(), datum.key());
        }
    }
}
