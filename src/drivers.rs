// src/drivers.rs
//
// =============================================================================
// PULSELAB: DEVICE CAPABILITIES & REGISTRY (v 0.3 )
// =============================================================================
//
// The Hexagonal Port.
//
// Responsibilities:
// 1. Define the three capability sets the runner talks to:
//    `Sensor`, `Synchroniser`, `AuxiliarySource`.
// 2. Map descriptor type tags ("MockCam", "Bridge", ...) to constructors.
// 3. Keep construction free of I/O, so an unknown tag or a bad knob fails
//    before anything on the bench is touched. `connect()` is the first I/O.

use crate::aggregate::Frames;
use crate::core::{ChannelPort, ConfigMap, DeviceSpec, SensorSpec, SynchroniserSpec};
use crate::error::{DeviceError, DeviceResult};
use crate::sequence::SequenceProgram;

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub mod bridge;
pub mod mock;

pub use mock::{MockProbe, ProbeCall, ProbeEvent};

// ============================================================================
// 1. THE CAPABILITY TRAITS (The Contract)
// ============================================================================

/// The readout device. One `acquire()` returns one block of frames.
#[async_trait]
pub trait Sensor: Send {
    async fn connect(&mut self) -> DeviceResult<()>;
    async fn configure(&mut self, config: &ConfigMap) -> DeviceResult<()>;
    /// Prepare to capture the next triggered burst.
    async fn arm(&mut self) -> DeviceResult<()>;
    async fn acquire(&mut self) -> DeviceResult<Frames>;
    /// Must be idempotent and must not fail loudly.
    async fn release(&mut self);
}

/// The timing master. Plays the loaded sequence once per `trigger()`.
#[async_trait]
pub trait Synchroniser: Send {
    async fn connect(&mut self) -> DeviceResult<()>;
    async fn configure(&mut self, config: &ConfigMap) -> DeviceResult<()>;
    async fn set_channel_mapping(&mut self, map: &BTreeMap<String, ChannelPort>)
        -> DeviceResult<()>;
    async fn load_sequence(&mut self, program: &SequenceProgram) -> DeviceResult<()>;
    async fn trigger(&mut self) -> DeviceResult<()>;
    async fn release(&mut self);
}

/// Anything else on the bench that takes a value per channel.
#[async_trait]
pub trait AuxiliarySource: Send {
    /// Channels the device knows without help from the synchroniser mapping.
    /// The first one is the default for parameters that name no channel.
    fn intrinsic_channels(&self) -> Vec<String>;

    async fn connect(&mut self) -> DeviceResult<()>;
    async fn configure(&mut self, channel: &str, parameter: &str, value: f64) -> DeviceResult<()>;
    async fn release(&mut self);
}

// ============================================================================
// 2. THE REGISTRY (The Factory)
// ============================================================================

pub type SensorCtor = Arc<dyn Fn(&SensorSpec) -> DeviceResult<Box<dyn Sensor>> + Send + Sync>;
pub type SynchroniserCtor =
    Arc<dyn Fn(&SynchroniserSpec) -> DeviceResult<Box<dyn Synchroniser>> + Send + Sync>;
pub type SourceCtor =
    Arc<dyn Fn(&str, &DeviceSpec) -> DeviceResult<Box<dyn AuxiliarySource>> + Send + Sync>;

/// Type tag -> constructor, one table per capability.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    sensors: HashMap<String, SensorCtor>,
    synchronisers: HashMap<String, SynchroniserCtor>,
    sources: HashMap<String, SourceCtor>,
}

impl DriverRegistry {
    /// An empty registry. Mostly useful in tests.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Mock and Bridge drivers, mocks reporting into a fresh probe.
    pub fn with_defaults() -> Self {
        Self::with_probe(MockProbe::new())
    }

    /// Mock and Bridge drivers, mocks reporting into `probe`.
    pub fn with_probe(probe: MockProbe) -> Self {
        let mut reg = Self::empty();
        mock::register(&mut reg, probe);
        bridge::register(&mut reg);
        reg
    }

    pub fn register_sensor<F>(&mut self, tag: &str, ctor: F)
    where
        F: Fn(&SensorSpec) -> DeviceResult<Box<dyn Sensor>> + Send + Sync + 'static,
    {
        self.sensors.insert(tag.to_string(), Arc::new(ctor));
    }

    pub fn register_synchroniser<F>(&mut self, tag: &str, ctor: F)
    where
        F: Fn(&SynchroniserSpec) -> DeviceResult<Box<dyn Synchroniser>> + Send + Sync + 'static,
    {
        self.synchronisers.insert(tag.to_string(), Arc::new(ctor));
    }

    pub fn register_source<F>(&mut self, tag: &str, ctor: F)
    where
        F: Fn(&str, &DeviceSpec) -> DeviceResult<Box<dyn AuxiliarySource>> + Send + Sync + 'static,
    {
        self.sources.insert(tag.to_string(), Arc::new(ctor));
    }

    pub fn sensor(&self, spec: &SensorSpec) -> DeviceResult<Box<dyn Sensor>> {
        let ctor = self
            .sensors
            .get(&spec.kind)
            .ok_or_else(|| unknown("sensor", &spec.kind, self.sensors.keys()))?;
        ctor(spec)
    }

    pub fn synchroniser(&self, spec: &SynchroniserSpec) -> DeviceResult<Box<dyn Synchroniser>> {
        let ctor = self
            .synchronisers
            .get(&spec.kind)
            .ok_or_else(|| unknown("synchroniser", &spec.kind, self.synchronisers.keys()))?;
        ctor(spec)
    }

    pub fn source(&self, name: &str, spec: &DeviceSpec) -> DeviceResult<Box<dyn AuxiliarySource>> {
        let ctor = self
            .sources
            .get(&spec.device_type)
            .ok_or_else(|| unknown("device", &spec.device_type, self.sources.keys()))?;
        ctor(name, spec)
    }
}

fn unknown<'a>(what: &str, tag: &str, known: impl Iterator<Item = &'a String>) -> DeviceError {
    let mut known: Vec<&str> = known.map(String::as_str).collect();
    known.sort_unstable();
    DeviceError::Config(format!(
        "unknown {} type '{}' (known: {})",
        what,
        tag,
        known.join(", ")
    ))
}

// ============================================================================
// 3. HELPERS: CONFIG ACCESS
// ============================================================================

/// Small typed accessors over the free-form YAML config maps.
pub mod config {
    use super::*;
    use serde_yaml::Value;

    pub fn usize_of(map: &ConfigMap, key: &str) -> DeviceResult<Option<usize>> {
        match map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_u64()
                .map(|n| Some(n as usize))
                .ok_or_else(|| DeviceError::Config(format!("'{}' must be a non-negative integer", key))),
        }
    }

    pub fn str_of<'a>(map: &'a ConfigMap, key: &str) -> DeviceResult<Option<&'a str>> {
        match map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_str()
                .map(Some)
                .ok_or_else(|| DeviceError::Config(format!("'{}' must be a string", key))),
        }
    }

    pub fn bool_of(map: &ConfigMap, key: &str) -> DeviceResult<Option<bool>> {
        match map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_bool()
                .map(Some)
                .ok_or_else(|| DeviceError::Config(format!("'{}' must be true or false", key))),
        }
    }

    pub fn usize_list_of(map: &ConfigMap, key: &str) -> DeviceResult<Option<Vec<usize>>> {
        let seq = match map.get(key) {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::Sequence(seq)) => seq,
            Some(_) => {
                return Err(DeviceError::Config(format!("'{}' must be a list of integers", key)))
            }
        };
        seq.iter()
            .map(|v| {
                v.as_u64()
                    .map(|n| n as usize)
                    .ok_or_else(|| DeviceError::Config(format!("'{}' must be a list of integers", key)))
            })
            .collect::<DeviceResult<Vec<_>>>()
            .map(Some)
    }

    /// Rejects keys the driver does not understand instead of ignoring typos.
    pub fn reject_unknown(map: &ConfigMap, known: &[&str]) -> DeviceResult<()> {
        for key in map.keys() {
            if !known.contains(&key.as_str()) {
                return Err(DeviceError::Config(format!(
                    "unknown attribute '{}' (accepted: {})",
                    key,
                    known.join(", ")
                )));
            }
        }
        Ok(())
    }
}
