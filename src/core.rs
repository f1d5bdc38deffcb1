// src/core.rs
//
// =============================================================================
// PULSELAB: JOB DESCRIPTOR SCHEMA (v 0.3 )
// =============================================================================
//
// The contract between whoever drops a YAML file in the inbox and the runner.
//
// Design Principles:
// 1. Parse, don't validate twice: a `JobDescriptor` that exists is well-formed.
// 2. Structural problems (missing keys, zero steps) are ParseErrors.
//    Semantic problems that need driver knowledge (channels, types, ranges)
//    are ConfigErrors and are raised by the runner's planning pass.
// 3. The original document is kept verbatim for the result metadata.

use crate::error::JobError;
use crate::sweep::{Interpolation, Sweep, SweepRange};

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Free-form driver configuration (`sensor.config`, `synchroniser.config`).
pub type ConfigMap = BTreeMap<String, Value>;

// ============================================================================
// 1. DEVICE SPECS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub config: ConfigMap,
}

/// Physical port a logical channel name maps to on the synchroniser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelPort {
    Index(i64),
    Name(String),
}

impl fmt::Display for ChannelPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelPort::Index(i) => write!(f, "{}", i),
            ChannelPort::Name(n) => f.write_str(n),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynchroniserSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub config: ConfigMap,
    #[serde(default, deserialize_with = "null_as_default")]
    pub channel_mapping: BTreeMap<String, ChannelPort>,
}

/// One auxiliary source (signal generator, power supply, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub address: String,
    pub device_type: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub config: BTreeMap<String, ParamSetting>,
}

/// A parameter as written in the descriptor.
///
/// Either a bare number (static, default channel) or a table with exactly one
/// of `value`, `start`/`stop`, `values`, plus an optional `channel`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamSetting {
    Scalar(f64),
    Detailed(ParamDetail),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParamDetail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpolation: Option<Interpolation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

/// Static value or per-step schedule.
#[derive(Debug, Clone, PartialEq)]
pub enum Schedule {
    Fixed(f64),
    Dynamic(Sweep),
}

/// A parameter after range checking. Channel is still the raw name;
/// the runner resolves it against the synchroniser and driver.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedParam {
    pub parameter: String,
    pub channel: Option<String>,
    pub schedule: Schedule,
}

impl ParamSetting {
    pub fn channel(&self) -> Option<&str> {
        match self {
            ParamSetting::Scalar(_) => None,
            ParamSetting::Detailed(d) => d.channel.as_deref(),
        }
    }

    pub fn is_dynamic(&self) -> bool {
        match self {
            ParamSetting::Scalar(_) => false,
            ParamSetting::Detailed(d) => d.start.is_some() || d.stop.is_some() || d.values.is_some(),
        }
    }

    /// Turns the written form into a schedule for `steps` dynamic steps.
    fn resolve(&self, parameter: &str, steps: usize) -> Result<Schedule, String> {
        let d = match self {
            ParamSetting::Scalar(v) => return finite(parameter, *v).map(Schedule::Fixed),
            ParamSetting::Detailed(d) => d,
        };

        match (d.value, d.start, d.stop, &d.values) {
            (Some(v), None, None, None) => {
                if d.interpolation.is_some() {
                    return Err(format!("'{}': interpolation given for a fixed value", parameter));
                }
                finite(parameter, v).map(Schedule::Fixed)
            }
            (None, Some(start), Some(stop), None) => {
                let range = SweepRange::linear(start, stop, steps)
                    .with_rule(d.interpolation.unwrap_or_default());
                range
                    .validate()
                    .map_err(|e| format!("'{}': {}", parameter, e))?;
                Ok(Schedule::Dynamic(Sweep::Range(range)))
            }
            (None, None, None, Some(values)) => {
                if values.len() != steps {
                    return Err(format!(
                        "'{}': {} explicit values for {} dynamic steps",
                        parameter,
                        values.len(),
                        steps
                    ));
                }
                for v in values {
                    finite(parameter, *v)?;
                }
                Ok(Schedule::Dynamic(Sweep::List(values.clone())))
            }
            (None, Some(_), None, None) | (None, None, Some(_), None) => Err(format!(
                "'{}': a range needs both start and stop",
                parameter
            )),
            _ => Err(format!(
                "'{}': give exactly one of value, start/stop or values",
                parameter
            )),
        }
    }
}

fn finite(parameter: &str, v: f64) -> Result<f64, String> {
    if v.is_finite() {
        Ok(v)
    } else {
        Err(format!("'{}': value {} is not finite", parameter, v))
    }
}

impl DeviceSpec {
    /// Range-checks every parameter.
    /// Static devices may not sweep: that would silently drop the sweep.
    pub fn resolve_params(
        &self,
        name: &str,
        steps: usize,
        allow_dynamic: bool,
    ) -> Result<Vec<ResolvedParam>, JobError> {
        let mut out = Vec::with_capacity(self.config.len());
        for (parameter, setting) in &self.config {
            if !allow_dynamic && setting.is_dynamic() {
                return Err(JobError::config(
                    name,
                    format!("static device has a swept parameter '{}'", parameter),
                ));
            }
            let schedule = setting
                .resolve(parameter, steps)
                .map_err(|reason| JobError::config(name, reason))?;
            out.push(ResolvedParam {
                parameter: parameter.clone(),
                channel: setting.channel().map(str::to_string),
                schedule,
            });
        }
        Ok(out)
    }
}

// ============================================================================
// 2. DATA SPEC
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AveragingMode {
    /// Mean over averages only; every frame is kept.
    Spread,
    /// Everything for a step summed into one value per channel group.
    Sum,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSpec {
    pub averaging_mode: AveragingMode,
    pub dynamic_steps: usize,
    #[serde(default)]
    pub compress: bool,
    #[serde(default)]
    pub reference_channels: usize,
    #[serde(default)]
    pub live_compression: bool,
}

// ============================================================================
// 3. SEQUENCE REFERENCE
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceRef {
    pub path: PathBuf,
    #[serde(default, deserialize_with = "null_as_default")]
    pub params: ConfigMap,
}

// ============================================================================
// 4. THE DESCRIPTOR
// ============================================================================

/// The on-disk shape, with the aliases older instruction files use.
#[derive(Deserialize)]
struct RawDescriptor {
    #[serde(default)]
    experiment_type: Option<String>,
    #[serde(default)]
    averages: Option<usize>,
    #[serde(default)]
    dynamic_steps: Option<usize>,
    sensor: SensorSpec,
    synchroniser: SynchroniserSpec,
    #[serde(default, deserialize_with = "null_as_default")]
    dynamic_devices: BTreeMap<String, DeviceSpec>,
    #[serde(default, deserialize_with = "null_as_default")]
    static_devices: BTreeMap<String, DeviceSpec>,
    data: RawDataSpec,
    #[serde(default)]
    sequence: Option<SequenceRef>,
    #[serde(default)]
    ps_path: Option<PathBuf>,
    #[serde(default)]
    pulse_sequence: Option<ConfigMap>,
    #[serde(default)]
    acquisition_timeout_ms: Option<u64>,
    #[serde(default)]
    sleep: Option<f64>,
}

#[derive(Deserialize)]
struct RawDataSpec {
    averaging_mode: AveragingMode,
    #[serde(default)]
    dynamic_steps: Option<usize>,
    #[serde(default)]
    compress: bool,
    #[serde(default)]
    reference_channels: usize,
    #[serde(default)]
    live_compression: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobDescriptor {
    pub id: Uuid,
    pub source: Option<PathBuf>,
    pub experiment_type: String,
    pub averages: usize,
    pub sensor: SensorSpec,
    pub synchroniser: SynchroniserSpec,
    pub dynamic_devices: BTreeMap<String, DeviceSpec>,
    pub static_devices: BTreeMap<String, DeviceSpec>,
    pub data: DataSpec,
    pub sequence: Option<SequenceRef>,
    pub acquisition_timeout_ms: Option<u64>,
    /// Pause before each average.
    pub sleep: Option<Duration>,
    /// The document as submitted.
    pub document: Value,
}

impl JobDescriptor {
    pub fn from_yaml_str(text: &str, source: Option<&Path>) -> Result<Self, JobError> {
        let path = source.map(Path::to_path_buf).unwrap_or_default();
        let parse_err = |reason: String| JobError::Parse {
            path: path.clone(),
            reason,
        };

        let document: Value = serde_yaml::from_str(text).map_err(|e| parse_err(e.to_string()))?;
        if !document.is_mapping() {
            return Err(parse_err("descriptor must be a key/value document".into()));
        }
        let raw: RawDescriptor =
            serde_yaml::from_value(document.clone()).map_err(|e| parse_err(e.to_string()))?;

        let dynamic_steps = raw
            .data
            .dynamic_steps
            .or(raw.dynamic_steps)
            .ok_or_else(|| parse_err("missing field `dynamic_steps`".into()))?;
        if dynamic_steps == 0 {
            return Err(parse_err("dynamic_steps must be at least 1".into()));
        }

        let averages = raw.averages.unwrap_or(1);
        if averages == 0 {
            return Err(parse_err("averages must be at least 1".into()));
        }

        // NaN, negatives and anything past Duration::MAX all fail here.
        let sleep = match raw.sleep {
            Some(s) => Some(Duration::try_from_secs_f64(s).map_err(|_| {
                parse_err(format!("sleep must be a non-negative number of seconds, got {}", s))
            })?),
            None => None,
        };

        // Prefer the structured form; fall back to the flat legacy keys.
        let sequence = match (raw.sequence, raw.ps_path) {
            (Some(seq), _) => Some(seq),
            (None, Some(path)) => Some(SequenceRef {
                path,
                params: raw.pulse_sequence.unwrap_or_default(),
            }),
            (None, None) => None,
        };

        Ok(Self {
            id: Uuid::new_v4(),
            source: source.map(Path::to_path_buf),
            experiment_type: raw.experiment_type.unwrap_or_else(|| "measurement".into()),
            averages,
            sensor: raw.sensor,
            synchroniser: raw.synchroniser,
            dynamic_devices: raw.dynamic_devices,
            static_devices: raw.static_devices,
            data: DataSpec {
                averaging_mode: raw.data.averaging_mode,
                dynamic_steps,
                compress: raw.data.compress,
                reference_channels: raw.data.reference_channels,
                live_compression: raw.data.live_compression,
            },
            sequence,
            acquisition_timeout_ms: raw.acquisition_timeout_ms,
            sleep,
            document,
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, JobError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| JobError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_yaml_str(&text, Some(path))
    }

    pub fn short_id(&self) -> String {
        self.id.to_string().chars().take(8).collect()
    }

    pub fn dynamic_steps(&self) -> usize {
        self.data.dynamic_steps
    }
}

/// `key:` with no value in YAML is `null`; treat it like an absent key.
fn null_as_default<'de, D, T>(de: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(de)?.unwrap_or_default())
}
