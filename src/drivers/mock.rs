// src/drivers/mock.rs
//
// =============================================================================
// PULSELAB: MOCK DEVICES (v 0.3 )
// =============================================================================
//
// Bench-free stand-ins for every capability.
//
// - Same contract as real drivers, synthetic data.
// - Every call is written to a shared `MockProbe`, so tests can assert on
//   ordering and on who got released.
// - Fault knobs (read at construction, before any I/O):
//     sensor:        fail_connect, fail_on_acquisition: n, stall_on_acquisition: n,
//                    stall_on_arm: n, panic_on_acquisition: n
//     synchroniser:  fail_connect, fail_on_trigger: n, stall_on_configure,
//                    stall_on_release
//     source:        address containing "unreachable"
//   `n` counts calls of that kind from 0 across the whole job. A stalled
//   call never returns.

use crate::aggregate::Frames;
use crate::core::{ChannelPort, ConfigMap, DeviceSpec, SensorSpec, SynchroniserSpec};
use crate::drivers::config::{bool_of, reject_unknown, str_of, usize_list_of, usize_of};
use crate::drivers::{AuxiliarySource, DriverRegistry, Sensor, Synchroniser};
use crate::error::{DeviceError, DeviceResult};
use crate::sequence::SequenceProgram;

use async_trait::async_trait;
use rand::thread_rng;
use rand_distr::{Distribution, Poisson};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

pub const MOCK_SENSOR: &str = "MockCam";
pub const MOCK_SYNCHRONISER: &str = "MockSynchroniser";
pub const MOCK_SOURCE: &str = "Mock";

/// Mean photon count of the synthetic shot noise.
const MOCK_COUNTS: f64 = 15_000.0;

pub(crate) fn register(reg: &mut DriverRegistry, probe: MockProbe) {
    let p = probe.clone();
    reg.register_sensor(MOCK_SENSOR, move |spec| {
        Ok(Box::new(MockCam::new(spec, p.clone())?) as Box<dyn Sensor>)
    });
    let p = probe.clone();
    reg.register_synchroniser(MOCK_SYNCHRONISER, move |spec| {
        Ok(Box::new(MockSynchroniser::new(spec, p.clone())?) as Box<dyn Synchroniser>)
    });
    reg.register_source(MOCK_SOURCE, move |name, spec| {
        Ok(Box::new(MockSignalSource::new(name, spec, probe.clone())) as Box<dyn AuxiliarySource>)
    });
}

// ============================================================================
// 1. THE PROBE
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeCall {
    Connect,
    Configure,
    SetChannelMapping(usize),
    LoadSequence(String),
    Trigger,
    Arm,
    Acquire,
    SetValue {
        channel: String,
        parameter: String,
        value: f64,
    },
    Release,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeEvent {
    pub device: String,
    pub call: ProbeCall,
}

/// Shared call log. Cheap to clone; all clones see the same events.
#[derive(Debug, Clone, Default)]
pub struct MockProbe {
    events: Arc<Mutex<Vec<ProbeEvent>>>,
}

impl MockProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, device: &str, call: ProbeCall) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.push(ProbeEvent {
            device: device.to_string(),
            call,
        });
    }

    pub fn events(&self) -> Vec<ProbeEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn calls_for(&self, device: &str) -> Vec<ProbeCall> {
        self.events()
            .into_iter()
            .filter(|e| e.device == device)
            .map(|e| e.call)
            .collect()
    }

    pub fn count(&self, device: &str, call: &ProbeCall) -> usize {
        self.calls_for(device).iter().filter(|c| *c == call).count()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

// ============================================================================
// 2. MOCK SENSOR
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum Signal {
    /// Poisson shot noise around `MOCK_COUNTS`.
    Noise,
    /// Every sample of acquisition k (counted from 1) equals k.
    Ramp,
}

pub struct MockCam {
    label: String,
    probe: MockProbe,
    frames: usize,
    frame_len: usize,
    signal: Signal,
    acquisitions: usize,
    arms: usize,
    armed: bool,
    connected: bool,
    fail_connect: bool,
    fail_on: Option<usize>,
    stall_on: Option<usize>,
    stall_arm_on: Option<usize>,
    panic_on: Option<usize>,
}

impl MockCam {
    const KNOWN: &'static [&'static str] = &[
        "number_measurements",
        "image_roi",
        "signal",
        "target_data_type",
        "address",
        "fail_connect",
        "fail_on_acquisition",
        "stall_on_acquisition",
        "stall_on_arm",
        "panic_on_acquisition",
    ];

    pub fn new(spec: &SensorSpec, probe: MockProbe) -> DeviceResult<Self> {
        Ok(Self {
            label: "sensor".into(),
            probe,
            frames: 2,
            frame_len: 200 * 200,
            signal: Signal::Noise,
            acquisitions: 0,
            arms: 0,
            armed: false,
            connected: false,
            fail_connect: bool_of(&spec.config, "fail_connect")?.unwrap_or(false),
            fail_on: usize_of(&spec.config, "fail_on_acquisition")?,
            stall_on: usize_of(&spec.config, "stall_on_acquisition")?,
            stall_arm_on: usize_of(&spec.config, "stall_on_arm")?,
            panic_on: usize_of(&spec.config, "panic_on_acquisition")?,
        })
    }
}

#[async_trait]
impl Sensor for MockCam {
    async fn connect(&mut self) -> DeviceResult<()> {
        self.probe.record(&self.label, ProbeCall::Connect);
        if self.fail_connect {
            return Err(DeviceError::Connection("MockCam refused the connection".into()));
        }
        self.connected = true;
        Ok(())
    }

    async fn configure(&mut self, config: &ConfigMap) -> DeviceResult<()> {
        self.probe.record(&self.label, ProbeCall::Configure);
        reject_unknown(config, Self::KNOWN)?;

        if let Some(n) = usize_of(config, "number_measurements")? {
            if n == 0 {
                return Err(DeviceError::Config("number_measurements must be positive".into()));
            }
            self.frames = n;
        }
        // [height, width, x_offset, y_offset]; offsets are accepted and ignored.
        if let Some(roi) = usize_list_of(config, "image_roi")? {
            let shape: Vec<usize> = roi.iter().take(2).copied().collect();
            if shape.is_empty() || shape.contains(&0) {
                return Err(DeviceError::Config(format!("invalid image_roi {:?}", roi)));
            }
            self.frame_len = shape.iter().product();
        }
        self.signal = match str_of(config, "signal")? {
            None | Some("noise") => Signal::Noise,
            Some("ramp") => Signal::Ramp,
            Some(other) => {
                return Err(DeviceError::Config(format!(
                    "unknown signal '{}' (accepted: noise, ramp)",
                    other
                )))
            }
        };
        Ok(())
    }

    async fn arm(&mut self) -> DeviceResult<()> {
        self.probe.record(&self.label, ProbeCall::Arm);
        let index = self.arms;
        self.arms += 1;
        if !self.connected {
            return Err(DeviceError::Acquisition("MockCam armed before connect".into()));
        }
        if self.stall_arm_on == Some(index) {
            std::future::pending::<()>().await;
        }
        self.armed = true;
        Ok(())
    }

    async fn acquire(&mut self) -> DeviceResult<Frames> {
        self.probe.record(&self.label, ProbeCall::Acquire);
        let index = self.acquisitions;
        self.acquisitions += 1;

        if !self.armed {
            return Err(DeviceError::Acquisition("MockCam acquired without arm".into()));
        }
        self.armed = false;

        if self.stall_on == Some(index) {
            // A camera that never delivers. The caller's timeout has to catch it.
            std::future::pending::<()>().await;
        }
        if self.panic_on == Some(index) {
            panic!("MockCam blew up on acquisition {}", index);
        }
        if self.fail_on == Some(index) {
            return Err(DeviceError::Acquisition(format!(
                "injected fault on acquisition {}",
                index
            )));
        }

        let n = self.frames * self.frame_len;
        let data = match self.signal {
            Signal::Ramp => vec![(index + 1) as f64; n],
            Signal::Noise => {
                let poisson = Poisson::new(MOCK_COUNTS)
                    .map_err(|e| DeviceError::Acquisition(e.to_string()))?;
                let mut rng = thread_rng();
                (0..n).map(|_| poisson.sample(&mut rng)).collect()
            }
        };
        Frames::new(self.frames, self.frame_len, data).map_err(DeviceError::Acquisition)
    }

    async fn release(&mut self) {
        self.probe.record(&self.label, ProbeCall::Release);
        self.connected = false;
        self.armed = false;
    }
}

// ============================================================================
// 3. MOCK SYNCHRONISER
// ============================================================================

pub struct MockSynchroniser {
    label: String,
    probe: MockProbe,
    triggers: usize,
    fail_connect: bool,
    fail_on_trigger: Option<usize>,
    stall_on_configure: bool,
    stall_on_release: bool,
}

impl MockSynchroniser {
    pub fn new(spec: &SynchroniserSpec, probe: MockProbe) -> DeviceResult<Self> {
        Ok(Self {
            label: "synchroniser".into(),
            probe,
            triggers: 0,
            fail_connect: bool_of(&spec.config, "fail_connect")?.unwrap_or(false),
            fail_on_trigger: usize_of(&spec.config, "fail_on_trigger")?,
            stall_on_configure: bool_of(&spec.config, "stall_on_configure")?.unwrap_or(false),
            stall_on_release: bool_of(&spec.config, "stall_on_release")?.unwrap_or(false),
        })
    }
}

#[async_trait]
impl Synchroniser for MockSynchroniser {
    async fn connect(&mut self) -> DeviceResult<()> {
        self.probe.record(&self.label, ProbeCall::Connect);
        if self.fail_connect {
            return Err(DeviceError::Connection(
                "MockSynchroniser refused the connection".into(),
            ));
        }
        Ok(())
    }

    async fn configure(&mut self, _config: &ConfigMap) -> DeviceResult<()> {
        self.probe.record(&self.label, ProbeCall::Configure);
        if self.stall_on_configure {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn set_channel_mapping(
        &mut self,
        map: &BTreeMap<String, ChannelPort>,
    ) -> DeviceResult<()> {
        self.probe
            .record(&self.label, ProbeCall::SetChannelMapping(map.len()));
        Ok(())
    }

    async fn load_sequence(&mut self, program: &SequenceProgram) -> DeviceResult<()> {
        self.probe
            .record(&self.label, ProbeCall::LoadSequence(program.digest.clone()));
        log::debug!("MockSynchroniser loaded {:?}", program.path);
        Ok(())
    }

    async fn trigger(&mut self) -> DeviceResult<()> {
        self.probe.record(&self.label, ProbeCall::Trigger);
        let index = self.triggers;
        self.triggers += 1;
        if self.fail_on_trigger == Some(index) {
            return Err(DeviceError::Acquisition(format!(
                "injected fault on trigger {}",
                index
            )));
        }
        Ok(())
    }

    async fn release(&mut self) {
        self.probe.record(&self.label, ProbeCall::Release);
        if self.stall_on_release {
            std::future::pending::<()>().await;
        }
    }
}

// ============================================================================
// 4. MOCK SIGNAL SOURCE
// ============================================================================

pub struct MockSignalSource {
    name: String,
    address: String,
    probe: MockProbe,
}

impl MockSignalSource {
    pub fn new(name: &str, spec: &DeviceSpec, probe: MockProbe) -> Self {
        Self {
            name: name.to_string(),
            address: spec.address.clone(),
            probe,
        }
    }
}

#[async_trait]
impl AuxiliarySource for MockSignalSource {
    fn intrinsic_channels(&self) -> Vec<String> {
        vec!["channel_1".into(), "channel_2".into()]
    }

    async fn connect(&mut self) -> DeviceResult<()> {
        self.probe.record(&self.name, ProbeCall::Connect);
        if self.address.contains("unreachable") {
            return Err(DeviceError::Connection(format!(
                "no answer from {}",
                self.address
            )));
        }
        Ok(())
    }

    async fn configure(&mut self, channel: &str, parameter: &str, value: f64) -> DeviceResult<()> {
        self.probe.record(
            &self.name,
            ProbeCall::SetValue {
                channel: channel.to_string(),
                parameter: parameter.to_string(),
                value,
            },
        );
        log::debug!("MOCKING! {} set {} on {} to {}", self.name, parameter, channel, value);
        Ok(())
    }

    async fn release(&mut self) {
        self.probe.record(&self.name, ProbeCall::Release);
    }
}
