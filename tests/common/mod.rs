#![allow(dead_code)]

use pulselab::{DriverRegistry, MockProbe, ResultStore, Runner, RunnerSettings};
use std::path::Path;
use std::time::Duration;

/// A bench with one camera, one pulse streamer, a swept microwave source and
/// a laser driver, all mocked.
pub fn odmr_yaml(steps: usize, averages: usize, mode: &str) -> String {
    format!(
        r#"
experiment_type: odmr
averages: {averages}
sensor:
  type: MockCam
  config:
    number_measurements: 2
    image_roi: [2, 2]
    signal: ramp
synchroniser:
  type: MockSynchroniser
  channel_mapping:
    mw_switch: 0
    laser: 1
dynamic_devices:
  mw_source:
    address: "TCPIP::10.0.0.5::INSTR"
    device_type: Mock
    config:
      frequency:
        start: 2.80e9
        stop: 2.94e9
        channel: channel_1
      amplitude: -10.0
static_devices:
  laser_driver:
    address: "ASRL3::INSTR"
    device_type: Mock
    config:
      power:
        value: 0.5
        channel: laser
data:
  averaging_mode: {mode}
  dynamic_steps: {steps}
"#
    )
}

pub fn settings(root: &Path) -> RunnerSettings {
    RunnerSettings {
        acquisition_timeout: Duration::from_millis(500),
        connect_timeout: Duration::from_secs(10),
        settle: Duration::ZERO,
        sequence_dir: root.join("sequences"),
    }
}

pub fn mock_runner(probe: &MockProbe, root: &Path) -> Runner {
    let store = ResultStore::new(root.join("results")).expect("result store");
    Runner::new(DriverRegistry::with_probe(probe.clone()), store, settings(root))
}

pub fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = match std::fs::read_dir(dir) {
        Ok(rd) => rd
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}
