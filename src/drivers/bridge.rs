// src/drivers/bridge.rs
//
// =============================================================================
// PULSELAB: BRIDGE DRIVER (v 0.3 )
// =============================================================================
//
// The Out-of-Process Adapter.
//
// Vendor SDKs rarely have Rust bindings. A Bridge device is a helper program
// (any language) that speaks one JSON object per line on stdin/stdout.
//
// Responsibilities:
// 1. Spawn the helper on `connect()` and wait for its "READY" line.
// 2. Send `{"op": ..., "args": ...}`, read `{"ok": bool, "result"|"error"}`.
// 3. Forward helper stderr to our log ("Glass Box").
// 4. Kill the helper on `release()` (and on drop, whatever happens).
//
// Where the helper comes from:
//   sensor / synchroniser:  config `program` (+ optional `args` list)
//   auxiliary source:       `address` is the command line, split on spaces

use crate::aggregate::Frames;
use crate::core::{ChannelPort, ConfigMap, DeviceSpec, SensorSpec, SynchroniserSpec};
use crate::drivers::config::{str_of, usize_of};
use crate::drivers::{AuxiliarySource, DriverRegistry, Sensor, Synchroniser};
use crate::error::{DeviceError, DeviceResult};
use crate::sequence::SequenceProgram;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

pub const BRIDGE: &str = "Bridge";

const DEFAULT_HANDSHAKE_MS: u64 = 10_000;

/// How long a helper gets to acknowledge `release` before it is killed.
const RELEASE_GRACE: Duration = Duration::from_secs(2);

/// Keys consumed here; everything else in `config` is forwarded to the helper.
const LAUNCH_KEYS: &[&str] = &["program", "args", "handshake_timeout_ms"];

pub(crate) fn register(reg: &mut DriverRegistry) {
    reg.register_sensor(BRIDGE, |spec: &SensorSpec| {
        Ok(Box::new(BridgeSensor {
            launch: Launch::from_config("sensor", &spec.config)?,
            link: None,
        }) as Box<dyn Sensor>)
    });
    reg.register_synchroniser(BRIDGE, |spec: &SynchroniserSpec| {
        Ok(Box::new(BridgeSynchroniser {
            launch: Launch::from_config("synchroniser", &spec.config)?,
            link: None,
        }) as Box<dyn Synchroniser>)
    });
    reg.register_source(BRIDGE, |name, spec| {
        Ok(Box::new(BridgeSource {
            launch: Launch::from_address(name, spec)?,
            link: None,
        }) as Box<dyn AuxiliarySource>)
    });
}

// ============================================================================
// 1. LAUNCH PARAMETERS
// ============================================================================

#[derive(Debug, Clone)]
struct Launch {
    label: String,
    program: String,
    args: Vec<String>,
    handshake: Duration,
}

impl Launch {
    fn from_config(label: &str, config: &ConfigMap) -> DeviceResult<Self> {
        let program = str_of(config, "program")?
            .ok_or_else(|| DeviceError::Config("Bridge needs a 'program' to run".into()))?
            .to_string();

        let args = match config.get("args") {
            None | Some(serde_yaml::Value::Null) => Vec::new(),
            Some(serde_yaml::Value::Sequence(seq)) => seq
                .iter()
                .map(|v| match v {
                    serde_yaml::Value::String(s) => Ok(s.clone()),
                    serde_yaml::Value::Number(n) => Ok(n.to_string()),
                    _ => Err(DeviceError::Config("'args' must be a list of strings".into())),
                })
                .collect::<DeviceResult<Vec<_>>>()?,
            Some(_) => return Err(DeviceError::Config("'args' must be a list of strings".into())),
        };

        let handshake = usize_of(config, "handshake_timeout_ms")?
            .map(|ms| ms as u64)
            .unwrap_or(DEFAULT_HANDSHAKE_MS);

        Ok(Self {
            label: label.to_string(),
            program,
            args,
            handshake: Duration::from_millis(handshake),
        })
    }

    fn from_address(label: &str, spec: &DeviceSpec) -> DeviceResult<Self> {
        let mut parts = spec.address.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or_else(|| {
            DeviceError::Config("Bridge source needs a command line as its address".into())
        })?;
        Ok(Self {
            label: label.to_string(),
            program,
            args: parts.collect(),
            handshake: Duration::from_millis(DEFAULT_HANDSHAKE_MS),
        })
    }

    async fn spawn(&self) -> DeviceResult<Link> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            DeviceError::Connection(format!("cannot start '{}': {}", self.program, e))
        })?;

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(i), Some(o), Some(e)) => (i, o, e),
            _ => {
                let _ = child.kill().await;
                return Err(DeviceError::Connection("helper pipes unavailable".into()));
            }
        };

        // Glass Box: helper stderr -> our log, for the lifetime of the process.
        let label = self.label.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                log::warn!("[BRIDGE {}] {}", label, line);
            }
        });

        let mut stdout = BufReader::new(stdout);
        let mut handshake = String::new();
        match tokio::time::timeout(self.handshake, stdout.read_line(&mut handshake)).await {
            Ok(Ok(n)) if n > 0 && handshake.trim() == "READY" => {}
            Ok(Ok(n)) if n > 0 => {
                let _ = child.kill().await;
                return Err(DeviceError::Connection(format!(
                    "expected 'READY' from helper, got '{}'",
                    handshake.trim()
                )));
            }
            Ok(_) => {
                let _ = child.kill().await;
                return Err(DeviceError::Connection("helper closed stdout during boot".into()));
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(DeviceError::Connection(format!(
                    "helper not ready after {} ms",
                    self.handshake.as_millis()
                )));
            }
        }

        log::info!("🔌 Bridge '{}' up ({})", self.label, self.program);
        Ok(Link {
            child,
            stdin,
            stdout,
        })
    }
}

// ============================================================================
// 2. THE LINK (Running helper)
// ============================================================================

#[derive(Serialize)]
struct Request<'a> {
    op: &'a str,
    args: Json,
}

#[derive(Deserialize)]
struct Response {
    ok: bool,
    #[serde(default)]
    result: Json,
    #[serde(default)]
    error: Option<String>,
}

struct Link {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl Link {
    /// One request, one response line. Transport trouble is an acquisition
    /// error unless the caller re-labels it.
    async fn call(&mut self, op: &str, args: Json) -> DeviceResult<Json> {
        let line = serde_json::to_string(&Request { op, args })
            .map_err(|e| DeviceError::Acquisition(e.to_string()))?;

        let io = |e: std::io::Error| DeviceError::Acquisition(format!("helper pipe: {}", e));
        self.stdin.write_all(line.as_bytes()).await.map_err(io)?;
        self.stdin.write_all(b"\n").await.map_err(io)?;
        self.stdin.flush().await.map_err(io)?;

        let mut reply = String::new();
        let n = self.stdout.read_line(&mut reply).await.map_err(io)?;
        if n == 0 {
            // EOF = helper crashed.
            let _ = self.child.kill().await;
            return Err(DeviceError::Acquisition(format!(
                "helper exited during '{}'",
                op
            )));
        }

        let resp: Response = serde_json::from_str(&reply).map_err(|e| {
            DeviceError::Acquisition(format!("invalid reply to '{}': {} ({})", op, reply.trim(), e))
        })?;
        if resp.ok {
            Ok(resp.result)
        } else {
            Err(DeviceError::Acquisition(
                resp.error.unwrap_or_else(|| format!("'{}' refused", op)),
            ))
        }
    }

    /// Polite `release`, then kill regardless of the answer (or its absence).
    async fn shutdown(mut self) {
        if tokio::time::timeout(RELEASE_GRACE, self.call("release", Json::Null))
            .await
            .is_err()
        {
            log::warn!("Bridge helper ignored 'release'; killing it");
        }
        let _ = self.child.kill().await;
    }
}

fn relabel_config(e: DeviceError) -> DeviceError {
    match e {
        DeviceError::Acquisition(m) => DeviceError::Config(m),
        other => other,
    }
}

fn not_connected(label: &str) -> DeviceError {
    DeviceError::Connection(format!("Bridge '{}' used before connect", label))
}

fn forwarded(config: &ConfigMap) -> DeviceResult<Json> {
    let rest: BTreeMap<&String, &serde_yaml::Value> = config
        .iter()
        .filter(|(k, _)| !LAUNCH_KEYS.contains(&k.as_str()))
        .collect();
    serde_json::to_value(rest).map_err(|e| DeviceError::Config(e.to_string()))
}

// ============================================================================
// 3. CAPABILITY ADAPTERS
// ============================================================================

pub struct BridgeSensor {
    launch: Launch,
    link: Option<Link>,
}

#[async_trait]
impl Sensor for BridgeSensor {
    async fn connect(&mut self) -> DeviceResult<()> {
        self.link = Some(self.launch.spawn().await?);
        Ok(())
    }

    async fn configure(&mut self, config: &ConfigMap) -> DeviceResult<()> {
        let args = forwarded(config)?;
        let link = self.link.as_mut().ok_or_else(|| not_connected(&self.launch.label))?;
        link.call("configure", args).await.map_err(relabel_config)?;
        Ok(())
    }

    async fn arm(&mut self) -> DeviceResult<()> {
        let link = self.link.as_mut().ok_or_else(|| not_connected(&self.launch.label))?;
        link.call("arm", Json::Null).await?;
        Ok(())
    }

    async fn acquire(&mut self) -> DeviceResult<Frames> {
        #[derive(Deserialize)]
        struct Block {
            frames: usize,
            frame_len: usize,
            data: Vec<f64>,
        }

        let link = self.link.as_mut().ok_or_else(|| not_connected(&self.launch.label))?;
        let result = link.call("acquire", Json::Null).await?;
        let block: Block = serde_json::from_value(result)
            .map_err(|e| DeviceError::Acquisition(format!("malformed frame block: {}", e)))?;
        Frames::new(block.frames, block.frame_len, block.data).map_err(DeviceError::Acquisition)
    }

    async fn release(&mut self) {
        if let Some(link) = self.link.take() {
            link.shutdown().await;
        }
    }
}

pub struct BridgeSynchroniser {
    launch: Launch,
    link: Option<Link>,
}

#[async_trait]
impl Synchroniser for BridgeSynchroniser {
    async fn connect(&mut self) -> DeviceResult<()> {
        self.link = Some(self.launch.spawn().await?);
        Ok(())
    }

    async fn configure(&mut self, config: &ConfigMap) -> DeviceResult<()> {
        let args = forwarded(config)?;
        let link = self.link.as_mut().ok_or_else(|| not_connected(&self.launch.label))?;
        link.call("configure", args).await.map_err(relabel_config)?;
        Ok(())
    }

    async fn set_channel_mapping(
        &mut self,
        map: &BTreeMap<String, ChannelPort>,
    ) -> DeviceResult<()> {
        let args = serde_json::to_value(map).map_err(|e| DeviceError::Config(e.to_string()))?;
        let link = self.link.as_mut().ok_or_else(|| not_connected(&self.launch.label))?;
        link.call("set_channel_mapping", args)
            .await
            .map_err(relabel_config)?;
        Ok(())
    }

    async fn load_sequence(&mut self, program: &SequenceProgram) -> DeviceResult<()> {
        let params =
            serde_json::to_value(&program.params).map_err(|e| DeviceError::Config(e.to_string()))?;
        let args = json!({
            "path": program.path,
            "sha256": program.digest,
            "bytes_hex": hex::encode(&program.bytes),
            "params": params,
        });
        let link = self.link.as_mut().ok_or_else(|| not_connected(&self.launch.label))?;
        link.call("load_sequence", args).await.map_err(relabel_config)?;
        Ok(())
    }

    async fn trigger(&mut self) -> DeviceResult<()> {
        let link = self.link.as_mut().ok_or_else(|| not_connected(&self.launch.label))?;
        link.call("trigger", Json::Null).await?;
        Ok(())
    }

    async fn release(&mut self) {
        if let Some(link) = self.link.take() {
            link.shutdown().await;
        }
    }
}

pub struct BridgeSource {
    launch: Launch,
    link: Option<Link>,
}

#[async_trait]
impl AuxiliarySource for BridgeSource {
    fn intrinsic_channels(&self) -> Vec<String> {
        vec!["out".into()]
    }

    async fn connect(&mut self) -> DeviceResult<()> {
        self.link = Some(self.launch.spawn().await?);
        Ok(())
    }

    async fn configure(&mut self, channel: &str, parameter: &str, value: f64) -> DeviceResult<()> {
        let link = self.link.as_mut().ok_or_else(|| not_connected(&self.launch.label))?;
        link.call(
            "set",
            json!({ "channel": channel, "parameter": parameter, "value": value }),
        )
        .await?;
        Ok(())
    }

    async fn release(&mut self) {
        if let Some(link) = self.link.take() {
            link.shutdown().await;
        }
    }
}
