//! Device adapters: wire-protocol parsing and control for every supported
//! acquisition source, plus discovery and the multi-device manager.

pub mod brainflow;
pub mod codec;
pub mod cyton;
pub mod ganglion;
pub mod lsl;
pub mod manager;
pub mod serial;
pub mod synthetic;

use std::collections::BTreeMap;
use std::time::Instant;

use crossbeam_channel::Sender;
use once_cell::sync::Lazy;
use serde_json::Value;

pub use brainflow::BrainFlowAdapter;
pub use cyton::CytonAdapter;
pub use ganglion::GanglionAdapter;
pub use lsl::LslAdapter;
pub use manager::DeviceManager;
pub use synthetic::SyntheticAdapter;

use crate::error::{EngineError, Result};
use crate::types::{
    ConnectionParams, DeviceDescriptor, DeviceKind, DeviceState, SampleFrame, SelfTestReport,
};

static CLOCK_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic process time in seconds, used to stamp frames.
pub fn monotonic_now() -> f64 {
    CLOCK_EPOCH.elapsed().as_secs_f64()
}

/// OpenBCI board command bytes shared by the Cyton and Ganglion adapters.
pub mod commands {
    pub const START_STREAMING: &[u8] = b"b";
    pub const STOP_STREAMING: &[u8] = b"s";
    pub const SOFT_RESET: &[u8] = b"v";
    pub const CHANNEL_OFF: [&[u8]; 8] = [b"1", b"2", b"3", b"4", b"5", b"6", b"7", b"8"];
    pub const CHANNEL_ON: [&[u8]; 8] = [b"!", b"@", b"#", b"$", b"%", b"^", b"&", b"*"];
    pub const TEST_SIGNAL_ON: &[u8] = b"0";
    pub const TEST_SIGNAL_OFF: &[u8] = b"-";
    pub const IMPEDANCE_START: &[u8] = b"z";
    pub const IMPEDANCE_STOP: &[u8] = b"Z";

    /// Cyton sample-rate selectors, highest first.
    pub const SAMPLE_RATES: [(u32, &[u8]); 7] = [
        (16_000, b"~0"),
        (8_000, b"~1"),
        (4_000, b"~2"),
        (2_000, b"~3"),
        (1_000, b"~4"),
        (500, b"~5"),
        (250, b"~6"),
    ];
}

/// Control contract every device variant implements.
pub trait DeviceAdapter: Send {
    fn descriptor(&self) -> DeviceDescriptor;
    fn state(&self) -> DeviceState;
    fn connect(&mut self) -> Result<()>;
    fn disconnect(&mut self) -> Result<()>;
    /// Applies recognized configuration keys; connection-parameter changes
    /// fail with `RequiresReconnect`.
    fn configure(&mut self, config: &serde_json::Map<String, Value>) -> Result<()>;
    fn start_streaming(&mut self, sink: Sender<SampleFrame>) -> Result<()>;
    fn stop_streaming(&mut self) -> Result<()>;
    /// Channel label → impedance in kΩ. Temporarily switches board mode and
    /// restores it on exit.
    fn read_impedance(&mut self) -> Result<BTreeMap<String, f32>>;
    fn self_test(&mut self) -> Result<SelfTestReport>;
}

/// Tagged device value; one variant per supported acquisition source.
pub enum Device {
    Cyton(CytonAdapter),
    Ganglion(GanglionAdapter),
    Synthetic(SyntheticAdapter),
    Lsl(LslAdapter),
    BrainFlow(BrainFlowAdapter),
}

impl Device {
    pub fn from_descriptor(descriptor: DeviceDescriptor) -> Result<Self> {
        match descriptor.device_type {
            DeviceKind::OpenBciCyton => Ok(Device::Cyton(CytonAdapter::new(descriptor))),
            DeviceKind::OpenBciGanglion => {
                Ok(Device::Ganglion(GanglionAdapter::new(descriptor)))
            }
            DeviceKind::Synthetic => Ok(Device::Synthetic(SyntheticAdapter::new(descriptor))),
            DeviceKind::Lsl => Ok(Device::Lsl(LslAdapter::new(descriptor))),
            DeviceKind::BrainFlowCyton => {
                Ok(Device::BrainFlow(BrainFlowAdapter::new(descriptor)))
            }
        }
    }

    fn inner(&self) -> &dyn DeviceAdapter {
        match self {
            Device::Cyton(a) => a,
            Device::Ganglion(a) => a,
            Device::Synthetic(a) => a,
            Device::Lsl(a) => a,
            Device::BrainFlow(a) => a,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn DeviceAdapter {
        match self {
            Device::Cyton(a) => a,
            Device::Ganglion(a) => a,
            Device::Synthetic(a) => a,
            Device::Lsl(a) => a,
            Device::BrainFlow(a) => a,
        }
    }
}

impl DeviceAdapter for Device {
    fn descriptor(&self) -> DeviceDescriptor {
        self.inner().descriptor()
    }

    fn state(&self) -> DeviceState {
        self.inner().state()
    }

    fn connect(&mut self) -> Result<()> {
        self.inner_mut().connect()
    }

    fn disconnect(&mut self) -> Result<()> {
        self.inner_mut().disconnect()
    }

    fn configure(&mut self, config: &serde_json::Map<String, Value>) -> Result<()> {
        self.inner_mut().configure(config)
    }

    fn start_streaming(&mut self, sink: Sender<SampleFrame>) -> Result<()> {
        self.inner_mut().start_streaming(sink)
    }

    fn stop_streaming(&mut self) -> Result<()> {
        self.inner_mut().stop_streaming()
    }

    fn read_impedance(&mut self) -> Result<BTreeMap<String, f32>> {
        self.inner_mut().read_impedance()
    }

    fn self_test(&mut self) -> Result<SelfTestReport> {
        self.inner_mut().self_test()
    }
}

/// Discovery methods accepted by `discover_devices`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscoveryMethod {
    Serial,
    Lsl,
    Synthetic,
}

impl DiscoveryMethod {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "serial" => Ok(DiscoveryMethod::Serial),
            "lsl" => Ok(DiscoveryMethod::Lsl),
            "synthetic" => Ok(DiscoveryMethod::Synthetic),
            other => Err(EngineError::BadParameter(format!(
                "unknown discovery method {other}"
            ))),
        }
    }
}

/// Scans for reachable devices. Serial scanning enumerates USB serial ports
/// as Cyton candidates; a synthetic device is always present; LSL streams
/// are resolved only when the vendor library loads.
pub fn discover(methods: &[DiscoveryMethod], timeout_seconds: f64) -> Vec<DeviceDescriptor> {
    let mut found = Vec::new();
    for method in methods {
        match method {
            DiscoveryMethod::Synthetic => {
                found.push(DeviceDescriptor {
                    device_id: "synthetic-0".into(),
                    device_type: DeviceKind::Synthetic,
                    sampling_rate: 250.0,
                    channel_count: 8,
                    connection: ConnectionParams::default(),
                    state: DeviceState::Disconnected,
                    firmware_version: None,
                });
            }
            DiscoveryMethod::Serial => match serialport::available_ports() {
                Ok(ports) => {
                    for (i, port) in ports.iter().enumerate() {
                        if !matches!(port.port_type, serialport::SerialPortType::UsbPort(_)) {
                            continue;
                        }
                        found.push(DeviceDescriptor {
                            device_id: format!("cyton-{i}"),
                            device_type: DeviceKind::OpenBciCyton,
                            sampling_rate: 250.0,
                            channel_count: 8,
                            connection: ConnectionParams {
                                port: Some(port.port_name.clone()),
                                baudrate: Some(115_200),
                                ..Default::default()
                            },
                            state: DeviceState::Disconnected,
                            firmware_version: None,
                        });
                    }
                }
                Err(e) => log::warn!("serial discovery failed: {e}"),
            },
            DiscoveryMethod::Lsl => {
                for descriptor in lsl::resolve_streams(timeout_seconds) {
                    found.push(descriptor);
                }
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_discovery_always_reports_a_device() {
        let found = discover(&[DiscoveryMethod::Synthetic], 0.1);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].device_type, DeviceKind::Synthetic);
    }

    #[test]
    fn discovery_method_parsing() {
        assert_eq!(
            DiscoveryMethod::parse("serial").unwrap(),
            DiscoveryMethod::Serial
        );
        assert!(DiscoveryMethod::parse("bluetooth").is_err());
    }

    #[test]
    fn monotonic_clock_advances() {
        let a = monotonic_now();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(monotonic_now() > a);
    }
}
