//! Multi-device lifecycle: registration, discovery, control dispatch and
//! device→session binding. The manager holds id-keyed handles only; adapters
//! never point back into manager state.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use crossbeam_channel::Sender;
use serde_json::Value;

use super::{discover, Device, DeviceAdapter, DiscoveryMethod};
use crate::error::{EngineError, Result};
use crate::types::{
    ConnectionParams, DeviceDescriptor, DeviceKind, DeviceState, SampleFrame, SelfTestReport,
};

struct ManagedDevice {
    device: Arc<Mutex<Device>>,
    session_id: Option<String>,
}

#[derive(Default)]
pub struct DeviceManager {
    devices: RwLock<HashMap<String, ManagedDevice>>,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a device from its descriptor; replaces nothing.
    pub fn register(&self, descriptor: DeviceDescriptor) -> Result<()> {
        let id = descriptor.device_id.clone();
        let device = Device::from_descriptor(descriptor)?;
        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        if devices.contains_key(&id) {
            return Err(EngineError::BadParameter(format!(
                "device {id} already registered"
            )));
        }
        devices.insert(
            id,
            ManagedDevice {
                device: Arc::new(Mutex::new(device)),
                session_id: None,
            },
        );
        Ok(())
    }

    fn handle(&self, device_id: &str) -> Result<Arc<Mutex<Device>>> {
        let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());
        devices
            .get(device_id)
            .map(|entry| Arc::clone(&entry.device))
            .ok_or_else(|| EngineError::DeviceNotFound(device_id.to_string()))
    }

    pub fn list(
        &self,
        status: Option<DeviceState>,
        kind: Option<DeviceKind>,
    ) -> Vec<DeviceDescriptor> {
        let handles: Vec<Arc<Mutex<Device>>> = {
            let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());
            devices
                .values()
                .map(|entry| Arc::clone(&entry.device))
                .collect()
        };
        let mut out: Vec<DeviceDescriptor> = handles
            .iter()
            .map(|d| d.lock().unwrap_or_else(|e| e.into_inner()).descriptor())
            .filter(|d| status.map_or(true, |s| d.state == s))
            .filter(|d| kind.map_or(true, |k| d.device_type == k))
            .collect();
        out.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        out
    }

    /// Runs discovery and registers any device not yet known.
    pub fn discover_and_register(
        &self,
        methods: &[DiscoveryMethod],
        timeout_seconds: f64,
    ) -> Result<Vec<DeviceDescriptor>> {
        if methods.is_empty() {
            return Err(EngineError::DiscoveryFailed(
                "no discovery methods requested".into(),
            ));
        }
        let found = discover(methods, timeout_seconds);
        for descriptor in &found {
            let known = {
                let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());
                devices.contains_key(&descriptor.device_id)
            };
            if !known {
                self.register(descriptor.clone())?;
            }
        }
        Ok(found)
    }

    pub fn connect(&self, device_id: &str) -> Result<()> {
        let handle = self.handle(device_id)?;
        let mut device = handle.lock().unwrap_or_else(|e| e.into_inner());
        device.connect()
    }

    pub fn disconnect(&self, device_id: &str) -> Result<()> {
        let handle = self.handle(device_id)?;
        let mut device = handle.lock().unwrap_or_else(|e| e.into_inner());
        device.disconnect()
    }

    pub fn configure(
        &self,
        device_id: &str,
        config: &serde_json::Map<String, Value>,
    ) -> Result<DeviceDescriptor> {
        let handle = self.handle(device_id)?;
        let mut device = handle.lock().unwrap_or_else(|e| e.into_inner());
        device.configure(config)?;
        Ok(device.descriptor())
    }

    pub fn start_streaming(&self, device_id: &str, sink: Sender<SampleFrame>) -> Result<()> {
        let handle = self.handle(device_id)?;
        let mut device = handle.lock().unwrap_or_else(|e| e.into_inner());
        device.start_streaming(sink)
    }

    pub fn stop_streaming(&self, device_id: &str) -> Result<()> {
        let handle = self.handle(device_id)?;
        let mut device = handle.lock().unwrap_or_else(|e| e.into_inner());
        if device.state() != DeviceState::Streaming {
            return Err(EngineError::NotStreaming(device_id.to_string()));
        }
        device.stop_streaming()
    }

    pub fn read_impedance(&self, device_id: &str) -> Result<BTreeMap<String, f32>> {
        let handle = self.handle(device_id)?;
        let mut device = handle.lock().unwrap_or_else(|e| e.into_inner());
        device.read_impedance()
    }

    pub fn self_test(&self, device_id: &str) -> Result<SelfTestReport> {
        let handle = self.handle(device_id)?;
        let mut device = handle.lock().unwrap_or_else(|e| e.into_inner());
        if !matches!(
            device.state(),
            DeviceState::Connected | DeviceState::Streaming
        ) {
            return Err(EngineError::NotConnected(device_id.to_string()));
        }
        device.self_test()
    }

    pub fn descriptor(&self, device_id: &str) -> Result<DeviceDescriptor> {
        let handle = self.handle(device_id)?;
        let device = handle.lock().unwrap_or_else(|e| e.into_inner());
        Ok(device.descriptor())
    }

    pub fn state(&self, device_id: &str) -> Result<DeviceState> {
        self.descriptor(device_id).map(|d| d.state)
    }

    /// Replaces a device's connection parameters by rebuilding its adapter.
    /// Only possible while the device is down.
    pub fn update_connection(&self, device_id: &str, params: ConnectionParams) -> Result<()> {
        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        let entry = devices
            .get_mut(device_id)
            .ok_or_else(|| EngineError::DeviceNotFound(device_id.to_string()))?;
        let descriptor = {
            let device = entry.device.lock().unwrap_or_else(|e| e.into_inner());
            let descriptor = device.descriptor();
            if matches!(
                descriptor.state,
                DeviceState::Connected | DeviceState::Streaming | DeviceState::Connecting
            ) {
                return Err(EngineError::RequiresReconnect("connection".into()));
            }
            descriptor
        };
        let rebuilt = Device::from_descriptor(DeviceDescriptor {
            connection: params,
            state: DeviceState::Disconnected,
            ..descriptor
        })?;
        entry.device = Arc::new(Mutex::new(rebuilt));
        Ok(())
    }

    /// Binds a device to the session that consumes its frames.
    pub fn bind_session(&self, device_id: &str, session_id: &str) -> Result<()> {
        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        let entry = devices
            .get_mut(device_id)
            .ok_or_else(|| EngineError::DeviceNotFound(device_id.to_string()))?;
        entry.session_id = Some(session_id.to_string());
        Ok(())
    }

    pub fn unbind_session(&self, device_id: &str) -> Result<()> {
        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        let entry = devices
            .get_mut(device_id)
            .ok_or_else(|| EngineError::DeviceNotFound(device_id.to_string()))?;
        entry.session_id = None;
        Ok(())
    }

    pub fn session_for(&self, device_id: &str) -> Option<String> {
        let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());
        devices.get(device_id).and_then(|e| e.session_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConnectionParams;
    use crossbeam_channel::unbounded;
    use std::time::Duration;

    fn synthetic_descriptor(id: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            device_id: id.into(),
            device_type: DeviceKind::Synthetic,
            sampling_rate: 250.0,
            channel_count: 4,
            connection: ConnectionParams::default(),
            state: DeviceState::Disconnected,
            firmware_version: None,
        }
    }

    #[test]
    fn register_connect_stream_stop() {
        let manager = DeviceManager::new();
        manager.register(synthetic_descriptor("dev-1")).unwrap();
        manager.connect("dev-1").unwrap();
        assert_eq!(manager.state("dev-1").unwrap(), DeviceState::Connected);

        let (tx, rx) = unbounded();
        manager.start_streaming("dev-1", tx).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());
        manager.stop_streaming("dev-1").unwrap();
        assert_eq!(manager.state("dev-1").unwrap(), DeviceState::Connected);
    }

    #[test]
    fn unknown_device_errors() {
        let manager = DeviceManager::new();
        assert!(matches!(
            manager.connect("nope"),
            Err(EngineError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn stop_without_streaming_is_not_streaming() {
        let manager = DeviceManager::new();
        manager.register(synthetic_descriptor("dev-1")).unwrap();
        manager.connect("dev-1").unwrap();
        assert!(matches!(
            manager.stop_streaming("dev-1"),
            Err(EngineError::NotStreaming(_))
        ));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let manager = DeviceManager::new();
        manager.register(synthetic_descriptor("dev-1")).unwrap();
        assert!(manager.register(synthetic_descriptor("dev-1")).is_err());
    }

    #[test]
    fn list_filters_by_state_and_kind() {
        let manager = DeviceManager::new();
        manager.register(synthetic_descriptor("dev-1")).unwrap();
        manager.register(synthetic_descriptor("dev-2")).unwrap();
        manager.connect("dev-1").unwrap();
        let connected = manager.list(Some(DeviceState::Connected), None);
        assert_eq!(connected.len(), 1);
        assert_eq!(connected[0].device_id, "dev-1");
        let synthetic = manager.list(None, Some(DeviceKind::Synthetic));
        assert_eq!(synthetic.len(), 2);
    }

    #[test]
    fn session_binding_round_trip() {
        let manager = DeviceManager::new();
        manager.register(synthetic_descriptor("dev-1")).unwrap();
        manager.bind_session("dev-1", "session-a").unwrap();
        assert_eq!(manager.session_for("dev-1").unwrap(), "session-a");
        manager.unbind_session("dev-1").unwrap();
        assert!(manager.session_for("dev-1").is_none());
    }

    #[test]
    fn self_test_requires_connection() {
        let manager = DeviceManager::new();
        manager.register(synthetic_descriptor("dev-1")).unwrap();
        assert!(matches!(
            manager.self_test("dev-1"),
            Err(EngineError::NotConnected(_))
        ));
    }
}
