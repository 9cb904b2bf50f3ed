//! Lab Streaming Layer inlet adapter. liblsl is loaded dynamically at
//! runtime; when the library is absent the adapter fails to connect instead
//! of breaking the build.

use std::collections::BTreeMap;
use std::ffi::{c_char, c_double, c_int, c_void, CStr, CString};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::Sender;
use libloading::Library;
use once_cell::sync::OnceCell;
use serde_json::Value;

use super::{monotonic_now, DeviceAdapter};
use crate::error::{EngineError, Result};
use crate::types::{
    ConnectionParams, DeviceDescriptor, DeviceKind, DeviceState, SampleFrame, SelfTestReport,
};

type StreamInfo = *mut c_void;
type Inlet = *mut c_void;

struct LslApi {
    #[allow(dead_code)]
    lib: Library,
    resolve_byprop: unsafe extern "C" fn(*mut StreamInfo, u32, *const c_char, *const c_char, c_int, c_double) -> c_int,
    resolve_all: unsafe extern "C" fn(*mut StreamInfo, u32, c_double) -> c_int,
    create_inlet: unsafe extern "C" fn(StreamInfo, c_int, c_int, c_int) -> Inlet,
    open_stream: unsafe extern "C" fn(Inlet, c_double, *mut c_int),
    pull_sample_f: unsafe extern "C" fn(Inlet, *mut f32, c_int, c_double, *mut c_int) -> c_double,
    destroy_inlet: unsafe extern "C" fn(Inlet),
    get_channel_count: unsafe extern "C" fn(StreamInfo) -> c_int,
    get_nominal_srate: unsafe extern "C" fn(StreamInfo) -> c_double,
    get_name: unsafe extern "C" fn(StreamInfo) -> *const c_char,
    destroy_streaminfo: unsafe extern "C" fn(StreamInfo),
}

// The raw fn pointers are only ever used behind the singleton.
unsafe impl Send for LslApi {}
unsafe impl Sync for LslApi {}

impl LslApi {
    fn load() -> Result<Self> {
        let name = libloading::library_filename("lsl");
        let lib = unsafe { Library::new(name) }?;
        // Safety: signatures match the liblsl 1.16 C API.
        unsafe {
            Ok(Self {
                resolve_byprop: *lib.get(b"lsl_resolve_byprop\0")?,
                resolve_all: *lib.get(b"lsl_resolve_all\0")?,
                create_inlet: *lib.get(b"lsl_create_inlet\0")?,
                open_stream: *lib.get(b"lsl_open_stream\0")?,
                pull_sample_f: *lib.get(b"lsl_pull_sample_f\0")?,
                destroy_inlet: *lib.get(b"lsl_destroy_inlet\0")?,
                get_channel_count: *lib.get(b"lsl_get_channel_count\0")?,
                get_nominal_srate: *lib.get(b"lsl_get_nominal_srate\0")?,
                get_name: *lib.get(b"lsl_get_name\0")?,
                destroy_streaminfo: *lib.get(b"lsl_destroy_streaminfo\0")?,
                lib,
            })
        }
    }

    fn instance() -> Result<&'static LslApi> {
        static API: OnceCell<LslApi> = OnceCell::new();
        API.get_or_try_init(Self::load)
    }
}

/// Resolves every visible LSL stream into a device descriptor. Returns an
/// empty list when liblsl is unavailable.
pub fn resolve_streams(timeout_seconds: f64) -> Vec<DeviceDescriptor> {
    let api = match LslApi::instance() {
        Ok(api) => api,
        Err(e) => {
            log::debug!("liblsl unavailable: {e}");
            return Vec::new();
        }
    };
    let mut infos: [StreamInfo; 32] = [std::ptr::null_mut(); 32];
    let count =
        unsafe { (api.resolve_all)(infos.as_mut_ptr(), infos.len() as u32, timeout_seconds) };
    let mut out = Vec::new();
    for (i, &info) in infos.iter().enumerate().take(count.max(0) as usize) {
        let name = unsafe {
            let ptr = (api.get_name)(info);
            if ptr.is_null() {
                format!("lsl-{i}")
            } else {
                CStr::from_ptr(ptr).to_string_lossy().into_owned()
            }
        };
        let channels = unsafe { (api.get_channel_count)(info) }.max(1) as usize;
        let srate = unsafe { (api.get_nominal_srate)(info) } as f32;
        out.push(DeviceDescriptor {
            device_id: format!("lsl-{name}"),
            device_type: DeviceKind::Lsl,
            sampling_rate: if srate > 0.0 { srate } else { 250.0 },
            channel_count: channels,
            connection: ConnectionParams {
                stream_name: Some(name),
                ..Default::default()
            },
            state: DeviceState::Disconnected,
            firmware_version: None,
        });
        unsafe { (api.destroy_streaminfo)(info) };
    }
    out
}

/// Inlet handle owned by one adapter; destroyed on disconnect.
struct InletHandle(Inlet);
unsafe impl Send for InletHandle {}

pub struct LslAdapter {
    descriptor: DeviceDescriptor,
    inlet: Option<Arc<Mutex<InletHandle>>>,
    stop_flag: Arc<AtomicBool>,
    samples_pulled: Arc<AtomicU64>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl LslAdapter {
    pub fn new(descriptor: DeviceDescriptor) -> Self {
        Self {
            descriptor: DeviceDescriptor {
                state: DeviceState::Disconnected,
                ..descriptor
            },
            inlet: None,
            stop_flag: Arc::new(AtomicBool::new(false)),
            samples_pulled: Arc::new(AtomicU64::new(0)),
            worker: None,
        }
    }

    fn resolve_own_stream(&self, api: &'static LslApi, timeout: f64) -> Result<StreamInfo> {
        let stream_name = self
            .descriptor
            .connection
            .stream_name
            .clone()
            .ok_or_else(|| EngineError::BadParameter("stream_name not configured".into()))?;
        let prop = CString::new("name").map_err(|_| {
            EngineError::BadParameter("stream property is not a valid C string".into())
        })?;
        let value = CString::new(stream_name.clone()).map_err(|_| {
            EngineError::BadParameter("stream_name is not a valid C string".into())
        })?;
        let mut infos: [StreamInfo; 4] = [std::ptr::null_mut(); 4];
        let count = unsafe {
            (api.resolve_byprop)(
                infos.as_mut_ptr(),
                infos.len() as u32,
                prop.as_ptr(),
                value.as_ptr(),
                1,
                timeout,
            )
        };
        if count < 1 {
            return Err(EngineError::ConnectionFailed(format!(
                "LSL stream '{stream_name}' not found"
            )));
        }
        // Keep the first match, free the rest.
        for &extra in infos.iter().take(count as usize).skip(1) {
            unsafe { (api.destroy_streaminfo)(extra) };
        }
        Ok(infos[0])
    }
}

impl DeviceAdapter for LslAdapter {
    fn descriptor(&self) -> DeviceDescriptor {
        self.descriptor.clone()
    }

    fn state(&self) -> DeviceState {
        self.descriptor.state
    }

    fn connect(&mut self) -> Result<()> {
        if matches!(
            self.descriptor.state,
            DeviceState::Connected | DeviceState::Streaming
        ) {
            return Ok(());
        }
        self.descriptor.state = DeviceState::Connecting;
        let api = match LslApi::instance() {
            Ok(api) => api,
            Err(e) => {
                self.descriptor.state = DeviceState::Error;
                return Err(EngineError::ConnectionFailed(format!(
                    "liblsl unavailable: {e}"
                )));
            }
        };
        let timeout = self.descriptor.connection.timeout_seconds.unwrap_or(5.0);
        let info = match self.resolve_own_stream(api, timeout) {
            Ok(info) => info,
            Err(e) => {
                self.descriptor.state = DeviceState::Error;
                return Err(e);
            }
        };
        self.descriptor.channel_count =
            unsafe { (api.get_channel_count)(info) }.max(1) as usize;
        let srate = unsafe { (api.get_nominal_srate)(info) } as f32;
        if srate > 0.0 {
            self.descriptor.sampling_rate = srate;
        }

        let inlet = unsafe { (api.create_inlet)(info, 360, 0, 1) };
        unsafe { (api.destroy_streaminfo)(info) };
        if inlet.is_null() {
            self.descriptor.state = DeviceState::Error;
            return Err(EngineError::ConnectionFailed("inlet creation failed".into()));
        }
        let mut ec: c_int = 0;
        unsafe { (api.open_stream)(inlet, timeout, &mut ec) };
        if ec != 0 {
            unsafe { (api.destroy_inlet)(inlet) };
            self.descriptor.state = DeviceState::Error;
            return Err(EngineError::ConnectionFailed(format!(
                "open_stream failed with code {ec}"
            )));
        }
        self.inlet = Some(Arc::new(Mutex::new(InletHandle(inlet))));
        self.descriptor.state = DeviceState::Connected;
        log::info!("lsl {} connected", self.descriptor.device_id);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        if self.descriptor.state == DeviceState::Streaming {
            self.stop_streaming()?;
        }
        if let Some(inlet) = self.inlet.take() {
            if let Ok(api) = LslApi::instance() {
                let guard = inlet.lock().unwrap_or_else(|e| e.into_inner());
                unsafe { (api.destroy_inlet)(guard.0) };
            }
        }
        self.descriptor.state = DeviceState::Disconnected;
        Ok(())
    }

    fn configure(&mut self, config: &serde_json::Map<String, Value>) -> Result<()> {
        for (key, value) in config {
            match key.as_str() {
                "connection.stream_name" | "stream_name" => {
                    if matches!(
                        self.descriptor.state,
                        DeviceState::Connected | DeviceState::Streaming
                    ) {
                        return Err(EngineError::RequiresReconnect(key.clone()));
                    }
                    self.descriptor.connection.stream_name =
                        value.as_str().map(|s| s.to_string());
                }
                "buffer_size" => {}
                _ => {
                    return Err(EngineError::BadParameter(format!(
                        "unrecognized LSL option {key}"
                    )))
                }
            }
        }
        Ok(())
    }

    fn start_streaming(&mut self, sink: Sender<SampleFrame>) -> Result<()> {
        match self.descriptor.state {
            DeviceState::Streaming => return Ok(()),
            DeviceState::Connected => {}
            _ => {
                return Err(EngineError::NotConnected(
                    self.descriptor.device_id.clone(),
                ))
            }
        }
        let api = LslApi::instance()
            .map_err(|e| EngineError::ConnectionFailed(format!("liblsl unavailable: {e}")))?;
        let inlet = Arc::clone(self.inlet.as_ref().ok_or_else(|| {
            EngineError::NotConnected(self.descriptor.device_id.clone())
        })?);
        let channels = self.descriptor.channel_count;
        self.stop_flag.store(false, Ordering::SeqCst);
        self.samples_pulled.store(0, Ordering::SeqCst);
        let stop_flag = Arc::clone(&self.stop_flag);
        let pulled = Arc::clone(&self.samples_pulled);
        let device_id = self.descriptor.device_id.clone();

        self.worker = Some(std::thread::spawn(move || {
            let mut buf = vec![0f32; channels];
            let mut counter: u32 = 0;
            while !stop_flag.load(Ordering::SeqCst) {
                let mut ec: c_int = 0;
                let ts = {
                    let guard = inlet.lock().unwrap_or_else(|e| e.into_inner());
                    unsafe {
                        (api.pull_sample_f)(
                            guard.0,
                            buf.as_mut_ptr(),
                            channels as c_int,
                            0.1,
                            &mut ec,
                        )
                    }
                };
                if ec != 0 {
                    log::warn!("lsl {device_id} pull error code {ec}");
                    std::thread::sleep(Duration::from_millis(20));
                    continue;
                }
                if ts == 0.0 {
                    continue; // timeout, no sample
                }
                counter = counter.wrapping_add(1);
                let frame = SampleFrame {
                    timestamp: monotonic_now(),
                    channels: buf.clone(),
                    sample_index: counter,
                    aux: None,
                    marker: None,
                };
                if sink.send(frame).is_err() {
                    return;
                }
                pulled.fetch_add(1, Ordering::Relaxed);
            }
        }));
        self.descriptor.state = DeviceState::Streaming;
        Ok(())
    }

    fn stop_streaming(&mut self) -> Result<()> {
        if self.descriptor.state != DeviceState::Streaming {
            return Ok(());
        }
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        self.descriptor.state = DeviceState::Connected;
        Ok(())
    }

    fn read_impedance(&mut self) -> Result<BTreeMap<String, f32>> {
        Err(EngineError::Unsupported(
            "LSL streams carry no electrode impedance".into(),
        ))
    }

    fn self_test(&mut self) -> Result<SelfTestReport> {
        let mut report = SelfTestReport::new();
        let connected = matches!(
            self.descriptor.state,
            DeviceState::Connected | DeviceState::Streaming
        );
        report.record(
            "inlet",
            connected,
            if connected {
                "inlet open"
            } else {
                "inlet closed"
            },
        );
        if self.descriptor.state == DeviceState::Streaming {
            let before = self.samples_pulled.load(Ordering::Relaxed);
            std::thread::sleep(Duration::from_millis(200));
            let after = self.samples_pulled.load(Ordering::Relaxed);
            report.record(
                "data_streaming",
                after > before,
                format!("{} samples in the observation window", after - before),
            );
        }
        Ok(report)
    }
}

impl Drop for LslAdapter {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> DeviceDescriptor {
        DeviceDescriptor {
            device_id: "lsl-test".into(),
            device_type: DeviceKind::Lsl,
            sampling_rate: 250.0,
            channel_count: 8,
            connection: ConnectionParams {
                stream_name: Some("TestEEG".into()),
                timeout_seconds: Some(0.1),
                ..Default::default()
            },
            state: DeviceState::Disconnected,
            firmware_version: None,
        }
    }

    #[test]
    fn impedance_is_unsupported() {
        let mut adapter = LslAdapter::new(descriptor());
        assert!(matches!(
            adapter.read_impedance(),
            Err(EngineError::Unsupported(_))
        ));
    }

    #[test]
    fn connect_without_library_or_stream_fails_cleanly() {
        // With no liblsl (or no such stream) the adapter must end in Error
        // without panicking.
        let mut adapter = LslAdapter::new(descriptor());
        if adapter.connect().is_err() {
            assert_eq!(adapter.state(), DeviceState::Error);
        }
    }
}
