//! BrainFlow-backed board adapter. Uses the BoardController dynamic library
//! so the dongle stream is decoded by the vendor stack and arrives already
//! scaled; the engine only polls the ring buffer and re-emits frames.

use std::collections::BTreeMap;
use std::ffi::{c_char, c_double, c_int, CString};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use libloading::Library;
use once_cell::sync::OnceCell;
use serde::Serialize;
use serde_json::Value;

use super::{monotonic_now, DeviceAdapter};
use crate::error::{EngineError, Result};
use crate::types::{DeviceDescriptor, DeviceState, SampleFrame, SelfTestReport};

/// BrainFlow board id for the 8-channel Cyton.
const BOARD_ID_CYTON: c_int = 0;
const PRESET_DEFAULT: c_int = 0;
const STREAM_RINGBUF_PACKETS: c_int = 450_000;
/// Samples requested per poll; keeps FFI overhead low at 250 Hz.
const POLL_SAMPLES: usize = 32;

#[derive(Serialize)]
struct BrainFlowInputParams {
    serial_port: String,
    mac_address: String,
    ip_address: String,
    ip_address_aux: String,
    ip_address_anc: String,
    ip_port: i32,
    ip_port_aux: i32,
    ip_port_anc: i32,
    ip_protocol: i32,
    other_info: String,
    timeout: i32,
    serial_number: String,
    file: String,
    file_aux: String,
    file_anc: String,
    master_board: i32,
}

impl BrainFlowInputParams {
    fn for_serial(port: &str, timeout_seconds: i32) -> Self {
        Self {
            serial_port: port.to_string(),
            mac_address: String::new(),
            ip_address: String::new(),
            ip_address_aux: String::new(),
            ip_address_anc: String::new(),
            ip_port: 0,
            ip_port_aux: 0,
            ip_port_anc: 0,
            ip_protocol: 0,
            other_info: String::new(),
            timeout: timeout_seconds,
            serial_number: String::new(),
            file: String::new(),
            file_aux: String::new(),
            file_anc: String::new(),
            master_board: -100, // NO_BOARD
        }
    }
}

struct BrainFlowApi {
    #[allow(dead_code)]
    lib: Library,
    prepare_session: unsafe extern "C" fn(c_int, *const c_char) -> c_int,
    start_stream: unsafe extern "C" fn(c_int, *const c_char, c_int, *const c_char) -> c_int,
    stop_stream: unsafe extern "C" fn(c_int, *const c_char) -> c_int,
    release_session: unsafe extern "C" fn(c_int, *const c_char) -> c_int,
    get_sampling_rate: unsafe extern "C" fn(c_int, c_int, *mut c_int) -> c_int,
    get_num_rows: unsafe extern "C" fn(c_int, c_int, *mut c_int) -> c_int,
    get_eeg_channels: unsafe extern "C" fn(c_int, c_int, *mut c_int, *mut c_int) -> c_int,
    get_current_board_data: unsafe extern "C" fn(
        c_int,
        c_int,
        *mut c_double,
        *mut c_int,
        c_int,
        *const c_char,
    ) -> c_int,
}

unsafe impl Send for BrainFlowApi {}
unsafe impl Sync for BrainFlowApi {}

impl BrainFlowApi {
    fn load() -> Result<Self> {
        let name = libloading::library_filename("BoardController");
        let lib = unsafe { Library::new(name) }?;
        // Safety: signatures follow the official BrainFlow C API.
        unsafe {
            Ok(Self {
                prepare_session: *lib.get(b"prepare_session\0")?,
                start_stream: *lib.get(b"start_stream\0")?,
                stop_stream: *lib.get(b"stop_stream\0")?,
                release_session: *lib.get(b"release_session\0")?,
                get_sampling_rate: *lib.get(b"get_sampling_rate\0")?,
                get_num_rows: *lib.get(b"get_num_rows\0")?,
                get_eeg_channels: *lib.get(b"get_eeg_channels\0")?,
                get_current_board_data: *lib.get(b"get_current_board_data\0")?,
                lib,
            })
        }
    }

    fn instance() -> Result<&'static BrainFlowApi> {
        static API: OnceCell<BrainFlowApi> = OnceCell::new();
        API.get_or_try_init(Self::load)
    }

    fn check(code: c_int, context: &str) -> Result<()> {
        if code == 0 {
            Ok(())
        } else {
            Err(EngineError::VendorLibrary(format!(
                "{context} failed (BrainFlow code {code})"
            )))
        }
    }

    fn sampling_rate(&self, board_id: c_int) -> Result<c_int> {
        let mut rate: c_int = 0;
        Self::check(
            unsafe { (self.get_sampling_rate)(board_id, PRESET_DEFAULT, &mut rate) },
            "get_sampling_rate",
        )?;
        Ok(rate)
    }

    fn num_rows(&self, board_id: c_int) -> Result<usize> {
        let mut rows: c_int = 0;
        Self::check(
            unsafe { (self.get_num_rows)(board_id, PRESET_DEFAULT, &mut rows) },
            "get_num_rows",
        )?;
        Ok(rows.max(0) as usize)
    }

    fn eeg_channels(&self, board_id: c_int, max_rows: usize) -> Result<Vec<usize>> {
        let mut out_len: c_int = 0;
        let mut buf = vec![0 as c_int; max_rows.max(32)];
        Self::check(
            unsafe {
                (self.get_eeg_channels)(board_id, PRESET_DEFAULT, buf.as_mut_ptr(), &mut out_len)
            },
            "get_eeg_channels",
        )?;
        buf.truncate(out_len.max(0) as usize);
        Ok(buf.into_iter().map(|c| c.max(0) as usize).collect())
    }
}

/// Shared session handle used by both the adapter and its polling thread.
struct BoardSession {
    api: &'static BrainFlowApi,
    input_json: CString,
    board_id: c_int,
    num_rows: usize,
    eeg_channels: Vec<usize>,
}

impl BoardSession {
    /// Pulls up to `max_samples` pending samples. The buffer is row-major
    /// rows×samples, so channel ch of sample i sits at `ch·n + i`.
    fn poll(&self, max_samples: usize) -> Result<Vec<Vec<f32>>> {
        let mut buf = vec![0f64; self.num_rows * max_samples];
        let mut current_size: c_int = 0;
        BrainFlowApi::check(
            unsafe {
                (self.api.get_current_board_data)(
                    max_samples as c_int,
                    PRESET_DEFAULT,
                    buf.as_mut_ptr(),
                    &mut current_size,
                    self.board_id,
                    self.input_json.as_ptr(),
                )
            },
            "get_current_board_data",
        )?;
        let available = current_size.max(0) as usize;
        let mut samples = Vec::with_capacity(available);
        for i in 0..available {
            let mut frame = Vec::with_capacity(self.eeg_channels.len());
            for &ch in &self.eeg_channels {
                let offset = ch * available + i;
                frame.push(buf.get(offset).copied().unwrap_or(0.0) as f32);
            }
            samples.push(frame);
        }
        Ok(samples)
    }
}

pub struct BrainFlowAdapter {
    descriptor: DeviceDescriptor,
    session: Option<Arc<BoardSession>>,
    streaming_started: bool,
    stop_flag: Arc<AtomicBool>,
    samples_pulled: Arc<AtomicU64>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl BrainFlowAdapter {
    pub fn new(descriptor: DeviceDescriptor) -> Self {
        Self {
            descriptor: DeviceDescriptor {
                state: DeviceState::Disconnected,
                ..descriptor
            },
            session: None,
            streaming_started: false,
            stop_flag: Arc::new(AtomicBool::new(false)),
            samples_pulled: Arc::new(AtomicU64::new(0)),
            worker: None,
        }
    }

    fn encode_params(&self) -> Result<CString> {
        let port = self
            .descriptor
            .connection
            .port
            .clone()
            .ok_or_else(|| EngineError::BadParameter("serial port not configured".into()))?;
        let timeout = self.descriptor.connection.timeout_seconds.unwrap_or(0.0) as i32;
        let params = BrainFlowInputParams::for_serial(&port, timeout);
        let json = serde_json::to_string(&params)
            .map_err(|e| EngineError::BadParameter(e.to_string()))?;
        CString::new(json)
            .map_err(|_| EngineError::BadParameter("input params contain NUL".into()))
    }
}

impl DeviceAdapter for BrainFlowAdapter {
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
        let api = match BrainFlowApi::instance() {
            Ok(api) => api,
            Err(e) => {
                self.descriptor.state = DeviceState::Error;
                return Err(EngineError::ConnectionFailed(format!(
                    "BoardController unavailable: {e}"
                )));
            }
        };
        let input_json = match self.encode_params() {
            Ok(v) => v,
            Err(e) => {
                self.descriptor.state = DeviceState::Error;
                return Err(e);
            }
        };
        if let Err(e) = BrainFlowApi::check(
            unsafe { (api.prepare_session)(BOARD_ID_CYTON, input_json.as_ptr()) },
            "prepare_session",
        ) {
            self.descriptor.state = DeviceState::Error;
            return Err(e);
        }
        let rate = api.sampling_rate(BOARD_ID_CYTON)?;
        let num_rows = api.num_rows(BOARD_ID_CYTON)?;
        let eeg_channels = api.eeg_channels(BOARD_ID_CYTON, num_rows)?;
        self.descriptor.sampling_rate = rate as f32;
        self.descriptor.channel_count = eeg_channels.len();
        self.session = Some(Arc::new(BoardSession {
            api,
            input_json,
            board_id: BOARD_ID_CYTON,
            num_rows,
            eeg_channels,
        }));
        self.descriptor.state = DeviceState::Connected;
        log::info!(
            "brainflow {} connected at {} Hz",
            self.descriptor.device_id,
            rate
        );
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        if self.descriptor.state == DeviceState::Streaming {
            self.stop_streaming()?;
        }
        if let Some(session) = self.session.take() {
            let _ = BrainFlowApi::check(
                unsafe {
                    (session.api.release_session)(session.board_id, session.input_json.as_ptr())
                },
                "release_session",
            );
        }
        self.descriptor.state = DeviceState::Disconnected;
        Ok(())
    }

    fn configure(&mut self, config: &serde_json::Map<String, Value>) -> Result<()> {
        for key in config.keys() {
            if key.starts_with("serial.") || key.starts_with("connection.") {
                return Err(EngineError::RequiresReconnect(key.clone()));
            }
            if key != "buffer_size" {
                return Err(EngineError::BadParameter(format!(
                    "BrainFlow boards accept no option {key}"
                )));
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
        let session = Arc::clone(self.session.as_ref().ok_or_else(|| {
            EngineError::NotConnected(self.descriptor.device_id.clone())
        })?);
        if !self.streaming_started {
            BrainFlowApi::check(
                unsafe {
                    (session.api.start_stream)(
                        STREAM_RINGBUF_PACKETS,
                        std::ptr::null(),
                        session.board_id,
                        session.input_json.as_ptr(),
                    )
                },
                "start_stream",
            )?;
            self.streaming_started = true;
        }

        self.stop_flag.store(false, Ordering::SeqCst);
        self.samples_pulled.store(0, Ordering::SeqCst);
        let stop_flag = Arc::clone(&self.stop_flag);
        let pulled = Arc::clone(&self.samples_pulled);
        let device_id = self.descriptor.device_id.clone();

        self.worker = Some(std::thread::spawn(move || {
            let mut counter: u32 = 0;
            while !stop_flag.load(Ordering::SeqCst) {
                match session.poll(POLL_SAMPLES) {
                    Ok(samples) => {
                        if samples.is_empty() {
                            std::thread::sleep(Duration::from_millis(5));
                            continue;
                        }
                        for channels in samples {
                            counter = counter.wrapping_add(1);
                            let frame = SampleFrame {
                                timestamp: monotonic_now(),
                                channels,
                                sample_index: counter,
                                aux: None,
                                marker: None,
                            };
                            if sink.send(frame).is_err() {
                                return;
                            }
                            pulled.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Err(e) => {
                        log::warn!("brainflow {device_id} poll failed: {e}");
                        std::thread::sleep(Duration::from_millis(20));
                    }
                }
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
        if self.streaming_started {
            if let Some(session) = &self.session {
                BrainFlowApi::check(
                    unsafe {
                        (session.api.stop_stream)(session.board_id, session.input_json.as_ptr())
                    },
                    "stop_stream",
                )?;
            }
            self.streaming_started = false;
        }
        self.descriptor.state = DeviceState::Connected;
        Ok(())
    }

    fn read_impedance(&mut self) -> Result<BTreeMap<String, f32>> {
        Err(EngineError::Unsupported(
            "BrainFlow exposes no lead-off measurement through this adapter".into(),
        ))
    }

    fn self_test(&mut self) -> Result<SelfTestReport> {
        let mut report = SelfTestReport::new();
        let connected = matches!(
            self.descriptor.state,
            DeviceState::Connected | DeviceState::Streaming
        );
        report.record(
            "session",
            connected,
            if connected {
                "BrainFlow session prepared"
            } else {
                "no BrainFlow session"
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

impl Drop for BrainFlowAdapter {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}
