//! OpenBCI Cyton adapter: serial control, 33-byte packet stream decoding and
//! impedance measurement over the lead-off drive.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use serde_json::Value;

use super::codec::CytonDecoder;
use super::commands;
use super::serial::{
    retry_io, send_and_receive, SerialTiming, SerialTransport, WireTransport,
};
use super::{monotonic_now, DeviceAdapter};
use crate::error::{EngineError, Result};
use crate::types::{DeviceDescriptor, DeviceState, SampleFrame, SelfTestReport};

/// Series resistor on the Cyton lead-off circuit (ohms).
const SERIES_RESISTOR_OHMS: f64 = 2200.0;
/// Lead-off drive current (amps).
const LEAD_OFF_DRIVE_AMPS: f64 = 6.0e-9;

const CONNECT_ATTEMPTS: usize = 3;

type TransportFactory =
    Box<dyn Fn(&DeviceDescriptor) -> Result<Box<dyn WireTransport>> + Send>;

#[derive(Clone, Copy, Debug, Default)]
pub struct LinkStats {
    pub packets_decoded: u64,
    pub packets_dropped: u64,
    pub bytes_skipped: u64,
}

pub struct CytonAdapter {
    descriptor: DeviceDescriptor,
    timing: SerialTiming,
    retry_backoff: Duration,
    transport: Option<Arc<Mutex<Box<dyn WireTransport>>>>,
    transport_factory: Option<TransportFactory>,
    reader: Option<JoinHandle<()>>,
    stop_flag: Arc<AtomicBool>,
    stats: Arc<Mutex<LinkStats>>,
    channel_states: Vec<bool>,
    test_signal: bool,
}

impl CytonAdapter {
    pub fn new(descriptor: DeviceDescriptor) -> Self {
        let channels = descriptor.channel_count.min(8).max(1);
        Self {
            descriptor: DeviceDescriptor {
                channel_count: channels,
                state: DeviceState::Disconnected,
                ..descriptor
            },
            timing: SerialTiming::default(),
            retry_backoff: Duration::from_secs(5),
            transport: None,
            transport_factory: None,
            reader: None,
            stop_flag: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(Mutex::new(LinkStats::default())),
            channel_states: vec![true; channels],
            test_signal: false,
        }
    }

    /// Substitutes the wire transport; used by loopback tests.
    pub fn with_transport_factory(mut self, factory: TransportFactory) -> Self {
        self.transport_factory = Some(factory);
        self.timing = SerialTiming::fast();
        self.retry_backoff = Duration::from_millis(1);
        self
    }

    pub fn link_stats(&self) -> LinkStats {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn open_transport(&self) -> Result<Box<dyn WireTransport>> {
        if let Some(factory) = &self.transport_factory {
            return factory(&self.descriptor);
        }
        let port = self
            .descriptor
            .connection
            .port
            .clone()
            .ok_or_else(|| EngineError::BadParameter("serial port not configured".into()))?;
        let baudrate = self.descriptor.connection.baudrate.unwrap_or(115_200);
        let timeout = Duration::from_secs_f64(
            self.descriptor.connection.timeout_seconds.unwrap_or(1.0),
        );
        let transport = SerialTransport::open(&port, baudrate, timeout)?;
        Ok(Box::new(transport))
    }

    fn write_command(&self, command: &[u8]) -> Result<()> {
        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| EngineError::NotConnected(self.descriptor.device_id.clone()))?;
        transport
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .write_all(command)
    }

    fn interrogate_version(&self) -> Result<String> {
        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| EngineError::NotConnected(self.descriptor.device_id.clone()))?;
        let mut guard = transport.lock().unwrap_or_else(|e| e.into_inner());
        send_and_receive(
            guard.as_mut(),
            commands::SOFT_RESET,
            self.timing.response_timeout,
        )
    }

    fn set_channel_state(&self, channel: usize, enabled: bool) -> Result<()> {
        if channel >= 8 {
            return Err(EngineError::BadParameter(format!(
                "channel {channel} out of range"
            )));
        }
        let command = if enabled {
            commands::CHANNEL_ON[channel]
        } else {
            commands::CHANNEL_OFF[channel]
        };
        self.write_command(command)
    }

    fn apply_sample_rate(&mut self, rate: u32) -> Result<()> {
        let supported = commands::SAMPLE_RATES.iter().any(|(r, _)| *r == rate);
        if !supported {
            return Err(EngineError::BadParameter(format!(
                "unsupported Cyton sampling rate {rate}"
            )));
        }
        let selector = commands::SAMPLE_RATES
            .iter()
            .find(|(r, _)| *r == rate)
            .map(|(_, c)| *c)
            .ok_or_else(|| EngineError::BadParameter("sampling rate".into()))?;
        self.write_command(selector)?;
        self.descriptor.sampling_rate = rate as f32;
        Ok(())
    }

    /// Board bring-up after the version handshake: quiescent, all requested
    /// channels enabled, test signal off, rate applied.
    fn configure_board(&mut self) -> Result<()> {
        self.write_command(commands::STOP_STREAMING)?;
        for ch in 0..self.channel_states.len() {
            if self.channel_states[ch] {
                self.set_channel_state(ch, true)?;
            }
        }
        self.write_command(commands::TEST_SIGNAL_OFF)?;
        self.test_signal = false;
        let rate = self.descriptor.sampling_rate as u32;
        if commands::SAMPLE_RATES.iter().any(|(r, _)| *r == rate) {
            self.apply_sample_rate(rate)?;
        }
        Ok(())
    }

    /// Reads raw stream bytes for `window`, decoding frames locally. Used by
    /// impedance measurement and the self-test data-flow check.
    fn collect_frames(&self, window: Duration) -> Result<Vec<super::codec::CytonFrame>> {
        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| EngineError::NotConnected(self.descriptor.device_id.clone()))?;
        let mut decoder = CytonDecoder::new();
        let mut frames = Vec::new();
        let deadline = Instant::now() + window;
        let mut buf = [0u8; 1024];
        while Instant::now() < deadline {
            let n = {
                let mut guard = transport.lock().unwrap_or_else(|e| e.into_inner());
                guard.read_some(&mut buf)?
            };
            if n == 0 {
                std::thread::sleep(Duration::from_millis(2));
                continue;
            }
            frames.extend(decoder.push(&buf[..n]));
        }
        Ok(frames)
    }
}

impl DeviceAdapter for CytonAdapter {
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
        let backoff = self.retry_backoff;
        let transport = match retry_io(CONNECT_ATTEMPTS, backoff, || self.open_transport()) {
            Ok(t) => t,
            Err(e) => {
                self.descriptor.state = DeviceState::Error;
                return Err(e);
            }
        };
        self.transport = Some(Arc::new(Mutex::new(transport)));

        std::thread::sleep(self.timing.settle);
        let version = match self.interrogate_version() {
            Ok(v) => v,
            Err(e) => {
                self.transport = None;
                self.descriptor.state = DeviceState::Error;
                return Err(EngineError::ConnectionFailed(format!(
                    "no version response: {e}"
                )));
            }
        };
        std::thread::sleep(self.timing.reset_wait);
        self.descriptor.firmware_version = version
            .lines()
            .find(|l| l.contains("OpenBCI") || l.contains("Firmware"))
            .map(|l| l.trim().to_string());

        self.configure_board()?;
        self.descriptor.state = DeviceState::Connected;
        log::info!(
            "cyton {} connected ({})",
            self.descriptor.device_id,
            self.descriptor
                .firmware_version
                .as_deref()
                .unwrap_or("unknown firmware")
        );
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        if self.descriptor.state == DeviceState::Streaming {
            self.stop_streaming()?;
        }
        if self.transport.is_some() {
            let _ = self.write_command(commands::STOP_STREAMING);
        }
        self.transport = None;
        self.descriptor.state = DeviceState::Disconnected;
        log::info!("cyton {} disconnected", self.descriptor.device_id);
        Ok(())
    }

    fn configure(&mut self, config: &serde_json::Map<String, Value>) -> Result<()> {
        // Connection-parameter changes cannot be applied on a live link.
        for key in config.keys() {
            if key.starts_with("serial.") || key.starts_with("connection.") {
                return Err(EngineError::RequiresReconnect(key.clone()));
            }
        }
        for (key, value) in config {
            match key.as_str() {
                "sampling_rate" => {
                    let rate = value.as_u64().ok_or_else(|| {
                        EngineError::BadParameter("sampling_rate must be an integer".into())
                    })? as u32;
                    self.apply_sample_rate(rate)?;
                }
                "channels" => {
                    let states: Vec<bool> = serde_json::from_value(value.clone())
                        .map_err(|_| {
                            EngineError::BadParameter("channels must be a bool array".into())
                        })?;
                    for (ch, &enabled) in states.iter().enumerate().take(8) {
                        self.set_channel_state(ch, enabled)?;
                        if ch < self.channel_states.len() {
                            self.channel_states[ch] = enabled;
                        }
                    }
                }
                "test_signal" => {
                    let on = value.as_bool().ok_or_else(|| {
                        EngineError::BadParameter("test_signal must be a bool".into())
                    })?;
                    if on != self.test_signal {
                        self.write_command(if on {
                            commands::TEST_SIGNAL_ON
                        } else {
                            commands::TEST_SIGNAL_OFF
                        })?;
                        self.test_signal = on;
                    }
                }
                "filtering" | "buffer_size" => {
                    // Host-side settings: recognized, no board command.
                }
                _ => {
                    return Err(EngineError::BadParameter(format!(
                        "unrecognized Cyton option {key}"
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
        self.write_command(commands::START_STREAMING)?;

        *self.stats.lock().unwrap_or_else(|e| e.into_inner()) = LinkStats::default();
        self.stop_flag.store(false, Ordering::SeqCst);
        let stop_flag = Arc::clone(&self.stop_flag);
        let stats = Arc::clone(&self.stats);
        let transport = Arc::clone(
            self.transport
                .as_ref()
                .ok_or_else(|| EngineError::NotConnected(self.descriptor.device_id.clone()))?,
        );
        let channel_count = self.descriptor.channel_count;
        let device_id = self.descriptor.device_id.clone();

        self.reader = Some(std::thread::spawn(move || {
            let mut decoder = CytonDecoder::new();
            let mut extended_counter: u32 = 0;
            let mut last_counter: Option<u8> = None;
            let mut buf = [0u8; 2048];
            while !stop_flag.load(Ordering::SeqCst) {
                let read = {
                    let mut guard = transport.lock().unwrap_or_else(|e| e.into_inner());
                    guard.read_some(&mut buf)
                };
                let n = match read {
                    Ok(n) => n,
                    Err(e) => {
                        log::warn!("cyton {device_id} read error: {e}");
                        std::thread::sleep(Duration::from_millis(20));
                        continue;
                    }
                };
                if n == 0 {
                    std::thread::sleep(Duration::from_millis(2));
                    continue;
                }
                for frame in decoder.push(&buf[..n]) {
                    let advance = match last_counter {
                        Some(last) => frame.counter.wrapping_sub(last) as u32,
                        None => 1,
                    };
                    extended_counter = extended_counter.wrapping_add(advance.max(1));
                    last_counter = Some(frame.counter);
                    let sample = SampleFrame {
                        timestamp: monotonic_now(),
                        channels: frame.channels_uv[..channel_count].to_vec(),
                        sample_index: extended_counter,
                        aux: Some(frame.aux.iter().map(|&a| a as f32).collect()),
                        marker: None,
                    };
                    if sink.send(sample).is_err() {
                        return;
                    }
                }
                let mut s = stats.lock().unwrap_or_else(|e| e.into_inner());
                s.packets_decoded = decoder.packets_decoded;
                s.packets_dropped = decoder.packets_dropped;
                s.bytes_skipped = decoder.bytes_skipped;
            }
        }));
        self.descriptor.state = DeviceState::Streaming;
        log::info!("cyton {} streaming", self.descriptor.device_id);
        Ok(())
    }

    fn stop_streaming(&mut self) -> Result<()> {
        if self.descriptor.state != DeviceState::Streaming {
            return Ok(());
        }
        self.write_command(commands::STOP_STREAMING)?;
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
        self.descriptor.state = DeviceState::Connected;
        log::info!("cyton {} stopped streaming", self.descriptor.device_id);
        Ok(())
    }

    fn read_impedance(&mut self) -> Result<BTreeMap<String, f32>> {
        let was_streaming = self.descriptor.state == DeviceState::Streaming;
        if was_streaming {
            self.stop_streaming()?;
        }
        if self.descriptor.state != DeviceState::Connected {
            return Err(EngineError::NotConnected(
                self.descriptor.device_id.clone(),
            ));
        }

        self.write_command(commands::IMPEDANCE_START)?;
        self.write_command(commands::START_STREAMING)?;
        let frames = self.collect_frames(self.timing.impedance_window);
        let stop_result = self
            .write_command(commands::STOP_STREAMING)
            .and_then(|_| self.write_command(commands::IMPEDANCE_STOP));

        let mut out = BTreeMap::new();
        if let Ok(frames) = &frames {
            for ch in 0..self.descriptor.channel_count {
                let samples: Vec<f32> = frames.iter().map(|f| f.channels_uv[ch]).collect();
                let std_uv = crate::dsp::stats::std_dev(&samples) as f64;
                // Lead-off drive math from the OpenBCI GUI: √2·σ/I − R_series.
                let ohms = ((2.0f64.sqrt() * std_uv * 1.0e-6) / LEAD_OFF_DRIVE_AMPS
                    - SERIES_RESISTOR_OHMS)
                    .max(0.0);
                out.insert(format!("Ch{}", ch + 1), (ohms / 1000.0) as f32);
            }
        }
        stop_result?;
        frames?;

        if was_streaming {
            // Caller restarts streaming through the manager, which owns the
            // frame sink; impedance leaves the board quiescent but connected.
            log::info!(
                "cyton {}: streaming paused for impedance read",
                self.descriptor.device_id
            );
        }
        Ok(out)
    }

    fn self_test(&mut self) -> Result<SelfTestReport> {
        let mut report = SelfTestReport::new();
        let connected = matches!(
            self.descriptor.state,
            DeviceState::Connected | DeviceState::Streaming
        );
        report.record(
            "serial_connection",
            connected,
            if connected {
                "serial connection active"
            } else {
                "serial connection inactive"
            },
        );
        if !connected {
            return Ok(report);
        }

        if self.descriptor.state == DeviceState::Connected {
            match self.interrogate_version() {
                Ok(reply) => report.record(
                    "board_communication",
                    true,
                    format!("board replied ({} bytes)", reply.len()),
                ),
                Err(e) => report.record("board_communication", false, format!("no reply: {e}")),
            }

            let toggled = self
                .set_channel_state(0, false)
                .and_then(|_| self.set_channel_state(0, true));
            report.record(
                "channel_control",
                toggled.is_ok(),
                match &toggled {
                    Ok(_) => "channel toggle functional".to_string(),
                    Err(e) => format!("channel toggle failed: {e}"),
                },
            );
        }

        if self.descriptor.state == DeviceState::Streaming {
            let before = self.link_stats();
            std::thread::sleep(self.timing.impedance_window);
            let after = self.link_stats();
            let flowing = after.packets_decoded > before.packets_decoded;
            report.record(
                "data_streaming",
                flowing,
                format!(
                    "{} packets in the observation window",
                    after.packets_decoded - before.packets_decoded
                ),
            );
        }

        let stats = self.link_stats();
        let total = stats.packets_decoded + stats.packets_dropped;
        if total > 0 {
            let loss = stats.packets_dropped as f64 / total as f64 * 100.0;
            report.record(
                "performance",
                loss < 5.0,
                format!("packet loss {loss:.2}%"),
            );
        }
        Ok(report)
    }
}

impl Drop for CytonAdapter {
    fn drop(&mut self) {
        let _ = self.stop_streaming();
    }
}

#[cfg(test)]
mod tests {
    use super::super::codec::encode_cyton_frame;
    use super::super::serial::mock::MockTransport;
    use super::*;
    use crate::types::{ConnectionParams, DeviceKind};
    use crossbeam_channel::unbounded;

    fn descriptor() -> DeviceDescriptor {
        DeviceDescriptor {
            device_id: "cyton-test".into(),
            device_type: DeviceKind::OpenBciCyton,
            sampling_rate: 250.0,
            channel_count: 8,
            connection: ConnectionParams::default(),
            state: DeviceState::Disconnected,
            firmware_version: None,
        }
    }

    fn adapter_with_mock() -> (CytonAdapter, MockTransport) {
        let mock = MockTransport::new();
        mock.on_command(b"v", b"OpenBCI V3 8-16 channel\nFirmware v3.1.2\n$$$");
        let for_factory = mock.clone();
        let adapter = CytonAdapter::new(descriptor()).with_transport_factory(Box::new(
            move |_| Ok(Box::new(for_factory.clone()) as Box<dyn WireTransport>),
        ));
        (adapter, mock)
    }

    #[test]
    fn connect_performs_version_handshake() {
        let (mut adapter, mock) = adapter_with_mock();
        adapter.connect().unwrap();
        assert_eq!(adapter.state(), DeviceState::Connected);
        assert!(adapter
            .descriptor()
            .firmware_version
            .unwrap()
            .contains("OpenBCI"));
        // Board bring-up leaves the device quiescent with test signal off.
        let written = mock.written();
        assert!(written.windows(1).any(|w| w == b"s"));
        assert!(written.windows(1).any(|w| w == b"-"));
    }

    #[test]
    fn connect_is_idempotent() {
        let (mut adapter, _mock) = adapter_with_mock();
        adapter.connect().unwrap();
        adapter.connect().unwrap();
        assert_eq!(adapter.state(), DeviceState::Connected);
    }

    #[test]
    fn connect_without_version_reply_errors() {
        let mock = MockTransport::new();
        let for_factory = mock.clone();
        let mut adapter = CytonAdapter::new(descriptor()).with_transport_factory(Box::new(
            move |_| Ok(Box::new(for_factory.clone()) as Box<dyn WireTransport>),
        ));
        let err = adapter.connect().unwrap_err();
        assert!(matches!(err, EngineError::ConnectionFailed(_)));
        assert_eq!(adapter.state(), DeviceState::Error);
    }

    #[test]
    fn streaming_decodes_frames_into_the_sink() {
        let (mut adapter, mock) = adapter_with_mock();
        adapter.connect().unwrap();
        let mut stream = Vec::new();
        for i in 0..5u8 {
            stream.extend_from_slice(&encode_cyton_frame(i, &[100 * i as i32; 8], &[0; 3]));
        }
        mock.queue_read(&stream);
        let (tx, rx) = unbounded();
        adapter.start_streaming(tx).unwrap();
        let mut frames = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(1);
        while frames.len() < 5 && Instant::now() < deadline {
            if let Ok(f) = rx.recv_timeout(Duration::from_millis(50)) {
                frames.push(f);
            }
        }
        adapter.stop_streaming().unwrap();
        assert_eq!(frames.len(), 5);
        assert_eq!(frames[0].channels.len(), 8);
        // Sample indices advance monotonically.
        for pair in frames.windows(2) {
            assert!(pair[1].sample_index > pair[0].sample_index);
        }
    }

    #[test]
    fn start_streaming_requires_connection() {
        let (mut adapter, _mock) = adapter_with_mock();
        let (tx, _rx) = unbounded();
        let err = adapter.start_streaming(tx).unwrap_err();
        assert!(matches!(err, EngineError::NotConnected(_)));
    }

    #[test]
    fn stop_streaming_is_idempotent() {
        let (mut adapter, _mock) = adapter_with_mock();
        adapter.connect().unwrap();
        adapter.stop_streaming().unwrap();
        adapter.stop_streaming().unwrap();
    }

    #[test]
    fn connection_param_change_requires_reconnect() {
        let (mut adapter, _mock) = adapter_with_mock();
        adapter.connect().unwrap();
        let patch = serde_json::json!({ "serial.port": "/dev/ttyUSB1" });
        let err = adapter.configure(patch.as_object().unwrap()).unwrap_err();
        assert!(matches!(err, EngineError::RequiresReconnect(_)));
    }

    #[test]
    fn invalid_sampling_rate_is_rejected() {
        let (mut adapter, _mock) = adapter_with_mock();
        adapter.connect().unwrap();
        let patch = serde_json::json!({ "sampling_rate": 300 });
        assert!(matches!(
            adapter.configure(patch.as_object().unwrap()),
            Err(EngineError::BadParameter(_))
        ));
        let patch = serde_json::json!({ "sampling_rate": 500 });
        adapter.configure(patch.as_object().unwrap()).unwrap();
        assert_eq!(adapter.descriptor().sampling_rate, 500.0);
    }

    #[test]
    fn impedance_reads_all_channels_and_restores_mode() {
        let (mut adapter, mock) = adapter_with_mock();
        adapter.connect().unwrap();
        // Queue some stream data for the impedance window.
        let mut stream = Vec::new();
        for i in 0..20u8 {
            let raw = [(i as i32 % 7 - 3) * 1000; 8];
            stream.extend_from_slice(&encode_cyton_frame(i, &raw, &[0; 3]));
        }
        mock.queue_read(&stream);
        let impedance = adapter.read_impedance().unwrap();
        assert_eq!(impedance.len(), 8);
        assert!(impedance.values().all(|&k| k >= 0.0));
        assert_eq!(adapter.state(), DeviceState::Connected);
        // Mode switch commands were issued in order.
        let written = mock.written();
        let z_pos = written.iter().position(|&b| b == b'z').unwrap();
        let cap_z_pos = written.iter().rposition(|&b| b == b'Z').unwrap();
        assert!(z_pos < cap_z_pos);
    }

    #[test]
    fn self_test_reports_checks() {
        let (mut adapter, _mock) = adapter_with_mock();
        adapter.connect().unwrap();
        let report = adapter.self_test().unwrap();
        assert!(report.passed);
        let names: Vec<&str> = report.checks.iter().map(|c| c.name).collect();
        assert!(names.contains(&"serial_connection"));
        assert!(names.contains(&"board_communication"));
        assert!(names.contains(&"channel_control"));
    }
}
