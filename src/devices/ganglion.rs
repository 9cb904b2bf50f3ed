//! OpenBCI Ganglion adapter: type-tagged 20-byte packets over the BLE dongle
//! link, four channels at 200 Hz.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use serde_json::Value;

use super::codec::{decode_ganglion_packet, GanglionPacket, GANGLION_FRAME_LEN};
use super::commands;
use super::serial::{retry_io, SerialTiming, SerialTransport, WireTransport};
use super::{monotonic_now, DeviceAdapter};
use crate::error::{EngineError, Result};
use crate::types::{DeviceDescriptor, DeviceState, SampleFrame, SelfTestReport};

const CONNECT_ATTEMPTS: usize = 3;
/// Ganglion sample counters wrap after this many data packets.
const COUNTER_MODULUS: u32 = 201;

type TransportFactory =
    Box<dyn Fn(&DeviceDescriptor) -> Result<Box<dyn WireTransport>> + Send>;

/// Reassembles fixed-length Ganglion packets from a byte stream.
#[derive(Debug, Default)]
pub struct GanglionAssembler {
    buffer: Vec<u8>,
    last_counter: Option<u8>,
    pub packets_decoded: u64,
    pub packets_dropped: u64,
}

impl GanglionAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<GanglionPacket> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();
        while self.buffer.len() >= GANGLION_FRAME_LEN {
            let packet: Vec<u8> = self.buffer.drain(..GANGLION_FRAME_LEN).collect();
            match decode_ganglion_packet(&packet) {
                Some(decoded) => {
                    if let GanglionPacket::Data { counter, .. } = &decoded {
                        if let Some(last) = self.last_counter {
                            let expected = (last as u32 + 1) % COUNTER_MODULUS;
                            if *counter as u32 != expected {
                                let gap = (*counter as u32 + COUNTER_MODULUS
                                    - expected)
                                    % COUNTER_MODULUS;
                                self.packets_dropped += gap as u64;
                            }
                        }
                        self.last_counter = Some(*counter);
                        self.packets_decoded += 1;
                    }
                    out.push(decoded);
                }
                None => {
                    self.packets_dropped += 1;
                }
            }
        }
        out
    }
}

pub struct GanglionAdapter {
    descriptor: DeviceDescriptor,
    timing: SerialTiming,
    retry_backoff: Duration,
    transport: Option<Arc<Mutex<Box<dyn WireTransport>>>>,
    transport_factory: Option<TransportFactory>,
    reader: Option<JoinHandle<()>>,
    stop_flag: Arc<AtomicBool>,
    packets_seen: Arc<Mutex<(u64, u64)>>,
}

impl GanglionAdapter {
    pub fn new(descriptor: DeviceDescriptor) -> Self {
        Self {
            descriptor: DeviceDescriptor {
                channel_count: descriptor.channel_count.min(4).max(1),
                sampling_rate: 200.0,
                state: DeviceState::Disconnected,
                ..descriptor
            },
            timing: SerialTiming::default(),
            retry_backoff: Duration::from_secs(5),
            transport: None,
            transport_factory: None,
            reader: None,
            stop_flag: Arc::new(AtomicBool::new(false)),
            packets_seen: Arc::new(Mutex::new((0, 0))),
        }
    }

    pub fn with_transport_factory(mut self, factory: TransportFactory) -> Self {
        self.transport_factory = Some(factory);
        self.timing = SerialTiming::fast();
        self.retry_backoff = Duration::from_millis(1);
        self
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
            .ok_or_else(|| EngineError::BadParameter("dongle port not configured".into()))?;
        let baudrate = self.descriptor.connection.baudrate.unwrap_or(115_200);
        let timeout = Duration::from_secs_f64(
            self.descriptor.connection.timeout_seconds.unwrap_or(1.0),
        );
        Ok(Box::new(SerialTransport::open(&port, baudrate, timeout)?))
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

    fn collect_packets(&self, window: Duration) -> Result<Vec<GanglionPacket>> {
        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| EngineError::NotConnected(self.descriptor.device_id.clone()))?;
        let mut assembler = GanglionAssembler::new();
        let mut packets = Vec::new();
        let deadline = Instant::now() + window;
        let mut buf = [0u8; 512];
        while Instant::now() < deadline {
            let n = {
                let mut guard = transport.lock().unwrap_or_else(|e| e.into_inner());
                guard.read_some(&mut buf)?
            };
            if n == 0 {
                std::thread::sleep(Duration::from_millis(2));
                continue;
            }
            packets.extend(assembler.push(&buf[..n]));
        }
        Ok(packets)
    }
}

impl DeviceAdapter for GanglionAdapter {
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
        // The Ganglion dongle has no version banner; a stop command doubles
        // as a liveness probe.
        if let Err(e) = self.write_command(commands::STOP_STREAMING) {
            self.transport = None;
            self.descriptor.state = DeviceState::Error;
            return Err(EngineError::ConnectionFailed(e.to_string()));
        }
        self.descriptor.state = DeviceState::Connected;
        log::info!("ganglion {} connected", self.descriptor.device_id);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        if self.descriptor.state == DeviceState::Streaming {
            self.stop_streaming()?;
        }
        self.transport = None;
        self.descriptor.state = DeviceState::Disconnected;
        Ok(())
    }

    fn configure(&mut self, config: &serde_json::Map<String, Value>) -> Result<()> {
        for key in config.keys() {
            if key.starts_with("serial.") || key.starts_with("connection.") {
                return Err(EngineError::RequiresReconnect(key.clone()));
            }
        }
        for (key, value) in config {
            match key.as_str() {
                "channels" => {
                    let states: Vec<bool> = serde_json::from_value(value.clone())
                        .map_err(|_| {
                            EngineError::BadParameter("channels must be a bool array".into())
                        })?;
                    // Ganglion exposes no per-channel commands over the
                    // dongle; enabled flags only gate frame assembly.
                    if states.len() > 4 {
                        return Err(EngineError::BadParameter(
                            "Ganglion has four channels".into(),
                        ));
                    }
                }
                "buffer_size" | "filtering" => {}
                "sampling_rate" => {
                    let rate = value.as_u64().unwrap_or(0);
                    if rate != 200 {
                        return Err(EngineError::BadParameter(
                            "Ganglion samples at a fixed 200 Hz".into(),
                        ));
                    }
                }
                _ => {
                    return Err(EngineError::BadParameter(format!(
                        "unrecognized Ganglion option {key}"
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
        self.stop_flag.store(false, Ordering::SeqCst);
        *self.packets_seen.lock().unwrap_or_else(|e| e.into_inner()) = (0, 0);

        let stop_flag = Arc::clone(&self.stop_flag);
        let counters = Arc::clone(&self.packets_seen);
        let transport = Arc::clone(
            self.transport
                .as_ref()
                .ok_or_else(|| EngineError::NotConnected(self.descriptor.device_id.clone()))?,
        );
        let channel_count = self.descriptor.channel_count;
        let device_id = self.descriptor.device_id.clone();

        self.reader = Some(std::thread::spawn(move || {
            let mut assembler = GanglionAssembler::new();
            let mut extended_counter: u32 = 0;
            let mut buf = [0u8; 1024];
            while !stop_flag.load(Ordering::SeqCst) {
                let read = {
                    let mut guard = transport.lock().unwrap_or_else(|e| e.into_inner());
                    guard.read_some(&mut buf)
                };
                let n = match read {
                    Ok(n) => n,
                    Err(e) => {
                        log::warn!("ganglion {device_id} read error: {e}");
                        std::thread::sleep(Duration::from_millis(20));
                        continue;
                    }
                };
                if n == 0 {
                    std::thread::sleep(Duration::from_millis(2));
                    continue;
                }
                for packet in assembler.push(&buf[..n]) {
                    if let GanglionPacket::Data { channels_uv, .. } = packet {
                        extended_counter = extended_counter.wrapping_add(1);
                        let sample = SampleFrame {
                            timestamp: monotonic_now(),
                            channels: channels_uv[..channel_count].to_vec(),
                            sample_index: extended_counter,
                            aux: None,
                            marker: None,
                        };
                        if sink.send(sample).is_err() {
                            return;
                        }
                    }
                }
                *counters.lock().unwrap_or_else(|e| e.into_inner()) =
                    (assembler.packets_decoded, assembler.packets_dropped);
            }
        }));
        self.descriptor.state = DeviceState::Streaming;
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
        let packets = self.collect_packets(self.timing.impedance_window);
        self.write_command(commands::IMPEDANCE_STOP)?;

        let mut out = BTreeMap::new();
        for packet in packets? {
            if let GanglionPacket::Impedance(payload) = packet {
                if payload.len() >= 5 {
                    let channel = payload[0] as usize;
                    let ohms = u32::from_be_bytes([
                        payload[1], payload[2], payload[3], payload[4],
                    ]) as f32;
                    if (1..=4).contains(&channel) {
                        // Firmware reports the full driven loop; the GUI
                        // halves it for the single electrode leg.
                        out.insert(format!("Ch{channel}"), ohms / 2.0 / 1000.0);
                    }
                }
            }
        }
        if out.is_empty() {
            return Err(EngineError::Unsupported(
                "no impedance packets received".into(),
            ));
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
            "dongle_connection",
            connected,
            if connected {
                "dongle link active"
            } else {
                "dongle link inactive"
            },
        );
        if self.descriptor.state == DeviceState::Streaming {
            let before = self.packets_seen.lock().unwrap_or_else(|e| e.into_inner()).0;
            std::thread::sleep(self.timing.impedance_window);
            let after = self.packets_seen.lock().unwrap_or_else(|e| e.into_inner()).0;
            report.record(
                "data_streaming",
                after > before,
                format!("{} packets in the observation window", after - before),
            );
            let (decoded, dropped) = *self.packets_seen.lock().unwrap_or_else(|e| e.into_inner());
            if decoded + dropped > 0 {
                let loss = dropped as f64 / (decoded + dropped) as f64 * 100.0;
                report.record("performance", loss < 5.0, format!("packet loss {loss:.2}%"));
            }
        }
        Ok(report)
    }
}

impl Drop for GanglionAdapter {
    fn drop(&mut self) {
        let _ = self.stop_streaming();
    }
}
