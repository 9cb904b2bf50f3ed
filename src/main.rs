use std::time::Duration;

use anyhow::Result;

use neurostream::types::{ConnectionParams, DeviceDescriptor, DeviceKind, DeviceState};
use neurostream::Engine;

/// Demo run: a synthetic 8-channel device streamed through a full session,
/// logging per-window quality until interrupted or 10 seconds elapse.
fn main() -> Result<()> {
    env_logger::init();

    let engine = Engine::new();
    engine.register_device(DeviceDescriptor {
        device_id: "synthetic-0".into(),
        device_type: DeviceKind::Synthetic,
        sampling_rate: 250.0,
        channel_count: 8,
        connection: ConnectionParams::default(),
        state: DeviceState::Disconnected,
        firmware_version: None,
    })?;
    engine.connect_device("synthetic-0", None)?;

    engine.start_stream_session("demo", 8, 250.0, Some(2.0), Some(0.5), Some(10.0))?;
    engine.attach_device("demo", "synthetic-0")?;
    let output = engine.subscribe("demo")?;
    engine.start_streaming("synthetic-0")?;
    log::info!("streaming; processed windows follow");

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while std::time::Instant::now() < deadline {
        match output.recv_timeout(Duration::from_millis(500)) {
            Ok(window) => {
                log::info!(
                    "window @{} quality={:.2} ({}) snr={:.1} dB features={} latency={:.1} ms",
                    window.window_start_index,
                    window.quality.composite_score,
                    window.quality.rating(),
                    window.quality.snr_db,
                    window.features.len(),
                    window.latency_ms,
                );
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }

    let (metrics, report) = engine.stop_stream_session("demo")?;
    log::info!(
        "session done: {} windows, {} samples, mean quality {:.2}, {} alerts",
        metrics.windows_emitted,
        metrics.samples_processed,
        report.mean_overall_score,
        report.warning_alerts + report.critical_alerts,
    );
    engine.disconnect_device("synthetic-0")?;
    Ok(())
}
