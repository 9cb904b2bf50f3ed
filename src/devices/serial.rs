//! Serial transport for OpenBCI dongles: a thin byte-level seam so adapters
//! stay testable against scripted transports.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use crate::error::{EngineError, Result};

/// OpenBCI boards terminate text responses with this marker.
pub const TEXT_TERMINATOR: &[u8] = b"$$$";

/// Byte-level wire seam. The production implementation wraps a serial port;
/// tests substitute scripted transports.
pub trait WireTransport: Send {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()>;
    /// Reads whatever is available within the transport's timeout; Ok(0)
    /// means nothing arrived.
    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// Production transport over a serial port.
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialTransport {
    pub fn open(path: &str, baudrate: u32, timeout: Duration) -> Result<Self> {
        let port = serialport::new(path, baudrate)
            .timeout(timeout)
            .open()
            .map_err(|e| EngineError::ConnectionFailed(format!("{path}: {e}")))?;
        Ok(Self { port })
    }

}

impl WireTransport for SerialTransport {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        Write::write_all(&mut self.port, bytes)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        match Read::read(&mut self.port, buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

/// Board interaction timings. Hardware needs the full settle/reset waits;
/// loopback tests shrink them.
#[derive(Clone, Copy, Debug)]
pub struct SerialTiming {
    pub settle: Duration,
    pub reset_wait: Duration,
    pub response_timeout: Duration,
    pub impedance_window: Duration,
}

impl Default for SerialTiming {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(1),
            reset_wait: Duration::from_secs(2),
            response_timeout: Duration::from_secs(2),
            impedance_window: Duration::from_secs(1),
        }
    }
}

impl SerialTiming {
    pub fn fast() -> Self {
        Self {
            settle: Duration::from_millis(1),
            reset_wait: Duration::from_millis(1),
            response_timeout: Duration::from_millis(50),
            impedance_window: Duration::from_millis(20),
        }
    }
}

/// Sends a command and collects the text reply up to the `$$$` terminator.
pub fn send_and_receive(
    transport: &mut dyn WireTransport,
    command: &[u8],
    timeout: Duration,
) -> Result<String> {
    transport.write_all(command)?;
    let deadline = Instant::now() + timeout;
    let mut collected = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        let n = transport.read_some(&mut buf)?;
        if n > 0 {
            collected.extend_from_slice(&buf[..n]);
            if collected
                .windows(TEXT_TERMINATOR.len())
                .any(|w| w == TEXT_TERMINATOR)
            {
                break;
            }
        } else if Instant::now() >= deadline {
            if collected.is_empty() {
                return Err(EngineError::Timeout(timeout.as_secs_f64()));
            }
            break;
        } else {
            std::thread::sleep(Duration::from_millis(2));
        }
        if Instant::now() >= deadline && collected.is_empty() {
            return Err(EngineError::Timeout(timeout.as_secs_f64()));
        }
    }
    Ok(String::from_utf8_lossy(&collected).into_owned())
}

/// Retries a transient-I/O operation with fixed backoff, per the engine's
/// three-attempt policy.
pub fn retry_io<T>(
    attempts: usize,
    backoff: Duration,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut last = None;
    for attempt in 0..attempts.max(1) {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) => {
                log::warn!("I/O attempt {}/{} failed: {e}", attempt + 1, attempts);
                last = Some(e);
                if attempt + 1 < attempts {
                    std::thread::sleep(backoff);
                }
            }
        }
    }
    Err(last.unwrap_or_else(|| EngineError::ConnectionFailed("no attempts made".into())))
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Scripted transport: queued read chunks plus a log of written bytes.
    #[derive(Clone, Default)]
    pub struct MockTransport {
        inner: Arc<Mutex<MockState>>,
    }

    #[derive(Default)]
    struct MockState {
        reads: VecDeque<Vec<u8>>,
        written: Vec<u8>,
        /// Bytes queued in response to specific commands.
        replies: Vec<(Vec<u8>, Vec<u8>)>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn queue_read(&self, bytes: &[u8]) {
            self.inner.lock().unwrap().reads.push_back(bytes.to_vec());
        }

        /// When `command` is written, `reply` becomes readable.
        pub fn on_command(&self, command: &[u8], reply: &[u8]) {
            self.inner
                .lock()
                .unwrap()
                .replies
                .push((command.to_vec(), reply.to_vec()));
        }

        pub fn written(&self) -> Vec<u8> {
            self.inner.lock().unwrap().written.clone()
        }
    }

    impl WireTransport for MockTransport {
        fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
            let mut state = self.inner.lock().unwrap();
            state.written.extend_from_slice(bytes);
            let matched: Vec<Vec<u8>> = state
                .replies
                .iter()
                .filter(|(cmd, _)| cmd.as_slice() == bytes)
                .map(|(_, reply)| reply.clone())
                .collect();
            for reply in matched {
                state.reads.push_back(reply);
            }
            Ok(())
        }

        fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
            let mut state = self.inner.lock().unwrap();
            match state.reads.pop_front() {
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        state.reads.push_front(chunk[n..].to_vec());
                    }
                    Ok(n)
                }
                None => Ok(0),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockTransport;
    use super::*;

    #[test]
    fn send_and_receive_collects_until_terminator() {
        let mut transport = MockTransport::new();
        transport.on_command(b"v", b"OpenBCI V3 8-16 channel\nFirmware v3.1.2\n$$$");
        let reply =
            send_and_receive(&mut transport, b"v", Duration::from_millis(50)).unwrap();
        assert!(reply.contains("Firmware"));
        assert!(reply.ends_with("$$$"));
    }

    #[test]
    fn send_and_receive_times_out_without_reply() {
        let mut transport = MockTransport::new();
        let err =
            send_and_receive(&mut transport, b"v", Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));
    }

    #[test]
    fn retry_io_stops_after_first_success() {
        let mut calls = 0;
        let result: Result<i32> = retry_io(3, Duration::from_millis(1), || {
            calls += 1;
            if calls < 2 {
                Err(EngineError::Serial("flaky".into()))
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls, 2);
    }

    #[test]
    fn retry_io_returns_last_error() {
        let result: Result<()> = retry_io(3, Duration::from_millis(1), || {
            Err(EngineError::Serial("dead".into()))
        });
        assert!(result.is_err());
    }
}
