use std::collections::VecDeque;

use ndarray::{Array2, ArrayView2};

use crate::error::{EngineError, Result};
use crate::types::{SampleFrame, Window};

/// Upper bound on stored (total index → timestamp) reference pairs.
const MAX_TIMESTAMP_REFS: usize = 64;

/// Fixed-capacity channels×samples ring owned by one session.
///
/// Samples are addressed by their total-stream index: the buffer holds the
/// half-open range `[total_written - len, total_written)`. The oldest samples
/// are silently dropped on wrap.
pub struct StreamBuffer {
    data: Array2<f32>,
    channels: usize,
    capacity: usize,
    write_pos: usize,
    len: usize,
    total_written: u64,
    sampling_rate: f32,
    /// Sparse (total index, timestamp) pairs used to extrapolate window times.
    timestamp_refs: VecDeque<(u64, f64)>,
    next_ref_at: u64,
    next_window_start: u64,
}

impl StreamBuffer {
    pub fn with_duration(channels: usize, sampling_rate: f32, seconds: f32) -> Result<Self> {
        if sampling_rate <= 0.0 {
            return Err(EngineError::BadParameter(
                "sampling rate must be positive".into(),
            ));
        }
        if channels == 0 {
            return Err(EngineError::BadParameter(
                "channel count must be positive".into(),
            ));
        }
        let capacity = (sampling_rate * seconds).ceil() as usize;
        if capacity == 0 {
            return Err(EngineError::BadParameter(
                "buffer duration must be positive".into(),
            ));
        }
        Ok(Self {
            data: Array2::zeros((channels, capacity)),
            channels,
            capacity,
            write_pos: 0,
            len: 0,
            total_written: 0,
            sampling_rate,
            timestamp_refs: VecDeque::new(),
            next_ref_at: 0,
            next_window_start: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn num_channels(&self) -> usize {
        self.channels
    }

    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    pub fn remaining_capacity(&self) -> usize {
        self.capacity - self.len
    }

    pub fn fill_fraction(&self) -> f32 {
        self.len as f32 / self.capacity as f32
    }

    /// Appends a channels×n block. Fails only when the block alone exceeds
    /// the buffer capacity; otherwise old samples are overwritten as needed.
    pub fn append(&mut self, block: ArrayView2<'_, f32>) -> Result<()> {
        if block.nrows() != self.channels {
            return Err(EngineError::BadShape {
                expected: self.channels,
                actual: block.nrows(),
            });
        }
        let n = block.ncols();
        if n > self.capacity {
            return Err(EngineError::BufferTooLarge {
                requested: n,
                capacity: self.capacity,
            });
        }
        for col in 0..n {
            let dst = self.write_pos;
            for ch in 0..self.channels {
                self.data[[ch, dst]] = block[[ch, col]];
            }
            self.write_pos = (self.write_pos + 1) % self.capacity;
        }
        self.len = (self.len + n).min(self.capacity);
        self.total_written += n as u64;
        Ok(())
    }

    /// Appends one frame and records its timestamp as a reference point at a
    /// bounded cadence (roughly once per second of signal).
    pub fn push_frame(&mut self, frame: &SampleFrame) -> Result<()> {
        if frame.channels.len() != self.channels {
            return Err(EngineError::BadShape {
                expected: self.channels,
                actual: frame.channels.len(),
            });
        }
        let index = self.total_written;
        if index >= self.next_ref_at {
            if self.timestamp_refs.len() == MAX_TIMESTAMP_REFS {
                self.timestamp_refs.pop_front();
            }
            self.timestamp_refs.push_back((index, frame.timestamp));
            self.next_ref_at = index + self.sampling_rate.ceil() as u64;
        }
        let dst = self.write_pos;
        for (ch, &v) in frame.channels.iter().enumerate() {
            self.data[[ch, dst]] = v;
        }
        self.write_pos = (self.write_pos + 1) % self.capacity;
        self.len = (self.len + 1).min(self.capacity);
        self.total_written += 1;
        Ok(())
    }

    /// The most recent `n` samples per channel, or None when fewer are held.
    pub fn latest(&self, n: usize) -> Option<Array2<f32>> {
        if n > self.len {
            return None;
        }
        Some(self.copy_range(self.total_written - n as u64, n))
    }

    /// Estimated acquisition time of total index `i`, extrapolated from the
    /// greatest stored reference at or before `i`.
    pub fn estimate_timestamp(&self, index: u64) -> f64 {
        let reference = self
            .timestamp_refs
            .iter()
            .rev()
            .find(|(ref_index, _)| *ref_index <= index)
            .or_else(|| self.timestamp_refs.front());
        match reference {
            Some(&(ref_index, ts)) => {
                ts + (index as f64 - ref_index as f64) / self.sampling_rate as f64
            }
            None => index as f64 / self.sampling_rate as f64,
        }
    }

    /// Drains every window of `window_size` samples whose start lies at or
    /// after the sliding cursor, stepping by `step`. Idempotent across calls:
    /// each start index is emitted exactly once, in monotonic order.
    pub fn take_windows(&mut self, window_size: usize, step: usize) -> Vec<Window> {
        let mut out = Vec::new();
        if window_size == 0 || step == 0 || window_size > self.capacity {
            return out;
        }
        let oldest = self.total_written - self.len as u64;
        // Windows whose start fell off the ring can no longer be served;
        // skip forward along the step grid.
        if self.next_window_start < oldest {
            let behind = oldest - self.next_window_start;
            let skipped = (behind + step as u64 - 1) / step as u64;
            self.next_window_start += skipped * step as u64;
        }
        while self.next_window_start + window_size as u64 <= self.total_written {
            let start = self.next_window_start;
            let data = self.copy_range(start, window_size);
            let end = start + window_size as u64;
            out.push(Window {
                data,
                start_index: start,
                end_index: end,
                timestamp: self.estimate_timestamp(end - 1),
            });
            self.next_window_start += step as u64;
        }
        out
    }

    /// Remaining samples past the sliding-window cursor as one final short
    /// window, or None when fewer than `min_samples` are left. Advances the
    /// cursor to the stream end.
    pub fn take_tail(&mut self, min_samples: usize) -> Option<Window> {
        let oldest = self.total_written - self.len as u64;
        let start = self.next_window_start.max(oldest);
        let available = (self.total_written - start) as usize;
        if available == 0 || available < min_samples {
            return None;
        }
        let data = self.copy_range(start, available);
        let end = self.total_written;
        self.next_window_start = end;
        Some(Window {
            data,
            start_index: start,
            end_index: end,
            timestamp: self.estimate_timestamp(end - 1),
        })
    }

    pub fn clear(&mut self) {
        self.data.fill(0.0);
        self.write_pos = 0;
        self.len = 0;
        self.total_written = 0;
        self.timestamp_refs.clear();
        self.next_ref_at = 0;
        self.next_window_start = 0;
    }

    fn copy_range(&self, start_index: u64, n: usize) -> Array2<f32> {
        let oldest = self.total_written - self.len as u64;
        debug_assert!(start_index >= oldest);
        debug_assert!(start_index + n as u64 <= self.total_written);
        let mut out = Array2::zeros((self.channels, n));
        // Ring offset of the oldest held sample.
        let tail = (self.write_pos + self.capacity - self.len) % self.capacity;
        let base = (start_index - oldest) as usize;
        for col in 0..n {
            let src = (tail + base + col) % self.capacity;
            for ch in 0..self.channels {
                out[[ch, col]] = self.data[[ch, src]];
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn ramp_block(channels: usize, n: usize, offset: f32) -> Array2<f32> {
        Array2::from_shape_fn((channels, n), |(ch, i)| {
            offset + i as f32 + ch as f32 * 10_000.0
        })
    }

    #[test]
    fn append_then_latest_returns_samples_in_order() {
        let mut buf = StreamBuffer::with_duration(2, 10.0, 1.0).unwrap();
        let block = ramp_block(2, 6, 0.0);
        buf.append(block.view()).unwrap();
        assert_eq!(buf.total_written(), 6);
        let latest = buf.latest(6).unwrap();
        assert_eq!(latest, block);
    }

    #[test]
    fn latest_more_than_held_is_none() {
        let mut buf = StreamBuffer::with_duration(1, 10.0, 1.0).unwrap();
        buf.append(ramp_block(1, 4, 0.0).view()).unwrap();
        assert!(buf.latest(5).is_none());
        assert!(buf.latest(4).is_some());
    }

    #[test]
    fn oversized_block_is_rejected_and_buffer_unchanged() {
        let mut buf = StreamBuffer::with_duration(1, 10.0, 1.0).unwrap();
        buf.append(ramp_block(1, 3, 0.0).view()).unwrap();
        let err = buf.append(ramp_block(1, 11, 0.0).view()).unwrap_err();
        assert!(matches!(err, EngineError::BufferTooLarge { .. }));
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.total_written(), 3);
    }

    #[test]
    fn wrap_keeps_most_recent_samples() {
        // Capacity 10, write 25 samples in chunks; the last 10 must survive.
        let mut buf = StreamBuffer::with_duration(1, 10.0, 1.0).unwrap();
        for k in 0..5 {
            buf.append(ramp_block(1, 5, (k * 5) as f32).view()).unwrap();
        }
        let latest = buf.latest(10).unwrap();
        let expected: Vec<f32> = (15..25).map(|v| v as f32).collect();
        assert_eq!(latest.row(0).to_vec(), expected);
        assert_eq!(buf.total_written(), 25);
        assert_eq!(buf.remaining_capacity(), 0);
    }

    #[test]
    fn sliding_windows_emit_each_start_exactly_once() {
        // fs=250, window=500, step=250, 1500 samples in 5-sample chunks
        // → starts 0, 250, 500, 750, 1000.
        let mut buf = StreamBuffer::with_duration(1, 250.0, 10.0).unwrap();
        let mut starts = Vec::new();
        let mut written = 0u64;
        while written < 1500 {
            buf.append(ramp_block(1, 5, written as f32).view()).unwrap();
            written += 5;
            for w in buf.take_windows(500, 250) {
                starts.push(w.start_index);
                assert_eq!(w.num_samples(), 500);
                assert_eq!(w.data[[0, 0]], w.start_index as f32);
            }
        }
        assert_eq!(starts, vec![0, 250, 500, 750, 1000]);
        // Idempotent: nothing more until new data arrives.
        assert!(buf.take_windows(500, 250).is_empty());
    }

    #[test]
    fn windows_larger_than_content_yield_nothing() {
        let mut buf = StreamBuffer::with_duration(1, 250.0, 4.0).unwrap();
        buf.append(ramp_block(1, 100, 0.0).view()).unwrap();
        assert!(buf.take_windows(500, 250).is_empty());
    }

    #[test]
    fn overflow_advances_window_cursor_along_step_grid() {
        let mut buf = StreamBuffer::with_duration(1, 10.0, 1.0).unwrap();
        // Fill far past capacity without pulling windows.
        for k in 0..10 {
            buf.append(ramp_block(1, 10, (k * 10) as f32).view()).unwrap();
        }
        // Oldest held sample is index 90; cursor must skip to the first grid
        // start inside the buffer.
        let windows = buf.take_windows(5, 5);
        assert_eq!(windows.first().unwrap().start_index, 90);
        let starts: Vec<u64> = windows.iter().map(|w| w.start_index).collect();
        assert_eq!(starts, vec![90, 95]);
    }

    #[test]
    fn timestamps_extrapolate_from_reference() {
        let mut buf = StreamBuffer::with_duration(1, 100.0, 1.0).unwrap();
        let frame = SampleFrame {
            timestamp: 5.0,
            channels: vec![1.0],
            sample_index: 0,
            aux: None,
            marker: None,
        };
        buf.push_frame(&frame).unwrap();
        // 50 samples later at 100 Hz → +0.5 s.
        assert!((buf.estimate_timestamp(50) - 5.5).abs() < 1e-9);
    }

    #[test]
    fn clear_resets_all_accounting() {
        let mut buf = StreamBuffer::with_duration(2, 10.0, 1.0).unwrap();
        buf.append(ramp_block(2, 8, 0.0).view()).unwrap();
        buf.clear();
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.total_written(), 0);
        assert!(buf.latest(1).is_none());
    }
}
