use ash::vk;

use super::error::Result;
use super::Device;

/// Number of timestamp queries used per frame: top and bottom of pipe.
pub const QUERY_COUNT: u32 = 2;

/// Measures whole-frame GPU time with a pair of timestamps.
#[derive(Debug, Default, Clone, Copy)]
pub struct GpuTimer {
    last_ms: Option<f64>,
}

impl GpuTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin<D: Device>(&self, device: &D, cmd: vk::CommandBuffer) {
        device.cmd_reset_timestamps(cmd, QUERY_COUNT);
        device.cmd_write_timestamp(cmd, vk::PipelineStageFlags::TOP_OF_PIPE, 0);
    }

    pub fn end<D: Device>(&self, device: &D, cmd: vk::CommandBuffer) {
        device.cmd_write_timestamp(cmd, vk::PipelineStageFlags::BOTTOM_OF_PIPE, 1);
    }

    /// Reads both stamps back. Only valid after the frame finished executing.
    pub fn resolve<D: Device>(&mut self, device: &D) -> Result<f64> {
        let data = device.timestamp_results(QUERY_COUNT)?;
        let (t0, t1) = match data.as_slice() {
            [t0, t1, ..] => (*t0, *t1),
            _ => (0, 0),
        };
        let ms = ticks_to_ms(t0, t1, device.timestamp_period());
        self.last_ms = Some(ms);
        Ok(ms)
    }

    pub fn last_ms(&self) -> Option<f64> {
        self.last_ms
    }
}

/// `(t1 - t0) * period * 1e-6`, with `period` in nanoseconds per tick.
pub fn ticks_to_ms(t0: u64, t1: u64, period: f32) -> f64 {
    (t1 as f64 - t0 as f64) * period as f64 * 1e-6
}
