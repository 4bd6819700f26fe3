//! # Sample Clock & Encoder
//!
//! Decides when each of the two channels is due and turns one sensor reading
//! into one fixed-width record.
//!
//! ## Scheduling
//! Each channel keeps an origin and a firing count. The next due time is
//! `origin + fired / rate`, so a late poll never pushes later firings back:
//! the missed firings are emitted on the next poll, in due-time order across
//! both channels.
//!
//! ## Encoding
//! Physical units are scaled to i16 counts (ECG 6553.6 counts/mV, acceleration
//! 2048 counts per g) and saturate at the i16 bounds instead of wrapping.

use crate::sensor::{Accelerometer, EcgFrontEnd};
use std::time::Duration;

pub const ECG_SCALE_COUNTS_PER_MV: f32 = 6553.6;
pub const ACCEL_SCALE_COUNTS_PER_MS2: f32 = 2048.0 / 9.81;

pub const ECG_RECORD_SIZE: usize = 6;
pub const IMU_RECORD_SIZE: usize = 6;

const NANOS_PER_SECOND: u128 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Ecg,
    Imu,
}

/// Three ECG leads in counts: I, II and III = II - I
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EcgRecord {
    pub lead_i: i16,
    pub lead_ii: i16,
    pub lead_iii: i16,
}

impl EcgRecord {
    pub fn from_millivolts(lead_i: f32, lead_ii: f32) -> Self {
        Self {
            lead_i: scale_to_i16(lead_i, ECG_SCALE_COUNTS_PER_MV),
            lead_ii: scale_to_i16(lead_ii, ECG_SCALE_COUNTS_PER_MV),
            lead_iii: scale_to_i16(lead_ii - lead_i, ECG_SCALE_COUNTS_PER_MV),
        }
    }

    pub fn to_bytes(&self) -> [u8; ECG_RECORD_SIZE] {
        pack3([self.lead_i, self.lead_ii, self.lead_iii])
    }
}

/// Accelerometer axes in counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImuRecord {
    pub accel_x: i16,
    pub accel_y: i16,
    pub accel_z: i16,
}

impl ImuRecord {
    pub fn from_ms2(axes: [f32; 3]) -> Self {
        Self {
            accel_x: scale_to_i16(axes[0], ACCEL_SCALE_COUNTS_PER_MS2),
            accel_y: scale_to_i16(axes[1], ACCEL_SCALE_COUNTS_PER_MS2),
            accel_z: scale_to_i16(axes[2], ACCEL_SCALE_COUNTS_PER_MS2),
        }
    }

    pub fn to_bytes(&self) -> [u8; IMU_RECORD_SIZE] {
        pack3([self.accel_x, self.accel_y, self.accel_z])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleRecord {
    Ecg(EcgRecord),
    Imu(ImuRecord),
}

/// `as` saturates at the i16 bounds and maps NaN to 0
pub fn scale_to_i16(value: f32, scale: f32) -> i16 {
    (value * scale) as i16
}

fn pack3(values: [i16; 3]) -> [u8; 6] {
    let mut out = [0u8; 6];
    for (chunk, value) in out.chunks_exact_mut(2).zip(values) {
        chunk.copy_from_slice(&value.to_le_bytes());
    }
    out
}

/// Fixed-rate schedule for one channel
#[derive(Debug, Clone)]
pub struct ChannelSchedule {
    rate_hz: u16,
    origin: Duration,
    fired: u64,
}

impl ChannelSchedule {
    pub fn new(rate_hz: u16) -> Self {
        Self {
            rate_hz: rate_hz.max(1),
            origin: Duration::ZERO,
            fired: 0,
        }
    }

    pub fn reset(&mut self, origin: Duration) {
        self.origin = origin;
        self.fired = 0;
    }

    pub fn rate_hz(&self) -> u16 {
        self.rate_hz
    }

    pub fn next_due(&self) -> Duration {
        let offset = self.fired as u128 * NANOS_PER_SECOND / self.rate_hz as u128;
        self.origin + Duration::from_nanos(offset as u64)
    }

    fn advance(&mut self) {
        self.fired += 1;
    }
}

/// Interleaves the two channel schedules
#[derive(Debug, Clone)]
pub struct SampleClock {
    ecg: ChannelSchedule,
    imu: ChannelSchedule,
}

impl SampleClock {
    pub fn new(ecg_rate_hz: u16, imu_rate_hz: u16) -> Self {
        Self {
            ecg: ChannelSchedule::new(ecg_rate_hz),
            imu: ChannelSchedule::new(imu_rate_hz),
        }
    }

    /// Restart both schedules with their first firing at `origin`
    pub fn start(&mut self, origin: Duration) {
        self.ecg.reset(origin);
        self.imu.reset(origin);
    }

    pub fn rates(&self) -> (u16, u16) {
        (self.ecg.rate_hz(), self.imu.rate_hz())
    }

    /// Returns the channel whose firing is due earliest, if any is due at
    /// `now` and strictly before `end`. Each call consumes one firing; call
    /// repeatedly until `None` to catch up after a late poll.
    pub fn next_firing(&mut self, now: Duration, end: Duration) -> Option<Channel> {
        let ecg_due = self.ecg.next_due();
        let imu_due = self.imu.next_due();
        let (channel, due) = if ecg_due <= imu_due {
            (Channel::Ecg, ecg_due)
        } else {
            (Channel::Imu, imu_due)
        };

        if due > now || due >= end {
            return None;
        }

        match channel {
            Channel::Ecg => self.ecg.advance(),
            Channel::Imu => self.imu.advance(),
        }
        Some(channel)
    }
}

/// Reads the sensor for a firing channel and encodes the result
pub struct SampleEncoder {
    ecg: Box<dyn EcgFrontEnd>,
    imu: Box<dyn Accelerometer>,
}

impl SampleEncoder {
    pub fn new(ecg: Box<dyn EcgFrontEnd>, imu: Box<dyn Accelerometer>) -> Self {
        if !ecg.is_available() {
            log::warn!("ECG front-end unavailable, recording zero placeholders");
        }
        if !imu.is_available() {
            log::warn!("Accelerometer unavailable, recording zero placeholders");
        }
        Self { ecg, imu }
    }

    pub fn sample(&mut self, channel: Channel) -> SampleRecord {
        match channel {
            Channel::Ecg => {
                let (lead_i, lead_ii) = self.ecg.read_leads().unwrap_or((0.0, 0.0));
                SampleRecord::Ecg(EcgRecord::from_millivolts(lead_i, lead_ii))
            }
            Channel::Imu => {
                let axes = self.imu.read_axes().unwrap_or([0.0; 3]);
                SampleRecord::Imu(ImuRecord::from_ms2(axes))
            }
        }
    }
}
