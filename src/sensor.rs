//! # Sensor Collaborators
//!
//! Narrow interfaces to the physical front-ends. The capture path only asks for
//! one reading per firing; everything about buses and drivers lives behind
//! these traits.
//!
//! A sensor that is absent or momentarily unreadable returns `None`. The
//! sampler still fires on schedule and writes a zero placeholder.

use crate::clock::SharedClock;
use std::f32::consts::TAU;

/// Two-lead ECG analog front-end, readings in millivolts
pub trait EcgFrontEnd: Send {
    fn is_available(&self) -> bool;

    /// Lead I and lead II voltages
    fn read_leads(&mut self) -> Option<(f32, f32)>;
}

/// Three-axis accelerometer, readings in m/s²
pub trait Accelerometer: Send {
    fn is_available(&self) -> bool;

    fn read_axes(&mut self) -> Option<[f32; 3]>;
}

/// Stand-in for hardware that was not detected at init
pub struct Absent;

impl EcgFrontEnd for Absent {
    fn is_available(&self) -> bool {
        false
    }

    fn read_leads(&mut self) -> Option<(f32, f32)> {
        None
    }
}

impl Accelerometer for Absent {
    fn is_available(&self) -> bool {
        false
    }

    fn read_axes(&mut self) -> Option<[f32; 3]> {
        None
    }
}

/// Synthetic sinus rhythm for running without an analog front-end.
///
/// Produces a P-QRS-T shaped trace from Gaussian bumps at a fixed heart rate.
pub struct SyntheticEcg {
    clock: SharedClock,
    beat_period_s: f32,
}

impl SyntheticEcg {
    pub fn new(clock: SharedClock, heart_rate_bpm: f32) -> Self {
        Self {
            clock,
            beat_period_s: 60.0 / heart_rate_bpm.max(1.0),
        }
    }

    fn lead_ii(&self, t: f32) -> f32 {
        let phase = (t % self.beat_period_s) / self.beat_period_s;
        // (centre, width, amplitude mV) for P, Q, R, S, T
        const WAVES: [(f32, f32, f32); 5] = [
            (0.20, 0.025, 0.15),
            (0.36, 0.008, -0.10),
            (0.38, 0.010, 1.20),
            (0.40, 0.008, -0.25),
            (0.65, 0.045, 0.30),
        ];
        WAVES
            .iter()
            .map(|&(centre, width, amp)| {
                let d = (phase - centre) / width;
                amp * (-0.5 * d * d).exp()
            })
            .sum()
    }
}

impl EcgFrontEnd for SyntheticEcg {
    fn is_available(&self) -> bool {
        true
    }

    fn read_leads(&mut self) -> Option<(f32, f32)> {
        let t = self.clock.now().as_secs_f32();
        let lead_ii = self.lead_ii(t);
        Some((lead_ii * 0.6, lead_ii))
    }
}

/// Synthetic accelerometer: gravity on Z plus slow breathing sway
pub struct SyntheticImu {
    clock: SharedClock,
}

impl SyntheticImu {
    pub fn new(clock: SharedClock) -> Self {
        Self { clock }
    }
}

impl Accelerometer for SyntheticImu {
    fn is_available(&self) -> bool {
        true
    }

    fn read_axes(&mut self) -> Option<[f32; 3]> {
        let t = self.clock.now().as_secs_f32();
        let sway = (TAU * 0.25 * t).sin();
        Some([0.15 * sway, 0.05 * sway, 9.81 + 0.1 * sway])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    #[test]
    fn test_absent_sensors_report_none() {
        let mut absent = Absent;
        assert!(!EcgFrontEnd::is_available(&absent));
        assert!(absent.read_leads().is_none());
        assert!(absent.read_axes().is_none());
    }

    #[test]
    fn test_synthetic_ecg_has_r_peak() {
        let clock = ManualClock::new(0);
        let mut ecg = SyntheticEcg::new(clock.clone(), 60.0);

        let mut peak = f32::MIN;
        for _ in 0..1000 {
            let (_, lead_ii) = ecg.read_leads().unwrap();
            peak = peak.max(lead_ii);
            clock.advance(Duration::from_millis(1));
        }
        assert!(peak > 1.0 && peak < 1.5, "peak {}", peak);
    }

    #[test]
    fn test_synthetic_imu_reads_gravity() {
        let clock = ManualClock::new(0);
        let mut imu = SyntheticImu::new(clock);
        let [x, _, z] = imu.read_axes().unwrap();
        assert!(x.abs() < 0.2);
        assert!((z - 9.81).abs() < 0.2);
    }
}
