use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use tokio::{task::JoinHandle, time::interval};

pub static METER: Meter = Meter::new();

/// Frame counters, reset by every read.
#[derive(Default)]
pub struct Meter {
    received_frames: AtomicU64,
    detected_frames: AtomicU64,
    dropped_frames: AtomicU64,
}

impl Meter {
    pub const fn new() -> Meter {
        Meter {
            received_frames: AtomicU64::new(0),
            detected_frames: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
        }
    }

    pub fn tick_received(&self) {
        self.received_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_detected(&self) {
        self.detected_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_dropped(&self, count: u64) {
        self.dropped_frames.fetch_add(count, Ordering::Relaxed);
    }

    pub fn get_reset_received(&self) -> u64 {
        self.received_frames.swap(0, Ordering::Relaxed)
    }

    pub fn get_reset_detected(&self) -> u64 {
        self.detected_frames.swap(0, Ordering::Relaxed)
    }

    pub fn get_reset_dropped(&self) -> u64 {
        self.dropped_frames.swap(0, Ordering::Relaxed)
    }
}

pub fn spawn_meter_logger() -> JoinHandle<()> {
    tokio::spawn(async {
        let mut log_interval = interval(Duration::from_secs(2));
        log_interval.tick().await;

        loop {
            let start = Instant::now();
            log_interval.tick().await;

            let received = METER.get_reset_received();
            let detected = METER.get_reset_detected();
            let dropped = METER.get_reset_dropped();
            let elapsed = start.elapsed().as_secs_f32();

            if received > 0 {
                log::info!("Received frames per second: {:.2}", received as f32 / elapsed);
            }
            if detected > 0 {
                log::info!("Detected frames per second: {:.2}", detected as f32 / elapsed);
            }
            if dropped > 0 {
                log::info!("Dropped {dropped} frames behind inference");
            }
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_counters_reset_on_read() {
        let meter = Meter::new();
        meter.tick_received();
        meter.tick_received();
        meter.add_dropped(3);

        assert_eq!(meter.get_reset_received(), 2);
        assert_eq!(meter.get_reset_received(), 0);
        assert_eq!(meter.get_reset_detected(), 0);
        assert_eq!(meter.get_reset_dropped(), 3);
    }
}
