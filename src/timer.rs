// Frame timing and pacing

use std::time::{Duration, Instant};

/// Tracks tick boundaries, the frame counter and the pacing baseline.
#[derive(Debug)]
pub struct FrameTimer {
    frame_counter: u64,
    tick_start: Instant,
    previous_tick_start: Option<Instant>,
    since_last_tick: Duration,
    current: Duration,
    pacing: Option<Pacing>,
}

#[derive(Debug, Clone, Copy)]
struct Pacing {
    desired_fps: u32,
    baseline: Instant,
    paced_frames: u64,
}

impl Default for FrameTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameTimer {
    pub fn new() -> Self {
        Self {
            frame_counter: 0,
            tick_start: Instant::now(),
            previous_tick_start: None,
            since_last_tick: Duration::ZERO,
            current: Duration::ZERO,
            pacing: None,
        }
    }

    /// Marks the start of a tick.
    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    fn tick_at(&mut self, now: Instant) {
        if let Some(previous) = self.previous_tick_start {
            self.since_last_tick = now.saturating_duration_since(previous);
        }
        self.previous_tick_start = Some(now);
        self.tick_start = now;
    }

    /// Ends the tick and advances the frame counter.
    pub fn tock(&mut self) {
        self.current = self.tick_start.elapsed();
        self.frame_counter = self.frame_counter.wrapping_add(1);
    }

    /// Time between the starts of the last two ticks.
    pub fn elapsed_since_last_tick(&self) -> Duration {
        self.since_last_tick
    }

    /// CPU time of the last completed tick.
    pub fn elapsed_current(&self) -> Duration {
        self.current
    }

    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    pub fn frame_in_flight(&self, frames_in_flight: usize) -> usize {
        (self.frame_counter % frames_in_flight as u64) as usize
    }

    /// How long to sleep at `now` so that paced frames land on multiples of
    /// `1 / desired_fps` after the baseline. `0` disables pacing.
    pub fn pacing_delay_at(&mut self, desired_fps: u32, now: Instant) -> Duration {
        if desired_fps == 0 {
            self.pacing = None;
            return Duration::ZERO;
        }
        let period = Duration::from_secs_f64(1.0 / f64::from(desired_fps));

        let pacing = match self.pacing {
            Some(p) if p.desired_fps == desired_fps => p,
            _ => {
                log::debug!("Pacing baseline reset for {} fps", desired_fps);
                Pacing {
                    desired_fps,
                    baseline: self.tick_start,
                    paced_frames: 0,
                }
            }
        };

        let target = pacing.baseline + period.mul_f64((pacing.paced_frames + 1) as f64);
        if now > target + period {
            // Fell behind; start over instead of bursting to catch up
            self.pacing = Some(Pacing {
                desired_fps,
                baseline: now,
                paced_frames: 0,
            });
            return Duration::ZERO;
        }

        self.pacing = Some(Pacing {
            paced_frames: pacing.paced_frames + 1,
            ..pacing
        });
        target.saturating_duration_since(now)
    }

    /// Sleeps until the target time of the current frame. Returns the time slept.
    pub fn sleep_to_target_fps(&mut self, desired_fps: u32) -> Duration {
        let delay = self.pacing_delay_at(desired_fps, Instant::now());
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        delay
    }
}

/// Frames counted over at least one second of accumulated time.
#[derive(Debug, Default)]
pub struct FpsCounter {
    started: Option<Instant>,
    accumulated: Duration,
    frames: u32,
    fps: f32,
}

impl FpsCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&mut self) {
        self.started = Some(Instant::now());
    }

    pub fn tock(&mut self) {
        if let Some(started) = self.started.take() {
            self.add(started.elapsed());
        }
    }

    fn add(&mut self, frame_time: Duration) {
        self.accumulated += frame_time;
        self.frames += 1;
        if self.accumulated > Duration::from_secs(1) {
            self.fps = self.frames as f32 / self.accumulated.as_secs_f32();
            self.frames = 0;
            self.accumulated = Duration::ZERO;
        }
    }

    /// Last published value; zero until a full second has been measured.
    pub fn fps(&self) -> f32 {
        self.fps
    }
}
