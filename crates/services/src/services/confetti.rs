//! Success confetti: a fixed 3-second emission cycle on a 250 ms cadence.
//!
//! Each cycle computes its deadline once, then on every tick spawns a
//! linearly decaying number of particles from two symmetric bands at the
//! top of a 0-100 plane. Every particle runs its own frame loop until it
//! fades out or falls past the bottom edge; the cycle ending never cuts a
//! live particle short. Re-triggering starts an independent overlapping
//! cycle.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use rand::Rng;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Full emission cycle length.
pub const CYCLE_MS: u64 = 3000;
/// Emission burst cadence.
pub const EMIT_EVERY_MS: u64 = 250;
/// Particles per band-burst at the start of a cycle.
pub const PEAK_BURST: f64 = 50.0;
/// Downward bias added to `vy` every frame.
pub const GRAVITY: f64 = 2.0;
/// Opacity lost per frame. A fresh particle lives at most 50 frames.
pub const FADE_PER_FRAME: f64 = 0.02;
/// Base speed drawn at spawn, plus up to [`SPEED_JITTER`] on top.
pub const BASE_SPEED: f64 = 30.0;
pub const SPEED_JITTER: f64 = 10.0;
/// Frame clock for particle updates (~60 fps).
pub const FRAME_MS: u64 = 16;

pub const PALETTE: [&str; 6] = [
    "#f44336", "#2196f3", "#4caf50", "#ffeb3b", "#9c27b0", "#ff9800",
];

/// Spawn bands at the top of the plane, expressed as x ranges.
pub const LEFT_BAND: (f64, f64) = (10.0, 30.0);
pub const RIGHT_BAND: (f64, f64) = (70.0, 90.0);

/// One ephemeral visual element on the 0-100 plane.
#[derive(Debug, Clone, PartialEq)]
pub struct Particle {
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
    pub opacity: f64,
    pub color: &'static str,
}

impl Particle {
    /// Draw a particle from a spawn band: position inside the band and
    /// slightly above the top edge, speed and direction drawn once.
    pub fn spawn(band: (f64, f64), rng: &mut impl Rng) -> Self {
        let speed = BASE_SPEED + rng.gen_range(0.0..SPEED_JITTER);
        let angle = rng.gen_range(0.0..std::f64::consts::TAU);
        Self {
            x: rng.gen_range(band.0..=band.1),
            y: rng.gen_range(-20.0..0.0),
            vx: speed * angle.cos(),
            vy: speed * angle.sin(),
            opacity: 1.0,
            color: PALETTE[rng.gen_range(0..PALETTE.len())],
        }
    }

    /// One frame: advance by velocity, add gravity, fade.
    pub fn step(&mut self) {
        self.x += self.vx;
        self.y += self.vy;
        self.vy += GRAVITY;
        self.opacity -= FADE_PER_FRAME;
    }

    /// A particle leaves the stage the first frame this holds.
    pub fn finished(&self) -> bool {
        self.opacity <= 0.0 || self.y >= 100.0
    }
}

/// How many particles one band emits at a tick with `time_left` remaining.
/// Decays linearly from [`PEAK_BURST`] to zero over the cycle.
pub fn burst_size(time_left: Duration) -> usize {
    let frac = time_left.as_millis() as f64 / CYCLE_MS as f64;
    (PEAK_BURST * frac).floor() as usize
}

/// The render surface: live particles plus a monotonic spawn counter.
/// Pages draw from [`Stage::snapshot`]; only the scheduler mutates it.
#[derive(Default)]
pub struct Stage {
    particles: Mutex<HashMap<u64, Particle>>,
    next_id: AtomicU64,
    spawned: AtomicU64,
}

impl Stage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<Particle> {
        self.particles
            .lock()
            .expect("stage lock")
            .values()
            .cloned()
            .collect()
    }

    /// Number of particles currently on the stage.
    pub fn live(&self) -> usize {
        self.particles.lock().expect("stage lock").len()
    }

    /// Total particles ever mounted, across all cycles.
    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    fn mount(&self, particle: Particle) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.spawned.fetch_add(1, Ordering::Relaxed);
        self.particles.lock().expect("stage lock").insert(id, particle);
        id
    }

    fn update(&self, id: u64, particle: Particle) {
        self.particles.lock().expect("stage lock").insert(id, particle);
    }

    fn remove(&self, id: u64) {
        self.particles.lock().expect("stage lock").remove(&id);
    }
}

/// Starts emission cycles against one shared stage.
#[derive(Clone)]
pub struct ConfettiScheduler {
    stage: Arc<Stage>,
}

impl ConfettiScheduler {
    pub fn new(stage: Arc<Stage>) -> Self {
        Self { stage }
    }

    pub fn stage(&self) -> &Arc<Stage> {
        &self.stage
    }

    /// Start one independent emission cycle. Multiple cycles overlap
    /// without coordination.
    ///
    /// The returned token tears down the emission timer early; particles
    /// already in the air still run to natural completion.
    pub fn burst(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let stage = Arc::clone(&self.stage);
        let cancel = token.clone();
        tokio::spawn(run_cycle(stage, cancel));
        token
    }
}

async fn run_cycle(stage: Arc<Stage>, cancel: CancellationToken) {
    let started = Instant::now();
    let deadline = started + Duration::from_millis(CYCLE_MS);
    let period = Duration::from_millis(EMIT_EVERY_MS);
    let mut ticks = time::interval_at(started + period, period);
    debug!("confetti cycle armed");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("confetti cycle cancelled");
                break;
            }
            _ = ticks.tick() => {}
        }
        let time_left = deadline.saturating_duration_since(Instant::now());
        if time_left.is_zero() {
            break;
        }
        emit(&stage, burst_size(time_left));
    }
    debug!(spawned = stage.spawned(), "confetti cycle done");
}

/// Two independent bursts, one per band. Each particle gets its own frame
/// loop so the scheduler never has to track it again.
fn emit(stage: &Arc<Stage>, count: usize) {
    let mut rng = rand::thread_rng();
    for band in [LEFT_BAND, RIGHT_BAND] {
        for _ in 0..count {
            let particle = Particle::spawn(band, &mut rng);
            let id = stage.mount(particle.clone());
            tokio::spawn(drive_particle(Arc::clone(stage), id, particle));
        }
    }
}

async fn drive_particle(stage: Arc<Stage>, id: u64, mut particle: Particle) {
    let mut frames = time::interval(Duration::from_millis(FRAME_MS));
    // The first interval tick completes immediately; the particle's first
    // step belongs to the next frame.
    frames.tick().await;
    loop {
        frames.tick().await;
        particle.step();
        if particle.finished() {
            stage.remove(id);
            break;
        }
        stage.update(id, particle.clone());
    }
}
