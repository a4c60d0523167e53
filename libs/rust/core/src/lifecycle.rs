//! Service bootstrap finite state machine.
//!
//! Phases:
//! - LoadConfig
//! - OpenStore
//! - RegisterModels
//! - Serving
//!
//! Tracks how long each phase took and offers readiness evaluation.

use std::time::{Instant, Duration};
use serde::{Serialize, Deserialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BootstrapPhase { LoadConfig, OpenStore, RegisterModels, Serving }

#[derive(Debug)]
pub struct BootstrapState {
    phase: BootstrapPhase,
    started_at: Instant,
    phase_started_at: Instant,
    phase_durations: Vec<(BootstrapPhase, Duration)>,
}

impl Default for BootstrapState {
    fn default() -> Self { Self::new() }
}

impl BootstrapState {
    pub fn new() -> Self { Self { phase: BootstrapPhase::LoadConfig, started_at: Instant::now(), phase_started_at: Instant::now(), phase_durations: Vec::new() } }
    pub fn phase(&self) -> BootstrapPhase { self.phase }
    pub fn advance(&mut self) {
        let now = Instant::now();
        let dur = now - self.phase_started_at;
        self.phase_durations.push((self.phase, dur));
        let from = self.phase;
        self.phase = match self.phase { BootstrapPhase::LoadConfig => BootstrapPhase::OpenStore, BootstrapPhase::OpenStore => BootstrapPhase::RegisterModels, BootstrapPhase::RegisterModels => BootstrapPhase::Serving, BootstrapPhase::Serving => BootstrapPhase::Serving };
        self.phase_started_at = now;
        tracing::info!(?from, to=?self.phase, elapsed_ms = dur.as_millis() as u64, "bootstrap phase complete");
    }
    pub fn is_ready(&self) -> bool { self.phase == BootstrapPhase::Serving }
    pub fn total_elapsed(&self) -> Duration { self.started_at.elapsed() }
    pub fn durations(&self) -> &[(BootstrapPhase, Duration)] { &self.phase_durations }
}
