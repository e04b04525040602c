//! Barge-in mediation between the three parties.
//!
//! The manager is a pure state machine driven by speech edges: every inbound
//! call takes an explicit `Instant` and returns the [`FloorAction`]s the
//! session must carry out (duck targets, stop their playback, record
//! events). Timer scheduling stays with the caller — when a graceful
//! barge-in is pending, [`BargeInManager::pending_deadline`] says when to
//! call [`BargeInManager::on_grace_elapsed`].
//!
//! ## Modes
//!
//! - `immediate` — the interruption lands in the same call: start and
//!   complete events fire together and the interrupted parties stop
//!   speaking. Ducking is untouched (the interruption itself ends the
//!   audio).
//! - `graceful` (default) — targets are ducked right away; the interruption
//!   executes only if the interrupter is still speaking after the grace
//!   period. A short burst cancels it and restores gain.
//! - `sentence_complete` — like graceful with a longer ceiling; an external
//!   natural-boundary hint ([`BargeInManager::on_sentence_boundary`]) may
//!   complete it earlier.
//! - `disabled` — speech edges only update bookkeeping.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::Priority;
use crate::session::SpeakerId;

/// Bounded event history length.
const HISTORY_LIMIT: usize = 100;

// ── Configuration ──────────────────────────────────────────────────

/// Interruption handling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BargeInMode {
    Immediate,
    Graceful,
    SentenceComplete,
    Disabled,
}

/// Configuration for [`BargeInManager`].
#[derive(Debug, Clone)]
pub struct BargeInConfig {
    pub mode: BargeInMode,
    /// Delay before a graceful interruption takes effect.
    pub grace_period_ms: u64,
    /// Hard ceiling for `sentence_complete` mode.
    pub sentence_completion_max_ms: u64,
    /// Duck interrupted parties while a barge-in is pending.
    pub ducking_enabled: bool,
    /// How far ahead of the interruption the duck should land.
    pub ducking_lead_time_ms: u64,
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self {
            mode: BargeInMode::Graceful,
            grace_period_ms: 300,
            sentence_completion_max_ms: 2000,
            ducking_enabled: true,
            ducking_lead_time_ms: 150,
        }
    }
}

// ── State ──────────────────────────────────────────────────────────

/// Per-speaker floor state.
#[derive(Debug, Clone)]
pub struct SpeakerEntry {
    pub speaking: bool,
    pub priority: Priority,
    pub started_at: Option<Instant>,
    pub last_activity_at: Option<Instant>,
    pub allow_interruption: bool,
}

impl Default for SpeakerEntry {
    fn default() -> Self {
        Self {
            speaking: false,
            priority: Priority::Medium,
            started_at: None,
            last_activity_at: None,
            allow_interruption: true,
        }
    }
}

/// A recorded interruption event.
#[derive(Debug, Clone, Serialize)]
pub struct BargeInEvent {
    pub kind: BargeInEventKind,
    /// Milliseconds since the manager was created.
    pub at_ms: u64,
    pub interrupter: SpeakerId,
    pub interrupted: Vec<SpeakerId>,
    pub mode: BargeInMode,
    pub confidence: f64,
    pub grace_period_used: bool,
    pub ducking_applied: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BargeInEventKind {
    Start,
    Complete,
    Cancelled,
}

/// What the session must do in response to a speech edge.
#[derive(Debug, Clone)]
pub enum FloorAction {
    /// Duck (or restore) the listed speakers.
    Ducking {
        targets: Vec<SpeakerId>,
        active: bool,
    },
    /// An interruption began executing.
    Started(BargeInEvent),
    /// An interruption finished; targets must stop playback.
    Completed(BargeInEvent),
    /// A pending interruption was abandoned.
    Cancelled(BargeInEvent),
}

#[derive(Debug, Clone)]
struct PendingBargeIn {
    interrupter: SpeakerId,
    confidence: f64,
    targets: Vec<SpeakerId>,
    deadline: Instant,
    ducking_applied: bool,
}

/// Aggregate statistics derived from the bounded history.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BargeInStats {
    pub total_completions: usize,
    pub completions_by_mode: HashMap<String, usize>,
    pub average_confidence: f64,
    pub grace_period_usage_rate: f64,
}

// ── Manager ────────────────────────────────────────────────────────

/// Mediates overlapping speech; see module docs.
pub struct BargeInManager {
    config: BargeInConfig,
    epoch: Instant,
    speakers: HashMap<SpeakerId, SpeakerEntry>,
    pending: Option<PendingBargeIn>,
    history: VecDeque<BargeInEvent>,
}

impl BargeInManager {
    pub fn new(config: BargeInConfig) -> Self {
        Self {
            config,
            epoch: Instant::now(),
            speakers: HashMap::new(),
            pending: None,
            history: VecDeque::with_capacity(HISTORY_LIMIT),
        }
    }

    /// A speaker began producing audio.
    pub fn on_speech_start(
        &mut self,
        speaker: SpeakerId,
        confidence: f64,
        now: Instant,
    ) -> Vec<FloorAction> {
        {
            let entry = self.entry_mut(speaker);
            entry.speaking = true;
            entry.started_at = Some(now);
            entry.last_activity_at = Some(now);
        }

        if self.config.mode == BargeInMode::Disabled {
            return Vec::new();
        }

        let active_others: Vec<SpeakerId> = SpeakerId::all()
            .into_iter()
            .filter(|&s| s != speaker && self.is_speaking(s))
            .collect();
        if active_others.is_empty() {
            return Vec::new();
        }

        let targets: Vec<SpeakerId> = active_others
            .into_iter()
            .filter(|&s| self.entry(s).map_or(true, |e| e.allow_interruption))
            .collect();
        if targets.is_empty() {
            return Vec::new();
        }

        if !self.authorized(speaker, &targets) {
            tracing::debug!(
                interrupter = %speaker,
                ?targets,
                "barge-in attempt below target priority, ignoring"
            );
            return Vec::new();
        }

        match self.config.mode {
            BargeInMode::Immediate => self.execute(speaker, confidence, targets, now, false, false),
            BargeInMode::Graceful | BargeInMode::SentenceComplete => {
                let timeout = if self.config.mode == BargeInMode::Graceful {
                    self.config.grace_period_ms
                } else {
                    self.config.sentence_completion_max_ms
                };
                let ducking_applied = self.config.ducking_enabled;
                let mut actions = Vec::new();
                if ducking_applied {
                    actions.push(FloorAction::Ducking {
                        targets: targets.clone(),
                        active: true,
                    });
                }
                tracing::debug!(
                    interrupter = %speaker,
                    ?targets,
                    timeout_ms = timeout,
                    "barge-in pending"
                );
                self.pending = Some(PendingBargeIn {
                    interrupter: speaker,
                    confidence,
                    targets,
                    deadline: now + Duration::from_millis(timeout),
                    ducking_applied,
                });
                actions
            }
            BargeInMode::Disabled => unreachable!(),
        }
    }

    /// A speaker stopped producing audio. Cancels a pending barge-in whose
    /// interrupter just went quiet.
    pub fn on_speech_end(
        &mut self,
        speaker: SpeakerId,
        confidence: f64,
        now: Instant,
    ) -> Vec<FloorAction> {
        {
            let entry = self.entry_mut(speaker);
            entry.speaking = false;
            entry.last_activity_at = Some(now);
        }

        let cancels = matches!(&self.pending, Some(p) if p.interrupter == speaker);
        if !cancels {
            return Vec::new();
        }
        let pending = self.pending.take().expect("pending checked above");

        let event = BargeInEvent {
            kind: BargeInEventKind::Cancelled,
            at_ms: self.elapsed_ms(now),
            interrupter: pending.interrupter,
            interrupted: pending.targets.clone(),
            mode: self.config.mode,
            confidence,
            grace_period_used: false,
            ducking_applied: pending.ducking_applied,
        };
        self.record(event.clone());

        let mut actions = vec![FloorAction::Cancelled(event)];
        if pending.ducking_applied {
            actions.push(FloorAction::Ducking {
                targets: pending.targets,
                active: false,
            });
        }
        actions
    }

    /// When the caller should fire [`Self::on_grace_elapsed`].
    pub fn pending_deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.deadline)
    }

    /// Grace (or sentence-ceiling) timer expiry. Executes the pending
    /// interruption if the interrupter is still speaking.
    pub fn on_grace_elapsed(&mut self, now: Instant) -> Vec<FloorAction> {
        let Some(pending) = self.pending.take() else {
            return Vec::new();
        };
        if now < pending.deadline {
            // Early wakeup: not due yet.
            self.pending = Some(pending);
            return Vec::new();
        }

        if !self.is_speaking(pending.interrupter) {
            // The cancel path normally handles this; clean up defensively if
            // the end edge never reached us.
            let event = BargeInEvent {
                kind: BargeInEventKind::Cancelled,
                at_ms: self.elapsed_ms(now),
                interrupter: pending.interrupter,
                interrupted: pending.targets.clone(),
                mode: self.config.mode,
                confidence: pending.confidence,
                grace_period_used: false,
                ducking_applied: pending.ducking_applied,
            };
            self.record(event.clone());
            let mut actions = vec![FloorAction::Cancelled(event)];
            if pending.ducking_applied {
                actions.push(FloorAction::Ducking {
                    targets: pending.targets,
                    active: false,
                });
            }
            return actions;
        }

        self.execute(
            pending.interrupter,
            pending.confidence,
            pending.targets,
            now,
            true,
            pending.ducking_applied,
        )
    }

    /// External hint that a target reached a natural sentence boundary.
    /// Completes a pending `sentence_complete` barge-in ahead of the
    /// ceiling.
    pub fn on_sentence_boundary(&mut self, speaker: SpeakerId, now: Instant) -> Vec<FloorAction> {
        if self.config.mode != BargeInMode::SentenceComplete {
            return Vec::new();
        }
        let applies = matches!(&self.pending, Some(p) if p.targets.contains(&speaker));
        if !applies {
            return Vec::new();
        }
        let pending = self.pending.take().expect("pending checked above");
        if !self.is_speaking(pending.interrupter) {
            return Vec::new();
        }
        self.execute(
            pending.interrupter,
            pending.confidence,
            pending.targets,
            now,
            false,
            pending.ducking_applied,
        )
    }

    /// Set an agent's interruption priority.
    pub fn set_priority(&mut self, speaker: SpeakerId, priority: Priority) {
        self.entry_mut(speaker).priority = priority;
    }

    /// Allow or protect a speaker from interruption.
    pub fn set_allow_interruption(&mut self, speaker: SpeakerId, allow: bool) {
        self.entry_mut(speaker).allow_interruption = allow;
    }

    pub fn is_speaking(&self, speaker: SpeakerId) -> bool {
        self.entry(speaker).map_or(false, |e| e.speaking)
    }

    /// Recorded events, oldest first, bounded to 100.
    pub fn history(&self) -> impl Iterator<Item = &BargeInEvent> {
        self.history.iter()
    }

    /// Statistics over completed interruptions.
    pub fn stats(&self) -> BargeInStats {
        let completions: Vec<&BargeInEvent> = self
            .history
            .iter()
            .filter(|e| e.kind == BargeInEventKind::Complete)
            .collect();
        let total = completions.len();
        if total == 0 {
            return BargeInStats::default();
        }

        let mut by_mode: HashMap<String, usize> = HashMap::new();
        let mut confidence_sum = 0.0;
        let mut grace_used = 0usize;
        for event in &completions {
            let mode = serde_json::to_value(event.mode)
                .ok()
                .and_then(|v| v.as_str().map(str::to_owned))
                .unwrap_or_default();
            *by_mode.entry(mode).or_default() += 1;
            confidence_sum += event.confidence;
            if event.grace_period_used {
                grace_used += 1;
            }
        }

        BargeInStats {
            total_completions: total,
            completions_by_mode: by_mode,
            average_confidence: confidence_sum / total as f64,
            grace_period_usage_rate: grace_used as f64 / total as f64,
        }
    }

    // ── Internal ──────────────────────────────────────────────────

    /// Flip the targets off and record a start + complete pair.
    fn execute(
        &mut self,
        interrupter: SpeakerId,
        confidence: f64,
        targets: Vec<SpeakerId>,
        now: Instant,
        grace_period_used: bool,
        ducking_applied: bool,
    ) -> Vec<FloorAction> {
        for &target in &targets {
            self.entry_mut(target).speaking = false;
        }

        let base = BargeInEvent {
            kind: BargeInEventKind::Start,
            at_ms: self.elapsed_ms(now),
            interrupter,
            interrupted: targets,
            mode: self.config.mode,
            confidence,
            grace_period_used,
            ducking_applied,
        };
        let complete = BargeInEvent {
            kind: BargeInEventKind::Complete,
            ..base.clone()
        };
        self.record(base.clone());
        self.record(complete.clone());

        tracing::info!(
            interrupter = %interrupter,
            interrupted = ?complete.interrupted,
            grace = grace_period_used,
            "barge-in executed"
        );
        vec![FloorAction::Started(base), FloorAction::Completed(complete)]
    }

    fn authorized(&self, interrupter: SpeakerId, targets: &[SpeakerId]) -> bool {
        if interrupter == SpeakerId::Human {
            return true;
        }
        let level = self
            .entry(interrupter)
            .map_or(Priority::Medium.value(), |e| e.priority.value());
        targets.iter().all(|&t| level > self.priority_value(t))
    }

    fn priority_value(&self, speaker: SpeakerId) -> u8 {
        if speaker == SpeakerId::Human {
            super::HUMAN_PRIORITY
        } else {
            self.entry(speaker)
                .map_or(Priority::Medium.value(), |e| e.priority.value())
        }
    }

    fn record(&mut self, event: BargeInEvent) {
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(event);
    }

    fn elapsed_ms(&self, now: Instant) -> u64 {
        now.checked_duration_since(self.epoch)
            .map_or(0, |d| d.as_millis() as u64)
    }

    fn entry(&self, speaker: SpeakerId) -> Option<&SpeakerEntry> {
        self.speakers.get(&speaker)
    }

    fn entry_mut(&mut self, speaker: SpeakerId) -> &mut SpeakerEntry {
        self.speakers.entry(speaker).or_default()
    }
}

// ── Tests ──────────────────────────────────────────────────────────
