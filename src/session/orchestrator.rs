//! Session orchestration.
//!
//! The [`Orchestrator`] owns the map of live sessions and the two pieces of
//! process-wide presentation state: the shared screen and the thinking
//! timer. Each [`Session`] owns its engines (VAD, command router, ducking
//! mixer, barge-in manager) plus its recorder and event log, and sits behind
//! its own async mutex — every inbound path locks the session first, so VAD
//! edges, router decisions, barge-in actions, and orb updates are serialized
//! and the event order published to the client is exactly handler order.
//!
//! ```text
//! mic audio ──▸ VAD ──edges──▸ barge-in manager ──actions──▸ duck / stop TTS
//!     │                                │
//!     ├─▸ recorder (human track)       └─▸ orb choreography
//!     └─▸ STT port ──final transcript──▸ captions ──▸ command router
//!
//! TTS chunks ──▸ ducking mixer ──▸ recorder (agent track) ──▸ audio.out
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use base64::Engine;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::audio::ducking::DuckingMixer;
use crate::audio::vad::{EnhancedVad, VadEvent};
use crate::audio::{db_to_gain, scale_pcm};
use crate::config::Config;
use crate::floor::barge_in::{BargeInManager, FloorAction};
use crate::floor::router::{CommandAction, CommandRouter, RouteDecision};
use crate::ports::{EventLogPort, LogEvent, RecorderPort, SttPort, TtsPort};
use crate::recording::event_log::{JsonlEventLog, NullEventLog};
use crate::recording::{NullRecorder, PcmRecorder};
use crate::session::events::{ClientMessage, ServerMessage};
use crate::session::{Caption, OrbState, SharedScreen, SpeakerId};

/// Captions kept per session.
const CAPTION_HISTORY: usize = 20;
/// Captions exposed in a snapshot.
const SNAPSHOT_CAPTIONS: usize = 6;
/// Hard ceiling for process shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);
/// Confidence attributed to agent speech edges (TTS is not probabilistic).
const TTS_CONFIDENCE: f64 = 0.9;

// ── Adapters ───────────────────────────────────────────────────────

/// External speech services shared by all sessions. Absent handles leave
/// the corresponding feature silently disabled.
#[derive(Default)]
pub struct Adapters {
    pub stt: Option<Arc<dyn SttPort>>,
    pub tts_host: Option<Arc<dyn TtsPort>>,
    pub tts_guest: Option<Arc<dyn TtsPort>>,
}

// ── Session ────────────────────────────────────────────────────────

/// Per-connection state. Owned by the orchestrator, locked per inbound
/// event.
struct Session {
    id: String,
    episode_id: String,
    participant: Option<String>,
    outbound: mpsc::Sender<ServerMessage>,

    vad: EnhancedVad,
    router: CommandRouter,
    mixer: Option<DuckingMixer>,
    barge_in: Option<BargeInManager>,
    tts: HashMap<SpeakerId, Arc<dyn TtsPort>>,
    recorder: Box<dyn RecorderPort>,
    event_log: Box<dyn EventLogPort>,

    active_agents: HashSet<SpeakerId>,
    human_speaking: bool,
    ducking_active: bool,
    static_duck_gain: f64,
    orb_states: HashMap<SpeakerId, OrbState>,
    orb_restore: Option<HashMap<SpeakerId, OrbState>>,
    captions: VecDeque<Caption>,
    autopilot: bool,
    pending_targets: Vec<SpeakerId>,
    last_command: Option<RouteDecision>,
    audio_seq: HashMap<SpeakerId, u64>,
    grace_timer: Option<JoinHandle<()>>,
    /// Set once any audio or caption has been persisted; blocks late
    /// episode-id rebinding.
    media_written: bool,
}

impl Session {
    async fn emit(&self, message: ServerMessage) {
        if self.outbound.send(message).await.is_err() {
            tracing::debug!(session_id = %self.id, "client channel closed, dropping message");
        }
    }

    /// Best-effort append to the event log.
    fn log(&mut self, kind: &str, data: Value) {
        let event = LogEvent::new(kind, self.id.clone()).with(data);
        if let Err(error) = self.event_log.log(event) {
            tracing::warn!(session_id = %self.id, kind, %error, "event log write failed");
        }
    }

    async fn set_orb(&mut self, speaker: SpeakerId, state: OrbState) {
        if self.orb_states.get(&speaker) == Some(&state) {
            return;
        }
        self.orb_states.insert(speaker, state);
        self.log("orb.state", json!({"speaker": speaker, "state": state}));
        self.emit(ServerMessage::Orb { speaker, state }).await;
    }

    fn snapshot(&self, shared_screen: SharedScreen) -> ServerMessage {
        ServerMessage::Snapshot {
            orb_states: self.orb_states.clone(),
            captions: self.captions.iter().take(SNAPSHOT_CAPTIONS).cloned().collect(),
            autopilot: self.autopilot,
            shared_screen,
        }
    }

    fn abort_grace_timer(&mut self) {
        if let Some(handle) = self.grace_timer.take() {
            handle.abort();
        }
    }
}

// ── Orchestrator ───────────────────────────────────────────────────

/// Process-wide owner of sessions and shared presentation state.
pub struct Orchestrator {
    config: Arc<Config>,
    adapters: Adapters,
    /// Handle back to the owning `Arc`, used when arming timer tasks.
    self_ref: std::sync::Weak<Orchestrator>,
    sessions: Mutex<HashMap<String, Arc<Mutex<Session>>>>,
    /// Outbound channels, kept separately so broadcasts never take a
    /// session lock.
    outbounds: parking_lot::Mutex<HashMap<String, mpsc::Sender<ServerMessage>>>,
    shared_screen: parking_lot::Mutex<SharedScreen>,
    thinking_timer: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(config: Arc<Config>, adapters: Adapters) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            config,
            adapters,
            self_ref: self_ref.clone(),
            sessions: Mutex::new(HashMap::new()),
            outbounds: parking_lot::Mutex::new(HashMap::new()),
            shared_screen: parking_lot::Mutex::new(SharedScreen::Conversation),
            thinking_timer: parking_lot::Mutex::new(None),
        })
    }

    /// Create a session for a new connection and emit the initial ack and
    /// snapshot. Double registration of an id is an invariant violation.
    pub async fn register(
        &self,
        session_id: &str,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(session_id) {
            bail!("session {session_id} already registered");
        }

        let episode_id = uuid::Uuid::new_v4().to_string();
        let (mut recorder, mut event_log) = self.build_sinks(&episode_id);
        if let Err(error) = event_log.start() {
            tracing::warn!(session_id, %error, "event log unavailable");
            event_log = Box::new(NullEventLog);
        }
        if let Err(error) = recorder.start() {
            tracing::warn!(session_id, %error, "recorder unavailable");
            recorder = Box::new(NullRecorder);
        }

        let enhanced = self.config.features.enhanced_audio;
        let mut tts: HashMap<SpeakerId, Arc<dyn TtsPort>> = HashMap::new();
        for (speaker, handle) in [
            (SpeakerId::Host, self.adapters.tts_host.clone()),
            (SpeakerId::Guest, self.adapters.tts_guest.clone()),
        ] {
            match handle {
                Some(port) => {
                    tts.insert(speaker, port);
                }
                None => tracing::warn!(session_id, %speaker, "no TTS adapter, agent has no voice"),
            }
        }

        let mut session = Session {
            id: session_id.to_string(),
            episode_id: episode_id.clone(),
            participant: None,
            outbound: outbound.clone(),
            vad: EnhancedVad::new(&self.config.vad_config()),
            router: CommandRouter::new(&self.config.router_config()),
            mixer: enhanced.then(|| DuckingMixer::new(self.config.ducking_config())),
            barge_in: enhanced.then(|| BargeInManager::new(self.config.barge_in_config())),
            tts,
            recorder,
            event_log,
            active_agents: HashSet::new(),
            human_speaking: false,
            ducking_active: false,
            static_duck_gain: db_to_gain(self.config.features.static_ducking_db),
            orb_states: SpeakerId::all()
                .into_iter()
                .map(|s| (s, OrbState::Idle))
                .collect(),
            orb_restore: None,
            captions: VecDeque::with_capacity(CAPTION_HISTORY),
            autopilot: false,
            pending_targets: Vec::new(),
            last_command: None,
            audio_seq: HashMap::new(),
            grace_timer: None,
            media_written: false,
        };
        session.log("session.start", json!({"episodeId": episode_id.clone()}));

        if let Some(stt) = &self.adapters.stt {
            if let Err(error) = stt.start(session_id).await {
                tracing::warn!(session_id, %error, "STT adapter failed to start");
            }
        }

        session.emit(ServerMessage::Ack {
            message: "connected".into(),
        })
        .await;
        let snapshot = session.snapshot(self.shared_screen.lock().clone());
        session.emit(snapshot).await;

        sessions.insert(session_id.to_string(), Arc::new(Mutex::new(session)));
        self.outbounds
            .lock()
            .insert(session_id.to_string(), outbound);
        tracing::info!(session_id, episode_id = %episode_id, "session registered");
        Ok(())
    }

    /// Dispatch a JSON control message from the client.
    pub async fn handle_message(&self, session_id: &str, message: ClientMessage) {
        let Some(session) = self.get(session_id).await else {
            return;
        };
        let mut s = session.lock().await;

        match message {
            ClientMessage::Hello {
                episode_id,
                participant_name,
            } => {
                if let Some(name) = participant_name {
                    tracing::info!(session_id, participant = %name, "hello");
                    s.participant = Some(name);
                }
                if let Some(episode) = episode_id {
                    self.rebind_episode(&mut s, episode);
                }
                s.emit(ServerMessage::Ack {
                    message: "hello".into(),
                })
                .await;
            }
            ClientMessage::ToggleAutopilot { enabled } => {
                s.autopilot = enabled;
                s.log("autopilot", json!({"enabled": enabled}));
                s.emit(ServerMessage::Ack {
                    message: format!("autopilot {}", if enabled { "on" } else { "off" }),
                })
                .await;
                let snapshot = s.snapshot(self.shared_screen.lock().clone());
                s.emit(snapshot).await;
            }
            ClientMessage::RequestState => {
                let snapshot = s.snapshot(self.shared_screen.lock().clone());
                s.emit(snapshot).await;
            }
        }
    }

    /// Ingest a microphone audio chunk: VAD, recorder, STT relay.
    pub async fn handle_audio(&self, session_id: &str, pcm: &[u8]) {
        let Some(session) = self.get(session_id).await else {
            return;
        };
        let mut s = session.lock().await;

        let edges = s.vad.process(pcm);

        if !pcm.is_empty() {
            if let Err(error) = s.recorder.write_audio(SpeakerId::Human, pcm) {
                tracing::warn!(session_id, %error, "recorder write failed");
            } else {
                s.media_written = true;
            }
        }

        if let Some(stt) = &self.adapters.stt {
            if let Err(error) = stt.send_audio(session_id, pcm).await {
                tracing::warn!(session_id, %error, "STT relay failed");
            }
        }

        for edge in edges {
            match edge {
                VadEvent::SpeechStart { confidence } => {
                    self.on_human_speech_start(&mut s, confidence).await;
                }
                VadEvent::SpeechEnd { confidence } => {
                    self.on_human_speech_end(&mut s, confidence).await;
                }
            }
        }
    }

    /// A finalized transcript from the STT port.
    pub async fn on_transcript(&self, session_id: &str, text: &str, is_final: bool) {
        if !is_final {
            return;
        }
        let Some(session) = self.get(session_id).await else {
            return;
        };
        let mut s = session.lock().await;

        let caption = Caption {
            id: uuid::Uuid::new_v4().to_string(),
            speaker: SpeakerId::Human,
            text: text.to_string(),
            timestamp_ms: chrono::Utc::now().timestamp_millis() as u64,
        };
        if s.captions.len() == CAPTION_HISTORY {
            s.captions.pop_back();
        }
        s.captions.push_front(caption.clone());
        if let Err(error) = s.recorder.add_caption(SpeakerId::Human, text) {
            tracing::warn!(session_id, %error, "caption write failed");
        }
        s.log("caption", json!({"speaker": SpeakerId::Human, "text": text}));
        s.emit(ServerMessage::Caption(caption)).await;

        s.set_orb(SpeakerId::Human, OrbState::Listening).await;

        if let Some(decision) = s.router.route(text) {
            self.apply_command(&mut s, decision).await;
        }
    }

    /// A TTS audio chunk for one agent.
    pub async fn on_tts_chunk(&self, session_id: &str, speaker: SpeakerId, pcm: &[u8]) {
        if !speaker.is_agent() {
            tracing::warn!(session_id, %speaker, "TTS chunk for non-agent speaker dropped");
            return;
        }
        let Some(session) = self.get(session_id).await else {
            return;
        };
        let mut s = session.lock().await;

        let ducking_active = s.ducking_active;
        let static_gain = s.static_duck_gain;
        let processed = match s.mixer.as_mut() {
            Some(mixer) => mixer.process(speaker, pcm),
            None if ducking_active => scale_pcm(pcm, static_gain),
            None => pcm.to_vec(),
        };

        if let Err(error) = s.recorder.write_audio(speaker, &processed) {
            tracing::warn!(session_id, %error, "recorder write failed");
        } else {
            s.media_written = true;
        }

        if !s.active_agents.contains(&speaker) {
            s.active_agents.insert(speaker);
            s.log("tts.start", json!({"speaker": speaker}));
            s.set_orb(speaker, OrbState::Speaking).await;
            let actions = s
                .barge_in
                .as_mut()
                .map(|b| b.on_speech_start(speaker, TTS_CONFIDENCE, Instant::now()))
                .unwrap_or_default();
            self.process_floor_actions(&mut s, actions).await;
            self.schedule_grace_timer(&mut s);
        }

        s.log("tts.chunk", json!({"speaker": speaker, "bytes": processed.len()}));

        let seq = {
            let counter = s.audio_seq.entry(speaker).or_insert(0);
            *counter += 1;
            *counter
        };
        let encoded = base64::engine::general_purpose::STANDARD.encode(&processed);
        s.emit(ServerMessage::AudioOut {
            speaker,
            seq,
            pcm16le: encoded,
        })
        .await;
    }

    /// An agent finished its TTS turn.
    pub async fn on_tts_complete(&self, session_id: &str, speaker: SpeakerId) {
        let Some(session) = self.get(session_id).await else {
            return;
        };
        let mut s = session.lock().await;
        s.active_agents.remove(&speaker);
        s.log("tts.complete", json!({"speaker": speaker}));
        let actions = s
            .barge_in
            .as_mut()
            .map(|b| b.on_speech_end(speaker, TTS_CONFIDENCE, Instant::now()))
            .unwrap_or_default();
        self.process_floor_actions(&mut s, actions).await;
        if !s.human_speaking {
            s.set_orb(speaker, OrbState::Listening).await;
        }
    }

    /// An agent's TTS stream failed. The session continues; the agent is
    /// simply quiet.
    pub async fn on_tts_error(&self, session_id: &str, speaker: SpeakerId, error: &str) {
        let Some(session) = self.get(session_id).await else {
            return;
        };
        let mut s = session.lock().await;
        s.active_agents.remove(&speaker);
        s.log("tts.error", json!({"speaker": speaker, "error": error}));
        tracing::warn!(session_id, %speaker, error, "TTS stream error");
        let actions = s
            .barge_in
            .as_mut()
            .map(|b| b.on_speech_end(speaker, TTS_CONFIDENCE, Instant::now()))
            .unwrap_or_default();
        self.process_floor_actions(&mut s, actions).await;
        if !s.human_speaking {
            s.set_orb(speaker, OrbState::Listening).await;
        }
        s.emit(ServerMessage::Ack {
            message: format!("error: {speaker} voice unavailable"),
        })
        .await;
    }

    /// Tear down one session: stop the recorder, announce the artifacts,
    /// close the log, release process state.
    pub async fn disconnect(&self, session_id: &str) {
        let session = {
            let mut sessions = self.sessions.lock().await;
            self.outbounds.lock().remove(session_id);
            sessions.remove(session_id)
        };
        let Some(session) = session else {
            return;
        };
        let mut s = session.lock().await;
        s.abort_grace_timer();

        for speaker in s.active_agents.clone() {
            if let Some(tts) = s.tts.get(&speaker).cloned() {
                if let Err(error) = tts.stop(&s.id).await {
                    tracing::warn!(session_id, %speaker, %error, "TTS stop on disconnect failed");
                }
            }
        }
        if let Some(stt) = &self.adapters.stt {
            if let Err(error) = stt.stop(session_id).await {
                tracing::warn!(session_id, %error, "STT stop on disconnect failed");
            }
        }

        match s.recorder.stop() {
            Ok(files) => {
                let files: Vec<String> =
                    files.iter().map(|p| p.display().to_string()).collect();
                let episode_id = s.episode_id.clone();
                s.emit(ServerMessage::RecordingReady { episode_id, files })
                    .await;
            }
            Err(error) => tracing::warn!(session_id, %error, "recorder stop failed"),
        }

        let participant = s.participant.clone();
        s.log("session.end", json!({"participant": participant}));
        if let Err(error) = s.event_log.stop() {
            tracing::warn!(session_id, %error, "event log stop failed");
        }
        drop(s);

        let last = self.sessions.lock().await.is_empty();
        if last {
            if let Some(handle) = self.thinking_timer.lock().take() {
                handle.abort();
            }
            *self.shared_screen.lock() = SharedScreen::Conversation;
        }
        tracing::info!(session_id, "session closed");
    }

    /// Disconnect every session under the shutdown deadline.
    pub async fn shutdown(&self) -> Result<()> {
        let ids: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        let teardown = async {
            for id in ids {
                self.disconnect(&id).await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_DEADLINE, teardown).await.is_err() {
            bail!("shutdown deadline exceeded");
        }
        Ok(())
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// The current shared-screen value.
    pub fn shared_screen(&self) -> SharedScreen {
        self.shared_screen.lock().clone()
    }

    /// Targets recorded by the most recent `address` command, cleared by
    /// broadcasts and control intents.
    pub async fn pending_targets(&self, session_id: &str) -> Vec<SpeakerId> {
        match self.get(session_id).await {
            Some(session) => session.lock().await.pending_targets.clone(),
            None => Vec::new(),
        }
    }

    /// The last command the router produced for this session.
    pub async fn last_command(&self, session_id: &str) -> Option<RouteDecision> {
        match self.get(session_id).await {
            Some(session) => session.lock().await.last_command.clone(),
            None => None,
        }
    }

    // ── Human speech edges ────────────────────────────────────────

    async fn on_human_speech_start(&self, s: &mut Session, confidence: f64) {
        if s.human_speaking {
            return;
        }
        s.human_speaking = true;
        s.ducking_active = true;
        s.log("vad.start", json!({"confidence": confidence}));

        // Remember the agents' orbs so they can be restored afterwards.
        let restore: HashMap<SpeakerId, OrbState> = SpeakerId::agents()
            .into_iter()
            .filter_map(|a| s.orb_states.get(&a).map(|state| (a, *state)))
            .collect();
        s.orb_restore = Some(restore);

        if s.barge_in.is_some() {
            let actions = s
                .barge_in
                .as_mut()
                .map(|b| b.on_speech_start(SpeakerId::Human, confidence, Instant::now()))
                .unwrap_or_default();
            self.process_floor_actions(s, actions).await;
            self.schedule_grace_timer(s);
        } else {
            // Basic path: interruptions are immediate.
            for speaker in s.active_agents.clone() {
                if let Some(tts) = s.tts.get(&speaker).cloned() {
                    if let Err(error) = tts.stop(&s.id).await {
                        tracing::warn!(session_id = %s.id, %speaker, %error, "TTS stop failed");
                    }
                }
                s.active_agents.remove(&speaker);
                s.log("barge-in.complete", json!({"interrupted": [speaker]}));
            }
        }

        s.set_orb(SpeakerId::Human, OrbState::Speaking).await;
        for agent in SpeakerId::agents() {
            s.set_orb(agent, OrbState::Muted).await;
        }
    }

    async fn on_human_speech_end(&self, s: &mut Session, confidence: f64) {
        if !s.human_speaking {
            return;
        }
        s.human_speaking = false;
        s.ducking_active = false;
        s.log("vad.end", json!({"confidence": confidence}));

        let actions = s
            .barge_in
            .as_mut()
            .map(|b| b.on_speech_end(SpeakerId::Human, confidence, Instant::now()))
            .unwrap_or_default();
        self.process_floor_actions(s, actions).await;

        // Whatever the barge-in outcome, agent gain must be restored before
        // their next chunk.
        if let Some(mixer) = &mut s.mixer {
            mixer.stop_ducking(&SpeakerId::agents(), false);
        }

        s.set_orb(SpeakerId::Human, OrbState::Listening).await;
        let restore = s.orb_restore.take().unwrap_or_default();
        for agent in SpeakerId::agents() {
            let state = restore.get(&agent).copied().unwrap_or(OrbState::Listening);
            s.set_orb(agent, state).await;
        }
    }

    // ── Command application ───────────────────────────────────────

    async fn apply_command(&self, s: &mut Session, decision: RouteDecision) {
        s.log(
            "command",
            json!({
                "action": decision.action,
                "targets": decision.targets,
                "confidence": decision.confidence,
                "fuzzy": decision.fuzzy_matched,
            }),
        );

        match decision.action {
            CommandAction::Thinking => {
                let speaker = decision
                    .targets
                    .first()
                    .copied()
                    .filter(|t| t.is_agent())
                    .unwrap_or(SpeakerId::Host);
                let duration_ms = decision.duration_ms.unwrap_or(30_000);
                self.enter_thinking(s, speaker, duration_ms).await;
            }
            CommandAction::Address => {
                s.pending_targets = decision.targets.clone();
                let names: Vec<&str> = decision.targets.iter().map(|t| t.as_str()).collect();
                s.emit(ServerMessage::Ack {
                    message: format!("routing to {}", names.join(", ")),
                })
                .await;
            }
            CommandAction::Broadcast => {
                if !s.pending_targets.is_empty() {
                    let previous = s.pending_targets.clone();
                    s.log("routing.cleared", json!({"previous": previous}));
                }
                s.pending_targets.clear();
            }
            CommandAction::BargeInControl => {
                s.pending_targets.clear();
                for speaker in s.active_agents.clone() {
                    if let Some(tts) = s.tts.get(&speaker).cloned() {
                        if let Err(error) = tts.stop(&s.id).await {
                            tracing::warn!(session_id = %s.id, %speaker, %error, "TTS stop failed");
                        }
                    }
                    s.active_agents.remove(&speaker);
                    let actions = s
                        .barge_in
                        .as_mut()
                        .map(|b| b.on_speech_end(speaker, TTS_CONFIDENCE, Instant::now()))
                        .unwrap_or_default();
                    self.process_floor_actions(s, actions).await;
                    s.set_orb(speaker, OrbState::Listening).await;
                }
                s.emit(ServerMessage::Ack {
                    message: "stopped".into(),
                })
                .await;
            }
            CommandAction::DuckingControl => {
                s.pending_targets.clear();
                if let Some(mixer) = &mut s.mixer {
                    mixer.start_ducking(&SpeakerId::agents(), false);
                } else {
                    s.ducking_active = true;
                }
                s.log("ducking.start", json!({"targets": SpeakerId::agents(), "source": "command"}));
                s.emit(ServerMessage::Ack {
                    message: "volume lowered".into(),
                })
                .await;
            }
        }

        s.last_command = Some(decision);
    }

    // ── Thinking mode ─────────────────────────────────────────────

    async fn enter_thinking(&self, s: &mut Session, speaker: SpeakerId, duration_ms: u64) {
        if let Some(handle) = self.thinking_timer.lock().take() {
            handle.abort();
        }

        let started_at = chrono::Utc::now().timestamp_millis() as u64;
        let screen = SharedScreen::Thinking {
            speaker,
            duration_ms,
            started_at,
            ends_at: started_at + duration_ms,
        };
        *self.shared_screen.lock() = screen.clone();

        s.log(
            "thinking.enter",
            json!({"speaker": speaker, "durationMs": duration_ms}),
        );
        self.broadcast(ServerMessage::ModeThinking {
            speaker,
            duration_ms,
            started_at,
        })
        .await;
        self.broadcast(ServerMessage::SharedScreenState { screen }).await;

        s.set_orb(speaker, OrbState::Thinking).await;
        s.set_orb(speaker.other_agent(), OrbState::Muted).await;

        let Some(orchestrator) = self.self_ref.upgrade() else {
            return;
        };
        let origin = s.id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(duration_ms)).await;
            orchestrator.exit_thinking(&origin, speaker).await;
        });
        *self.thinking_timer.lock() = Some(handle);
    }

    async fn exit_thinking(&self, origin_session: &str, speaker: SpeakerId) {
        {
            let mut screen = self.shared_screen.lock();
            if !screen.is_thinking() {
                return;
            }
            *screen = SharedScreen::Conversation;
        }
        self.thinking_timer.lock().take();

        let ended_at = chrono::Utc::now().timestamp_millis() as u64;
        self.broadcast(ServerMessage::ModeNormal { speaker, ended_at }).await;
        self.broadcast(ServerMessage::SharedScreenState {
            screen: SharedScreen::Conversation,
        })
        .await;

        if let Some(session) = self.get(origin_session).await {
            let mut s = session.lock().await;
            s.log("thinking.exit", json!({"speaker": speaker}));
            for agent in SpeakerId::agents() {
                s.set_orb(agent, OrbState::Listening).await;
            }
        }
    }

    // ── Floor actions ─────────────────────────────────────────────

    async fn process_floor_actions(&self, s: &mut Session, actions: Vec<FloorAction>) {
        for action in actions {
            match action {
                FloorAction::Ducking { targets, active } => {
                    if let Some(mixer) = &mut s.mixer {
                        if active {
                            mixer.start_ducking(&targets, false);
                        } else {
                            mixer.stop_ducking(&targets, false);
                        }
                    }
                    s.ducking_active = active;
                    s.log(
                        if active { "ducking.start" } else { "ducking.stop" },
                        json!({"targets": targets}),
                    );
                }
                FloorAction::Started(event) => {
                    s.log(
                        "barge-in.start",
                        serde_json::to_value(&event).unwrap_or(Value::Null),
                    );
                }
                FloorAction::Completed(event) => {
                    for target in &event.interrupted {
                        if !target.is_agent() {
                            continue;
                        }
                        if let Some(tts) = s.tts.get(target).cloned() {
                            if let Err(error) = tts.stop(&s.id).await {
                                tracing::warn!(
                                    session_id = %s.id,
                                    speaker = %target,
                                    %error,
                                    "TTS stop failed"
                                );
                            }
                        }
                        s.active_agents.remove(target);
                        s.set_orb(*target, OrbState::Muted).await;
                    }
                    s.log(
                        "barge-in.complete",
                        serde_json::to_value(&event).unwrap_or(Value::Null),
                    );
                }
                FloorAction::Cancelled(event) => {
                    s.abort_grace_timer();
                    s.log(
                        "barge-in.cancelled",
                        serde_json::to_value(&event).unwrap_or(Value::Null),
                    );
                }
            }
        }
    }

    /// Arm a timer for the barge-in manager's pending deadline, replacing
    /// any previous one.
    fn schedule_grace_timer(&self, s: &mut Session) {
        let Some(deadline) = s.barge_in.as_ref().and_then(|b| b.pending_deadline()) else {
            return;
        };
        s.abort_grace_timer();
        let Some(orchestrator) = self.self_ref.upgrade() else {
            return;
        };
        let session_id = s.id.clone();
        s.grace_timer = Some(tokio::spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
            orchestrator.on_grace_elapsed(&session_id).await;
        }));
    }

    async fn on_grace_elapsed(&self, session_id: &str) {
        let Some(session) = self.get(session_id).await else {
            return;
        };
        let mut s = session.lock().await;
        s.grace_timer = None;
        let actions = s
            .barge_in
            .as_mut()
            .map(|b| b.on_grace_elapsed(Instant::now()))
            .unwrap_or_default();
        self.process_floor_actions(&mut s, actions).await;
    }

    // ── Plumbing ──────────────────────────────────────────────────

    async fn get(&self, session_id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    async fn broadcast(&self, message: ServerMessage) {
        let senders: Vec<mpsc::Sender<ServerMessage>> =
            self.outbounds.lock().values().cloned().collect();
        for sender in senders {
            let _ = sender.send(message.clone()).await;
        }
    }

    fn build_sinks(&self, episode_id: &str) -> (Box<dyn RecorderPort>, Box<dyn EventLogPort>) {
        if self.config.recording.enabled {
            (
                Box::new(PcmRecorder::new(self.config.recording.dir.clone(), episode_id)),
                Box::new(JsonlEventLog::new(self.config.recording.dir.clone(), episode_id)),
            )
        } else {
            (Box::new(NullRecorder), Box::new(NullEventLog))
        }
    }

    /// Honor a client-supplied episode id if nothing has been persisted
    /// under the generated one.
    fn rebind_episode(&self, s: &mut Session, episode_id: String) {
        if s.media_written || !s.captions.is_empty() {
            tracing::info!(
                session_id = %s.id,
                requested = %episode_id,
                "episode id arrived after media was written, keeping generated id"
            );
            return;
        }
        if let Err(error) = s.recorder.stop() {
            tracing::warn!(session_id = %s.id, %error, "recorder stop during rebind failed");
        }
        if let Err(error) = s.event_log.stop() {
            tracing::warn!(session_id = %s.id, %error, "event log stop during rebind failed");
        }

        let (mut recorder, mut event_log) = self.build_sinks(&episode_id);
        if let Err(error) = event_log.start() {
            tracing::warn!(session_id = %s.id, %error, "event log unavailable");
            event_log = Box::new(NullEventLog);
        }
        if let Err(error) = recorder.start() {
            tracing::warn!(session_id = %s.id, %error, "recorder unavailable");
            recorder = Box::new(NullRecorder);
        }
        s.recorder = recorder;
        s.event_log = event_log;
        s.episode_id = episode_id.clone();
        s.log("session.start", json!({"episodeId": episode_id}));
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// TTS stub that records stop calls.
    struct StubTts {
        stops: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl TtsPort for StubTts {
        async fn synthesize(&self, _session_id: &str, _text: &str) -> Result<()> {
            Ok(())
        }

        async fn stop(&self, session_id: &str) -> Result<()> {
            self.stops.lock().unwrap().push(session_id.to_string());
            Ok(())
        }
    }

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        rx: mpsc::Receiver<ServerMessage>,
        stops: Arc<std::sync::Mutex<Vec<String>>>,
    }

    async fn harness() -> Harness {
        let mut config = Config::default();
        config.recording.enabled = false;
        harness_with(config).await
    }

    async fn harness_with(config: Config) -> Harness {
        let stops = Arc::new(std::sync::Mutex::new(Vec::new()));
        let adapters = Adapters {
            stt: None,
            tts_host: Some(Arc::new(StubTts {
                stops: Arc::clone(&stops),
            })),
            tts_guest: Some(Arc::new(StubTts {
                stops: Arc::clone(&stops),
            })),
        };
        let orchestrator = Orchestrator::new(Arc::new(config), adapters);
        let (tx, rx) = mpsc::channel(256);
        orchestrator.register("s-1", tx).await.unwrap();
        Harness {
            orchestrator,
            rx,
            stops,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    /// One 20ms frame of constant amplitude at 48kHz.
    fn frame(amplitude: f64) -> Vec<u8> {
        let sample = ((amplitude * 32768.0).clamp(-32768.0, 32767.0) as i16).to_le_bytes();
        sample.iter().copied().cycle().take(960 * 2).collect()
    }

    async fn feed_audio(h: &Harness, amplitude: f64, frames: usize) {
        for _ in 0..frames {
            h.orchestrator.handle_audio("s-1", &frame(amplitude)).await;
        }
    }

    fn orb_of(messages: &[ServerMessage], speaker: SpeakerId) -> Vec<OrbState> {
        messages
            .iter()
            .filter_map(|m| match m {
                ServerMessage::Orb { speaker: s, state } if *s == speaker => Some(*state),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn register_emits_ack_then_snapshot() {
        let mut h = harness().await;
        let messages = drain(&mut h.rx);
        assert!(matches!(
            &messages[0],
            ServerMessage::Ack { message } if message == "connected"
        ));
        match &messages[1] {
            ServerMessage::Snapshot {
                orb_states,
                captions,
                autopilot,
                shared_screen,
            } => {
                assert_eq!(orb_states.len(), 3);
                assert!(captions.is_empty());
                assert!(!autopilot);
                assert_eq!(*shared_screen, SharedScreen::Conversation);
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn double_register_is_rejected() {
        let h = harness().await;
        let (tx, _rx) = mpsc::channel(8);
        assert!(h.orchestrator.register("s-1", tx).await.is_err());
    }

    #[tokio::test]
    async fn final_transcript_produces_caption() {
        let mut h = harness().await;
        drain(&mut h.rx);

        h.orchestrator
            .on_transcript("s-1", "what a lovely day", true)
            .await;
        let messages = drain(&mut h.rx);
        let caption = messages.iter().find_map(|m| match m {
            ServerMessage::Caption(c) => Some(c.clone()),
            _ => None,
        });
        let caption = caption.expect("caption emitted");
        assert_eq!(caption.speaker, SpeakerId::Human);
        assert_eq!(caption.text, "what a lovely day");
        assert!(caption.timestamp_ms > 0);
    }

    #[tokio::test]
    async fn partial_transcripts_are_ignored() {
        let mut h = harness().await;
        drain(&mut h.rx);
        h.orchestrator.on_transcript("s-1", "partial", false).await;
        assert!(drain(&mut h.rx).is_empty());
    }

    #[tokio::test]
    async fn snapshot_exposes_at_most_six_captions() {
        let mut h = harness().await;
        drain(&mut h.rx);

        for i in 0..25 {
            h.orchestrator
                .on_transcript("s-1", &format!("line {i}"), true)
                .await;
        }
        drain(&mut h.rx);

        h.orchestrator
            .handle_message("s-1", ClientMessage::RequestState)
            .await;
        let messages = drain(&mut h.rx);
        match messages.last().unwrap() {
            ServerMessage::Snapshot { captions, .. } => {
                assert_eq!(captions.len(), 6);
                // Newest first
                assert_eq!(captions[0].text, "line 24");
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn thinking_command_sets_shared_screen_and_orbs() {
        let mut h = harness().await;
        drain(&mut h.rx);

        h.orchestrator
            .on_transcript("s-1", "Claude, take 30 seconds to think", true)
            .await;
        let messages = drain(&mut h.rx);

        assert!(messages.iter().any(|m| matches!(
            m,
            ServerMessage::ModeThinking { speaker: SpeakerId::Host, duration_ms: 30_000, .. }
        )));
        assert!(messages.iter().any(|m| matches!(
            m,
            ServerMessage::SharedScreenState { screen: SharedScreen::Thinking { .. } }
        )));
        assert_eq!(orb_of(&messages, SpeakerId::Host), vec![OrbState::Thinking]);
        assert_eq!(orb_of(&messages, SpeakerId::Guest), vec![OrbState::Muted]);
        assert!(h.orchestrator.shared_screen().is_thinking());
    }

    #[tokio::test]
    async fn new_thinking_replaces_previous() {
        let mut h = harness().await;
        drain(&mut h.rx);

        h.orchestrator
            .on_transcript("s-1", "Claude, take a minute to think", true)
            .await;
        h.orchestrator
            .on_transcript("s-1", "Guest, think for 30 seconds", true)
            .await;
        drain(&mut h.rx);

        match h.orchestrator.shared_screen() {
            SharedScreen::Thinking { speaker, duration_ms, .. } => {
                assert_eq!(speaker, SpeakerId::Guest);
                assert_eq!(duration_ms, 30_000);
            }
            other => panic!("expected thinking, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tts_chunk_streams_audio_and_updates_orb() {
        let mut h = harness().await;
        drain(&mut h.rx);

        let pcm = frame(0.4);
        h.orchestrator.on_tts_chunk("s-1", SpeakerId::Host, &pcm).await;
        h.orchestrator.on_tts_chunk("s-1", SpeakerId::Host, &pcm).await;
        let messages = drain(&mut h.rx);

        assert_eq!(orb_of(&messages, SpeakerId::Host), vec![OrbState::Speaking]);
        let seqs: Vec<u64> = messages
            .iter()
            .filter_map(|m| match m {
                ServerMessage::AudioOut { speaker: SpeakerId::Host, seq, pcm16le } => {
                    assert!(!pcm16le.is_empty());
                    Some(*seq)
                }
                _ => None,
            })
            .collect();
        assert_eq!(seqs, vec![1, 2]);

        h.orchestrator.on_tts_complete("s-1", SpeakerId::Host).await;
        let messages = drain(&mut h.rx);
        assert_eq!(orb_of(&messages, SpeakerId::Host), vec![OrbState::Listening]);
    }

    #[tokio::test]
    async fn unity_gain_tts_chunk_is_bit_exact() {
        let mut h = harness().await;
        drain(&mut h.rx);

        let pcm = frame(0.4);
        h.orchestrator.on_tts_chunk("s-1", SpeakerId::Host, &pcm).await;
        let messages = drain(&mut h.rx);
        let encoded = messages
            .iter()
            .find_map(|m| match m {
                ServerMessage::AudioOut { pcm16le, .. } => Some(pcm16le.clone()),
                _ => None,
            })
            .unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap();
        assert_eq!(decoded, pcm);
    }

    #[tokio::test]
    async fn human_speech_mutes_agents_and_restores_after() {
        let mut h = harness().await;
        drain(&mut h.rx);

        // Host starts talking
        h.orchestrator
            .on_tts_chunk("s-1", SpeakerId::Host, &frame(0.4))
            .await;
        drain(&mut h.rx);

        // Human speaks long enough for a VAD start edge
        feed_audio(&h, 0.5, 12).await;
        let messages = drain(&mut h.rx);
        assert_eq!(orb_of(&messages, SpeakerId::Human), vec![OrbState::Speaking]);
        assert_eq!(orb_of(&messages, SpeakerId::Host), vec![OrbState::Muted]);
        assert_eq!(orb_of(&messages, SpeakerId::Guest), vec![OrbState::Muted]);

        // Short burst: end before the grace period
        feed_audio(&h, 0.0, 11).await;
        let messages = drain(&mut h.rx);
        assert_eq!(orb_of(&messages, SpeakerId::Human), vec![OrbState::Listening]);
        // Host restored to its pre-interruption state, still speaking
        assert_eq!(orb_of(&messages, SpeakerId::Host), vec![OrbState::Speaking]);
        // Grace never fired: host TTS was not stopped
        assert!(h.stops.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sustained_human_speech_stops_agent_after_grace() {
        let mut h = harness().await;
        drain(&mut h.rx);

        h.orchestrator
            .on_tts_chunk("s-1", SpeakerId::Host, &frame(0.4))
            .await;
        feed_audio(&h, 0.5, 12).await;
        drain(&mut h.rx);

        // Keep speaking past the 300ms grace period
        tokio::time::sleep(Duration::from_millis(450)).await;

        assert_eq!(h.stops.lock().unwrap().as_slice(), ["s-1"]);
        let session = h.orchestrator.get("s-1").await.unwrap();
        let s = session.lock().await;
        assert!(s.active_agents.is_empty());
    }

    #[tokio::test]
    async fn barge_in_control_command_stops_agents() {
        let mut h = harness().await;
        drain(&mut h.rx);

        h.orchestrator
            .on_tts_chunk("s-1", SpeakerId::Host, &frame(0.4))
            .await;
        h.orchestrator
            .on_tts_chunk("s-1", SpeakerId::Guest, &frame(0.4))
            .await;
        drain(&mut h.rx);

        h.orchestrator
            .on_transcript("s-1", "everyone stop talking", true)
            .await;
        assert_eq!(h.stops.lock().unwrap().len(), 2);
        let session = h.orchestrator.get("s-1").await.unwrap();
        let s = session.lock().await;
        assert!(s.active_agents.is_empty());
    }

    #[tokio::test]
    async fn address_command_records_pending_targets() {
        let mut h = harness().await;
        drain(&mut h.rx);

        h.orchestrator
            .on_transcript("s-1", "Guest, tell us about the recording", true)
            .await;
        assert_eq!(
            h.orchestrator.pending_targets("s-1").await,
            vec![SpeakerId::Guest]
        );
        let last = h.orchestrator.last_command("s-1").await.unwrap();
        assert_eq!(last.action, CommandAction::Address);

        // A broadcast clears the pending targets
        h.orchestrator
            .on_transcript("s-1", "anyway, moving on now", true)
            .await;
        assert!(h.orchestrator.pending_targets("s-1").await.is_empty());
    }

    #[tokio::test]
    async fn toggle_autopilot_acks_and_snapshots() {
        let mut h = harness().await;
        drain(&mut h.rx);

        h.orchestrator
            .handle_message("s-1", ClientMessage::ToggleAutopilot { enabled: true })
            .await;
        let messages = drain(&mut h.rx);
        assert!(matches!(
            &messages[0],
            ServerMessage::Ack { message } if message == "autopilot on"
        ));
        assert!(matches!(
            &messages[1],
            ServerMessage::Snapshot { autopilot: true, .. }
        ));
    }

    #[tokio::test]
    async fn disconnect_emits_recording_ready_and_clears_state() {
        let mut h = harness().await;
        drain(&mut h.rx);

        h.orchestrator
            .on_transcript("s-1", "Claude, take a moment to think", true)
            .await;
        assert!(h.orchestrator.shared_screen().is_thinking());
        drain(&mut h.rx);

        h.orchestrator.disconnect("s-1").await;
        let messages = drain(&mut h.rx);
        assert!(messages
            .iter()
            .any(|m| matches!(m, ServerMessage::RecordingReady { .. })));

        assert_eq!(h.orchestrator.session_count().await, 0);
        // Last session gone: shared screen reset
        assert_eq!(h.orchestrator.shared_screen(), SharedScreen::Conversation);
    }

    #[tokio::test]
    async fn shutdown_disconnects_every_session() {
        let h = harness().await;
        let (tx, _rx2) = mpsc::channel(64);
        h.orchestrator.register("s-2", tx).await.unwrap();
        assert_eq!(h.orchestrator.session_count().await, 2);

        h.orchestrator.shutdown().await.unwrap();
        assert_eq!(h.orchestrator.session_count().await, 0);
    }

    #[tokio::test]
    async fn thinking_broadcast_reaches_every_session() {
        let mut h = harness().await;
        drain(&mut h.rx);
        let (tx, mut rx2) = mpsc::channel(64);
        h.orchestrator.register("s-2", tx).await.unwrap();
        while rx2.try_recv().is_ok() {}

        h.orchestrator
            .on_transcript("s-1", "Claude, thinking mode please", true)
            .await;
        let other = {
            let mut messages = Vec::new();
            while let Ok(m) = rx2.try_recv() {
                messages.push(m);
            }
            messages
        };
        assert!(other
            .iter()
            .any(|m| matches!(m, ServerMessage::ModeThinking { .. })));
        assert!(other
            .iter()
            .any(|m| matches!(m, ServerMessage::SharedScreenState { .. })));
    }

    #[tokio::test]
    async fn static_ducking_attenuates_when_enhanced_audio_off() {
        let mut config = Config::default();
        config.recording.enabled = false;
        config.features.enhanced_audio = false;
        let mut h = harness_with(config).await;
        drain(&mut h.rx);

        // Human speaking: static duck path engages
        feed_audio(&h, 0.5, 12).await;
        drain(&mut h.rx);

        let pcm = frame(0.4);
        h.orchestrator.on_tts_chunk("s-1", SpeakerId::Host, &pcm).await;
        let messages = drain(&mut h.rx);
        let encoded = messages
            .iter()
            .find_map(|m| match m {
                ServerMessage::AudioOut { pcm16le, .. } => Some(pcm16le.clone()),
                _ => None,
            })
            .unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap();
        let expected = 0.4 * db_to_gain(-12.0);
        let rms = crate::audio::pcm_rms(&decoded);
        assert!((rms - expected).abs() < 0.01, "rms {rms} vs {expected}");
    }
}
