//! greenroom — a real-time three-party voice studio server.
//!
//! One human participant and two conversational agents (a "host" and a
//! "guest") share the floor of a live session. Per connection the server:
//!
//! - ingests 16-bit PCM microphone audio over a WebSocket,
//! - runs energy/confidence voice-activity detection on it,
//! - mediates interruptions between parties (barge-in, with grace periods),
//! - ducks agent audio under human speech with ramped gain transitions,
//! - routes finalized transcripts into floor-control commands
//!   ("Claude, take 10 seconds to think"),
//! - and projects per-speaker "orb" presentation state, captions, and a
//!   shared conversation/thinking screen back to the client.
//!
//! ## Design
//! - Engines (VAD, ducking, router, barge-in) are pure state machines that
//!   return typed events; the session actor interprets them, so the event
//!   order published to a client is a linear extension of handler order.
//! - External speech services are narrow async ports ([`ports`]); a failed
//!   adapter leaves its handle absent rather than killing the session.
//! - Process-wide state is limited to the session map, the thinking timer,
//!   and the shared-screen value, each behind a single-writer discipline.

pub mod audio;
pub mod config;
pub mod floor;
pub mod gateway;
pub mod ports;
pub mod recording;
pub mod session;

pub use config::Config;
pub use session::orchestrator::Orchestrator;
