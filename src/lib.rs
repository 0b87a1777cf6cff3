//! livebridge: bidirectional real-time audio dialog proxy.
//!
//! Sits between browser-style clients and an upstream generative Live
//! model that interleaves PCM audio with incrementally revised transcripts.
//! The proxy aligns the two streams into discrete (sentence, audio segment)
//! commits and ships them downstream together with raw PCM frames.
//!
//! # Architecture
//!
//! - `server` / `session`: WebSocket listener and the per-client task that
//!   owns all session state
//! - `upstream` / `live`: the upstream connection state machine and its
//!   wire types (setup, realtime input, reconnect/resumption)
//! - `segmenter` / `transcript` / `audio_extract`: transcript parsing,
//!   payload audio harvesting, and sentence-to-audio pairing
//! - `player` / `join` / `ring` / `window`: the client-side playback core
//!   with epoch cancellation and adaptive crossfades
//! - `caption`: debounced caption voice scheduling with fallback commits
//! - `limiter` / `backoff`: adaptive send throttling and reconnect delays

pub mod audio_extract;
pub mod backoff;
pub mod caption;
pub mod config;
pub mod error;
pub mod events;
pub mod join;
pub mod limiter;
pub mod live;
pub mod metrics;
pub mod player;
pub mod ring;
pub mod segmenter;
pub mod server;
pub mod session;
pub mod transcript;
pub mod upstream;
pub mod util;
pub mod window;

pub use config::Config;
pub use metrics::Metrics;
