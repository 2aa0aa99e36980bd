//! Notification deduplication, throttling, and escalation engine.
//!
//! Decides, for every alert event produced upstream, whether to suppress it
//! as a duplicate, rate-limit it, and how to drive the incident it belongs
//! to through timed multi-level escalation until someone acknowledges or
//! resolves it.
//!
//! No delivery, no DB; pure decision logic over in-memory state. Senders
//! plug in through `TargetDispatcher`, time through `Clock`.

pub mod business_hours;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod escalation;
pub mod fingerprint;
pub mod normalize;
pub mod scheduler;
pub mod stats;
pub mod template;
pub mod throttle;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use dispatch::{DispatchRequest, RecordingDispatcher, TargetDispatcher};
pub use engine::Engine;
pub use error::EngineError;
pub use escalation::{Incident, IncidentState};
pub use types::{Decision, InboundEvent, IncidentId};
