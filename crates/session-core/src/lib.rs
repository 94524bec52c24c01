//! Session registry and protocol event dispatcher.
//!
//! This crate tracks the conversational threads ("sessions") a connection
//! holds with remote peers, reconciles inbound protocol units against
//! pending requests, and routes them onward. All mutation happens on the
//! single signaling task that owns the dispatcher; handles given to other
//! subsystems are read-only by contract.
//!
//! # Architecture
//!
//! ```text
//!  decoded stanzas ──▶ Dispatcher ──▶ SessionRegistry (lookup / create)
//!                         │    │
//!                         │    └────▶ PendingRegistry (reply matching,
//!                         │                            deadline sweep)
//!                         └─────────▶ EventHub (typed, tiered publish)
//! ```

// Error handling
pub mod errors;

// Monotonic time source
pub mod clock;

// Session entity
pub mod session;

// Session registry
pub mod registry;

// Pending request / timeout registry
pub mod pending;

// Typed event hub
pub mod events;

// Protocol event dispatcher
pub mod dispatcher;

// Public exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatcher::{
    Dispatcher, DispatcherConfig, FeatureFlags, MessageStore, RoomDirectory, SignalingChannel,
    SignalingHandler, StartupHandshake,
};
pub use errors::{Result, SessionError};
pub use events::{EventHub, SessionEvent, Tier};
pub use pending::{PendingRegistry, PendingRequest, WaitReason};
pub use registry::SessionRegistry;
pub use session::{Session, SessionControl, SessionKind};
