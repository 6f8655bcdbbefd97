//! CSP-style rendezvous channels.
//!
//! Processes communicate exclusively by rendezvous on named, typed channels:
//! a reader and a writer are matched pairwise inside a per-channel critical
//! section, never by sharing memory. Three coupled mechanisms make this
//! useful in practice:
//!
//! - [`channel::Channel`]: a matching automaton with an optional bounded
//!   buffer, overflow policy, deadlines, and a reference-counted retirement
//!   lifecycle.
//! - [`offer::TwoPhaseOffer`]: the committed-choice protocol that lets one
//!   logical operation bind tentatively to many channels yet be accepted by
//!   at most one, via [`choice::ExternalChoice`].
//! - [`broadcast::BroadcastChannel`]: a channel that pairs one writer with
//!   every currently joined reader in a single atomic step.
//!
//! A single background [`expiration::ExpirationService`] drains deadlines
//! for every channel in the process.

pub mod broadcast;
pub mod channel;
pub mod choice;
pub mod deadline;
pub mod error;
pub mod expiration;
pub mod offer;

pub use broadcast::{BroadcastChannel, BroadcastConfig};
pub use channel::{Channel, ChannelConfig, OverflowPolicy};
pub use choice::{ExternalChoice, SelectPolicy};
pub use deadline::Deadline;
pub use error::{ChannelError, ConfigError};
pub use expiration::ExpirationService;
pub use offer::TwoPhaseOffer;
