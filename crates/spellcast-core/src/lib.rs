//! Core types and logic for spellcast.
//!
//! Everything here is pure: no tasks, no I/O beyond reading a strategy
//! document. The runtime lives in the `spellcast` binary.
//!
//! # Modules
//!
//! - [`strategy`]: spell-priority documents (YAML, JSON, TOML)
//! - [`mode`]: casting modes and the hotkey map that switches them
//! - [`resolver`]: picks the next spell from ready skills, mode and strategy
//! - [`detection`]: perception output and the `_ready` label convention
//! - [`input`]: key name normalization
//! - [`events`]: log, telemetry and debug-step messages
//! - [`protocol`]: JSON-line request/response protocol
//! - [`error`]: API error types with actionable suggestions
//!
//! # Resolution
//!
//! | Mode | List scanned | Result |
//! |------|--------------|--------|
//! | `Aoe` | `aoe_priority` | first ready rule |
//! | `SingleTarget` | `single_target_priority` | first ready rule |
//! | `Stopped` | none | no action |
//!
//! A rule's key is looked up in `bindings`; unknown aliases are used as
//! literal keys.

pub mod detection;
pub mod error;
pub mod events;
pub mod input;
pub mod mode;
pub mod protocol;
pub mod resolver;
pub mod strategy;
