//! spotlight-narration: per-period summaries and narrated playback for the
//! Spotlight dashboard.
//!
//! Components:
//! - `summary`: one summary request per closed period, cached in memory
//! - `narration`: speech synthesis with a durable per-period audio cache
//! - `playback`: independent transport state per period card
//! - `spotlight`: one view wiring the three together
//! - `api`: local HTTP control surface over a view

pub mod api;
pub mod audio;
pub mod config;
pub mod error;
pub mod narration;
pub mod period;
pub mod playback;
pub mod spotlight;
pub mod store;
pub mod summary;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use error::{NarrationError, PlaybackError, SpotlightError, StoreError};
pub use period::{Granularity, Message, Period, PeriodGroup};
pub use spotlight::{PeriodCard, Spotlight};
