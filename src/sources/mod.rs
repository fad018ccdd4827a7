//! Source adapter registry and factory
//!
//! This module provides:
//! - Central registration of all supported upstream feeds
//! - A factory function to resolve adapters by name
//!
//! All feed-specific request logic must live in dedicated adapter modules.
//! The rest of the application must interact exclusively through
//! the `SourceAdapter` trait.

pub mod adapter;
pub mod announcements;
pub mod high_low;
pub mod insider_trading;
pub mod volume;

use std::sync::Arc;

use adapter::SourceAdapter;

/// Returns a source adapter instance by name.
///
/// CONTRACT:
/// - `name` MUST match the `sources[].name` field in config.json
/// - Adapter names are lowercase and stable; they also tag the
///   day-window files on disk
pub fn get_adapter(name: &str) -> Option<Arc<dyn SourceAdapter>> {
    match name {
        "announcements" => Some(Arc::new(announcements::AnnouncementsAdapter::default())),
        "insider_trading" => Some(Arc::new(insider_trading::InsiderTradingAdapter::default())),
        "high_low" => Some(Arc::new(high_low::HighLowAdapter::default())),
        "volume" => Some(Arc::new(volume::VolumeAdapter::default())),
        _ => None,
    }
}
