/// Collector module
///
/// This module groups all logic responsible for:
/// - Running one source's ingestion pipeline per tick
/// - Deciding which cadences are due (short, long, housekeeping)
/// - Keeping each source's task alive indefinitely
///
/// The collector layer acts as the orchestration layer between:
/// - Source adapters (announcements, insider trading, …)
/// - The day-window store and the uploader
///
/// Design notes:
/// - Feed-specific logic MUST NOT live here
/// - One task per source, ticks of a source never overlap
/// - Sources share nothing but the HTTP transport
pub mod pipeline;
pub mod runner;
pub mod scheduler;
