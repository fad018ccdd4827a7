use std::time::{Duration, Instant};

use chrono::{Datelike, NaiveDateTime, NaiveTime, Weekday};

use crate::config::SourceConfig;

/// Independently scheduled repetitions of one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Single-page / unwindowed pull, every wake-up
    Short,
    /// Full paginated / windowed pull
    Long,
    /// Retention sweep
    Housekeeping,
}

/// Weekday trading window, local time, both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarketHours {
    pub open: NaiveTime,
    pub close: NaiveTime,
}

impl MarketHours {
    pub fn is_open(&self, at: NaiveDateTime) -> bool {
        let weekday = !matches!(at.weekday(), Weekday::Sat | Weekday::Sun);
        let time = at.time();
        weekday && time >= self.open && time <= self.close
    }
}

/// Explicit per-source scheduling state.
///
/// Holds the last completion time of every cadence that is not due on
/// every wake-up. The long cadence only advances on *successful*
/// completion, so a failed long pull is retried on the next wake-up
/// instead of waiting a full long interval.
#[derive(Debug, Clone)]
pub struct Scheduler {
    short: Duration,
    long: Option<Duration>,
    housekeeping: Duration,
    market_hours: Option<MarketHours>,
    last_long_success: Option<Instant>,
    last_housekeeping: Option<Instant>,
}

impl Scheduler {
    pub fn new(
        short: Duration,
        long: Option<Duration>,
        housekeeping: Duration,
        market_hours: Option<MarketHours>,
    ) -> Self {
        Self {
            short,
            long,
            housekeeping,
            market_hours,
            last_long_success: None,
            last_housekeeping: None,
        }
    }

    pub fn from_config(cfg: &SourceConfig) -> anyhow::Result<Self> {
        let market_hours = match &cfg.market_hours {
            Some(hours) => {
                let (open, close) = hours.parse()?;
                Some(MarketHours { open, close })
            }
            None => None,
        };

        Ok(Self::new(
            Duration::from_secs(cfg.short_interval_secs),
            cfg.long_interval_secs.map(Duration::from_secs),
            Duration::from_secs(cfg.housekeeping_interval_secs),
            market_hours,
        ))
    }

    pub fn short_interval(&self) -> Duration {
        self.short
    }

    fn elapsed(last: Option<Instant>, now: Instant, interval: Duration) -> bool {
        last.is_none_or(|last| now.saturating_duration_since(last) >= interval)
    }

    /// Cadences due at `now`, in execution order.
    ///
    /// Short is always due; the caller wakes up once per short interval.
    pub fn due(&self, now: Instant) -> Vec<Cadence> {
        let mut due = vec![Cadence::Short];

        if let Some(long) = self.long {
            if Self::elapsed(self.last_long_success, now, long) {
                due.push(Cadence::Long);
            }
        }

        if Self::elapsed(self.last_housekeeping, now, self.housekeeping) {
            due.push(Cadence::Housekeeping);
        }

        due
    }

    /// False outside market hours for gated sources.
    pub fn is_open(&self, at: NaiveDateTime) -> bool {
        self.market_hours.is_none_or(|hours| hours.is_open(at))
    }

    /// Records the end of a cadence run.
    ///
    /// A gated no-op counts as a successful run.
    pub fn complete(&mut self, cadence: Cadence, succeeded: bool, now: Instant) {
        match cadence {
            Cadence::Short => {}
            Cadence::Long => {
                if succeeded {
                    self.last_long_success = Some(now);
                }
            }
            Cadence::Housekeeping => self.last_housekeeping = Some(now),
        }
    }
}
