//! Delivery schedules: delay, cron and repeat bursts.

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{QueueError, QueueResult};

/// A parsed cron expression.
///
/// Six fields: `sec min hour day-of-month month day-of-week`.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Schedule,
}

impl CronSchedule {
    /// Parse an expression.
    pub fn parse(expression: &str) -> QueueResult<Self> {
        let schedule = Schedule::from_str(expression)
            .map_err(|e| QueueError::InvalidCronExpression(format!("{}: {}", expression, e)))?;
        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    /// The original expression.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First tick strictly after `after_ms`, in epoch ms.
    pub fn next_after(&self, after_ms: i64) -> Option<i64> {
        let after: DateTime<Utc> = DateTime::from_timestamp_millis(after_ms)?;
        self.schedule
            .after(&after)
            .next()
            .map(|dt| dt.timestamp_millis())
    }
}

/// When a message is delivered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSchedule {
    /// Initial delay in ms (0 = none).
    pub delay: u64,
    /// Cron expression.
    pub cron: Option<String>,
    /// Extra firings per occurrence.
    pub repeat: u32,
    /// Spacing of repeat firings in ms.
    pub repeat_period: u64,
}

impl MessageSchedule {
    /// Whether firings create new messages.
    pub fn is_periodic(&self) -> bool {
        self.cron.is_some() || self.repeat > 0
    }

    /// Whether delivery waits at all.
    pub fn is_scheduled(&self) -> bool {
        self.delay > 0 || self.is_periodic()
    }

    fn cron_schedule(&self) -> QueueResult<Option<CronSchedule>> {
        self.cron.as_deref().map(CronSchedule::parse).transpose()
    }

    /// Check the cron expression and repeat settings.
    pub fn validate(&self) -> QueueResult<()> {
        self.cron_schedule()?;
        if self.repeat > 0 && self.repeat_period == 0 {
            return Err(QueueError::InvalidCronExpression(
                "repeat requires a positive repeat period".into(),
            ));
        }
        Ok(())
    }

    /// First delivery time, or `None` for immediate delivery.
    pub fn first_delivery_at(&self, now: i64) -> QueueResult<Option<i64>> {
        if self.delay > 0 {
            return Ok(Some(now + self.delay as i64));
        }
        if let Some(cron) = self.cron_schedule()? {
            return Ok(cron.next_after(now));
        }
        if self.repeat > 0 {
            return Ok(Some(now + self.repeat_period as i64));
        }
        Ok(None)
    }

    /// Next firing after one at `now`.
    ///
    /// `burst` is the position inside the current repeat burst. Returns the
    /// next fire time, or `None` after the final firing, together with the
    /// burst position to store.
    pub fn next_delivery_at(&self, now: i64, burst: u32) -> QueueResult<(Option<i64>, u32)> {
        if self.repeat > 0 && burst < self.repeat {
            return Ok((Some(now + self.repeat_period as i64), burst + 1));
        }
        match self.cron_schedule()? {
            Some(cron) => Ok((cron.next_after(now), 0)),
            None => Ok((None, burst)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-01-01T00:00:00Z
    const T0: i64 = 1_704_067_200_000;

    #[test]
    fn test_parse_cron() {
        let cron = CronSchedule::parse("0 */5 * * * *").unwrap();
        assert_eq!(cron.expression(), "0 */5 * * * *");
        assert_eq!(cron.next_after(T0), Some(T0 + 5 * 60_000));
    }

    #[test]
    fn test_invalid_cron() {
        let err = CronSchedule::parse("not a cron").unwrap_err();
        assert!(matches!(err, QueueError::InvalidCronExpression(_)));
    }

    #[test]
    fn test_first_delivery() {
        let immediate = MessageSchedule::default();
        assert_eq!(immediate.first_delivery_at(T0).unwrap(), None);

        let delayed = MessageSchedule {
            delay: 5_000,
            cron: Some("0 0 * * * *".into()),
            ..Default::default()
        };
        assert_eq!(delayed.first_delivery_at(T0).unwrap(), Some(T0 + 5_000));

        let cron = MessageSchedule {
            cron: Some("0 0 * * * *".into()),
            ..Default::default()
        };
        assert_eq!(cron.first_delivery_at(T0).unwrap(), Some(T0 + 3_600_000));

        let repeat = MessageSchedule {
            repeat: 2,
            repeat_period: 1_000,
            ..Default::default()
        };
        assert_eq!(repeat.first_delivery_at(T0).unwrap(), Some(T0 + 1_000));
    }

    #[test]
    fn test_repeat_without_cron_ends() {
        let repeat = MessageSchedule {
            repeat: 2,
            repeat_period: 1_000,
            ..Default::default()
        };
        // three firings: the first plus two repeats
        let (next, burst) = repeat.next_delivery_at(T0, 0).unwrap();
        assert_eq!((next, burst), (Some(T0 + 1_000), 1));
        let (next, burst) = repeat.next_delivery_at(T0 + 1_000, burst).unwrap();
        assert_eq!((next, burst), (Some(T0 + 2_000), 2));
        let (next, _) = repeat.next_delivery_at(T0 + 2_000, burst).unwrap();
        assert_eq!(next, None);
    }

    #[test]
    fn test_repeat_burst_then_cron() {
        let schedule = MessageSchedule {
            cron: Some("0 0 * * * *".into()),
            repeat: 1,
            repeat_period: 10_000,
            ..Default::default()
        };
        let (next, burst) = schedule.next_delivery_at(T0, 0).unwrap();
        assert_eq!((next, burst), (Some(T0 + 10_000), 1));
        let (next, burst) = schedule.next_delivery_at(T0 + 10_000, burst).unwrap();
        assert_eq!((next, burst), (Some(T0 + 3_600_000), 0));
    }

    #[test]
    fn test_repeat_needs_period() {
        let schedule = MessageSchedule {
            repeat: 3,
            ..Default::default()
        };
        assert!(schedule.validate().is_err());
    }
}
