//! Calendar periods and message grouping.
//!
//! Weeks run Monday through Sunday, months from the 1st to the last day.
//! All boundaries are UTC dates and both ends are inclusive.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Week,
    Month,
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Week => write!(f, "week"),
            Self::Month => write!(f, "month"),
        }
    }
}

impl Granularity {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "week" | "weekly" => Some(Self::Week),
            "month" | "monthly" => Some(Self::Month),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Period {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub granularity: Granularity,
}

impl Period {
    /// The period of `granularity` that contains `date`.
    pub fn containing(date: NaiveDate, granularity: Granularity) -> Self {
        match granularity {
            Granularity::Week => {
                let offset = date.weekday().num_days_from_monday() as i64;
                let start = date - Duration::days(offset);
                Self {
                    start,
                    end: start + Duration::days(6),
                    granularity,
                }
            }
            Granularity::Month => {
                let start = date.with_day(1).unwrap_or(date);
                let next_month = if start.month() == 12 {
                    NaiveDate::from_ymd_opt(start.year() + 1, 1, 1)
                } else {
                    NaiveDate::from_ymd_opt(start.year(), start.month() + 1, 1)
                };
                let end = next_month
                    .and_then(|d| d.pred_opt())
                    .unwrap_or(start);
                Self {
                    start,
                    end,
                    granularity,
                }
            }
        }
    }

    /// Stable identity: `"{granularity}:{start}:{end}"`.
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.granularity, self.start, self.end)
    }

    /// True while `today` still falls inside the period, i.e. it has not closed.
    pub fn is_open(&self, today: NaiveDate) -> bool {
        self.start <= today && today <= self.end
    }

    pub fn label(&self) -> String {
        match self.granularity {
            Granularity::Week => {
                if self.start.month() == self.end.month() {
                    format!(
                        "Week of {}-{}",
                        self.start.format("%b %-d"),
                        self.end.format("%-d")
                    )
                } else {
                    format!(
                        "Week of {} - {}",
                        self.start.format("%b %-d"),
                        self.end.format("%b %-d")
                    )
                }
            }
            Granularity::Month => self.start.format("%B %Y").to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub timestamp: DateTime<Utc>,
    pub role: String,
    pub content: String,
}

/// A period together with the messages that fall inside it.
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodGroup {
    pub period: Period,
    pub messages: Vec<Message>,
}

/// Bucket messages by calendar period, newest period first.
///
/// Messages keep their original relative order inside each bucket.
pub fn group_messages(messages: &[Message], granularity: Granularity) -> Vec<PeriodGroup> {
    let mut buckets: BTreeMap<NaiveDate, PeriodGroup> = BTreeMap::new();
    for message in messages {
        let period = Period::containing(message.timestamp.date_naive(), granularity);
        buckets
            .entry(period.start)
            .or_insert_with(|| PeriodGroup {
                period,
                messages: Vec::new(),
            })
            .messages
            .push(message.clone());
    }
    buckets.into_values().rev().collect()
}
