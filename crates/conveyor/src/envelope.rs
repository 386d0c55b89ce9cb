use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Serialized job descriptor: the handler's type tag plus its arguments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub job: String,
    pub data: serde_json::Value,
}

impl Payload {
    pub fn new(job: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            job: job.into(),
            data,
        }
    }
}

/// A job as it travels through a driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub queue: String,
    pub payload: Payload,
    /// Number of leases taken on this job so far
    pub attempts: u32,
    /// The job must not be leased before this instant
    pub available_at: DateTime<Utc>,
    /// Set while leased; once passed the job is visible again
    pub reserved_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Where a stored job sits relative to a given instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Delayed,
    Reserved,
}

impl Envelope {
    /// Build a fresh envelope with a time-ordered id
    pub fn new(
        queue: impl Into<String>,
        payload: Payload,
        available_at: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            queue: queue.into(),
            payload,
            attempts: 0,
            available_at,
            reserved_until: None,
            created_at,
        }
    }

    pub fn job_name(&self) -> &str {
        &self.payload.job
    }

    pub fn state(&self, now: DateTime<Utc>) -> JobState {
        match self.reserved_until {
            Some(until) if until > now => JobState::Reserved,
            // An expired lease counts as pending again
            Some(_) => JobState::Pending,
            None if self.available_at > now => JobState::Delayed,
            None => JobState::Pending,
        }
    }

    /// Whether `dequeue_lease` may hand this job out at `now`
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        match self.reserved_until {
            Some(until) => until <= now,
            None => self.available_at <= now,
        }
    }

    /// Take a lease: bump the attempt counter and hide the job until
    /// `now + lease`.
    pub fn reserve(&mut self, now: DateTime<Utc>, lease: Duration) {
        self.attempts += 1;
        self.reserved_until = Some(after(now, lease));
    }
}

/// When a delayed dispatch becomes visible
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    At(DateTime<Utc>),
    For(Duration),
    Seconds(u64),
}

impl Delay {
    pub fn available_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Delay::At(instant) => instant,
            Delay::For(duration) => after(now, duration),
            Delay::Seconds(secs) => after(now, Duration::from_secs(secs)),
        }
    }
}

impl From<DateTime<Utc>> for Delay {
    fn from(instant: DateTime<Utc>) -> Self {
        Delay::At(instant)
    }
}

impl From<Duration> for Delay {
    fn from(duration: Duration) -> Self {
        Delay::For(duration)
    }
}

impl From<u64> for Delay {
    fn from(secs: u64) -> Self {
        Delay::Seconds(secs)
    }
}

/// `now + delay`, saturating at the largest representable instant
pub(crate) fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(now: DateTime<Utc>) -> Envelope {
        Envelope::new("default", Payload::new("noop", serde_json::Value::Null), now, now)
    }

    #[test]
    fn delay_forms_agree() {
        let now = Utc::now();
        let sixty = now + chrono::Duration::seconds(60);

        assert_eq!(Delay::from(60u64).available_at(now), sixty);
        assert_eq!(Delay::from(Duration::from_secs(60)).available_at(now), sixty);
        assert_eq!(Delay::from(sixty).available_at(now), sixty);
    }

    #[test]
    fn expired_lease_is_visible_again() {
        let now = Utc::now();
        let mut job = envelope(now);

        job.reserve(now, Duration::from_secs(10));
        assert_eq!(job.attempts, 1);
        assert_eq!(job.state(now), JobState::Reserved);
        assert!(!job.is_available(now + chrono::Duration::seconds(9)));

        let expiry = now + chrono::Duration::seconds(10);
        assert!(job.is_available(expiry));
        assert_eq!(job.state(expiry), JobState::Pending);
    }

    #[test]
    fn future_job_is_delayed() {
        let now = Utc::now();
        let mut job = envelope(now);
        job.available_at = now + chrono::Duration::seconds(1);

        assert_eq!(job.state(now), JobState::Delayed);
        assert!(!job.is_available(now));
    }

    #[test]
    fn ids_sort_in_creation_order() {
        let now = Utc::now();
        let ids: Vec<String> = (0..32).map(|_| envelope(now).id).collect();
        let mut sorted = ids.clone();
        sorted.sort();

        assert_eq!(ids, sorted);
    }
}
