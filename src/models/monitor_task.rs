use chrono::{DateTime, Utc};

/// One pending cache check. Lives only in the monitor queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorTask {
    pub object_id: String,
    /// Zero-based; never exceeds the configured retry ceiling.
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub uploaded_at: DateTime<Utc>,
}

impl MonitorTask {
    pub fn new(object_id: impl Into<String>, uploaded_at: DateTime<Utc>) -> Self {
        Self {
            object_id: object_id.into(),
            retry_count: 0,
            enqueued_at: Utc::now(),
            uploaded_at,
        }
    }

    /// The same task, one retry further along.
    pub fn next_attempt(self) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            enqueued_at: Utc::now(),
            ..self
        }
    }
}
