use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn into_inner(self) -> DateTime<Utc> {
        self.0
    }

    pub fn elapsed(&self) -> chrono::Duration {
        Utc::now().signed_duration_since(self.0)
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::now()
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(time: DateTime<Utc>) -> Self {
        Self(time)
    }
}

impl From<Timestamp> for DateTime<Utc> {
    fn from(timestamp: Timestamp) -> Self {
        timestamp.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl std::ops::Deref for Timestamp {
    type Target = DateTime<Utc>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::sleep;

    use super::*;

    #[test]
    fn test_timestamp_now() {
        let timestamp = Timestamp::now();
        assert!(timestamp.elapsed().num_seconds() < 1);
    }

    #[test]
    fn test_timestamp_from_datetime() {
        let time = Utc::now();
        let timestamp = Timestamp::from(time);
        assert_eq!(timestamp.into_inner(), time);
    }

    #[tokio::test]
    async fn test_timestamp_ordering() {
        let first = Timestamp::now();
        sleep(Duration::from_millis(5)).await;
        let second = Timestamp::now();
        assert!(first < second);
    }

    #[test]
    fn test_timestamp_display_is_rfc3339() {
        let timestamp = Timestamp::now();
        let display = format!("{}", timestamp);
        assert!(DateTime::parse_from_rfc3339(&display).is_ok());
    }

    #[test]
    fn test_timestamp_serde() {
        let timestamp = Timestamp::now();
        let serialized = serde_json::to_string(&timestamp).unwrap();
        let deserialized: Timestamp = serde_json::from_str(&serialized).unwrap();
        assert_eq!(timestamp, deserialized);
    }
}
