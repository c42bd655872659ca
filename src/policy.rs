//! Durability and Consistency Policies
//!
//! Maps an operation class to the write acknowledgement a storage call must
//! wait for, and the read freshness a read must observe.
//!
//! ```text
//! Class            Write ack      Journal    Read
//! financial        majority       yes        primary
//! important        single         yes        -
//! log              single         no         -
//! fire-and-forget  none           -          -
//! analytics        -              -          secondary preferred
//! ```
//!
//! Policies are plain values handed to the coordinators at construction;
//! there is no process-wide policy.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::LedgerError;

/// How many replicas must acknowledge a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Acknowledgement {
    /// Do not wait for any acknowledgement
    None,
    /// Primary only
    Single,
    /// Majority of the replica set
    Majority,
}

/// Write acknowledgement level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WriteLevel {
    pub ack: Acknowledgement,
    /// Wait for the write to reach the on-disk journal
    pub journal: bool,
    /// Give up waiting for acknowledgement after this long
    #[serde(default, with = "opt_millis")]
    pub timeout: Option<Duration>,
}

impl WriteLevel {
    pub const FINANCIAL: WriteLevel = WriteLevel {
        ack: Acknowledgement::Majority,
        journal: true,
        timeout: Some(Duration::from_secs(5)),
    };

    pub const IMPORTANT: WriteLevel = WriteLevel {
        ack: Acknowledgement::Single,
        journal: true,
        timeout: None,
    };

    pub const LOG: WriteLevel = WriteLevel {
        ack: Acknowledgement::Single,
        journal: false,
        timeout: None,
    };

    pub const FIRE_AND_FORGET: WriteLevel = WriteLevel {
        ack: Acknowledgement::None,
        journal: false,
        timeout: None,
    };

    /// True if this level is at least as strong as the financial level
    pub fn is_financial_grade(&self) -> bool {
        self.ack == Acknowledgement::Majority && self.journal
    }

    pub fn is_acknowledged(&self) -> bool {
        self.ack != Acknowledgement::None
    }
}

impl fmt::Display for WriteLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ack = match self.ack {
            Acknowledgement::None => "w0",
            Acknowledgement::Single => "w1",
            Acknowledgement::Majority => "majority",
        };
        write!(f, "{}{}", ack, if self.journal { "+j" } else { "" })
    }
}

/// Read freshness level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadLevel {
    /// Strongly consistent: read from the primary
    Primary,
    /// Stale-tolerant: any replica, secondaries first
    SecondaryPreferred,
    /// Lowest latency member
    Nearest,
}

impl ReadLevel {
    pub fn is_strong(&self) -> bool {
        matches!(self, ReadLevel::Primary)
    }
}

/// Classes of write operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteClass {
    /// Balance movement, transfer intents, transaction records
    Financial,
    Important,
    /// Logs and metrics
    Log,
    FireAndForget,
}

/// Classes of read operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadClass {
    /// Balance checks and anything feeding a money decision
    Financial,
    /// Reports and dashboards
    Analytics,
    Nearest,
}

/// Write acknowledgement per operation class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DurabilityPolicy {
    pub financial: WriteLevel,
    pub important: WriteLevel,
    pub log: WriteLevel,
    pub fire_and_forget: WriteLevel,
}

impl Default for DurabilityPolicy {
    fn default() -> Self {
        Self {
            financial: WriteLevel::FINANCIAL,
            important: WriteLevel::IMPORTANT,
            log: WriteLevel::LOG,
            fire_and_forget: WriteLevel::FIRE_AND_FORGET,
        }
    }
}

impl DurabilityPolicy {
    #[inline]
    pub fn write_level(&self, class: WriteClass) -> WriteLevel {
        match class {
            WriteClass::Financial => self.financial,
            WriteClass::Important => self.important,
            WriteClass::Log => self.log,
            WriteClass::FireAndForget => self.fire_and_forget,
        }
    }
}

/// Read freshness per operation class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsistencyPolicy {
    pub financial: ReadLevel,
    pub analytics: ReadLevel,
    pub nearest: ReadLevel,
}

impl Default for ConsistencyPolicy {
    fn default() -> Self {
        Self {
            financial: ReadLevel::Primary,
            analytics: ReadLevel::SecondaryPreferred,
            nearest: ReadLevel::Nearest,
        }
    }
}

impl ConsistencyPolicy {
    #[inline]
    pub fn read_level(&self, class: ReadClass) -> ReadLevel {
        match class {
            ReadClass::Financial => self.financial,
            ReadClass::Analytics => self.analytics,
            ReadClass::Nearest => self.nearest,
        }
    }
}

/// Both policies, as handed to coordinators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoragePolicy {
    pub durability: DurabilityPolicy,
    pub consistency: ConsistencyPolicy,
}

impl StoragePolicy {
    #[inline]
    pub fn write_level(&self, class: WriteClass) -> WriteLevel {
        self.durability.write_level(class)
    }

    #[inline]
    pub fn read_level(&self, class: ReadClass) -> ReadLevel {
        self.consistency.read_level(class)
    }

    /// Reject configurations that would weaken money movement
    pub fn validate(&self) -> Result<(), LedgerError> {
        if !self.durability.financial.is_financial_grade() {
            return Err(LedgerError::Config(format!(
                "financial write level must be majority+j, got {}",
                self.durability.financial
            )));
        }
        if !self.consistency.financial.is_strong() {
            return Err(LedgerError::Config(format!(
                "financial read level must be primary, got {:?}",
                self.consistency.financial
            )));
        }
        Ok(())
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_levels_match_table() {
        let policy = StoragePolicy::default();

        let financial = policy.write_level(WriteClass::Financial);
        assert_eq!(financial.ack, Acknowledgement::Majority);
        assert!(financial.journal);
        assert_eq!(financial.timeout, Some(Duration::from_secs(5)));

        let important = policy.write_level(WriteClass::Important);
        assert_eq!(important.ack, Acknowledgement::Single);
        assert!(important.journal);

        let log = policy.write_level(WriteClass::Log);
        assert_eq!(log.ack, Acknowledgement::Single);
        assert!(!log.journal);

        assert!(!policy.write_level(WriteClass::FireAndForget).is_acknowledged());

        assert_eq!(policy.read_level(ReadClass::Financial), ReadLevel::Primary);
        assert_eq!(
            policy.read_level(ReadClass::Analytics),
            ReadLevel::SecondaryPreferred
        );
    }

    #[test]
    fn test_default_policy_validates() {
        assert!(StoragePolicy::default().validate().is_ok());
    }

    #[test]
    fn test_weak_financial_write_rejected() {
        let mut policy = StoragePolicy::default();
        policy.durability.financial = WriteLevel::IMPORTANT;
        let err = policy.validate().unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_stale_financial_read_rejected() {
        let mut policy = StoragePolicy::default();
        policy.consistency.financial = ReadLevel::Nearest;
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_policy_yaml_override() {
        let yaml = r#"
durability:
  log:
    ack: none
    journal: false
consistency:
  analytics: nearest
"#;
        let policy: StoragePolicy = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(policy.durability.log.ack, Acknowledgement::None);
        assert_eq!(policy.durability.financial, WriteLevel::FINANCIAL);
        assert_eq!(policy.consistency.analytics, ReadLevel::Nearest);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_display() {
        assert_eq!(WriteLevel::FINANCIAL.to_string(), "majority+j");
        assert_eq!(WriteLevel::LOG.to_string(), "w1");
    }
}
