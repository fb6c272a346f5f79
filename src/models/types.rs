//! Typed vocabulary shared by the queue, log, adapters and health reporting.
//!
//! Every enum is persisted as lowercase text through `DeriveActiveEnum`, so the
//! database stays readable while Rust code never compares raw strings.

use std::fmt;
use std::str::FromStr;

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use thiserror::Error;
use utoipa::ToSchema;

/// Error returned when a string does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseKindError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $label:literal {
            $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
            EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
        )]
        #[sea_orm(rs_type = "String", db_type = "Text")]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $(
                $(#[$vmeta])*
                #[sea_orm(string_value = $text)]
                $variant,
            )+
        }

        impl $name {
            /// Stable lowercase name, identical to the persisted value.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseKindError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    _ => Err(ParseKindError {
                        kind: $label,
                        value: value.to_string(),
                    }),
                }
            }
        }
    };
}

text_enum! {
    /// Business entity kinds that can be pushed to external services.
    EntityType, "entity type" {
        Project => "project",
        TimeEntry => "time_entry",
        Expense => "expense",
        Inventory => "inventory",
        Quote => "quote",
    }
}

text_enum! {
    /// Mutation applied to the entity.
    SyncAction, "action" {
        Create => "create",
        Update => "update",
        Delete => "delete",
    }
}

text_enum! {
    /// External system a job is pushed to.
    TargetService, "target service" {
        Crm => "crm",
        Fsm => "fsm",
        Books => "books",
        People => "people",
        Desk => "desk",
        Quotewerks => "quotewerks",
    }
}

text_enum! {
    /// Queue job lifecycle.
    ///
    /// `pending → processing → success | pending (retry) | dead`, plus
    /// `pending → cancelled` and `processing → failed` for jobs whose target
    /// service is not configured. `success`, `dead`, `failed` and `cancelled`
    /// are terminal.
    JobStatus, "job status" {
        Pending => "pending",
        Processing => "processing",
        Success => "success",
        Failed => "failed",
        Dead => "dead",
        Cancelled => "cancelled",
    }
}

text_enum! {
    /// Outcome of a single logged attempt.
    LogStatus, "log status" {
        Success => "success",
        Error => "error",
    }
}

impl TargetService {
    /// All services in a stable order.
    pub const ALL: [TargetService; 6] = [
        TargetService::Crm,
        TargetService::Fsm,
        TargetService::Books,
        TargetService::People,
        TargetService::Desk,
        TargetService::Quotewerks,
    ];
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Dead | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Dispatch rank of a job. Lower values are dispatched sooner.
///
/// Stored as a small integer. Older call sites passed named levels, which are
/// accepted through [`Priority::from_str`] and the serde deserializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, ToSchema)]
#[schema(value_type = i16, example = 5)]
pub struct Priority(pub i16);

impl Priority {
    pub const CRITICAL: Priority = Priority(1);
    pub const HIGH: Priority = Priority(3);
    pub const MEDIUM: Priority = Priority(5);
    pub const LOW: Priority = Priority(8);
}

impl Default for Priority {
    fn default() -> Self {
        Priority::MEDIUM
    }
}

impl From<i16> for Priority {
    fn from(value: i16) -> Self {
        Priority(value)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Priority {
    type Err = ParseKindError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        if let Ok(rank) = normalized.parse::<i16>() {
            return Ok(Priority(rank));
        }

        match normalized.as_str() {
            "critical" | "urgent" => Ok(Priority::CRITICAL),
            "high" => Ok(Priority::HIGH),
            "medium" | "normal" => Ok(Priority::MEDIUM),
            "low" => Ok(Priority::LOW),
            _ => Err(ParseKindError {
                kind: "priority",
                value: value.to_string(),
            }),
        }
    }
}

impl Serialize for Priority {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i16(self.0)
    }
}

impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Rank(i64),
            Named(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Rank(rank) => i16::try_from(rank)
                .map(Priority)
                .map_err(|_| de::Error::custom(format!("priority {rank} out of range"))),
            Raw::Named(name) => name.parse().map_err(de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_priority_names_map_to_fixed_ranks() {
        assert_eq!("medium".parse::<Priority>().unwrap(), Priority(5));
        assert_eq!("Normal".parse::<Priority>().unwrap(), Priority(5));
        assert_eq!("high".parse::<Priority>().unwrap(), Priority(3));
        assert_eq!("urgent".parse::<Priority>().unwrap(), Priority(1));
        assert_eq!("low".parse::<Priority>().unwrap(), Priority(8));
        assert_eq!("7".parse::<Priority>().unwrap(), Priority(7));
        assert!("whenever".parse::<Priority>().is_err());
    }

    #[test]
    fn priority_deserializes_from_number_or_name() {
        let numeric: Priority = serde_json::from_str("2").unwrap();
        assert_eq!(numeric, Priority(2));

        let named: Priority = serde_json::from_str("\"medium\"").unwrap();
        assert_eq!(named, Priority::MEDIUM);

        assert!(serde_json::from_str::<Priority>("70000").is_err());
        assert_eq!(serde_json::to_string(&Priority::HIGH).unwrap(), "3");
    }

    #[test]
    fn lower_rank_sorts_first() {
        let mut ranks = vec![Priority::LOW, Priority::CRITICAL, Priority::MEDIUM];
        ranks.sort();
        assert_eq!(ranks, vec![Priority::CRITICAL, Priority::MEDIUM, Priority::LOW]);
    }

    #[test]
    fn enums_round_trip_through_text() {
        for service in TargetService::ALL {
            assert_eq!(service.as_str().parse::<TargetService>().unwrap(), service);
        }
        assert_eq!("TIME_ENTRY".parse::<EntityType>().unwrap(), EntityType::TimeEntry);
        let err = "fax".parse::<TargetService>().unwrap_err();
        assert_eq!(err.to_string(), "unknown target service 'fax'");
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Dead.is_terminal());
        assert!(JobStatus::Success.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }
}
