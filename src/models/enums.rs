use crate::db::DatabaseError;
use serde::{Deserialize, Serialize};

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }
    };
}

str_enum!(TaskState {
    Queued => "queued",
    Processing => "processing",
    PendingReview => "pending_review",
    Completed => "completed",
    Failed => "failed",
    Rejected => "rejected",
    Pushing => "pushing",
    PushSuccess => "push_success",
    PushFailed => "push_failed",
});

impl TaskState {
    /// Extraction results are frozen from `Completed` onward; push outcome
    /// does not change them. These are the states eligible for dedup reuse.
    pub fn has_final_result(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Pushing | Self::PushSuccess | Self::PushFailed
        )
    }

    /// No further automatic transition will happen from this state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Rejected | Self::PushSuccess | Self::PushFailed
        )
    }
}

str_enum!(ReasonKind {
    MissingRequired => "missing_required",
    PatternMismatch => "pattern_mismatch",
    OutOfRange => "out_of_range",
    LengthViolation => "length_violation",
    ExpressionFailed => "expression_failed",
    LowConfidence => "low_confidence",
    ConsistencyMismatch => "consistency_mismatch",
});

str_enum!(ErrorClass {
    TransientIo => "transient_io",
    Content => "content",
    QualityGate => "quality_gate",
    Delivery => "delivery",
});

str_enum!(StrategyKind {
    Regex => "regex",
    Anchor => "anchor",
    Table => "table",
    Llm => "llm",
    Manual => "manual",
});

str_enum!(FieldType {
    String => "string",
    Number => "number",
    Integer => "integer",
    Date => "date",
    Boolean => "boolean",
});

str_enum!(Stage {
    Dedup => "dedup",
    Ocr => "ocr",
    Extraction => "extraction",
    Consistency => "consistency",
    Cleaning => "cleaning",
    Validation => "validation",
    Storage => "storage",
    Push => "push",
    Review => "review",
});

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn task_state_round_trip() {
        for (variant, s) in [
            (TaskState::Queued, "queued"),
            (TaskState::Processing, "processing"),
            (TaskState::PendingReview, "pending_review"),
            (TaskState::Completed, "completed"),
            (TaskState::Failed, "failed"),
            (TaskState::Rejected, "rejected"),
            (TaskState::Pushing, "pushing"),
            (TaskState::PushSuccess, "push_success"),
            (TaskState::PushFailed, "push_failed"),
        ] {
            assert_eq!(variant.as_str(), s);
            assert_eq!(TaskState::from_str(s).unwrap(), variant);
        }
    }

    #[test]
    fn serde_matches_as_str() {
        let json = serde_json::to_string(&TaskState::PendingReview).unwrap();
        assert_eq!(json, "\"pending_review\"");
        let json = serde_json::to_string(&ReasonKind::MissingRequired).unwrap();
        assert_eq!(json, "\"missing_required\"");
    }

    #[test]
    fn final_result_states() {
        assert!(TaskState::Completed.has_final_result());
        assert!(TaskState::PushFailed.has_final_result());
        assert!(!TaskState::Processing.has_final_result());
        assert!(!TaskState::PendingReview.has_final_result());
        assert!(!TaskState::Failed.has_final_result());
    }

    #[test]
    fn invalid_enum_returns_error() {
        assert!(TaskState::from_str("done").is_err());
        assert!(ReasonKind::from_str("").is_err());
    }
}
