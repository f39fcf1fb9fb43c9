//! Severity ordering and the alert classification decision.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Alert severity with a total order: info < warning < critical.
///
/// Labels outside the known set collapse to `Info`, matching how the rest
/// of the platform treats unrecognized severities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    /// Parse a severity label. Unknown labels map to `Info`.
    pub fn from_label(label: &str) -> Self {
        match label {
            "critical" => Severity::Critical,
            "warning" => Severity::Warning,
            _ => Severity::Info,
        }
    }

    /// Numeric rank used for escalation/recovery comparison.
    pub fn level(self) -> u8 {
        match self {
            Severity::Info => 1,
            Severity::Warning => 2,
            Severity::Critical => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl PartialOrd for Severity {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Severity {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.level().cmp(&other.level())
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an alert was sent for analysis. Selects the prompt template and is
/// recorded in result metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisReason {
    FirstOccurrence,
    Escalation,
    Recovery,
}

impl AnalysisReason {
    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisReason::FirstOccurrence => "first_occurrence",
            AnalysisReason::Escalation => "escalation",
            AnalysisReason::Recovery => "recovery",
        }
    }
}

impl fmt::Display for AnalysisReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of comparing a fresh alert against the last analyzed instance of
/// the same `(alert_name, instance)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// The alert warrants a new analysis, for the given reason.
    Analyze(AnalysisReason),
    /// Same severity as the last analyzed occurrence; skip the backend and
    /// record a duplicate reference instead.
    DuplicateSameSeverity,
}

impl Classification {
    pub fn reason_str(self) -> &'static str {
        match self {
            Classification::Analyze(reason) => reason.as_str(),
            Classification::DuplicateSameSeverity => "duplicate_same_severity",
        }
    }

    pub fn should_analyze(self) -> bool {
        matches!(self, Classification::Analyze(_))
    }
}

/// Classify an incoming severity against the severity of the most recent
/// analyzed occurrence, if any.
///
/// No prior occurrence is a first occurrence. A strictly higher severity is
/// an escalation, a strictly lower one a recovery; both re-trigger analysis
/// because the situation materially changed. Equal severity is a duplicate.
pub fn classify(new: Severity, prior: Option<Severity>) -> Classification {
    let Some(prior) = prior else {
        return Classification::Analyze(AnalysisReason::FirstOccurrence);
    };

    match new.cmp(&prior) {
        std::cmp::Ordering::Greater => Classification::Analyze(AnalysisReason::Escalation),
        std::cmp::Ordering::Less => Classification::Analyze(AnalysisReason::Recovery),
        std::cmp::Ordering::Equal => Classification::DuplicateSameSeverity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_order_is_total() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Critical);
        assert_eq!(Severity::from_label("unknown"), Severity::Info);
        assert_eq!(Severity::from_label("critical"), Severity::Critical);
    }

    #[test]
    fn first_occurrence_without_prior() {
        assert_eq!(
            classify(Severity::Critical, None),
            Classification::Analyze(AnalysisReason::FirstOccurrence)
        );
    }

    #[test]
    fn escalation_ladder() {
        // info -> warning -> critical across three alerts: first, then two
        // escalations.
        assert_eq!(
            classify(Severity::Info, None),
            Classification::Analyze(AnalysisReason::FirstOccurrence)
        );
        assert_eq!(
            classify(Severity::Warning, Some(Severity::Info)),
            Classification::Analyze(AnalysisReason::Escalation)
        );
        assert_eq!(
            classify(Severity::Critical, Some(Severity::Warning)),
            Classification::Analyze(AnalysisReason::Escalation)
        );
    }

    #[test]
    fn recovery_on_lower_severity() {
        assert_eq!(
            classify(Severity::Warning, Some(Severity::Critical)),
            Classification::Analyze(AnalysisReason::Recovery)
        );
    }

    #[test]
    fn duplicate_on_equal_severity() {
        let decision = classify(Severity::Critical, Some(Severity::Critical));
        assert_eq!(decision, Classification::DuplicateSameSeverity);
        assert!(!decision.should_analyze());
        assert_eq!(decision.reason_str(), "duplicate_same_severity");
    }

    #[test]
    fn classification_is_deterministic() {
        for new in [Severity::Info, Severity::Warning, Severity::Critical] {
            for prior in [
                None,
                Some(Severity::Info),
                Some(Severity::Warning),
                Some(Severity::Critical),
            ] {
                assert_eq!(classify(new, prior), classify(new, prior));
            }
        }
    }
}
