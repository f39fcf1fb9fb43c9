//! Reason-conditioned prompt assembly for the analysis backend.
//!
//! Three templates share a skeleton (alert facts, extraction rules, the
//! required JSON shape) and differ in framing: a first occurrence asks for
//! a fresh root-cause analysis, an escalation stresses that mitigation so
//! far has not worked, a recovery asks what resolved the situation and
//! whether it can regress. Each template also sets a different default for
//! the `critical` flag in the response skeleton.

use crate::event::AlertPayload;
use crate::severity::{AnalysisReason, Severity};
use std::fmt::Write;

/// Keywords that select a technology focus for the prompt. Matched
/// case-insensitively against the alert name and description.
const TECHNOLOGY_KEYWORDS: &[&str] = &[
    "redis",
    "mongo",
    "postgres",
    "mysql",
    "nginx",
    "kafka",
    "elasticsearch",
    "rabbitmq",
    "cassandra",
    "disk",
    "cpu",
    "memory",
];

/// Derive the technology focus line from the alert name and description.
///
/// Falls back to a generic instruction when nothing matches, so the model
/// never invents a stack that the alert does not mention.
pub fn technology_hint(alert_name: &str, description: &str) -> String {
    let haystack = format!("{} {}", alert_name, description).to_lowercase();
    let matched: Vec<&str> = TECHNOLOGY_KEYWORDS
        .iter()
        .copied()
        .filter(|keyword| haystack.contains(keyword))
        .collect();

    if matched.is_empty() {
        "Use only technologies mentioned in the alert description.".to_string()
    } else {
        format!(
            "This alert concerns: {}. Reason only in terms of these technologies.",
            matched.join(", ")
        )
    }
}

/// Assemble the full prompt for one alert and analysis reason.
pub fn build_prompt(payload: &AlertPayload, reason: AnalysisReason) -> String {
    let alert_name = payload.alert_name().unwrap_or("Unknown");
    let severity = payload.severity();
    let instance = payload.instance().unwrap_or("Unknown");
    let description = payload.description().unwrap_or("No description");
    let summary = payload.summary().unwrap_or("No summary");
    let hint = technology_hint(alert_name, description);

    let (framing, critical_default) = match reason {
        AnalysisReason::FirstOccurrence => (
            "This alert fired for the first time on this instance. Perform a \
             full root-cause analysis of the incident described below.",
            severity == Severity::Critical,
        ),
        AnalysisReason::Escalation => (
            "This alert was analyzed before at a lower severity and has now \
             ESCALATED. Whatever mitigation was in place has not worked. \
             Focus on why the situation is worsening and what must change \
             immediately.",
            true,
        ),
        AnalysisReason::Recovery => (
            "This alert previously fired at a higher severity and is now \
             RECOVERING. Analyze what likely resolved the situation and \
             whether the improvement can regress.",
            false,
        ),
    };

    let mut prompt = String::new();
    let _ = write!(
        prompt,
        "You are a Senior Site Reliability Engineer analyzing a production alert.\n\
         \n\
         {framing}\n\
         \n\
         RULES:\n\
         - Use ONLY technical details that appear in this alert's description.\n\
         - Quote exact server names, IPs and metric values from the description.\n\
         - Do not invent details or borrow context from other alerts.\n\
         - {hint}\n\
         \n\
         ALERT:\n\
         - Name: {alert_name}\n\
         - Severity: {severity}\n\
         - Instance: {instance}\n\
         \n\
         DESCRIPTION:\n\
         {description}\n\
         \n\
         SUMMARY:\n\
         {summary}\n\
         \n\
         Respond with a single valid JSON object and nothing else:\n\
         {{\n\
         \x20 \"root_cause\": {{\n\
         \x20   \"technical_reason\": \"exact problem from the description with its metrics\",\n\
         \x20   \"affected_component\": \"specific servers/IPs from the description\",\n\
         \x20   \"impact\": \"impact as stated in the description\"\n\
         \x20 }},\n\
         \x20 \"immediate_actions\": [\n\
         \x20   {{\n\
         \x20     \"action\": \"specific action with server names and commands\",\n\
         \x20     \"rationale\": \"why this follows from the root cause\",\n\
         \x20     \"priority\": \"high\"\n\
         \x20   }}\n\
         \x20 ],\n\
         \x20 \"critical\": {critical_default}\n\
         }}\n"
    );
    prompt
}
