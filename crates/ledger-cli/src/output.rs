use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ledger_core::{AiAttempt, Decision, Note, Override, OverridePattern, RecurringFailure, Session};
use serde::Serialize;

/// Prints `value` as pretty JSON when `json` is set, otherwise runs `render`.
pub fn emit<T, F>(json: bool, value: &T, render: F) -> Result<()>
where
    T: Serialize + ?Sized,
    F: FnOnce(&T),
{
    if json {
        let text = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
        println!("{text}");
    } else {
        render(value);
    }
    Ok(())
}

fn stamp(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M").to_string()
}

fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

pub fn decisions(decisions: &[Decision]) {
    if decisions.is_empty() {
        println!("No decisions found");
        return;
    }
    for decision in decisions {
        println!(
            "{}  {}  [{}] {}{}",
            decision.id,
            stamp(&decision.created_at),
            decision.status,
            decision
                .category
                .as_deref()
                .map(|category| format!("({category}) "))
                .unwrap_or_default(),
            decision.decision
        );
        if let Some(rationale) = &decision.rationale {
            println!("    why: {rationale}");
        }
        if let Some(rejected) = decision.alternatives_rejected.as_ref().filter(|r| !r.is_empty()) {
            println!("    rejected: {}", rejected.join(", "));
        }
    }
}

pub fn overrides(overrides: &[Override]) {
    if overrides.is_empty() {
        println!("No overrides found");
        return;
    }
    for recorded in overrides {
        println!(
            "{}  {}  decision {}: {}",
            recorded.id,
            stamp(&recorded.created_at),
            short(&recorded.decision_id),
            recorded.rationale
        );
    }
}

pub fn override_patterns(patterns: &[OverridePattern]) {
    if patterns.is_empty() {
        println!("No repeatedly overridden decisions");
        return;
    }
    for pattern in patterns {
        println!(
            "{:>3}x  {}  {}",
            pattern.override_count,
            pattern.decision.id,
            pattern.decision.decision
        );
    }
}

pub fn attempts(attempts: &[AiAttempt]) {
    if attempts.is_empty() {
        println!("No attempts found");
        return;
    }
    for attempt in attempts {
        println!(
            "{}  {}  [{}] {} -> {}",
            attempt.id,
            stamp(&attempt.created_at),
            attempt.outcome,
            attempt.problem,
            attempt.suggestion
        );
        if let Some(reason) = &attempt.failure_reason {
            println!("    reason: {reason}");
        }
    }
}

pub fn recurring_failures(failures: &[RecurringFailure]) {
    if failures.is_empty() {
        println!("No recurring failures");
        return;
    }
    for failure in failures {
        println!(
            "{:>3}x  last {}  {}",
            failure.failure_count,
            stamp(&failure.last_failure),
            failure.suggestion
        );
    }
}

pub fn notes(notes: &[Note]) {
    if notes.is_empty() {
        println!("No notes found");
        return;
    }
    for note in notes {
        println!("{}  {}  {}", note.id, stamp(&note.created_at), note.content);
    }
}

pub fn sessions(sessions: &[Session]) {
    if sessions.is_empty() {
        println!("No sessions found");
        return;
    }
    for session in sessions {
        match &session.parent_session_id {
            Some(parent) => println!(
                "{}  {}  {} (forked from {})",
                session.id,
                stamp(&session.created_at),
                session.name,
                short(parent)
            ),
            None => println!(
                "{}  {}  {}",
                session.id,
                stamp(&session.created_at),
                session.name
            ),
        }
    }
}
