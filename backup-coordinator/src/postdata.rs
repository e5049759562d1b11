//! Postdata replay order.
//!
//! Statements sort by category, stable within a category:
//! indexes, index metadata, constraints, foreign keys, rules, triggers,
//! event triggers, event trigger metadata, comments, then anything else.
//! Each run of equal categories is a tier; statements in a tier have no
//! dependencies on each other and run concurrently up to `jobs`.

use crate::error::CoordinatorError;
use crate::toc::Statement;
use futures_util::stream::{self, StreamExt};
use std::future::Future;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PostdataCategory {
    Index,
    IndexMetadata,
    Constraint,
    ForeignKey,
    Rule,
    Trigger,
    EventTrigger,
    EventTriggerMetadata,
    Comment,
    Other,
}

impl PostdataCategory {
    pub fn of(statement: &Statement) -> Self {
        match statement.entry.objecttype.as_str() {
            "INDEX" => Self::Index,
            "INDEX METADATA" => Self::IndexMetadata,
            "CONSTRAINT" if statement.sql.to_ascii_uppercase().contains("FOREIGN KEY") => Self::ForeignKey,
            "CONSTRAINT" => Self::Constraint,
            "FOREIGN KEY" => Self::ForeignKey,
            "RULE" => Self::Rule,
            "TRIGGER" => Self::Trigger,
            "EVENT TRIGGER" => Self::EventTrigger,
            "EVENT TRIGGER METADATA" => Self::EventTriggerMetadata,
            "COMMENT" => Self::Comment,
            _ => Self::Other,
        }
    }
}

/// Group statements into ordered tiers.
pub fn tiers(statements: Vec<Statement>) -> Vec<(PostdataCategory, Vec<Statement>)> {
    let mut keyed: Vec<(PostdataCategory, Statement)> = statements
        .into_iter()
        .map(|s| (PostdataCategory::of(&s), s))
        .collect();
    keyed.sort_by_key(|(category, _)| *category);

    let mut out: Vec<(PostdataCategory, Vec<Statement>)> = Vec::new();
    for (category, statement) in keyed {
        match out.last_mut() {
            Some((last, group)) if *last == category => group.push(statement),
            _ => out.push((category, vec![statement])),
        }
    }
    out
}

/// Apply every tier in order, at most `jobs` statements at a time.
///
/// Returns the failed statements. With `stop_on_error` no later tier starts
/// once a tier has a failure.
pub async fn apply_in_tiers<F, Fut>(
    statements: Vec<Statement>,
    jobs: usize,
    stop_on_error: bool,
    apply: F,
) -> Vec<(Statement, CoordinatorError)>
where
    F: Fn(Statement) -> Fut,
    Fut: Future<Output = (Statement, Result<(), CoordinatorError>)>,
{
    let mut failures = Vec::new();
    for (category, tier) in tiers(statements) {
        tracing::debug!(?category, statements = tier.len(), "Applying postdata tier");
        let results: Vec<_> = stream::iter(tier.into_iter().map(&apply))
            .buffer_unordered(jobs.max(1))
            .collect()
            .await;
        failures.extend(
            results
                .into_iter()
                .filter_map(|(statement, result)| result.err().map(|e| (statement, e))),
        );
        if stop_on_error && !failures.is_empty() {
            break;
        }
    }
    failures
}
