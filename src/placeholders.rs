//! Legacy placeholder substitution and cleanup.
//!
//! Older dashboards send raw SQL with `{{name}}` tokens instead of structured
//! filter metadata. This module substitutes resolved values directly into the
//! text and strips whatever stays unresolved so the statement remains valid
//! SQL when filters are unset. New callers should prefer the parameterized
//! path in `filter_injection`; this one is kept for backward compatibility.

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Upper bound on cleanup iterations before remaining tokens are force-nulled.
const MAX_CLEANUP_ITERATIONS: usize = 20;

/// A single condition of the form `col <op> value`, `col BETWEEN a AND b`, or
/// `col IN (...)`, where values may be quoted or bare.
const CONDITION: &str = r"[\w.]+\s*(?:(?:NOT\s+)?BETWEEN\s+(?:'[^']*'|[^\s()']+)\s+AND\s+(?:'[^']*'|[^\s()']+)|(?:NOT\s+)?IN\s*\([^()]*\)|(?:(?:>=|<=|!=|<>|=|>|<)\s*|(?:NOT\s+)?I?LIKE\s+)(?:'[^']*'|[^\s()']+))";

lazy_static! {
    static ref PLACEHOLDER_TOKEN: Regex = Regex::new(r"\{\{\s*([^{}]*?)\s*\}\}").unwrap();
    static ref VALID_KEY: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_.]{0,127}$").unwrap();
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();

    // Condition removal, anchored three ways: connector-prefixed, directly
    // after WHERE with a following connector, and as the whole WHERE clause.
    static ref CONNECTOR_CONDITION: Regex =
        Regex::new(&format!(r"(?i)\s+(?:AND|OR)\s+{CONDITION}")).unwrap();
    static ref WHERE_CONDITION_CONNECTOR: Regex =
        Regex::new(&format!(r"(?i)\bWHERE\s+{CONDITION}\s+(?:AND|OR)\s+")).unwrap();
    static ref WHERE_CONDITION_ONLY: Regex =
        Regex::new(&format!(r"(?i)\bWHERE\s+{CONDITION}")).unwrap();

    // Defensive idioms the AI wraps around unresolved placeholders.
    static ref CASE_LIKE_NULL: Regex = Regex::new(
        r"(?is)CASE\s+WHEN\s+'[^']*\{\{[^{}]*\}\}[^']*'\s+LIKE\s+'NULL'\s+THEN\s+TRUE\s+ELSE\s+(.+?)\s+END"
    )
    .unwrap();
    static ref CASE_ELSE_TRUE: Regex = Regex::new(
        r"(?is)CASE\s+WHEN\s+'[^']*\{\{[^{}]*\}\}[^']*'.*?ELSE\s+TRUE\s+END"
    )
    .unwrap();
    static ref TO_DATE_PLACEHOLDER: Regex =
        Regex::new(r"(?i)to_date\s*\(\s*'[^']*\{\{[^{}]*\}\}[^']*'\s*,[^()]*\)").unwrap();
    static ref COALESCE_NULLIF: Regex = Regex::new(
        r"(?i)COALESCE\s*\(\s*NULLIF\s*\(\s*'[^']*\{\{[^{}]*\}\}[^']*'\s*,[^()]*\)\s*,\s*([^()]+?)\s*\)"
    )
    .unwrap();
    static ref CAST_PLACEHOLDER: Regex =
        Regex::new(r"'[^']*\{\{[^{}]*\}\}[^']*'\s*::\s*[A-Za-z_][A-Za-z0-9_]*").unwrap();
    static ref QUOTED_PLACEHOLDER: Regex = Regex::new(r"'[^']*\{\{[^{}]*\}\}[^']*'").unwrap();

    // Redundant truths left behind by the collapses above.
    static ref AND_TRUE: Regex = Regex::new(r"(?i)\s+AND\s+TRUE\b").unwrap();
    static ref OR_TRUE: Regex = Regex::new(r"(?i)\s+OR\s+TRUE\b").unwrap();
    static ref WHERE_TRUE_CONNECTOR: Regex =
        Regex::new(r"(?i)\bWHERE\s+TRUE\s+(?:AND|OR)\s+").unwrap();
    static ref WHERE_TRUE_ONLY: Regex = Regex::new(r"(?i)\bWHERE\s+TRUE\b").unwrap();
    static ref WHERE_BEFORE_TERMINATOR: Regex =
        Regex::new(r"(?i)\bWHERE\s+(GROUP\s+BY|ORDER\s+BY|LIMIT|HAVING)\b").unwrap();
    static ref WHERE_TRAILING: Regex = Regex::new(r"(?i)\bWHERE\s*$").unwrap();
}

/// Substitute resolved `{{key}}` tokens with their values.
///
/// Values are spliced into the text with embedded single quotes doubled;
/// the surrounding quoting is expected to live in the template itself.
/// Keys that fail the identifier check are left in place with a warning,
/// as are keys with no resolved value — the cleanup stage handles those.
pub fn inject_placeholders(sql: &str, values: &HashMap<String, String>) -> String {
    PLACEHOLDER_TOKEN
        .replace_all(sql, |caps: &Captures| {
            let key = &caps[1];
            if !VALID_KEY.is_match(key) {
                warn!("ignoring placeholder with invalid key: {:?}", key);
                return caps[0].to_string();
            }
            match values.get(key) {
                Some(value) => value.replace('\'', "''"),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Remove whole `AND`/`OR` conditions whose value side still carries an
/// unresolved `{{...}}` token.
///
/// Handles simple comparisons, `BETWEEN x AND y`, `LIKE`, and parenthesized
/// `IN (...)` lists, with quoted or bare values. A `WHERE` clause that was
/// nothing but one unresolved condition becomes `WHERE 1=1` so no dangling
/// keyword is left behind.
pub fn remove_unresolved_conditions(sql: &str) -> String {
    let keep_unless_unresolved = |caps: &Captures, replacement: &str| {
        if caps[0].contains("{{") {
            replacement.to_string()
        } else {
            caps[0].to_string()
        }
    };

    let result = CONNECTOR_CONDITION
        .replace_all(sql, |c: &Captures| keep_unless_unresolved(c, ""))
        .into_owned();
    let result = WHERE_CONDITION_CONNECTOR
        .replace_all(&result, |c: &Captures| keep_unless_unresolved(c, "WHERE "))
        .into_owned();
    let result = WHERE_CONDITION_ONLY
        .replace_all(&result, |c: &Captures| {
            keep_unless_unresolved(c, "WHERE 1=1")
        })
        .into_owned();

    collapse_whitespace(&result)
}

/// Strip every remaining `{{...}}` token from a statement.
///
/// Fallback for AI-emitted defensive SQL that the targeted condition removal
/// does not fully clean. Runs a bounded fixed-point loop: collapse known
/// defensive idioms, drop redundant truths, remove still-unresolved
/// conditions, and bail out to a blanket `NULL` substitution when an
/// iteration makes no progress. The returned text contains no placeholder
/// tokens and keeps its leading SELECT/WITH intact.
pub fn strip_all_unresolved_placeholders(sql: &str) -> String {
    let mut current = sql.to_string();

    for iteration in 0..MAX_CLEANUP_ITERATIONS {
        if !current.contains("{{") {
            break;
        }
        let before = current.clone();

        // Collapse defensive idioms. The LIKE-'NULL' guard must run before
        // the generic ELSE TRUE collapse so its kept branch survives.
        current = CASE_LIKE_NULL.replace_all(&current, "${1}").into_owned();
        current = CASE_ELSE_TRUE.replace_all(&current, "TRUE").into_owned();
        current = TO_DATE_PLACEHOLDER
            .replace_all(&current, "NULL")
            .into_owned();
        current = COALESCE_NULLIF.replace_all(&current, "${1}").into_owned();
        current = CAST_PLACEHOLDER.replace_all(&current, "NULL").into_owned();
        current = QUOTED_PLACEHOLDER
            .replace_all(&current, "NULL")
            .into_owned();

        // Drop truths the collapses made redundant.
        current = WHERE_TRUE_CONNECTOR
            .replace_all(&current, "WHERE ")
            .into_owned();
        current = AND_TRUE.replace_all(&current, "").into_owned();
        current = OR_TRUE.replace_all(&current, "").into_owned();

        // Conditions still holding a raw (unquoted) placeholder.
        current = remove_unresolved_conditions(&current);

        if current == before {
            debug!(
                "placeholder cleanup made no progress at iteration {}, nulling remaining tokens",
                iteration
            );
            current = PLACEHOLDER_TOKEN.replace_all(&current, "NULL").into_owned();
            break;
        }
    }

    // The loop cap can still leave tokens behind on pathological input.
    if current.contains("{{") {
        current = PLACEHOLDER_TOKEN.replace_all(&current, "NULL").into_owned();
    }

    finalize(&current)
}

/// Normalize `WHERE TRUE`, empty `WHERE`, and whitespace.
fn finalize(sql: &str) -> String {
    let result = WHERE_TRUE_CONNECTOR.replace_all(sql, "WHERE ").into_owned();
    let result = AND_TRUE.replace_all(&result, "").into_owned();
    let result = OR_TRUE.replace_all(&result, "").into_owned();
    let result = WHERE_TRUE_ONLY.replace_all(&result, "").into_owned();
    let result = collapse_whitespace(&result);
    let result = WHERE_BEFORE_TERMINATOR
        .replace_all(&result, "${1}")
        .into_owned();
    let result = WHERE_TRAILING.replace_all(&result, "").into_owned();
    collapse_whitespace(&result)
}

fn collapse_whitespace(sql: &str) -> String {
    WHITESPACE.replace_all(sql, " ").trim().to_string()
}
