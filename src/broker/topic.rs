use crate::utils::{RelayError, Result};

/// Separator between topic levels.
pub const LEVEL_SEPARATOR: char = '/';
/// Matches exactly one topic level.
pub const SINGLE_LEVEL_WILDCARD: &str = "+";
/// Matches the remaining topic levels; only valid as the final filter level.
pub const MULTI_LEVEL_WILDCARD: &str = "#";

/// Returns `true` when `topic` satisfies the subscription `filter`.
///
/// A filter ending in `#` has that level stripped and matches any topic with
/// at least as many levels as the remainder, so `a/#` also matches `a`.
/// Otherwise the level counts must be equal. In both cases `+` matches any
/// single level and every other level must match exactly.
pub fn topic_matches(topic: &str, filter: &str) -> bool {
    let topic_levels: Vec<&str> = topic.split(LEVEL_SEPARATOR).collect();
    let mut filter_levels: Vec<&str> = filter.split(LEVEL_SEPARATOR).collect();

    let multi_level = filter_levels.last() == Some(&MULTI_LEVEL_WILDCARD);
    if multi_level {
        filter_levels.pop();
        if topic_levels.len() < filter_levels.len() {
            return false;
        }
    } else if topic_levels.len() != filter_levels.len() {
        return false;
    }

    filter_levels
        .iter()
        .zip(topic_levels.iter())
        .all(|(f, t)| *f == SINGLE_LEVEL_WILDCARD || f == t)
}

/// Checks that a subscription filter is syntactically valid.
///
/// `#` may only appear as the final level; both wildcards must occupy a whole
/// level.
pub fn validate_filter(filter: &str) -> Result<()> {
    if filter.is_empty() {
        return Err(RelayError::validation("topic filter must not be empty"));
    }

    let levels: Vec<&str> = filter.split(LEVEL_SEPARATOR).collect();
    let last = levels.len() - 1;
    for (index, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != MULTI_LEVEL_WILDCARD || index != last) {
            return Err(RelayError::validation(format!(
                "'#' must be the final level of filter '{filter}'"
            )));
        }
        if level.contains('+') && *level != SINGLE_LEVEL_WILDCARD {
            return Err(RelayError::validation(format!(
                "'+' must occupy a whole level in filter '{filter}'"
            )));
        }
    }
    Ok(())
}

/// Checks that a topic is publishable: non-empty and free of wildcards.
pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(RelayError::validation("topic must not be empty"));
    }
    if topic.contains(['+', '#']) {
        return Err(RelayError::validation(format!(
            "topic '{topic}' must not contain wildcards"
        )));
    }
    Ok(())
}
