//! Topic normalization, device prefixing and wildcard matching
//!
//! Topics are `/`-delimited. Every topic that enters the engine is normalized
//! the same way so that patterns and inbound topics compare segment by segment.

use thiserror::Error;

/// Single-level wildcard segment
pub const SINGLE_LEVEL_WILDCARD: &str = "+";
/// Multi-level wildcard segment (must terminate a pattern)
pub const MULTI_LEVEL_WILDCARD: &str = "#";

/// Normalize a topic: drop empty segments, so no leading, trailing or doubled `/`
pub fn normalize_topic(topic: &str) -> String {
    topic
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Resolve the topic that goes on the wire, optionally under the device prefix
pub fn resolve_topic(device_id: &str, topic: &str, prepend_device_id: bool) -> String {
    if prepend_device_id {
        normalize_topic(&format!("{device_id}/{topic}"))
    } else {
        normalize_topic(topic)
    }
}

/// Check a subscription pattern for wildcard placement
pub fn validate_pattern(pattern: &str) -> Result<(), TopicError> {
    let normalized = normalize_topic(pattern);
    if normalized.is_empty() {
        return Err(TopicError::EmptyTopic);
    }

    let segments: Vec<&str> = normalized.split('/').collect();
    let last = segments.len() - 1;

    for (index, segment) in segments.iter().enumerate() {
        if segment.contains(MULTI_LEVEL_WILDCARD)
            && (*segment != MULTI_LEVEL_WILDCARD || index != last)
        {
            return Err(TopicError::InvalidWildcard(normalized.clone()));
        }
        if segment.contains(SINGLE_LEVEL_WILDCARD) && *segment != SINGLE_LEVEL_WILDCARD {
            return Err(TopicError::InvalidWildcard(normalized.clone()));
        }
    }

    Ok(())
}

/// True when the topic carries no wildcard segment
pub fn is_concrete_topic(topic: &str) -> bool {
    !topic.contains(SINGLE_LEVEL_WILDCARD) && !topic.contains(MULTI_LEVEL_WILDCARD)
}

/// Match a normalized topic against a normalized pattern
///
/// `+` consumes exactly one segment. `#` consumes the remainder, including
/// nothing at all, so `a/b/#` matches `a/b`. A pattern that starts with a
/// wildcard never matches a `$`-prefixed topic.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if topic.starts_with('$')
        && (pattern.starts_with(SINGLE_LEVEL_WILDCARD) || pattern.starts_with(MULTI_LEVEL_WILDCARD))
    {
        return false;
    }

    let mut pattern_parts = pattern.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (pattern_parts.next(), topic_parts.next()) {
            (Some(MULTI_LEVEL_WILDCARD), _) => return true,
            (Some(SINGLE_LEVEL_WILDCARD), Some(_)) => continue,
            (Some(p), Some(t)) if p == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Validate a device identifier: `[a-zA-Z0-9._-]+`
pub fn validate_device_id(device_id: &str) -> Result<(), TopicError> {
    if device_id.is_empty() {
        return Err(TopicError::EmptyDeviceId);
    }

    for ch in device_id.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(TopicError::InvalidDeviceIdChar(ch));
        }
    }

    Ok(())
}

/// Topic and identity validation errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TopicError {
    #[error("Topic cannot be empty")]
    EmptyTopic,
    #[error("Wildcards must occupy a whole segment and '#' must be last: {0}")]
    InvalidWildcard(String),
    #[error("Device ID cannot be empty")]
    EmptyDeviceId,
    #[error("Device ID contains invalid character: '{0}'")]
    InvalidDeviceIdChar(char),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn normalize_topic_is_idempotent(topic in ".*") {
            let first = normalize_topic(&topic);
            let second = normalize_topic(&first);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn normalized_topic_has_no_empty_segments(topic in "[a-z/]{0,40}") {
            let result = normalize_topic(&topic);
            prop_assert!(!result.starts_with('/'), "leading slash: {}", result);
            prop_assert!(!result.ends_with('/'), "trailing slash: {}", result);
            prop_assert!(!result.contains("//"), "double slash: {}", result);
        }

        #[test]
        fn concrete_topic_matches_itself(topic in "[a-z0-9]{1,8}(/[a-z0-9]{1,8}){0,5}") {
            prop_assert!(topic_matches(&topic, &topic));
        }

        #[test]
        fn multi_level_wildcard_matches_every_plain_topic(topic in "[a-z0-9]{1,8}(/[a-z0-9]{1,8}){0,5}") {
            prop_assert!(topic_matches("#", &topic));
        }

        #[test]
        fn device_prefix_is_applied_once(topic in "[a-z/]{1,30}") {
            let resolved = resolve_topic("PC2MQTT", &topic, true);
            let prefix_count = resolved.matches("PC2MQTT").count();
            prop_assert_eq!(prefix_count, 1);
        }
    }

    #[test]
    fn test_normalize_topic_examples() {
        assert_eq!(normalize_topic("/status/cpu/"), "status/cpu");
        assert_eq!(normalize_topic("a//b///c"), "a/b/c");
        assert_eq!(normalize_topic("///"), "");
        assert_eq!(normalize_topic(""), "");
    }

    #[test]
    fn test_resolve_topic() {
        assert_eq!(resolve_topic("pc", "/status", true), "pc/status");
        assert_eq!(resolve_topic("pc", "status", false), "status");
        assert_eq!(resolve_topic("pc", "", true), "pc");
    }

    #[test]
    fn test_multi_level_wildcard_matching() {
        assert!(topic_matches("a/b/#", "a/b/c/d"));
        assert!(topic_matches("a/b/#", "a/b"));
        assert!(topic_matches("a/b/#", "a/b/c"));
        assert!(!topic_matches("a/b/#", "a/c"));
        assert!(!topic_matches("a/b/#", "a"));
    }

    #[test]
    fn test_single_level_wildcard_matching() {
        assert!(topic_matches("a/+/c", "a/x/c"));
        assert!(!topic_matches("a/+/c", "a/x/y/c"));
        assert!(!topic_matches("a/+/c", "a/c"));
        assert!(topic_matches("cmd/+", "cmd/reset"));
        assert!(!topic_matches("cmd/+", "other/topic"));
        assert!(!topic_matches("cmd/+", "cmd"));
    }

    #[test]
    fn test_dollar_topics_need_explicit_prefix() {
        assert!(!topic_matches("#", "$SYS/broker/uptime"));
        assert!(!topic_matches("+/broker/uptime", "$SYS/broker/uptime"));
        assert!(topic_matches("$SYS/#", "$SYS/broker/uptime"));
    }

    #[test]
    fn test_validate_pattern() {
        assert!(validate_pattern("a/b/#").is_ok());
        assert!(validate_pattern("a/+/c").is_ok());
        assert!(validate_pattern("#").is_ok());
        assert_eq!(validate_pattern("//"), Err(TopicError::EmptyTopic));
        assert!(matches!(
            validate_pattern("a/#/c"),
            Err(TopicError::InvalidWildcard(_))
        ));
        assert!(matches!(
            validate_pattern("a/b#"),
            Err(TopicError::InvalidWildcard(_))
        ));
        assert!(matches!(
            validate_pattern("a/x+/c"),
            Err(TopicError::InvalidWildcard(_))
        ));
    }

    #[test]
    fn test_validate_device_id() {
        assert!(validate_device_id("PC2MQTT").is_ok());
        assert!(validate_device_id("living-room_pc.1").is_ok());
        assert_eq!(validate_device_id(""), Err(TopicError::EmptyDeviceId));
        assert_eq!(
            validate_device_id("pc/one"),
            Err(TopicError::InvalidDeviceIdChar('/'))
        );
        assert_eq!(
            validate_device_id("pc#"),
            Err(TopicError::InvalidDeviceIdChar('#'))
        );
    }
}
