//! ---
//! ems_section: "02-message-bus"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Topic-matched publish/subscribe bus and transports."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};

/// Wildcard matching exactly one topic segment.
pub const SINGLE_LEVEL_WILDCARD: &str = "+";
/// Wildcard matching all remaining topic segments; only valid as the final
/// pattern segment.
pub const MULTI_LEVEL_WILDCARD: &str = "#";

/// Errors reported by [`validate_pattern`] at subscribe time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum PatternError {
    /// The pattern string is empty.
    #[error("pattern is empty")]
    Empty,
    /// `#` appeared before the final segment.
    #[error("'#' wildcard at segment {position} is not in final position")]
    InteriorHash {
        /// Zero-based index of the offending segment.
        position: usize,
    },
    /// A wildcard character is embedded inside a longer segment.
    #[error("wildcard embedded in segment '{segment}'")]
    EmbeddedWildcard {
        /// The offending segment text.
        segment: String,
    },
}

/// Match a concrete topic against a subscription pattern.
///
/// `+` consumes exactly one segment, `#` consumes the remainder (including
/// zero segments) and must be the final pattern segment. Malformed patterns
/// never match; they are rejected up front by [`validate_pattern`] when
/// registered through the bus client, but this function stays infallible so
/// it can be used on untrusted input.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == topic {
        return true;
    }

    let pattern_segments: Vec<&str> = pattern.split('/').collect();
    let topic_segments: Vec<&str> = topic.split('/').collect();

    if !pattern.contains(MULTI_LEVEL_WILDCARD) && pattern_segments.len() != topic_segments.len() {
        return false;
    }

    let mut cursor = 0usize;
    let last = pattern_segments.len() - 1;
    for (index, segment) in pattern_segments.iter().enumerate() {
        match *segment {
            "#" => return index == last,
            "+" => {
                if cursor >= topic_segments.len() {
                    return false;
                }
                cursor += 1;
            }
            literal => {
                if cursor >= topic_segments.len() || literal != topic_segments[cursor] {
                    return false;
                }
                cursor += 1;
            }
        }
    }
    cursor == topic_segments.len()
}

/// Validate a subscription pattern before it is registered.
pub fn validate_pattern(pattern: &str) -> Result<(), PatternError> {
    if pattern.is_empty() {
        return Err(PatternError::Empty);
    }
    let segments: Vec<&str> = pattern.split('/').collect();
    let last = segments.len() - 1;
    for (index, segment) in segments.iter().enumerate() {
        match *segment {
            "#" if index != last => return Err(PatternError::InteriorHash { position: index }),
            "#" | "+" => {}
            other if other.contains('#') || other.contains('+') => {
                return Err(PatternError::EmbeddedWildcard {
                    segment: other.to_owned(),
                });
            }
            _ => {}
        }
    }
    Ok(())
}

/// Topic carrying normalized readings for a device.
pub fn telemetry_topic(device_id: u32) -> String {
    format!("devices/{device_id}/telemetry")
}

/// Topic carrying lifecycle/status updates for a device.
pub fn status_topic(device_id: u32) -> String {
    format!("devices/{device_id}/status")
}

/// Reserved inbound command topic for a device. No delivery guarantees are
/// made on this namespace yet.
pub fn command_topic(device_id: u32) -> String {
    format!("devices/{device_id}/commands")
}
