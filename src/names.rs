//! Channel and group name rules.
//!
//! Channel names are `[A-Za-z0-9-_.]+`, optionally followed by `!` and a
//! process-local suffix of the same alphabet. Group names use the base
//! alphabet only. Both must be shorter than `MAX_NAME_LENGTH`.

use uuid::Uuid;

use crate::error::{LayerError, Result};

pub const MAX_NAME_LENGTH: usize = 100;

/// Separator between a channel prefix and its generated suffix.
pub const PROCESS_LOCAL_SEPARATOR: char = '!';

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

fn is_base_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(is_name_char)
}

pub fn validate_channel(name: &str) -> Result<()> {
    let valid = name.len() < MAX_NAME_LENGTH
        && match name.split_once(PROCESS_LOCAL_SEPARATOR) {
            Some((base, suffix)) => is_base_name(base) && suffix.chars().all(is_name_char),
            None => is_base_name(name),
        };

    if valid {
        Ok(())
    } else {
        Err(LayerError::InvalidName {
            kind: "channel",
            name: name.to_string(),
        })
    }
}

pub fn validate_group(name: &str) -> Result<()> {
    if name.len() < MAX_NAME_LENGTH && is_base_name(name) {
        Ok(())
    } else {
        Err(LayerError::InvalidName {
            kind: "group",
            name: name.to_string(),
        })
    }
}

/// Generate a globally unique channel name rooted at `prefix`.
///
/// `"chat"` and `"chat!"` both yield `chat!<32 hex digits>`.
pub fn unique_channel(prefix: &str) -> Result<String> {
    let base = prefix
        .strip_suffix(PROCESS_LOCAL_SEPARATOR)
        .unwrap_or(prefix);
    let name = format!(
        "{}{}{}",
        base,
        PROCESS_LOCAL_SEPARATOR,
        Uuid::new_v4().simple()
    );
    validate_channel(&name)?;
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_channel_names() {
        for name in ["http.request", "websocket.send!abc-123", "a", "chat!", "x_y-z.0"] {
            assert!(validate_channel(name).is_ok(), "{} should be valid", name);
        }
    }

    #[test]
    fn test_invalid_channel_names() {
        let too_long = "a".repeat(MAX_NAME_LENGTH);
        for name in ["", "has space", "!suffix", "a!b!c", "ünicode", too_long.as_str()] {
            assert!(validate_channel(name).is_err(), "{} should be invalid", name);
        }
    }

    #[test]
    fn test_group_names_reject_separator() {
        assert!(validate_group("room-42").is_ok());
        assert!(validate_group("room!42").is_err());
        assert!(validate_group("").is_err());
    }

    #[test]
    fn test_unique_channel_is_rooted_and_unique() {
        let first = unique_channel("worker").unwrap();
        let second = unique_channel("worker!").unwrap();

        assert!(first.starts_with("worker!"));
        assert!(second.starts_with("worker!"));
        assert_ne!(first, second);
        assert_eq!(first.len(), "worker!".len() + 32);
    }

    #[test]
    fn test_unique_channel_rejects_bad_prefix() {
        assert!(unique_channel("bad prefix").is_err());
    }
}
