//! Regex grouping of operations for autogenerated groups

use apihub_common::error::{codes, ApiError};
use regex::Regex;
use std::collections::BTreeMap;

/// Name of the capture that yields the group name
pub const GROUP_CAPTURE: &str = "group";

fn invalid(pattern: &str, reason: impl std::fmt::Display) -> ApiError {
    ApiError::new(codes::INVALID_GROUP_PATTERN)
        .param("pattern", pattern)
        .param("reason", reason)
}

/// Compile `pattern`; it must define the named capture `group`
pub fn compile(pattern: &str) -> Result<Regex, ApiError> {
    let regex = Regex::new(pattern).map_err(|e| invalid(pattern, e))?;
    if !regex.capture_names().flatten().any(|name| name == GROUP_CAPTURE) {
        return Err(invalid(pattern, "pattern has no named capture 'group'"));
    }
    Ok(regex)
}

/// Bucket operation ids by the value their match key yields for `group`.
///
/// Operations that do not match, or match with an empty capture, stay
/// ungrouped. Ids keep their input order within a bucket.
pub fn group_operations<'a, I>(regex: &Regex, operations: I) -> BTreeMap<String, Vec<&'a str>>
where
    I: IntoIterator<Item = (&'a str, String)>,
{
    let mut groups: BTreeMap<String, Vec<&'a str>> = BTreeMap::new();
    for (operation_id, match_key) in operations {
        let name = regex
            .captures(&match_key)
            .and_then(|caps| caps.name(GROUP_CAPTURE))
            .map(|m| m.as_str().trim())
            .filter(|name| !name.is_empty());
        if let Some(name) = name {
            groups.entry(name.to_string()).or_default().push(operation_id);
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_requires_group_capture() {
        assert!(compile(r"^GET /(?P<group>[^/]+)").is_ok());
        assert!(compile(r"^GET /([^/]+)").unwrap_err().is(codes::INVALID_GROUP_PATTERN));
        assert!(compile(r"^GET /(?P<group>").unwrap_err().is(codes::INVALID_GROUP_PATTERN));
    }

    #[test]
    fn test_group_by_first_path_segment() {
        let regex = compile(r"^[A-Z]+ /(?P<group>[^/]+)").unwrap();
        let ops = vec![
            ("list-orders", "GET /orders".to_string()),
            ("get-order", "GET /orders/{id}".to_string()),
            ("create-user", "POST /users".to_string()),
            ("health", "query health".to_string()),
        ];

        let groups = group_operations(&regex, ops);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["orders"], vec!["list-orders", "get-order"]);
        assert_eq!(groups["users"], vec!["create-user"]);
    }

    #[test]
    fn test_empty_capture_is_ungrouped() {
        let regex = compile(r"^GET /(?P<group>[a-z]*)").unwrap();
        let groups = group_operations(&regex, vec![("root", "GET /".to_string())]);
        assert!(groups.is_empty());
    }
}
