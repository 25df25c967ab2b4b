//! Cluster-side identifiers
//!
//! Workspaces map to namespaces `workspace{ID}`, workbenches to resources
//! `workbench{ID}`, and app instances to map keys `{sanitized-name}-{ID}`.
//! Parsing is confined to this module and always yields a typed error.

use std::fmt;
use std::str::FromStr;

use crate::error::ClusterError;

/// Prefix of workspace namespaces
pub const WORKSPACE_PREFIX: &str = "workspace";
/// Prefix of workbench resource names
pub const WORKBENCH_PREFIX: &str = "workbench";

const MAX_APP_NAME_LEN: usize = 15;
const UNKNOWN_APP_NAME: &str = "unknown";

/// Namespace of a workspace
pub fn workspace_namespace(workspace_id: u64) -> String {
    format!("{WORKSPACE_PREFIX}{workspace_id}")
}

/// Resource name of a workbench
pub fn workbench_name(workbench_id: u64) -> String {
    format!("{WORKBENCH_PREFIX}{workbench_id}")
}

/// Workspace ID from its namespace
pub fn parse_workspace_namespace(namespace: &str) -> Result<u64, ClusterError> {
    parse_prefixed_id(WORKSPACE_PREFIX, namespace)
}

/// Workbench ID from its resource name
pub fn parse_workbench_name(name: &str) -> Result<u64, ClusterError> {
    parse_prefixed_id(WORKBENCH_PREFIX, name)
}

fn parse_prefixed_id(prefix: &str, value: &str) -> Result<u64, ClusterError> {
    let digits = value.strip_prefix(prefix).ok_or_else(|| {
        ClusterError::invalid_identifier(value, format!("expected prefix '{prefix}'"))
    })?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ClusterError::invalid_identifier(
            value,
            format!("expected digits after '{prefix}'"),
        ));
    }
    digits
        .parse()
        .map_err(|e| ClusterError::invalid_identifier(value, format!("{e}")))
}

/// Cache key for a workbench in the cluster
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkbenchRef {
    /// Workspace namespace
    pub namespace: String,
    /// Workbench resource name
    pub name: String,
}

impl WorkbenchRef {
    /// Reference for the given workspace and workbench IDs
    pub fn from_ids(workspace_id: u64, workbench_id: u64) -> Self {
        Self {
            namespace: workspace_namespace(workspace_id),
            name: workbench_name(workbench_id),
        }
    }
}

impl fmt::Display for WorkbenchRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Key of an app instance inside a workbench's `apps` map
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AppUid {
    name: String,
    instance_id: u64,
}

impl AppUid {
    /// UID for an app instance, sanitizing the app name
    pub fn new(app_name: &str, instance_id: u64) -> Self {
        Self {
            name: sanitize_app_name(app_name),
            instance_id,
        }
    }

    /// Sanitized app name part
    pub fn name(&self) -> &str {
        &self.name
    }

    /// App instance ID
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }
}

impl fmt::Display for AppUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.instance_id)
    }
}

impl FromStr for AppUid {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, id) = s
            .rsplit_once('-')
            .ok_or_else(|| ClusterError::invalid_identifier(s, "missing '-' separator"))?;
        let instance_id = id.parse().map_err(|e| {
            ClusterError::invalid_identifier(s, format!("invalid instance ID '{id}': {e}"))
        })?;
        Ok(Self {
            name: name.to_string(),
            instance_id,
        })
    }
}

/// Normalize an app name for use in a cluster key
///
/// Lowercases, collapses every run of characters outside `[a-z0-9]` into a
/// single `-`, keeps at most 15 characters and trims dashes at both ends.
pub fn sanitize_app_name(app_name: &str) -> String {
    let mut out = String::with_capacity(app_name.len());
    let mut in_separator = false;
    for c in app_name.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
            in_separator = false;
        } else if !in_separator {
            out.push('-');
            in_separator = true;
        }
    }
    out.truncate(MAX_APP_NAME_LEN);
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        UNKNOWN_APP_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Normalize a platform username into a POSIX-friendly login name
pub fn sanitize_username(username: &str) -> String {
    username
        .to_lowercase()
        .replace(' ', "_")
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_')
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_names_from_ids() {
        let r = WorkbenchRef::from_ids(7, 42);
        assert_eq!(r.namespace, "workspace7");
        assert_eq!(r.name, "workbench42");
        assert_eq!(r.to_string(), "workspace7/workbench42");
    }

    #[test]
    fn parses_prefixed_ids() {
        assert_eq!(parse_workbench_name("workbench42").ok(), Some(42));
        assert_eq!(parse_workspace_namespace("workspace7").ok(), Some(7));
    }

    #[test]
    fn rejects_malformed_prefixed_ids() {
        for bad in ["workbench", "workbench-1", "workbenchx", "42", "workspace7"] {
            assert!(
                matches!(
                    parse_workbench_name(bad),
                    Err(ClusterError::InvalidIdentifier { .. })
                ),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn app_uid_combines_sanitized_name_and_id() {
        assert_eq!(AppUid::new("jupyter", 1).to_string(), "jupyter-1");
        assert_eq!(AppUid::new("My Fancy App!", 9).to_string(), "my-fancy-app-9");
    }

    #[test]
    fn app_uid_parses_suffix_after_last_separator() {
        let uid: AppUid = "my-fancy-app-9".parse().expect("valid uid");
        assert_eq!(uid.name(), "my-fancy-app");
        assert_eq!(uid.instance_id(), 9);
    }

    #[test]
    fn app_uid_parse_failures_are_typed() {
        for bad in ["jupyter", "jupyter-", "jupyter-abc", "jupyter-1.5"] {
            let err = bad.parse::<AppUid>().expect_err(bad);
            assert!(matches!(err, ClusterError::InvalidIdentifier { .. }), "{bad}");
        }
    }

    #[test]
    fn sanitize_truncates_and_trims() {
        assert_eq!(sanitize_app_name("--Visual Studio Code--"), "visual-studio");
        assert_eq!(sanitize_app_name("abcdefghijklmn-opq"), "abcdefghijklmn");
        assert_eq!(sanitize_app_name("!!!"), "unknown");
        assert_eq!(sanitize_app_name(""), "unknown");
    }

    #[test]
    fn sanitize_username_keeps_posix_characters() {
        assert_eq!(sanitize_username("Jane Doe-Smith"), "jane_doesmith");
    }
}
