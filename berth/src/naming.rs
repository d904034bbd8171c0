//! Container naming codec.
//!
//! Wire format: `<workspaceId>_<machineId>_<serverId>_<user>_<machineName>`,
//! lower-cased, with everything outside `[a-z0-9_-]` removed.
//!
//! `generate` does not enforce the `serverid-` prefix that `parse` expects,
//! so a name only round-trips when the caller already passes a prefixed
//! server id.

use regex::Regex;
use std::sync::LazyLock;

static CONTAINER_NAME: LazyLock<Regex> = LazyLock::new(|| {
    // Optional host-path prefix (`/` or `/node/`) as reported by the engine.
    Regex::new(
        r"^(?:/?[^/]+/|/)?(workspace[a-z0-9]+)_(machine[a-z0-9]+)_(serverid-[a-z0-9-]+)_.+$",
    )
    .unwrap_or_else(|e| unreachable!("container name pattern is valid: {e}"))
});

/// Identity fields recovered from a container name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedContainerName {
    pub workspace_id: String,
    pub machine_id: String,
    /// Includes the `serverid-` prefix.
    pub server_id: String,
}

/// Build a deterministic container name. Not injective.
pub fn generate(
    workspace_id: &str,
    machine_id: &str,
    server_id: &str,
    user_name: &str,
    machine_name: &str,
) -> String {
    [workspace_id, machine_id, server_id, user_name, machine_name]
        .join("_")
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-')
        .collect()
}

/// Parse a container name. `None` when it does not follow the wire format.
pub fn parse(name: &str) -> Option<ParsedContainerName> {
    let caps = CONTAINER_NAME.captures(name)?;
    Some(ParsedContainerName {
        workspace_id: caps[1].to_string(),
        machine_id: caps[2].to_string(),
        server_id: caps[3].to_string(),
    })
}
