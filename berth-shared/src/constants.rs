//! Wire-format constants
//!
//! These values are observed by things outside berth (container labels,
//! in-container pid files, environment of workspace machines) and must not
//! drift between releases.

/// Container label keys carrying server metadata.
pub mod labels {
    /// Prefix of every server label: `che:server:<port>/<proto>:<attr>`.
    pub const SERVER_PREFIX: &str = "che:server:";

    pub const REF_SUFFIX: &str = ":ref";
    pub const PROTOCOL_SUFFIX: &str = ":protocol";
    pub const PATH_SUFFIX: &str = ":path";

    /// Label key for a server attribute, e.g. `che:server:8080/tcp:ref`.
    pub fn server_label(port: &str, suffix: &str) -> String {
        format!("{}{}{}", SERVER_PREFIX, port, suffix)
    }
}

/// Pid files written by in-container processes.
pub mod pid_files {
    /// Pid file path for a provider-assigned pid (not an OS pid).
    pub fn pid_file_path(pid: u64) -> String {
        format!("/tmp/docker-exec-{}.pid", pid)
    }
}

/// Environment variables injected into, and read back from, machines.
pub mod machine_env {
    pub const WORKSPACE_ID: &str = "CHE_WORKSPACE_ID";
    pub const MACHINE_NAME: &str = "CHE_MACHINE_NAME";
    pub const IS_DEV_MACHINE: &str = "CHE_IS_DEV_MACHINE";

    /// Prefix of generated workspace ids.
    pub const WORKSPACE_ID_PREFIX: &str = "workspace";
}

/// Image naming.
pub mod images {
    /// Repository prefix of committed machine snapshots.
    pub const SNAPSHOT_PREFIX: &str = "machine_snapshot_";

    /// Repository namespace of images prepared for a machine.
    pub const MACHINE_IMAGE_NAMESPACE: &str = "eclipse-che";

    pub const LATEST_TAG: &str = "latest";
}

/// Generated identifiers.
pub mod ids {
    /// Lowercase ASCII letters and digits, the alphabet of generated network
    /// and snapshot ids.
    pub const LOWER_ALNUM: [char; 36] = [
        'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r',
        's', 't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
    ];

    /// Length of the random part of generated ids.
    pub const RANDOM_ID_LEN: usize = 16;
}

/// Engine event vocabulary.
pub mod events {
    pub const TYPE_CONTAINER: &str = "container";
    pub const STATUS_DIE: &str = "die";
    pub const STATUS_OOM: &str = "oom";
}
