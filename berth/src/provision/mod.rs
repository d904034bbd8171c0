//! Container provisioning for workspace machines.

mod machine;
mod provisioner;
mod spec;

pub use machine::{FILE_NOT_FOUND_MARKER, WorkspaceMachine, read_file_script};
pub use provisioner::{
    CONTAINER_EXITED_ERROR, DEFAULT_FALLBACK_HOST, MachineProvisioner, NON_EXITING_CMD,
    memory_swap,
};
pub use spec::{BuildSpec, MachineSpec, RuntimeIdentity};
