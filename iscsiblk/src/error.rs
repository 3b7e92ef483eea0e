use std::time::Duration;

use thiserror::Error;

/// iscsiadm exit status for "no records/objects found"
pub const ISCSI_ERR_NO_OBJS_FOUND: i32 = 21;

#[derive(Error, Debug)]
pub enum IscsiError {
    #[error("A fatal error occured: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Unknown(#[from] anyhow::Error),

    #[error("Failed to execute '{command}': exit status {}, {stderr}", or_unknown(.code))]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("Timeout executing: {command} (after {timeout:?})")]
    CommandTimeout { command: String, timeout: Duration },
    #[error("Cannot parse output of '{command}': {reason}")]
    Parse { command: String, reason: String },

    #[error("Failed to acquire lock '{0}' within {1:?}")]
    LockTimeout(String, Duration),
    #[error("Host namespace path '{0}' does not exist.")]
    NoNamespace(String),
    #[error("No usable IPv4 address found on host.")]
    NoHostIp,

    #[error("iSCSI initiator is not available: {0}")]
    InitiatorMissing(String),
    #[error("Target daemon did not become ready.")]
    DaemonNotReady,
    #[error("Target '{0}' was not discovered.")]
    TargetNotDiscovered(String),
    #[error("No device found for target '{0}' lun {1}.")]
    DeviceNotFound(String, u32),
    #[error("Failed to wait for device '{0}' to show up.")]
    DeviceNotReady(String),
    #[error("Session of target '{0}' is still present after logout timed out.")]
    LogoutPending(String),

    #[error("BUG: invalid target id {found} found for '{target}', expected {}", or_unknown(.expected))]
    ConsistencyViolation {
        target: String,
        expected: Option<u32>,
        found: u32,
    },
}

fn or_unknown<T: ToString>(v: &Option<T>) -> String {
    v.as_ref()
        .map(|v| v.to_string())
        .unwrap_or("unknown".to_string())
}

impl IscsiError {
    /// Outermost `IscsiError` of an `anyhow::Error`, including ones attached
    /// with `.context(IscsiError::..)`.
    pub fn find(err: &anyhow::Error) -> Option<&IscsiError> {
        Self::all(err).next()
    }

    fn all(err: &anyhow::Error) -> impl Iterator<Item = &IscsiError> {
        err.downcast_ref::<IscsiError>()
            .into_iter()
            .chain(err.chain().filter_map(|e| e.downcast_ref::<IscsiError>()))
    }
}

/// "No record found" from the initiator. The desired absent state already holds.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    IscsiError::all(err).any(|e| {
        matches!(
            e,
            IscsiError::CommandFailed { code: Some(ISCSI_ERR_NO_OBJS_FOUND), .. }
        )
    })
}

/// The command did not answer in time; it may still complete later.
pub fn is_timeout(err: &anyhow::Error) -> bool {
    IscsiError::all(err).any(|e| matches!(e, IscsiError::CommandTimeout { .. }))
}

pub fn is_consistency_violation(err: &anyhow::Error) -> bool {
    IscsiError::all(err).any(|e| matches!(e, IscsiError::ConsistencyViolation { .. }))
}
