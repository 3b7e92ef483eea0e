use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

static TARGET_AUTHORITY: &str = "iqn.2014-09.com.rancher:";

/// iSCSI form of a volume name, `_` is not valid in an IQN
pub fn volume_to_iscsi_name<S: AsRef<str>>(name: S) -> String {
    name.as_ref().replace('_', ":")
}

/// target IQN of a volume, e.g. `vol_a` -> `iqn.2014-09.com.rancher:vol:a`
pub fn target_name<S: AsRef<str>>(name: S) -> String {
    format!("{}{}", TARGET_AUTHORITY, volume_to_iscsi_name(name))
}

/// One iSCSI-backed block device.
///
/// `target_id` and `device` are only known after `Manager::start`, neither
/// survives a restart of the process.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct ScsiDevice {
    target: String,
    #[serde(default)]
    target_id: Option<u32>,
    #[serde(default)]
    device: Option<PathBuf>,

    backing_file: String,
    #[serde(default)]
    bs_type: String,
    #[serde(default)]
    bs_opts: String,
}

impl ScsiDevice {
    pub fn new<S: AsRef<str>>(name: S, backing_file: S, bs_type: S, bs_opts: S) -> Self {
        ScsiDevice {
            target: target_name(name),
            target_id: None,
            device: None,
            backing_file: backing_file.as_ref().to_string(),
            bs_type: bs_type.as_ref().to_string(),
            bs_opts: bs_opts.as_ref().to_string(),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn target_id(&self) -> Option<u32> {
        self.target_id
    }

    pub fn device(&self) -> Option<&Path> {
        self.device.as_deref()
    }

    pub fn backing_file(&self) -> &str {
        &self.backing_file
    }

    pub fn bs_type(&self) -> &str {
        &self.bs_type
    }

    pub fn bs_opts(&self) -> &str {
        &self.bs_opts
    }

    /// changes the backing store driver and options, applied by `Manager::sync_update`
    pub fn update_backing_store<S: AsRef<str>>(&mut self, bs_type: S, bs_opts: S) {
        self.bs_type = bs_type.as_ref().to_string();
        self.bs_opts = bs_opts.as_ref().to_string();
    }

    pub(crate) fn set_target_id(&mut self, tid: u32) {
        self.target_id = Some(tid);
    }

    pub(crate) fn set_device(&mut self, device: PathBuf) {
        self.device = Some(device);
    }
}
