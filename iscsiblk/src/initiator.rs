use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;

use crate::exec::{Executor, NamespaceExecutor};
use crate::retry::{Attempt, Retry};
use crate::IscsiError;

static ISCSIADM: &str = "iscsiadm";
static SCSI_NODES_DIRS: [&str; 2] = ["/etc/iscsi/nodes", "/var/lib/iscsi/nodes"];

/// Initiator side control plane, bound to the namespace it runs in.
pub trait Initiator {
    fn check_for_initiator_existence(&self) -> Result<()>;

    fn discover_target(&self, ip: &str, target: &str) -> Result<()>;

    fn is_target_discovered(&self, ip: &str, target: &str) -> bool;

    /// removes empty node records of `target` left behind by failed discoveries
    fn cleanup_scsi_nodes(&self, target: &str) -> Result<()>;

    fn delete_discovered_target(&self, ip: &str, target: &str) -> Result<()>;

    fn login_target(&self, ip: &str, target: &str) -> Result<()>;

    fn logout_target(&self, ip: &str, target: &str) -> Result<()>;

    fn is_target_logged_in(&self, ip: &str, target: &str) -> bool;

    /// block device of `lun` in the session to `target` at `ip`
    fn get_device(&self, ip: &str, target: &str, lun: u32) -> Result<PathBuf>;

    fn rescan_target(&self, ip: &str, target: &str) -> Result<()>;
}

/// `Initiator` backed by open-iscsi's `iscsiadm`.
#[derive(Debug, Clone)]
pub struct Iscsiadm<E = NamespaceExecutor> {
    exec: E,
    device_wait: Retry,
}

impl<E: Executor> Iscsiadm<E> {
    pub fn new(exec: E, device_wait: Retry) -> Self {
        Iscsiadm { exec, device_wait }
    }

    fn iscsiadm(&self, args: &[&str]) -> Result<String> {
        self.exec.execute(ISCSIADM, args)
    }

    fn node(&self, ip: &str, target: &str, extra: &[&str]) -> Result<String> {
        let mut args = vec!["-m", "node", "-T", target];
        if !ip.is_empty() {
            args.extend_from_slice(&["-p", ip]);
        }
        args.extend_from_slice(extra);
        self.iscsiadm(&args)
    }
}

impl<E: Executor> Initiator for Iscsiadm<E> {
    fn check_for_initiator_existence(&self) -> Result<()> {
        self.iscsiadm(&["--version"])
            .map_err(|e| IscsiError::InitiatorMissing(e.to_string()))?;
        Ok(())
    }

    fn discover_target(&self, ip: &str, target: &str) -> Result<()> {
        let out = self.iscsiadm(&["-m", "discovery", "-t", "sendtargets", "-p", ip])?;
        if !parse_node_records(&out)?
            .iter()
            .any(|(portal, name)| portal == ip && name == target)
        {
            anyhow::bail!(IscsiError::TargetNotDiscovered(target.to_string()))
        }
        Ok(())
    }

    fn is_target_discovered(&self, ip: &str, target: &str) -> bool {
        self.node(ip, target, &[]).is_ok()
    }

    fn cleanup_scsi_nodes(&self, target: &str) -> Result<()> {
        for dir in SCSI_NODES_DIRS {
            let target_dir = Path::new(dir).join(target).to_string_lossy().to_string();
            // the directory may simply not exist on this distribution
            let Ok(out) = self
                .exec
                .execute("find", &[target_dir.as_str(), "-type", "f", "-empty"])
            else {
                continue;
            };

            for file in out.lines().map(str::trim).filter(|l| !l.is_empty()) {
                log::info!("removing empty iscsi node record {}", file);
                self.exec
                    .execute("rm", &["-f", file])
                    .with_context(|| format!("remove node record {}", file))?;
            }
        }
        Ok(())
    }

    fn delete_discovered_target(&self, ip: &str, target: &str) -> Result<()> {
        let mut args = vec!["-m", "node", "-o", "delete", "-T", target];
        if !ip.is_empty() {
            args.extend_from_slice(&["-p", ip]);
        }
        self.iscsiadm(&args)?;
        Ok(())
    }

    fn login_target(&self, ip: &str, target: &str) -> Result<()> {
        self.node(ip, target, &["--login"])?;
        Ok(())
    }

    fn logout_target(&self, ip: &str, target: &str) -> Result<()> {
        self.node(ip, target, &["--logout"])?;
        Ok(())
    }

    fn is_target_logged_in(&self, ip: &str, target: &str) -> bool {
        // exit status 21 when there is no session at all
        let Ok(out) = self.iscsiadm(&["-m", "session"]) else {
            return false;
        };
        parse_sessions(&out)
            .map(|sessions| {
                sessions
                    .iter()
                    .any(|(portal, name)| portal == ip && name == target)
            })
            .unwrap_or(false)
    }

    fn get_device(&self, ip: &str, target: &str, lun: u32) -> Result<PathBuf> {
        self.device_wait.run(|_| {
            let out = self.iscsiadm(&["-m", "session", "-P", "3"])?;
            match find_attached_disk(&out, ip, target, lun)? {
                Some(disk) => Ok(Attempt::Done(Path::new("/dev").join(disk))),
                None => Ok(Attempt::Again(
                    IscsiError::DeviceNotFound(target.to_string(), lun).into(),
                )),
            }
        })
    }

    fn rescan_target(&self, ip: &str, target: &str) -> Result<()> {
        self.node(ip, target, &["--rescan"])?;
        Ok(())
    }
}

/// (portal ip, target) from `ip:port,tpgt target` lines of discovery or node listings
pub(crate) fn parse_node_records(out: &str) -> Result<Vec<(String, String)>> {
    let re = Regex::new(r"^\[?([0-9a-fA-F.:]+?)\]?:\d+,\d+\s+(\S+)")?;

    let records = out
        .lines()
        .filter_map(|line| re.captures(line.trim()))
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        .collect();

    Ok(records)
}

/// (portal ip, target) from `iscsiadm -m session`
pub(crate) fn parse_sessions(out: &str) -> Result<Vec<(String, String)>> {
    let re = Regex::new(r"^\S+:\s+\[\d+\]\s+(.*)$")?;

    let sessions = out
        .lines()
        .filter_map(|line| re.captures(line.trim()))
        .map(|caps| caps[1].to_string())
        .collect::<Vec<String>>()
        .join("\n");

    parse_node_records(&sessions)
}

/// walks `iscsiadm -m session -P 3` and returns the disk name (e.g. `sdb`)
/// attached as `lun` to the session with `target` at `ip`
pub(crate) fn find_attached_disk(out: &str, ip: &str, target: &str, lun: u32) -> Result<Option<String>> {
    let target_re = Regex::new(r"^Target:\s+(\S+)")?;
    let portal_re = Regex::new(r"^Current Portal:\s+\[?([0-9a-fA-F.:]+?)\]?:\d+,\d+")?;
    let lun_re = Regex::new(r"^scsi\d+\s+Channel\s+\d+\s+Id\s+\d+\s+Lun:\s+(\d+)")?;
    let disk_re = Regex::new(r"^Attached scsi disk\s+(\S+)")?;

    let mut in_target = false;
    let mut in_portal = false;
    let mut cur_lun = None;
    for line in out.lines().map(str::trim) {
        if let Some(caps) = target_re.captures(line) {
            in_target = &caps[1] == target;
            in_portal = false;
            cur_lun = None;
        } else if let Some(caps) = portal_re.captures(line) {
            in_portal = &caps[1] == ip;
        } else if let Some(caps) = lun_re.captures(line) {
            cur_lun = caps[1].parse::<u32>().ok();
        } else if let Some(caps) = disk_re.captures(line) {
            if in_target && in_portal && cur_lun == Some(lun) {
                return Ok(Some(caps[1].to_string()));
            }
        }
    }

    Ok(None)
}
