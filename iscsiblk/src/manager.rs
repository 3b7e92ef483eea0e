use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

use anyhow::{Context, Result};

use crate::device::{target_name, ScsiDevice};
use crate::error::{is_not_found, is_timeout};
use crate::exec::{host_namespace_path, NamespaceExecutor};
use crate::initiator::{Initiator, Iscsiadm};
use crate::lock::{HostLock, NsFileLock};
use crate::net::{HostAddress, HostIp};
use crate::retry::Attempt;
use crate::tgt::{TargetAdmin, Tgtadm};
use crate::{Config, IscsiError};

/// initiator pattern that lets any initiator reach the target
static ALL_INITIATORS: &str = "ALL";

/// Drives target and initiator through the device lifecycle.
///
/// Every public lifecycle call holds the host lock for its whole duration.
pub struct Manager<T, I, L, A> {
    cfg: Config,
    target: T,
    initiator: I,
    lock: L,
    addr: A,
}

impl Manager<Tgtadm, Iscsiadm, NsFileLock, HostIp> {
    /// wires `tgtadm`, `iscsiadm` in the host namespace and the host lock file
    ///
    /// ```no_run
    /// use iscsiblk::{Config, Manager, ScsiDevice};
    ///
    /// let manager = Manager::host(Config::default())?;
    /// let mut dev = ScsiDevice::new("data_01", "/var/lib/longhorn/data01.img", "file", "");
    /// manager.start(&mut dev)?;
    /// # Ok::<(), anyhow::Error>(())
    /// ```
    pub fn host(cfg: Config) -> Result<Self> {
        let ns = host_namespace_path(cfg.host_proc());
        let ne = NamespaceExecutor::new(ns, cfg.command_timeout())?;

        let target = Tgtadm::new(
            NamespaceExecutor::local(cfg.command_timeout()),
            cfg.tgtd_log_file(),
            cfg.daemon_wait_retry(),
        );
        let initiator = Iscsiadm::new(ne, cfg.device_wait_retry());
        let lock = NsFileLock::new(cfg.host_proc(), cfg.lock_file(), cfg.lock_timeout());

        Ok(Manager::new(cfg, target, initiator, lock, HostIp))
    }
}

impl<T, I, L, A> Manager<T, I, L, A>
where
    T: TargetAdmin,
    I: Initiator,
    L: HostLock,
    A: HostAddress,
{
    pub fn new(cfg: Config, target: T, initiator: I, lock: L, addr: A) -> Self {
        Manager {
            cfg,
            target,
            initiator,
            lock,
            addr,
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// creates the target of `dev`, logs in and waits for its block device
    pub fn start(&self, dev: &mut ScsiDevice) -> Result<()> {
        let _guard = self.lock.lock().context("failed to lock")?;

        self.initiator.check_for_initiator_existence()?;
        let ip = self.addr.ip_to_host()?;

        self.setup_target(dev)?;
        self.establish_session(&ip, dev)
    }

    /// logs out of and removes the target of `volume`, safe to repeat
    pub fn stop<S: AsRef<str>>(&self, volume: S, tid: u32) -> Result<()> {
        let _guard = self.lock.lock().context("failed to lock")?;

        let target = target_name(volume);
        self.teardown_session(&target)
            .context("failed to logout target")?;
        self.delete_target(&target, Some(tid))
            .context("failed to delete target")?;

        Ok(())
    }

    /// applies the backing store of `dev` by recreating its target, the
    /// existing session picks it up through a rescan
    pub fn sync_update(&self, dev: &mut ScsiDevice) -> Result<()> {
        let _guard = self.lock.lock().context("failed to lock")?;

        self.initiator.check_for_initiator_existence()?;
        let ip = self.addr.ip_to_host()?;

        self.update_target(dev)?;
        self.initiator.rescan_target(&ip, dev.target())?;

        Ok(())
    }
}

// target side
impl<T, I, L, A> Manager<T, I, L, A>
where
    T: TargetAdmin,
    I: Initiator,
    L: HostLock,
    A: HostAddress,
{
    /// creates the target with a fresh id, attaches the backing store and
    /// opens it to every initiator
    pub fn setup_target(&self, dev: &mut ScsiDevice) -> Result<()> {
        self.target.start_daemon(false)?;

        let name = dev.target().to_string();
        let tid = self.cfg.target_id_retry().run(|_| {
            let tid = self.target.find_next_available_target_id()?;
            log::info!("found available target id {}", tid);

            match self.target.create_target(tid, &name) {
                Ok(()) => Ok(Attempt::Done(tid)),
                Err(e) => {
                    log::info!(
                        "failed to use target id {}, retrying with a new target id: {:#}",
                        tid,
                        e
                    );
                    Ok(Attempt::Again(e))
                }
            }
        })?;
        dev.set_target_id(tid);

        let lun = self.cfg.target_lun();
        self.target
            .add_lun(tid, lun, dev.backing_file(), dev.bs_type(), dev.bs_opts())?;
        self.target.bind_initiator(tid, ALL_INITIATORS)?;

        Ok(())
    }

    /// removes `target` if it exists, its live id has to be `expected`
    pub fn delete_target(&self, target: &str, expected: Option<u32>) -> Result<()> {
        let tid = match self.target.get_target_tid(target) {
            Ok(Some(tid)) => tid,
            Ok(None) => return Ok(()),
            Err(e) => {
                log::warn!("cannot look up target {}, assuming it is gone: {:#}", target, e);
                return Ok(());
            }
        };

        if expected != Some(tid) {
            log::error!("BUG: invalid tid {} found for {}", tid, target);
            anyhow::bail!(IscsiError::ConsistencyViolation {
                target: target.to_string(),
                expected,
                found: tid,
            })
        }

        log::info!("shutdown SCSI target {}", target);
        self.target.unbind_initiator(tid, ALL_INITIATORS)?;
        self.target.delete_lun(tid, self.cfg.target_lun())?;

        for (sid, cids) in self.target.get_target_connections(tid)? {
            for cid in cids {
                self.target.close_connection(tid, sid, cid)?;
            }
        }

        self.target.delete_target(tid)?;

        Ok(())
    }

    /// deletes and recreates the target of `dev`, no in-place change
    pub fn update_target(&self, dev: &mut ScsiDevice) -> Result<()> {
        self.delete_target(dev.target(), dev.target_id())?;
        self.setup_target(dev)
    }
}

// initiator side
impl<T, I, L, A> Manager<T, I, L, A>
where
    T: TargetAdmin,
    I: Initiator,
    L: HostLock,
    A: HostAddress,
{
    /// discovers and logs in to the target of `dev`, then waits for the
    /// block device to show up
    pub fn establish_session(&self, ip: &str, dev: &mut ScsiDevice) -> Result<()> {
        let target = dev.target().to_string();
        let retry = self.cfg.scsi_retry();

        retry.run(|_| {
            // the discovery state decides, the command result is only a hint
            let res = self.initiator.discover_target(ip, &target);
            if self.initiator.is_target_discovered(ip, &target) {
                return Ok(Attempt::Done(()));
            }

            let err = res
                .err()
                .unwrap_or_else(|| IscsiError::TargetNotDiscovered(target.clone()).into());
            log::warn!("failed to discover {}: {:#}", target, err);

            // empty records under /etc/iscsi/nodes/<target> break discovery
            match self.initiator.cleanup_scsi_nodes(&target) {
                Ok(()) => log::warn!("nodes cleaned up for {}", target),
                Err(e) => log::warn!("failed to cleanup nodes for {}: {:#}", target, e),
            }
            Ok(Attempt::Again(err))
        })?;

        self.initiator.login_target(ip, &target)?;

        let device = self
            .initiator
            .get_device(ip, &target, self.cfg.target_lun())?;
        dev.set_device(device.clone());

        retry.poll(
            || is_device_node(&device),
            || IscsiError::DeviceNotReady(device.to_string_lossy().to_string()).into(),
        )?;
        log::info!("device {} ready for {}", device.display(), target);

        Ok(())
    }

    /// logs out of `target` and forgets its discovery record
    pub fn teardown_session(&self, target: &str) -> Result<()> {
        let ip = self.addr.ip_to_host()?;
        self.initiator.check_for_initiator_existence()?;

        let retry = self.cfg.scsi_retry();
        if self.initiator.is_target_logged_in(&ip, target) {
            log::info!("shutdown SCSI device for {}:{}", ip, target);

            let pending = retry.run(|_| match self.initiator.logout_target(&ip, target) {
                Ok(()) => Ok(Attempt::Done(None)),
                Err(e) if is_not_found(&e) => Ok(Attempt::Done(None)),
                // the logout may still land after the command gave up
                Err(e) if is_timeout(&e) => Ok(Attempt::Done(Some(e))),
                Err(e) => Ok(Attempt::Again(e)),
            })?;

            if let Some(timeout) = pending {
                log::info!("logout SCSI device timeout, waiting for logout complete");
                retry
                    .poll(
                        || !self.initiator.is_target_logged_in(&ip, target),
                        || IscsiError::LogoutPending(target.to_string()).into(),
                    )
                    .map_err(|_| timeout.context(IscsiError::LogoutPending(target.to_string())))?;
            }
        }

        // deleting right after logout can hit "encountered iSCSI database
        // failure" while other iscsiadm calls run, hence the retry
        retry.run(|_| {
            if !self.initiator.is_target_discovered(&ip, target) {
                return Ok(Attempt::Done(()));
            }
            match self.initiator.delete_discovered_target(&ip, target) {
                Ok(()) => Ok(Attempt::Done(())),
                Err(e) if is_not_found(&e) => Ok(Attempt::Done(())),
                Err(e) => Ok(Attempt::Again(e)),
            }
        })
    }
}

/// exists and is a block or character device, not a placeholder file
fn is_device_node<P: AsRef<Path>>(path: P) -> bool {
    fs::metadata(path)
        .map(|m| {
            let ft = m.file_type();
            ft.is_block_device() || ft.is_char_device()
        })
        .unwrap_or(false)
}
