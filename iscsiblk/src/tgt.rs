use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use regex::Regex;

use crate::exec::{Executor, NamespaceExecutor};
use crate::retry::Retry;
use crate::IscsiError;

static TGTADM: &str = "tgtadm";
static TGTD: &str = "tgtd";

/// Target side control plane.
pub trait TargetAdmin {
    /// makes sure the target daemon is up, spawning it if necessary
    fn start_daemon(&self, debug: bool) -> Result<()>;

    fn find_next_available_target_id(&self) -> Result<u32>;

    fn create_target(&self, tid: u32, name: &str) -> Result<()>;

    fn delete_target(&self, tid: u32) -> Result<()>;

    fn add_lun(
        &self,
        tid: u32,
        lun: u32,
        backing_file: &str,
        bs_type: &str,
        bs_opts: &str,
    ) -> Result<()>;

    fn delete_lun(&self, tid: u32, lun: u32) -> Result<()>;

    fn bind_initiator(&self, tid: u32, initiator: &str) -> Result<()>;

    fn unbind_initiator(&self, tid: u32, initiator: &str) -> Result<()>;

    /// live id of the target called `name`, `None` if no such target exists
    fn get_target_tid(&self, name: &str) -> Result<Option<u32>>;

    /// open connections of a target, keyed by session id
    fn get_target_connections(&self, tid: u32) -> Result<BTreeMap<u32, Vec<u32>>>;

    fn close_connection(&self, tid: u32, sid: u32, cid: u32) -> Result<()>;
}

/// `TargetAdmin` backed by the tgt userspace target (`tgtd` + `tgtadm`).
#[derive(Debug, Clone)]
pub struct Tgtadm<E = NamespaceExecutor> {
    exec: E,
    log_file: PathBuf,
    daemon_wait: Retry,
}

impl<E: Executor> Tgtadm<E> {
    pub fn new<P: AsRef<Path>>(exec: E, log_file: P, daemon_wait: Retry) -> Self {
        Tgtadm {
            exec,
            log_file: log_file.as_ref().to_path_buf(),
            daemon_wait,
        }
    }

    fn tgtadm(&self, args: &[&str]) -> Result<String> {
        let mut full = vec!["--lld", "iscsi"];
        full.extend_from_slice(args);
        self.exec.execute(TGTADM, &full)
    }

    fn show_targets(&self) -> Result<String> {
        self.tgtadm(&["--op", "show", "--mode", "target"])
    }

    fn spawn_daemon(&self, debug: bool) -> Result<()> {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
            .with_context(|| format!("open tgtd log {}", self.log_file.display()))?;

        let mut cmd = Command::new(TGTD);
        cmd.arg("-f");
        if debug {
            cmd.args(["-d", "1"]);
        }
        cmd.stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log)
            .spawn()
            .map_err(IscsiError::Io)?;

        Ok(())
    }
}

impl<E: Executor> TargetAdmin for Tgtadm<E> {
    fn start_daemon(&self, debug: bool) -> Result<()> {
        if self.show_targets().is_ok() {
            return Ok(());
        }

        log::info!("starting {}, logging to {}", TGTD, self.log_file.display());
        self.spawn_daemon(debug)?;

        self.daemon_wait
            .poll(|| self.show_targets().is_ok(), || IscsiError::DaemonNotReady.into())
    }

    fn find_next_available_target_id(&self) -> Result<u32> {
        let out = self.show_targets()?;
        let used = parse_targets(&out)?
            .into_values()
            .collect::<BTreeSet<u32>>();

        Ok((1..).find(|tid| !used.contains(tid)).unwrap_or(1))
    }

    fn create_target(&self, tid: u32, name: &str) -> Result<()> {
        let tid = tid.to_string();
        self.tgtadm(&["--op", "new", "--mode", "target", "--tid", tid.as_str(), "-T", name])?;
        Ok(())
    }

    fn delete_target(&self, tid: u32) -> Result<()> {
        let tid = tid.to_string();
        self.tgtadm(&["--op", "delete", "--mode", "target", "--tid", tid.as_str()])?;
        Ok(())
    }

    fn add_lun(
        &self,
        tid: u32,
        lun: u32,
        backing_file: &str,
        bs_type: &str,
        bs_opts: &str,
    ) -> Result<()> {
        let tid = tid.to_string();
        let lun = lun.to_string();
        let mut args = vec![
            "--op",
            "new",
            "--mode",
            "logicalunit",
            "--tid",
            tid.as_str(),
            "--lun",
            lun.as_str(),
            "-b",
            backing_file,
        ];
        if !bs_type.is_empty() {
            args.extend_from_slice(&["--bstype", bs_type]);
        }
        if !bs_opts.is_empty() {
            args.extend_from_slice(&["--bsopts", bs_opts]);
        }

        self.tgtadm(&args)?;
        Ok(())
    }

    fn delete_lun(&self, tid: u32, lun: u32) -> Result<()> {
        let tid = tid.to_string();
        let lun = lun.to_string();
        self.tgtadm(&[
            "--op",
            "delete",
            "--mode",
            "logicalunit",
            "--tid",
            tid.as_str(),
            "--lun",
            lun.as_str(),
        ])?;
        Ok(())
    }

    fn bind_initiator(&self, tid: u32, initiator: &str) -> Result<()> {
        let tid = tid.to_string();
        self.tgtadm(&["--op", "bind", "--mode", "target", "--tid", tid.as_str(), "-I", initiator])?;
        Ok(())
    }

    fn unbind_initiator(&self, tid: u32, initiator: &str) -> Result<()> {
        let tid = tid.to_string();
        self.tgtadm(&["--op", "unbind", "--mode", "target", "--tid", tid.as_str(), "-I", initiator])?;
        Ok(())
    }

    fn get_target_tid(&self, name: &str) -> Result<Option<u32>> {
        let out = self.show_targets()?;
        Ok(parse_targets(&out)?.get(name).copied())
    }

    fn get_target_connections(&self, tid: u32) -> Result<BTreeMap<u32, Vec<u32>>> {
        let tid = tid.to_string();
        let out = self.tgtadm(&["--op", "show", "--mode", "conn", "--tid", tid.as_str()])?;
        parse_connections(&out)
    }

    fn close_connection(&self, tid: u32, sid: u32, cid: u32) -> Result<()> {
        let tid = tid.to_string();
        let sid = sid.to_string();
        let cid = cid.to_string();
        self.tgtadm(&[
            "--op", "delete", "--mode", "conn", "--tid", tid.as_str(), "--sid", sid.as_str(), "--cid", cid.as_str(),
        ])?;
        Ok(())
    }
}

/// target name -> tid, from `tgtadm --op show --mode target`
pub(crate) fn parse_targets(out: &str) -> Result<BTreeMap<String, u32>> {
    let re = Regex::new(r"^Target (\d+): (\S+)\s*$")?;

    let targets = out
        .lines()
        .filter_map(|line| re.captures(line))
        .filter_map(|caps| {
            let tid = caps[1].parse::<u32>().ok()?;
            Some((caps[2].to_string(), tid))
        })
        .collect();

    Ok(targets)
}

/// sid -> [cid], from `tgtadm --op show --mode conn`
pub(crate) fn parse_connections(out: &str) -> Result<BTreeMap<u32, Vec<u32>>> {
    let session_re = Regex::new(r"^\s*Session: (\d+)")?;
    let conn_re = Regex::new(r"^\s*Connection: (\d+)")?;

    let mut conns: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    let mut sid = None;
    for line in out.lines() {
        if let Some(caps) = session_re.captures(line) {
            let id = caps[1].parse::<u32>()?;
            conns.entry(id).or_default();
            sid = Some(id);
        } else if let Some(caps) = conn_re.captures(line) {
            let Some(id) = sid else {
                anyhow::bail!(IscsiError::Parse {
                    command: "tgtadm --op show --mode conn".to_string(),
                    reason: format!("connection outside of a session: '{}'", line.trim()),
                })
            };
            conns.entry(id).or_default().push(caps[1].parse::<u32>()?);
        }
    }

    Ok(conns)
}
