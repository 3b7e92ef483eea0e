//! Recording fakes of the host collaborators, shared by the unit tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::error::ISCSI_ERR_NO_OBJS_FOUND;
use crate::exec::Executor;
use crate::lock::HostLock;
use crate::net::HostAddress;
use crate::tgt::TargetAdmin;
use crate::{Initiator, IscsiError};

pub fn failed(command: &str, code: i32) -> anyhow::Error {
    anyhow!(IscsiError::CommandFailed {
        command: command.to_string(),
        code: Some(code),
        stderr: String::new(),
    })
}

pub fn not_found(command: &str) -> anyhow::Error {
    failed(command, ISCSI_ERR_NO_OBJS_FOUND)
}

pub fn timed_out(command: &str) -> anyhow::Error {
    anyhow!(IscsiError::CommandTimeout {
        command: command.to_string(),
        timeout: Duration::from_secs(60),
    })
}

/// Canned replies keyed by the full command line.
///
/// Replies are consumed in order, the last one sticks. Unknown commands
/// succeed with empty output.
#[derive(Clone, Default)]
pub struct ScriptedExecutor {
    replies: Rc<RefCell<HashMap<String, VecDeque<Reply>>>>,
    history: Rc<RefCell<Vec<String>>>,
}

#[derive(Clone)]
enum Reply {
    Out(String),
    Code(i32),
    Timeout,
}

impl ScriptedExecutor {
    pub fn respond(&self, cmd: &str, reply: std::result::Result<&str, i32>) {
        let reply = match reply {
            Ok(out) => Reply::Out(out.to_string()),
            Err(code) => Reply::Code(code),
        };
        self.push(cmd, reply);
    }

    pub fn respond_timeout(&self, cmd: &str) {
        self.push(cmd, Reply::Timeout);
    }

    fn push(&self, cmd: &str, reply: Reply) {
        self.replies
            .borrow_mut()
            .entry(cmd.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn history(&self) -> Vec<String> {
        self.history.borrow().clone()
    }
}

impl Executor for ScriptedExecutor {
    fn execute(&self, binary: &str, args: &[&str]) -> Result<String> {
        let cmd = std::iter::once(binary)
            .chain(args.iter().copied())
            .collect::<Vec<&str>>()
            .join(" ");
        self.history.borrow_mut().push(cmd.clone());

        let reply = {
            let mut replies = self.replies.borrow_mut();
            match replies.get_mut(&cmd) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        match reply {
            None => Ok(String::new()),
            Some(Reply::Out(out)) => Ok(out),
            Some(Reply::Code(code)) => Err(failed(&cmd, code)),
            Some(Reply::Timeout) => Err(timed_out(&cmd)),
        }
    }
}

/// In-memory tgtd.
#[derive(Default)]
pub struct TargetState {
    pub daemon_running: bool,
    pub daemon_fails: bool,
    /// name -> tid
    pub targets: BTreeMap<String, u32>,
    /// tid -> (lun, backing file, bs type, bs opts)
    pub luns: BTreeMap<u32, (u32, String, String, String)>,
    pub acls: BTreeMap<u32, Vec<String>>,
    pub connections: BTreeMap<u32, BTreeMap<u32, Vec<u32>>>,
    /// creations that lose the race to another allocator
    pub collisions: usize,
    pub create_attempts: usize,
    pub fail_add_lun: bool,
    pub calls: Vec<String>,
}

#[derive(Clone, Default)]
pub struct MockTarget {
    pub state: Rc<RefCell<TargetState>>,
}

impl MockTarget {
    fn record(&self, call: String) {
        self.state.borrow_mut().calls.push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.borrow().calls.clone()
    }
}

impl TargetAdmin for MockTarget {
    fn start_daemon(&self, _debug: bool) -> Result<()> {
        self.record("start_daemon".to_string());
        let mut st = self.state.borrow_mut();
        if st.daemon_fails {
            return Err(anyhow!(IscsiError::DaemonNotReady));
        }
        st.daemon_running = true;
        Ok(())
    }

    fn find_next_available_target_id(&self) -> Result<u32> {
        let st = self.state.borrow();
        let tid = (1..)
            .find(|tid| !st.targets.values().any(|t| t == tid))
            .unwrap_or(1);
        Ok(tid)
    }

    fn create_target(&self, tid: u32, name: &str) -> Result<()> {
        self.record(format!("create_target {} {}", tid, name));
        let mut st = self.state.borrow_mut();
        st.create_attempts += 1;
        if st.collisions > 0 {
            st.collisions -= 1;
            st.targets
                .insert(format!("iqn.2014-09.com.other:{}", tid), tid);
        }
        if st.targets.values().any(|t| *t == tid) {
            return Err(failed(
                &format!("tgtadm --op new --mode target --tid {}", tid),
                22,
            ));
        }
        st.targets.insert(name.to_string(), tid);
        Ok(())
    }

    fn delete_target(&self, tid: u32) -> Result<()> {
        self.record(format!("delete_target {}", tid));
        let mut st = self.state.borrow_mut();
        st.targets.retain(|_, t| *t != tid);
        st.connections.remove(&tid);
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
        self.record(format!("add_lun {} {}", tid, lun));
        let mut st = self.state.borrow_mut();
        if st.fail_add_lun {
            return Err(failed("tgtadm --op new --mode logicalunit", 22));
        }
        st.luns.insert(
            tid,
            (
                lun,
                backing_file.to_string(),
                bs_type.to_string(),
                bs_opts.to_string(),
            ),
        );
        Ok(())
    }

    fn delete_lun(&self, tid: u32, lun: u32) -> Result<()> {
        self.record(format!("delete_lun {} {}", tid, lun));
        self.state.borrow_mut().luns.remove(&tid);
        Ok(())
    }

    fn bind_initiator(&self, tid: u32, initiator: &str) -> Result<()> {
        self.record(format!("bind_initiator {} {}", tid, initiator));
        self.state
            .borrow_mut()
            .acls
            .entry(tid)
            .or_default()
            .push(initiator.to_string());
        Ok(())
    }

    fn unbind_initiator(&self, tid: u32, initiator: &str) -> Result<()> {
        self.record(format!("unbind_initiator {} {}", tid, initiator));
        if let Some(acl) = self.state.borrow_mut().acls.get_mut(&tid) {
            acl.retain(|i| i != initiator);
        }
        Ok(())
    }

    fn get_target_tid(&self, name: &str) -> Result<Option<u32>> {
        Ok(self.state.borrow().targets.get(name).copied())
    }

    fn get_target_connections(&self, tid: u32) -> Result<BTreeMap<u32, Vec<u32>>> {
        Ok(self
            .state
            .borrow()
            .connections
            .get(&tid)
            .cloned()
            .unwrap_or_default())
    }

    fn close_connection(&self, tid: u32, sid: u32, cid: u32) -> Result<()> {
        self.record(format!("close_connection {} {} {}", tid, sid, cid));
        let mut st = self.state.borrow_mut();
        if let Some(sessions) = st.connections.get_mut(&tid) {
            if let Some(cids) = sessions.get_mut(&sid) {
                cids.retain(|c| *c != cid);
            }
        }
        Ok(())
    }
}

/// In-memory open-iscsi.
#[derive(Default)]
pub struct InitiatorState {
    pub missing: bool,
    pub discovered: bool,
    pub logged_in: bool,
    /// discovery attempts that still fail before one succeeds
    pub discovery_failures: usize,
    pub fail_login: bool,
    /// scripted logout results, consumed in order, an empty queue succeeds
    pub logout_replies: VecDeque<anyhow::Error>,
    /// polls of the session table before an asynchronous logout lands
    pub logout_lag: Option<usize>,
    /// scripted discovery deletion results
    pub delete_replies: VecDeque<anyhow::Error>,
    pub device: PathBuf,
    pub calls: Vec<String>,
}

#[derive(Clone)]
pub struct MockInitiator {
    pub state: Rc<RefCell<InitiatorState>>,
}

impl Default for MockInitiator {
    fn default() -> Self {
        let state = InitiatorState {
            // a character device, so the readiness check passes
            device: PathBuf::from("/dev/null"),
            ..Default::default()
        };
        MockInitiator {
            state: Rc::new(RefCell::new(state)),
        }
    }
}

impl MockInitiator {
    fn record(&self, call: &str) {
        self.state.borrow_mut().calls.push(call.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.borrow().calls.clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.state
            .borrow()
            .calls
            .iter()
            .filter(|c| c.as_str() == call)
            .count()
    }
}

impl Initiator for MockInitiator {
    fn check_for_initiator_existence(&self) -> Result<()> {
        self.record("check_for_initiator_existence");
        if self.state.borrow().missing {
            return Err(anyhow!(IscsiError::InitiatorMissing(
                "iscsiadm: not found".to_string()
            )));
        }
        Ok(())
    }

    fn discover_target(&self, _ip: &str, target: &str) -> Result<()> {
        self.record("discover_target");
        let mut st = self.state.borrow_mut();
        if st.discovery_failures > 0 {
            st.discovery_failures -= 1;
            return Err(anyhow!(IscsiError::TargetNotDiscovered(target.to_string())));
        }
        st.discovered = true;
        Ok(())
    }

    fn is_target_discovered(&self, _ip: &str, _target: &str) -> bool {
        self.state.borrow().discovered
    }

    fn cleanup_scsi_nodes(&self, _target: &str) -> Result<()> {
        self.record("cleanup_scsi_nodes");
        Ok(())
    }

    fn delete_discovered_target(&self, ip: &str, target: &str) -> Result<()> {
        self.record("delete_discovered_target");
        let mut st = self.state.borrow_mut();
        if let Some(err) = st.delete_replies.pop_front() {
            return Err(err);
        }
        if !st.discovered {
            return Err(not_found(&format!(
                "iscsiadm -m node -o delete -T {} -p {}",
                target, ip
            )));
        }
        st.discovered = false;
        Ok(())
    }

    fn login_target(&self, _ip: &str, target: &str) -> Result<()> {
        self.record("login_target");
        let mut st = self.state.borrow_mut();
        if st.fail_login {
            return Err(failed(&format!("iscsiadm -m node -T {} --login", target), 8));
        }
        st.logged_in = true;
        Ok(())
    }

    fn logout_target(&self, _ip: &str, _target: &str) -> Result<()> {
        self.record("logout_target");
        let mut st = self.state.borrow_mut();
        if let Some(err) = st.logout_replies.pop_front() {
            return Err(err);
        }
        st.logged_in = false;
        Ok(())
    }

    fn is_target_logged_in(&self, _ip: &str, _target: &str) -> bool {
        self.record("is_target_logged_in");
        let mut st = self.state.borrow_mut();
        if let Some(lag) = st.logout_lag {
            if lag == 0 {
                st.logged_in = false;
                st.logout_lag = None;
            } else {
                st.logout_lag = Some(lag - 1);
            }
        }
        st.logged_in
    }

    fn get_device(&self, _ip: &str, target: &str, lun: u32) -> Result<PathBuf> {
        self.record("get_device");
        let st = self.state.borrow();
        if !st.logged_in {
            return Err(anyhow!(IscsiError::DeviceNotFound(target.to_string(), lun)));
        }
        Ok(st.device.clone())
    }

    fn rescan_target(&self, _ip: &str, _target: &str) -> Result<()> {
        self.record("rescan_target");
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MockLock {
    pub state: Rc<RefCell<LockState>>,
}

#[derive(Default)]
pub struct LockState {
    pub held: bool,
    pub acquired: usize,
    pub released: usize,
    pub timeout: bool,
}

pub struct MockGuard(Rc<RefCell<LockState>>);

impl Drop for MockGuard {
    fn drop(&mut self) {
        let mut st = self.0.borrow_mut();
        st.held = false;
        st.released += 1;
    }
}

impl HostLock for MockLock {
    type Guard = MockGuard;

    fn lock(&self) -> Result<MockGuard> {
        let mut st = self.state.borrow_mut();
        if st.timeout || st.held {
            return Err(anyhow!(IscsiError::LockTimeout(
                "/var/run/longhorn-iscsi.lock".to_string(),
                Duration::from_secs(120)
            )));
        }
        st.held = true;
        st.acquired += 1;
        Ok(MockGuard(self.state.clone()))
    }
}

#[derive(Clone)]
pub struct MockAddress(pub Option<String>);

impl Default for MockAddress {
    fn default() -> Self {
        MockAddress(Some("192.168.2.30".to_string()))
    }
}

impl HostAddress for MockAddress {
    fn ip_to_host(&self) -> Result<String> {
        self.0.clone().ok_or_else(|| anyhow!(IscsiError::NoHostIp))
    }
}
