use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::IscsiError;

static NSENTER: &str = "nsenter";
static CONTAINER_NS_PATH: &str = "/proc/1/ns";
const WAIT_POLL: Duration = Duration::from_millis(10);

/// Runs a binary and returns its stdout.
///
/// Failures surface as `IscsiError::CommandFailed` carrying the exit status,
/// hung commands as `IscsiError::CommandTimeout`.
pub trait Executor {
    fn execute(&self, binary: &str, args: &[&str]) -> Result<String>;
}

/// namespace directory of pid 1 on the host, seen through `host_proc`
pub fn host_namespace_path<P: AsRef<Path>>(host_proc: P) -> PathBuf {
    let host_proc = host_proc.as_ref();
    if host_proc.exists() {
        return host_proc.join("1").join("ns");
    }
    PathBuf::from(CONTAINER_NS_PATH)
}

/// filesystem root of pid 1 on the host, seen through `host_proc`
pub fn host_root_path<P: AsRef<Path>>(host_proc: P) -> PathBuf {
    let root = host_proc.as_ref().join("1").join("root");
    if root.exists() {
        return root;
    }
    PathBuf::from("/")
}

#[derive(Debug, Clone)]
pub struct NamespaceExecutor {
    ns: Option<PathBuf>,
    timeout: Duration,
}

impl NamespaceExecutor {
    /// executes commands inside the mount and network namespace found in `ns`
    pub fn new<P: AsRef<Path>>(ns: P, timeout: Duration) -> Result<Self> {
        let ns = ns.as_ref();
        if !ns.exists() {
            anyhow::bail!(IscsiError::NoNamespace(ns.to_string_lossy().to_string()))
        }

        Ok(NamespaceExecutor {
            ns: Some(ns.to_path_buf()),
            timeout,
        })
    }

    /// executes commands in the caller's own namespaces
    pub fn local(timeout: Duration) -> Self {
        NamespaceExecutor { ns: None, timeout }
    }

    pub fn ns(&self) -> Option<&Path> {
        self.ns.as_deref()
    }

    fn command(&self, binary: &str, args: &[&str]) -> (Command, String) {
        let display = std::iter::once(binary)
            .chain(args.iter().copied())
            .collect::<Vec<&str>>()
            .join(" ");

        match &self.ns {
            Some(ns) => {
                let mut cmd = Command::new(NSENTER);
                cmd.arg(format!("--mount={}", ns.join("mnt").display()))
                    .arg(format!("--net={}", ns.join("net").display()))
                    .arg(binary)
                    .args(args);
                (cmd, display)
            }
            None => {
                let mut cmd = Command::new(binary);
                cmd.args(args);
                (cmd, display)
            }
        }
    }
}

impl Executor for NamespaceExecutor {
    fn execute(&self, binary: &str, args: &[&str]) -> Result<String> {
        let (mut cmd, display) = self.command(binary, args);
        log::debug!("executing: {}", display);

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(IscsiError::Io)?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                child.kill().ok();
                child.wait().ok();
                anyhow::bail!(IscsiError::CommandTimeout {
                    command: display,
                    timeout: self.timeout,
                })
            }
            thread::sleep(WAIT_POLL);
        };

        let out = stdout.join().unwrap_or_default();
        let err = stderr.join().unwrap_or_default();
        if !status.success() {
            anyhow::bail!(IscsiError::CommandFailed {
                command: display,
                code: status.code(),
                stderr: err.trim().to_string(),
            })
        }

        Ok(out)
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_string(&mut buf).ok();
        }
        buf
    })
}
