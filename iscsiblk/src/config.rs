use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::retry::Retry;

static LOCK_FILE: &str = "/var/run/longhorn-iscsi.lock";
static HOST_PROC: &str = "/host/proc";
static TGTD_LOG_FILE: &str = "/var/log/tgtd.log";

/// Tunables for the lifecycle orchestrator and the host tools it drives.
///
/// Durations are stored in milliseconds in yaml.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    lock_file: PathBuf,
    #[serde(with = "millis")]
    lock_timeout: Duration,

    target_lun: u32,

    retry_count: usize,
    #[serde(with = "millis")]
    retry_interval_scsi: Duration,
    #[serde(with = "millis")]
    retry_interval_target_id: Duration,

    host_proc: PathBuf,
    #[serde(with = "millis")]
    command_timeout: Duration,

    device_wait_retry_count: usize,
    #[serde(with = "millis")]
    device_wait_retry_interval: Duration,
    daemon_wait_retry_count: usize,
    #[serde(with = "millis")]
    daemon_wait_retry_interval: Duration,
    tgtd_log_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            lock_file: PathBuf::from(LOCK_FILE),
            lock_timeout: Duration::from_secs(120),
            target_lun: 1,
            retry_count: 5,
            retry_interval_scsi: Duration::from_secs(3),
            retry_interval_target_id: Duration::from_millis(500),
            host_proc: PathBuf::from(HOST_PROC),
            command_timeout: Duration::from_secs(60),
            device_wait_retry_count: 5,
            device_wait_retry_interval: Duration::from_secs(1),
            daemon_wait_retry_count: 10,
            daemon_wait_retry_interval: Duration::from_secs(1),
            tgtd_log_file: PathBuf::from(TGTD_LOG_FILE),
        }
    }
}

impl Config {
    /// create `Config` from yaml string, missing keys keep their defaults
    pub fn from(s: &str) -> Result<Config> {
        let config = serde_yml::from_str::<Config>(s)?;
        Ok(config)
    }

    /// create `Config` from yaml file
    pub fn read<S: AsRef<Path>>(filename: S) -> Result<Config> {
        let s = fs::read_to_string(filename)?;
        Config::from(&s)
    }

    /// encodes `Config` to yaml string
    pub fn to_yml(&self) -> Result<String> {
        let s = serde_yml::to_string(self)?;
        Ok(s)
    }

    /// echo `Config` yaml string to the file
    pub fn write_to<S: AsRef<Path>>(&self, filename: S) -> Result<()> {
        let yml = self.to_yml()?;
        fs::write(filename, yml)?;

        Ok(())
    }

    pub fn lock_file(&self) -> &Path {
        &self.lock_file
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub fn target_lun(&self) -> u32 {
        self.target_lun
    }

    pub fn host_proc(&self) -> &Path {
        &self.host_proc
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    pub fn tgtd_log_file(&self) -> &Path {
        &self.tgtd_log_file
    }

    /// retry policy for discovery, logout and device readiness
    pub fn scsi_retry(&self) -> Retry {
        Retry::new(self.retry_count, self.retry_interval_scsi)
    }

    /// retry policy for target id collisions
    pub fn target_id_retry(&self) -> Retry {
        Retry::new(self.retry_count, self.retry_interval_target_id)
    }

    pub fn device_wait_retry(&self) -> Retry {
        Retry::new(self.device_wait_retry_count, self.device_wait_retry_interval)
    }

    pub fn daemon_wait_retry(&self) -> Retry {
        Retry::new(self.daemon_wait_retry_count, self.daemon_wait_retry_interval)
    }

    pub fn set_lock_file<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.lock_file = path.as_ref().to_path_buf();
        self
    }

    pub fn set_lock_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn set_host_proc<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.host_proc = path.as_ref().to_path_buf();
        self
    }

    pub fn set_retry_count(&mut self, count: usize) -> &mut Self {
        self.retry_count = count;
        self
    }

    /// sets both scsi and target id retry intervals
    pub fn set_retry_interval(&mut self, interval: Duration) -> &mut Self {
        self.retry_interval_scsi = interval;
        self.retry_interval_target_id = interval;
        self
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}
