use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use iscsiblk::{is_consistency_violation, target_name, Config, Manager, ScsiDevice};

/// live target state disagrees with what the caller knows, nothing was touched
const EXIT_CONSISTENCY: i32 = 2;

#[derive(Parser)]
#[command(name = "iscsiblkcli")]
#[command(about = "Expose backing files as local block devices over iSCSI", long_about = None)]
struct Cli {
    /// YAML config, built-in defaults when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// create the target and log in, prints the device as YAML
    Start {
        name: String,
        backing_file: String,
        #[arg(long, default_value = "")]
        bs_type: String,
        #[arg(long, default_value = "")]
        bs_opts: String,
    },
    /// log out and remove the target
    Stop { name: String, tid: u32 },
    /// recreate the target of a started device with a new backing store
    Update {
        /// device YAML printed by `start`
        device: PathBuf,
        #[arg(long, default_value = "")]
        bs_type: String,
        #[arg(long, default_value = "")]
        bs_opts: String,
    },
    /// print the target IQN of a volume
    TargetName { name: String },
    /// print the effective config
    Config,
}

impl Cli {
    fn run(self) -> Result<()> {
        let cfg = match &self.config {
            Some(path) => Config::read(path)
                .with_context(|| format!("read config {}", path.display()))?,
            None => Config::default(),
        };

        match self.command {
            Command::Start {
                ref name,
                ref backing_file,
                ref bs_type,
                ref bs_opts,
            } => {
                let mut dev = ScsiDevice::new(name, backing_file, bs_type, bs_opts);
                Manager::host(cfg)?.start(&mut dev)?;
                print!("{}", serde_yml::to_string(&dev)?);
            }
            Command::Stop { ref name, tid } => {
                Manager::host(cfg)?.stop(name, tid)?;
            }
            Command::Update {
                ref device,
                ref bs_type,
                ref bs_opts,
            } => {
                let mut dev = read_device(device)?;
                dev.update_backing_store(bs_type, bs_opts);
                Manager::host(cfg)?.sync_update(&mut dev)?;
                print!("{}", serde_yml::to_string(&dev)?);
            }
            Command::TargetName { ref name } => println!("{}", target_name(name)),
            Command::Config => print!("{}", cfg.to_yml()?),
        }

        Ok(())
    }
}

fn read_device<P: AsRef<Path>>(path: P) -> Result<ScsiDevice> {
    let s = fs::read_to_string(path.as_ref())
        .with_context(|| format!("read device {}", path.as_ref().display()))?;
    let dev = serde_yml::from_str(&s)?;
    Ok(dev)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = Cli::parse().run() {
        log::error!("{:#}", err);
        if is_consistency_violation(&err) {
            process::exit(EXIT_CONSISTENCY);
        }
        process::exit(1);
    }
}
