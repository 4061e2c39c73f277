/*
 * braid is the braid consensus server. It takes configuration via a
 * configuration file, command-line parameters, and environment variables,
 * then starts the configured raft groups with a demo key/value state
 * machine over the in-process loopback transport. Production deployments
 * embed the braid crate as a library and supply their own transport and
 * state machine.
 */

#![warn(clippy::all)]

use braid::error::Result;
use braid::raft::{self, GroupConfig, RaftInput, StateMachine};
use braid::server::{LoopbackNet, Server, ServerOptions};
use braid::{encoding::bincode, errinput};

use serde_derive::Deserialize;
use std::any::Any;
use std::collections::BTreeMap;
use std::time::Duration;

fn main() -> Result<()> {
    let args = clap::command!()
        .arg(
            clap::Arg::new("config")
                .short('c')
                .long("config")
                .help("Configuration file path")
                .default_value("config/braid.yaml"),
        )
        .get_matches();
    let cfg = Config::new(args.get_one::<String>("config").unwrap().as_ref())?;

    let loglevel = cfg.log_level.parse::<simplelog::LevelFilter>()?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    if loglevel != simplelog::LevelFilter::Debug {
        logconfig.add_filter_allow_str("braid");
    }
    simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

    if cfg.groups.is_empty() {
        return errinput!("no raft groups configured");
    }

    let mut opts = ServerOptions::new(&cfg.data_dir);
    opts.dispatchers = cfg.dispatchers;
    opts.io_threads = cfg.io_threads;
    let mut server = Server::new(opts);

    let net = LoopbackNet::new();
    for group_id in &cfg.groups {
        let mut group_cfg = GroupConfig::new(*group_id, cfg.id, vec![cfg.id]);
        group_cfg.elect_timeout = Duration::from_millis(cfg.elect_timeout_ms);
        group_cfg.heartbeat_interval = Duration::from_millis(cfg.heartbeat_interval_ms);
        let group =
            server.add_group(group_cfg, Box::new(Kv::new()), net.transport(cfg.id))?;
        net.register(cfg.id, group);
    }

    log::info!("braid node {} serving {} group(s)", cfg.id, cfg.groups.len());
    loop {
        std::thread::park();
    }
}

#[derive(Debug, Deserialize)]
struct Config {
    id: raft::NodeId,
    groups: Vec<braid::fiber::GroupId>,
    log_level: String,
    data_dir: String,
    dispatchers: usize,
    io_threads: usize,
    elect_timeout_ms: u64,
    heartbeat_interval_ms: u64,
}

impl Config {
    fn new(file: &str) -> Result<Self> {
        Ok(config::Config::builder()
            .set_default("id", "1")?
            .set_default("groups", vec!["1"])?
            .set_default("log_level", "info")?
            .set_default("data_dir", "data")?
            .set_default("dispatchers", "2")?
            .set_default("io_threads", "4")?
            .set_default("elect_timeout_ms", "1500")?
            .set_default("heartbeat_interval_ms", "150")?
            .add_source(config::File::with_name(file).required(false))
            .add_source(config::Environment::with_prefix("BRAID"))
            .build()?
            .try_deserialize()?)
    }
}

/// The demo key/value state machine: commands are bincode-encoded
/// (key, value) puts, reads are bincode-encoded keys.
struct Kv {
    data: BTreeMap<String, String>,
}

impl Kv {
    fn new() -> Self {
        Self { data: BTreeMap::new() }
    }
}

impl StateMachine for Kv {
    fn decode(&self, _biz_type: u16, body: &[u8]) -> Result<Box<dyn Any + Send>> {
        let (key, value): (String, String) = bincode::deserialize(body)?;
        Ok(Box::new((key, value)))
    }

    fn exec(&mut self, _index: u64, input: &RaftInput) -> Result<Box<dyn Any + Send>> {
        if input.read_only {
            let key: String = bincode::deserialize(&input.body)?;
            return Ok(Box::new(self.data.get(&key).cloned()));
        }
        let (key, value): (String, String) = match input.decoded.as_ref() {
            Some(decoded) => match decoded.downcast_ref::<(String, String)>() {
                Some(kv) => kv.clone(),
                None => return errinput!("unexpected command type"),
            },
            None => bincode::deserialize(&input.body)?,
        };
        self.data.insert(key, value.clone());
        Ok(Box::new(value))
    }

    fn take_snapshot(&self) -> Result<Vec<u8>> {
        bincode::serialize(&self.data)
    }

    fn install_snapshot(&mut self, _index: u64, _term: u32, data: &[u8]) -> Result<()> {
        self.data = bincode::deserialize(data)?;
        Ok(())
    }
}
