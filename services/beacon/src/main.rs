use clap::{App, Arg};
use obsidian::net::endpoint::{Endpoint, ServerContext};
use obsidian::policy::Policy;
use obsidian::sim::{ClaimedScoreSimulation, LevelRecord, StaticCatalog};
use obsidian::store::MemoryStore;
use quartz::logging;
use serde_derive::Deserialize;
use std::io::BufRead;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

#[derive(Deserialize)]
struct Config {
    address: String,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    levels: Vec<LevelRecord>,
    #[serde(default)]
    policy: PolicyOverrides,
}

fn default_log_level() -> String {
    "debug".to_string()
}

/// Optional overrides for the reference policy values. Anything omitted keeps the
/// default.
#[derive(Deserialize, Default)]
struct PolicyOverrides {
    score_tolerance_secs: Option<f64>,
    cache_ttl_secs: Option<u64>,
    heartbeat_interval_secs: Option<u64>,
    idle_timeout_secs: Option<u64>,
    token_purge_interval_secs: Option<u64>,
    token_max_age_secs: Option<u64>,
    max_consecutive_failures: Option<u32>,
    top_scores_limit: Option<usize>,
    max_name_length: Option<usize>,
}

impl PolicyOverrides {
    fn apply(&self, policy: &mut Policy) {
        if let Some(value) = self.score_tolerance_secs {
            policy.score_tolerance_secs = value;
        }
        if let Some(value) = self.cache_ttl_secs {
            policy.cache_ttl = Duration::from_secs(value);
        }
        if let Some(value) = self.heartbeat_interval_secs {
            policy.heartbeat_interval = Duration::from_secs(value);
        }
        if let Some(value) = self.idle_timeout_secs {
            policy.idle_timeout = Duration::from_secs(value);
        }
        if let Some(value) = self.token_purge_interval_secs {
            policy.token_purge_interval = Duration::from_secs(value);
        }
        if let Some(value) = self.token_max_age_secs {
            policy.token_max_age_secs = value;
        }
        if let Some(value) = self.max_consecutive_failures {
            policy.max_consecutive_failures = value;
        }
        if let Some(value) = self.top_scores_limit {
            policy.top_scores_limit = value;
        }
        if let Some(value) = self.max_name_length {
            policy.max_name_length = value;
        }
    }
}

pub fn main() {
    let matches = App::new("Beacon Leaderboard Server")
        .version("0.1")
        .author("Quarry Works")
        .about("Runs the online leaderboard server.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the config file")
                .required(true),
        )
        .get_matches();

    let config_path = matches.value_of("CONFIG_FILE").unwrap();
    let config: Config = serdeconv::from_toml_file(config_path).expect("Failed reading the config file");

    let log = logging::terminal(&config.log_level);

    let mut policy = Policy::default();
    config.policy.apply(&mut policy);

    let ctx = ServerContext {
        store: Box::new(MemoryStore::new()),
        sim: Box::new(ClaimedScoreSimulation),
        catalog: Box::new(StaticCatalog::new(config.levels)),
        policy,
        log: log.clone(),
    };

    let mut endpoint = match Endpoint::new(&config.address, ctx) {
        Ok(endpoint) => endpoint,
        Err(err) => {
            logging::crit!(log, "startup failed"; "error" => ?err);
            std::process::exit(1);
        }
    };

    endpoint.set_control(spawn_console());
    endpoint.run();
}

/// Reads operator commands off stdin on a helper thread. The endpoint drains the
/// channel on its own schedule; communication is message passing only.
fn spawn_console() -> mpsc::Receiver<String> {
    let (sender, receiver) = mpsc::channel();

    thread::spawn(move || {
        let stdin = std::io::stdin();

        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if sender.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    receiver
}
