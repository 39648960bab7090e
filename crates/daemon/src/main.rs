#![forbid(unsafe_code)]

use ns_core::JobStatus;
use ns_storage::{QueueError, QueueRegistry, RegistryConfig};
use std::io::BufRead;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "ns_storage=info,ns_daemon=info";

#[derive(Debug)]
struct DaemonConfig {
    config_path: Option<PathBuf>,
    data_dir: PathBuf,
}

fn usage() -> &'static str {
    "ns_daemon: host a job queue registry and its background loops\n\n\
USAGE:\n\
  ns_daemon [--config FILE] [--data-dir DIR]\n\n\
COMMANDS (stdin, one per line):\n\
  stat [QUEUE]              queue counters\n\
  dump QUEUE [STATUS]       job listing\n\
  query QUEUE EXPR          ids matching a structured query\n\
  create NAME CLASS [TEXT]  add a dynamic queue\n\
  delete NAME               drop a dynamic queue\n\
  reconfigure               re-read the config file\n\
  quit\n\n\
NOTES:\n\
  - `NS_CONFIG` / `NS_DATA_DIR` provide defaults for the flags.\n\
  - logging follows `RUST_LOG` (default `ns_storage=info,ns_daemon=info`).\n"
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_args() -> Result<DaemonConfig, String> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        print!("{}", usage());
        std::process::exit(0);
    }

    let mut config_path: Option<PathBuf> = env_var("NS_CONFIG").map(PathBuf::from);
    let mut data_dir: PathBuf = env_var("NS_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("netschedule_data"));

    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                let v = args.get(i).ok_or("--config requires FILE")?;
                config_path = Some(PathBuf::from(v));
            }
            "--data-dir" => {
                i += 1;
                let v = args.get(i).ok_or("--data-dir requires DIR")?;
                data_dir = PathBuf::from(v);
            }
            other => return Err(format!("unknown argument: {other}\n\n{}", usage())),
        }
        i += 1;
    }

    Ok(DaemonConfig {
        config_path,
        data_dir,
    })
}

fn load_config(cfg: &DaemonConfig) -> Result<RegistryConfig, QueueError> {
    match &cfg.config_path {
        Some(path) => RegistryConfig::from_file(path),
        None => Ok(RegistryConfig::default()),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Stat(Option<String>),
    Dump(String, Option<JobStatus>),
    Query(String, String),
    Create {
        name: String,
        class: String,
        comment: String,
    },
    Delete(String),
    Reconfigure,
    Quit,
}

fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    let mut words = rest.split_whitespace();
    let command = match verb.to_ascii_lowercase().as_str() {
        "stat" => Command::Stat(words.next().map(str::to_string)),
        "dump" => {
            let queue = words.next().ok_or("dump requires QUEUE")?.to_string();
            let status = match words.next() {
                Some(raw) => Some(
                    JobStatus::parse(raw).ok_or_else(|| format!("unknown job status '{raw}'"))?,
                ),
                None => None,
            };
            Command::Dump(queue, status)
        }
        "query" => {
            let (queue, expr) = rest
                .split_once(char::is_whitespace)
                .ok_or("query requires QUEUE EXPR")?;
            Command::Query(queue.to_string(), expr.trim().to_string())
        }
        "create" => {
            let name = words.next().ok_or("create requires NAME CLASS")?.to_string();
            let class = words.next().ok_or("create requires NAME CLASS")?.to_string();
            let comment = words.collect::<Vec<_>>().join(" ");
            Command::Create {
                name,
                class,
                comment,
            }
        }
        "delete" => Command::Delete(words.next().ok_or("delete requires NAME")?.to_string()),
        "reconfigure" => Command::Reconfigure,
        "quit" | "exit" => Command::Quit,
        other => return Err(format!("unknown command '{other}'")),
    };
    Ok(Some(command))
}

/// Runs one command; returns false once the daemon should stop.
fn execute(
    registry: &QueueRegistry,
    cfg: &DaemonConfig,
    command: Command,
) -> Result<bool, QueueError> {
    match command {
        Command::Stat(Some(name)) => print!("{}", registry.queue(&name)?.queue_info()),
        Command::Stat(None) => {
            for queue in registry.queues() {
                print!("{}", queue.queue_info());
            }
        }
        Command::Dump(name, status) => {
            for descr in registry.queue(&name)?.dump(status)? {
                print!("{descr}");
            }
        }
        Command::Query(name, expr) => {
            let ids: Vec<String> = registry
                .queue(&name)?
                .query(&expr)?
                .iter()
                .map(|id| id.to_string())
                .collect();
            println!("{}", ids.join(" "));
        }
        Command::Create {
            name,
            class,
            comment,
        } => {
            registry.create_queue(&name, &class, &comment)?;
            println!("created {name}");
        }
        Command::Delete(name) => {
            registry.delete_queue(&name)?;
            println!("deleted {name}");
        }
        Command::Reconfigure => {
            let min_run_timeout_s = registry.reconfigure(load_config(cfg)?)?;
            println!("reconfigured; min run timeout {min_run_timeout_s}s");
        }
        Command::Quit => return Ok(false),
    }
    Ok(true)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = parse_args().map_err(|e| {
        eprintln!("{e}");
        std::process::exit(2);
    })?;

    let registry = QueueRegistry::open(&cfg.data_dir, load_config(&cfg)?)?;
    registry.start_background()?;
    info!(
        data_dir = %cfg.data_dir.display(),
        queues = registry.queue_names().len(),
        "daemon ready"
    );

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(message) => {
                eprintln!("{message}");
                continue;
            }
        };
        match execute(&registry, &cfg, command) {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => {
                error!(error = %err, "command failed");
                eprintln!("error: {err}");
            }
        }
    }

    registry.close();
    info!("daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse() {
        assert_eq!(parse_command("   ").expect("blank"), None);
        assert_eq!(
            parse_command("stat").expect("stat"),
            Some(Command::Stat(None))
        );
        assert_eq!(
            parse_command("dump q1 running").expect("dump"),
            Some(Command::Dump("q1".into(), Some(JobStatus::Running)))
        );
        assert_eq!(
            parse_command("query q1 status = Pending and color = red").expect("query"),
            Some(Command::Query(
                "q1".into(),
                "status = Pending and color = red".into()
            ))
        );
        assert_eq!(
            parse_command("create q2 fast nightly batch").expect("create"),
            Some(Command::Create {
                name: "q2".into(),
                class: "fast".into(),
                comment: "nightly batch".into(),
            })
        );
        assert_eq!(parse_command("QUIT").expect("quit"), Some(Command::Quit));
    }

    #[test]
    fn bad_commands_are_rejected() {
        assert!(parse_command("dump").is_err());
        assert!(parse_command("dump q bogus").is_err());
        assert!(parse_command("create q").is_err());
        assert!(parse_command("launch").is_err());
    }
}
