mod config;
mod engine;
mod events;
mod index;
mod logging;
mod queue;
mod remote;
mod rules;
mod scanner;
mod state;

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use config::Config;
use engine::Engine;
use events::EventSink;
use queue::ActionQueue;
use remote::DepthInfinityRefused;
use rules::ExcludedPatterns;

#[derive(Parser, Debug)]
#[command(name = "subsyncit", version, about = "File sync backed by Subversion")]
struct Cli {
    /// Remote Subversion repo URL, e.g. http://127.0.0.1:8099/svn/testrepo
    remote_url: String,

    /// Local sync directory (absolute or relative)
    local_root: PathBuf,

    /// Subversion user name
    user: String,

    /// Password (plain text; `*NONE` for anonymous access). Prompted
    /// for when omitted.
    #[arg(long = "passwd")]
    passwd: Option<String>,

    /// Verify the server's SSL certificate (default)
    #[arg(long = "verify-ssl-cert", overrides_with = "no_verify_ssl_cert")]
    verify_ssl_cert: bool,

    /// Skip SSL certificate verification (self-signed certs)
    #[arg(long = "no-verify-ssl-cert")]
    no_verify_ssl_cert: bool,

    /// Rely on filesystem events only; skip the periodic scan
    #[arg(long = "do-not-scan-file-system-periodically")]
    no_scan: bool,

    /// Rely on the periodic scan only; skip filesystem events
    #[arg(long = "do-not-listen-for-file-system-events")]
    no_events: bool,

    /// Seconds to sleep between polls of the server for changes
    #[arg(long = "sleep-secs-between-polling", default_value_t = 30)]
    sleep_secs: u64,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => {}
        Err(err) => {
            if err.downcast_ref::<DepthInfinityRefused>().is_some() {
                eprintln!("{err}");
                eprintln!(
                    "Refer to the Subversion server setup notes for enabling DavDepthInfinity."
                );
                std::process::exit(1);
            }
            eprintln!("subsyncit: {err:#}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let password = match cli.passwd {
        None => Some(prompt_line(&format!(
            "Subversion password for {}: ",
            cli.user
        ))?),
        Some(p) if p == "*NONE" => None,
        Some(p) => Some(p),
    };

    let cfg = Arc::new(Config::resolve(
        &cli.remote_url,
        &cli.local_root,
        &cli.user,
        password,
        !cli.no_verify_ssl_cert,
        !cli.no_scan,
        !cli.no_events,
        cli.sleep_secs,
    )?);
    cfg.ensure_state_layout()?;
    logging::init_log_file(&cfg.log_path())?;
    logging::info(format!(
        "subsyncit start version={} url={} root={}",
        env!("CARGO_PKG_VERSION"),
        cfg.svn_url,
        cfg.local_root.display()
    ));

    let queue = Arc::new(ActionQueue::new());
    let rules = Arc::new(ExcludedPatterns::new());
    let shutdown = Arc::new(AtomicBool::new(false));
    let sink = Arc::new(EventSink::new(
        cfg.local_root.clone(),
        queue.clone(),
        rules.clone(),
        shutdown.clone(),
    ));

    // The watcher owns its notification thread; keep the handle alive
    // for the whole run.
    let _watcher = if cfg.watch_enabled {
        Some(events::spawn_watcher(sink.clone()).context("start filesystem watcher")?)
    } else {
        None
    };

    // Ctrl-C is equivalent to the stop sentinel.
    let ctrlc_flag = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            logging::info("interrupt received, shutting down");
            ctrlc_flag.store(true, Ordering::SeqCst);
        }
    });

    let mut engine = Engine::new(cfg, queue, rules, sink, shutdown)?;
    engine.run().await
}

fn prompt_line(prompt: &str) -> Result<String> {
    let mut out = std::io::stderr();
    let _ = out.write_all(prompt.as_bytes());
    let _ = out.flush();
    let mut buf = String::new();
    std::io::stdin()
        .read_line(&mut buf)
        .context("read stdin")?;
    Ok(buf.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_positional_arguments() {
        let cli = Cli::try_parse_from([
            "subsyncit",
            "http://127.0.0.1:8099/svn/testrepo",
            "/tmp/mySyncDir",
            "alice",
        ])
        .unwrap();
        assert_eq!(cli.remote_url, "http://127.0.0.1:8099/svn/testrepo");
        assert_eq!(cli.local_root, PathBuf::from("/tmp/mySyncDir"));
        assert_eq!(cli.user, "alice");
        assert!(cli.passwd.is_none());
        assert!(!cli.no_verify_ssl_cert);
        assert!(!cli.no_scan);
        assert!(!cli.no_events);
        assert_eq!(cli.sleep_secs, 30);
    }

    #[test]
    fn cli_parses_flags() {
        let cli = Cli::try_parse_from([
            "subsyncit",
            "https://example.net/svn/repo",
            "sync",
            "bob",
            "--passwd",
            "*NONE",
            "--no-verify-ssl-cert",
            "--do-not-scan-file-system-periodically",
            "--do-not-listen-for-file-system-events",
            "--sleep-secs-between-polling",
            "5",
        ])
        .unwrap();
        assert_eq!(cli.passwd.as_deref(), Some("*NONE"));
        assert!(cli.no_verify_ssl_cert);
        assert!(cli.no_scan);
        assert!(cli.no_events);
        assert_eq!(cli.sleep_secs, 5);
    }

    #[test]
    fn verify_flag_overrides_no_verify() {
        let cli = Cli::try_parse_from([
            "subsyncit",
            "https://example.net/svn/repo",
            "sync",
            "bob",
            "--no-verify-ssl-cert",
            "--verify-ssl-cert",
        ])
        .unwrap();
        assert!(cli.verify_ssl_cert);
        assert!(!cli.no_verify_ssl_cert);
    }

    #[test]
    fn missing_positionals_are_rejected() {
        assert!(Cli::try_parse_from(["subsyncit", "https://example.net/svn/repo"]).is_err());
    }
}
