//! arbiterd - per-user resource arbitration daemon for login nodes.
//!
//! Watches per-user cgroup and process usage, scores sustained overuse,
//! applies penalty quotas, and synchronizes state with peer nodes through
//! a shared status database.

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};

use chrono::Utc;
use clap::Parser;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use arbiter_core::arbiter::Arbiter;
use arbiter_core::collector::cgroup::CgroupPaths;
use arbiter_core::collector::procfs::parse_pid_status;
use arbiter_core::collector::{FileSystem, RealFs};
use arbiter_core::config::Config;
use arbiter_core::enforce::PermissionHelper;
use arbiter_core::statusdb::Synchronizer;
use arbiter_core::statusdb::postgres::PostgresStatusStore;
use arbiter_core::util::local_hostname;

/// Exit code signalling a coordinated restart (exit-file touched).
const EXIT_RESTART: i32 = 7;

/// Per-user resource arbitration daemon.
#[derive(Parser)]
#[command(name = "arbiterd", about = "Per-user resource arbitration daemon", version)]
struct Args {
    /// Configuration files, merged in order (later files override).
    #[arg(short, long, required = true, num_args = 1.., value_name = "FILE")]
    config: Vec<PathBuf>,

    /// Site integration hooks directory.
    #[arg(long, value_name = "DIR")]
    etc: Option<PathBuf>,

    /// Repair unwritable cgroup files through sudo chown.
    #[arg(long)]
    sudo: bool,

    /// Write a throwaway quota for this uid at startup to force systemd
    /// to keep per-user cgroup accounting enabled.
    #[arg(long, value_name = "UID")]
    account_uid: Option<u32>,

    /// Exit with a distinguished code when this file is touched after
    /// startup (coordinated restart).
    #[arg(long, value_name = "PATH")]
    exit_file: Option<PathBuf>,

    /// Log to stdout without timestamps.
    #[arg(long)]
    print: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Initializes the tracing subscriber with the appropriate log level.
fn init_logging(verbose: u8, quiet: bool, print: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("arbiterd={}", level).parse().unwrap())
        .add_directive(format!("arbiter_core={}", level).parse().unwrap());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if print {
        builder.without_time().init();
    } else {
        builder.init();
    }
}

/// Permission helper that chowns quota files to the daemon's uid through
/// a sudoers-gated rule.
struct SudoChown {
    uid: u32,
}

impl SudoChown {
    fn from_proc() -> Self {
        let uid = std::fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|c| parse_pid_status(&c).ok())
            .map(|s| s.uid)
            .unwrap_or(0);
        Self { uid }
    }
}

impl PermissionHelper for SudoChown {
    fn make_writable(&self, path: &Path) -> io::Result<()> {
        let status = Command::new("sudo")
            .arg("-n")
            .arg("chown")
            .arg(self.uid.to_string())
            .arg(path)
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!("sudo chown exited with {status}")))
        }
    }
}

/// Asserts unlimited quotas on one uid's slice so systemd instantiates
/// (and keeps) the accounting cgroups for user slices.
fn force_accounting(fs: &RealFs, paths: &CgroupPaths, uid: u32) {
    for (path, value) in [
        (paths.cpu_cfs_quota(uid), "-1"),
        (paths.memory_limit(uid), "-1"),
    ] {
        match fs.write(&path, value) {
            Ok(()) => debug!(uid, path = %path.display(), "accounting bootstrap write"),
            Err(e) => warn!(uid, path = %path.display(), error = %e, "accounting bootstrap failed"),
        }
    }
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Sleeps until the deadline in short slices, returning early on shutdown.
fn sleep_until(deadline: Instant, running: &AtomicBool) {
    let slice = Duration::from_millis(100);
    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep((deadline - now).min(slice));
    }
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet, args.print);

    info!("arbiterd {} starting", env!("CARGO_PKG_VERSION"));

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let hostname = if config.statusdb.hostname.is_empty() {
        local_hostname()
    } else {
        config.statusdb.hostname.clone()
    };
    info!(
        "Config: refresh={}s, poll={}, history_per_refresh={}, min_uid={}, debug_mode={}",
        config.general.arbiter_refresh,
        config.general.poll,
        config.general.history_per_refresh,
        config.general.min_uid,
        config.general.debug_mode,
    );
    if let Some(ref etc) = args.etc {
        info!("Integration hooks directory: {}", etc.display());
    }
    if config.general.debug_mode {
        info!("Debug mode: quota enforcement disabled, notifications marked");
    }

    let sub_interval = Duration::from_secs_f64(
        config.general.arbiter_refresh as f64
            / (config.general.history_per_refresh * config.general.poll) as f64,
    );

    let fs = RealFs::new();
    let sync_config = (
        config.sync_enabled(),
        config.statusdb.url.clone(),
        config.statusdb.sync_group.clone(),
        config.badness.imported_badness_timeout,
    );

    let mut arbiter = Arbiter::new(
        config,
        fs,
        CgroupPaths::DEFAULT_BASE,
        "/proc",
        hostname.clone(),
    );

    if let Err(e) = arbiter.verify() {
        error!("startup verification failed: {e}");
        std::process::exit(1);
    }

    if args.sudo {
        info!("Quota permission repair: enabled (sudo chown)");
        arbiter = arbiter.with_permission_helper(Box::new(SudoChown::from_proc()));
    }

    if let Some(uid) = args.account_uid {
        force_accounting(&fs, &CgroupPaths::new(CgroupPaths::DEFAULT_BASE), uid);
    }

    let (sync_enabled, db_url, sync_group, stale_after) = sync_config;
    if sync_enabled {
        let mut store = PostgresStatusStore::new(db_url);
        if let Err(e) = store.try_connect() {
            warn!("status store unreachable at startup, will retry: {e}");
        }
        info!("Status store sync: enabled (group '{sync_group}', host '{hostname}')");
        arbiter = arbiter.with_synchronizer(Synchronizer::new(
            Box::new(store),
            hostname.clone(),
            sync_group,
            stale_after,
        ));
        arbiter.bootstrap(Utc::now().timestamp());
    } else {
        debug!("Status store sync: disabled");
    }

    // Setup graceful shutdown.
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("Failed to set signal handler: {e}");
    }

    let exit_file_baseline = args.exit_file.as_deref().and_then(mtime);

    info!("Starting control loop ({}ms per sub-sample)", sub_interval.as_millis());

    let origin = Instant::now();
    let mut next_fire = Instant::now();
    let mut tick_count: u64 = 0;
    let mut shutdown_code: Option<i32> = None;

    loop {
        let now = Instant::now();
        if now < next_fire {
            sleep_until(next_fire, &running);
        } else if now > next_fire + sub_interval {
            warn!(
                "sub-sample running {}ms late, firing immediately",
                (now - next_fire).as_millis()
            );
        }
        next_fire += sub_interval;

        if !running.load(Ordering::SeqCst) && shutdown_code.is_none() {
            shutdown_code = Some(0);
        }
        if let (Some(path), None) = (args.exit_file.as_deref(), shutdown_code) {
            if mtime(path) > exit_file_baseline {
                info!("Exit file touched, restarting after this tick");
                shutdown_code = Some(EXIT_RESTART);
            }
        }

        let now_wall = Utc::now().timestamp();
        let now_mono = origin.elapsed().as_secs_f64();
        if let Some(summary) = arbiter.sub_sample(now_wall, now_mono) {
            tick_count += 1;
            info!(
                "Tick #{}: {} users tracked, {} penalized, {} transitions{}",
                tick_count,
                summary.users,
                summary.penalized,
                summary.transitions,
                if summary.peer_hosts.is_empty() {
                    String::new()
                } else {
                    format!(", peers: {}", summary.peer_hosts.join(","))
                }
            );
            // The tick is the atomicity unit: only stop at its boundary.
            if shutdown_code.is_some() {
                break;
            }
        }
    }

    info!("Shutting down...");
    arbiter.final_flush(Utc::now().timestamp());
    info!("Shutdown complete");

    if let Some(code) = shutdown_code.filter(|&c| c != 0) {
        std::process::exit(code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_full_surface() {
        let args = Args::parse_from([
            "arbiterd",
            "--config",
            "/etc/arbiter/base.yaml",
            "--config",
            "/etc/arbiter/site.yaml",
            "--etc",
            "/etc/arbiter/hooks",
            "--sudo",
            "--account-uid",
            "979",
            "--exit-file",
            "/run/arbiter/exit",
            "-vv",
        ]);
        assert_eq!(args.config.len(), 2);
        assert_eq!(args.account_uid, Some(979));
        assert!(args.sudo);
        assert_eq!(args.verbose, 2);
        assert!(!args.quiet);
        assert_eq!(args.exit_file.as_deref(), Some(Path::new("/run/arbiter/exit")));
    }

    #[test]
    fn test_cli_requires_config() {
        assert!(Args::try_parse_from(["arbiterd"]).is_err());
    }

    #[test]
    fn test_exit_file_mtime_comparison() {
        // A file that appears after startup compares greater than the
        // missing-file baseline.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exit");
        let baseline = mtime(&path);
        assert!(baseline.is_none());

        std::fs::write(&path, "x").unwrap();
        assert!(mtime(&path) > baseline);
    }
}
