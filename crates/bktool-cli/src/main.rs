//! bktool: encrypted directory backup and restore
//!
//! Commands:
//!   backup                  - encrypt the configured directories into a new backup
//!   restore <backup> <dir>  - decrypt a backup into <dir>/<source name>
//!   verify <backup>         - authenticate every file of a backup, write nothing
//!   info <backup>           - print a backup's metadata (no passphrase needed)
//!   config show             - display the active configuration

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::info;

use bktool_core::config::BktoolConfig;
use bktool_core::FailurePolicy;
use bktool_crypto::BackupMetadata;
use bktool_tree::{BackupPlan, ProgressFn, RestorePlan, RunOptions, RunReport};

/// Exit status of a run that completed with skipped entries
const EXIT_PARTIAL: u8 = 2;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "bktool",
    version,
    about = "Encrypted directory backups",
    long_about = "bktool: back up directory trees encrypted with a passphrase, restore and verify them"
)]
struct Cli {
    /// Path to the configuration file (TOML, or JSON by extension)
    #[arg(
        long,
        short = 'c',
        env = "BKTOOL_CONFIG",
        default_value = "~/.config/bktool/config.toml"
    )]
    config: PathBuf,

    /// Backup passphrase (prompted for when unset)
    #[arg(long, env = "BKTOOL_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, env = "BKTOOL_LOG")]
    log: Option<String>,

    /// Log format; overrides the config file
    #[arg(long, env = "BKTOOL_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encrypt the configured directories into a new backup
    Backup {
        /// Root under which the backup is written (overrides config)
        #[arg(long)]
        dest: Option<PathBuf>,
        /// Write directly into the destination instead of backup-<timestamp>
        #[arg(long)]
        no_timestamp: bool,
        /// Directories to back up (override config)
        dirs: Vec<PathBuf>,
        #[command(flatten)]
        run: RunArgs,
    },

    /// Decrypt a backup into a target directory
    Restore {
        /// Backup root (the directory holding bktool-backup.info)
        backup: PathBuf,
        /// Each source is restored to <target>/<name>
        target: PathBuf,
        #[command(flatten)]
        run: RunArgs,
    },

    /// Authenticate every file of a backup without writing anything
    Verify {
        backup: PathBuf,
        #[command(flatten)]
        run: RunArgs,
    },

    /// Print a backup's metadata
    Info { backup: PathBuf },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

/// Per-run overrides of the `[run]` config section
#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Stop at the first failing entry instead of skipping it
    #[arg(long)]
    fail_fast: bool,
    /// Do not copy uid/gid onto replicated entries
    #[arg(long)]
    no_ownership: bool,
    /// Worker threads across top-level sources (0 = one per CPU)
    #[arg(long, short = 'j')]
    workers: Option<usize>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let config = load_config(&config_path)?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = match cli.log_format {
        Some(format) => format,
        None if config.log.format.eq_ignore_ascii_case("json") => LogFormat::Json,
        None => LogFormat::Text,
    };
    init_logging(&level, format);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "bktool starting"
    );

    match cli.command {
        Commands::Backup { dest, no_timestamp, dirs, run } => {
            let pass = read_passphrase(cli.passphrase, true)?;
            cmd_backup(&config, dest.as_deref(), no_timestamp, dirs, &run, &pass)
        }
        Commands::Restore { backup, target, run } => {
            let pass = read_passphrase(cli.passphrase, false)?;
            cmd_restore(&config, &backup, &target, &run, &pass)
        }
        Commands::Verify { backup, run } => {
            let pass = read_passphrase(cli.passphrase, false)?;
            cmd_verify(&config, &backup, &run, &pass)
        }
        Commands::Info { backup } => cmd_info(&backup).map(|_| ExitCode::SUCCESS),
        Commands::Config { action: ConfigAction::Show } => {
            cmd_config_show(&config, &config_path).map(|_| ExitCode::SUCCESS)
        }
    }
}

fn load_config(path: &Path) -> Result<BktoolConfig> {
    if path.exists() {
        BktoolConfig::load(path).with_context(|| format!("loading config: {}", path.display()))
    } else {
        Ok(BktoolConfig::default())
    }
}

fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout carries the run summary; logs go to stderr
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

/// Flag or environment value first, then an interactive prompt.
fn read_passphrase(given: Option<String>, confirm: bool) -> Result<SecretString> {
    if let Some(pass) = given {
        if pass.is_empty() {
            anyhow::bail!("passphrase must not be empty");
        }
        return Ok(SecretString::from(pass));
    }

    let pass = rpassword::prompt_password("Passphrase: ").context("reading passphrase")?;
    if pass.is_empty() {
        anyhow::bail!("passphrase must not be empty");
    }
    if confirm {
        let again =
            rpassword::prompt_password("Confirm passphrase: ").context("reading passphrase")?;
        if again != pass {
            anyhow::bail!("passphrases do not match");
        }
    }
    Ok(SecretString::from(pass))
}

/// Expand a leading `~` to the user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if s == "~" {
        PathBuf::from(std::env::var("HOME").unwrap_or_default())
    } else if let Some(rest) = s.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_default();
        PathBuf::from(format!("{}/{}", home, rest))
    } else {
        path.to_path_buf()
    }
}

fn run_options(config: &BktoolConfig, args: &RunArgs) -> RunOptions {
    let mut options = RunOptions::from_config(config);
    if args.fail_fast {
        options.policy = FailurePolicy::FailFast;
    }
    if args.no_ownership {
        options.preserve_ownership = false;
    }
    if let Some(workers) = args.workers {
        options.workers = workers;
    }
    options
}

// ── Progress display ──────────────────────────────────────────────────────────

fn make_spinner(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{prefix:.bold} {spinner} {bytes} {wide_msg}")
    {
        pb.set_style(style);
    }
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// Engine progress callback feeding a spinner: bytes so far plus the last file.
fn progress_for(pb: &ProgressBar) -> ProgressFn {
    let pb = pb.clone();
    Box::new(move |path: &Path, bytes: u64| {
        pb.inc(bytes);
        pb.set_message(path.display().to_string());
    })
}

// ── `bktool backup` ───────────────────────────────────────────────────────────

fn cmd_backup(
    config: &BktoolConfig,
    dest: Option<&Path>,
    no_timestamp: bool,
    dirs: Vec<PathBuf>,
    run: &RunArgs,
    pass: &SecretString,
) -> Result<ExitCode> {
    let mut plan = BackupPlan::from_config(config);
    if !dirs.is_empty() {
        plan.sources = dirs;
    }
    plan.sources = plan.sources.iter().map(|p| expand_tilde(p)).collect();
    plan.destination = expand_tilde(dest.unwrap_or(plan.destination.as_path()));
    plan.timestamped = plan.timestamped && !no_timestamp;
    plan.options = run_options(config, run);

    println!(
        "Backing up {} director{} → {}",
        plan.sources.len(),
        if plan.sources.len() == 1 { "y" } else { "ies" },
        plan.destination.display()
    );

    let pb = make_spinner("backup");
    let progress = progress_for(&pb);
    let result = bktool_tree::backup(&plan, pass, Some(&progress));
    pb.finish_and_clear();

    let report = result.context("backup failed")?;
    Ok(print_summary("Backup", &report))
}

// ── `bktool restore` ──────────────────────────────────────────────────────────

fn cmd_restore(
    config: &BktoolConfig,
    backup: &Path,
    target: &Path,
    run: &RunArgs,
    pass: &SecretString,
) -> Result<ExitCode> {
    let plan = RestorePlan {
        backup_root: expand_tilde(backup),
        target: expand_tilde(target),
        options: run_options(config, run),
    };
    println!(
        "Restoring {} → {}",
        plan.backup_root.display(),
        plan.target.display()
    );

    let pb = make_spinner("restore");
    let progress = progress_for(&pb);
    let result = bktool_tree::restore(&plan, pass, Some(&progress));
    pb.finish_and_clear();

    let report = result.context("restore failed")?;
    Ok(print_summary("Restore", &report))
}

// ── `bktool verify` ───────────────────────────────────────────────────────────

fn cmd_verify(
    config: &BktoolConfig,
    backup: &Path,
    run: &RunArgs,
    pass: &SecretString,
) -> Result<ExitCode> {
    let root = expand_tilde(backup);
    let options = run_options(config, run);

    let pb = make_spinner("verify");
    let progress = progress_for(&pb);
    let result = bktool_tree::verify(&root, pass, &options, Some(&progress));
    pb.finish_and_clear();

    let report = result.context("verify failed")?;
    Ok(print_summary("Verify", &report))
}

// ── `bktool info` ─────────────────────────────────────────────────────────────

fn cmd_info(backup: &Path) -> Result<()> {
    let root = expand_tilde(backup);
    let meta = BackupMetadata::read(&root)
        .with_context(|| format!("reading backup metadata in {}", root.display()))?;
    let salt_len = meta.salt().map(|s| s.len()).unwrap_or(0);

    println!("Backup:     {}", root.display());
    println!("Created:    {}", meta.created_at);
    println!("Version:    {}", meta.version);
    println!(
        "KDF:        {} (m={} KiB, t={}, p={}, salt {} bytes)",
        meta.kdf.algorithm,
        meta.kdf.params.mem_cost_kib,
        meta.kdf.params.time_cost,
        meta.kdf.params.parallelism,
        salt_len
    );
    println!(
        "Cipher:     {} (chunk {})",
        meta.cipher.algorithm,
        fmt_bytes(u64::from(meta.cipher.chunk_size))
    );
    if meta.sources.is_empty() {
        println!("Sources:    (not recorded)");
    } else {
        println!("Sources:");
        for name in &meta.sources {
            let state = if root.join(name).is_dir() { "" } else { "  (missing)" };
            println!("  {name}{state}");
        }
    }
    Ok(())
}

// ── `bktool config show` ──────────────────────────────────────────────────────

fn cmd_config_show(config: &BktoolConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

// ── Reporting ─────────────────────────────────────────────────────────────────

/// Print run statistics and every failure; the exit code reflects partial runs.
fn print_summary(op: &str, report: &RunReport) -> ExitCode {
    for (source, err) in report.failed_sources() {
        eprintln!("  FAILED  {} [{}]: {err}", source.source.display(), err.kind());
    }
    for failure in report.failures() {
        eprintln!(
            "  SKIPPED {} [{}]: {}",
            failure.path.display(),
            failure.kind,
            failure.message
        );
    }

    println!();
    println!("{op} complete: {}", report.root.display());
    println!("  sources: {}", report.sources.len());
    println!("  files:   {}", report.files());
    println!("  read:    {}", fmt_bytes(report.bytes()));
    println!("  time:    {}", fmt_duration(report.elapsed));
    println!("  speed:   {}/s", fmt_bytes(report.throughput() as u64));

    if report.is_partial() {
        let skipped = report.failures().count() + report.failed_sources().count();
        println!("  partial: {skipped} entr{} failed", if skipped == 1 { "y" } else { "ies" });
        ExitCode::from(EXIT_PARTIAL)
    } else {
        ExitCode::SUCCESS
    }
}

/// Binary-unit size, e.g. `5.0 KiB`
fn fmt_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT && exp < 5 {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let prefix = ['K', 'M', 'G', 'T', 'P', 'E'][exp];
    format!("{:.1} {prefix}iB", bytes as f64 / div as f64)
}

/// Elapsed time truncated to 10ms
fn fmt_duration(elapsed: Duration) -> String {
    let centis = elapsed.as_millis() / 10;
    if centis < 100 {
        format!("{}ms", centis * 10)
    } else {
        format!("{}.{:02}s", centis / 100, centis % 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_backup_flags() {
        let cli = Cli::try_parse_from([
            "bktool",
            "--passphrase",
            "pw",
            "backup",
            "--dest",
            "/mnt/b",
            "--no-timestamp",
            "-j",
            "4",
            "--fail-fast",
            "/data/a",
        ])
        .unwrap();
        assert_eq!(cli.passphrase.as_deref(), Some("pw"));
        match cli.command {
            Commands::Backup { dest, no_timestamp, dirs, run } => {
                assert_eq!(dest, Some(PathBuf::from("/mnt/b")));
                assert!(no_timestamp);
                assert_eq!(dirs, vec![PathBuf::from("/data/a")]);
                assert_eq!(run.workers, Some(4));
                assert!(run.fail_fast);
            }
            other => panic!("expected backup, got {other:?}"),
        }
    }

    #[test]
    fn test_run_options_override_config() {
        let config = BktoolConfig::default();
        let options = run_options(
            &config,
            &RunArgs {
                fail_fast: true,
                no_ownership: true,
                workers: Some(0),
            },
        );
        assert_eq!(options.policy, FailurePolicy::FailFast);
        assert!(!options.preserve_ownership);
        assert_eq!(options.workers, 0);

        let options = run_options(&config, &RunArgs::default());
        assert_eq!(options.policy, FailurePolicy::BestEffort);
        assert_eq!(options.workers, 1);
    }

    #[test]
    fn test_fmt_bytes() {
        assert_eq!(fmt_bytes(0), "0 B");
        assert_eq!(fmt_bytes(1023), "1023 B");
        assert_eq!(fmt_bytes(1024), "1.0 KiB");
        assert_eq!(fmt_bytes(5011), "4.9 KiB");
        assert_eq!(fmt_bytes(3 * 1024 * 1024 / 2), "1.5 MiB");
        assert_eq!(fmt_bytes(1 << 30), "1.0 GiB");
    }

    #[test]
    fn test_fmt_duration() {
        assert_eq!(fmt_duration(Duration::from_millis(457)), "450ms");
        assert_eq!(fmt_duration(Duration::from_millis(1234)), "1.23s");
        assert_eq!(fmt_duration(Duration::from_secs(61)), "61.00s");
    }

    #[test]
    fn test_expand_tilde() {
        let home = std::env::var("HOME").unwrap_or_default();
        assert_eq!(expand_tilde(Path::new("~")), PathBuf::from(&home));
        assert_eq!(
            expand_tilde(Path::new("~/backups")),
            PathBuf::from(format!("{home}/backups"))
        );
        assert_eq!(expand_tilde(Path::new("/abs/path")), PathBuf::from("/abs/path"));
    }
}
