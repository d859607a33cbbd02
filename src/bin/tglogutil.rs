//! `tglogutil`: inspect, repair, and offline-compact a log directory.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use limestone::catalog::Catalog;
use limestone::config::DatastoreConfig;
use limestone::datastore::Datastore;
use limestone::manifest;
use limestone::parser::{self, ParseErrorCode, RepairPolicy, ScanMode};

#[derive(Parser)]
#[command(name = "tglogutil", about = "Inspect, repair, and compact a limestone log directory")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Dry-run scan reporting status; never mutates the directory.
    Inspect {
        directory: PathBuf,
        #[arg(long)]
        epoch: Option<u64>,
        #[arg(long, default_value_t = 1)]
        thread_num: usize,
        #[arg(short, long)]
        verbose: bool,
    },
    /// Rewrite the log directory to a consistent state.
    Repair {
        directory: PathBuf,
        #[arg(long)]
        cut: bool,
        #[arg(long)]
        epoch: Option<u64>,
        #[arg(short, long)]
        verbose: bool,
    },
    /// Offline build of a fresh compacted directory.
    Compaction {
        directory: PathBuf,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        working_dir: Option<PathBuf>,
        #[arg(long)]
        make_backup: bool,
        #[arg(long, default_value_t = 1)]
        thread_num: usize,
        #[arg(short, long)]
        verbose: bool,
    },
}

fn init_logging(verbose: bool) {
    let filter = if verbose { "debug" } else { "info" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .try_init();
}

fn wal_files_in(dir: &std::path::Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with("pwal_") && !name.contains(".compacted") {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

fn run_inspect(directory: PathBuf, epoch: Option<u64>, _thread_num: usize, verbose: bool) -> ExitCode {
    init_logging(verbose);
    let (_lock, _manifest, _rotate) = match manifest::open_directory(&directory) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("cannot check directory {directory:?}: {e}");
            return ExitCode::from(64);
        }
    };

    let catalog = Catalog::load_or_default(&directory).unwrap_or_default();
    let durable_epoch = epoch.unwrap_or(catalog.max_epoch_id);

    let files = match wal_files_in(&directory) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("cannot check directory {directory:?}: {e}");
            return ExitCode::from(64);
        }
    };

    let mut worst = ParseErrorCode::Ok;
    for path in &files {
        match parser::scan_file(path, durable_epoch, RepairPolicy::inspect(), ScanMode::Collect, |_| {}) {
            Ok(report) => {
                if let Some(code) = report.worst_code {
                    if code > worst {
                        worst = code;
                    }
                }
            }
            Err(_) => {
                worst = ParseErrorCode::Failed;
            }
        }
    }

    match worst {
        ParseErrorCode::Ok => {
            println!("status: OK");
            ExitCode::from(0)
        }
        ParseErrorCode::Repaired
        | ParseErrorCode::BrokenAfterToBeCut
        | ParseErrorCode::BrokenAfterMarked
        | ParseErrorCode::NondurableEntries => {
            println!("status: auto-repairable");
            ExitCode::from(1)
        }
        _ => {
            println!("status: unrepairable");
            ExitCode::from(2)
        }
    }
}

fn run_repair(directory: PathBuf, cut: bool, epoch: Option<u64>, verbose: bool) -> ExitCode {
    init_logging(verbose);
    let (_lock, _manifest, _rotate) = match manifest::open_directory(&directory) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("cannot check directory {directory:?}: {e}");
            return ExitCode::from(64);
        }
    };

    let catalog = Catalog::load_or_default(&directory).unwrap_or_default();
    let durable_epoch = epoch.unwrap_or(catalog.max_epoch_id);
    let policy = if cut { RepairPolicy::repair_cut() } else { RepairPolicy::repair_mark() };

    let files = match wal_files_in(&directory) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("cannot check directory {directory:?}: {e}");
            return ExitCode::from(64);
        }
    };

    let mut worst = ParseErrorCode::Ok;
    for path in &files {
        match parser::scan_file(path, durable_epoch, policy, ScanMode::Collect, |_| {}) {
            Ok(report) => {
                if let Some(code) = report.worst_code {
                    if code > worst {
                        worst = code;
                    }
                }
            }
            Err(_) => worst = ParseErrorCode::Failed,
        }
    }

    if worst >= ParseErrorCode::Unexpected {
        println!("status: unrepairable");
        ExitCode::from(16)
    } else {
        println!("status: repaired");
        ExitCode::from(0)
    }
}

fn run_compaction(
    directory: PathBuf,
    _force: bool,
    dry_run: bool,
    working_dir: Option<PathBuf>,
    _make_backup: bool,
    _thread_num: usize,
    verbose: bool,
) -> ExitCode {
    init_logging(verbose);
    let target_dir = working_dir.unwrap_or(directory);

    if dry_run {
        println!("dry run: would compact {target_dir:?}");
        return ExitCode::from(0);
    }

    let config = DatastoreConfig::new(target_dir.clone());
    let datastore = match Datastore::open(config).and_then(|d| d.ready()) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("cannot open {target_dir:?}: {e}");
            return ExitCode::from(64);
        }
    };

    match datastore.run_compaction_pass_now() {
        Ok(Some(report)) => {
            println!("compacted, keys_written={}", report.keys_written);
            ExitCode::from(0)
        }
        Ok(None) => {
            println!("nothing to compact");
            ExitCode::from(0)
        }
        Err(e) => {
            eprintln!("compaction failed: {e}");
            ExitCode::from(64)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Command::Inspect { directory, epoch, thread_num, verbose } => run_inspect(directory, epoch, thread_num, verbose),
        Command::Repair { directory, cut, epoch, verbose } => run_repair(directory, cut, epoch, verbose),
        Command::Compaction { directory, force, dry_run, working_dir, make_backup, thread_num, verbose } => {
            run_compaction(directory, force, dry_run, working_dir, make_backup, thread_num, verbose)
        }
    }
}
