//! CLI front-end over the `fatdefrag` library: argument parsing, verbosity,
//! mode dispatch, and exit-code mapping.
//!
//! The teacher ships only thin example binaries over its library
//! (`examples/ls.rs`, `examples/cat.rs`); this follows the same shape —
//! all of the real logic lives in the library, the binary just wires up
//! `clap` and maps errors to the process exit status.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};

use fatdefrag::error_injector::{self, DefectKind};
use fatdefrag::{fragmentator, relocator, report, FatError, Volume};

#[derive(Parser)]
#[command(name = "fatdefrag", version, about = "Crash-safe FAT12/16/32 volume defragmenter")]
struct Cli {
    /// Increase logging verbosity (-v: debug, -vv: trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to the FAT volume image.
    image: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Report volume geometry, free clusters, and fragmentation state.
    Info,
    /// Relocate every file to a contiguous run of clusters.
    Defrag,
    /// Deliberately fragment files, as a test fixture for Defrag.
    Frag {
        #[arg(long, default_value_t = 1)]
        seed: u32,
    },
    /// Inject one structural defect, as a test fixture for recovery tools.
    Error {
        #[arg(long, value_enum)]
        kind: ErrorKindArg,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum ErrorKindArg {
    BrokenChain,
    LostCluster,
    CrossLinked,
    BadDirEntry,
}

impl From<ErrorKindArg> for DefectKind {
    fn from(arg: ErrorKindArg) -> Self {
        match arg {
            ErrorKindArg::BrokenChain => DefectKind::BrokenChain,
            ErrorKindArg::LostCluster => DefectKind::LostCluster,
            ErrorKindArg::CrossLinked => DefectKind::CrossLinkedChain,
            ErrorKindArg::BadDirEntry => DefectKind::BadDirEntry,
        }
    }
}

fn init_logger(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

/// Exit codes per the external-interface contract: 0 success, 1 user error,
/// 2 corrupt image / manual intervention required, 3 I/O error.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<FatError>() {
        Some(FatError::Io(_)) => 3,
        Some(FatError::CorruptChain { .. }) | Some(FatError::CorruptJournal { .. }) => 2,
        Some(FatError::Format(_)) | Some(FatError::NoSpace { .. }) | Some(FatError::Busy) => 1,
        None => 1,
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut volume = Volume::open(&cli.image)
        .with_context(|| format!("failed to open {:?}", cli.image))?;

    let result = (|| -> anyhow::Result<()> {
        match cli.command {
            Command::Info => {
                let text = report::render_info(&mut volume).context("failed to read volume state")?;
                print!("{text}");
            }
            Command::Defrag => {
                let r = relocator::defragment(&mut volume).context("defrag pass failed")?;
                print!("{}", report::render_relocation_report(&r));
            }
            Command::Frag { seed } => {
                let r = fragmentator::fragment(&mut volume, seed).context("fragmentation pass failed")?;
                println!("{}", report::render_fragmentation_report(&r));
            }
            Command::Error { kind } => {
                error_injector::inject(&mut volume, kind.into()).context("error injection failed")?;
                println!("injected defect into {:?}", cli.image);
            }
        }
        Ok(())
    })();

    volume.close().context("failed to close volume cleanly")?;
    result
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}
