//! XORs a byte range of a file on disk with a single-byte key

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use log::{debug, error, log_enabled, Level};

use selfpatch::cli::{parse_key, parse_offset, LogArgs};
use selfpatch::file::{checksum, xor_range, xor_range_atomic};

#[derive(Debug, Parser)]
#[command(name = "xorpatch", version, about = "XOR a byte range of a file in place")]
struct Cli {
    /// File to patch
    path: PathBuf,
    /// First byte of the range (decimal or 0x-prefixed)
    #[arg(value_parser = parse_offset)]
    start: u64,
    /// One past the last byte of the range (decimal or 0x-prefixed)
    #[arg(value_parser = parse_offset)]
    end: u64,
    /// Key; its first byte is XORed into every byte of the range
    #[arg(value_parser = parse_key)]
    key: u8,
    /// Patch a copy and rename it over the file, so a crash can't leave it half patched
    #[arg(long)]
    atomic: bool,
    #[command(flatten)]
    log: LogArgs,
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    if log_enabled!(Level::Debug) {
        debug!("checksum before: {:016x}", checksum(&cli.path)?);
    }

    let result = if cli.atomic {
        xor_range_atomic(&cli.path, cli.start, cli.end, cli.key)
    } else {
        xor_range(&cli.path, cli.start, cli.end, cli.key)
    };
    result.with_context(|| {
        format!(
            "failed to patch {} from offset {:#x} to {:#x}",
            cli.path.display(),
            cli.start,
            cli.end
        )
    })?;

    if log_enabled!(Level::Debug) {
        debug!("checksum after: {:016x}", checksum(&cli.path)?);
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = cli.log.init() {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
