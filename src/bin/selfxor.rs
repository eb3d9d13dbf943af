//! Decodes one of its own functions in memory and then calls it.
//!
//! The binary is meant to be encoded after it is built: find the file offset of `selfxor_greet`
//! (it is exported unmangled, so `nm` or `objdump` will show it) and run
//! `xorpatch <binary> <offset> <offset + len> <key>`. Running `selfxor <key>` afterwards XORs the same bytes
//! back in memory before calling the function. Run with the wrong key, or without encoding first, and the call
//! will execute garbage.
//!
//! Where the function lands and how long it is depends on the compiler and its settings, so the window is
//! configured per build with `--offset`/`--len` or `SELFXOR_OFFSET`/`SELFXOR_LEN`.

use std::hint::black_box;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use log::{error, info};

use selfpatch::cli::{exit_status, parse_key, parse_offset, LogArgs};
use selfpatch::patcher::Transform;
use selfpatch::session::patch;

/// The function that gets decoded. It must stay out of line so there is exactly one copy of its code.
#[no_mangle]
#[inline(never)]
pub extern "C" fn selfxor_greet() -> i32 {
    println!("Hello, world!");
    0
}

#[derive(Debug, Parser)]
#[command(name = "selfxor", version, about = "XOR-decode a window of this binary's own code and run it")]
struct Cli {
    /// Key; its first byte is XORed into every byte of the window
    #[arg(value_parser = parse_key)]
    key: u8,
    /// Offset of the window from the start of `selfxor_greet`
    #[arg(long, env = "SELFXOR_OFFSET", default_value = "0", value_parser = parse_offset)]
    offset: u64,
    /// Number of bytes in the window, in decimal or 0x-prefixed hex
    #[arg(long, env = "SELFXOR_LEN", default_value = "23", value_parser = parse_offset)]
    len: u64,
    #[command(flatten)]
    log: LogArgs,
}

fn run(cli: &Cli) -> anyhow::Result<i32> {
    let function = selfxor_greet as *const u8;
    let offset = usize::try_from(cli.offset).context("offset does not fit in the address space")?;
    let len = usize::try_from(cli.len).context("length does not fit in the address space")?;
    info!(
        "decoding {} byte(s) of selfxor_greet at {:p}+{:#x}",
        len, function, offset
    );

    let transform = Transform::Xor { key: cli.key, len };
    // SAFETY: selfxor_greet hasn't been entered yet and nothing else runs on another thread
    unsafe { patch(function, offset, &transform) }
        .context("refusing to call selfxor_greet, its code could not be decoded")?;

    let greet = black_box(selfxor_greet as extern "C" fn() -> i32);
    Ok(greet())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = cli.log.init() {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    match run(&cli) {
        Ok(code) => ExitCode::from(exit_status(code)),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use crate::Cli;

    #[test]
    /// The window length takes the same hex notation as the offset
    fn test_hex_window() {
        let cli = Cli::try_parse_from(["selfxor", "k", "--offset", "0x10", "--len", "0x20"]).unwrap();
        assert_eq!(cli.key, b'k');
        assert_eq!(cli.offset, 0x10);
        assert_eq!(cli.len, 0x20);
    }
}
