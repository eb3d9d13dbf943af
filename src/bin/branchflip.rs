//! Flips the outcome of a constant branch by zeroing one byte of compiled code.
//!
//! `return 1 ? 1 : 0` is loaded into an executable page exactly as an unoptimizing compiler emits it, called,
//! patched, and called again. The exit status is the result of the second call.

use std::process::ExitCode;

use clap::Parser;
use log::error;

use selfpatch::cli::{exit_status, LogArgs};

#[derive(Debug, Parser)]
#[command(name = "branchflip", version, about = "Patch a constant branch in executable memory and run it")]
struct Cli {
    #[command(flatten)]
    log: LogArgs,
}

#[cfg(target_arch = "x86_64")]
fn run() -> anyhow::Result<i32> {
    use anyhow::Context;
    use log::info;

    use selfpatch::alloc::ExecutableBuffer;
    use selfpatch::code::x64::{BRANCH_IMMEDIATE, RETURN_ONE};
    use selfpatch::patcher::Transform;
    use selfpatch::session::patch;

    let buffer = ExecutableBuffer::new(&RETURN_ONE).context("failed to load the stub")?;
    // SAFETY: the buffer holds a complete C-ABI function taking nothing and returning an int
    let stub: extern "C" fn() -> i32 = unsafe { buffer.entry() };
    info!("before patching the stub returns {}", stub());

    // SAFETY: the stub isn't running, and the offset lands on the immediate of `mov eax, 1`
    unsafe { patch(buffer.as_ptr(), BRANCH_IMMEDIATE, &Transform::Overwrite(&[0])) }
        .context("refusing to call the stub, it could not be patched")?;

    let result = stub();
    info!("after patching the stub returns {}", result);
    Ok(result)
}

#[cfg(not(target_arch = "x86_64"))]
fn run() -> anyhow::Result<i32> {
    anyhow::bail!("the branch stub is only available on x86-64")
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = cli.log.init() {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    match run() {
        Ok(code) => ExitCode::from(exit_status(code)),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
