//! Argument parsing shared by the command line tools

use std::path::PathBuf;

use clap::Args;

use crate::logging;

/// Logging flags accepted by every tool
#[derive(Debug, Args)]
pub struct LogArgs {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
    /// Also write the log to this file
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,
}

impl LogArgs {
    /// Installs the logger these flags describe
    pub fn init(&self) -> Result<(), fern::InitError> {
        logging::setup_logging(
            logging::level_from_verbosity(self.verbose),
            self.log_file.as_deref(),
        )
    }
}

/// Parses a byte offset written in decimal or as `0x`-prefixed hex
pub fn parse_offset(arg: &str) -> Result<u64, String> {
    let parsed = match arg.strip_prefix("0x").or_else(|| arg.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => arg.parse(),
    };
    parsed.map_err(|e| format!("`{arg}` is not a decimal or 0x-prefixed offset: {e}"))
}

/// Takes the first byte of `arg` as an XOR key
pub fn parse_key(arg: &str) -> Result<u8, String> {
    arg.bytes()
        .next()
        .ok_or_else(|| "the key needs at least one character".to_owned())
}

/// Maps a function's return value onto a process exit status, saturating anything outside `0..=255`
pub fn exit_status(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(u8::MAX)
}

#[cfg(test)]
mod tests {
    use crate::cli::{exit_status, parse_key, parse_offset};

    #[test]
    /// Offsets parse as decimal or 0x-prefixed hex and bad input names itself in the error
    fn test_parse_offset() {
        assert_eq!(parse_offset("10"), Ok(10));
        assert_eq!(parse_offset("0x1F"), Ok(0x1F));
        assert_eq!(parse_offset("0XfF"), Ok(0xFF));
        assert_eq!(parse_offset("0"), Ok(0));
        assert!(parse_offset("").is_err());
        assert!(parse_offset("0x").is_err());
        assert!(parse_offset("-1").is_err());
        assert!(parse_offset("12abc").unwrap_err().contains("12abc"));
    }

    #[test]
    /// The key is the first byte of the argument
    fn test_parse_key() {
        assert_eq!(parse_key("k"), Ok(b'k'));
        assert_eq!(parse_key("key"), Ok(b'k'));
        assert!(parse_key("").is_err());
    }

    #[test]
    /// Return values that don't fit an exit status become 255 instead of wrapping to success
    fn test_exit_status() {
        assert_eq!(exit_status(0), 0);
        assert_eq!(exit_status(42), 42);
        assert_eq!(exit_status(255), 255);
        assert_eq!(exit_status(256), u8::MAX);
        assert_eq!(exit_status(-1), u8::MAX);
    }
}
