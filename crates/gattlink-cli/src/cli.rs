//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand, ValueEnum};
use gattlink_core::types::uuid_from_u16;
use gattlink_core::ConnectionPriority;
use uuid::Uuid;

use crate::error::{CliError, Result};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List nearby peripherals
    Scan {
        /// Scan duration in seconds (defaults to the configured duration)
        #[arg(short, long)]
        duration: Option<u64>,
    },
    /// Discover and print the services of a peripheral
    Services {
        address: String,
        /// Print the service tree as JSON
        #[arg(long)]
        json: bool,
    },
    /// Read a characteristic
    Read {
        address: String,
        #[arg(value_parser = parse_uuid)]
        characteristic: Uuid,
    },
    /// Write a characteristic in a single request
    Write {
        address: String,
        #[arg(value_parser = parse_uuid)]
        characteristic: Uuid,
        /// Value as hex, e.g. 0a0b0c
        #[arg(value_parser = parse_hex)]
        value: HexBytes,
    },
    /// Write a value longer than one packet in batches
    LongWrite {
        address: String,
        #[arg(value_parser = parse_uuid)]
        characteristic: Uuid,
        /// Value as hex
        #[arg(value_parser = parse_hex)]
        value: HexBytes,
        /// Bytes per batch (defaults to MTU minus the write header)
        #[arg(short, long)]
        batch_size: Option<usize>,
        /// How often a failed batch is retried
        #[arg(short, long)]
        retries: Option<u32>,
    },
    /// Print notifications or indications until interrupted
    Notify {
        address: String,
        #[arg(value_parser = parse_uuid)]
        characteristic: Uuid,
        /// Subscribe to indications instead of notifications
        #[arg(short, long)]
        indicate: bool,
        /// Stop after this many values
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },
    /// Read the signal strength of a connected peripheral
    Rssi { address: String },
    /// Negotiate the MTU
    Mtu {
        address: String,
        #[arg(default_value_t = 247)]
        mtu: u16,
    },
    /// Request a connection priority
    Priority {
        address: String,
        #[arg(value_enum)]
        priority: PriorityArg,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PriorityArg {
    Balanced,
    High,
    LowPower,
}

impl From<PriorityArg> for ConnectionPriority {
    fn from(priority: PriorityArg) -> Self {
        match priority {
            PriorityArg::Balanced => ConnectionPriority::Balanced,
            PriorityArg::High => ConnectionPriority::High,
            PriorityArg::LowPower => ConnectionPriority::LowPower,
        }
    }
}

/// Raw bytes given as hex on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexBytes(pub Vec<u8>);

// ----------------------------------------------------------------------------
// Argument Parsers
// ----------------------------------------------------------------------------

/// Full UUID, or a 16-bit SIG short form such as `2a37` or `0x2a37`
pub fn parse_uuid(input: &str) -> Result<Uuid> {
    let trimmed = input.trim_start_matches("0x");
    if trimmed.len() == 4 {
        let short = u16::from_str_radix(trimmed, 16)
            .map_err(|_| CliError::InvalidArgument(format!("not a short UUID: {input}")))?;
        return Ok(uuid_from_u16(short));
    }
    Ok(Uuid::parse_str(input)?)
}

/// Hex bytes, optionally `0x`-prefixed and separated by `:` or spaces
pub fn parse_hex(input: &str) -> Result<HexBytes> {
    let cleaned: String = input
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !matches!(c, ':' | ' '))
        .collect();
    Ok(HexBytes(hex::decode(cleaned)?))
}
