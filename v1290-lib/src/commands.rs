//! Command line commands of v1290-drv

use std::num::ParseIntError;

use clap::{Args,
           Subcommand};

use crate::params::Param;

/// Parse a number, either decimal or hex with a 0x prefix
pub fn parse_u32(s : &str) -> Result<u32, ParseIntError> {
  let s = s.trim();
  match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
    Some(hex) => u32::from_str_radix(&hex.replace('_', ""), 16),
    None      => s.replace('_', "").parse::<u32>(),
  }
}

pub fn parse_u64(s : &str) -> Result<u64, ParseIntError> {
  let s = s.trim();
  match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
    Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
    None      => s.replace('_', "").parse::<u64>(),
  }
}

#[derive(Debug, Subcommand, PartialEq)]
pub enum DrvCommand {
  /// Watch the board status and publish all changes until
  /// Ctrl+C is pressed
  Run(RunCmd),
  /// Read a parameter from the board
  Get(GetCmd),
  /// Write a parameter to the board
  Set(SetCmd),
  /// Read every readable parameter
  Dump,
  /// Write the current settings to a .toml file
  WriteConfig(WriteConfigCmd),
}

#[derive(Debug, Args, PartialEq)]
pub struct RunCmd {
  /// Overwrite the status poll interval of the config file
  #[arg(long)]
  pub poll_interval_ms : Option<u64>,
  /// Don't apply the [acquisition] section of the config file
  #[arg(long, default_value_t = false)]
  pub no_configure     : bool,
}

#[derive(Debug, Args, PartialEq)]
pub struct GetCmd {
  /// Parameter name, e.g. WINDOW_WIDTH (case does not matter)
  #[arg(required = true)]
  pub param : Param,
  /// Only show these bits (bit field parameters only)
  #[arg(long, value_parser = parse_u32)]
  pub mask  : Option<u32>,
}

#[derive(Debug, Args, PartialEq)]
pub struct SetCmd {
  /// Parameter name, e.g. ENABLE_PATTERN (case does not matter)
  #[arg(required = true)]
  pub param : Param,
  /// Value, decimal or hex with 0x prefix
  #[arg(required = true, value_parser = parse_u32)]
  pub value : u32,
  /// Only change these bits (bit field parameters only)
  #[arg(long, value_parser = parse_u32)]
  pub mask  : Option<u32>,
}

#[derive(Debug, Args, PartialEq)]
pub struct WriteConfigCmd {
  /// Output file, .toml will be appended if missing
  #[arg(required = true)]
  pub filename : String,
}
