//! # Register level control of the CAEN V1290 TDC
//!
//! The V1290 exposes its configuration through an embedded
//! microcontroller. Opcodes and their operands are written one
//! word at a time to the MICRO register, while the MICRO_HANDSHAKE
//! register tells if the micro is ready to take the next word
//! (WRITE_OK) or has a reply waiting (READ_OK).
//!
//! The crate is layered as follows
//!
//! * `registers`  - the register map and the opcode table
//! * `memory`     - mapping of the VME window and bus width
//!                  correct volatile access
//! * `handshake`  - the microcontroller handshake protocol
//! * `params`     - logical parameters and how to access them
//! * `device`     - the device handle, which owns the bus lock
//! * `monitoring` - the status poller
//! * `sink`       - publishing parameter values to the outside
//! * `commands`   - the command line interface of v1290-drv
//!
//! The `sim` module provides an in-memory model of the board, which
//! is used for the tests and the `--simulate` mode of `v1290-drv`.

pub mod errors;
pub mod registers;
pub mod memory;
pub mod handshake;
pub mod params;
pub mod sink;
pub mod device;
pub mod monitoring;
pub mod settings;
pub mod thread_control;
pub mod sim;
pub mod commands;

#[macro_use] extern crate log;

use std::io::Write;

use colored::{Colorize, ColoredString};
use log::Level;

pub use errors::{RegisterError,
                 SettingsError};
pub use device::V1290;
pub use params::Param;
pub use settings::V1290Settings;
pub use thread_control::ThreadControl;

/// Make sure that the loglevel is in color
pub fn color_log(level : &Level) -> ColoredString {
  match level {
    Level::Error    => String::from(" ERROR!").red(),
    Level::Warn     => String::from(" WARN  ").yellow(),
    Level::Info     => String::from(" Info  ").green(),
    Level::Debug    => String::from(" debug ").blue(),
    Level::Trace    => String::from(" trace ").cyan(),
  }
}

/// Set up the environmental (env) logger
/// with our format
///
/// Ensure that a timestamp, the lines and module paths
/// are printed in the logging output. Register traffic
/// is logged at trace level, so RUST_LOG=trace shows
/// every single bus transaction.
pub fn init_env_logger() {
  env_logger::builder()
    .format(|buf, record| {
    writeln!( buf, "[{time}][{level}][{module_path}:{line}] {args}",
      time  = chrono::Local::now().format("%H:%M:%S%.3f"),
      level = color_log(&record.level()),
      module_path = record.module_path().unwrap_or("<unknown>"),
      line = record.line().unwrap_or(0),
      args = record.args()
      )
    }).init();
}
