//! Configuration of the driver, read from a .toml file
//!
//! Missing fields fall back to their defaults, so a config
//! file only needs to hold what differs from them.

use std::fmt;
use std::fs::File;
use std::io::{Read,
              Write};
use std::time::Duration;

use serde::{Deserialize,
            Serialize};

use crate::errors::SettingsError;
use crate::handshake::{RetryPolicy,
                       DEFAULT_MAX_ATTEMPTS};
use crate::memory::DEV_MEM;
use crate::params::Param;
use crate::registers::WINDOW_LEN;

/// Initial acquisition configuration which
/// is applied when the driver starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionSettings {
  /// 0 continuous storage, otherwise trigger matching
  pub acquisition_mode    : u32,
  /// 0 pair, 1 trailing, 2 leading, 3 both
  pub edge_detect_mode    : u32,
  pub enable_pattern      : u32,
  /// in units of 25ns
  pub window_width        : u32,
  /// in units of 25ns, two's complement
  pub window_offset       : u32,
  pub extra_search_margin : Option<u32>,
  pub reject_margin       : Option<u32>,
}

impl AcquisitionSettings {
  pub fn new() -> Self {
    Self {
      acquisition_mode    : 1,
      edge_detect_mode    : 2,
      enable_pattern      : 0xFFFF,
      window_width        : 0x14,
      window_offset       : 0xFFD8,
      extra_search_margin : None,
      reject_margin       : None,
    }
  }

  /// The settings as parameter values, in the order
  /// in which they should be applied
  pub fn as_params(&self) -> Vec<(Param, u32)> {
    let mut params = vec![(Param::AcquisitionMode, self.acquisition_mode),
                          (Param::EdgeDetectMode,  self.edge_detect_mode),
                          (Param::EnablePattern,   self.enable_pattern),
                          (Param::WindowWidth,     self.window_width),
                          (Param::WindowOffset,    self.window_offset)];
    if let Some(margin) = self.extra_search_margin {
      params.push((Param::ExtraSearchMargin, margin));
    }
    if let Some(margin) = self.reject_margin {
      params.push((Param::RejectMargin, margin));
    }
    params
  }
}

impl Default for AcquisitionSettings {
  fn default() -> Self {
    Self::new()
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct V1290Settings {
  /// device file through which the VME window is mapped
  pub addr_space             : String,
  /// physical address of the VME window of the board
  pub base_address           : u64,
  pub window_len             : usize,
  /// how often MICRO_HANDSHAKE is polled before
  /// a command is given up
  pub handshake_max_attempts : u32,
  pub handshake_interval_us  : u64,
  pub poll_interval_ms       : u64,
  /// issue a software clear when the driver starts
  pub clear_on_init          : bool,
  pub acquisition            : Option<AcquisitionSettings>,
}

impl V1290Settings {
  pub fn new() -> Self {
    Self {
      addr_space             : String::from(DEV_MEM),
      base_address           : 0x3213_0000,
      window_len             : WINDOW_LEN,
      handshake_max_attempts : DEFAULT_MAX_ATTEMPTS,
      handshake_interval_us  : 100,
      poll_interval_ms       : 500,
      clear_on_init          : true,
      acquisition            : None,
    }
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy::new(self.handshake_max_attempts,
                     Duration::from_micros(self.handshake_interval_us))
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.poll_interval_ms)
  }

  /// Write the settings to a toml file
  pub fn to_toml(&self, mut filename : String) -> Result<(), SettingsError> {
    if !filename.ends_with(".toml") {
      filename += ".toml";
    }
    info!("Will write to file {}!", filename);
    let toml_string = toml::to_string_pretty(&self)?;
    let mut file    = File::create(&filename)?;
    file.write_all(toml_string.as_bytes())?;
    debug!("Wrote settings to {}!", filename);
    Ok(())
  }

  pub fn from_toml(filename : String) -> Result<V1290Settings, SettingsError> {
    let mut file = match File::open(&filename) {
      Err(err) => {
        error!("Unable to open {}! {}", filename, err);
        return Err(SettingsError::Io(err));
      }
      Ok(f) => f
    };
    let mut toml_string = String::from("");
    file.read_to_string(&mut toml_string)?;
    match toml::from_str(&toml_string) {
      Err(err) => {
        error!("Can't interpret toml! {}", err);
        Err(SettingsError::TomlDecodingError(err))
      }
      Ok(settings) => Ok(settings)
    }
  }
}

impl Default for V1290Settings {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for V1290Settings {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let disp = match toml::to_string(self) {
      Err(err) => {
        error!("Serialization error! {err}");
        String::from("-- SERIALIZATION ERROR! --")
      }
      Ok(disp) => disp
    };
    write!(f, "<V1290Settings :\n{}>", disp)
  }
}
