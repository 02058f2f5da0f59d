//! Errors which can occur when talking to the board
//! or when loading settings.

use std::error::Error;
use std::fmt;

/// Which part of a microcontroller sequence
/// ran out of attempts
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HandshakeLeg {
  /// waiting for WRITE_OK before the opcode
  Opcode,
  /// waiting for WRITE_OK before an operand word
  Operand,
  /// waiting for READ_OK before a reply word
  Reply,
}

impl fmt::Display for HandshakeLeg {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let repr = match self {
      HandshakeLeg::Opcode  => "opcode",
      HandshakeLeg::Operand => "operand",
      HandshakeLeg::Reply   => "reply",
    };
    write!(f, "{}", repr)
  }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RegisterError {
  /// The VME window could not be mapped.
  /// Fatal, the driver can not be constructed.
  MappingFailure,
  /// A single bus transaction failed
  BusFault { offset : u32 },
  /// A handshake wait exhausted its attempts
  Timeout { opcode : u16, leg : HandshakeLeg },
  /// The parameter has no get (or set)
  /// or the register can not be accessed
  /// in the requested direction
  InvalidParameter,
  /// The value does not fit into the
  /// parameter's width
  ValueOutOfRange { value : u32, width : u32 },
}

impl fmt::Display for RegisterError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let etype = match self {
      RegisterError::MappingFailure => {
        String::from("MappingFailure")
      },
      RegisterError::BusFault { offset } => {
        format!("BusFault at offset {:#06x}", offset)
      },
      RegisterError::Timeout { opcode, leg } => {
        format!("Timeout waiting for {} of opcode {:#06x}", leg, opcode)
      },
      RegisterError::InvalidParameter => {
        String::from("InvalidParameter")
      },
      RegisterError::ValueOutOfRange { value, width } => {
        format!("ValueOutOfRange, {:#x} does not fit into {} bits", value, width)
      }
    };
    write!(f, "<RegisterError: {}>", etype)
  }
}

impl Error for RegisterError {
}

#[derive(Debug)]
pub enum SettingsError {
  Io(std::io::Error),
  TomlDecodingError(toml::de::Error),
  TomlEncodingError(toml::ser::Error),
}

impl fmt::Display for SettingsError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      SettingsError::Io(err)                => write!(f, "<SettingsError: Io {}>", err),
      SettingsError::TomlDecodingError(err) => write!(f, "<SettingsError: TomlDecodingError {}>", err),
      SettingsError::TomlEncodingError(err) => write!(f, "<SettingsError: TomlEncodingError {}>", err),
    }
  }
}

impl Error for SettingsError {
  fn source(&self) -> Option<&(dyn Error + 'static)> {
    match self {
      SettingsError::Io(err)                => Some(err),
      SettingsError::TomlDecodingError(err) => Some(err),
      SettingsError::TomlEncodingError(err) => Some(err),
    }
  }
}

impl From<std::io::Error> for SettingsError {
  fn from(err : std::io::Error) -> Self {
    SettingsError::Io(err)
  }
}

impl From<toml::de::Error> for SettingsError {
  fn from(err : toml::de::Error) -> Self {
    SettingsError::TomlDecodingError(err)
  }
}

impl From<toml::ser::Error> for SettingsError {
  fn from(err : toml::ser::Error) -> Self {
    SettingsError::TomlEncodingError(err)
  }
}
