//! Logical parameters of the board
//!
//! Each parameter is either backed by a direct register
//! or by a microcontroller opcode. How a parameter is
//! read and written is described once by a
//! `ParamDescriptor`, the table of descriptors is built
//! when the device handle is created and never changes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize,
            Serialize};

use crate::errors::RegisterError;
use crate::registers::*;

/// How a parameter is presented to the outside
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamKind {
  /// a plain number
  Int32,
  /// a bit field, can be accessed with a mask
  Digital,
}

impl fmt::Display for ParamKind {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let repr = match self {
      ParamKind::Int32   => "Int32",
      ParamKind::Digital => "Digital",
    };
    write!(f, "{}", repr)
  }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Param {
  /// 0 continuous storage, 1 trigger matching
  AcquisitionMode,
  /// 0 pair, 1 trailing, 2 leading, 3 both
  EdgeDetectMode,
  /// one bit per channel group
  EnablePattern,
  WindowWidth,
  WindowOffset,
  SoftwareClear,
  Status,
  Control,
  #[serde(rename = "TESTREG")]
  TestReg,
  ExtraSearchMargin,
  RejectMargin,
  FirmwareRev,
  MicroRev,
  EventCounter,
  EventStored,
  SoftwareTrigger,
  ModuleReset,
}

impl Param {
  pub const ALL : [Param; 17] = [
    Param::AcquisitionMode,
    Param::EdgeDetectMode,
    Param::EnablePattern,
    Param::WindowWidth,
    Param::WindowOffset,
    Param::SoftwareClear,
    Param::Status,
    Param::Control,
    Param::TestReg,
    Param::ExtraSearchMargin,
    Param::RejectMargin,
    Param::FirmwareRev,
    Param::MicroRev,
    Param::EventCounter,
    Param::EventStored,
    Param::SoftwareTrigger,
    Param::ModuleReset,
  ];

  /// The name under which the parameter is known outside
  pub fn name(&self) -> &'static str {
    match self {
      Param::AcquisitionMode   => "ACQUISITION_MODE",
      Param::EdgeDetectMode    => "EDGE_DETECT_MODE",
      Param::EnablePattern     => "ENABLE_PATTERN",
      Param::WindowWidth       => "WINDOW_WIDTH",
      Param::WindowOffset      => "WINDOW_OFFSET",
      Param::SoftwareClear     => "SOFTWARE_CLEAR",
      Param::Status            => "STATUS",
      Param::Control           => "CONTROL",
      Param::TestReg           => "TESTREG",
      Param::ExtraSearchMargin => "EXTRA_SEARCH_MARGIN",
      Param::RejectMargin      => "REJECT_MARGIN",
      Param::FirmwareRev       => "FIRMWARE_REV",
      Param::MicroRev          => "MICRO_REV",
      Param::EventCounter      => "EVENT_COUNTER",
      Param::EventStored       => "EVENT_STORED",
      Param::SoftwareTrigger   => "SOFTWARE_TRIGGER",
      Param::ModuleReset       => "MODULE_RESET",
    }
  }

  /// Look up a parameter by its name, ignoring case
  pub fn from_name(name : &str) -> Option<Param> {
    Param::ALL.iter().copied().find(|p| p.name().eq_ignore_ascii_case(name.trim()))
  }
}

impl fmt::Display for Param {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "{}", self.name())
  }
}

impl FromStr for Param {
  type Err = RegisterError;

  fn from_str(s : &str) -> Result<Self, Self::Err> {
    Param::from_name(s).ok_or(RegisterError::InvalidParameter)
  }
}

/// How to get the value of a parameter
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReadStrategy {
  /// Issue the opcode and take reply word `word`,
  /// masked with `mask`
  Micro { opcode : OpcodeSpec, word : usize, mask : u16 },
  /// Read the register
  Direct { reg : Register },
}

/// How to set the value of a parameter
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WriteStrategy {
  /// Issue the opcode followed by the value as operand
  MicroOperand { opcode : OpcodeSpec },
  /// Issue one of two operand-less opcodes, depending
  /// on the value being zero or not
  MicroSelect { if_zero : OpcodeSpec, if_nonzero : OpcodeSpec },
  /// Write the value to the register
  Direct { reg : Register },
  /// Write 1 to the register, whatever the value is
  Strobe { reg : Register },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ParamDescriptor {
  pub param : Param,
  pub kind  : ParamKind,
  /// number of significant bits of a value
  pub bits  : u32,
  pub read  : Option<ReadStrategy>,
  pub write : Option<WriteStrategy>,
}

impl ParamDescriptor {
  pub fn name(&self) -> &'static str {
    self.param.name()
  }

  pub fn max_value(&self) -> u32 {
    if self.bits >= 32 {
      u32::MAX
    } else {
      (1u32 << self.bits) - 1
    }
  }

  pub fn readable(&self) -> bool {
    self.read.is_some()
  }

  pub fn writable(&self) -> bool {
    self.write.is_some()
  }

  /// Make sure the value fits into the parameter
  pub fn check_range(&self, value : u32) -> Result<(), RegisterError> {
    if value > self.max_value() {
      return Err(RegisterError::ValueOutOfRange { value, width : self.bits });
    }
    Ok(())
  }

  fn for_param(param : Param) -> Self {
    use ReadStrategy as R;
    use WriteStrategy as W;
    let trg_conf = |word| Some(R::Micro { opcode : OP_READ_TRG_CONF, word, mask : 0xFFFF });
    let (kind, bits, read, write) = match param {
      // any nonzero value selects trigger matching
      Param::AcquisitionMode => (
        ParamKind::Int32, 32,
        Some(R::Micro { opcode : OP_READ_ACQ_MOD, word : 0, mask : 0x1 }),
        Some(W::MicroSelect { if_zero : OP_CONT_STOR, if_nonzero : OP_TRG_MATCH })),
      Param::EdgeDetectMode => (
        ParamKind::Int32, 2,
        Some(R::Micro { opcode : OP_READ_DETECTION, word : 0, mask : 0x3 }),
        Some(W::MicroOperand { opcode : OP_SET_DETECTION })),
      Param::EnablePattern => (
        ParamKind::Digital, 16,
        Some(R::Micro { opcode : OP_READ_EN_PATTERN, word : 0, mask : 0xFFFF }),
        Some(W::MicroOperand { opcode : OP_WRITE_EN_PATTERN })),
      Param::WindowWidth       => (ParamKind::Int32, 16, trg_conf(0), Some(W::MicroOperand { opcode : OP_SET_WIN_WIDTH })),
      Param::WindowOffset      => (ParamKind::Int32, 16, trg_conf(1), Some(W::MicroOperand { opcode : OP_SET_WIN_OFFS })),
      Param::ExtraSearchMargin => (ParamKind::Int32, 16, trg_conf(2), Some(W::MicroOperand { opcode : OP_SET_SW_MARGIN })),
      Param::RejectMargin      => (ParamKind::Int32, 16, trg_conf(3), Some(W::MicroOperand { opcode : OP_SET_REJ_MARGIN })),
      Param::MicroRev => (
        ParamKind::Int32, 16,
        Some(R::Micro { opcode : OP_READ_MICRO_REV, word : 0, mask : 0xFFFF }),
        None),
      Param::SoftwareClear   => (ParamKind::Int32,   16, None, Some(W::Strobe { reg : SOFTWARE_CLEAR })),
      Param::SoftwareTrigger => (ParamKind::Int32,   16, None, Some(W::Strobe { reg : SOFTWARE_TRIGGER })),
      Param::ModuleReset     => (ParamKind::Int32,   16, None, Some(W::Strobe { reg : MODULE_RESET })),
      Param::Status          => (ParamKind::Digital, 16, Some(R::Direct { reg : STATUS }), None),
      Param::Control         => (ParamKind::Digital, 16, Some(R::Direct { reg : CONTROL }), Some(W::Direct { reg : CONTROL })),
      Param::TestReg         => (ParamKind::Digital, 32, Some(R::Direct { reg : TESTREG }), Some(W::Direct { reg : TESTREG })),
      Param::FirmwareRev     => (ParamKind::Int32,   16, Some(R::Direct { reg : FIRMWARE_REV }), None),
      Param::EventCounter    => (ParamKind::Int32,   32, Some(R::Direct { reg : EVENT_COUNTER }), None),
      Param::EventStored     => (ParamKind::Int32,   16, Some(R::Direct { reg : EVENT_STORED }), None),
    };
    Self {
      param,
      kind,
      bits,
      read,
      write,
    }
  }
}

impl fmt::Display for ParamDescriptor {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let access = match (self.readable(), self.writable()) {
      (true,  true)  => "RW",
      (true,  false) => "R",
      (false, true)  => "W",
      (false, false) => "-",
    };
    write!(f, "<ParamDescriptor {} : {} {} bits, {}>", self.name(), self.kind, self.bits, access)
  }
}

/// All parameter descriptors, indexed by `Param`
#[derive(Debug, Clone)]
pub struct ParamTable {
  entries : Vec<ParamDescriptor>,
}

impl ParamTable {
  pub fn new() -> Self {
    Self {
      entries : Param::ALL.iter().map(|p| ParamDescriptor::for_param(*p)).collect(),
    }
  }

  pub fn get(&self, param : Param) -> &ParamDescriptor {
    &self.entries[param as usize]
  }

  pub fn iter(&self) -> impl Iterator<Item = &ParamDescriptor> {
    self.entries.iter()
  }
}

impl Default for ParamTable {
  fn default() -> Self {
    Self::new()
  }
}
