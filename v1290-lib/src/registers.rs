//! Registers of the V1290 are accessed through the
//! VME window (A32, 64kB). Offsets are byte offsets
//! relative to the base address of the board.
//!
//! _a note here_ : the board latches data per transaction
//! width. A D32 register has to be read with a single
//! 32bit access, a D16 register with a single 16bit
//! access. Never split or combine them.
//!
//! Please refer to the V1290 A/N technical information
//! manual (rev. 10), chapter 6 for the register map and
//! chapter 5 for the micro controller opcodes.

use std::fmt;

/// VME data width of a register
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Width {
  D16,
  D32,
}

impl Width {
  pub fn bits(&self) -> u32 {
    match self {
      Width::D16 => 16,
      Width::D32 => 32,
    }
  }

  pub fn bytes(&self) -> usize {
    match self {
      Width::D16 => 2,
      Width::D32 => 4,
    }
  }

  /// The largest value which can be transferred
  pub fn max_value(&self) -> u32 {
    match self {
      Width::D16 => u16::MAX as u32,
      Width::D32 => u32::MAX,
    }
  }
}

/// Read/write permission as given in the register map
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RegAccess {
  R,
  W,
  RW,
}

impl RegAccess {
  pub fn readable(&self) -> bool {
    matches!(self, RegAccess::R | RegAccess::RW)
  }

  pub fn writable(&self) -> bool {
    matches!(self, RegAccess::W | RegAccess::RW)
  }
}

/// A single entry of the register map
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Register {
  pub name   : &'static str,
  pub offset : u32,
  pub width  : Width,
  pub access : RegAccess,
}

impl Register {
  const fn new(name : &'static str, offset : u32, width : Width, access : RegAccess) -> Self {
    Self {
      name,
      offset,
      width,
      access,
    }
  }

  /// Check if the register is part of the register map
  pub fn is_mapped(&self) -> bool {
    REGISTER_MAP.iter().any(|r| r == self)
  }

  /// Reading the register takes data off the board, a
  /// micro controller reply or a FIFO word
  pub fn destructive_read(&self) -> bool {
    DESTRUCTIVE_READS.iter().any(|r| r == self)
  }
}

impl fmt::Display for Register {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<Register {} : {:#06x} {:?} {:?}>", self.name, self.offset, self.width, self.access)
  }
}

//========== V1290 Registers ============
//
//=======================================

pub const OUTPUT_BUFFER        : Register = Register::new("OUTPUT_BUFFER",        0x0000, Width::D32, RegAccess::R);
pub const CONTROL              : Register = Register::new("CONTROL",              0x1000, Width::D16, RegAccess::RW);
pub const STATUS               : Register = Register::new("STATUS",               0x1002, Width::D16, RegAccess::R);
pub const INTERRUPT_LEVEL      : Register = Register::new("INTERRUPT_LEVEL",      0x100A, Width::D16, RegAccess::RW);
pub const INTERRUPT_VECTOR     : Register = Register::new("INTERRUPT_VECTOR",     0x100C, Width::D16, RegAccess::RW);
pub const GEO_ADDRESS          : Register = Register::new("GEO_ADDRESS",          0x100E, Width::D16, RegAccess::RW);
// writing any value resets the module
pub const MODULE_RESET         : Register = Register::new("MODULE_RESET",         0x1014, Width::D16, RegAccess::W);
// writing any value clears the buffers and resets the logic
pub const SOFTWARE_CLEAR       : Register = Register::new("SOFTWARE_CLEAR",       0x1016, Width::D16, RegAccess::W);
pub const SOFTWARE_EVENT_RESET : Register = Register::new("SOFTWARE_EVENT_RESET", 0x1018, Width::D16, RegAccess::W);
pub const SOFTWARE_TRIGGER     : Register = Register::new("SOFTWARE_TRIGGER",     0x101A, Width::D16, RegAccess::W);
pub const EVENT_COUNTER        : Register = Register::new("EVENT_COUNTER",        0x101C, Width::D32, RegAccess::R);
pub const EVENT_STORED         : Register = Register::new("EVENT_STORED",         0x1020, Width::D16, RegAccess::R);
pub const ALMOST_FULL_LEVEL    : Register = Register::new("ALMOST_FULL_LEVEL",    0x1022, Width::D16, RegAccess::RW);
// [7:4] major, [3:0] minor
pub const FIRMWARE_REV         : Register = Register::new("FIRMWARE_REV",         0x1026, Width::D16, RegAccess::R);
pub const TESTREG              : Register = Register::new("TESTREG",              0x1028, Width::D32, RegAccess::RW);
pub const MICRO                : Register = Register::new("MICRO",                0x102E, Width::D16, RegAccess::RW);
pub const MICRO_HANDSHAKE      : Register = Register::new("MICRO_HANDSHAKE",      0x1030, Width::D16, RegAccess::R);
pub const EVENT_FIFO           : Register = Register::new("EVENT_FIFO",           0x1038, Width::D32, RegAccess::R);
pub const EVENT_FIFO_STORED    : Register = Register::new("EVENT_FIFO_STORED",    0x103C, Width::D16, RegAccess::R);
pub const EVENT_FIFO_STATUS    : Register = Register::new("EVENT_FIFO_STATUS",    0x103E, Width::D16, RegAccess::R);
pub const DUMMY32              : Register = Register::new("DUMMY32",              0x1200, Width::D32, RegAccess::RW);
pub const DUMMY16              : Register = Register::new("DUMMY16",              0x1204, Width::D16, RegAccess::RW);

/// Registers which must only be read by code that
/// wants the data, never by a register dump
pub static DESTRUCTIVE_READS : [Register; 3] = [
  OUTPUT_BUFFER,
  MICRO,
  EVENT_FIFO,
];

/// All registers the driver is allowed to touch
pub static REGISTER_MAP : [Register; 22] = [
  OUTPUT_BUFFER,
  CONTROL,
  STATUS,
  INTERRUPT_LEVEL,
  INTERRUPT_VECTOR,
  GEO_ADDRESS,
  MODULE_RESET,
  SOFTWARE_CLEAR,
  SOFTWARE_EVENT_RESET,
  SOFTWARE_TRIGGER,
  EVENT_COUNTER,
  EVENT_STORED,
  ALMOST_FULL_LEVEL,
  FIRMWARE_REV,
  TESTREG,
  MICRO,
  MICRO_HANDSHAKE,
  EVENT_FIFO,
  EVENT_FIFO_STORED,
  EVENT_FIFO_STATUS,
  DUMMY32,
  DUMMY16,
];

/// The size of the VME window the board decodes (A32)
pub const WINDOW_LEN : usize = 0x10000;

//=========== MICRO_HANDSHAKE ===========

/// Micro is ready to accept an opcode or an operand
pub const WRITE_OK : u16 = 0x1;
/// Micro has a reply word waiting in the MICRO register
pub const READ_OK  : u16 = 0x2;

//=========== CONTROL bits ==============

pub const CTRL_BERR_EN            : u16 = 1 << 0;
pub const CTRL_TERM               : u16 = 1 << 1;
pub const CTRL_TERM_SW            : u16 = 1 << 2;
pub const CTRL_EMPTY_EVENT        : u16 = 1 << 3;
pub const CTRL_ALIGN64            : u16 = 1 << 4;
pub const CTRL_COMPENSATION_EN    : u16 = 1 << 5;
pub const CTRL_TEST_FIFO_EN       : u16 = 1 << 6;
pub const CTRL_READ_COMP_SRAM_EN  : u16 = 1 << 7;
pub const CTRL_EVENT_FIFO_EN      : u16 = 1 << 8;
pub const CTRL_EXT_TRG_TIME_TAG   : u16 = 1 << 9;

//=========== STATUS bits ===============

pub const STAT_DATA_READY         : u16 = 1 << 0;
pub const STAT_ALMOST_FULL        : u16 = 1 << 1;
pub const STAT_FULL               : u16 = 1 << 2;
pub const STAT_TRG_MATCH          : u16 = 1 << 3;
pub const STAT_HEADER_EN          : u16 = 1 << 4;
pub const STAT_TERM_ON            : u16 = 1 << 5;
// [9:6] one error flag per TDC chip
pub const STAT_ERROR_SHIFT        : u16 = 6;
pub const STAT_ERROR_MASK         : u16 = 0xF << STAT_ERROR_SHIFT;
pub const STAT_BERR_FLAG          : u16 = 1 << 10;
pub const STAT_PURGED             : u16 = 1 << 11;
// [13:12] 00 800ps, 01 200ps, 10 100ps, 11 25ps
pub const STAT_RES_SHIFT          : u16 = 12;
pub const STAT_RES_MASK           : u16 = 0x3 << STAT_RES_SHIFT;
pub const STAT_PAIR_MODE          : u16 = 1 << 14;
pub const STAT_TRIGGER_LOST       : u16 = 1 << 15;

/// Decoded content of the STATUS register
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StatusWord(pub u16);

impl StatusWord {
  pub fn data_ready(&self) -> bool {
    self.0 & STAT_DATA_READY > 0
  }

  pub fn almost_full(&self) -> bool {
    self.0 & STAT_ALMOST_FULL > 0
  }

  pub fn full(&self) -> bool {
    self.0 & STAT_FULL > 0
  }

  pub fn trigger_matching(&self) -> bool {
    self.0 & STAT_TRG_MATCH > 0
  }

  pub fn header_enabled(&self) -> bool {
    self.0 & STAT_HEADER_EN > 0
  }

  pub fn termination_on(&self) -> bool {
    self.0 & STAT_TERM_ON > 0
  }

  /// Error flag of one of the 4 TDC chips
  pub fn tdc_error(&self, chip : u8) -> bool {
    if chip > 3 {
      return false;
    }
    (self.0 >> (STAT_ERROR_SHIFT + chip as u16)) & 0x1 > 0
  }

  pub fn any_tdc_error(&self) -> bool {
    self.0 & STAT_ERROR_MASK > 0
  }

  pub fn bus_error(&self) -> bool {
    self.0 & STAT_BERR_FLAG > 0
  }

  pub fn purged(&self) -> bool {
    self.0 & STAT_PURGED > 0
  }

  /// LSB of the time measurement in picoseconds
  pub fn resolution_ps(&self) -> u32 {
    match (self.0 & STAT_RES_MASK) >> STAT_RES_SHIFT {
      0 => 800,
      1 => 200,
      2 => 100,
      _ => 25,
    }
  }

  pub fn pair_mode(&self) -> bool {
    self.0 & STAT_PAIR_MODE > 0
  }

  pub fn trigger_lost(&self) -> bool {
    self.0 & STAT_TRIGGER_LOST > 0
  }
}

impl fmt::Display for StatusWord {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let mut repr = format!("<StatusWord {:#06x}:", self.0);
    repr += &(format!("\n  data ready    : {}", self.data_ready()));
    repr += &(format!("\n  almost full   : {}", self.almost_full()));
    repr += &(format!("\n  full          : {}", self.full()));
    repr += &(format!("\n  trg matching  : {}", self.trigger_matching()));
    repr += &(format!("\n  header en     : {}", self.header_enabled()));
    repr += &(format!("\n  termination   : {}", self.termination_on()));
    repr += &(format!("\n  tdc errors    : [{} {} {} {}]",
                      self.tdc_error(0),
                      self.tdc_error(1),
                      self.tdc_error(2),
                      self.tdc_error(3)));
    repr += &(format!("\n  bus error     : {}", self.bus_error()));
    repr += &(format!("\n  purged        : {}", self.purged()));
    repr += &(format!("\n  resolution    : {} ps", self.resolution_ps()));
    repr += &(format!("\n  pair mode     : {}", self.pair_mode()));
    repr += &(format!("\n  trigger lost  : {}>", self.trigger_lost()));
    write!(f, "{}", repr)
  }
}

//=========== Micro controller ===========
//
// Each opcode is 16 bit, [15:8] command,
// [7:0] object (e.g. channel). We only use
// object 0.
//========================================

/// A single entry of the opcode table
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct OpcodeSpec {
  pub name        : &'static str,
  pub code        : u16,
  /// the opcode is followed by one operand word
  pub operand     : bool,
  /// number of words the micro will reply with
  pub reply_words : usize,
}

impl OpcodeSpec {
  const fn new(name : &'static str, code : u16, operand : bool, reply_words : usize) -> Self {
    Self {
      name,
      code,
      operand,
      reply_words,
    }
  }
}

impl fmt::Display for OpcodeSpec {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<Opcode {} : {:#06x} operand {} reply {}>", self.name, self.code, self.operand, self.reply_words)
  }
}

// acquisition mode
pub const OP_TRG_MATCH       : OpcodeSpec = OpcodeSpec::new("TRG_MATCH",        0x0000, false, 0);
pub const OP_CONT_STOR       : OpcodeSpec = OpcodeSpec::new("CONT_STOR",        0x0100, false, 0);
pub const OP_READ_ACQ_MOD    : OpcodeSpec = OpcodeSpec::new("READ_ACQ_MOD",     0x0200, false, 1);
pub const OP_LOAD_DEF_CONFIG : OpcodeSpec = OpcodeSpec::new("LOAD_DEF_CONFIG",  0x0500, false, 0);
// trigger window
pub const OP_SET_WIN_WIDTH   : OpcodeSpec = OpcodeSpec::new("SET_WIN_WIDTH",    0x1000, true,  0);
pub const OP_SET_WIN_OFFS    : OpcodeSpec = OpcodeSpec::new("SET_WIN_OFFS",     0x1100, true,  0);
pub const OP_SET_SW_MARGIN   : OpcodeSpec = OpcodeSpec::new("SET_SW_MARGIN",    0x1200, true,  0);
pub const OP_SET_REJ_MARGIN  : OpcodeSpec = OpcodeSpec::new("SET_REJ_MARGIN",   0x1300, true,  0);
// replies width, offset, extra search margin, reject margin, subtraction
pub const OP_READ_TRG_CONF   : OpcodeSpec = OpcodeSpec::new("READ_TRG_CONF",    0x1600, false, 5);
// edge detection
pub const OP_SET_DETECTION   : OpcodeSpec = OpcodeSpec::new("SET_DETECTION",    0x2200, true,  0);
pub const OP_READ_DETECTION  : OpcodeSpec = OpcodeSpec::new("READ_DETECTION",   0x2300, false, 1);
// channel enable
pub const OP_WRITE_EN_PATTERN: OpcodeSpec = OpcodeSpec::new("WRITE_EN_PATTERN", 0x4400, true,  0);
pub const OP_READ_EN_PATTERN : OpcodeSpec = OpcodeSpec::new("READ_EN_PATTERN",  0x4500, false, 1);
// misc
pub const OP_READ_MICRO_REV  : OpcodeSpec = OpcodeSpec::new("READ_MICRO_REV",   0x6100, false, 1);

pub static OPCODE_TABLE : [OpcodeSpec; 14] = [
  OP_TRG_MATCH,
  OP_CONT_STOR,
  OP_READ_ACQ_MOD,
  OP_LOAD_DEF_CONFIG,
  OP_SET_WIN_WIDTH,
  OP_SET_WIN_OFFS,
  OP_SET_SW_MARGIN,
  OP_SET_REJ_MARGIN,
  OP_READ_TRG_CONF,
  OP_SET_DETECTION,
  OP_READ_DETECTION,
  OP_WRITE_EN_PATTERN,
  OP_READ_EN_PATTERN,
  OP_READ_MICRO_REV,
];

/// Look up an opcode by its 16bit code
pub fn opcode_by_code(code : u16) -> Option<&'static OpcodeSpec> {
  OPCODE_TABLE.iter().find(|op| op.code == code)
}

/// Edge detection configuration as set
/// with SET_DETECTION
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum EdgeDetection {
  Pair     = 0,
  Trailing = 1,
  Leading  = 2,
  Both     = 3,
}

impl From<u16> for EdgeDetection {
  fn from(value : u16) -> Self {
    match value & 0x3 {
      0 => EdgeDetection::Pair,
      1 => EdgeDetection::Trailing,
      2 => EdgeDetection::Leading,
      _ => EdgeDetection::Both,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;

  #[test]
  fn register_map_is_consistent() {
    let mut offsets = HashSet::<u32>::new();
    for reg in REGISTER_MAP.iter() {
      assert!(offsets.insert(reg.offset), "{} appears twice", reg.name);
      assert_eq!(reg.offset as usize % reg.width.bytes(), 0, "{} misaligned", reg.name);
      assert!((reg.offset as usize) + reg.width.bytes() <= WINDOW_LEN);
    }
  }

  #[test]
  fn only_data_registers_have_destructive_reads() {
    for reg in DESTRUCTIVE_READS.iter() {
      assert!(reg.is_mapped());
      assert!(reg.access.readable());
    }
    assert!(MICRO.destructive_read());
    assert!(EVENT_FIFO.destructive_read());
    assert!(!STATUS.destructive_read());
    assert!(!MICRO_HANDSHAKE.destructive_read());
  }

  #[test]
  fn opcodes_are_unique() {
    let mut codes = HashSet::<u16>::new();
    for op in OPCODE_TABLE.iter() {
      assert!(codes.insert(op.code), "{} appears twice", op.name);
    }
    assert_eq!(opcode_by_code(0x4400), Some(&OP_WRITE_EN_PATTERN));
    assert_eq!(opcode_by_code(0x4401), None);
  }

  #[test]
  fn decode_status_word() {
    let status = StatusWord(STAT_DATA_READY | STAT_TRG_MATCH | (1 << 7) | (0x3 << STAT_RES_SHIFT) | STAT_TRIGGER_LOST);
    assert!(status.data_ready());
    assert!(status.trigger_matching());
    assert!(!status.full());
    assert!(!status.tdc_error(0));
    assert!(status.tdc_error(1));
    assert!(!status.tdc_error(4));
    assert!(status.any_tdc_error());
    assert_eq!(status.resolution_ps(), 25);
    assert!(status.trigger_lost());
  }

  #[test]
  fn test_fifo_bit_matches_board() {
    assert_eq!(CTRL_TEST_FIFO_EN, 0b01000000);
  }
}
