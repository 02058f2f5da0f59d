//! An in-memory model of the V1290
//!
//! Emulates the direct registers and the micro controller
//! behind MICRO/MICRO_HANDSHAKE closely enough to run the
//! driver without a crate. On top of that it can
//!
//! * keep the micro busy for a number of handshake polls
//! * stall the micro after an opcode (operand never accepted)
//! * fail the next n accesses to a register with a bus fault
//! * record every bus transaction in a journal
//!
//! Clones share the same board, so a test can keep one
//! clone to inspect the board while the driver owns the
//! other one.

use std::collections::{HashMap,
                       VecDeque};
use std::fmt;
use std::sync::{Arc,
                Mutex,
                MutexGuard};

use crate::errors::RegisterError;
use crate::memory::RegisterBus;
use crate::registers::*;

const DEFAULT_FIRMWARE_REV : u16 = 0x0C;
const DEFAULT_MICRO_REV    : u16 = 0x0A;

/// A single bus transaction as seen by the board
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Transaction {
  Read  { offset : u32, width : Width, value : u32 },
  Write { offset : u32, width : Width, value : u32 },
  Fault { offset : u32, width : Width },
}

impl Transaction {
  pub fn offset(&self) -> u32 {
    match self {
      Transaction::Read  { offset, .. } => *offset,
      Transaction::Write { offset, .. } => *offset,
      Transaction::Fault { offset, .. } => *offset,
    }
  }

  pub fn is_read_of(&self, reg : &Register) -> bool {
    matches!(self, Transaction::Read { offset, .. } if *offset == reg.offset)
  }

  pub fn is_write_to(&self, reg : &Register) -> bool {
    matches!(self, Transaction::Write { offset, .. } if *offset == reg.offset)
  }
}

/// Configuration held by the micro controller
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct MicroConfig {
  trigger_matching : bool,
  detection        : u16,
  enable_pattern   : u16,
  win_width        : u16,
  win_offset       : u16,
  sw_margin        : u16,
  rej_margin       : u16,
  subtraction      : u16,
}

impl Default for MicroConfig {
  // board defaults after power up (manual, chapter 5)
  fn default() -> Self {
    Self {
      trigger_matching : false,
      detection        : 2,
      enable_pattern   : 0xFFFF,
      win_width        : 0x14,
      win_offset       : 0xFFD8,
      sw_margin        : 0x08,
      rej_margin       : 0x04,
      subtraction      : 0,
    }
  }
}

#[derive(Debug)]
struct SimState {
  regs            : HashMap<u32, u32>,
  micro           : MicroConfig,
  pending_opcode  : Option<u16>,
  replies         : VecDeque<u16>,
  write_ok_delay  : u32,
  write_busy      : u32,
  read_ok_delay   : u32,
  read_busy       : u32,
  stall_operand   : bool,
  faults          : HashMap<u32, u32>,
  recording       : bool,
  journal         : Vec<Transaction>,
  micro_writes    : Vec<u16>,
  handshake_polls : u64,
  protocol_errors : u64,
  software_clears : u64,
}

impl SimState {
  fn new() -> Self {
    let mut state = Self {
      regs            : HashMap::<u32, u32>::new(),
      micro           : MicroConfig::default(),
      pending_opcode  : None,
      replies         : VecDeque::<u16>::new(),
      write_ok_delay  : 0,
      write_busy      : 0,
      read_ok_delay   : 0,
      read_busy       : 0,
      stall_operand   : false,
      faults          : HashMap::<u32, u32>::new(),
      recording       : false,
      journal         : Vec::<Transaction>::new(),
      micro_writes    : Vec::<u16>::new(),
      handshake_polls : 0,
      protocol_errors : 0,
      software_clears : 0,
    };
    state.power_up();
    state
  }

  fn power_up(&mut self) {
    self.regs.clear();
    for reg in REGISTER_MAP.iter() {
      self.regs.insert(reg.offset, 0);
    }
    self.regs.insert(FIRMWARE_REV.offset, DEFAULT_FIRMWARE_REV as u32);
    self.regs.insert(CONTROL.offset, CTRL_BERR_EN as u32);
    self.micro          = MicroConfig::default();
    self.pending_opcode = None;
    self.replies.clear();
    self.update_status();
  }

  fn update_status(&mut self) {
    let mut status = self.regs.get(&STATUS.offset).copied().unwrap_or(0) as u16;
    if self.micro.trigger_matching {
      status |= STAT_TRG_MATCH;
    } else {
      status &= !STAT_TRG_MATCH;
    }
    if self.micro.detection == 0 {
      status |= STAT_PAIR_MODE;
    } else {
      status &= !STAT_PAIR_MODE;
    }
    self.regs.insert(STATUS.offset, status as u32);
  }

  fn record(&mut self, tr : Transaction) {
    if self.recording {
      self.journal.push(tr);
    }
  }

  /// Consume one of the injected faults for this offset
  fn take_fault(&mut self, offset : u32) -> bool {
    match self.faults.get_mut(&offset) {
      Some(n) if *n > 0 => {
        *n -= 1;
        true
      }
      _ => false
    }
  }

  fn lookup(offset : u32, width : Width) -> Option<&'static Register> {
    REGISTER_MAP.iter().find(|r| r.offset == offset && r.width == width)
  }

  fn handshake(&mut self) -> u16 {
    self.handshake_polls += 1;
    let mut hs : u16 = 0;
    let stalled = self.stall_operand && self.pending_opcode.is_some();
    if self.write_busy > 0 {
      self.write_busy -= 1;
    } else if !stalled {
      hs |= WRITE_OK;
    }
    if !self.replies.is_empty() {
      if self.read_busy > 0 {
        self.read_busy -= 1;
      } else {
        hs |= READ_OK;
      }
    }
    hs
  }

  fn queue_replies(&mut self, words : &[u16]) {
    self.replies.extend(words.iter());
    self.read_busy = self.read_ok_delay;
  }

  fn micro_write(&mut self, word : u16) {
    self.micro_writes.push(word);
    let stalled = self.stall_operand && self.pending_opcode.is_some();
    if self.write_busy > 0 || stalled {
      // the real micro would just lose the word
      self.protocol_errors += 1;
      return;
    }
    self.write_busy = self.write_ok_delay;
    if let Some(opcode) = self.pending_opcode.take() {
      self.apply_operand(opcode, word);
      return;
    }
    if !self.replies.is_empty() {
      // new opcode before the previous reply was read
      self.protocol_errors += 1;
      self.replies.clear();
    }
    match opcode_by_code(word) {
      None => {
        self.protocol_errors += 1;
      }
      Some(op) if op.operand => {
        self.pending_opcode = Some(op.code);
      }
      Some(op) => {
        self.execute(op.code);
      }
    }
  }

  fn execute(&mut self, code : u16) {
    let m = self.micro;
    match code {
      c if c == OP_TRG_MATCH.code       => self.micro.trigger_matching = true,
      c if c == OP_CONT_STOR.code       => self.micro.trigger_matching = false,
      c if c == OP_LOAD_DEF_CONFIG.code => self.micro = MicroConfig::default(),
      c if c == OP_READ_ACQ_MOD.code    => self.queue_replies(&[m.trigger_matching as u16]),
      c if c == OP_READ_TRG_CONF.code   => {
        self.queue_replies(&[m.win_width, m.win_offset, m.sw_margin, m.rej_margin, m.subtraction])
      }
      c if c == OP_READ_DETECTION.code  => self.queue_replies(&[m.detection]),
      c if c == OP_READ_EN_PATTERN.code => self.queue_replies(&[m.enable_pattern]),
      c if c == OP_READ_MICRO_REV.code  => self.queue_replies(&[DEFAULT_MICRO_REV]),
      _ => self.protocol_errors += 1,
    }
    self.update_status();
  }

  fn apply_operand(&mut self, opcode : u16, operand : u16) {
    match opcode {
      c if c == OP_SET_WIN_WIDTH.code     => self.micro.win_width      = operand,
      c if c == OP_SET_WIN_OFFS.code      => self.micro.win_offset     = operand,
      c if c == OP_SET_SW_MARGIN.code     => self.micro.sw_margin      = operand,
      c if c == OP_SET_REJ_MARGIN.code    => self.micro.rej_margin     = operand,
      c if c == OP_SET_DETECTION.code     => self.micro.detection      = operand & 0x3,
      c if c == OP_WRITE_EN_PATTERN.code  => self.micro.enable_pattern = operand,
      _ => self.protocol_errors += 1,
    }
    self.update_status();
  }

  fn micro_read(&mut self) -> u16 {
    match self.replies.pop_front() {
      None => {
        self.protocol_errors += 1;
        0
      }
      Some(word) => {
        if !self.replies.is_empty() {
          self.read_busy = self.read_ok_delay;
        }
        word
      }
    }
  }

  fn read(&mut self, offset : u32, width : Width) -> Result<u32, RegisterError> {
    let reg = match Self::lookup(offset, width) {
      Some(reg) if reg.access.readable() => reg,
      _ => {
        self.record(Transaction::Fault { offset, width });
        return Err(RegisterError::BusFault { offset });
      }
    };
    if self.take_fault(offset) {
      self.record(Transaction::Fault { offset, width });
      return Err(RegisterError::BusFault { offset });
    }
    let value = match reg.offset {
      o if o == MICRO_HANDSHAKE.offset => self.handshake() as u32,
      o if o == MICRO.offset           => self.micro_read() as u32,
      o => self.regs.get(&o).copied().unwrap_or(0),
    };
    self.record(Transaction::Read { offset, width, value });
    Ok(value)
  }

  fn write(&mut self, offset : u32, width : Width, value : u32) -> Result<(), RegisterError> {
    let reg = match Self::lookup(offset, width) {
      Some(reg) if reg.access.writable() => reg,
      _ => {
        self.record(Transaction::Fault { offset, width });
        return Err(RegisterError::BusFault { offset });
      }
    };
    if self.take_fault(offset) {
      self.record(Transaction::Fault { offset, width });
      return Err(RegisterError::BusFault { offset });
    }
    self.record(Transaction::Write { offset, width, value });
    match reg.offset {
      o if o == MICRO.offset => self.micro_write(value as u16),
      o if o == SOFTWARE_CLEAR.offset => {
        self.software_clears += 1;
        self.pending_opcode = None;
        self.replies.clear();
        self.write_busy = 0;
        self.regs.insert(EVENT_STORED.offset, 0);
        let status = self.regs.get(&STATUS.offset).copied().unwrap_or(0) as u16;
        let cleared = status & !(STAT_DATA_READY | STAT_ALMOST_FULL | STAT_FULL);
        self.regs.insert(STATUS.offset, cleared as u32);
      }
      o if o == SOFTWARE_TRIGGER.offset => {
        let counter = self.regs.get(&EVENT_COUNTER.offset).copied().unwrap_or(0);
        let stored  = self.regs.get(&EVENT_STORED.offset).copied().unwrap_or(0);
        self.regs.insert(EVENT_COUNTER.offset, counter.wrapping_add(1));
        self.regs.insert(EVENT_STORED.offset, (stored + 1).min(0xFFFF));
        let status = self.regs.get(&STATUS.offset).copied().unwrap_or(0) as u16;
        self.regs.insert(STATUS.offset, (status | STAT_DATA_READY) as u32);
      }
      o if o == MODULE_RESET.offset => {
        self.power_up();
      }
      o if reg.access.readable() => {
        self.regs.insert(o, value);
      }
      _ => ()
    }
    Ok(())
  }
}

/// Simulated board, see module docs
#[derive(Debug, Clone)]
pub struct SimulatedBus {
  state : Arc<Mutex<SimState>>,
}

impl SimulatedBus {
  pub fn new() -> Self {
    Self {
      state : Arc::new(Mutex::new(SimState::new())),
    }
  }

  fn state(&self) -> MutexGuard<'_, SimState> {
    // a panicking test thread must not hide the board from the others
    self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Keep WRITE_OK low for this many polls after each word
  pub fn set_write_ok_delay(&self, polls : u32) {
    let mut st     = self.state();
    st.write_ok_delay = polls;
    st.write_busy     = polls;
  }

  /// Keep READ_OK low for this many polls before each reply word
  pub fn set_read_ok_delay(&self, polls : u32) {
    let mut st    = self.state();
    st.read_ok_delay = polls;
    st.read_busy     = polls;
  }

  /// Never raise WRITE_OK again once an opcode which
  /// expects an operand has been written
  pub fn stall_after_opcode(&self, stall : bool) {
    self.state().stall_operand = stall;
  }

  /// Let the next `count` accesses to `reg` fail with a bus fault
  pub fn inject_faults(&self, reg : &Register, count : u32) {
    self.state().faults.insert(reg.offset, count);
  }

  pub fn set_recording(&self, recording : bool) {
    self.state().recording = recording;
  }

  pub fn journal(&self) -> Vec<Transaction> {
    self.state().journal.clone()
  }

  /// Every word which was written to MICRO
  pub fn micro_writes(&self) -> Vec<u16> {
    self.state().micro_writes.clone()
  }

  pub fn handshake_polls(&self) -> u64 {
    self.state().handshake_polls
  }

  /// Words written while the micro was not ready, unknown
  /// opcodes and reads without a pending reply
  pub fn protocol_errors(&self) -> u64 {
    self.state().protocol_errors
  }

  pub fn software_clears(&self) -> u64 {
    self.state().software_clears
  }

  /// Set the non-derived bits of the STATUS register
  pub fn set_status(&self, status : u16) {
    let mut st = self.state();
    st.regs.insert(STATUS.offset, status as u32);
    st.update_status();
  }

  /// Raw content of a direct register
  pub fn register(&self, reg : &Register) -> u32 {
    self.state().regs.get(&reg.offset).copied().unwrap_or(0)
  }

  pub fn trigger_matching(&self) -> bool {
    self.state().micro.trigger_matching
  }

  pub fn enable_pattern(&self) -> u16 {
    self.state().micro.enable_pattern
  }

  /// The micro is in the middle of a command
  pub fn micro_busy(&self) -> bool {
    let st = self.state();
    st.pending_opcode.is_some() || !st.replies.is_empty()
  }
}

impl Default for SimulatedBus {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for SimulatedBus {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let st = self.state();
    let mut repr = String::from("<SimulatedBus:");
    repr += &(format!("\n  micro config    : {:?}", st.micro));
    repr += &(format!("\n  pending opcode  : {:?}", st.pending_opcode));
    repr += &(format!("\n  pending replies : {}", st.replies.len()));
    repr += &(format!("\n  hs polls        : {}", st.handshake_polls));
    repr += &(format!("\n  protocol errors : {}>", st.protocol_errors));
    write!(f, "{}", repr)
  }
}

impl RegisterBus for SimulatedBus {
  fn read_d16(&mut self, offset : u32) -> Result<u16, RegisterError> {
    Ok(self.state().read(offset, Width::D16)? as u16)
  }

  fn write_d16(&mut self, offset : u32, value : u16) -> Result<(), RegisterError> {
    self.state().write(offset, Width::D16, value as u32)
  }

  fn read_d32(&mut self, offset : u32) -> Result<u32, RegisterError> {
    self.state().read(offset, Width::D32)
  }

  fn write_d32(&mut self, offset : u32, value : u32) -> Result<(), RegisterError> {
    self.state().write(offset, Width::D32, value)
  }
}
