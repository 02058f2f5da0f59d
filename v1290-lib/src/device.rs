//! The device handle
//!
//! `V1290` owns the bus and the only lock which guards it.
//! Every register access, be it a parameter get/set or a
//! status poll, happens while that lock is held. Since a
//! microcontroller command is issued completely under the
//! lock, there can be at most one command in flight and
//! nothing can sneak in between an opcode and its operand.

use std::fmt;
use std::sync::{Arc,
                Mutex,
                MutexGuard};

use crate::errors::RegisterError;
use crate::handshake::{MicroHandshake,
                       RetryPolicy};
use crate::memory::{RegisterBus,
                    read_reg,
                    write_reg};
use crate::params::{Param,
                    ParamDescriptor,
                    ParamKind,
                    ParamTable,
                    ReadStrategy,
                    WriteStrategy};
use crate::registers::{StatusWord,
                       STATUS};
use crate::settings::{AcquisitionSettings,
                      V1290Settings};
use crate::sink::{ParameterSink,
                  Reading};

pub struct V1290<B> {
  bus    : Mutex<B>,
  table  : ParamTable,
  policy : RetryPolicy,
  sink   : Arc<dyn ParameterSink>,
}

impl<B: RegisterBus + Send> V1290<B> {

  /// Create the handle and announce all parameters
  /// to the sink
  pub fn new(bus : B, policy : RetryPolicy, sink : Arc<dyn ParameterSink>) -> Self {
    let table = ParamTable::new();
    for desc in table.iter() {
      sink.register(desc.name(), desc.kind);
    }
    Self {
      bus    : Mutex::new(bus),
      table,
      policy,
      sink,
    }
  }

  pub fn from_settings(bus : B, settings : &V1290Settings, sink : Arc<dyn ParameterSink>) -> Self {
    Self::new(bus, settings.retry_policy(), sink)
  }

  pub fn policy(&self) -> RetryPolicy {
    self.policy
  }

  pub fn descriptor(&self, param : Param) -> &ParamDescriptor {
    self.table.get(param)
  }

  pub fn params(&self) -> impl Iterator<Item = &ParamDescriptor> {
    self.table.iter()
  }

  fn lock_bus(&self) -> MutexGuard<'_, B> {
    match self.bus.lock() {
      Ok(bus) => bus,
      Err(err) => {
        // a panic while holding the lock leaves the board
        // in an unknown state, but the bus itself is fine
        error!("Bus lock was poisoned! {err}");
        err.into_inner()
      }
    }
  }

  fn read_locked(&self, bus : &mut B, desc : &ParamDescriptor) -> Result<u32, RegisterError> {
    match desc.read {
      None => Err(RegisterError::InvalidParameter),
      Some(ReadStrategy::Direct { reg }) => read_reg(bus, &reg),
      Some(ReadStrategy::Micro { opcode, word, mask }) => {
        let mut hs = MicroHandshake::new(bus, self.policy);
        let value = if opcode.reply_words == 1 {
          hs.read_after_opcode(opcode.code)?
        } else {
          let words = hs.read_words_after_opcode(opcode.code, opcode.reply_words)?;
          words.get(word).copied().ok_or(RegisterError::InvalidParameter)?
        };
        Ok((value & mask) as u32)
      }
    }
  }

  /// Returns the value as it is now on the board
  fn write_locked(&self, bus : &mut B, desc : &ParamDescriptor, value : u32) -> Result<u32, RegisterError> {
    match desc.write {
      None => Err(RegisterError::InvalidParameter),
      Some(WriteStrategy::Direct { reg }) => {
        write_reg(bus, &reg, value)?;
        Ok(value)
      }
      Some(WriteStrategy::Strobe { reg }) => {
        write_reg(bus, &reg, 1)?;
        Ok(1)
      }
      Some(WriteStrategy::MicroOperand { opcode }) => {
        MicroHandshake::new(bus, self.policy).write_opcode_with_operand(opcode.code, value as u16)?;
        Ok(value)
      }
      Some(WriteStrategy::MicroSelect { if_zero, if_nonzero }) => {
        let (opcode, now) = if value == 0 { (if_zero, 0) } else { (if_nonzero, 1) };
        MicroHandshake::new(bus, self.policy).write_opcode(opcode.code)?;
        Ok(now)
      }
    }
  }

  /// Get the current value of a parameter from the board
  ///
  /// The value is published to the sink as well.
  pub fn get(&self, param : Param) -> Result<u32, RegisterError> {
    let desc = self.table.get(param);
    if !desc.readable() {
      error!("{} can not be read!", param);
      return Err(RegisterError::InvalidParameter);
    }
    let mut bus = self.lock_bus();
    let value   = self.read_locked(&mut bus, desc)?;
    debug!("Get {} -> {:#x}", param, value);
    // publish before unlocking, so the sink sees updates in bus order
    self.sink.publish(param, Reading::Value(value));
    drop(bus);
    Ok(value)
  }

  /// Set a parameter on the board
  ///
  /// Values which do not fit into the parameter are refused
  /// before anything is written.
  pub fn set(&self, param : Param, value : u32) -> Result<(), RegisterError> {
    let desc = self.table.get(param);
    if !desc.writable() {
      error!("{} can not be written!", param);
      return Err(RegisterError::InvalidParameter);
    }
    desc.check_range(value)?;
    let mut bus = self.lock_bus();
    let now     = self.write_locked(&mut bus, desc, value)?;
    debug!("Set {} <- {:#x}", param, value);
    self.sink.publish(param, Reading::Value(now));
    drop(bus);
    Ok(())
  }

  /// Get only the bits in `mask` of a digital parameter
  pub fn get_masked(&self, param : Param, mask : u32) -> Result<u32, RegisterError> {
    if self.table.get(param).kind != ParamKind::Digital {
      error!("{} is not a bit field!", param);
      return Err(RegisterError::InvalidParameter);
    }
    Ok(self.get(param)? & mask)
  }

  /// Change only the bits in `mask` of a digital parameter
  ///
  /// Read and write happen under the same lock, so no other
  /// change can get lost in between.
  pub fn set_masked(&self, param : Param, value : u32, mask : u32) -> Result<(), RegisterError> {
    let desc = self.table.get(param);
    if desc.kind != ParamKind::Digital || !desc.readable() || !desc.writable() {
      error!("{} can not be changed bitwise!", param);
      return Err(RegisterError::InvalidParameter);
    }
    desc.check_range(value & mask)?;
    let mut bus = self.lock_bus();
    let current = self.read_locked(&mut bus, desc)?;
    let update  = (current & !mask) | (value & mask);
    let now     = self.write_locked(&mut bus, desc, update)?;
    debug!("Set {} <- {:#x} (mask {:#x})", param, now, mask);
    self.sink.publish(param, Reading::Value(now));
    drop(bus);
    Ok(())
  }

  /// One status poll: lock, read, publish, unlock
  ///
  /// A failed read is published as `Unknown` and
  /// returned to the caller.
  pub fn poll_status(&self) -> Result<StatusWord, RegisterError> {
    let mut bus = self.lock_bus();
    match read_reg(&mut *bus, &STATUS) {
      Err(err) => {
        self.sink.publish(Param::Status, Reading::Unknown);
        Err(err)
      }
      Ok(value) => {
        self.sink.publish(Param::Status, Reading::Value(value));
        Ok(StatusWord(value as u16))
      }
    }
  }

  pub fn software_clear(&self) -> Result<(), RegisterError> {
    self.set(Param::SoftwareClear, 1)
  }

  /// Bring the board into a known state
  ///
  /// Optionally issues a software clear, then reads the
  /// firmware revisions. Returns the firmware revision
  /// register, [7:4] major and [3:0] minor.
  pub fn initialize(&self, clear : bool) -> Result<u16, RegisterError> {
    if clear {
      info!("Issuing software clear");
      self.software_clear()?;
    }
    let rev = self.get(Param::FirmwareRev)? as u16;
    info!("V1290 firmware revision {}.{}", (rev >> 4) & 0xF, rev & 0xF);
    match self.get(Param::MicroRev) {
      Err(err) => warn!("Unable to read micro firmware revision! {err}"),
      Ok(micro_rev) => info!("V1290 micro firmware revision {}.{}", (micro_rev >> 4) & 0xF, micro_rev & 0xF),
    }
    Ok(rev)
  }

  /// Apply the acquisition settings, stop at the first error
  pub fn configure(&self, acq : &AcquisitionSettings) -> Result<(), RegisterError> {
    for (param, value) in acq.as_params() {
      info!("Configuring {} = {:#x}", param, value);
      self.set(param, value)?;
    }
    Ok(())
  }

  /// Read every readable parameter
  pub fn dump(&self) -> Vec<(Param, Result<u32, RegisterError>)> {
    self.table.iter()
      .filter(|desc| desc.readable())
      .map(|desc| (desc.param, self.get(desc.param)))
      .collect()
  }
}

impl<B> fmt::Display for V1290<B> {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let mut repr = String::from("<V1290:");
    repr += &(format!("\n  params : {}", self.table.iter().count()));
    repr += &(format!("\n  policy : {}>", self.policy));
    write!(f, "{}", repr)
  }
}
