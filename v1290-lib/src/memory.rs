//! Access to the VME window of the board
//!
//! The VME bridge maps the A32 window of the board
//! into the physical address space of the host. We
//! map it into our own address space through a
//! device file, typically
//!
//! /dev/mem         - the whole physical memory
//! /dev/uio0        - an uio device exposing just the window
//!
//! and then read/write it with volatile accesses of
//! the exact register width.

use std::fs::File;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{fence, Ordering};

use memmap::MmapMut;

use crate::errors::RegisterError;
use crate::registers::{Register,
                       Width,
                       REGISTER_MAP};

pub const DEV_MEM : &str = "/dev/mem";

/// Bus width correct register transactions
///
/// Implementors have to guarantee that every call results
/// in exactly one bus transaction of the given width, in
/// program order. A failed transaction is returned as
/// `BusFault`, it must never bring down the process.
pub trait RegisterBus {
  fn read_d16(&mut self, offset : u32) -> Result<u16, RegisterError>;
  fn write_d16(&mut self, offset : u32, value : u16) -> Result<(), RegisterError>;
  fn read_d32(&mut self, offset : u32) -> Result<u32, RegisterError>;
  fn write_d32(&mut self, offset : u32, value : u32) -> Result<(), RegisterError>;

  fn read(&mut self, offset : u32, width : Width) -> Result<u32, RegisterError> {
    match width {
      Width::D16 => Ok(self.read_d16(offset)? as u32),
      Width::D32 => self.read_d32(offset),
    }
  }

  fn write(&mut self, offset : u32, width : Width, value : u32) -> Result<(), RegisterError> {
    if value > width.max_value() {
      return Err(RegisterError::ValueOutOfRange { value, width : width.bits() });
    }
    match width {
      Width::D16 => self.write_d16(offset, value as u16),
      Width::D32 => self.write_d32(offset, value),
    }
  }
}

/// Read a register of the register map with its declared width
pub fn read_reg<B: RegisterBus + ?Sized>(bus : &mut B, reg : &Register) -> Result<u32, RegisterError> {
  debug_assert!(reg.is_mapped(), "{} is not part of the register map", reg);
  if !reg.access.readable() {
    error!("Register {} is write only!", reg.name);
    return Err(RegisterError::InvalidParameter);
  }
  let value = bus.read(reg.offset, reg.width)?;
  trace!("Read {:#x} from {}", value, reg.name);
  Ok(value)
}

/// Write a register of the register map with its declared width
pub fn write_reg<B: RegisterBus + ?Sized>(bus : &mut B, reg : &Register, value : u32) -> Result<(), RegisterError> {
  debug_assert!(reg.is_mapped(), "{} is not part of the register map", reg);
  if !reg.access.writable() {
    error!("Register {} is read only!", reg.name);
    return Err(RegisterError::InvalidParameter);
  }
  trace!("Attempting to write {:#x} to {}", value, reg.name);
  bus.write(reg.offset, reg.width, value)
}

/// Read every register of the map which can be read without
/// side effects, each once and with its declared width
///
/// Registers with destructive reads (micro replies, FIFOs)
/// are skipped. A failed read does not stop the walk.
pub fn read_all_registers<B: RegisterBus + ?Sized>(bus : &mut B) -> Vec<(&'static Register, Result<u32, RegisterError>)> {
  REGISTER_MAP.iter()
    .filter(|reg| reg.access.readable() && !reg.destructive_read())
    .map(|reg| (reg, read_reg(&mut *bus, reg)))
    .collect()
}

/// Map the VME window of the board
///
/// Mapping failures are fatal, there is no point
/// in retrying.
///
/// # Arguments
///
/// * addr_space : device file, e.g. /dev/mem
/// * base       : physical base address of the
///                window. Has to be page aligned.
/// * len        : size of the window in bytes
pub fn map_device(addr_space : &str,
                  base       : u64,
                  len        : usize) -> Result<MmapMut, RegisterError> {
  let file = match File::options()
    .read(true)
    .write(true)
    .open(addr_space) {
    Err(err) => {
      error!("Unable to open {}! {}", addr_space, err);
      return Err(RegisterError::MappingFailure);
    }
    Ok(f) => f
  };
  let m = unsafe {
    memmap::MmapOptions::new()
      .offset(base)
      .len(len)
      .map_mut(&file)
  };
  match m {
    Err(err) => {
      error!("Failed to mmap {} at {:#x} (len {:#x})! {}", addr_space, base, len, err);
      Err(RegisterError::MappingFailure)
    }
    Ok(m) => {
      info!("Mapped {:#x} bytes of {} at {:#x}", len, addr_space, base);
      Ok(m)
    }
  }
}

/// A mapped register window
///
/// The span is borrowed from whoever did the mapping
/// (see `map_device`), so it can not outlive the mapping.
/// All accesses are volatile and bounds/alignment checked,
/// an access which would leave the window is reported
/// as `BusFault` instead of touching memory.
#[derive(Debug)]
pub struct MmioSpan<'a> {
  base     : *mut u8,
  len      : usize,
  _mapping : PhantomData<&'a mut [u8]>,
}

// The span is only ever accessed through &mut self,
// and the device handle puts it behind a Mutex.
unsafe impl<'a> Send for MmioSpan<'a> {}

impl<'a> MmioSpan<'a> {
  pub fn new(mapping : &'a mut MmapMut) -> Self {
    Self {
      base     : mapping.as_mut_ptr(),
      len      : mapping.len(),
      _mapping : PhantomData,
    }
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  /// Probe if an access is possible
  fn probe(&self, offset : u32, width : Width) -> Result<usize, RegisterError> {
    let start = offset as usize;
    if start % width.bytes() != 0 || start + width.bytes() > self.len {
      warn!("Access of {} bytes at {:#06x} outside of window (len {:#x})!", width.bytes(), offset, self.len);
      return Err(RegisterError::BusFault { offset });
    }
    Ok(start)
  }
}

impl<'a> RegisterBus for MmioSpan<'a> {
  fn read_d16(&mut self, offset : u32) -> Result<u16, RegisterError> {
    let start = self.probe(offset, Width::D16)?;
    let value : u16;
    unsafe {
      value = ptr::read_volatile(self.base.add(start) as *const u16);
    }
    fence(Ordering::SeqCst);
    Ok(value)
  }

  fn write_d16(&mut self, offset : u32, value : u16) -> Result<(), RegisterError> {
    let start = self.probe(offset, Width::D16)?;
    unsafe {
      ptr::write_volatile(self.base.add(start) as *mut u16, value);
    }
    fence(Ordering::SeqCst);
    Ok(())
  }

  fn read_d32(&mut self, offset : u32) -> Result<u32, RegisterError> {
    let start = self.probe(offset, Width::D32)?;
    let value : u32;
    unsafe {
      value = ptr::read_volatile(self.base.add(start) as *const u32);
    }
    fence(Ordering::SeqCst);
    Ok(value)
  }

  fn write_d32(&mut self, offset : u32, value : u32) -> Result<(), RegisterError> {
    let start = self.probe(offset, Width::D32)?;
    unsafe {
      ptr::write_volatile(self.base.add(start) as *mut u32, value);
    }
    fence(Ordering::SeqCst);
    Ok(())
  }
}
