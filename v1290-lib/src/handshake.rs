//! The microcontroller handshake protocol
//!
//! The micro processes one opcode at a time. Before
//! every word written to the MICRO register we have
//! to wait for WRITE_OK in MICRO_HANDSHAKE, and before
//! every word read back we have to wait for READ_OK.
//!
//! A logical command therefore runs through
//!
//! Idle -> AwaitingWriteReady -> OpcodeWritten
//!      [-> AwaitingWriteReady -> OperandWritten]
//!      [-> AwaitingReadReady  -> ResultRead]
//!      -> Complete
//!
//! All waits share the same retry policy. If any of them
//! times out, the whole command fails. Nothing is retried
//! or rolled back, the micro stays in whatever state it
//! reached. Use a software clear to recover.
//!
//! The engine borrows the bus mutably, so it can only be
//! used while the bus lock of the device is held.

use std::fmt;
use std::thread;
use std::time::Duration;

use crate::errors::{HandshakeLeg,
                    RegisterError};
use crate::memory::{RegisterBus,
                    read_reg,
                    write_reg};
use crate::registers::{MICRO,
                       MICRO_HANDSHAKE,
                       READ_OK,
                       WRITE_OK};

/// Default number of handshake polls before giving up
pub const DEFAULT_MAX_ATTEMPTS : u32 = 1000;
/// Default sleep between two handshake polls
pub const DEFAULT_INTERVAL     : Duration = Duration::from_micros(100);

/// How often and how fast to poll a readiness bit
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
  pub max_attempts : u32,
  pub interval     : Duration,
}

impl RetryPolicy {
  pub fn new(max_attempts : u32, interval : Duration) -> Self {
    Self {
      max_attempts,
      interval,
    }
  }

  /// Upper bound on the time a single wait can block,
  /// attempts times interval
  pub fn budget(&self) -> Duration {
    self.interval * self.max_attempts
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_INTERVAL)
  }
}

impl fmt::Display for RetryPolicy {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<RetryPolicy: {} attempts every {:?}, at most {:?}>", self.max_attempts, self.interval, self.budget())
  }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
  /// The condition became true at this attempt (1-based)
  Ready(u32),
  TimedOut,
}

/// Poll a condition until it is true or the attempts are used up
///
/// The condition is evaluated at most `policy.max_attempts`
/// times, with one call to `sleep` between two evaluations.
/// If it becomes true at attempt k, exactly k evaluations
/// and k-1 sleeps have happened. An error of the condition
/// itself ends the wait immediately.
///
/// # Arguments
///
/// * predicate : the condition, e.g. a register bit
/// * policy    : number of attempts and the sleep interval
/// * sleep     : how to sleep, thread::sleep for real hardware
pub fn wait_until<P, S>(mut predicate : P,
                        policy        : &RetryPolicy,
                        mut sleep     : S) -> Result<WaitOutcome, RegisterError>
  where
    P: FnMut() -> Result<bool, RegisterError>,
    S: FnMut(Duration) {
  for attempt in 1..=policy.max_attempts {
    if predicate()? {
      return Ok(WaitOutcome::Ready(attempt));
    }
    if attempt < policy.max_attempts {
      sleep(policy.interval);
    }
  }
  Ok(WaitOutcome::TimedOut)
}

/// Where the engine is within a logical command
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HandshakeState {
  Idle,
  AwaitingWriteReady,
  OpcodeWritten,
  OperandWritten,
  AwaitingReadReady,
  ResultRead,
  Complete,
  Failed,
}

/// Issue microcontroller commands on a (locked) bus
pub struct MicroHandshake<'b, B: ?Sized, S = fn(Duration)> {
  bus    : &'b mut B,
  policy : RetryPolicy,
  sleep  : S,
  state  : HandshakeState,
  polls  : u32,
}

impl<'b, B: RegisterBus + ?Sized> MicroHandshake<'b, B, fn(Duration)> {
  pub fn new(bus : &'b mut B, policy : RetryPolicy) -> Self {
    Self::with_sleep(bus, policy, thread::sleep as fn(Duration))
  }
}

impl<'b, B, S> MicroHandshake<'b, B, S>
  where
    B: RegisterBus + ?Sized,
    S: FnMut(Duration) {

  /// Use a custom sleep, e.g. a simulated clock
  pub fn with_sleep(bus : &'b mut B, policy : RetryPolicy, sleep : S) -> Self {
    Self {
      bus,
      policy,
      sleep,
      state  : HandshakeState::Idle,
      polls  : 0,
    }
  }

  pub fn state(&self) -> HandshakeState {
    self.state
  }

  /// Number of MICRO_HANDSHAKE reads so far
  pub fn polls(&self) -> u32 {
    self.polls
  }

  fn wait_for(&mut self,
              mask   : u16,
              opcode : u16,
              leg    : HandshakeLeg) -> Result<(), RegisterError> {
    let bus   = &mut *self.bus;
    let polls = &mut self.polls;
    let outcome = wait_until(|| {
      *polls += 1;
      let hs = read_reg(&mut *bus, &MICRO_HANDSHAKE)? as u16;
      Ok(hs & mask > 0)
    }, &self.policy, &mut self.sleep);
    match outcome {
      Err(err) => {
        self.state = HandshakeState::Failed;
        Err(err)
      }
      Ok(WaitOutcome::TimedOut) => {
        warn!("Micro handshake timed out after {} attempts ({:?}) waiting for {} of opcode {:#06x}!",
              self.policy.max_attempts, self.policy.budget(), leg, opcode);
        self.state = HandshakeState::Failed;
        Err(RegisterError::Timeout { opcode, leg })
      }
      Ok(WaitOutcome::Ready(attempt)) => {
        trace!("Micro ready for {} of {:#06x} after {} attempts", leg, opcode, attempt);
        Ok(())
      }
    }
  }

  fn write_word(&mut self,
                word   : u16,
                opcode : u16,
                leg    : HandshakeLeg) -> Result<(), RegisterError> {
    self.state = HandshakeState::AwaitingWriteReady;
    self.wait_for(WRITE_OK, opcode, leg)?;
    if let Err(err) = write_reg(&mut *self.bus, &MICRO, word as u32) {
      self.state = HandshakeState::Failed;
      return Err(err);
    }
    self.state = match leg {
      HandshakeLeg::Opcode => HandshakeState::OpcodeWritten,
      _                    => HandshakeState::OperandWritten,
    };
    Ok(())
  }

  fn read_word(&mut self, opcode : u16) -> Result<u16, RegisterError> {
    self.state = HandshakeState::AwaitingReadReady;
    self.wait_for(READ_OK, opcode, HandshakeLeg::Reply)?;
    match read_reg(&mut *self.bus, &MICRO) {
      Err(err) => {
        self.state = HandshakeState::Failed;
        Err(err)
      }
      Ok(value) => {
        self.state = HandshakeState::ResultRead;
        Ok(value as u16)
      }
    }
  }

  /// Wait for WRITE_OK, then write the opcode
  pub fn write_opcode(&mut self, opcode : u16) -> Result<(), RegisterError> {
    debug!("Writing micro opcode {:#06x}", opcode);
    self.write_word(opcode, opcode, HandshakeLeg::Opcode)?;
    self.state = HandshakeState::Complete;
    Ok(())
  }

  /// Write the opcode, then wait for WRITE_OK again
  /// and write the operand
  pub fn write_opcode_with_operand(&mut self, opcode : u16, operand : u16) -> Result<(), RegisterError> {
    debug!("Writing micro opcode {:#06x} with operand {:#06x}", opcode, operand);
    self.write_word(opcode, opcode, HandshakeLeg::Opcode)?;
    self.write_word(operand, opcode, HandshakeLeg::Operand)?;
    self.state = HandshakeState::Complete;
    Ok(())
  }

  /// Write the opcode, then wait for READ_OK and read the reply
  pub fn read_after_opcode(&mut self, opcode : u16) -> Result<u16, RegisterError> {
    debug!("Reading after micro opcode {:#06x}", opcode);
    self.write_word(opcode, opcode, HandshakeLeg::Opcode)?;
    let value = self.read_word(opcode)?;
    self.state = HandshakeState::Complete;
    Ok(value)
  }

  /// Write the opcode, then read `nwords` reply words,
  /// waiting for READ_OK before each of them.
  ///
  /// The micro expects all reply words to be read
  /// before it accepts the next opcode.
  pub fn read_words_after_opcode(&mut self, opcode : u16, nwords : usize) -> Result<Vec<u16>, RegisterError> {
    debug!("Reading {} words after micro opcode {:#06x}", nwords, opcode);
    self.write_word(opcode, opcode, HandshakeLeg::Opcode)?;
    let mut words = Vec::<u16>::with_capacity(nwords);
    for _ in 0..nwords {
      words.push(self.read_word(opcode)?);
    }
    self.state = HandshakeState::Complete;
    Ok(words)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::registers::*;
  use crate::sim::SimulatedBus;

  fn fast_policy(max_attempts : u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Duration::from_micros(1))
  }

  #[test]
  fn wait_exhausts_budget_exactly() {
    let policy     = fast_policy(17);
    let mut evals  = 0;
    let mut sleeps = Vec::<Duration>::new();
    let outcome = wait_until(|| { evals += 1; Ok(false) },
                             &policy,
                             |d| sleeps.push(d)).unwrap();
    assert_eq!(outcome, WaitOutcome::TimedOut);
    assert_eq!(evals, 17);
    assert_eq!(sleeps.len(), 16);
    assert!(sleeps.iter().all(|d| *d == policy.interval));
    assert!(sleeps.iter().sum::<Duration>() <= policy.budget());
  }

  #[test]
  fn budget_is_attempts_times_interval() {
    assert_eq!(RetryPolicy::default().budget(), Duration::from_millis(100));
    assert_eq!(fast_policy(17).budget(), Duration::from_micros(17));
    assert_eq!(fast_policy(0).budget(), Duration::ZERO);
    assert!(format!("{}", RetryPolicy::default()).contains("100ms"));
  }

  #[test]
  fn wait_succeeds_at_attempt_k() {
    let policy = fast_policy(10);
    for k in 1..=10 {
      let mut evals  = 0;
      let mut sleeps = 0;
      let outcome = wait_until(|| { evals += 1; Ok(evals == k) },
                               &policy,
                               |_| sleeps += 1).unwrap();
      assert_eq!(outcome, WaitOutcome::Ready(k));
      assert_eq!(evals, k);
      assert_eq!(sleeps, k - 1);
    }
  }

  #[test]
  fn wait_stops_on_bus_fault() {
    let policy    = fast_policy(10);
    let mut evals = 0;
    let outcome = wait_until(|| {
      evals += 1;
      if evals == 3 {
        return Err(RegisterError::BusFault { offset : 0x1030 });
      }
      Ok(false)
    }, &policy, |_| ());
    assert_eq!(outcome, Err(RegisterError::BusFault { offset : 0x1030 }));
    assert_eq!(evals, 3);
  }

  #[test]
  fn zero_attempts_never_polls() {
    let policy    = fast_policy(0);
    let mut evals = 0;
    let outcome = wait_until(|| { evals += 1; Ok(true) }, &policy, |_| ()).unwrap();
    assert_eq!(outcome, WaitOutcome::TimedOut);
    assert_eq!(evals, 0);
  }

  #[test]
  fn opcode_waits_for_write_ok() {
    let sim     = SimulatedBus::new();
    sim.set_write_ok_delay(4);
    let mut bus = sim.clone();
    let mut hs  = MicroHandshake::with_sleep(&mut bus, fast_policy(10), |_| ());
    hs.write_opcode(OP_CONT_STOR.code).unwrap();
    assert_eq!(hs.state(), HandshakeState::Complete);
    // 4 busy polls, ready at the 5th
    assert_eq!(hs.polls(), 5);
    assert!(!sim.trigger_matching());
  }

  #[test]
  fn operand_leg_times_out() {
    let sim     = SimulatedBus::new();
    let mut bus = sim.clone();
    sim.stall_after_opcode(true);
    let mut hs  = MicroHandshake::with_sleep(&mut bus, fast_policy(25), |_| ());
    let result  = hs.write_opcode_with_operand(OP_SET_WIN_WIDTH.code, 0x20);
    assert_eq!(result, Err(RegisterError::Timeout { opcode : OP_SET_WIN_WIDTH.code,
                                                    leg    : HandshakeLeg::Operand }));
    assert_eq!(hs.state(), HandshakeState::Failed);
    // 1 poll for the opcode, 25 for the operand
    assert_eq!(hs.polls(), 26);
    // the opcode went out, the operand never did
    assert_eq!(sim.micro_writes(), vec![OP_SET_WIN_WIDTH.code]);
  }

  #[test]
  fn reply_leg_times_out_when_read_ok_never_comes() {
    let sim     = SimulatedBus::new();
    sim.set_read_ok_delay(u32::MAX);
    let mut bus = sim.clone();
    let mut hs  = MicroHandshake::with_sleep(&mut bus, fast_policy(8), |_| ());
    let result  = hs.read_after_opcode(OP_READ_EN_PATTERN.code);
    assert_eq!(result, Err(RegisterError::Timeout { opcode : OP_READ_EN_PATTERN.code,
                                                    leg    : HandshakeLeg::Reply }));
    assert_eq!(hs.polls(), 9);
  }

  #[test]
  fn multi_word_reply() {
    let sim     = SimulatedBus::new();
    let mut bus = sim.clone();
    let mut hs  = MicroHandshake::with_sleep(&mut bus, fast_policy(10), |_| ());
    hs.write_opcode_with_operand(OP_SET_WIN_WIDTH.code, 0x14).unwrap();
    hs.write_opcode_with_operand(OP_SET_WIN_OFFS.code, 0xFFD8).unwrap();
    let words = hs.read_words_after_opcode(OP_READ_TRG_CONF.code, OP_READ_TRG_CONF.reply_words).unwrap();
    assert_eq!(words.len(), 5);
    assert_eq!(words[0], 0x14);
    assert_eq!(words[1], 0xFFD8);
  }
}
