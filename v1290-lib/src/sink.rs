//! Where parameter values go
//!
//! Every successful get/set and every status poll ends up
//! in a `ParameterSink`. A sink has to be cheap, it is
//! called while the bus lock is held.

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime,
             Utc};
use crossbeam_channel::Sender;
use serde::{Deserialize,
            Serialize};

use crate::params::{Param,
                    ParamKind};

/// A published value. A failed poll is published
/// as `Unknown`, never as a stale value.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reading {
  Value(u32),
  Unknown,
}

impl fmt::Display for Reading {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Reading::Value(v) => write!(f, "{:#x}", v),
      Reading::Unknown  => write!(f, "UNKNOWN"),
    }
  }
}

pub trait ParameterSink : Send + Sync {
  /// Announce a parameter, called once for every parameter
  /// when the device handle is created
  fn register(&self, name : &str, kind : ParamKind);
  fn publish(&self, param : Param, reading : Reading);
}

/// A timestamped parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamUpdate {
  pub param     : Param,
  pub reading   : Reading,
  pub timestamp : DateTime<Utc>,
}

impl ParamUpdate {
  pub fn new(param : Param, reading : Reading) -> Self {
    Self {
      param,
      reading,
      timestamp : Utc::now(),
    }
  }
}

impl fmt::Display for ParamUpdate {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<ParamUpdate {} : {} at {}>", self.param, self.reading, self.timestamp.format("%H:%M:%S%.3f"))
  }
}

/// Forward updates over a channel, e.g. to a publisher thread
pub struct ChannelSink {
  sender : Sender<ParamUpdate>,
}

impl ChannelSink {
  pub fn new(sender : Sender<ParamUpdate>) -> Self {
    Self {
      sender
    }
  }
}

impl ParameterSink for ChannelSink {
  fn register(&self, name : &str, kind : ParamKind) {
    debug!("Registered parameter {} ({})", name, kind);
  }

  fn publish(&self, param : Param, reading : Reading) {
    match self.sender.send(ParamUpdate::new(param, reading)) {
      Err(err) => error!("Unable to send update for {}! {}", param, err),
      Ok(_)    => ()
    }
  }
}

/// Write updates to the log
#[derive(Debug, Default)]
pub struct LogSink {}

impl ParameterSink for LogSink {
  fn register(&self, name : &str, kind : ParamKind) {
    debug!("Registered parameter {} ({})", name, kind);
  }

  fn publish(&self, param : Param, reading : Reading) {
    info!("{} = {}", param, reading);
  }
}

/// Keep everything in memory
#[derive(Debug, Default)]
pub struct MemorySink {
  registered : Mutex<Vec<(String, ParamKind)>>,
  updates    : Mutex<Vec<(Param, Reading)>>,
}

impl MemorySink {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn registered(&self) -> Vec<(String, ParamKind)> {
    match self.registered.lock() {
      Ok(r)    => r.clone(),
      Err(err) => err.into_inner().clone(),
    }
  }

  pub fn updates(&self) -> Vec<(Param, Reading)> {
    match self.updates.lock() {
      Ok(u)    => u.clone(),
      Err(err) => err.into_inner().clone(),
    }
  }

  /// All readings published for this parameter
  pub fn readings(&self, param : Param) -> Vec<Reading> {
    self.updates().into_iter().filter(|(p, _)| *p == param).map(|(_, r)| r).collect()
  }

  pub fn last(&self, param : Param) -> Option<Reading> {
    self.readings(param).last().copied()
  }
}

impl ParameterSink for MemorySink {
  fn register(&self, name : &str, kind : ParamKind) {
    match self.registered.lock() {
      Ok(mut r) => r.push((String::from(name), kind)),
      Err(err)  => error!("Can't acquire lock! {err}"),
    }
  }

  fn publish(&self, param : Param, reading : Reading) {
    match self.updates.lock() {
      Ok(mut u) => u.push((param, reading)),
      Err(err)  => error!("Can't acquire lock! {err}"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn channel_sink_forwards() {
    let (tx, rx) = crossbeam_channel::unbounded::<ParamUpdate>();
    let sink     = ChannelSink::new(tx);
    sink.publish(Param::Status, Reading::Value(0x9));
    sink.publish(Param::Status, Reading::Unknown);
    let first = rx.recv().unwrap();
    assert_eq!(first.param, Param::Status);
    assert_eq!(first.reading, Reading::Value(0x9));
    assert_eq!(rx.recv().unwrap().reading, Reading::Unknown);
  }

  #[test]
  fn channel_sink_survives_a_closed_channel() {
    let (tx, rx) = crossbeam_channel::unbounded::<ParamUpdate>();
    drop(rx);
    let sink = ChannelSink::new(tx);
    sink.publish(Param::Control, Reading::Value(1));
  }

  #[test]
  fn update_as_json() {
    let update = ParamUpdate::new(Param::WindowWidth, Reading::Value(20));
    let json   = serde_json::to_string(&update).unwrap();
    assert!(json.contains("\"WINDOW_WIDTH\""));
    assert!(json.contains("{\"Value\":20}"));
    let back : ParamUpdate = serde_json::from_str(&json).unwrap();
    assert_eq!(back, update);
  }
}
