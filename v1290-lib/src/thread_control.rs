//! Thread control structures

use std::fmt;

/// Send runtime information
/// to threads via shared memory
/// (Arc(Mutex)
#[derive(Default, Debug)]
pub struct ThreadControl {
  /// Stop ALL threads
  pub stop_flag               : bool,
  /// alive indicator for the status poller
  pub thread_poller_active    : bool,
  /// alive indicator for the publisher thread
  pub thread_publisher_active : bool,
  /// number of status polls done so far
  pub n_status_polls          : u64,
  /// number of status polls which failed
  pub n_status_failures       : u64,
}

impl ThreadControl {
  pub fn new() -> Self {
    Self {
      stop_flag               : false,
      thread_poller_active    : false,
      thread_publisher_active : false,
      n_status_polls          : 0,
      n_status_failures       : 0,
    }
  }
}

impl fmt::Display for ThreadControl {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let mut repr = String::from("<ThreadControl:");
    repr        += "\n    -- program status:";
    repr        += &(format!("\n  stop flag      : {}", self.stop_flag));
    repr        += &(format!("\n  status polls   : {}", self.n_status_polls));
    repr        += &(format!("\n  failed polls   : {}", self.n_status_failures));
    repr        += "\n    -- reported thread activity:";
    repr        += &(format!("\n  poller         : {}", self.thread_poller_active));
    repr        += &(format!("\n  publisher      : {}>", self.thread_publisher_active));
    write!(f, "{}", repr)
  }
}
