//! Driver threads
//!
//! The status poller reads the STATUS register with a
//! fixed period and publishes it. A failed read is
//! published as `Unknown`, the poller itself carries on
//! with the next cycle.
//!
//! The publisher writes every parameter update as a
//! json line.

use std::io::Write;
use std::sync::{Arc,
                Mutex};
use std::thread;
use std::time::{Duration,
                Instant};

use crossbeam_channel::Receiver;

use crate::device::V1290;
use crate::memory::RegisterBus;
use crate::sink::ParamUpdate;
use crate::thread_control::ThreadControl;

/// The poller never sleeps longer than this in one go,
/// so a stop request is seen quickly
pub const STOP_CHECK_INTERVAL : Duration = Duration::from_millis(10);

/// Shorter intervals are raised to this, a poller which
/// never sleeps would keep get/set off the bus
pub const MIN_POLL_INTERVAL   : Duration = Duration::from_millis(1);

fn stop_requested(thread_control : &Arc<Mutex<ThreadControl>>) -> bool {
  match thread_control.lock() {
    Ok(tc) => tc.stop_flag,
    Err(err) => {
      trace!("Can't acquire lock! {err}");
      false
    }
  }
}

fn set_active(thread_control : &Arc<Mutex<ThreadControl>>, active : bool) {
  match thread_control.lock() {
    Ok(mut tc) => tc.thread_poller_active = active,
    Err(err)   => trace!("Can't acquire lock! {err}"),
  }
}

fn set_publisher_active(thread_control : &Arc<Mutex<ThreadControl>>, active : bool) {
  match thread_control.lock() {
    Ok(mut tc) => tc.thread_publisher_active = active,
    Err(err)   => trace!("Can't acquire lock! {err}"),
  }
}

/// Write every update as a json line
///
/// Runs until the last sender, typically the
/// `ChannelSink` of the device, is gone.
pub fn json_publisher<W: Write>(updates        : Receiver<ParamUpdate>,
                                out            : &mut W,
                                thread_control : Arc<Mutex<ThreadControl>>) {
  set_publisher_active(&thread_control, true);
  for update in updates.iter() {
    let line = match serde_json::to_string(&update) {
      Err(err) => {
        error!("Unable to serialize {}! {}", update, err);
        continue;
      }
      Ok(line) => line,
    };
    match writeln!(out, "{}", line) {
      Err(err) => error!("Unable to write {}! {}", update, err),
      Ok(_)    => ()
    }
  }
  match out.flush() {
    Err(err) => error!("Unable to flush output! {err}"),
    Ok(_)    => ()
  }
  debug!("Publisher done");
  set_publisher_active(&thread_control, false);
}

/// Poll the status of the board until told to stop
///
/// The first poll happens right away, then every `interval`
/// (at least `MIN_POLL_INTERVAL`). The bus lock is only held
/// for the poll itself, the sleep happens outside of it.
///
/// # Arguments:
///
/// * device         - the board, shared with whoever
///                    does get/set in the meantime
/// * interval       - time between two polls
/// * thread_control - the poller stops once stop_flag
///                    is set
pub fn status_poller<B>(device         : &V1290<B>,
                        interval       : Duration,
                        thread_control : Arc<Mutex<ThreadControl>>)
  where B: RegisterBus + Send {
  let interval = if interval < MIN_POLL_INTERVAL {
    warn!("Poll interval {:?} is too short, will use {:?}!", interval, MIN_POLL_INTERVAL);
    MIN_POLL_INTERVAL
  } else {
    interval
  };
  info!("Starting status poller, polling every {:?}", interval);
  set_active(&thread_control, true);
  let mut last_poll : Option<Instant> = None;
  loop {
    if stop_requested(&thread_control) {
      info!("Received stop signal. Will stop thread!");
      break;
    }
    let due = match last_poll {
      None    => true,
      Some(t) => t.elapsed() >= interval,
    };
    if due {
      last_poll = Some(Instant::now());
      let failed = match device.poll_status() {
        Err(err) => {
          warn!("Status poll failed! {err}");
          true
        }
        Ok(status) => {
          debug!("Status {:#06x}", status.0);
          if status.any_tdc_error() {
            warn!("TDC error flags set! {}", status);
          }
          false
        }
      };
      match thread_control.lock() {
        Ok(mut tc) => {
          tc.n_status_polls += 1;
          if failed {
            tc.n_status_failures += 1;
          }
        }
        Err(err) => trace!("Can't acquire lock! {err}"),
      }
    }
    let remaining = match last_poll {
      None    => Duration::ZERO,
      Some(t) => interval.saturating_sub(t.elapsed()),
    };
    thread::sleep(remaining.min(STOP_CHECK_INTERVAL));
  }
  set_active(&thread_control, false);
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::handshake::RetryPolicy;
  use crate::params::Param;
  use crate::registers::STATUS;
  use crate::sim::SimulatedBus;
  use crate::sink::{MemorySink,
                    ParamUpdate,
                    Reading};

  #[test]
  fn poller_stops_on_request() {
    let sim    = SimulatedBus::new();
    let sink   = Arc::new(MemorySink::new());
    let dev    = V1290::new(sim.clone(), RetryPolicy::default(), sink.clone());
    let tc     = Arc::new(Mutex::new(ThreadControl::new()));
    sim.inject_faults(&STATUS, 1);
    thread::scope(|s| {
      let tc_poller = tc.clone();
      let dev       = &dev;
      let handle    = s.spawn(move || status_poller(dev, Duration::from_millis(5), tc_poller));
      while tc.lock().unwrap().n_status_polls < 3 {
        thread::sleep(Duration::from_millis(1));
      }
      tc.lock().unwrap().stop_flag = true;
      handle.join().unwrap();
    });
    let tc = tc.lock().unwrap();
    assert!(!tc.thread_poller_active);
    assert_eq!(tc.n_status_failures, 1);
    let readings = sink.readings(Param::Status);
    assert_eq!(readings[0], Reading::Unknown);
    assert!(matches!(readings[1], Reading::Value(_)));
  }

  #[test]
  fn zero_interval_does_not_hog_the_bus() {
    let sim  = SimulatedBus::new();
    let sink = Arc::new(MemorySink::new());
    let dev  = V1290::new(sim.clone(), RetryPolicy::default(), sink.clone());
    let tc   = Arc::new(Mutex::new(ThreadControl::new()));
    thread::scope(|s| {
      let tc_poller = tc.clone();
      let dev       = &dev;
      let handle    = s.spawn(move || status_poller(dev, Duration::ZERO, tc_poller));
      for _ in 0..10 {
        assert_eq!(dev.get(Param::EnablePattern).unwrap(), 0xFFFF);
        thread::sleep(Duration::from_millis(5));
      }
      tc.lock().unwrap().stop_flag = true;
      handle.join().unwrap();
    });
    // about 50ms at one poll per millisecond
    let polls = tc.lock().unwrap().n_status_polls;
    assert!(polls > 0);
    assert!(polls < 500, "{} polls", polls);
  }

  #[test]
  fn publisher_writes_one_line_per_update() {
    let (tx, rx) = crossbeam_channel::unbounded::<ParamUpdate>();
    let tc       = Arc::new(Mutex::new(ThreadControl::new()));
    let mut out  = Vec::<u8>::new();
    thread::scope(|s| {
      let tc_pub = tc.clone();
      let out    = &mut out;
      let handle = s.spawn(move || json_publisher(rx, out, tc_pub));
      while !tc.lock().unwrap().thread_publisher_active {
        thread::sleep(Duration::from_millis(1));
      }
      tx.send(ParamUpdate::new(Param::WindowWidth, Reading::Value(20))).unwrap();
      tx.send(ParamUpdate::new(Param::Status, Reading::Unknown)).unwrap();
      drop(tx);
      handle.join().unwrap();
    });
    assert!(!tc.lock().unwrap().thread_publisher_active);
    let text  = String::from_utf8(out).unwrap();
    let lines : Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    let first : ParamUpdate = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(first.param, Param::WindowWidth);
    assert_eq!(first.reading, Reading::Value(20));
    let second : ParamUpdate = serde_json::from_str(lines[1]).unwrap();
    assert_eq!(second.reading, Reading::Unknown);
  }
}
