use std::sync::{Arc,
                Mutex};
use std::thread;
use std::time::Duration;

use v1290_lib::V1290;
use v1290_lib::RegisterError;
use v1290_lib::handshake::RetryPolicy;
use v1290_lib::monitoring::status_poller;
use v1290_lib::params::{Param,
                        ParamKind};
use v1290_lib::registers::*;
use v1290_lib::settings::{AcquisitionSettings,
                          V1290Settings};
use v1290_lib::sim::{SimulatedBus,
                     Transaction};
use v1290_lib::sink::{LogSink,
                      MemorySink,
                      ParameterSink,
                      Reading};
use v1290_lib::ThreadControl;

fn fast_policy() -> RetryPolicy {
  RetryPolicy::new(200, Duration::from_micros(1))
}

fn device() -> (SimulatedBus, Arc<MemorySink>, V1290<SimulatedBus>) {
  let sim  = SimulatedBus::new();
  let sink = Arc::new(MemorySink::new());
  let dev  = V1290::new(sim.clone(), fast_policy(), sink.clone());
  (sim, sink, dev)
}

#[test]
fn round_trip_all_settable_params() {
  let (_, sink, dev) = device();
  let values = [
    (Param::EdgeDetectMode,    3),
    (Param::EnablePattern,     0xA5A5),
    (Param::WindowWidth,       0x28),
    (Param::WindowOffset,      0xFFF0),
    (Param::ExtraSearchMargin, 0x10),
    (Param::RejectMargin,      0x02),
    (Param::Control,           0x0061),
    (Param::TestReg,           0xdead_beef),
  ];
  for (param, value) in values {
    dev.set(param, value).unwrap();
    assert_eq!(dev.get(param).unwrap(), value, "{}", param);
    assert_eq!(sink.last(param), Some(Reading::Value(value)));
  }
}

#[test]
fn edge_detect_every_value() {
  let (_, _, dev) = device();
  for v in 0..4 {
    dev.set(Param::EdgeDetectMode, v).unwrap();
    assert_eq!(dev.get(Param::EdgeDetectMode).unwrap(), v);
    assert_eq!(EdgeDetection::from(v as u16) as u32, v);
  }
}

#[test]
fn acquisition_mode_round_trip() {
  let (sim, _, dev) = device();
  dev.set(Param::AcquisitionMode, 1).unwrap();
  assert_eq!(dev.get(Param::AcquisitionMode).unwrap(), 1);
  assert!(sim.trigger_matching());
  assert!(StatusWord(dev.get(Param::Status).unwrap() as u16).trigger_matching());
  dev.set(Param::AcquisitionMode, 0).unwrap();
  assert_eq!(dev.get(Param::AcquisitionMode).unwrap(), 0);
  assert!(!sim.trigger_matching());
}

#[test]
fn any_nonzero_acquisition_mode_is_trigger_matching() {
  let (sim, sink, dev) = device();
  for mode in [0x1_0000, u32::MAX, 2] {
    dev.set(Param::AcquisitionMode, 0).unwrap();
    dev.set(Param::AcquisitionMode, mode).unwrap();
    assert!(sim.trigger_matching());
    assert_eq!(sink.last(Param::AcquisitionMode), Some(Reading::Value(1)));
    assert_eq!(dev.get(Param::AcquisitionMode).unwrap(), 1);
  }
}

#[test]
fn enable_pattern_extremes() {
  let (sim, _, dev) = device();
  for pattern in [0xFFFF, 0x0000, 0xFFFF] {
    dev.set(Param::EnablePattern, pattern).unwrap();
    assert_eq!(dev.get(Param::EnablePattern).unwrap(), pattern);
    assert_eq!(sim.enable_pattern() as u32, pattern);
  }
}

#[test]
fn window_settings_do_not_disturb_each_other() {
  let (_, _, dev) = device();
  dev.set(Param::WindowWidth, 0x30).unwrap();
  dev.set(Param::WindowOffset, 0xFFE0).unwrap();
  dev.set(Param::ExtraSearchMargin, 0x0C).unwrap();
  dev.set(Param::RejectMargin, 0x06).unwrap();
  assert_eq!(dev.get(Param::WindowWidth).unwrap(), 0x30);
  assert_eq!(dev.get(Param::WindowOffset).unwrap(), 0xFFE0);
  assert_eq!(dev.get(Param::ExtraSearchMargin).unwrap(), 0x0C);
  assert_eq!(dev.get(Param::RejectMargin).unwrap(), 0x06);
}

#[test]
fn software_clear_bypasses_the_micro() {
  let (sim, _, dev) = device();
  sim.stall_after_opcode(true);
  // leave the micro hanging between opcode and operand
  assert!(matches!(dev.set(Param::WindowWidth, 0x20),
                   Err(RegisterError::Timeout { .. })));
  assert!(sim.micro_busy());
  sim.set_recording(true);
  dev.software_clear().unwrap();
  let journal = sim.journal();
  assert_eq!(journal.len(), 1);
  assert!(journal[0].is_write_to(&SOFTWARE_CLEAR));
  assert_eq!(sim.software_clears(), 1);
  assert!(!sim.micro_busy());
  // and the micro takes commands again
  sim.stall_after_opcode(false);
  dev.set(Param::WindowWidth, 0x20).unwrap();
  assert_eq!(dev.get(Param::WindowWidth).unwrap(), 0x20);
}

#[test]
fn timeout_consumes_exact_budget() {
  let (sim, _, dev) = device();
  sim.set_read_ok_delay(u32::MAX);
  let before = sim.handshake_polls();
  let result = dev.get(Param::EnablePattern);
  assert_eq!(result, Err(RegisterError::Timeout { opcode : OP_READ_EN_PATTERN.code,
                                                  leg    : v1290_lib::errors::HandshakeLeg::Reply }));
  // one poll to write the opcode, the full budget for the reply
  assert_eq!(sim.handshake_polls() - before, 1 + fast_policy().max_attempts as u64);
}

#[test]
fn slow_micro_within_budget() {
  let (sim, _, dev) = device();
  sim.set_write_ok_delay(20);
  sim.set_read_ok_delay(20);
  dev.set(Param::EnablePattern, 0x0F0F).unwrap();
  assert_eq!(dev.get(Param::EnablePattern).unwrap(), 0x0F0F);
  assert_eq!(sim.protocol_errors(), 0);
}

#[test]
fn invalid_requests() {
  let (sim, sink, dev) = device();
  sim.set_recording(true);
  for param in [Param::SoftwareClear, Param::SoftwareTrigger, Param::ModuleReset] {
    assert_eq!(dev.get(param), Err(RegisterError::InvalidParameter));
  }
  for param in [Param::Status, Param::FirmwareRev, Param::MicroRev, Param::EventCounter, Param::EventStored] {
    assert_eq!(dev.set(param, 0), Err(RegisterError::InvalidParameter));
  }
  assert_eq!(dev.set(Param::EnablePattern, 0x1_0000),
             Err(RegisterError::ValueOutOfRange { value : 0x1_0000, width : 16 }));
  assert!(sim.journal().is_empty());
  assert!(sink.updates().is_empty());
}

#[test]
fn bus_fault_is_returned_unchanged() {
  let (sim, _, dev) = device();
  sim.inject_faults(&TESTREG, 1);
  assert_eq!(dev.get(Param::TestReg), Err(RegisterError::BusFault { offset : TESTREG.offset }));
  assert!(dev.get(Param::TestReg).is_ok());
  sim.inject_faults(&MICRO_HANDSHAKE, 1);
  assert_eq!(dev.set(Param::WindowWidth, 1),
             Err(RegisterError::BusFault { offset : MICRO_HANDSHAKE.offset }));
}

#[test]
fn poll_fault_publishes_unknown_then_recovers() {
  let (sim, sink, dev) = device();
  sim.set_status(STAT_DATA_READY);
  sim.inject_faults(&STATUS, 1);
  assert!(dev.poll_status().is_err());
  let status = dev.poll_status().unwrap();
  assert!(status.data_ready());
  assert_eq!(sink.readings(Param::Status),
             vec![Reading::Unknown, Reading::Value(status.0 as u32)]);
}

#[test]
fn software_trigger_counts_events() {
  let (_, _, dev) = device();
  dev.software_clear().unwrap();
  dev.set(Param::SoftwareTrigger, 1).unwrap();
  dev.set(Param::SoftwareTrigger, 1).unwrap();
  assert_eq!(dev.get(Param::EventCounter).unwrap(), 2);
  assert_eq!(dev.get(Param::EventStored).unwrap(), 2);
  dev.software_clear().unwrap();
  assert_eq!(dev.get(Param::EventStored).unwrap(), 0);
}

#[test]
fn module_reset_restores_defaults() {
  let (sim, _, dev) = device();
  dev.set(Param::EnablePattern, 0x0001).unwrap();
  dev.set(Param::Control, 0x0040).unwrap();
  dev.set(Param::ModuleReset, 1).unwrap();
  assert_eq!(sim.enable_pattern(), 0xFFFF);
  assert_eq!(dev.get(Param::Control).unwrap(), CTRL_BERR_EN as u32);
}

#[test]
fn configure_from_settings() {
  let (sim, _, dev) = device();
  let mut acq = AcquisitionSettings::new();
  acq.acquisition_mode = 1;
  acq.window_width     = 0x40;
  acq.reject_margin    = Some(3);
  dev.configure(&acq).unwrap();
  assert!(sim.trigger_matching());
  assert_eq!(dev.get(Param::WindowWidth).unwrap(), 0x40);
  assert_eq!(dev.get(Param::RejectMargin).unwrap(), 3);
  acq.edge_detect_mode = 7;
  assert!(matches!(dev.configure(&acq), Err(RegisterError::ValueOutOfRange { .. })));
}

/// Check that no STATUS read ever lands between an opcode
/// and its operand, or between an opcode and its reply
fn assert_no_interleaving(journal : &[Transaction]) {
  let mut words_left = 0usize;
  let mut in_command : Option<u16> = None;
  for tr in journal {
    match tr {
      Transaction::Write { offset, value, .. } if *offset == MICRO.offset => {
        if words_left > 0 {
          words_left -= 1;
        } else {
          let op = opcode_by_code(*value as u16).expect("unknown opcode on the bus");
          words_left = op.operand as usize + op.reply_words;
          in_command = Some(op.code);
        }
      }
      Transaction::Read { offset, .. } if *offset == MICRO.offset => {
        assert!(words_left > 0, "reply read without command");
        words_left -= 1;
      }
      Transaction::Read { offset, .. } if *offset == STATUS.offset => {
        assert_eq!(words_left, 0, "status read inside command {:?}", in_command);
      }
      _ => ()
    }
    if words_left == 0 {
      in_command = None;
    }
  }
  assert_eq!(words_left, 0);
}

#[test]
fn concurrent_set_and_poll_do_not_interleave() {
  let (sim, sink, dev) = device();
  sim.set_write_ok_delay(3);
  sim.set_read_ok_delay(2);
  sim.set_recording(true);
  let tc = Arc::new(Mutex::new(ThreadControl::new()));
  thread::scope(|s| {
    let dev       = &dev;
    let tc_poller = tc.clone();
    let poller    = s.spawn(move || status_poller(dev, Duration::from_micros(200), tc_poller));
    let mut setters = Vec::new();
    for k in 0..3u32 {
      setters.push(s.spawn(move || {
        for i in 0..40u32 {
          let width = (k * 100 + i) & 0xFFF;
          dev.set(Param::WindowWidth, width).unwrap();
          dev.get(Param::WindowOffset).unwrap();
          dev.set(Param::EnablePattern, width).unwrap();
        }
      }));
    }
    for setter in setters {
      setter.join().unwrap();
    }
    tc.lock().unwrap().stop_flag = true;
    poller.join().unwrap();
  });
  assert!(tc.lock().unwrap().n_status_polls > 0);
  assert!(!sink.readings(Param::Status).is_empty());
  assert_eq!(sim.protocol_errors(), 0);
  assert_no_interleaving(&sim.journal());
}

/// Takes its time to publish an enable pattern of 0x1
#[derive(Default)]
struct SlowSink {
  updates : Mutex<Vec<(Param, Reading)>>,
}

impl SlowSink {
  fn last(&self, param : Param) -> Option<Reading> {
    self.updates.lock().unwrap().iter().rev().find(|(p, _)| *p == param).map(|(_, r)| *r)
  }
}

impl ParameterSink for SlowSink {
  fn register(&self, _name : &str, _kind : ParamKind) {}

  fn publish(&self, param : Param, reading : Reading) {
    if param == Param::EnablePattern && reading == Reading::Value(0x1) {
      thread::sleep(Duration::from_millis(100));
    }
    self.updates.lock().unwrap().push((param, reading));
  }
}

#[test]
fn published_values_follow_bus_order() {
  let sim  = SimulatedBus::new();
  let sink = Arc::new(SlowSink::default());
  let dev  = V1290::new(sim.clone(), fast_policy(), sink.clone());
  thread::scope(|s| {
    let dev    = &dev;
    let first  = s.spawn(move || dev.set(Param::EnablePattern, 0x1).unwrap());
    thread::sleep(Duration::from_millis(20));
    let second = s.spawn(move || dev.set(Param::EnablePattern, 0x2).unwrap());
    first.join().unwrap();
    second.join().unwrap();
  });
  assert_eq!(sim.enable_pattern(), 0x2);
  assert_eq!(sink.last(Param::EnablePattern), Some(Reading::Value(0x2)));
}

#[test]
fn log_sink_as_device_sink() {
  let sim = SimulatedBus::new();
  let dev = V1290::new(sim.clone(), fast_policy(), Arc::new(LogSink::default()));
  dev.set(Param::WindowWidth, 0x20).unwrap();
  assert_eq!(dev.get(Param::WindowWidth).unwrap(), 0x20);
  assert!(dev.poll_status().is_ok());
  assert_eq!(sim.protocol_errors(), 0);
}

#[test]
fn initialize_as_configured() {
  let sim          = SimulatedBus::new();
  let sink         = Arc::new(MemorySink::new());
  let mut settings = V1290Settings::new();
  settings.handshake_max_attempts = 10;
  settings.handshake_interval_us  = 1;
  let dev = V1290::from_settings(sim.clone(), &settings, sink.clone());
  assert_eq!(dev.policy().max_attempts, 10);
  let rev = dev.initialize(settings.clear_on_init).unwrap();
  assert_eq!(sim.software_clears(), 1);
  assert_eq!(rev as u32, sim.register(&FIRMWARE_REV));
}

#[test]
fn dump_reads_everything_readable() {
  let (_, _, dev) = device();
  let dump = dev.dump();
  let n_readable = dev.params().filter(|d| d.readable()).count();
  assert_eq!(dump.len(), n_readable);
  assert!(dump.iter().all(|(_, r)| r.is_ok()));
  assert!(dump.iter().all(|(p, _)| *p != Param::SoftwareClear));
}

#[test]
fn write_and_read_config_file() {
  let mut settings = V1290Settings::new();
  settings.base_address = 0x0012_0000;
  settings.clear_on_init = false;
  settings.acquisition = Some(AcquisitionSettings::new());
  println!("{}", settings);
  let path = std::env::temp_dir().join(format!("v1290-config-test-{}", std::process::id()));
  let name = path.to_string_lossy().to_string();
  settings.to_toml(name.clone()).unwrap();
  let back = V1290Settings::from_toml(name + ".toml").unwrap();
  assert_eq!(back, settings);
}
