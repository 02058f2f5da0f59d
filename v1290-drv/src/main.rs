//! # Driver program for the CAEN V1290 TDC
//!
//! Maps the VME window of the board (or uses a simulated
//! board with --simulate) and either watches the board
//! status or gets/sets single parameters. Every parameter
//! value which is read or written is printed to stdout as
//! a json line (or logged with --no-json), all other
//! output goes to the log.

#[macro_use] extern crate log;

use std::io;
use std::process::exit;
use std::sync::{Arc,
                Mutex};
use std::sync::atomic::{AtomicBool,
                        Ordering};
use std::thread;
use std::time::Duration;

use clap::Parser;
use crossbeam_channel::unbounded;
use signal_hook::consts::SIGINT;

use v1290_lib::{init_env_logger,
                RegisterError,
                ThreadControl,
                V1290,
                V1290Settings};
use v1290_lib::commands::{parse_u64,
                          DrvCommand};
use v1290_lib::memory::{map_device,
                        MmioSpan,
                        RegisterBus};
use v1290_lib::monitoring::{json_publisher,
                            status_poller};
use v1290_lib::params::Param;
use v1290_lib::registers::StatusWord;
use v1290_lib::sim::SimulatedBus;
use v1290_lib::sink::{ChannelSink,
                      LogSink,
                      ParamUpdate,
                      ParameterSink};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
  /// A .toml config file, see write-config
  #[arg(short, long)]
  config       : Option<String>,
  /// Physical base address of the VME window, overrides
  /// the config file
  #[arg(long, value_parser = parse_u64)]
  base_address : Option<u64>,
  /// Device file to map, e.g. /dev/mem. Overrides the config file
  #[arg(long)]
  addr_space   : Option<String>,
  /// Don't touch any hardware, talk to a simulated board
  #[arg(long, default_value_t = false)]
  simulate     : bool,
  /// Send parameter updates to the log instead of
  /// printing them as json lines
  #[arg(long, default_value_t = false)]
  no_json      : bool,
  #[command(subcommand)]
  command      : DrvCommand,
}

fn run<B: RegisterBus + Send>(device         : &V1290<B>,
                              settings       : &V1290Settings,
                              interval       : Duration,
                              configure      : bool,
                              thread_control : Arc<Mutex<ThreadControl>>) -> Result<(), RegisterError> {
  device.initialize(settings.clear_on_init)?;
  if configure {
    if let Some(acq) = &settings.acquisition {
      device.configure(acq)?;
    }
  }
  let sigint = Arc::new(AtomicBool::new(false));
  match signal_hook::flag::register(SIGINT, Arc::clone(&sigint)) {
    Err(err) => error!("Unable to install SIGINT handler! {err}"),
    Ok(_)    => ()
  }
  thread::scope(|s| {
    let tc_poller = thread_control.clone();
    s.spawn(move || status_poller(device, interval, tc_poller));
    println!("=> Watching the board status every {:?}, press Ctrl+C to stop", interval);
    while !sigint.load(Ordering::Relaxed) {
      thread::sleep(Duration::from_millis(100));
    }
    info!("Received SIGINT, will stop the poller!");
    match thread_control.lock() {
      Ok(mut tc) => tc.stop_flag = true,
      Err(err)   => error!("Can't acquire lock! {err}"),
    }
  });
  Ok(())
}

fn drive<B: RegisterBus + Send>(bus            : B,
                                settings       : &V1290Settings,
                                command        : &DrvCommand,
                                sink           : Arc<dyn ParameterSink>,
                                thread_control : Arc<Mutex<ThreadControl>>) -> Result<(), RegisterError> {
  let device = V1290::from_settings(bus, settings, sink);
  debug!("{}", device);
  match command {
    DrvCommand::Run(cmd) => {
      let interval = cmd.poll_interval_ms
        .map(Duration::from_millis)
        .unwrap_or(settings.poll_interval());
      run(&device, settings, interval, !cmd.no_configure, thread_control)?;
    }
    DrvCommand::Get(cmd) => {
      let value = match cmd.mask {
        None       => device.get(cmd.param)?,
        Some(mask) => device.get_masked(cmd.param, mask)?,
      };
      if cmd.param == Param::Status {
        info!("{}", StatusWord(value as u16));
      }
    }
    DrvCommand::Set(cmd) => {
      match cmd.mask {
        None       => device.set(cmd.param, cmd.value)?,
        Some(mask) => device.set_masked(cmd.param, cmd.value, mask)?,
      }
    }
    DrvCommand::Dump => {
      for (param, result) in device.dump() {
        match result {
          Err(err) => error!("Unable to read {}! {}", param, err),
          Ok(_)    => ()
        }
      }
    }
    DrvCommand::WriteConfig(_) => ()
  }
  Ok(())
}

fn main() {
  init_env_logger();
  let args = Args::parse();

  let mut settings = match &args.config {
    None => V1290Settings::new(),
    Some(cfg_file) => {
      match V1290Settings::from_toml(cfg_file.clone()) {
        Err(err) => {
          error!("CRITICAL! Unable to parse .toml settings file! {}", err);
          exit(1);
        }
        Ok(cfg) => cfg
      }
    }
  };
  if let Some(base) = args.base_address {
    settings.base_address = base;
  }
  if let Some(addr_space) = &args.addr_space {
    settings.addr_space = addr_space.clone();
  }
  debug!("Using settings {}", settings);

  if let DrvCommand::WriteConfig(cmd) = &args.command {
    match settings.to_toml(cmd.filename.clone()) {
      Err(err) => {
        error!("Unable to write config! {}", err);
        exit(1);
      }
      Ok(_) => {
        println!("=> Wrote settings to {}", cmd.filename);
        exit(0);
      }
    }
  }

  let thread_control = Arc::new(Mutex::new(ThreadControl::new()));
  let mut publisher_thread = None;
  let sink : Arc<dyn ParameterSink> = if args.no_json {
    Arc::new(LogSink::default())
  } else {
    let (update_tx, update_rx) = unbounded::<ParamUpdate>();
    let tc_publisher = thread_control.clone();
    publisher_thread = Some(thread::spawn(move || {
      json_publisher(update_rx, &mut io::stdout(), tc_publisher)
    }));
    Arc::new(ChannelSink::new(update_tx))
  };

  let result = if args.simulate {
    warn!("Running with a simulated board, no hardware will be touched!");
    drive(SimulatedBus::new(), &settings, &args.command, sink, thread_control.clone())
  } else {
    match map_device(&settings.addr_space, settings.base_address, settings.window_len) {
      Err(err) => {
        drop(sink);
        Err(err)
      }
      Ok(mut mapping) => {
        let span = MmioSpan::new(&mut mapping);
        drive(span, &settings, &args.command, sink, thread_control.clone())
      }
    }
  };
  // the device is gone, so is the last sender
  if let Some(handle) = publisher_thread {
    match handle.join() {
      Err(_) => error!("Publisher thread panicked!"),
      Ok(_)  => ()
    }
  }
  match thread_control.lock() {
    Ok(tc)   => info!("{}", tc),
    Err(err) => error!("Can't acquire lock! {err}"),
  }
  match result {
    Err(err) => {
      error!("{}", err);
      exit(1);
    }
    Ok(_) => ()
  }
}
