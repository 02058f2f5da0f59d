//! Print every readable register of the V1290
//!
//! Goes around the microcontroller and the device handle,
//! each register is read exactly once with its own width.
//! MICRO and the data FIFOs are not read, that would take
//! replies or events away from whoever is waiting for them.

#[macro_use] extern crate log;

use std::process::exit;

use clap::Parser;
use colored::Colorize;

use v1290_lib::init_env_logger;
use v1290_lib::commands::parse_u64;
use v1290_lib::memory::{map_device,
                        read_all_registers,
                        MmioSpan,
                        RegisterBus,
                        DEV_MEM};
use v1290_lib::registers::{StatusWord,
                           STATUS,
                           WINDOW_LEN};
use v1290_lib::sim::SimulatedBus;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
  /// Physical base address of the VME window
  #[arg(long, value_parser = parse_u64, default_value = "0x32130000")]
  base_address : u64,
  #[arg(long, default_value_t = String::from(DEV_MEM))]
  addr_space   : String,
  /// Read from a simulated board
  #[arg(long, default_value_t = false)]
  simulate     : bool,
}

fn dump_registers<B: RegisterBus>(bus : &mut B) {
  for (reg, result) in read_all_registers(bus) {
    match result {
      Err(err) => {
        println!("{:<22} {:#06x} : {}", reg.name, reg.offset, format!("{}", err).red());
      }
      Ok(value) => {
        println!("{:<22} {:#06x} : {:#010x}", reg.name, reg.offset, value);
        if *reg == STATUS {
          println!("{}", StatusWord(value as u16));
        }
      }
    }
  }
}

fn main() {
  init_env_logger();
  let args = Args::parse();
  if args.simulate {
    dump_registers(&mut SimulatedBus::new());
    return;
  }
  match map_device(&args.addr_space, args.base_address, WINDOW_LEN) {
    Err(err) => {
      error!("Unable to map the board at {:#x}! {}", args.base_address, err);
      exit(1);
    }
    Ok(mut mapping) => {
      let mut span = MmioSpan::new(&mut mapping);
      dump_registers(&mut span);
    }
  }
}
