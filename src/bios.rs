//! This module provides the emulated BIOS services, currently the INT 1Ah
//! time-of-day counter.

use crate::cpu::Cpu;
use crate::error::Error;
use chrono::{Local, NaiveTime, Timelike};
use log::debug;
use unicorn_engine::{RegisterX86, Unicorn};

/// The PC/AT timer tick rate.
pub const TICK_HZ: f64 = 18.2065;

/// INT 1Ah: BIOS time services. AH=00h returns the ticks since local
/// midnight in CX:DX, high word in CX.
pub fn int1a<D>(uc: &mut Unicorn<'_, D>, intr: u32) -> Result<(), Error> {
    let ah = uc.reg8(RegisterX86::AH)?;
    match ah {
        0x00 => {
            let ticks = ticks_since_midnight(Local::now().time());
            debug!("int 1ah: clock read, {} ticks since midnight", ticks);
            uc.set_reg16(RegisterX86::DX, (ticks & 0xFFFF) as u16)?;
            uc.set_reg16(RegisterX86::CX, ((ticks >> 16) & 0xFFFF) as u16)
        }
        _ => Err(Error::UnhandledSubfunction { intr, ah }),
    }
}

fn ticks_since_midnight(now: NaiveTime) -> u64 {
    let seconds =
        f64::from(now.num_seconds_from_midnight()) + f64::from(now.nanosecond()) / 1e9;
    (seconds * TICK_HZ) as u64
}
