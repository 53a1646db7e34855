//! This module provides the [`Emulator`] struct, a façade over the engine
//! that owns the guest address space, the default diagnostic hooks and the
//! interrupt dispatcher.
//!
//! Software interrupts are routed in two steps: a host handler registered
//! for the vector wins; otherwise the guest's own IVT entry is honored by
//! synthesizing the real-mode interrupt frame (FLAGS, CS, IP) on the guest
//! stack and jumping to the vector. A vector with neither aborts the run.

use crate::cpu::{Cpu, Off, Seg, SegOff};
use crate::error::Error;
use crate::mem;
use iced_x86::{Decoder, DecoderOptions, Formatter, NasmFormatter};
use log::{error, log_enabled, trace, warn, Level};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use unicorn_engine::unicorn_const::{Arch, HookType, MemType, Mode, Permission};
use unicorn_engine::{RegisterX86, Unicorn};

/// A host-side interrupt handler. Returning an error reports the failure
/// to the dispatcher's log; it does not stop the engine, since handlers
/// signal guest-visible failures through CF and AX.
pub type InterruptHandler =
    Box<dyn FnMut(&mut Unicorn<'static, ()>, u32) -> Result<(), Error> + 'static>;

/// Where an interrupt was routed.
enum Routing {
    /// A host handler serviced it.
    Host(Result<(), Error>),
    /// No host handler; the guest IVT decides.
    Ivt,
}

/// The `Emulator` struct owns an engine instance configured for 16-bit
/// real mode with the guest address space mapped, and dispatches guest
/// interrupts to registered host handlers or back into the guest.
pub struct Emulator {
    uc: Unicorn<'static, ()>,
    intrs: Rc<RefCell<HashMap<u32, InterruptHandler>>>,
    fault: Rc<RefCell<Option<Error>>>,
}

impl Emulator {
    /// Creates an engine for 16-bit real mode, maps the IVT page,
    /// conventional memory and the reserved video region, and installs
    /// the default hooks.
    pub fn new() -> Result<Self, Error> {
        let mut uc = Unicorn::new(Arch::X86, Mode::MODE_16)?;

        uc.mem_map(mem::LOW_START, mem::LOW_SIZE, Permission::ALL)?;
        uc.mem_map(
            mem::MAIN_START,
            (mem::MAIN_END - mem::MAIN_START) as usize,
            Permission::ALL,
        )?;
        uc.mem_map(
            mem::VIDEO_START,
            (mem::VIDEO_END - mem::VIDEO_START) as usize,
            Permission::ALL,
        )?;

        add_default_hooks(&mut uc)?;

        let intrs: Rc<RefCell<HashMap<u32, InterruptHandler>>> =
            Rc::new(RefCell::new(HashMap::new()));
        let fault: Rc<RefCell<Option<Error>>> = Rc::new(RefCell::new(None));

        {
            let intrs = Rc::clone(&intrs);
            let fault = Rc::clone(&fault);
            uc.add_intr_hook(move |uc, intr| {
                let routing = {
                    let mut table = intrs.borrow_mut();
                    match table.get_mut(&intr) {
                        Some(handler) => Routing::Host(handler(uc, intr)),
                        None => Routing::Ivt,
                    }
                };

                match routing {
                    Routing::Host(Ok(())) => {}
                    Routing::Host(Err(e)) => warn!("int {:#04x}: {}", intr, e),
                    Routing::Ivt => {
                        if let Err(e) = reflect(uc, intr) {
                            // Nothing can service this interrupt; stop and
                            // let `start` surface the error.
                            *fault.borrow_mut() = Some(e);
                            let _ = uc.emu_stop();
                        }
                    }
                }
            })?;
        }

        Ok(Self { uc, intrs, fault })
    }

    /// Registers a host handler for software interrupt `intr`, replacing
    /// any previous one.
    pub fn register<F>(&mut self, intr: u32, handler: F)
    where
        F: FnMut(&mut Unicorn<'static, ()>, u32) -> Result<(), Error> + 'static,
    {
        self.intrs.borrow_mut().insert(intr, Box::new(handler));
    }

    /// Runs the guest from `entry` until it terminates or faults.
    pub fn start(&mut self, entry: SegOff) -> Result<(), Error> {
        self.fault.borrow_mut().take();
        self.uc.emu_start(entry.addr(), mem::MAIN_END, 0, 0)?;

        match self.fault.borrow_mut().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Returns the underlying engine, for loading programs and inspecting
    /// guest state.
    pub fn engine_mut(&mut self) -> &mut Unicorn<'static, ()> {
        &mut self.uc
    }
}

/// Reflects an interrupt to the guest's IVT: reads the vector, pushes the
/// FLAGS/CS/IP return frame and jumps. The guest's `iret` pops the frame
/// in the opposite order.
fn reflect(uc: &mut Unicorn<'static, ()>, intr: u32) -> Result<(), Error> {
    let vector = uc.mem_seg_off(Seg(0), Off(intr as u16 * 4))?;
    if vector.seg.0 == 0 && vector.off.0 == 0 {
        return Err(Error::UnhandledInterrupt { intr });
    }

    trace!("int {:#04x}: reflecting to guest vector {}", intr, vector);

    uc.push_flags()?;
    let cs = uc.seg_reg(RegisterX86::CS)?;
    let ip = uc.reg16(RegisterX86::IP)?;
    uc.push16(cs.0)?;
    uc.push16(ip)?;
    uc.jump(vector)
}

/// Installs the diagnostic hooks every run carries: per-instruction IP
/// fixup and trace disassembly, memory-access tracing, and the
/// invalid-access reporter.
fn add_default_hooks(uc: &mut Unicorn<'static, ()>) -> Result<(), Error> {
    let mut formatter = NasmFormatter::new();
    uc.add_code_hook(0, u64::MAX, move |uc, address, size| {
        // The engine can enter a hook with IP still relative to the wrong
        // segment base; recompute it from the linear fetch address.
        let Ok(cs) = uc.seg_reg(RegisterX86::CS) else {
            return;
        };
        let ip = address.wrapping_sub(cs.base()) as u16;
        let _ = uc.set_reg16(RegisterX86::IP, ip);

        if log_enabled!(Level::Trace) {
            if let Ok(bytes) = uc.mem_read_as_vec(address, size as usize) {
                let mut decoder = Decoder::with_ip(16, &bytes, address, DecoderOptions::NONE);
                let inst = decoder.decode();
                let mut text = String::new();
                formatter.format(&inst, &mut text);
                trace!("code {:#07x}, {:#x}: '{}'", address, size, text);
            }
        }
    })?;

    uc.add_mem_hook(
        HookType::MEM_READ | HookType::MEM_WRITE,
        0,
        u64::MAX,
        |_uc, access, address, size, value| {
            if log_enabled!(Level::Trace) {
                let kind = if access == MemType::WRITE { "write" } else { "read" };
                trace!("mem {} @{:#07x}, {:#x} = {:#x}", kind, address, size, value);
            }
            true
        },
    )?;

    uc.add_mem_hook(
        HookType::MEM_INVALID,
        0,
        u64::MAX,
        |_uc, access, address, size, value| {
            let kind = match access {
                MemType::READ_UNMAPPED | MemType::READ_PROT => "invalid read",
                MemType::WRITE_UNMAPPED | MemType::WRITE_PROT => "invalid write",
                MemType::FETCH_UNMAPPED | MemType::FETCH_PROT => "invalid fetch",
                _ => "unknown memory error",
            };
            error!("{}: @{:#07x}, {:#x} = {:#x}", kind, address, size, value);
            // Refuse to paper over the access; the engine aborts the run.
            false
        },
    )?;

    Ok(())
}
