//! This module installs a decoded executable into guest memory: it builds
//! the Program Segment Prefix, places the image, applies MZ relocations
//! and seeds the registers each executable variety expects at entry.

use crate::cpu::{addr, Cpu, Off, Seg, SegOff};
use crate::error::Error;
use crate::exe::{EType, Executable};
use crate::mem::{MemBlock, MemoryManager};
use log::debug;
use unicorn_engine::{RegisterX86, Unicorn};

/// Size of the Program Segment Prefix.
pub const PSP_SIZE: usize = 0x100;

/// Paragraphs reserved for the default environment block.
pub const ENV_PARAGRAPHS: u16 = 10;

/// The default environment: a PATH on the emulated drive, then the empty
/// string that terminates the table.
const ENVIRONMENT: &[u8] = b"PATH=Z:\\\0\0";

/// Longest command tail a PSP can carry, terminator included.
const TAIL_LIMIT: usize = 126;

/// Where a program ended up: its allocation, its environment block, and
/// the CS:IP execution should start at.
#[derive(Clone, Copy, Debug)]
pub struct LoadedProgram {
    pub block: MemBlock,
    pub environment: MemBlock,
    pub entry: SegOff,
}

/// Builds the 256-byte PSP for a program whose allocation ends at
/// `end_seg`, with its environment at `env_seg` and `args` joined into the
/// command tail.
pub fn create_psp(end_seg: Seg, env_seg: Seg, args: &[String]) -> [u8; PSP_SIZE] {
    let mut psp = [0u8; PSP_SIZE];

    // INT 20h trampoline, so a `ret` to offset 0 terminates the program.
    psp[0] = 0xCD;
    psp[1] = 0x20;
    // First paragraph following this allocation.
    psp[2..4].copy_from_slice(&(end_seg.0 + 1).to_le_bytes());

    // INT 22h/23h/24h handler markers.
    psp[10] = 0x22;
    psp[14] = 0x23;
    psp[18] = 0x24;

    // 0xFFFE means no parent DOS process.
    psp[22..24].copy_from_slice(&0xFFFEu16.to_le_bytes());
    psp[44..46].copy_from_slice(&env_seg.0.to_le_bytes());

    // Command tail: a leading space per argument, CR-terminated, with the
    // length byte counting the terminator.
    let mut tail: Vec<u8> = Vec::new();
    for arg in args {
        tail.push(b' ');
        tail.extend_from_slice(arg.as_bytes());
    }
    tail.truncate(TAIL_LIMIT - 1);
    tail.push(0x0D);
    psp[0x50] = tail.len() as u8;
    psp[0x51..0x51 + tail.len()].copy_from_slice(&tail);

    psp
}

/// Installs `exe` into guest memory and seeds the registers. The
/// environment block is allocated first, then the program block, so a
/// freshly booted guest always sees its environment below itself.
pub fn load<D>(
    uc: &mut Unicorn<'_, D>,
    mm: &mut MemoryManager,
    exe: &Executable,
    args: &[String],
) -> Result<LoadedProgram, Error> {
    if exe.data.is_empty() {
        return Err(Error::ExecutableNotRead);
    }

    let environment = mm.allocate(ENV_PARAGRAPHS)?;
    uc.write(environment.start, Off(0), ENVIRONMENT)?;

    let block = mm.allocate(exe.segments_needed())?;
    debug!(
        "loading {:?}: {:#x} bytes at {}..{}, environment at {}",
        exe.etype,
        exe.data.len(),
        block.start,
        block.end,
        environment.start
    );

    let entry = match exe.etype {
        EType::Com => load_com(uc, &block, environment.start, exe, args)?,
        EType::Exe => load_exe(uc, &block, environment.start, exe, args)?,
        EType::Image => load_image(uc, &block, exe)?,
    };

    Ok(LoadedProgram {
        block,
        environment,
        entry,
    })
}

fn load_com<D>(
    uc: &mut Unicorn<'_, D>,
    block: &MemBlock,
    env_seg: Seg,
    exe: &Executable,
    args: &[String],
) -> Result<SegOff, Error> {
    let base = block.start;

    for reg in [
        RegisterX86::CS,
        RegisterX86::DS,
        RegisterX86::ES,
        RegisterX86::SS,
    ] {
        uc.set_reg16(reg, base.0)?;
    }
    uc.set_reg16(RegisterX86::SP, 0xFFFE)?;
    uc.set_reg16(RegisterX86::IP, 0x0100)?;

    uc.write(base, Off(0), &create_psp(block.end, env_seg, args))?;
    uc.write(base, Off(0x0100), &exe.data)?;

    Ok(SegOff {
        seg: base,
        off: Off(0x0100),
    })
}

fn load_exe<D>(
    uc: &mut Unicorn<'_, D>,
    block: &MemBlock,
    env_seg: Seg,
    exe: &Executable,
    args: &[String],
) -> Result<SegOff, Error> {
    let hdr = exe
        .hdr
        .as_ref()
        .ok_or_else(|| Error::Malformed("EXE without a decoded header".into()))?;

    let base = block.start;
    let img_start = base + 0x10;
    let cs = Seg(img_start.0.wrapping_add(hdr.cs));
    let ss = Seg(img_start.0.wrapping_add(hdr.ss));

    uc.set_reg16(RegisterX86::DS, base.0)?;
    uc.set_reg16(RegisterX86::ES, base.0)?;
    uc.set_reg16(RegisterX86::CS, cs.0)?;
    uc.set_reg16(RegisterX86::SS, ss.0)?;
    uc.set_reg16(RegisterX86::SP, hdr.sp)?;
    uc.set_reg16(RegisterX86::BP, 0)?;
    uc.set_reg16(RegisterX86::IP, hdr.ip)?;

    uc.write(base, Off(0), &create_psp(block.end, env_seg, args))?;
    uc.write(cs, Off(0), &exe.data)?;

    // Fix up every relocation word with the load segment, exactly once.
    let block_start = block.start.base();
    let block_end = block.end.base() + 16;
    for reloc in &hdr.relocations {
        let target = addr(Seg(img_start.0.wrapping_add(reloc.segment)), Off(reloc.offset));
        if target < block_start || target + 2 > block_end {
            return Err(Error::RelocationOutOfRange {
                segment: reloc.segment,
                offset: reloc.offset,
            });
        }
        let word = uc.mem16(target)?;
        uc.set_mem16(target, word.wrapping_add(img_start.0))?;
    }

    Ok(SegOff {
        seg: cs,
        off: Off(hdr.ip),
    })
}

fn load_image<D>(
    uc: &mut Unicorn<'_, D>,
    block: &MemBlock,
    exe: &Executable,
) -> Result<SegOff, Error> {
    let base = block.start;

    for reg in [
        RegisterX86::CS,
        RegisterX86::DS,
        RegisterX86::ES,
        RegisterX86::SS,
    ] {
        uc.set_reg16(reg, base.0)?;
    }
    uc.set_reg16(RegisterX86::SP, 0xFFFE)?;
    uc.set_reg16(RegisterX86::IP, 0)?;

    uc.write(base, Off(0), &exe.data)?;

    Ok(SegOff {
        seg: base,
        off: Off(0),
    })
}
