//! The doorway crate runs legacy 16-bit real-mode DOS programs in user
//! space. More specifically, it gives each guest the illusion of an
//! IBM-PC-class machine: a 1 MiB address space, real-mode segmentation, an
//! interrupt vector table, and a minimal DOS/BIOS API implemented by the
//! host, all on top of the [Unicorn](https://www.unicorn-engine.org/)
//! instruction engine.
//!
//! The crate understands three executable varieties:
//!  * COM files, loaded flat at `base:0x100` behind a PSP.
//!  * MZ EXE files, with header parsing and segment relocation.
//!  * Raw binary images, loaded flat at `base:0`.

pub mod bios;
pub mod cpu;
pub mod dos;
pub mod emulator;
pub mod error;
pub mod exe;
pub mod loader;
pub mod mem;

pub use cpu::{addr, Cpu, Flags, Off, Seg, SegOff};
pub use dos::Dos;
pub use emulator::Emulator;
pub use error::Error;
pub use exe::{EType, Executable};
pub use loader::{load, LoadedProgram};
pub use mem::{MemBlock, MemoryManager};
