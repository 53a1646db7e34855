//! This module provides an `Error` type for the crate using the [`thiserror`] crate.
use thiserror::Error;
use unicorn_engine::unicorn_const::uc_error;

/// The `Error` type.
#[derive(Debug, Error)]
pub enum Error {
    /// The engine rejected a register or memory operation.
    #[error("engine fault: {0:?}")]
    Engine(uc_error),
    /// A software interrupt with no host handler and no guest IVT vector.
    #[error("unhandled interrupt {intr:#04x}")]
    UnhandledInterrupt { intr: u32 },
    /// An emulated service was called with a subfunction it does not provide.
    #[error("unhandled interrupt {intr:#04x} subfunction AH={ah:#04x}")]
    UnhandledSubfunction { intr: u32, ah: u8 },
    /// No free run of conventional memory is large enough.
    #[error("out of memory: no free run of {0:#x} paragraphs")]
    OutOfMemory(u16),
    /// The block handed to the memory manager was never allocated by it.
    #[error("block {start:#06x}..{end:#06x} is not allocated")]
    BlockNotAllocated { start: u16, end: u16 },
    /// A block cannot be resized in place. Carries the largest size the
    /// block could grow to, per the DOS reporting convention.
    #[error("cannot resize block to {requested:#x} paragraphs, largest available is {largest:#x}")]
    InsufficientMemory { requested: u16, largest: u16 },
    /// The input file does not decode as the executable type it claims.
    #[error("malformed executable: {0}")]
    Malformed(String),
    /// The executable carries no image bytes to load.
    #[error("executable has no image bytes")]
    ExecutableNotRead,
    /// An MZ relocation entry points outside the allocated program block.
    #[error("relocation {segment:#06x}:{offset:#06x} lands outside the program block")]
    RelocationOutOfRange { segment: u16, offset: u16 },
    /// A guest string ran past the 64 KiB segment limit without a terminator.
    #[error("guest string at {seg:#06x}:{off:#06x} exceeds 64 KiB")]
    StringOverflow { seg: u16, off: u16 },
    /// A DOS service failed; the guest already has CF set and AX = `code`.
    #[error("dos error {code:#04x}: {reason}")]
    Dos { code: u16, reason: String },
    /// Wraps [`std::io::Error`].
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Wraps an error that originates from any calls to the [`scroll`] crate.
    #[error(transparent)]
    Parse(#[from] scroll::Error),
}

// `uc_error` does not implement `std::error::Error`, so `#[from]` is out.
impl From<uc_error> for Error {
    fn from(e: uc_error) -> Self {
        Error::Engine(e)
    }
}
