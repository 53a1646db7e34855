//! This module provides the emulated DOS: INT 20h program termination and
//! the INT 21h services guests call for console I/O, handle-based file
//! I/O, process control and strings.
//!
//! Every service follows the DOS convention: on success the carry flag is
//! cleared and AX carries the result; on failure the carry flag is set and
//! AX carries a canonical error code. A failing service additionally
//! returns a host-side error so the dispatcher can log what happened —
//! the guest keeps running either way.

mod files;

pub use files::{Channel, FileHandles, MAX_HANDLES};

use crate::cpu::{addr, Cpu, Off, Seg};
use crate::error::Error;
use bitflags::bitflags;
use log::{debug, warn};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use unicorn_engine::{RegisterX86, Unicorn};

/// Canonical DOS error codes, as returned in AX with the carry flag set.
pub mod errno {
    pub const INVALID_FUNCTION: u16 = 0x01;
    pub const FILE_NOT_FOUND: u16 = 0x02;
    pub const TOO_MANY_OPEN_FILES: u16 = 0x04;
    pub const ACCESS_DENIED: u16 = 0x05;
    pub const INVALID_HANDLE: u16 = 0x06;
    pub const SEEK_FAULT: u16 = 0x19;
    pub const WRITE_FAULT: u16 = 0x1D;
    pub const READ_FAULT: u16 = 0x1E;
    pub const GENERAL_FAILURE: u16 = 0x1F;
    pub const INVALID_PARAMETER: u16 = 0x57;
}

/// Guest strings longer than a segment are refused.
pub const STRING_LIMIT: usize = 0x10000;

/// The version INT 21h/AH=30h reports: DOS 7.0.
const DOS_VERSION: u16 = 0x0007;

bitflags! {
    /// IOCTL "get device information" bits for character devices.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct DeviceInfo: u16 {
        const STDIN     = 1 << 0;
        const STDOUT    = 1 << 1;
        const NUL       = 1 << 2;
        const CLOCK     = 1 << 3;
        const IS_DEVICE = 1 << 7;
    }
}

/// INT 21h services, dispatched on AH.
#[derive(Clone, Copy, Debug, Eq, FromPrimitive, PartialEq)]
enum Service {
    Terminate = 0x00,
    ConsoleInput = 0x01,
    ConsoleOutput = 0x02,
    PrintString = 0x09,
    BufferedInput = 0x0A,
    GetVersion = 0x30,
    Create = 0x3C,
    Open = 0x3D,
    Close = 0x3E,
    Read = 0x3F,
    Write = 0x40,
    Delete = 0x41,
    Seek = 0x42,
    Ioctl = 0x44,
    TerminateWithCode = 0x4C,
}

/// The emulated DOS: the per-guest file-handle table, the buffered
/// console, and the exit code of a guest that has terminated.
pub struct Dos {
    files: FileHandles,
    stdin: Box<dyn BufRead>,
    stdout: Box<dyn Write>,
    exit_code: Option<u8>,
}

impl Dos {
    /// Creates a DOS layer on the process's standard streams.
    pub fn new() -> Self {
        Self::with_console(
            Box::new(BufReader::new(io::stdin())),
            Box::new(BufWriter::new(io::stdout())),
        )
    }

    /// Creates a DOS layer over caller-provided console streams, which is
    /// how tests capture guest output.
    pub fn with_console(stdin: Box<dyn BufRead>, stdout: Box<dyn Write>) -> Self {
        Self {
            files: FileHandles::new(),
            stdin,
            stdout,
            exit_code: None,
        }
    }

    /// Returns the guest's exit code once it has terminated.
    pub fn exit_code(&self) -> Option<u8> {
        self.exit_code
    }

    /// INT 20h: terminate the guest.
    pub fn int20<D>(&mut self, uc: &mut Unicorn<'_, D>, _intr: u32) -> Result<(), Error> {
        self.terminate(uc, 0)
    }

    /// INT 21h: the DOS service entry point. Unknown subfunctions are
    /// logged and left alone, CF and AX untouched, which most real
    /// binaries tolerate.
    pub fn int21<D>(&mut self, uc: &mut Unicorn<'_, D>, intr: u32) -> Result<(), Error> {
        let ah = uc.reg8(RegisterX86::AH)?;
        let Some(service) = Service::from_u8(ah) else {
            warn!("int {:#04x}: unhandled subfunction AH={:#04x}", intr, ah);
            return Ok(());
        };

        match service {
            Service::Terminate => self.terminate(uc, 0),
            Service::ConsoleInput => self.console_input(uc),
            Service::ConsoleOutput => self.console_output(uc),
            Service::PrintString => self.print_string(uc),
            Service::BufferedInput => self.buffered_input(uc),
            Service::GetVersion => succeed(uc, DOS_VERSION),
            Service::Create => self.create(uc),
            Service::Open => self.open(uc),
            Service::Close => self.close(uc),
            Service::Read => self.read(uc),
            Service::Write => self.write(uc),
            Service::Delete => self.delete(uc),
            Service::Seek => self.seek(uc),
            Service::Ioctl => self.ioctl(uc),
            Service::TerminateWithCode => {
                let code = uc.reg8(RegisterX86::AL)?;
                self.terminate(uc, code)
            }
        }
    }

    fn terminate<D>(&mut self, uc: &mut Unicorn<'_, D>, code: u8) -> Result<(), Error> {
        debug!("terminate, exit code {}", code);
        self.stdout.flush()?;
        self.exit_code = Some(code);
        uc.emu_stop()?;
        Ok(())
    }

    /// AH=01h: read one byte from stdin with echo, returned in AL.
    fn console_input<D>(&mut self, uc: &mut Unicorn<'_, D>) -> Result<(), Error> {
        let mut byte = [0u8; 1];
        let n = self.stdin.read(&mut byte)?;
        if n > 0 {
            self.stdout.write_all(&byte)?;
            self.stdout.flush()?;
        }
        uc.set_reg8(RegisterX86::AL, if n > 0 { byte[0] } else { 0 })
    }

    /// AH=02h: write the character in DL.
    fn console_output<D>(&mut self, uc: &mut Unicorn<'_, D>) -> Result<(), Error> {
        let dl = uc.reg8(RegisterX86::DL)?;
        self.stdout.write_all(&[dl])?;
        self.stdout.flush()?;
        uc.set_reg8(RegisterX86::AL, dl)
    }

    /// AH=09h: write the `$`-terminated string at DS:DX.
    fn print_string<D>(&mut self, uc: &mut Unicorn<'_, D>) -> Result<(), Error> {
        let ds = uc.seg_reg(RegisterX86::DS)?;
        let dx = uc.reg16(RegisterX86::DX)?;
        let text = get_string_dollar(uc, ds, Off(dx))?;
        self.stdout.write_all(&text)?;
        self.stdout.flush()?;
        Ok(())
    }

    /// AH=0Ah: read a line into the buffer at DS:DX, whose first byte
    /// holds its capacity. The count lands at offset 1, the bytes from
    /// offset 2 on, CR-terminated.
    fn buffered_input<D>(&mut self, uc: &mut Unicorn<'_, D>) -> Result<(), Error> {
        let ds = uc.seg_reg(RegisterX86::DS)?;
        let dx = uc.reg16(RegisterX86::DX)?;
        let max = usize::from(uc.mem8(addr(ds, Off(dx)))?);
        if max == 0 {
            return Ok(());
        }

        let mut line = String::new();
        self.stdin.read_line(&mut line)?;
        let mut bytes = line.into_bytes();
        while matches!(bytes.last(), Some(b'\n' | b'\r')) {
            bytes.pop();
        }
        bytes.truncate(max - 1);

        uc.set_mem8(addr(ds, Off(dx.wrapping_add(1))), bytes.len() as u8)?;
        uc.write(ds, Off(dx.wrapping_add(2)), &bytes)?;
        let cr = dx.wrapping_add(2).wrapping_add(bytes.len() as u16);
        uc.set_mem8(addr(ds, Off(cr)), 0x0D)
    }

    /// AH=3Ch: create (or truncate) the file named at DS:DX.
    fn create<D>(&mut self, uc: &mut Unicorn<'_, D>) -> Result<(), Error> {
        let name = self.filename(uc)?;
        let attributes = uc.reg16(RegisterX86::CX)?;
        debug!("create '{}', attributes {:#06x}", name, attributes);

        match File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&name)
        {
            Ok(file) => match self.files.insert(file) {
                Some(handle) => succeed(uc, handle),
                None => fail(
                    uc,
                    errno::TOO_MANY_OPEN_FILES,
                    format!("create '{}': out of handles", name),
                ),
            },
            Err(e) => fail(uc, io_errno(&e), format!("create '{}': {}", name, e)),
        }
    }

    /// AH=3Dh: open the file named at DS:DX. The access mode comes from
    /// AL's low two bits: read, write, or both.
    fn open<D>(&mut self, uc: &mut Unicorn<'_, D>) -> Result<(), Error> {
        let name = self.filename(uc)?;
        let al = uc.reg8(RegisterX86::AL)?;
        debug!("open '{}', mode {:#04x}", name, al);

        let mut options = File::options();
        match al & 0x03 {
            0 => {
                options.read(true);
            }
            1 => {
                options.write(true);
            }
            2 => {
                options.read(true).write(true);
            }
            _ => {
                return fail(
                    uc,
                    errno::INVALID_PARAMETER,
                    format!("open '{}': bad access mode {:#04x}", name, al),
                )
            }
        }

        match options.open(&name) {
            Ok(file) => match self.files.insert(file) {
                Some(handle) => succeed(uc, handle),
                None => fail(
                    uc,
                    errno::TOO_MANY_OPEN_FILES,
                    format!("open '{}': out of handles", name),
                ),
            },
            Err(e) => fail(uc, io_errno(&e), format!("open '{}': {}", name, e)),
        }
    }

    /// AH=3Eh: close the handle in BX.
    fn close<D>(&mut self, uc: &mut Unicorn<'_, D>) -> Result<(), Error> {
        let handle = uc.reg16(RegisterX86::BX)?;
        match self.files.remove(handle) {
            Some(_) => succeed(uc, 0),
            None => fail(
                uc,
                errno::INVALID_HANDLE,
                format!("close: unknown handle {}", handle),
            ),
        }
    }

    /// AH=3Fh: read up to CX bytes from the handle in BX into DS:DX.
    fn read<D>(&mut self, uc: &mut Unicorn<'_, D>) -> Result<(), Error> {
        let handle = uc.reg16(RegisterX86::BX)?;
        let count = usize::from(uc.reg16(RegisterX86::CX)?);
        let ds = uc.seg_reg(RegisterX86::DS)?;
        let dx = uc.reg16(RegisterX86::DX)?;

        let mut buf = vec![0u8; count];
        let outcome = match self.files.get_mut(handle) {
            Some(Channel::File(file)) => file
                .read(&mut buf)
                .map_err(|e| (errno::READ_FAULT, format!("read handle {}: {}", handle, e))),
            Some(Channel::Stdin) => self
                .stdin
                .read(&mut buf)
                .map_err(|e| (errno::READ_FAULT, format!("read stdin: {}", e))),
            Some(_) => Err((
                errno::READ_FAULT,
                format!("handle {} is not readable", handle),
            )),
            None => Err((
                errno::INVALID_HANDLE,
                format!("read: unknown handle {}", handle),
            )),
        };

        match outcome {
            Ok(n) => {
                uc.write(ds, Off(dx), &buf[..n])?;
                succeed(uc, n as u16)
            }
            Err((code, reason)) => fail(uc, code, reason),
        }
    }

    /// AH=40h: write CX bytes from DS:DX to the handle in BX. CX=0
    /// truncates the file at its current position.
    fn write<D>(&mut self, uc: &mut Unicorn<'_, D>) -> Result<(), Error> {
        let handle = uc.reg16(RegisterX86::BX)?;
        let count = usize::from(uc.reg16(RegisterX86::CX)?);
        let ds = uc.seg_reg(RegisterX86::DS)?;
        let dx = uc.reg16(RegisterX86::DX)?;

        if count == 0 {
            let outcome = match self.files.get_mut(handle) {
                Some(Channel::File(file)) => file
                    .stream_position()
                    .and_then(|pos| file.set_len(pos))
                    .map_err(|e| {
                        (
                            errno::WRITE_FAULT,
                            format!("truncate handle {}: {}", handle, e),
                        )
                    }),
                Some(_) => Ok(()),
                None => Err((
                    errno::INVALID_HANDLE,
                    format!("write: unknown handle {}", handle),
                )),
            };
            return match outcome {
                Ok(()) => succeed(uc, 0),
                Err((code, reason)) => fail(uc, code, reason),
            };
        }

        let data = uc.mem(ds, Off(dx), count)?;
        let outcome: Result<(), (u16, String)> = match self.files.get_mut(handle) {
            Some(Channel::File(file)) => file
                .write_all(&data)
                .map_err(|e| (errno::WRITE_FAULT, format!("write handle {}: {}", handle, e))),
            Some(Channel::Stdout) => self
                .stdout
                .write_all(&data)
                .and_then(|_| self.stdout.flush())
                .map_err(|e| (errno::WRITE_FAULT, format!("write stdout: {}", e))),
            Some(Channel::Stderr) => io::stderr()
                .write_all(&data)
                .map_err(|e| (errno::WRITE_FAULT, format!("write stderr: {}", e))),
            Some(Channel::Stdin) => Err((errno::WRITE_FAULT, "stdin is not writable".into())),
            None => Err((
                errno::INVALID_HANDLE,
                format!("write: unknown handle {}", handle),
            )),
        };

        match outcome {
            Ok(()) => succeed(uc, count as u16),
            Err((code, reason)) => fail(uc, code, reason),
        }
    }

    /// AH=41h: delete the file named at DS:DX.
    fn delete<D>(&mut self, uc: &mut Unicorn<'_, D>) -> Result<(), Error> {
        let name = self.filename(uc)?;
        match fs::remove_file(&name) {
            Ok(()) => succeed(uc, 0),
            Err(e) => fail(uc, io_errno(&e), format!("delete '{}': {}", name, e)),
        }
    }

    /// AH=42h: seek the handle in BX. CX:DX is the 32-bit offset, AL the
    /// origin; the new position comes back in DX:AX.
    fn seek<D>(&mut self, uc: &mut Unicorn<'_, D>) -> Result<(), Error> {
        let al = uc.reg8(RegisterX86::AL)?;
        let handle = uc.reg16(RegisterX86::BX)?;
        let cx = uc.reg16(RegisterX86::CX)?;
        let dx = uc.reg16(RegisterX86::DX)?;

        let offset = ((u32::from(cx) << 16) | u32::from(dx)) as i32;
        let from = match al {
            0 => SeekFrom::Start((u64::from(cx) << 16) | u64::from(dx)),
            1 => SeekFrom::Current(i64::from(offset)),
            2 => SeekFrom::End(i64::from(offset)),
            _ => {
                return fail(
                    uc,
                    errno::INVALID_FUNCTION,
                    format!("seek: bad origin {:#04x}", al),
                )
            }
        };

        let outcome = match self.files.get_mut(handle) {
            Some(Channel::File(file)) => file
                .seek(from)
                .map_err(|e| (errno::SEEK_FAULT, format!("seek handle {}: {}", handle, e))),
            Some(_) => Err((
                errno::SEEK_FAULT,
                format!("handle {} is not seekable", handle),
            )),
            None => Err((
                errno::INVALID_HANDLE,
                format!("seek: unknown handle {}", handle),
            )),
        };

        match outcome {
            Ok(pos) => {
                uc.set_reg16(RegisterX86::DX, (pos >> 16) as u16)?;
                succeed(uc, (pos & 0xFFFF) as u16)
            }
            Err((code, reason)) => fail(uc, code, reason),
        }
    }

    /// AH=44h, AL=00h: get device information for the handle in BX.
    fn ioctl<D>(&mut self, uc: &mut Unicorn<'_, D>) -> Result<(), Error> {
        let al = uc.reg8(RegisterX86::AL)?;
        if al != 0 {
            warn!("int 21h: unhandled IOCTL subfunction AL={:#04x}", al);
            return Ok(());
        }

        let handle = uc.reg16(RegisterX86::BX)?;
        let info = match self.files.get(handle) {
            Some(Channel::Stdin) => (DeviceInfo::IS_DEVICE | DeviceInfo::STDIN).bits(),
            Some(Channel::Stdout) | Some(Channel::Stderr) => {
                (DeviceInfo::IS_DEVICE | DeviceInfo::STDOUT).bits()
            }
            Some(Channel::File(_)) => 0x0002,
            None => {
                return fail(
                    uc,
                    errno::INVALID_HANDLE,
                    format!("ioctl: unknown handle {}", handle),
                )
            }
        };

        uc.set_reg16(RegisterX86::DX, info)?;
        succeed(uc, info)
    }

    /// Reads the NUL-terminated filename at DS:DX.
    fn filename<D>(&mut self, uc: &mut Unicorn<'_, D>) -> Result<String, Error> {
        let ds = uc.seg_reg(RegisterX86::DS)?;
        let dx = uc.reg16(RegisterX86::DX)?;
        let bytes = get_string(uc, ds, Off(dx))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl Default for Dos {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads the NUL-terminated guest string at `seg:off`.
pub fn get_string<D>(uc: &mut Unicorn<'_, D>, seg: Seg, off: Off) -> Result<Vec<u8>, Error> {
    read_until(uc, seg, off, 0)
}

/// Reads the `$`-terminated guest string at `seg:off`.
pub fn get_string_dollar<D>(uc: &mut Unicorn<'_, D>, seg: Seg, off: Off) -> Result<Vec<u8>, Error> {
    read_until(uc, seg, off, b'$')
}

fn read_until<D>(
    uc: &mut Unicorn<'_, D>,
    seg: Seg,
    off: Off,
    terminator: u8,
) -> Result<Vec<u8>, Error> {
    let mut bytes = Vec::new();
    let mut cursor = off.0;
    loop {
        let b = uc.mem8(addr(seg, Off(cursor)))?;
        cursor = cursor.wrapping_add(1);
        if b == terminator {
            return Ok(bytes);
        }
        bytes.push(b);
        if bytes.len() > STRING_LIMIT {
            return Err(Error::StringOverflow {
                seg: seg.0,
                off: off.0,
            });
        }
    }
}

/// Reports success to the guest: carry clear, AX = `ax`.
fn succeed<D>(uc: &mut Unicorn<'_, D>, ax: u16) -> Result<(), Error> {
    uc.set_reg16(RegisterX86::AX, ax)?;
    uc.set_carry(false)
}

/// Reports failure to the guest (carry set, AX = `code`) and hands the
/// dispatcher a descriptive error for its log.
fn fail<D>(uc: &mut Unicorn<'_, D>, code: u16, reason: String) -> Result<(), Error> {
    uc.set_reg16(RegisterX86::AX, code)?;
    uc.set_carry(true)?;
    Err(Error::Dos { code, reason })
}

fn io_errno(e: &io::Error) -> u16 {
    match e.kind() {
        io::ErrorKind::NotFound => errno::FILE_NOT_FOUND,
        io::ErrorKind::PermissionDenied => errno::ACCESS_DENIED,
        _ => errno::GENERAL_FAILURE,
    }
}
