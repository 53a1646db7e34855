//! This module classifies and decodes the executable varieties DOS knows
//! about: MZ EXE files with a relocation table, flat COM files, and raw
//! binary images.

use crate::error::Error;
use scroll::Pread;
use std::fs;
use std::path::Path;

/// `MZ`, read as a little-endian word.
pub const DOS_MAGIC: u16 = 0x5A4D;
/// The byte-swapped `ZM` variant some early linkers emitted.
pub const DOS_MAGIC_SWAPPED: u16 = 0x4D5A;

/// Size of the fixed part of the MZ header.
const MZ_HEADER_SIZE: usize = 28;

/// The executable varieties the loader understands.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EType {
    /// Flat binary loaded at `base:0x100` behind a PSP.
    Com,
    /// Relocatable MZ executable.
    Exe,
    /// Raw image loaded flat at `base:0`.
    Image,
}

/// One entry of the MZ relocation table: the far address of a word that
/// must be fixed up with the load segment.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Relocation {
    pub segment: u16,
    pub offset: u16,
}

/// The interesting fields of the MZ header, plus the decoded relocation
/// table. Field names follow the classic `e_*` header layout.
#[derive(Clone, Debug, Default)]
pub struct ExeHeader {
    /// `e_cblp`: bytes used in the file's last 512-byte page, 0 meaning
    /// the whole page.
    pub bytes_on_last_page: u16,
    /// `e_cp`: file size in 512-byte pages, last page included.
    pub pages_in_file: u16,
    /// `e_cparhdr`: header size in paragraphs; the image follows it.
    pub header_paragraphs: u16,
    /// `e_minalloc`: paragraphs required beyond the image.
    pub min_alloc: u16,
    /// `e_maxalloc`: paragraphs wanted beyond the image.
    pub max_alloc: u16,
    /// `e_ss`: initial SS, relative to the image start segment.
    pub ss: u16,
    /// `e_sp`: initial SP.
    pub sp: u16,
    /// `e_csum`: header checksum, unused by the loader.
    pub checksum: u16,
    /// `e_ip`: initial IP.
    pub ip: u16,
    /// `e_cs`: initial CS, relative to the image start segment.
    pub cs: u16,
    /// The decoded relocation table, in file order.
    pub relocations: Vec<Relocation>,
}

impl ExeHeader {
    /// Parses the MZ header and relocation table out of a whole file.
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        let mut offset = 0;
        let signature: u16 = bytes.gread_with(&mut offset, scroll::LE).map_err(|_| {
            Error::Malformed("cannot read MZ signature".into())
        })?;
        if signature != DOS_MAGIC && signature != DOS_MAGIC_SWAPPED {
            return Err(Error::Malformed(format!(
                "bad MZ signature {:#06x}",
                signature
            )));
        }

        let bytes_on_last_page = bytes.gread_with(&mut offset, scroll::LE)?;
        let pages_in_file = bytes.gread_with(&mut offset, scroll::LE)?;
        let relocation_count: u16 = bytes.gread_with(&mut offset, scroll::LE)?;
        let header_paragraphs = bytes.gread_with(&mut offset, scroll::LE)?;
        let min_alloc = bytes.gread_with(&mut offset, scroll::LE)?;
        let max_alloc = bytes.gread_with(&mut offset, scroll::LE)?;
        let ss = bytes.gread_with(&mut offset, scroll::LE)?;
        let sp = bytes.gread_with(&mut offset, scroll::LE)?;
        let checksum = bytes.gread_with(&mut offset, scroll::LE)?;
        let ip = bytes.gread_with(&mut offset, scroll::LE)?;
        let cs = bytes.gread_with(&mut offset, scroll::LE)?;
        let relocation_table: u16 = bytes.gread_with(&mut offset, scroll::LE)?;

        let mut relocations = Vec::with_capacity(usize::from(relocation_count));
        let mut offset = usize::from(relocation_table);
        for _ in 0..relocation_count {
            let entry_offset = bytes.gread_with(&mut offset, scroll::LE).map_err(|_| {
                Error::Malformed(format!(
                    "relocation table truncated at offset {:#x}",
                    offset
                ))
            })?;
            let entry_segment = bytes.gread_with(&mut offset, scroll::LE).map_err(|_| {
                Error::Malformed(format!(
                    "relocation table truncated at offset {:#x}",
                    offset
                ))
            })?;
            relocations.push(Relocation {
                segment: entry_segment,
                offset: entry_offset,
            });
        }

        Ok(Self {
            bytes_on_last_page,
            pages_in_file,
            header_paragraphs,
            min_alloc,
            max_alloc,
            ss,
            sp,
            checksum,
            ip,
            cs,
            relocations,
        })
    }

    /// Returns the byte range of the load image within the file: the
    /// header claims `e_cp` pages with `e_cblp` bytes used in the last
    /// one, and the image is whatever of that follows the header area.
    fn image_range(&self) -> Result<(usize, usize), Error> {
        let header_len = usize::from(self.header_paragraphs) * 16;
        let file_len = if self.bytes_on_last_page > 0 {
            usize::from(self.pages_in_file) * 512 - (512 - usize::from(self.bytes_on_last_page))
        } else {
            usize::from(self.pages_in_file) * 512
        };

        if file_len < header_len {
            return Err(Error::Malformed(format!(
                "image size underflows the header area ({:#x} < {:#x})",
                file_len, header_len
            )));
        }

        Ok((header_len, file_len - header_len))
    }
}

/// A decoded input file: its variety, its raw image bytes (for an EXE, the
/// payload following the header area), and the MZ header if there was one.
#[derive(Clone, Debug)]
pub struct Executable {
    pub etype: EType,
    pub data: Vec<u8>,
    pub hdr: Option<ExeHeader>,
}

impl Executable {
    /// Reads and decodes a file from disk.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let bytes = fs::read(path.as_ref())?;
        Self::decode(path.as_ref(), bytes)
    }

    /// Classifies and decodes file bytes. Files with the MZ magic are
    /// EXEs, files named `*.com` are COMs, and anything else is a raw
    /// image.
    pub fn decode(path: &Path, bytes: Vec<u8>) -> Result<Self, Error> {
        if bytes.len() >= MZ_HEADER_SIZE {
            let signature = u16::from_le_bytes([bytes[0], bytes[1]]);
            if signature == DOS_MAGIC || signature == DOS_MAGIC_SWAPPED {
                return Self::decode_exe(bytes);
            }
        }

        let is_com = path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("com"));
        if is_com {
            return Ok(Self::com(bytes));
        }

        Ok(Self {
            etype: EType::Image,
            data: bytes,
            hdr: None,
        })
    }

    /// Treats bytes as a COM program regardless of their name, which is
    /// how hex-encoded instruction streams come in.
    pub fn com(bytes: Vec<u8>) -> Self {
        Self {
            etype: EType::Com,
            data: bytes,
            hdr: None,
        }
    }

    fn decode_exe(bytes: Vec<u8>) -> Result<Self, Error> {
        let hdr = ExeHeader::parse(&bytes)?;
        let (start, len) = hdr.image_range()?;

        if start + len > bytes.len() {
            return Err(Error::Malformed(format!(
                "image runs past end of file ({:#x} + {:#x} > {:#x})",
                start,
                len,
                bytes.len()
            )));
        }

        Ok(Self {
            etype: EType::Exe,
            data: bytes[start..start + len].to_vec(),
            hdr: Some(hdr),
        })
    }

    /// Returns the paragraph count needed to host this program: image plus
    /// PSP plus the header's minimum allocation for an EXE, a full 64 KiB
    /// segment for a COM or raw image.
    pub fn segments_needed(&self) -> u16 {
        match (self.etype, &self.hdr) {
            (EType::Exe, Some(hdr)) => {
                let paragraphs = (self.data.len() as u32 + 15) / 16
                    + 0x10
                    + u32::from(hdr.min_alloc);
                paragraphs.try_into().unwrap_or(u16::MAX)
            }
            _ => 0x1000,
        }
    }
}
