// format.rs - MIMI container records
//
// A MIMI is a 68-byte little-endian header followed by the raw TEXT,
// RODATA and DATA section bytes, then `reloc_count` 12-byte relocation
// records, then `symbol_count` 24-byte symbol records. BSS is a size in
// the header only; the loader zero-fills it. Given the same input and
// symbol order the bytes are fully deterministic.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::err::ErrCode;

/// "MIMI" in little-endian.
pub const MAGIC: u32 = 0x494D_494D;
pub const VERSION: u8 = 1;

pub const HEADER_SIZE: u64 = 68;
pub const RELOC_SIZE: u64 = 12;
pub const SYMBOL_SIZE: u64 = 24;

/// Length of the name fields in the header and in symbol records,
/// including the NUL padding.
pub const NAME_LEN: usize = 16;

/// Target instruction set. The canonical Thumb value is `CortexM0Plus = 0`;
/// the generated code restricts itself to encodings valid on both M-profile
/// cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    CortexM0Plus = 0,
    CortexM33 = 1,
    RiscV = 2,
}

impl Arch {
    pub fn from_u8(v: u8) -> Option<Arch> {
        match v {
            0 => Some(Arch::CortexM0Plus),
            1 => Some(Arch::CortexM33),
            2 => Some(Arch::RiscV),
            _ => None,
        }
    }
}

/// Section identifiers used by symbols and relocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Null = 0,
    Text = 1,
    Rodata = 2,
    Data = 3,
    Bss = 4,
}

impl Section {
    pub fn from_u8(v: u8) -> Option<Section> {
        match v {
            0 => Some(Section::Null),
            1 => Some(Section::Text),
            2 => Some(Section::Rodata),
            3 => Some(Section::Data),
            4 => Some(Section::Bss),
            _ => None,
        }
    }
}

/// Symbol binding/kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymKind {
    Local = 0,
    Global = 1,
    Extern = 2,
    /// `value` holds the syscall number rather than a section offset.
    Syscall = 3,
}

impl SymKind {
    pub fn from_u8(v: u8) -> Option<SymKind> {
        match v {
            0 => Some(SymKind::Local),
            1 => Some(SymKind::Global),
            2 => Some(SymKind::Extern),
            3 => Some(SymKind::Syscall),
            _ => None,
        }
    }
}

/// Relocation kinds. `DataPtr` has `Abs32` semantics but patches a data
/// section instead of code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    Abs32 = 0,
    Rel32 = 1,
    ThumbCall = 2,
    ThumbBranch = 3,
    DataPtr = 4,
}

impl RelocKind {
    pub fn from_u8(v: u8) -> Option<RelocKind> {
        match v {
            0 => Some(RelocKind::Abs32),
            1 => Some(RelocKind::Rel32),
            2 => Some(RelocKind::ThumbCall),
            3 => Some(RelocKind::ThumbBranch),
            4 => Some(RelocKind::DataPtr),
            _ => None,
        }
    }
}

/// The fixed 68-byte container header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub flags: u8,
    pub arch: Arch,
    pub entry_offset: u32,
    pub text_size: u32,
    pub rodata_size: u32,
    pub data_size: u32,
    pub bss_size: u32,
    pub reloc_count: u32,
    pub symbol_count: u32,
    pub stack_request: u32,
    pub heap_request: u32,
    pub name: [u8; NAME_LEN],
}

impl Header {
    pub fn new(arch: Arch) -> Header {
        Header {
            flags: 0,
            arch,
            entry_offset: 0,
            text_size: 0,
            rodata_size: 0,
            data_size: 0,
            bss_size: 0,
            reloc_count: 0,
            symbol_count: 0,
            stack_request: 0,
            heap_request: 0,
            name: [0; NAME_LEN],
        }
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = pack_name(name);
    }

    pub fn name_str(&self) -> &str {
        unpack_name(&self.name)
    }

    /// File offset of the relocation table.
    pub fn reloc_offset(&self) -> u64 {
        HEADER_SIZE
            + self.text_size as u64
            + self.rodata_size as u64
            + self.data_size as u64
    }

    /// File offset of the symbol table.
    pub fn symbol_offset(&self) -> u64 {
        self.reloc_offset() + self.reloc_count as u64 * RELOC_SIZE
    }

    /// Structural checks applied before any section is read. `arch` is the
    /// instruction set of the running target.
    pub fn validate(&self, arch: Arch) -> Result<(), ErrCode> {
        if self.arch != arch {
            return Err(ErrCode::Noexec);
        }
        if self.text_size == 0 || self.entry_offset >= self.text_size {
            return Err(ErrCode::Inval);
        }
        Ok(())
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(MAGIC)?;
        w.write_u8(VERSION)?;
        w.write_u8(self.flags)?;
        w.write_u8(self.arch as u8)?;
        w.write_u8(0)?;
        w.write_u32::<LittleEndian>(self.entry_offset)?;
        w.write_u32::<LittleEndian>(self.text_size)?;
        w.write_u32::<LittleEndian>(self.rodata_size)?;
        w.write_u32::<LittleEndian>(self.data_size)?;
        w.write_u32::<LittleEndian>(self.bss_size)?;
        w.write_u32::<LittleEndian>(self.reloc_count)?;
        w.write_u32::<LittleEndian>(self.symbol_count)?;
        w.write_u32::<LittleEndian>(self.stack_request)?;
        w.write_u32::<LittleEndian>(self.heap_request)?;
        w.write_all(&self.name)?;
        w.write_u32::<LittleEndian>(0)?;
        w.write_u32::<LittleEndian>(0)?;
        Ok(())
    }

    /// Reads and structurally decodes a header. Bad magic or version is
    /// `Noexec`; an unknown arch byte is `Noexec`; a short read is
    /// `Corrupt`.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Header, ErrCode> {
        let magic = r.read_u32::<LittleEndian>().map_err(|_| ErrCode::Corrupt)?;
        if magic != MAGIC {
            return Err(ErrCode::Noexec);
        }
        let version = r.read_u8().map_err(|_| ErrCode::Corrupt)?;
        if version != VERSION {
            return Err(ErrCode::Noexec);
        }
        let flags = r.read_u8().map_err(|_| ErrCode::Corrupt)?;
        let arch_raw = r.read_u8().map_err(|_| ErrCode::Corrupt)?;
        let arch = Arch::from_u8(arch_raw).ok_or(ErrCode::Noexec)?;
        r.read_u8().map_err(|_| ErrCode::Corrupt)?;

        let mut words = [0u32; 9];
        for w in words.iter_mut() {
            *w = r.read_u32::<LittleEndian>().map_err(|_| ErrCode::Corrupt)?;
        }
        let mut name = [0u8; NAME_LEN];
        r.read_exact(&mut name).map_err(|_| ErrCode::Corrupt)?;
        // Reserved words.
        r.read_u32::<LittleEndian>().map_err(|_| ErrCode::Corrupt)?;
        r.read_u32::<LittleEndian>().map_err(|_| ErrCode::Corrupt)?;

        Ok(Header {
            flags,
            arch,
            entry_offset: words[0],
            text_size: words[1],
            rodata_size: words[2],
            data_size: words[3],
            bss_size: words[4],
            reloc_count: words[5],
            symbol_count: words[6],
            stack_request: words[7],
            heap_request: words[8],
            name,
        })
    }
}

/// A 24-byte symbol record. `size` occupies what the reference layout
/// leaves as padding; it records the definition's byte size so the linker
/// can lay out concatenated BSS. Readers that skip it see an identical
/// record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: [u8; NAME_LEN],
    pub value: u32,
    pub section: Section,
    pub kind: SymKind,
    pub size: u16,
}

impl Symbol {
    pub fn new(name: &str, kind: SymKind, section: Section, value: u32) -> Symbol {
        Symbol {
            name: pack_name(name),
            value,
            section,
            kind,
            size: 0,
        }
    }

    pub fn name_str(&self) -> &str {
        unpack_name(&self.name)
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.name)?;
        w.write_u32::<LittleEndian>(self.value)?;
        w.write_u8(self.section as u8)?;
        w.write_u8(self.kind as u8)?;
        w.write_u16::<LittleEndian>(self.size)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Symbol, ErrCode> {
        let mut name = [0u8; NAME_LEN];
        r.read_exact(&mut name).map_err(|_| ErrCode::Corrupt)?;
        let value = r.read_u32::<LittleEndian>().map_err(|_| ErrCode::Corrupt)?;
        let section = Section::from_u8(r.read_u8().map_err(|_| ErrCode::Corrupt)?)
            .ok_or(ErrCode::Corrupt)?;
        let kind = SymKind::from_u8(r.read_u8().map_err(|_| ErrCode::Corrupt)?)
            .ok_or(ErrCode::Corrupt)?;
        let size = r.read_u16::<LittleEndian>().map_err(|_| ErrCode::Corrupt)?;
        Ok(Symbol {
            name,
            value,
            section,
            kind,
            size,
        })
    }
}

/// A 12-byte relocation record. `offset` is relative to the start of
/// `section`; `symbol` indexes the container's symbol table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reloc {
    pub offset: u32,
    pub section: Section,
    pub kind: RelocKind,
    pub symbol: u32,
}

impl Reloc {
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.offset)?;
        w.write_u16::<LittleEndian>(self.section as u16)?;
        w.write_u8(self.kind as u8)?;
        w.write_u8(0)?;
        w.write_u32::<LittleEndian>(self.symbol)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Reloc, ErrCode> {
        let offset = r.read_u32::<LittleEndian>().map_err(|_| ErrCode::Corrupt)?;
        let section_raw = r.read_u16::<LittleEndian>().map_err(|_| ErrCode::Corrupt)?;
        let section = u8::try_from(section_raw)
            .ok()
            .and_then(Section::from_u8)
            .ok_or(ErrCode::Corrupt)?;
        let kind = RelocKind::from_u8(r.read_u8().map_err(|_| ErrCode::Corrupt)?)
            .ok_or(ErrCode::Corrupt)?;
        r.read_u8().map_err(|_| ErrCode::Corrupt)?;
        let symbol = r.read_u32::<LittleEndian>().map_err(|_| ErrCode::Corrupt)?;
        Ok(Reloc {
            offset,
            section,
            kind,
            symbol,
        })
    }
}

/// A whole container held in memory. The linker builds one of these and
/// serialises it; the loader streams instead (it never needs the full
/// image in kernel memory at once).
#[derive(Debug, Clone)]
pub struct Image {
    pub header: Header,
    pub text: Vec<u8>,
    pub rodata: Vec<u8>,
    pub data: Vec<u8>,
    pub relocs: Vec<Reloc>,
    pub symbols: Vec<Symbol>,
}

impl Image {
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let mut header = self.header.clone();
        header.text_size = self.text.len() as u32;
        header.rodata_size = self.rodata.len() as u32;
        header.data_size = self.data.len() as u32;
        header.reloc_count = self.relocs.len() as u32;
        header.symbol_count = self.symbols.len() as u32;
        header.write_to(w)?;
        w.write_all(&self.text)?;
        w.write_all(&self.rodata)?;
        w.write_all(&self.data)?;
        for reloc in &self.relocs {
            reloc.write_to(w)?;
        }
        for sym in &self.symbols {
            sym.write_to(w)?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Image, ErrCode> {
        let header = Header::read_from(r)?;
        let mut text = vec![0u8; header.text_size as usize];
        r.read_exact(&mut text).map_err(|_| ErrCode::Corrupt)?;
        let mut rodata = vec![0u8; header.rodata_size as usize];
        r.read_exact(&mut rodata).map_err(|_| ErrCode::Corrupt)?;
        let mut data = vec![0u8; header.data_size as usize];
        r.read_exact(&mut data).map_err(|_| ErrCode::Corrupt)?;
        let mut relocs = Vec::with_capacity(header.reloc_count as usize);
        for _ in 0..header.reloc_count {
            relocs.push(Reloc::read_from(r)?);
        }
        let mut symbols = Vec::with_capacity(header.symbol_count as usize);
        for _ in 0..header.symbol_count {
            symbols.push(Symbol::read_from(r)?);
        }
        Ok(Image {
            header,
            text,
            rodata,
            data,
            relocs,
            symbols,
        })
    }
}

fn pack_name(name: &str) -> [u8; NAME_LEN] {
    let mut out = [0u8; NAME_LEN];
    let bytes = name.as_bytes();
    let n = bytes.len().min(NAME_LEN - 1);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

fn unpack_name(name: &[u8; NAME_LEN]) -> &str {
    let end = name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
    std::str::from_utf8(&name[..end]).unwrap_or("")
}
