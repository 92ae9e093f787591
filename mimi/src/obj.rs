// obj.rs - intermediate object blobs
//
// The codegen writes one object per translation unit: a 4-word mini-header
// (text_size, data_size, reloc_count, symbol_count) followed by the TEXT
// bytes, the DATA bytes, the relocation records and the symbol records.
// BSS has no bytes; its extent is recovered from the BSS symbols' sizes.
// Objects live on a temporary path between the codegen and the linker and
// are deleted after the link.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::err::ErrCode;
use crate::format::{Reloc, Section, Symbol};

#[derive(Debug, Clone, Default)]
pub struct Object {
    pub text: Vec<u8>,
    pub data: Vec<u8>,
    pub relocs: Vec<Reloc>,
    pub symbols: Vec<Symbol>,
}

impl Object {
    pub fn new() -> Object {
        Object::default()
    }

    /// Byte extent of this object's BSS, derived from the highest
    /// BSS-resident definition.
    pub fn bss_extent(&self) -> u32 {
        self.symbols
            .iter()
            .filter(|s| s.section == Section::Bss)
            .map(|s| s.value + u32::from(s.size.max(4)))
            .max()
            .unwrap_or(0)
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.text.len() as u32)?;
        w.write_u32::<LittleEndian>(self.data.len() as u32)?;
        w.write_u32::<LittleEndian>(self.relocs.len() as u32)?;
        w.write_u32::<LittleEndian>(self.symbols.len() as u32)?;
        w.write_all(&self.text)?;
        w.write_all(&self.data)?;
        for reloc in &self.relocs {
            reloc.write_to(w)?;
        }
        for sym in &self.symbols {
            sym.write_to(w)?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Object, ErrCode> {
        let text_size = r.read_u32::<LittleEndian>().map_err(|_| ErrCode::Corrupt)?;
        let data_size = r.read_u32::<LittleEndian>().map_err(|_| ErrCode::Corrupt)?;
        let reloc_count = r.read_u32::<LittleEndian>().map_err(|_| ErrCode::Corrupt)?;
        let symbol_count = r.read_u32::<LittleEndian>().map_err(|_| ErrCode::Corrupt)?;

        let mut text = vec![0u8; text_size as usize];
        r.read_exact(&mut text).map_err(|_| ErrCode::Corrupt)?;
        let mut data = vec![0u8; data_size as usize];
        r.read_exact(&mut data).map_err(|_| ErrCode::Corrupt)?;

        let mut relocs = Vec::with_capacity(reloc_count as usize);
        for _ in 0..reloc_count {
            relocs.push(Reloc::read_from(r)?);
        }
        let mut symbols = Vec::with_capacity(symbol_count as usize);
        for _ in 0..symbol_count {
            symbols.push(Symbol::read_from(r)?);
        }

        Ok(Object {
            text,
            data,
            relocs,
            symbols,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{RelocKind, SymKind};

    #[test]
    fn roundtrip() {
        let mut obj = Object::new();
        obj.text = vec![0x00, 0x20, 0x70, 0x47];
        obj.data = vec![b'h', b'i', 0];
        obj.relocs.push(Reloc {
            offset: 0,
            section: Section::Text,
            kind: RelocKind::Abs32,
            symbol: 1,
        });
        obj.symbols
            .push(Symbol::new("main", SymKind::Global, Section::Text, 0));
        let mut s = Symbol::new("buf", SymKind::Local, Section::Bss, 8);
        s.size = 16;
        obj.symbols.push(s);

        let mut buf = Vec::new();
        obj.write_to(&mut buf).unwrap();
        let back = Object::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(back.text, obj.text);
        assert_eq!(back.data, obj.data);
        assert_eq!(back.relocs, obj.relocs);
        assert_eq!(back.symbols.len(), 2);
        assert_eq!(back.bss_extent(), 24);
    }

    #[test]
    fn truncated_payload_is_corrupt() {
        let mut obj = Object::new();
        obj.text = vec![0u8; 16];
        let mut buf = Vec::new();
        obj.write_to(&mut buf).unwrap();
        buf.truncate(20);
        assert_eq!(
            Object::read_from(&mut buf.as_slice()).unwrap_err(),
            ErrCode::Corrupt
        );
    }

    #[test]
    fn bss_extent_of_dataless_object_is_zero() {
        assert_eq!(Object::new().bss_extent(), 0);
    }
}
