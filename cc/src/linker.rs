// linker.rs - merge object blobs into a MIMI container
//
// TEXT and DATA are concatenated in input order; BSS extents stack up the
// same way. Symbol values and relocation offsets are adjusted by each
// object's per-section base, and relocation symbol indices are remapped
// into the merged table while the object loads (per-object indices carried
// straight through would only ever work for a single object).
//
// Merge rules: the first GLOBAL satisfies EXTERNs of the same name, two
// GLOBALs collide, LOCALs never merge. The first GLOBAL named `main`
// becomes the entry point.

use std::fmt;

use log::info;

use mimi::err::ErrCode;
use mimi::format::{Arch, Header, Image, Section, SymKind, Symbol};
use mimi::obj::Object;

pub const DEFAULT_STACK: u32 = 4096;
pub const DEFAULT_HEAP: u32 = 8192;

/// Link failure: the code the shell reports plus the accumulated messages.
#[derive(Debug)]
pub struct LinkError {
    pub code: ErrCode,
    pub messages: Vec<String>,
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.messages.as_slice() {
            [] => write!(f, "{}", self.code),
            [first, ..] => write!(f, "{first}"),
        }
    }
}

impl std::error::Error for LinkError {}

/// Links `objects` into an image named `name`.
pub fn link(objects: &[Object], name: &str) -> Result<Image, LinkError> {
    let mut text: Vec<u8> = Vec::new();
    let mut data: Vec<u8> = Vec::new();
    let mut bss_size: u32 = 0;
    let mut symbols: Vec<Symbol> = Vec::new();
    let mut relocs = Vec::new();
    let mut errors: Vec<String> = Vec::new();
    let mut entry: Option<u32> = None;

    for obj in objects {
        let text_base = text.len() as u32;
        let data_base = data.len() as u32;
        let bss_base = bss_size;
        text.extend_from_slice(&obj.text);
        data.extend_from_slice(&obj.data);
        bss_size += (obj.bss_extent() + 3) & !3;

        // Merge symbols, building the per-object index remap table.
        let mut remap = Vec::with_capacity(obj.symbols.len());
        for sym in &obj.symbols {
            let mut adjusted = sym.clone();
            match sym.section {
                Section::Text => adjusted.value += text_base,
                Section::Data => adjusted.value += data_base,
                Section::Bss => adjusted.value += bss_base,
                Section::Rodata | Section::Null => {}
            }

            if adjusted.kind == SymKind::Global
                && entry.is_none()
                && adjusted.name_str() == "main"
            {
                entry = Some(adjusted.value);
            }

            let idx = merge_symbol(&mut symbols, adjusted, &mut errors);
            remap.push(idx);
        }

        for reloc in &obj.relocs {
            let mut r = *reloc;
            match r.section {
                Section::Text => r.offset += text_base,
                Section::Data => r.offset += data_base,
                _ => {}
            }
            match remap.get(r.symbol as usize) {
                Some(&idx) => r.symbol = idx,
                None => errors.push("relocation references a symbol out of range".into()),
            }
            relocs.push(r);
        }
    }

    // Every relocation target must be defined or be a syscall; the loader
    // skips syscall-typed symbols and patches everything else.
    for r in &relocs {
        if let Some(sym) = symbols.get(r.symbol as usize) {
            if sym.kind == SymKind::Extern && sym.section == Section::Null {
                errors.push(format!("unresolved symbol '{}'", sym.name_str()));
            }
        }
    }

    if !errors.is_empty() {
        return Err(LinkError {
            code: ErrCode::Corrupt,
            messages: dedup(errors),
        });
    }
    let Some(entry_offset) = entry else {
        return Err(LinkError {
            code: ErrCode::Noent,
            messages: vec!["no entry point (missing 'main')".into()],
        });
    };

    let mut header = Header::new(Arch::CortexM0Plus);
    header.entry_offset = entry_offset;
    header.bss_size = bss_size;
    header.stack_request = DEFAULT_STACK;
    header.heap_request = DEFAULT_HEAP;
    header.set_name(name);

    info!(
        "[LINK] {name}: text={} data={} bss={} relocs={} symbols={} entry={:#x}",
        text.len(),
        data.len(),
        bss_size,
        relocs.len(),
        symbols.len(),
        entry_offset
    );

    Ok(Image {
        header,
        text,
        rodata: Vec::new(),
        data,
        relocs,
        symbols,
    })
}

/// Adds `sym` to the combined table, folding EXTERN/GLOBAL pairs by name.
/// Returns the combined index the object's relocations should use.
fn merge_symbol(symbols: &mut Vec<Symbol>, sym: Symbol, errors: &mut Vec<String>) -> u32 {
    // LOCALs are private to their object and never merge, even when the
    // generated names collide.
    if sym.kind != SymKind::Local {
        if let Some(idx) = symbols
            .iter()
            .position(|s| s.kind != SymKind::Local && s.name_str() == sym.name_str())
        {
            let existing = &mut symbols[idx];
            match (existing.kind, sym.kind) {
                (SymKind::Extern, SymKind::Global) => *existing = sym,
                (SymKind::Global, SymKind::Global) => {
                    errors.push(format!("multiple definition of '{}'", sym.name_str()));
                }
                // Extern after a definition, extern meeting extern, or a
                // repeated syscall reference all fold onto the entry.
                _ => {}
            }
            return idx as u32;
        }
    }
    symbols.push(sym);
    (symbols.len() - 1) as u32
}

fn dedup(mut messages: Vec<String>) -> Vec<String> {
    messages.dedup();
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use mimi::format::{Reloc, RelocKind};

    fn obj_with_main(text_len: usize, main_at: u32) -> Object {
        let mut obj = Object::new();
        obj.text = vec![0; text_len];
        obj.symbols
            .push(Symbol::new("main", SymKind::Global, Section::Text, main_at));
        obj
    }

    #[test]
    fn entry_offset_matches_mains_adjusted_value() {
        let mut helper = Object::new();
        helper.text = vec![0; 12];
        helper
            .symbols
            .push(Symbol::new("helper", SymKind::Global, Section::Text, 0));

        let img = link(&[helper, obj_with_main(8, 4)], "demo").unwrap();
        // main sits in the second object, shifted by the first's 12 bytes.
        assert_eq!(img.header.entry_offset, 16);
        assert_eq!(img.text.len(), 20);
        assert_eq!(img.header.stack_request, DEFAULT_STACK);
        assert_eq!(img.header.name_str(), "demo");
    }

    #[test]
    fn duplicate_main_is_a_corrupt_link() {
        let err = link(&[obj_with_main(4, 0), obj_with_main(4, 0)], "x").unwrap_err();
        assert_eq!(err.code, ErrCode::Corrupt);
        assert!(err.messages.iter().any(|m| m.contains("multiple definition")));
    }

    #[test]
    fn missing_main_is_noent() {
        let mut obj = Object::new();
        obj.text = vec![0; 4];
        obj.symbols
            .push(Symbol::new("f", SymKind::Global, Section::Text, 0));
        let err = link(&[obj], "x").unwrap_err();
        assert_eq!(err.code, ErrCode::Noent);
    }

    #[test]
    fn extern_resolves_against_global_and_indices_remap() {
        // Object 0: defines main, calls external `add` (its symbol 1).
        let mut a = obj_with_main(8, 0);
        a.symbols
            .push(Symbol::new("add", SymKind::Extern, Section::Null, 0));
        a.relocs.push(Reloc {
            offset: 4,
            section: Section::Text,
            kind: RelocKind::ThumbCall,
            symbol: 1,
        });
        // Object 1: a local string (symbol 0) then the `add` definition
        // (symbol 1) - different per-object index than in object 0.
        let mut b = Object::new();
        b.text = vec![0; 6];
        b.data = b"s\0".to_vec();
        b.symbols
            .push(Symbol::new("$str0", SymKind::Local, Section::Data, 0));
        b.symbols
            .push(Symbol::new("add", SymKind::Global, Section::Text, 2));

        let img = link(&[a, b], "x").unwrap();
        let call = &img.relocs[0];
        let target = &img.symbols[call.symbol as usize];
        assert_eq!(target.name_str(), "add");
        assert_eq!(target.kind, SymKind::Global);
        // Defined at offset 2 of object 1's text, shifted by object 0's 8.
        assert_eq!(target.value, 10);
    }

    #[test]
    fn locals_with_equal_names_do_not_merge() {
        let mut a = obj_with_main(4, 0);
        a.data = b"a\0".to_vec();
        a.symbols
            .push(Symbol::new("$str0", SymKind::Local, Section::Data, 0));
        let mut b = Object::new();
        b.data = b"b\0".to_vec();
        b.symbols
            .push(Symbol::new("$str0", SymKind::Local, Section::Data, 0));

        let img = link(&[a, b], "x").unwrap();
        let strs: Vec<_> = img
            .symbols
            .iter()
            .filter(|s| s.name_str() == "$str0")
            .collect();
        assert_eq!(strs.len(), 2);
        assert_eq!(strs[0].value, 0);
        assert_eq!(strs[1].value, 2); // shifted by object 0's data
    }

    #[test]
    fn unresolved_extern_fails_the_link() {
        let mut a = obj_with_main(8, 0);
        a.symbols
            .push(Symbol::new("missing", SymKind::Extern, Section::Null, 0));
        a.relocs.push(Reloc {
            offset: 0,
            section: Section::Text,
            kind: RelocKind::ThumbCall,
            symbol: 1,
        });
        let err = link(&[a], "x").unwrap_err();
        assert!(err.messages.iter().any(|m| m.contains("missing")));
    }

    #[test]
    fn bss_extents_stack_per_object() {
        let mut a = obj_with_main(4, 0);
        let mut s = Symbol::new("abuf", SymKind::Global, Section::Bss, 0);
        s.size = 10;
        a.symbols.push(s);
        let mut b = Object::new();
        b.text = vec![0; 2];
        let mut s = Symbol::new("bbuf", SymKind::Global, Section::Bss, 0);
        s.size = 8;
        b.symbols.push(s);

        let img = link(&[a, b], "x").unwrap();
        // Object 0's bss rounds 10 up to 12; object 1's starts there.
        let bbuf = img.symbols.iter().find(|x| x.name_str() == "bbuf").unwrap();
        assert_eq!(bbuf.value, 12);
        assert_eq!(img.header.bss_size, 20);
    }

    #[test]
    fn syscall_symbols_pass_through() {
        let mut a = obj_with_main(4, 0);
        a.symbols
            .push(Symbol::new("putchar", SymKind::Syscall, Section::Null, 30));
        let img = link(&[a], "x").unwrap();
        let sc = img
            .symbols
            .iter()
            .find(|s| s.kind == SymKind::Syscall)
            .unwrap();
        assert_eq!(sc.value, 30);
    }
}
