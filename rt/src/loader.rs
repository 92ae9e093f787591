// loader.rs - place a MIMI image into the user arena
//
// Validates the header, sizes the whole placement (sections + stack +
// heap), takes one user-pool block owned by the task, copies the
// sections, zeroes BSS, stages the symbol table through a kernel-pool
// block, and walks the relocation table patching each site. Every
// failure after the allocation releases the block before returning.

use std::sync::{Mutex, MutexGuard};

use log::{debug, warn};

use mimi::err::ErrCode;
use mimi::format::{
    Arch, Header, Reloc, RelocKind, Section, SymKind, Symbol, HEADER_SIZE, RELOC_SIZE,
    SYMBOL_SIZE,
};
use mimi::thumb;

use crate::fs::{FileSys, OpenMode, ScopedFile, Whence};
use crate::pool::{Pool, KERNEL_OWNER};
use crate::task::Tcb;

pub const DEFAULT_STACK: u32 = 4096;
pub const DEFAULT_HEAP: u32 = 8192;

/// Everything the loader touches, split out so the borrowck sees the
/// distinct pieces.
pub struct LoadCtx<'a> {
    pub fs: &'a mut dyn FileSys,
    pub user_pool: &'a Mutex<Pool>,
    pub user_mem: &'a mut [u8],
    pub kernel_pool: &'a Mutex<Pool>,
    pub kernel_mem: &'a mut [u8],
}

/// Poison-recovering lock: the pools hold plain data, a poisoned guard is
/// still usable state.
pub fn lock(pool: &Mutex<Pool>) -> MutexGuard<'_, Pool> {
    pool.lock().unwrap_or_else(|e| e.into_inner())
}

pub fn load(ctx: LoadCtx<'_>, path: &str, task: &mut Tcb, arch: Arch) -> Result<(), ErrCode> {
    let LoadCtx {
        fs,
        user_pool,
        user_mem,
        kernel_pool,
        kernel_mem,
    } = ctx;

    let mut file = ScopedFile::open(fs, path, OpenMode::READ)?;

    let mut raw = [0u8; HEADER_SIZE as usize];
    file.read_exact(&mut raw)?;
    let header = match Header::read_from(&mut raw.as_slice()) {
        Ok(h) => h,
        Err(e) => {
            reject(&raw, e);
            return Err(e);
        }
    };
    if let Err(e) = header.validate(arch) {
        reject(&raw, e);
        return Err(e);
    }

    let stack_size = header.stack_request.max(DEFAULT_STACK);
    let heap_size = header.heap_request.max(DEFAULT_HEAP);
    let total = [
        header.text_size,
        header.rodata_size,
        header.data_size,
        header.bss_size,
        stack_size,
        heap_size,
    ]
    .iter()
    .try_fold(0u32, |acc, &v| acc.checked_add(v))
    .ok_or(ErrCode::TooLarge)?;
    let total = total.checked_add(31).ok_or(ErrCode::TooLarge)? & !31;

    let base = lock(user_pool).alloc(total, task.id)?;

    // Layout: sections in file order, then the heap, stack on top growing
    // down.
    let mem = &mut task.mem;
    mem.base = base;
    mem.total_size = total;
    mem.text_start = 0;
    mem.text_size = header.text_size;
    mem.rodata_start = header.text_size;
    mem.rodata_size = header.rodata_size;
    mem.data_start = mem.rodata_start + header.rodata_size;
    mem.data_size = header.data_size;
    mem.bss_start = mem.data_start + header.data_size;
    mem.bss_size = header.bss_size;
    mem.heap_start = mem.bss_start + header.bss_size;
    mem.heap_size = heap_size;
    mem.heap_used = 0;
    mem.stack_size = stack_size;
    mem.stack_top = total;

    let placed = place(
        &mut file,
        &header,
        task,
        user_mem,
        kernel_pool,
        kernel_mem,
    );
    if let Err(e) = placed {
        lock(user_pool).free(base).ok();
        return Err(e);
    }

    task.entry = base + task.mem.text_start + header.entry_offset;
    if !header.name_str().is_empty() {
        task.name = header.name_str().to_string();
    } else {
        task.name = path.rsplit('/').next().unwrap_or(path).to_string();
    }
    debug!(
        "[LOAD] {}: base={:#x} total={} entry={:#x}",
        task.name, base, total, task.entry
    );
    Ok(())
}

fn place(
    file: &mut ScopedFile<'_>,
    header: &Header,
    task: &mut Tcb,
    user_mem: &mut [u8],
    kernel_pool: &Mutex<Pool>,
    kernel_mem: &mut [u8],
) -> Result<(), ErrCode> {
    let mem = task.mem;
    let base = mem.base as usize;
    if base + mem.total_size as usize > user_mem.len() {
        return Err(ErrCode::Corrupt);
    }

    let section = |start: u32, size: u32| (base + start as usize, size as usize);

    let (off, len) = section(mem.text_start, header.text_size);
    file.read_exact(&mut user_mem[off..off + len])?;
    let (off, len) = section(mem.rodata_start, header.rodata_size);
    file.read_exact(&mut user_mem[off..off + len])?;
    let (off, len) = section(mem.data_start, header.data_size);
    file.read_exact(&mut user_mem[off..off + len])?;

    let (off, len) = section(mem.bss_start, header.bss_size);
    user_mem[off..off + len].fill(0);

    // The symbol table sits after the relocations; stage it through a
    // kernel-pool block, then seek back for the relocation walk.
    let mut symbols: Vec<Symbol> = Vec::new();
    let mut staged: Option<u32> = None;
    if header.symbol_count > 0 {
        let bytes = header.symbol_count as usize * SYMBOL_SIZE as usize;
        let kbase = lock(kernel_pool).alloc(bytes as u32, KERNEL_OWNER)?;
        staged = Some(kbase);
        let kslice = &mut kernel_mem[kbase as usize..kbase as usize + bytes];

        let seek_to = |f: &mut ScopedFile<'_>, pos: u64| {
            f.seek(pos as i32, Whence::Set).map(|_| ())
        };
        let result = seek_to(file, header.symbol_offset())
            .and_then(|()| file.read_exact(kslice))
            .and_then(|()| seek_to(file, header.reloc_offset()));
        if let Err(e) = result {
            lock(kernel_pool).free(kbase).ok();
            return Err(e);
        }
        let mut cursor: &[u8] = kslice;
        for _ in 0..header.symbol_count {
            match Symbol::read_from(&mut cursor) {
                Ok(s) => symbols.push(s),
                Err(e) => {
                    lock(kernel_pool).free(kbase).ok();
                    return Err(e);
                }
            }
        }
    }

    let walked = walk_relocs(file, header, &mem, &symbols, user_mem);
    if let Some(kbase) = staged {
        lock(kernel_pool).free(kbase).ok();
    }
    walked
}

fn walk_relocs(
    file: &mut ScopedFile<'_>,
    header: &Header,
    mem: &crate::task::MemLayout,
    symbols: &[Symbol],
    user_mem: &mut [u8],
) -> Result<(), ErrCode> {
    let section_start = |s: Section| -> Option<u32> {
        match s {
            Section::Text => Some(mem.text_start),
            Section::Rodata => Some(mem.rodata_start),
            Section::Data => Some(mem.data_start),
            Section::Bss => Some(mem.bss_start),
            Section::Null => None,
        }
    };

    for _ in 0..header.reloc_count {
        let mut raw = [0u8; RELOC_SIZE as usize];
        file.read_exact(&mut raw)?;
        let reloc = Reloc::read_from(&mut raw.as_slice())?;

        let Some(start) = section_start(reloc.section) else {
            continue;
        };
        let patch64 = u64::from(mem.base) + u64::from(start) + u64::from(reloc.offset);
        if patch64 + 4 > u64::from(mem.base) + u64::from(mem.total_size) {
            return Err(ErrCode::Corrupt);
        }
        let patch = patch64 as u32;

        let Some(sym) = symbols.get(reloc.symbol as usize) else {
            warn!("[LOAD] relocation names symbol {} of {}", reloc.symbol, symbols.len());
            continue;
        };
        let value = match section_start(sym.section) {
            Some(start) => mem.base.wrapping_add(start).wrapping_add(sym.value),
            None if sym.kind == SymKind::Syscall => sym.value,
            None => {
                // Unresolved external: recoverable, the site is skipped.
                warn!("[LOAD] skipping unresolved symbol '{}'", sym.name_str());
                continue;
            }
        };

        apply(reloc.kind, patch, value, user_mem)?;
    }
    Ok(())
}

fn apply(kind: RelocKind, patch: u32, value: u32, user_mem: &mut [u8]) -> Result<(), ErrCode> {
    let p = patch as usize;
    match kind {
        RelocKind::Abs32 | RelocKind::DataPtr => {
            user_mem[p..p + 4].copy_from_slice(&value.to_le_bytes());
        }
        RelocKind::Rel32 => {
            let rel = value.wrapping_sub(patch).wrapping_sub(4) as i32;
            user_mem[p..p + 4].copy_from_slice(&rel.to_le_bytes());
        }
        RelocKind::ThumbCall | RelocKind::ThumbBranch => {
            let off = value.wrapping_sub(patch).wrapping_sub(4) as i32;
            let (hi, lo) = if kind == RelocKind::ThumbCall {
                thumb::encode_bl(off)?
            } else {
                thumb::encode_bw(off)?
            };
            user_mem[p..p + 2].copy_from_slice(&hi.to_le_bytes());
            user_mem[p + 2..p + 4].copy_from_slice(&lo.to_le_bytes());
        }
    }
    Ok(())
}

/// Logs the rejected header fields the way the on-device shell does.
fn reject(raw: &[u8], code: ErrCode) {
    let magic = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
    let version = raw[4];
    let arch = raw[6];
    let text = u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]);
    warn!(
        "[LOAD] rejected ({code}): magic={magic:#010x} version={version} arch={arch} text_size={text}"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::HostFs;
    use crate::task::TaskTable;
    use mimi::format::Image;
    use std::fs as stdfs;

    const USER: u32 = 64 * 1024;
    const KERNEL: u32 = 16 * 1024;

    struct Rig {
        _dir: tempfile::TempDir,
        fs: HostFs,
        user_pool: Mutex<Pool>,
        user_mem: Vec<u8>,
        kernel_pool: Mutex<Pool>,
        kernel_mem: Vec<u8>,
        tasks: TaskTable,
    }

    impl Rig {
        fn new() -> Rig {
            let dir = tempfile::tempdir().unwrap();
            let fs = HostFs::new(dir.path());
            Rig {
                _dir: dir,
                fs,
                user_pool: Mutex::new(Pool::new("user", 0, USER)),
                user_mem: vec![0xAA; USER as usize],
                kernel_pool: Mutex::new(Pool::new("kernel", 0, KERNEL)),
                kernel_mem: vec![0; KERNEL as usize],
                tasks: TaskTable::new(),
            }
        }

        fn put(&self, name: &str, img: &Image) {
            let mut buf = Vec::new();
            img.write_to(&mut buf).unwrap();
            stdfs::write(self._dir.path().join(name), buf).unwrap();
        }

        fn load(&mut self, name: &str) -> Result<u32, ErrCode> {
            let id = self.tasks.alloc().ok_or(ErrCode::Nomem)?;
            let mut tcb = self.tasks.get(id).clone();
            let r = load(
                LoadCtx {
                    fs: &mut self.fs,
                    user_pool: &self.user_pool,
                    user_mem: &mut self.user_mem,
                    kernel_pool: &self.kernel_pool,
                    kernel_mem: &mut self.kernel_mem,
                },
                name,
                &mut tcb,
                Arch::CortexM0Plus,
            );
            match r {
                Ok(()) => {
                    *self.tasks.get_mut(id) = tcb;
                    Ok(id)
                }
                Err(e) => {
                    self.tasks.release(id);
                    Err(e)
                }
            }
        }
    }

    fn simple_image() -> Image {
        let mut img = Image {
            header: Header::new(Arch::CortexM0Plus),
            text: vec![0x2A, 0x20, 0x70, 0x47], // movs r0,#42; bx lr
            rodata: vec![0xCA, 0xFE],
            data: vec![1, 2, 3, 4],
            relocs: Vec::new(),
            symbols: vec![Symbol::new("main", SymKind::Global, Section::Text, 0)],
        };
        img.header.text_size = 4;
        img.header.bss_size = 16;
        img
    }

    #[test]
    fn sections_land_and_bss_is_zeroed() {
        let mut rig = Rig::new();
        rig.put("p.mimi", &simple_image());
        let id = rig.load("p.mimi").unwrap();
        let mem = rig.tasks.get(id).mem;

        let b = mem.base as usize;
        // No relocations: the placed bytes equal the file's section bytes.
        assert_eq!(&rig.user_mem[b..b + 4], &[0x2A, 0x20, 0x70, 0x47]);
        let ro = b + mem.rodata_start as usize;
        assert_eq!(&rig.user_mem[ro..ro + 2], &[0xCA, 0xFE]);
        let d = b + mem.data_start as usize;
        assert_eq!(&rig.user_mem[d..d + 4], &[1, 2, 3, 4]);
        let bss = b + mem.bss_start as usize;
        assert!(rig.user_mem[bss..bss + 16].iter().all(|&x| x == 0));

        // Stack and heap sizing honours the defaults.
        assert_eq!(mem.stack_size, DEFAULT_STACK);
        assert_eq!(mem.heap_size, DEFAULT_HEAP);
        assert_eq!(mem.stack_top, mem.total_size);
        assert_eq!(rig.tasks.get(id).entry, mem.base);
    }

    #[test]
    fn bad_magic_is_noexec_and_leaves_pool_untouched() {
        let mut rig = Rig::new();
        stdfs::write(rig._dir.path().join("bad.mimi"), vec![0x4E; 96]).unwrap();
        let before = lock(&rig.user_pool).free_bytes();
        assert_eq!(rig.load("bad.mimi"), Err(ErrCode::Noexec));
        assert_eq!(lock(&rig.user_pool).free_bytes(), before);
        assert!(!rig.tasks.user_tasks_alive());
    }

    #[test]
    fn wrong_arch_is_noexec() {
        let mut rig = Rig::new();
        let mut img = simple_image();
        img.header.arch = Arch::RiscV;
        rig.put("r.mimi", &img);
        assert_eq!(rig.load("r.mimi"), Err(ErrCode::Noexec));
    }

    #[test]
    fn entry_past_text_is_inval() {
        let mut rig = Rig::new();
        let mut img = simple_image();
        img.header.entry_offset = 4;
        rig.put("e.mimi", &img);
        assert_eq!(rig.load("e.mimi"), Err(ErrCode::Inval));
    }

    #[test]
    fn truncated_text_is_corrupt_and_releases_the_block() {
        let mut rig = Rig::new();
        let img = simple_image();
        let mut buf = Vec::new();
        img.write_to(&mut buf).unwrap();
        buf.truncate(HEADER_SIZE as usize + 2);
        stdfs::write(rig._dir.path().join("t.mimi"), buf).unwrap();

        let before = lock(&rig.user_pool).free_bytes();
        assert_eq!(rig.load("t.mimi"), Err(ErrCode::Corrupt));
        lock(&rig.user_pool).coalesce();
        assert_eq!(lock(&rig.user_pool).free_bytes(), before);
    }

    #[test]
    fn abs32_patches_to_load_address() {
        let mut rig = Rig::new();
        let mut img = simple_image();
        // One pool word at text offset 4 pointing at a data symbol.
        img.text.extend_from_slice(&[0, 0, 0, 0]);
        img.header.text_size = 8;
        img.symbols
            .push(Symbol::new("greet", SymKind::Local, Section::Data, 2));
        img.relocs.push(Reloc {
            offset: 4,
            section: Section::Text,
            kind: RelocKind::Abs32,
            symbol: 1,
        });
        rig.put("a.mimi", &img);
        let id = rig.load("a.mimi").unwrap();
        let mem = rig.tasks.get(id).mem;

        let p = mem.base as usize + 4;
        let got = u32::from_le_bytes(rig.user_mem[p..p + 4].try_into().unwrap());
        assert_eq!(got, mem.base + mem.data_start + 2);
    }

    #[test]
    fn thumb_call_patch_decodes_back_to_the_target() {
        let mut rig = Rig::new();
        let mut img = simple_image();
        img.text = vec![0; 16];
        img.header.text_size = 16;
        img.symbols = vec![
            Symbol::new("main", SymKind::Global, Section::Text, 0),
            Symbol::new("callee", SymKind::Global, Section::Text, 12),
        ];
        img.relocs.push(Reloc {
            offset: 2,
            section: Section::Text,
            kind: RelocKind::ThumbCall,
            symbol: 1,
        });
        rig.put("c.mimi", &img);
        let id = rig.load("c.mimi").unwrap();
        let mem = rig.tasks.get(id).mem;

        let p = mem.base as usize + 2;
        let hi = u16::from_le_bytes(rig.user_mem[p..p + 2].try_into().unwrap());
        let lo = u16::from_le_bytes(rig.user_mem[p + 2..p + 4].try_into().unwrap());
        assert!(thumb::is_bl(hi, lo));
        let target = (mem.base + 2 + 4).wrapping_add(thumb::decode_bl(hi, lo) as u32);
        assert_eq!(target, mem.base + 12);
    }

    #[test]
    fn rel32_patch_is_pc_relative() {
        let mut rig = Rig::new();
        let mut img = simple_image();
        img.text = vec![0; 12];
        img.header.text_size = 12;
        img.symbols = vec![
            Symbol::new("main", SymKind::Global, Section::Text, 0),
            Symbol::new("tail", SymKind::Global, Section::Text, 8),
        ];
        img.relocs.push(Reloc {
            offset: 4,
            section: Section::Text,
            kind: RelocKind::Rel32,
            symbol: 1,
        });
        rig.put("rel.mimi", &img);
        let id = rig.load("rel.mimi").unwrap();
        let mem = rig.tasks.get(id).mem;

        let p = mem.base as usize + 4;
        let got = i32::from_le_bytes(rig.user_mem[p..p + 4].try_into().unwrap());
        // value - patch - 4 = (base+8) - (base+4) - 4 = 0
        assert_eq!(got, 0);
    }

    #[test]
    fn thumb_branch_patch_uses_the_bw_encoding() {
        let mut rig = Rig::new();
        let mut img = simple_image();
        img.text = vec![0; 16];
        img.header.text_size = 16;
        img.symbols = vec![
            Symbol::new("main", SymKind::Global, Section::Text, 0),
            Symbol::new("l", SymKind::Local, Section::Text, 12),
        ];
        img.relocs.push(Reloc {
            offset: 0,
            section: Section::Text,
            kind: RelocKind::ThumbBranch,
            symbol: 1,
        });
        rig.put("bw.mimi", &img);
        let id = rig.load("bw.mimi").unwrap();
        let mem = rig.tasks.get(id).mem;

        let p = mem.base as usize;
        let hi = u16::from_le_bytes(rig.user_mem[p..p + 2].try_into().unwrap());
        let lo = u16::from_le_bytes(rig.user_mem[p + 2..p + 4].try_into().unwrap());
        assert!(thumb::is_bw(hi, lo));
        assert_eq!(thumb::decode_bw(hi, lo), 8); // (base+12) - (base+0) - 4
    }

    #[test]
    fn unresolved_extern_is_skipped_not_fatal() {
        let mut rig = Rig::new();
        let mut img = simple_image();
        img.text.extend_from_slice(&[0xEE; 4]);
        img.header.text_size = 8;
        img.symbols
            .push(Symbol::new("ghost", SymKind::Extern, Section::Null, 0));
        img.relocs.push(Reloc {
            offset: 4,
            section: Section::Text,
            kind: RelocKind::Abs32,
            symbol: 1,
        });
        rig.put("u.mimi", &img);
        let id = rig.load("u.mimi").unwrap();
        let mem = rig.tasks.get(id).mem;
        // The site keeps its original bytes.
        let p = mem.base as usize + 4;
        assert_eq!(&rig.user_mem[p..p + 4], &[0xEE; 4]);
    }

    #[test]
    fn syscall_symbol_value_is_used_raw() {
        let mut rig = Rig::new();
        let mut img = simple_image();
        img.text.extend_from_slice(&[0; 4]);
        img.header.text_size = 8;
        img.symbols
            .push(Symbol::new("putchar", SymKind::Syscall, Section::Null, 30));
        img.relocs.push(Reloc {
            offset: 4,
            section: Section::Text,
            kind: RelocKind::Abs32,
            symbol: 1,
        });
        rig.put("s.mimi", &img);
        let id = rig.load("s.mimi").unwrap();
        let mem = rig.tasks.get(id).mem;
        let p = mem.base as usize + 4;
        let got = u32::from_le_bytes(rig.user_mem[p..p + 4].try_into().unwrap());
        assert_eq!(got, 30);
    }

    #[test]
    fn kernel_pool_is_clean_after_load() {
        let mut rig = Rig::new();
        rig.put("p.mimi", &simple_image());
        let kfree = lock(&rig.kernel_pool).free_bytes();
        rig.load("p.mimi").unwrap();
        lock(&rig.kernel_pool).coalesce();
        assert_eq!(lock(&rig.kernel_pool).free_bytes(), kfree);
    }
}
