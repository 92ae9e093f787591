// codegen.rs - direct Thumb code emission
//
// The parser drives this emitter as it recognises constructs; there is no
// tree in between. Expression results live in r0. For a binary operator
// the left operand is pushed while the right evaluates, the right moves to
// r1 and the left pops back into r0, so Rn is always the left operand and
// Rm the right. The emitter tracks the operand-stack depth so SP-relative
// local slots stay addressable under pushed temporaries.
//
// Forward control flow goes through label ids: branch sites emit a
// placeholder and are patched when the function is finished. Relocatable
// addresses (globals, string literals) load from a per-function literal
// pool placed after the epilogue; each pool word carries an ABS32
// relocation.

use log::debug;

use mimi::format::{Reloc, RelocKind, Section, SymKind, Symbol};
use mimi::obj::Object;
use mimi::syscall::{SYS_DIV, SYS_MOD};

use crate::thumb::{self, cond, R0, R1, R7};

/// Binary operators the emitter knows how to lower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(u32);

#[derive(Debug, Clone, Copy)]
enum PatchKind {
    Uncond,
    Cond(u8),
}

#[derive(Debug, Clone, Copy)]
struct Patch {
    pos: u32,
    label: Label,
    kind: PatchKind,
}

#[derive(Debug, Clone, Copy)]
struct PoolReq {
    ldr_pos: u32,
    symbol: u32,
}

/// Per-loop targets for break/continue.
#[derive(Debug, Clone, Copy)]
pub struct LoopFrame {
    pub break_to: Label,
    pub continue_to: Label,
}

struct Frame {
    local_words: u32,
    sub_sp_pos: u32,
    epilogue: Label,
    temp_depth: u32,
}

pub struct CodeGen {
    text: Vec<u8>,
    data: Vec<u8>,
    relocs: Vec<Reloc>,
    symbols: Vec<Symbol>,
    labels: Vec<Option<u32>>,
    patches: Vec<Patch>,
    pool: Vec<PoolReq>,
    loops: Vec<LoopFrame>,
    frame: Option<Frame>,
    bss_cursor: u32,
    str_count: u32,
    errors: Vec<String>,
}

impl CodeGen {
    pub fn new() -> CodeGen {
        CodeGen {
            text: Vec::new(),
            data: Vec::new(),
            relocs: Vec::new(),
            symbols: Vec::new(),
            labels: Vec::new(),
            patches: Vec::new(),
            pool: Vec::new(),
            loops: Vec::new(),
            frame: None,
            bss_cursor: 0,
            str_count: 0,
            errors: Vec::new(),
        }
    }

    /// Errors recorded since the last drain (range overflows, redefinitions).
    pub fn take_errors(&mut self) -> Vec<String> {
        std::mem::take(&mut self.errors)
    }

    fn error(&mut self, msg: String) {
        self.errors.push(msg);
    }

    // ==========================================================================
    // Raw emission
    // ==========================================================================

    pub fn text_pos(&self) -> u32 {
        self.text.len() as u32
    }

    fn emit16(&mut self, hw: u16) {
        self.text.extend_from_slice(&hw.to_le_bytes());
    }

    fn patch16(&mut self, pos: u32, hw: u16) {
        let p = pos as usize;
        self.text[p..p + 2].copy_from_slice(&hw.to_le_bytes());
    }

    // ==========================================================================
    // Symbols
    // ==========================================================================

    fn find_symbol(&self, name: &str) -> Option<u32> {
        self.symbols
            .iter()
            .position(|s| s.name_str() == name)
            .map(|i| i as u32)
    }

    fn add_symbol(&mut self, sym: Symbol) -> u32 {
        self.symbols.push(sym);
        (self.symbols.len() - 1) as u32
    }

    /// Symbol index for a call target, creating an unresolved extern on
    /// first sight. Names longer than the record field are truncated, as
    /// the container format dictates.
    pub fn symbol_for_call(&mut self, name: &str) -> u32 {
        if let Some(idx) = self.find_symbol(name) {
            return idx;
        }
        self.add_symbol(Symbol::new(name, SymKind::Extern, Section::Null, 0))
    }

    /// Records a SYSCALL symbol so the trampoline target appears in the
    /// symbol table even though the number is encoded inline.
    pub fn note_syscall_symbol(&mut self, name: &str, num: u32) {
        if self.find_symbol(name).is_none() {
            self.add_symbol(Symbol::new(name, SymKind::Syscall, Section::Null, num));
        }
    }

    /// Defines an initialised global in DATA. Returns the symbol index.
    pub fn define_data(&mut self, name: &str, kind: SymKind, bytes: &[u8]) -> u32 {
        while self.data.len() % 4 != 0 {
            self.data.push(0);
        }
        let off = self.data.len() as u32;
        self.data.extend_from_slice(bytes);
        let mut sym = Symbol::new(name, kind, Section::Data, off);
        sym.size = bytes.len().min(u16::MAX as usize) as u16;
        self.upsert_definition(name, sym)
    }

    /// Defines a zero-initialised global in BSS.
    pub fn define_bss(&mut self, name: &str, kind: SymKind, size: u32) -> u32 {
        self.bss_cursor = (self.bss_cursor + 3) & !3;
        let off = self.bss_cursor;
        self.bss_cursor += size.max(4);
        let mut sym = Symbol::new(name, kind, Section::Bss, off);
        sym.size = size.min(u32::from(u16::MAX)) as u16;
        self.upsert_definition(name, sym)
    }

    /// Declares an extern object/function without a definition.
    pub fn declare_extern(&mut self, name: &str) -> u32 {
        if let Some(idx) = self.find_symbol(name) {
            return idx;
        }
        self.add_symbol(Symbol::new(name, SymKind::Extern, Section::Null, 0))
    }

    fn upsert_definition(&mut self, name: &str, sym: Symbol) -> u32 {
        match self.find_symbol(name) {
            Some(idx) => {
                let existing = &self.symbols[idx as usize];
                if existing.kind == SymKind::Extern {
                    self.symbols[idx as usize] = sym;
                } else {
                    self.error(format!("redefinition of '{name}'"));
                }
                idx
            }
            None => self.add_symbol(sym),
        }
    }

    /// Appends a string literal body (with its NUL) to DATA under a
    /// generated local symbol.
    pub fn intern_string(&mut self, s: &str) -> u32 {
        let off = self.data.len() as u32;
        self.data.extend_from_slice(s.as_bytes());
        self.data.push(0);
        let name = format!("$str{}", self.str_count);
        self.str_count += 1;
        let mut sym = Symbol::new(&name, SymKind::Local, Section::Data, off);
        sym.size = (s.len() + 1).min(u16::MAX as usize) as u16;
        self.add_symbol(sym)
    }

    /// Records a pointer-sized cell in DATA holding another symbol's
    /// address, patched by the loader via DATA_PTR.
    pub fn define_data_ptr(&mut self, name: &str, kind: SymKind, target: u32) -> u32 {
        let idx = self.define_data(name, kind, &[0, 0, 0, 0]);
        let off = self.symbols[idx as usize].value;
        self.relocs.push(Reloc {
            offset: off,
            section: Section::Data,
            kind: RelocKind::DataPtr,
            symbol: target,
        });
        idx
    }

    // ==========================================================================
    // Functions
    // ==========================================================================

    pub fn begin_function(&mut self, name: &str, kind: SymKind) -> u32 {
        let pos = self.text_pos();
        let mut sym = Symbol::new(name, kind, Section::Text, pos);
        sym.size = 0;
        let idx = self.upsert_definition(name, sym);

        self.emit16(thumb::push(0xF0, true)); // push {r4-r7, lr}
        let sub_sp_pos = self.text_pos();
        self.emit16(thumb::sub_sp_imm7(0)); // patched in end_function
        let epilogue = self.new_label();
        self.frame = Some(Frame {
            local_words: 0,
            sub_sp_pos,
            epilogue,
            temp_depth: 0,
        });
        idx
    }

    /// Reserves `words` contiguous stack words; returns the first slot.
    pub fn alloc_local(&mut self, words: u32) -> u32 {
        let frame = self.frame.as_mut().expect("alloc_local outside function");
        let slot = frame.local_words;
        frame.local_words += words;
        slot
    }

    /// Stores incoming argument `i` (r0-r3) into its parameter slot.
    pub fn store_param(&mut self, i: u32) {
        self.emit16(thumb::str_sp(i as u8, i as u8));
    }

    pub fn epilogue_label(&self) -> Label {
        self.frame.as_ref().expect("no open function").epilogue
    }

    pub fn end_function(&mut self, name: &str) {
        let frame = self.frame.take().expect("end_function without begin");
        self.bind_label(frame.epilogue);

        if frame.local_words > 127 {
            self.error(format!(
                "stack frame of '{name}' exceeds the prologue range ({} words)",
                frame.local_words
            ));
        }
        let words = frame.local_words.min(127) as u8;
        self.patch16(frame.sub_sp_pos, thumb::sub_sp_imm7(words));
        self.emit16(thumb::add_sp_imm7(words));
        self.emit16(thumb::pop(0xF0, true)); // pop {r4-r7, pc}

        self.flush_pool(name);
        self.commit_patches(name);

        if frame.temp_depth != 0 {
            self.error(format!("unbalanced operand stack in '{name}'"));
        }
        debug!("[CC] {name}: text now {} bytes", self.text_pos());
    }

    fn flush_pool(&mut self, name: &str) {
        if self.pool.is_empty() {
            return;
        }
        if self.text.len() % 4 != 0 {
            self.emit16(thumb::nop());
        }
        let pool = std::mem::take(&mut self.pool);
        for req in pool {
            let word_pos = self.text_pos();
            self.text.extend_from_slice(&[0, 0, 0, 0]);
            self.relocs.push(Reloc {
                offset: word_pos,
                section: Section::Text,
                kind: RelocKind::Abs32,
                symbol: req.symbol,
            });
            // ldr literal addressing: Align(pc, 4) + imm8*4.
            let base = (req.ldr_pos + 4) & !3;
            let off = word_pos - base;
            if off % 4 != 0 || off / 4 > 255 {
                self.error(format!("literal pool of '{name}' out of ldr range"));
                continue;
            }
            let p = req.ldr_pos as usize;
            let old = u16::from_le_bytes([self.text[p], self.text[p + 1]]);
            self.patch16(req.ldr_pos, old | (off / 4) as u16);
        }
    }

    fn commit_patches(&mut self, name: &str) {
        let patches = std::mem::take(&mut self.patches);
        for patch in patches {
            let Some(target) = self.labels[patch.label.0 as usize] else {
                self.error(format!("unbound branch target in '{name}'"));
                continue;
            };
            let rel = target as i32 - (patch.pos as i32 + 4);
            match patch.kind {
                PatchKind::Uncond => {
                    if !thumb::b_in_range(rel) {
                        self.error(format!("branch out of range in '{name}'"));
                        continue;
                    }
                    self.patch16(patch.pos, thumb::b(rel));
                }
                PatchKind::Cond(c) => {
                    if !thumb::bcc_in_range(rel) {
                        self.error(format!(
                            "conditional branch out of range in '{name}'"
                        ));
                        continue;
                    }
                    self.patch16(patch.pos, thumb::bcc(c, rel));
                }
            }
        }
    }

    // ==========================================================================
    // Labels and branches
    // ==========================================================================

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label((self.labels.len() - 1) as u32)
    }

    pub fn bind_label(&mut self, label: Label) {
        self.labels[label.0 as usize] = Some(self.text_pos());
    }

    /// Unconditional branch to `label`, patched later.
    pub fn branch(&mut self, label: Label) {
        self.patches.push(Patch {
            pos: self.text_pos(),
            label,
            kind: PatchKind::Uncond,
        });
        self.emit16(thumb::b(0));
    }

    /// `b<cond>` to `label`, patched later.
    pub fn branch_cond(&mut self, c: u8, label: Label) {
        self.patches.push(Patch {
            pos: self.text_pos(),
            label,
            kind: PatchKind::Cond(c),
        });
        self.emit16(thumb::bcc(c, 0));
    }

    /// Compares r0 with zero and branches to `label` when it is zero.
    /// Long form: a one-instruction conditional skip over an unconditional
    /// branch, so the reach is the 11-bit range rather than the 8-bit one.
    pub fn branch_if_zero(&mut self, label: Label) {
        self.emit16(thumb::cmp_imm8(R0, 0));
        self.emit16(thumb::bcc(cond::NE, 0));
        self.branch(label);
    }

    /// Compares r0 with zero and branches to `label` when it is non-zero.
    pub fn branch_if_nonzero(&mut self, label: Label) {
        self.emit16(thumb::cmp_imm8(R0, 0));
        self.emit16(thumb::bcc(cond::EQ, 0));
        self.branch(label);
    }

    pub fn push_loop(&mut self, frame: LoopFrame) {
        self.loops.push(frame);
    }

    pub fn pop_loop(&mut self) {
        self.loops.pop();
    }

    pub fn current_loop(&self) -> Option<LoopFrame> {
        self.loops.last().copied()
    }

    // ==========================================================================
    // Operand stack
    // ==========================================================================

    pub fn push_r0(&mut self) {
        self.emit16(thumb::push(1 << R0, false));
        if let Some(f) = self.frame.as_mut() {
            f.temp_depth += 1;
        }
    }

    pub fn pop_r0(&mut self) {
        self.emit16(thumb::pop(1 << R0, false));
        if let Some(f) = self.frame.as_mut() {
            f.temp_depth -= 1;
        }
    }

    pub fn pop_r1(&mut self) {
        self.emit16(thumb::pop(1 << R1, false));
        if let Some(f) = self.frame.as_mut() {
            f.temp_depth -= 1;
        }
    }

    /// Moves the right operand to r1 and restores the pushed left operand
    /// into r0.
    pub fn binop_operands(&mut self) {
        self.emit16(thumb::mov_low(R1, R0));
        self.emit16(thumb::pop(1 << R0, false));
        if let Some(f) = self.frame.as_mut() {
            f.temp_depth -= 1;
        }
    }

    /// Pops pushed call arguments into r0..r{n-1}, last argument first.
    pub fn pop_args(&mut self, n: u32) {
        for i in (0..n).rev() {
            self.emit16(thumb::pop(1 << i, false));
            if let Some(f) = self.frame.as_mut() {
                f.temp_depth -= 1;
            }
        }
    }

    // ==========================================================================
    // Values
    // ==========================================================================

    /// Loads an immediate into r0.
    pub fn load_imm(&mut self, v: i32) {
        self.load_imm_reg(R0, v);
    }

    /// Loads an immediate into a low register. Values above the MOV range
    /// are synthesised top byte first by shift-and-add.
    pub fn load_imm_reg(&mut self, rd: u8, v: i32) {
        if (0..=255).contains(&v) {
            self.emit16(thumb::mov_imm8(rd, v as u8));
        } else if (-128..=-1).contains(&v) {
            self.emit16(thumb::mov_imm8(rd, (-v) as u8));
            self.emit16(thumb::neg_reg(rd, rd));
        } else {
            let u = v as u32;
            let bytes = [
                (u >> 24) as u8,
                (u >> 16) as u8,
                (u >> 8) as u8,
                u as u8,
            ];
            let first = bytes.iter().position(|&b| b != 0).unwrap_or(3);
            self.emit16(thumb::mov_imm8(rd, bytes[first]));
            for &b in &bytes[first + 1..] {
                self.emit16(thumb::lsl_imm(rd, rd, 8));
                if b != 0 {
                    self.emit16(thumb::add_imm8(rd, b));
                }
            }
        }
    }

    fn slot_word_off(&mut self, slot: u32) -> Option<u8> {
        let depth = self.frame.as_ref().map(|f| f.temp_depth).unwrap_or(0);
        let off = slot + depth;
        if off > 255 {
            self.error("local slot beyond SP-relative range".into());
            return None;
        }
        Some(off as u8)
    }

    pub fn load_local(&mut self, slot: u32) {
        if let Some(off) = self.slot_word_off(slot) {
            self.emit16(thumb::ldr_sp(R0, off));
        }
    }

    pub fn store_local(&mut self, slot: u32) {
        if let Some(off) = self.slot_word_off(slot) {
            self.emit16(thumb::str_sp(R0, off));
        }
    }

    /// r0 = address of a stack slot.
    pub fn load_local_addr(&mut self, slot: u32) {
        if let Some(off) = self.slot_word_off(slot) {
            self.emit16(thumb::add_sp_rd(R0, off));
        }
    }

    /// r0 = address of a DATA/BSS/TEXT symbol, via the literal pool.
    pub fn load_symbol_addr(&mut self, symbol: u32) {
        self.pool.push(PoolReq {
            ldr_pos: self.text_pos(),
            symbol,
        });
        self.emit16(thumb::ldr_lit(R0, 0));
    }

    /// r0 = word/byte at [r0].
    pub fn load_indirect(&mut self, byte: bool) {
        if byte {
            self.emit16(thumb::ldrb_imm(R0, R0, 0));
        } else {
            self.emit16(thumb::ldr_imm(R0, R0, 0));
        }
    }

    /// [r1] = r0, word or byte.
    pub fn store_indirect(&mut self, byte: bool) {
        if byte {
            self.emit16(thumb::strb_imm(R0, R1, 0));
        } else {
            self.emit16(thumb::str_imm(R0, R1, 0));
        }
    }

    // ==========================================================================
    // Operators
    // ==========================================================================

    /// Lowers a binary operator with r0 = left, r1 = right.
    pub fn binop(&mut self, op: BinOp) {
        match op {
            BinOp::Add => self.emit16(thumb::add_reg(R0, R0, R1)),
            BinOp::Sub => self.emit16(thumb::sub_reg(R0, R0, R1)),
            BinOp::Mul => self.emit16(thumb::mul_reg(R0, R1)),
            BinOp::And => self.emit16(thumb::and_reg(R0, R1)),
            BinOp::Or => self.emit16(thumb::orr_reg(R0, R1)),
            BinOp::Xor => self.emit16(thumb::eor_reg(R0, R1)),
            BinOp::Shl => self.emit16(thumb::lsl_reg(R0, R1)),
            BinOp::Shr => self.emit16(thumb::lsr_reg(R0, R1)),
            BinOp::Div => self.syscall(SYS_DIV),
            BinOp::Mod => self.syscall(SYS_MOD),
            BinOp::Eq => self.compare(cond::EQ),
            BinOp::Ne => self.compare(cond::NE),
            BinOp::Lt => self.compare(cond::LT),
            BinOp::Gt => self.compare(cond::GT),
            BinOp::Le => self.compare(cond::LE),
            BinOp::Ge => self.compare(cond::GE),
        }
    }

    /// r0 = (r0 <cond> r1) as 0/1. MOVS clobbers the flags, so the
    /// conditional branch comes straight after the CMP.
    fn compare(&mut self, c: u8) {
        self.emit16(thumb::cmp_reg(R0, R1));
        self.set_bool(c)
    }

    /// Materialises the current flags as 0/1 in r0.
    pub fn set_bool(&mut self, c: u8) {
        let true_l = self.new_label();
        let end_l = self.new_label();
        self.branch_cond(c, true_l);
        self.emit16(thumb::mov_imm8(R0, 0));
        self.branch(end_l);
        self.bind_label(true_l);
        self.emit16(thumb::mov_imm8(R0, 1));
        self.bind_label(end_l);
    }

    /// Logical NOT: r0 = (r0 == 0).
    pub fn logical_not(&mut self) {
        self.emit16(thumb::cmp_imm8(R0, 0));
        self.set_bool(cond::EQ);
    }

    pub fn negate(&mut self) {
        self.emit16(thumb::neg_reg(R0, R0));
    }

    pub fn bit_not(&mut self) {
        self.emit16(thumb::mvn_reg(R0, R0));
    }

    /// Logical right shift of r0 by a constant (pointer-difference scaling).
    pub fn shr_imm(&mut self, shift: u8) {
        self.emit16(thumb::lsr_imm(R0, R0, shift));
    }

    pub fn add_imm(&mut self, v: u8) {
        self.emit16(thumb::add_imm8(R0, v));
    }

    pub fn sub_imm(&mut self, v: u8) {
        self.emit16(thumb::sub_imm8(R0, v));
    }

    /// Scales r0 by an element size using r1 as scratch.
    pub fn scale_by(&mut self, size: u32) {
        if size <= 1 {
            return;
        }
        if size > 255 {
            self.error("element size beyond immediate range".into());
            return;
        }
        self.emit16(thumb::mov_imm8(R1, size as u8));
        self.emit16(thumb::mul_reg(R0, R1));
    }

    // ==========================================================================
    // Calls
    // ==========================================================================

    /// Emits a BL placeholder with a THUMB_CALL relocation; the loader
    /// resolves the final offset.
    pub fn call(&mut self, symbol: u32) {
        self.relocs.push(Reloc {
            offset: self.text_pos(),
            section: Section::Text,
            kind: RelocKind::ThumbCall,
            symbol,
        });
        // BL +0 as the placeholder; the loader rewrites both halfwords.
        self.emit16(0xF000);
        self.emit16(0xF800);
    }

    /// The syscall trampoline: number in r7, SVC #0.
    pub fn syscall(&mut self, num: u32) {
        self.emit16(thumb::mov_imm8(R7, num as u8));
        self.emit16(thumb::svc(0));
    }

    // ==========================================================================
    // Output
    // ==========================================================================

    pub fn bss_size(&self) -> u32 {
        self.bss_cursor
    }

    pub fn finish(self) -> Object {
        Object {
            text: self.text,
            data: self.data,
            relocs: self.relocs,
            symbols: self.symbols,
        }
    }
}

impl Default for CodeGen {
    fn default() -> Self {
        CodeGen::new()
    }
}
