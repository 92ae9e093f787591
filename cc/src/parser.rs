// parser.rs - recursive-descent front end
//
// Single pass: the parser recognises C constructs and calls straight into
// the code generator; no syntax tree is built. Expressions follow the C
// precedence ladder, one function per level. Lvalues are deferred: every
// level returns a Val whose load is only emitted when the value is used,
// so assignment can still reach the address.
//
// Scopes are a flat vector with mark-based truncation; typedef names live
// in the same namespace and are recognised wherever a type specifier may
// begin.

use mimi::format::SymKind;
use mimi::obj::Object;
use mimi::syscall;

use crate::codegen::{BinOp, CodeGen, LoopFrame};
use crate::diag::Diagnostics;
use crate::lexer::{StrTab, Tok, Token, TokenStream};

/// The type lattice of the supported subset. `short` and `long` collapse
/// onto `int`; everything is 32 bits except `char`.
#[derive(Debug, Clone, PartialEq)]
pub enum CType {
    Void,
    Char,
    Int,
    Ptr(Box<CType>),
    Array(Box<CType>, u32),
}

impl CType {
    pub fn size(&self) -> u32 {
        match self {
            CType::Void => 0,
            CType::Char => 1,
            CType::Int | CType::Ptr(_) => 4,
            CType::Array(elem, n) => elem.size() * n,
        }
    }

    fn is_byte(&self) -> bool {
        matches!(self, CType::Char)
    }

    fn elem(&self) -> Option<&CType> {
        match self {
            CType::Ptr(e) | CType::Array(e, _) => Some(e),
            _ => None,
        }
    }

    fn is_ptr_like(&self) -> bool {
        matches!(self, CType::Ptr(_) | CType::Array(_, _))
    }

    /// Array-to-pointer decay for rvalues.
    fn decay(self) -> CType {
        match self {
            CType::Array(e, _) => CType::Ptr(e),
            t => t,
        }
    }
}

#[derive(Debug, Clone)]
enum CSym {
    Local { slot: u32, ty: CType },
    Global { sym: u32, ty: CType },
    Func { ret: CType },
    Typedef(CType),
    EnumConst(i32),
}

/// Where a not-yet-loaded value lives.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Lv {
    None,
    Local(u32),
    Sym(u32),
    /// Address currently in r0.
    Ind,
}

#[derive(Debug, Clone)]
struct Val {
    ty: CType,
    lv: Lv,
}

impl Val {
    fn rvalue(ty: CType) -> Val {
        Val { ty, lv: Lv::None }
    }
}

pub struct Parser<'a> {
    toks: &'a [Token],
    strtab: &'a StrTab,
    pos: usize,
    cg: CodeGen,
    diags: &'a mut Diagnostics,
    syms: Vec<(String, CSym)>,
    scopes: Vec<usize>,
}

/// Parse a token stream and produce the object blob. Diagnostics are
/// accumulated; a non-empty set means the object must not be linked.
pub fn parse(ts: &TokenStream, diags: &mut Diagnostics) -> Object {
    let mut p = Parser {
        toks: &ts.tokens,
        strtab: &ts.strtab,
        pos: 0,
        cg: CodeGen::new(),
        diags,
        syms: Vec::new(),
        scopes: Vec::new(),
    };
    while p.kind() != Tok::Eof && !p.diags.at_limit() {
        p.top_level();
    }
    p.drain_cg_errors();
    p.cg.finish()
}

impl<'a> Parser<'a> {
    // ==========================================================================
    // Token plumbing
    // ==========================================================================

    fn cur(&self) -> Token {
        self.toks[self.pos.min(self.toks.len() - 1)]
    }

    fn kind(&self) -> Tok {
        self.cur().kind
    }

    fn bump(&mut self) -> Token {
        let t = self.cur();
        if self.pos < self.toks.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, k: Tok) -> bool {
        if self.kind() == k {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, k: Tok, what: &str) -> bool {
        if self.eat(k) {
            true
        } else {
            self.error(format!("expected {what}"));
            false
        }
    }

    fn error(&mut self, msg: String) {
        let t = self.cur();
        self.diags.error(t.line, t.col, msg);
    }

    fn drain_cg_errors(&mut self) {
        let line = self.cur().line;
        for msg in self.cg.take_errors() {
            self.diags.error(line, 0, msg);
        }
    }

    /// Skip to a synchronising point after a syntax error.
    fn sync(&mut self) {
        loop {
            match self.kind() {
                Tok::Semi => {
                    self.bump();
                    return;
                }
                Tok::RBrace | Tok::Eof => return,
                _ => {
                    self.bump();
                }
            }
        }
    }

    fn ident_text(&self, t: Token) -> String {
        self.strtab.get(t.value).to_string()
    }

    // ==========================================================================
    // Scopes
    // ==========================================================================

    fn enter_scope(&mut self) {
        self.scopes.push(self.syms.len());
    }

    fn leave_scope(&mut self) {
        if let Some(mark) = self.scopes.pop() {
            self.syms.truncate(mark);
        }
    }

    fn define(&mut self, name: &str, sym: CSym) {
        self.syms.push((name.to_string(), sym));
    }

    fn lookup(&self, name: &str) -> Option<&CSym> {
        self.syms
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s)
    }

    fn typedef_lookup(&self, name: &str) -> Option<CType> {
        match self.lookup(name) {
            Some(CSym::Typedef(ty)) => Some(ty.clone()),
            _ => None,
        }
    }

    // ==========================================================================
    // Types
    // ==========================================================================

    fn is_type_start(&self) -> bool {
        match self.kind() {
            Tok::KwVoid
            | Tok::KwChar
            | Tok::KwShort
            | Tok::KwInt
            | Tok::KwLong
            | Tok::KwSigned
            | Tok::KwUnsigned
            | Tok::KwFloat
            | Tok::KwDouble
            | Tok::KwConst
            | Tok::KwVolatile
            | Tok::KwStruct
            | Tok::KwUnion
            | Tok::KwEnum => true,
            Tok::Ident => self.typedef_lookup(&self.ident_text(self.cur())).is_some(),
            _ => false,
        }
    }

    /// Consumes a type specifier (qualifiers included) and returns the base
    /// type. Assumes `is_type_start()` held.
    fn type_spec(&mut self) -> CType {
        // Leading qualifiers.
        while matches!(self.kind(), Tok::KwConst | Tok::KwVolatile) {
            self.bump();
        }
        let ty = match self.kind() {
            Tok::KwVoid => {
                self.bump();
                CType::Void
            }
            Tok::KwChar => {
                self.bump();
                CType::Char
            }
            Tok::KwShort | Tok::KwInt | Tok::KwLong => {
                self.bump();
                // `long int`, `short int` and friends.
                self.eat(Tok::KwInt);
                CType::Int
            }
            Tok::KwSigned | Tok::KwUnsigned => {
                self.bump();
                match self.kind() {
                    Tok::KwChar => {
                        self.bump();
                        CType::Char
                    }
                    Tok::KwShort | Tok::KwInt | Tok::KwLong => {
                        self.bump();
                        self.eat(Tok::KwInt);
                        CType::Int
                    }
                    _ => CType::Int,
                }
            }
            Tok::KwFloat | Tok::KwDouble => {
                self.bump();
                self.error("floating point is not supported by the code generator".into());
                CType::Int
            }
            Tok::KwStruct | Tok::KwUnion => {
                self.bump();
                self.record_tag();
                // A bare `struct X { ... };` declaration is harmless; using
                // the tag as a value type is not.
                if self.kind() != Tok::Semi {
                    self.error(
                        "struct/union values are not supported by the code generator".into(),
                    );
                }
                CType::Int
            }
            Tok::KwEnum => {
                self.bump();
                self.enum_spec();
                CType::Int
            }
            Tok::Ident => {
                let name = self.ident_text(self.cur());
                match self.typedef_lookup(&name) {
                    Some(ty) => {
                        self.bump();
                        ty
                    }
                    None => {
                        self.error(format!("'{name}' is not a type name"));
                        self.bump();
                        CType::Int
                    }
                }
            }
            _ => {
                self.error("expected a type specifier".into());
                CType::Int
            }
        };
        // Trailing qualifiers.
        while matches!(self.kind(), Tok::KwConst | Tok::KwVolatile) {
            self.bump();
        }
        ty
    }

    /// `struct tag { ... }` - the tag and body are consumed so recovery can
    /// continue; the contents carry no meaning for the code generator.
    fn record_tag(&mut self) {
        if self.kind() == Tok::Ident {
            self.bump();
        }
        if self.kind() == Tok::LBrace {
            let mut depth = 0;
            loop {
                match self.kind() {
                    Tok::LBrace => {
                        depth += 1;
                        self.bump();
                    }
                    Tok::RBrace => {
                        self.bump();
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    Tok::Eof => break,
                    _ => {
                        self.bump();
                    }
                }
            }
        }
    }

    /// `enum tag { A, B = 5, ... }` - constants enter the symbol table as
    /// plain ints.
    fn enum_spec(&mut self) {
        if self.kind() == Tok::Ident {
            self.bump();
        }
        if !self.eat(Tok::LBrace) {
            return;
        }
        let mut next = 0i32;
        while self.kind() != Tok::RBrace && self.kind() != Tok::Eof {
            if self.kind() != Tok::Ident {
                self.error("expected enumerator name".into());
                self.sync();
                return;
            }
            let __tok = self.bump();
            let name = self.ident_text(__tok);
            if self.eat(Tok::Assign) {
                next = self.const_int().unwrap_or(next);
            }
            self.define(&name, CSym::EnumConst(next));
            next = next.wrapping_add(1);
            if !self.eat(Tok::Comma) {
                break;
            }
        }
        self.expect(Tok::RBrace, "'}' after enumerators");
    }

    /// A constant integer expression: literal, char literal, enum constant,
    /// optionally negated.
    fn const_int(&mut self) -> Option<i32> {
        let neg = self.eat(Tok::Minus);
        let t = self.cur();
        let v = match t.kind {
            Tok::Num | Tok::CharLit => {
                self.bump();
                t.value as i32
            }
            Tok::Ident => match self.lookup(&self.ident_text(t)) {
                Some(&CSym::EnumConst(v)) => {
                    self.bump();
                    v
                }
                _ => {
                    self.error("expected a constant expression".into());
                    return None;
                }
            },
            _ => {
                self.error("expected a constant expression".into());
                return None;
            }
        };
        Some(if neg { v.wrapping_neg() } else { v })
    }

    fn pointer_suffix(&mut self, mut ty: CType) -> CType {
        while self.eat(Tok::Star) {
            while matches!(self.kind(), Tok::KwConst | Tok::KwVolatile) {
                self.bump();
            }
            ty = CType::Ptr(Box::new(ty));
        }
        ty
    }

    // ==========================================================================
    // Top level
    // ==========================================================================

    fn top_level(&mut self) {
        if self.eat(Tok::Semi) {
            return;
        }
        if self.eat(Tok::KwTypedef) {
            let base = self.type_spec();
            let ty = self.pointer_suffix(base);
            if self.kind() != Tok::Ident {
                self.error("expected typedef name".into());
                self.sync();
                return;
            }
            let __tok = self.bump();
            let name = self.ident_text(__tok);
            self.define(&name, CSym::Typedef(ty));
            self.expect(Tok::Semi, "';' after typedef");
            return;
        }

        let is_static = self.eat(Tok::KwStatic);
        let is_extern = self.eat(Tok::KwExtern);
        if !self.is_type_start() {
            self.error("expected a declaration".into());
            self.sync();
            return;
        }
        let base = self.type_spec();

        // `struct X { ... };` or `enum E { ... };` with no declarator.
        if self.eat(Tok::Semi) {
            return;
        }

        let mut first = true;
        loop {
            let ty = self.pointer_suffix(base.clone());
            if self.kind() != Tok::Ident {
                self.error("expected declarator name".into());
                self.sync();
                return;
            }
            let __tok = self.bump();
            let name = self.ident_text(__tok);

            if first && self.kind() == Tok::LParen {
                self.function(&name, ty, is_static);
                return;
            }
            first = false;
            self.global_var(&name, ty, is_static, is_extern);

            if self.eat(Tok::Comma) {
                continue;
            }
            self.expect(Tok::Semi, "';' after declaration");
            return;
        }
    }

    fn global_var(&mut self, name: &str, mut ty: CType, is_static: bool, is_extern: bool) {
        if self.eat(Tok::LBracket) {
            let n = self.const_int().unwrap_or(1).max(0) as u32;
            self.expect(Tok::RBracket, "']' after array bound");
            ty = CType::Array(Box::new(ty), n);
        }
        let kind = if is_static {
            SymKind::Local
        } else {
            SymKind::Global
        };

        let sym = if is_extern {
            self.cg.declare_extern(name)
        } else if self.eat(Tok::Assign) {
            match self.kind() {
                Tok::Str => {
                    let t = self.bump();
                    let text = self.strtab.get(t.value).to_string();
                    let target = self.cg.intern_string(&text);
                    self.cg.define_data_ptr(name, kind, target)
                }
                _ => match self.const_int() {
                    Some(v) => {
                        if ty.is_ptr_like() && v != 0 {
                            self.error("pointer globals may only be initialised with a string or 0".into());
                        }
                        self.cg.define_data(name, kind, &v.to_le_bytes())
                    }
                    None => {
                        self.error(format!("unsupported initialiser for global '{name}'"));
                        self.sync();
                        return;
                    }
                },
            }
        } else {
            self.cg.define_bss(name, kind, ty.size().max(4))
        };
        self.define(name, CSym::Global { sym, ty });
        self.drain_cg_errors();
    }

    fn function(&mut self, name: &str, ret: CType, is_static: bool) {
        self.expect(Tok::LParen, "'('");
        let mut params: Vec<(String, CType)> = Vec::new();
        if !self.eat(Tok::RParen) {
            // `(void)` prototypes.
            let next_is_rparen = self
                .toks
                .get(self.pos + 1)
                .is_some_and(|t| t.kind == Tok::RParen);
            if self.kind() == Tok::KwVoid && next_is_rparen {
                self.bump();
                self.bump();
            } else {
                loop {
                    if self.eat(Tok::Ellipsis) {
                        self.error("variadic functions are not supported".into());
                        break;
                    }
                    if !self.is_type_start() {
                        self.error("expected parameter type".into());
                        break;
                    }
                    let base = self.type_spec();
                    let ty = self.pointer_suffix(base);
                    let pname = if self.kind() == Tok::Ident {
                        { let __tok = self.bump(); self.ident_text(__tok) }
                    } else {
                        String::new()
                    };
                    params.push((pname, ty));
                    if !self.eat(Tok::Comma) {
                        break;
                    }
                }
                self.expect(Tok::RParen, "')' after parameters");
            }
        }

        self.define(name, CSym::Func { ret: ret.clone() });

        if self.eat(Tok::Semi) {
            // Prototype only: the symbol appears when a call is emitted.
            return;
        }
        if !self.expect(Tok::LBrace, "function body") {
            self.sync();
            return;
        }

        let kind = if is_static {
            SymKind::Local
        } else {
            SymKind::Global
        };
        self.cg.begin_function(name, kind);
        self.enter_scope();

        if params.len() > 4 {
            self.error("more than four parameters are not supported".into());
        }
        for (i, (pname, pty)) in params.iter().enumerate().take(4) {
            let slot = self.cg.alloc_local(1);
            self.cg.store_param(i as u32);
            if !pname.is_empty() {
                self.define(
                    pname,
                    CSym::Local {
                        slot,
                        ty: pty.clone(),
                    },
                );
            }
        }

        while self.kind() != Tok::RBrace && self.kind() != Tok::Eof && !self.diags.at_limit() {
            self.stmt();
        }
        self.expect(Tok::RBrace, "'}' at end of function");

        self.leave_scope();
        self.cg.end_function(name);
        self.drain_cg_errors();
    }

    // ==========================================================================
    // Statements
    // ==========================================================================

    fn stmt(&mut self) {
        match self.kind() {
            Tok::LBrace => {
                self.bump();
                self.enter_scope();
                while self.kind() != Tok::RBrace
                    && self.kind() != Tok::Eof
                    && !self.diags.at_limit()
                {
                    self.stmt();
                }
                self.expect(Tok::RBrace, "'}'");
                self.leave_scope();
            }
            Tok::KwIf => self.stmt_if(),
            Tok::KwWhile => self.stmt_while(),
            Tok::KwDo => self.stmt_do(),
            Tok::KwFor => self.stmt_for(),
            Tok::KwReturn => {
                self.bump();
                if self.kind() != Tok::Semi {
                    let v = self.expr();
                    self.rvalue(v);
                }
                let epi = self.cg.epilogue_label();
                self.cg.branch(epi);
                self.expect(Tok::Semi, "';' after return");
            }
            Tok::KwBreak => {
                self.bump();
                match self.cg.current_loop() {
                    Some(frame) => self.cg.branch(frame.break_to),
                    None => self.error("break outside of a loop".into()),
                }
                self.expect(Tok::Semi, "';' after break");
            }
            Tok::KwContinue => {
                self.bump();
                match self.cg.current_loop() {
                    Some(frame) => self.cg.branch(frame.continue_to),
                    None => self.error("continue outside of a loop".into()),
                }
                self.expect(Tok::Semi, "';' after continue");
            }
            Tok::Semi => {
                self.bump();
            }
            Tok::KwSwitch => {
                // Parsed for recovery; lowering is not implemented.
                self.error("switch is not supported by the code generator".into());
                self.bump();
                if self.eat(Tok::LParen) {
                    let v = self.expr();
                    self.rvalue(v);
                    self.expect(Tok::RParen, "')'");
                }
                self.stmt();
            }
            Tok::KwCase | Tok::KwDefault => {
                self.error("case label outside a supported switch".into());
                self.sync();
            }
            Tok::KwGoto => {
                self.error("goto is not supported by the code generator".into());
                self.bump();
                if self.kind() == Tok::Ident {
                    self.bump();
                }
                self.expect(Tok::Semi, "';' after goto");
            }
            Tok::KwStatic | Tok::KwRegister | Tok::KwAuto => {
                self.bump();
                self.stmt_decl();
            }
            _ if self.is_type_start() => self.stmt_decl(),
            _ => {
                self.expr();
                if !self.expect(Tok::Semi, "';' after expression") {
                    self.sync();
                }
            }
        }
    }

    fn stmt_decl(&mut self) {
        let base = self.type_spec();
        loop {
            let mut ty = self.pointer_suffix(base.clone());
            if self.kind() != Tok::Ident {
                self.error("expected variable name".into());
                self.sync();
                return;
            }
            let __tok = self.bump();
            let name = self.ident_text(__tok);

            let slot;
            if self.eat(Tok::LBracket) {
                let n = self.const_int().unwrap_or(1).max(0) as u32;
                self.expect(Tok::RBracket, "']' after array bound");
                ty = CType::Array(Box::new(ty), n);
                let words = (ty.size() + 3) / 4;
                slot = self.cg.alloc_local(words.max(1));
            } else {
                slot = self.cg.alloc_local(1);
            }
            self.define(
                &name,
                CSym::Local {
                    slot,
                    ty: ty.clone(),
                },
            );

            if self.eat(Tok::Assign) {
                let v = self.expr_assign();
                self.rvalue(v);
                self.cg.store_local(slot);
            }

            if self.eat(Tok::Comma) {
                continue;
            }
            self.expect(Tok::Semi, "';' after declaration");
            return;
        }
    }

    fn stmt_if(&mut self) {
        self.bump();
        self.expect(Tok::LParen, "'(' after if");
        let v = self.expr();
        self.rvalue(v);
        self.expect(Tok::RParen, "')'");

        let else_l = self.cg.new_label();
        self.cg.branch_if_zero(else_l);
        self.stmt();

        if self.eat(Tok::KwElse) {
            let end_l = self.cg.new_label();
            self.cg.branch(end_l);
            self.cg.bind_label(else_l);
            self.stmt();
            self.cg.bind_label(end_l);
        } else {
            self.cg.bind_label(else_l);
        }
    }

    fn stmt_while(&mut self) {
        self.bump();
        let cond_l = self.cg.new_label();
        let end_l = self.cg.new_label();
        self.cg.bind_label(cond_l);

        self.expect(Tok::LParen, "'(' after while");
        let v = self.expr();
        self.rvalue(v);
        self.expect(Tok::RParen, "')'");
        self.cg.branch_if_zero(end_l);

        self.cg.push_loop(LoopFrame {
            break_to: end_l,
            continue_to: cond_l,
        });
        self.stmt();
        self.cg.pop_loop();

        self.cg.branch(cond_l);
        self.cg.bind_label(end_l);
    }

    fn stmt_do(&mut self) {
        self.bump();
        let body_l = self.cg.new_label();
        let cond_l = self.cg.new_label();
        let end_l = self.cg.new_label();
        self.cg.bind_label(body_l);

        self.cg.push_loop(LoopFrame {
            break_to: end_l,
            continue_to: cond_l,
        });
        self.stmt();
        self.cg.pop_loop();

        self.cg.bind_label(cond_l);
        self.expect(Tok::KwWhile, "'while' after do body");
        self.expect(Tok::LParen, "'('");
        let v = self.expr();
        self.rvalue(v);
        self.expect(Tok::RParen, "')'");
        self.cg.branch_if_nonzero(body_l);
        self.cg.bind_label(end_l);
        self.expect(Tok::Semi, "';' after do-while");
    }

    /// for-loops run the increment after the body through a three-label
    /// jump scheme, so the single pass can emit it in source order:
    ///
    ///   init; cond: test -> end; goto body
    ///   incr: increment; goto cond
    ///   body: ...; goto incr; end:
    fn stmt_for(&mut self) {
        self.bump();
        self.expect(Tok::LParen, "'(' after for");
        self.enter_scope();

        if self.kind() != Tok::Semi {
            self.expr();
        }
        self.expect(Tok::Semi, "';' after for-init");

        let cond_l = self.cg.new_label();
        let incr_l = self.cg.new_label();
        let body_l = self.cg.new_label();
        let end_l = self.cg.new_label();

        self.cg.bind_label(cond_l);
        if self.kind() != Tok::Semi {
            let v = self.expr();
            self.rvalue(v);
            self.cg.branch_if_zero(end_l);
        }
        self.expect(Tok::Semi, "';' after for-condition");
        self.cg.branch(body_l);

        self.cg.bind_label(incr_l);
        if self.kind() != Tok::RParen {
            self.expr();
        }
        self.expect(Tok::RParen, "')' after for-increment");
        self.cg.branch(cond_l);

        self.cg.bind_label(body_l);
        self.cg.push_loop(LoopFrame {
            break_to: end_l,
            continue_to: incr_l,
        });
        self.stmt();
        self.cg.pop_loop();
        self.cg.branch(incr_l);
        self.cg.bind_label(end_l);

        self.leave_scope();
    }

    // ==========================================================================
    // Values
    // ==========================================================================

    /// Materialises a Val into r0 and returns its (decayed) type.
    fn rvalue(&mut self, v: Val) -> CType {
        match v.lv {
            Lv::None => v.ty,
            Lv::Local(slot) => {
                if matches!(v.ty, CType::Array(_, _)) {
                    self.cg.load_local_addr(slot);
                } else {
                    self.cg.load_local(slot);
                }
                v.ty.decay()
            }
            Lv::Sym(sym) => {
                self.cg.load_symbol_addr(sym);
                if !matches!(v.ty, CType::Array(_, _)) {
                    self.cg.load_indirect(v.ty.is_byte());
                }
                v.ty.decay()
            }
            Lv::Ind => {
                self.cg.load_indirect(v.ty.is_byte());
                v.ty.decay()
            }
        }
    }

    /// Emits the lvalue's address into r0. False if the Val is not an
    /// lvalue.
    fn lv_addr(&mut self, v: &Val) -> bool {
        match v.lv {
            Lv::Local(slot) => {
                self.cg.load_local_addr(slot);
                true
            }
            Lv::Sym(sym) => {
                self.cg.load_symbol_addr(sym);
                true
            }
            Lv::Ind => true,
            Lv::None => false,
        }
    }

    // ==========================================================================
    // Expressions, lowest precedence first
    // ==========================================================================

    fn expr(&mut self) -> Val {
        let mut v = self.expr_assign();
        while self.eat(Tok::Comma) {
            // Left side evaluated for effect only.
            v = self.expr_assign();
        }
        v
    }

    fn assign_op(k: Tok) -> Option<Option<BinOp>> {
        match k {
            Tok::Assign => Some(None),
            Tok::PlusEq => Some(Some(BinOp::Add)),
            Tok::MinusEq => Some(Some(BinOp::Sub)),
            Tok::StarEq => Some(Some(BinOp::Mul)),
            Tok::SlashEq => Some(Some(BinOp::Div)),
            Tok::PercentEq => Some(Some(BinOp::Mod)),
            Tok::AmpEq => Some(Some(BinOp::And)),
            Tok::PipeEq => Some(Some(BinOp::Or)),
            Tok::CaretEq => Some(Some(BinOp::Xor)),
            Tok::ShlEq => Some(Some(BinOp::Shl)),
            Tok::ShrEq => Some(Some(BinOp::Shr)),
            _ => None,
        }
    }

    fn expr_assign(&mut self) -> Val {
        let lhs = self.expr_ternary();
        let Some(op) = Self::assign_op(self.kind()) else {
            return lhs;
        };
        self.bump();

        if lhs.lv == Lv::None {
            self.error("expression is not assignable".into());
            return self.expr_assign();
        }
        let byte = lhs.ty.is_byte();

        match (lhs.lv, op) {
            (Lv::Local(slot), None) => {
                let rhs = self.expr_assign();
                self.rvalue(rhs);
                self.cg.store_local(slot);
            }
            (Lv::Local(slot), Some(op)) => {
                self.cg.load_local(slot);
                self.cg.push_r0();
                let rhs = self.expr_assign();
                self.rvalue(rhs);
                self.cg.binop_operands();
                self.cg.binop(op);
                self.cg.store_local(slot);
            }
            (_, None) => {
                self.lv_addr(&lhs);
                self.cg.push_r0();
                let rhs = self.expr_assign();
                self.rvalue(rhs);
                self.cg.pop_r1();
                self.cg.store_indirect(byte);
            }
            (_, Some(op)) => {
                self.lv_addr(&lhs);
                self.cg.push_r0(); // address
                self.cg.load_indirect(byte); // old value
                self.cg.push_r0();
                let rhs = self.expr_assign();
                self.rvalue(rhs);
                self.cg.binop_operands();
                self.cg.binop(op);
                self.cg.pop_r1(); // address
                self.cg.store_indirect(byte);
            }
        }
        Val::rvalue(lhs.ty)
    }

    fn expr_ternary(&mut self) -> Val {
        let cond = self.expr_lor();
        if !self.eat(Tok::Question) {
            return cond;
        }
        self.rvalue(cond);
        let else_l = self.cg.new_label();
        let end_l = self.cg.new_label();
        self.cg.branch_if_zero(else_l);

        let then = self.expr();
        let then_ty = self.rvalue(then);
        self.cg.branch(end_l);
        self.expect(Tok::Colon, "':' in conditional expression");

        self.cg.bind_label(else_l);
        let other = self.expr_ternary();
        self.rvalue(other);
        self.cg.bind_label(end_l);
        Val::rvalue(then_ty)
    }

    fn expr_lor(&mut self) -> Val {
        let lhs = self.expr_land();
        if self.kind() != Tok::OrOr {
            return lhs;
        }
        self.rvalue(lhs);
        let true_l = self.cg.new_label();
        let end_l = self.cg.new_label();
        self.cg.branch_if_nonzero(true_l);
        while self.eat(Tok::OrOr) {
            let rhs = self.expr_land();
            self.rvalue(rhs);
            self.cg.branch_if_nonzero(true_l);
        }
        self.cg.load_imm(0);
        self.cg.branch(end_l);
        self.cg.bind_label(true_l);
        self.cg.load_imm(1);
        self.cg.bind_label(end_l);
        Val::rvalue(CType::Int)
    }

    fn expr_land(&mut self) -> Val {
        let lhs = self.expr_bor();
        if self.kind() != Tok::AndAnd {
            return lhs;
        }
        self.rvalue(lhs);
        let false_l = self.cg.new_label();
        let end_l = self.cg.new_label();
        self.cg.branch_if_zero(false_l);
        while self.eat(Tok::AndAnd) {
            let rhs = self.expr_bor();
            self.rvalue(rhs);
            self.cg.branch_if_zero(false_l);
        }
        self.cg.load_imm(1);
        self.cg.branch(end_l);
        self.cg.bind_label(false_l);
        self.cg.load_imm(0);
        self.cg.bind_label(end_l);
        Val::rvalue(CType::Int)
    }

    fn binary_level(
        &mut self,
        next: fn(&mut Self) -> Val,
        ops: &[(Tok, BinOp)],
    ) -> Val {
        let mut lhs = next(self);
        loop {
            let Some(&(_, op)) = ops.iter().find(|(t, _)| *t == self.kind()) else {
                return lhs;
            };
            self.bump();
            self.rvalue(lhs);
            self.cg.push_r0();
            let rhs = next(self);
            self.rvalue(rhs);
            self.cg.binop_operands();
            self.cg.binop(op);
            lhs = Val::rvalue(CType::Int);
        }
    }

    fn expr_bor(&mut self) -> Val {
        self.binary_level(Self::expr_bxor, &[(Tok::Pipe, BinOp::Or)])
    }

    fn expr_bxor(&mut self) -> Val {
        self.binary_level(Self::expr_band, &[(Tok::Caret, BinOp::Xor)])
    }

    fn expr_band(&mut self) -> Val {
        self.binary_level(Self::expr_eq, &[(Tok::Amp, BinOp::And)])
    }

    fn expr_eq(&mut self) -> Val {
        self.binary_level(
            Self::expr_rel,
            &[(Tok::EqEq, BinOp::Eq), (Tok::Ne, BinOp::Ne)],
        )
    }

    fn expr_rel(&mut self) -> Val {
        self.binary_level(
            Self::expr_shift,
            &[
                (Tok::Lt, BinOp::Lt),
                (Tok::Gt, BinOp::Gt),
                (Tok::Le, BinOp::Le),
                (Tok::Ge, BinOp::Ge),
            ],
        )
    }

    fn expr_shift(&mut self) -> Val {
        self.binary_level(
            Self::expr_add,
            &[(Tok::Shl, BinOp::Shl), (Tok::Shr, BinOp::Shr)],
        )
    }

    /// Additive level carries the pointer arithmetic: ptr +/- int scales
    /// the integer by the element size, ptr - ptr scales the result down.
    fn expr_add(&mut self) -> Val {
        let mut lhs = self.expr_mul();
        loop {
            let op = match self.kind() {
                Tok::Plus => BinOp::Add,
                Tok::Minus => BinOp::Sub,
                _ => return lhs,
            };
            self.bump();
            let lty = self.rvalue(lhs);
            self.cg.push_r0();
            let rhs = self.expr_mul();
            let rty = self.rvalue(rhs);

            let elem_size = lty.elem().map(CType::size).unwrap_or(0);
            if lty.is_ptr_like() && !rty.is_ptr_like() {
                self.cg.scale_by(elem_size);
            }
            self.cg.binop_operands();
            self.cg.binop(op);

            if op == BinOp::Sub && lty.is_ptr_like() && rty.is_ptr_like() {
                if elem_size == 4 {
                    self.cg.shr_imm(2);
                }
                lhs = Val::rvalue(CType::Int);
            } else if lty.is_ptr_like() {
                lhs = Val::rvalue(lty);
            } else {
                lhs = Val::rvalue(CType::Int);
            }
        }
    }

    fn expr_mul(&mut self) -> Val {
        self.binary_level(
            Self::expr_unary,
            &[
                (Tok::Star, BinOp::Mul),
                (Tok::Slash, BinOp::Div),
                (Tok::Percent, BinOp::Mod),
            ],
        )
    }

    fn expr_unary(&mut self) -> Val {
        match self.kind() {
            Tok::Minus => {
                self.bump();
                let v = self.expr_unary();
                let ty = self.rvalue(v);
                self.cg.negate();
                Val::rvalue(ty)
            }
            Tok::Bang => {
                self.bump();
                let v = self.expr_unary();
                self.rvalue(v);
                self.cg.logical_not();
                Val::rvalue(CType::Int)
            }
            Tok::Tilde => {
                self.bump();
                let v = self.expr_unary();
                let ty = self.rvalue(v);
                self.cg.bit_not();
                Val::rvalue(ty)
            }
            Tok::Plus => {
                self.bump();
                self.expr_unary()
            }
            Tok::Star => {
                self.bump();
                let v = self.expr_unary();
                let ty = self.rvalue(v);
                match ty.elem() {
                    Some(e) => Val {
                        ty: e.clone(),
                        lv: Lv::Ind,
                    },
                    None => {
                        self.error("cannot dereference a non-pointer".into());
                        Val::rvalue(CType::Int)
                    }
                }
            }
            Tok::Amp => {
                self.bump();
                let v = self.expr_unary();
                if self.lv_addr(&v) {
                    Val::rvalue(CType::Ptr(Box::new(v.ty)))
                } else {
                    self.error("cannot take the address of this expression".into());
                    Val::rvalue(CType::Int)
                }
            }
            Tok::Inc | Tok::Dec => {
                let inc = self.kind() == Tok::Inc;
                self.bump();
                let v = self.expr_unary();
                self.prefix_incdec(v, inc)
            }
            Tok::KwSizeof => {
                self.bump();
                self.expect(Tok::LParen, "'(' after sizeof");
                if self.is_type_start() {
                    let base = self.type_spec();
                    let ty = self.pointer_suffix(base);
                    self.expect(Tok::RParen, "')'");
                    self.cg.load_imm(ty.size() as i32);
                } else {
                    self.error("sizeof of expressions is not supported".into());
                    self.expr();
                    self.expect(Tok::RParen, "')'");
                    self.cg.load_imm(4);
                }
                Val::rvalue(CType::Int)
            }
            _ => self.expr_postfix(),
        }
    }

    fn step_of(&self, ty: &CType) -> u32 {
        match ty.elem() {
            Some(e) => e.size().max(1),
            None => 1,
        }
    }

    fn prefix_incdec(&mut self, v: Val, inc: bool) -> Val {
        let step = self.step_of(&v.ty);
        if step > 255 {
            self.error("increment step out of range".into());
            return Val::rvalue(v.ty);
        }
        let byte = v.ty.is_byte();
        match v.lv {
            Lv::Local(slot) => {
                self.cg.load_local(slot);
                if inc {
                    self.cg.add_imm(step as u8);
                } else {
                    self.cg.sub_imm(step as u8);
                }
                self.cg.store_local(slot);
            }
            Lv::Sym(_) | Lv::Ind => {
                self.lv_addr(&v);
                self.cg.push_r0();
                self.cg.load_indirect(byte);
                if inc {
                    self.cg.add_imm(step as u8);
                } else {
                    self.cg.sub_imm(step as u8);
                }
                self.cg.pop_r1();
                self.cg.store_indirect(byte);
            }
            Lv::None => {
                self.error("operand of ++/-- is not assignable".into());
            }
        }
        Val::rvalue(v.ty)
    }

    fn postfix_incdec(&mut self, v: Val, inc: bool) -> Val {
        let step = self.step_of(&v.ty);
        if step > 255 {
            self.error("increment step out of range".into());
            return Val::rvalue(v.ty);
        }
        let byte = v.ty.is_byte();
        match v.lv {
            Lv::Local(slot) => {
                self.cg.load_local(slot);
                if inc {
                    self.cg.add_imm(step as u8);
                } else {
                    self.cg.sub_imm(step as u8);
                }
                self.cg.store_local(slot);
            }
            Lv::Sym(_) | Lv::Ind => {
                self.lv_addr(&v);
                self.cg.push_r0();
                self.cg.load_indirect(byte);
                if inc {
                    self.cg.add_imm(step as u8);
                } else {
                    self.cg.sub_imm(step as u8);
                }
                self.cg.pop_r1();
                self.cg.store_indirect(byte);
            }
            Lv::None => {
                self.error("operand of ++/-- is not assignable".into());
                return Val::rvalue(v.ty);
            }
        }
        // The expression's value is the old one.
        if inc {
            self.cg.sub_imm(step as u8);
        } else {
            self.cg.add_imm(step as u8);
        }
        Val::rvalue(v.ty)
    }

    fn expr_postfix(&mut self) -> Val {
        let mut v = self.expr_primary();
        loop {
            match self.kind() {
                Tok::LBracket => {
                    self.bump();
                    v = self.subscript(v);
                }
                Tok::Inc => {
                    self.bump();
                    v = self.postfix_incdec(v, true);
                }
                Tok::Dec => {
                    self.bump();
                    v = self.postfix_incdec(v, false);
                }
                Tok::Dot | Tok::Arrow => {
                    self.error("struct member access is not supported by the code generator".into());
                    self.bump();
                    if self.kind() == Tok::Ident {
                        self.bump();
                    }
                    v = Val::rvalue(CType::Int);
                }
                _ => return v,
            }
        }
    }

    fn subscript(&mut self, base: Val) -> Val {
        // Base address into r0: arrays by address, pointers by value.
        let is_array = matches!(base.ty, CType::Array(_, _));
        let base_ty = match base.lv {
            Lv::Local(slot) if is_array => {
                self.cg.load_local_addr(slot);
                base.ty
            }
            Lv::Sym(sym) if is_array => {
                self.cg.load_symbol_addr(sym);
                base.ty
            }
            _ => self.rvalue(base),
        };
        let elem = match base_ty.elem() {
            Some(e) => e.clone(),
            None => {
                self.error("subscript of a non-array value".into());
                CType::Int
            }
        };
        self.cg.push_r0();
        let idx = self.expr();
        self.rvalue(idx);
        self.expect(Tok::RBracket, "']' after subscript");
        self.cg.scale_by(elem.size());
        self.cg.pop_r1();
        self.cg.binop(BinOp::Add);
        Val {
            ty: elem,
            lv: Lv::Ind,
        }
    }

    fn expr_primary(&mut self) -> Val {
        let t = self.cur();
        match t.kind {
            Tok::Num | Tok::CharLit => {
                self.bump();
                self.cg.load_imm(t.value as i32);
                Val::rvalue(CType::Int)
            }
            Tok::Str => {
                self.bump();
                let text = self.strtab.get(t.value).to_string();
                let sym = self.cg.intern_string(&text);
                self.cg.load_symbol_addr(sym);
                Val::rvalue(CType::Ptr(Box::new(CType::Char)))
            }
            Tok::Ident => {
                let name = self.ident_text(t);
                self.bump();
                if self.kind() == Tok::LParen {
                    self.bump();
                    return self.call(&name);
                }
                match self.lookup(&name).cloned() {
                    Some(CSym::Local { slot, ty }) => Val {
                        ty,
                        lv: Lv::Local(slot),
                    },
                    Some(CSym::Global { sym, ty }) => Val {
                        ty,
                        lv: Lv::Sym(sym),
                    },
                    Some(CSym::EnumConst(v)) => {
                        self.cg.load_imm(v);
                        Val::rvalue(CType::Int)
                    }
                    Some(CSym::Func { .. }) => {
                        self.error(format!("function '{name}' used as a value"));
                        self.cg.load_imm(0);
                        Val::rvalue(CType::Int)
                    }
                    Some(CSym::Typedef(_)) | None => {
                        self.error(format!("undeclared identifier '{name}'"));
                        self.cg.load_imm(0);
                        Val::rvalue(CType::Int)
                    }
                }
            }
            Tok::LParen => {
                self.bump();
                if self.is_type_start() {
                    // Cast: all supported types are register-width or
                    // narrower, so the cast only changes the static type.
                    let base = self.type_spec();
                    let ty = self.pointer_suffix(base);
                    self.expect(Tok::RParen, "')' after cast");
                    let v = self.expr_unary();
                    self.rvalue(v);
                    Val::rvalue(ty)
                } else {
                    let v = self.expr();
                    self.expect(Tok::RParen, "')'");
                    v
                }
            }
            _ => {
                self.error("expected an expression".into());
                self.bump();
                self.cg.load_imm(0);
                Val::rvalue(CType::Int)
            }
        }
    }

    fn call(&mut self, name: &str) -> Val {
        let ret = match self.lookup(name) {
            Some(CSym::Func { ret }) => ret.clone(),
            _ => CType::Int,
        };

        let mut nargs: u32 = 0;
        while self.kind() != Tok::RParen && self.kind() != Tok::Eof {
            let a = self.expr_assign();
            self.rvalue(a);
            self.cg.push_r0();
            nargs += 1;
            if !self.eat(Tok::Comma) {
                break;
            }
        }
        self.expect(Tok::RParen, "')' after arguments");
        if nargs > 4 {
            self.error(format!("too many arguments to '{name}' (four registers)"));
            return Val::rvalue(ret);
        }
        self.cg.pop_args(nargs);

        if let Some(num) = syscall::by_name(name) {
            self.cg.note_syscall_symbol(name, num);
            self.cg.syscall(num);
        } else {
            let sym = self.cg.symbol_for_call(name);
            self.cg.call(sym);
        }
        Val::rvalue(ret)
    }
}
