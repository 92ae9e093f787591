// mimic-cc - C compiler and linker targeting the MIMI container
//
// The pipeline is disk-buffered like the original toolchain: each source
// is lexed to a `.tok` intermediate, read back and compiled to a `.o`
// object blob, and the objects are merged into the final `.mimi` image.
// Intermediates live in a temporary directory and are deleted with it.
//
// # Phases
//
// 1. **Lexing** (`lexer.rs`): bytes -> tokens + string table
// 2. **Parse + codegen** (`parser.rs`, `codegen.rs`): tokens -> Thumb-2
//    object blob, single pass, no tree
// 3. **Link** (`linker.rs`): object blobs -> MIMI image

pub mod codegen;
pub mod diag;
pub mod lexer;
pub mod linker;
pub mod parser;
pub mod thumb;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::info;

use mimi::err::ErrCode;
use mimi::obj::Object;

use diag::Diag;

/// A failed compile or link: the numeric code plus the recorded
/// diagnostics (empty for plain I/O failures).
#[derive(Debug)]
pub struct CompileError {
    pub code: ErrCode,
    pub diags: Vec<Diag>,
}

impl CompileError {
    fn io(code: ErrCode, msg: String) -> CompileError {
        CompileError {
            code,
            diags: vec![Diag {
                line: 0,
                col: 0,
                msg,
            }],
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.diags.first() {
            Some(d) => write!(f, "{} ({})", d, self.code),
            None => write!(f, "{}", self.code),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<linker::LinkError> for CompileError {
    fn from(e: linker::LinkError) -> Self {
        CompileError {
            code: e.code,
            diags: e
                .messages
                .into_iter()
                .map(|msg| Diag {
                    line: 0,
                    col: 0,
                    msg,
                })
                .collect(),
        }
    }
}

/// Compiles one C source to an object blob at `obj_out`, staging the token
/// stream through `tok_out` on the way (the disk-buffered pass structure).
pub fn compile_file(src: &Path, tok_out: &Path, obj_out: &Path) -> Result<(), CompileError> {
    let source = fs::read_to_string(src)
        .map_err(|e| CompileError::io(ErrCode::from(e), format!("cannot read {}", src.display())))?;
    let dir = src.parent().unwrap_or(Path::new("."));

    let mut diags = diag::Diagnostics::new();

    // Pass 1: lex, spill to disk.
    let stream = lexer::tokenize(&source, dir, &mut diags);
    let mut tok_file = fs::File::create(tok_out)
        .map_err(|e| CompileError::io(ErrCode::from(e), "cannot create token file".into()))?;
    stream
        .write_to(&mut tok_file)
        .map_err(|e| CompileError::io(ErrCode::from(e), "cannot write token file".into()))?;
    drop(tok_file);
    info!("[CC] {}: {} tokens", src.display(), stream.tokens.len());

    // Pass 2: read the token stream back and compile it.
    let mut tok_file = fs::File::open(tok_out)
        .map_err(|e| CompileError::io(ErrCode::from(e), "cannot reopen token file".into()))?;
    let stream = lexer::TokenStream::read_from(&mut tok_file)
        .map_err(|_| CompileError::io(ErrCode::Corrupt, "token stream is corrupt".into()))?;
    let object = parser::parse(&stream, &mut diags);

    if !diags.is_empty() {
        return Err(CompileError {
            code: ErrCode::Corrupt,
            diags: diags.iter().cloned().collect(),
        });
    }

    let mut obj_file = fs::File::create(obj_out)
        .map_err(|e| CompileError::io(ErrCode::from(e), "cannot create object file".into()))?;
    object
        .write_to(&mut obj_file)
        .map_err(|e| CompileError::io(ErrCode::from(e), "cannot write object file".into()))?;
    info!(
        "[CC] {}: {} bytes text, {} relocs",
        src.display(),
        object.text.len(),
        object.relocs.len()
    );
    Ok(())
}

/// Links object files into a MIMI at `out`. The image name is the output
/// file stem.
pub fn link_files(obj_paths: &[PathBuf], out: &Path) -> Result<(), CompileError> {
    let mut objects = Vec::with_capacity(obj_paths.len());
    for path in obj_paths {
        let mut f = fs::File::open(path).map_err(|e| {
            CompileError::io(ErrCode::from(e), format!("cannot open {}", path.display()))
        })?;
        let obj = Object::read_from(&mut f).map_err(|code| {
            CompileError::io(code, format!("object {} is corrupt", path.display()))
        })?;
        objects.push(obj);
    }

    let name = out
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("program");
    let image = linker::link(&objects, name)?;

    let mut out_file = fs::File::create(out)
        .map_err(|e| CompileError::io(ErrCode::from(e), "cannot create output".into()))?;
    image
        .write_to(&mut out_file)
        .map_err(|e| CompileError::io(ErrCode::from(e), "cannot write output".into()))?;
    Ok(())
}

/// The whole pipeline: every source through lex/compile, then one link.
/// Intermediates are staged in a temporary directory and removed with it.
pub fn compile_and_link(sources: &[PathBuf], out: &Path) -> Result<(), CompileError> {
    let tmp = tempfile::tempdir()
        .map_err(|e| CompileError::io(ErrCode::from(e), "cannot create temp dir".into()))?;

    let mut objects = Vec::with_capacity(sources.len());
    for (i, src) in sources.iter().enumerate() {
        let tok = tmp.path().join(format!("unit{i}.tok"));
        let obj = tmp.path().join(format!("unit{i}.o"));
        compile_file(src, &tok, &obj)?;
        objects.push(obj);
    }
    link_files(&objects, out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mimi::format::Image;

    fn write_src(dir: &Path, name: &str, text: &str) -> PathBuf {
        let p = dir.join(name);
        fs::write(&p, text).unwrap();
        p
    }

    #[test]
    fn end_to_end_single_unit() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_src(dir.path(), "r42.c", "int main() { return 42; }");
        let out = dir.path().join("r42.mimi");
        compile_and_link(&[src], &out).unwrap();

        let mut f = fs::File::open(&out).unwrap();
        let img = Image::read_from(&mut f).unwrap();
        assert!(img.header.text_size > 0);
        assert!(img.header.symbol_count >= 1);
        assert_eq!(img.header.name_str(), "r42");
        // Entry offset equals main's section-relative value.
        let main = img.symbols.iter().find(|s| s.name_str() == "main").unwrap();
        assert_eq!(img.header.entry_offset, main.value);
    }

    #[test]
    fn syntax_errors_surface_as_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_src(dir.path(), "bad.c", "int main( { return; }");
        let out = dir.path().join("bad.mimi");
        let err = compile_and_link(&[src], &out).unwrap_err();
        assert_eq!(err.code, ErrCode::Corrupt);
        assert!(!err.diags.is_empty());
        assert!(err.diags[0].line > 0);
    }

    #[test]
    fn two_units_link_with_cross_call() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_src(dir.path(), "a.c", "int add(int x, int y) { return x + y; }");
        let b = write_src(dir.path(), "b.c", "int add(int x, int y); int main() { return add(40, 2); }");
        let out = dir.path().join("two.mimi");
        compile_and_link(&[a, b], &out).unwrap();

        let mut f = fs::File::open(&out).unwrap();
        let img = Image::read_from(&mut f).unwrap();
        let add = img.symbols.iter().find(|s| s.name_str() == "add").unwrap();
        assert_eq!(add.kind, mimi::format::SymKind::Global);
        // The call reloc in b's text resolves to the merged `add`.
        let call = img
            .relocs
            .iter()
            .find(|r| r.kind == mimi::format::RelocKind::ThumbCall)
            .unwrap();
        assert_eq!(img.symbols[call.symbol as usize].name_str(), "add");
    }

    #[test]
    fn duplicate_mains_across_units() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_src(dir.path(), "a.c", "int main() { return 1; }");
        let b = write_src(dir.path(), "b.c", "int main() { return 2; }");
        let out = dir.path().join("dup.mimi");
        let err = compile_and_link(&[a, b], &out).unwrap_err();
        assert_eq!(err.code, ErrCode::Corrupt);
        assert!(err.diags.iter().any(|d| d.msg.contains("multiple definition")));
    }
}
