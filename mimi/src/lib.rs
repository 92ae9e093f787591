// mimi - the MIMI container format and loader/compiler ABI
//
// Everything the compiler and the runtime must agree on byte-for-byte lives
// here: the container header and its symbol/relocation records, the
// intermediate object-blob format, the syscall number space, the wide
// Thumb-2 branch encodings the loader patches, and the numeric error codes
// surfaced to user programs.

pub mod err;
pub mod format;
pub mod obj;
pub mod syscall;
pub mod thumb;

pub use err::ErrCode;
pub use format::{Arch, Header, Image, Reloc, RelocKind, Section, SymKind, Symbol};
pub use obj::Object;
