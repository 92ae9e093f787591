// fs.rs - the filesystem collaborator
//
// The runtime consumes a byte-stream file abstraction; the block device
// and FAT32 layer behind it are somebody else's problem. The host
// implementation maps the same surface onto std::fs under a root
// directory, with a fixed-capacity handle table in place of the
// reference's global descriptor array.

use std::collections::VecDeque;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use bitflags::bitflags;

use mimi::err::ErrCode;

bitflags! {
    /// Open-mode bitmask shared with the syscall ABI.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenMode: u32 {
        const READ = 1;
        const WRITE = 2;
        const APPEND = 4;
        const CREATE = 8;
        const TRUNC = 16;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set = 0,
    Cur = 1,
    End = 2,
}

impl Whence {
    pub fn from_u32(v: u32) -> Option<Whence> {
        match v {
            0 => Some(Whence::Set),
            1 => Some(Whence::Cur),
            2 => Some(Whence::End),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub size: u32,
    pub attr: u8,
    pub is_dir: bool,
}

/// The operations the loader, compiler intermediates and user-program
/// syscalls are allowed to rely on.
pub trait FileSys {
    fn open(&mut self, path: &str, mode: OpenMode) -> Result<u32, ErrCode>;
    fn close(&mut self, handle: u32) -> Result<(), ErrCode>;
    fn read(&mut self, handle: u32, buf: &mut [u8]) -> Result<u32, ErrCode>;
    fn write(&mut self, handle: u32, buf: &[u8]) -> Result<u32, ErrCode>;
    fn seek(&mut self, handle: u32, offset: i32, whence: Whence) -> Result<u32, ErrCode>;
    fn tell(&mut self, handle: u32) -> Result<u32, ErrCode>;
    fn exists(&self, path: &str) -> bool;
    fn is_dir(&self, path: &str) -> bool;
    fn open_dir(&mut self, path: &str) -> Result<u32, ErrCode>;
    fn read_dir(&mut self, handle: u32) -> Result<Option<DirEntry>, ErrCode>;
    fn close_dir(&mut self, handle: u32) -> Result<(), ErrCode>;
}

/// Scoped handle: closes on every exit path, success or error.
pub struct ScopedFile<'a> {
    fs: &'a mut dyn FileSys,
    handle: u32,
}

impl<'a> ScopedFile<'a> {
    pub fn open(fs: &'a mut dyn FileSys, path: &str, mode: OpenMode) -> Result<Self, ErrCode> {
        let handle = fs.open(path, mode)?;
        Ok(ScopedFile { fs, handle })
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<u32, ErrCode> {
        self.fs.read(self.handle, buf)
    }

    /// Fills `buf` completely; anything short is CORRUPT.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ErrCode> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.fs.read(self.handle, &mut buf[done..])? as usize;
            if n == 0 {
                return Err(ErrCode::Corrupt);
            }
            done += n;
        }
        Ok(())
    }

    pub fn seek(&mut self, offset: i32, whence: Whence) -> Result<u32, ErrCode> {
        self.fs.seek(self.handle, offset, whence)
    }
}

impl Drop for ScopedFile<'_> {
    fn drop(&mut self) {
        let _ = self.fs.close(self.handle);
    }
}

const MAX_FILES: usize = 16;
const MAX_DIRS: usize = 4;

struct OpenFile {
    file: fs::File,
    mode: OpenMode,
}

struct OpenDir {
    entries: VecDeque<DirEntry>,
}

/// Host filesystem rooted at a directory (the mounted card image).
pub struct HostFs {
    root: PathBuf,
    files: Vec<Option<OpenFile>>,
    dirs: Vec<Option<OpenDir>>,
}

impl HostFs {
    pub fn new(root: impl Into<PathBuf>) -> HostFs {
        HostFs {
            root: root.into(),
            files: (0..MAX_FILES).map(|_| None).collect(),
            dirs: (0..MAX_DIRS).map(|_| None).collect(),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn slot(&mut self) -> Option<usize> {
        self.files.iter().position(Option::is_none)
    }

    fn file_mut(&mut self, handle: u32) -> Result<&mut OpenFile, ErrCode> {
        self.files
            .get_mut(handle as usize)
            .and_then(Option::as_mut)
            .ok_or(ErrCode::Inval)
    }
}

impl FileSys for HostFs {
    fn open(&mut self, path: &str, mode: OpenMode) -> Result<u32, ErrCode> {
        if mode.is_empty() {
            return Err(ErrCode::Inval);
        }
        let full = self.resolve(path);
        if full.is_dir() {
            return Err(ErrCode::Inval);
        }
        let slot = self.slot().ok_or(ErrCode::Busy)?;

        let mut opts = fs::OpenOptions::new();
        opts.read(mode.contains(OpenMode::READ));
        opts.write(mode.contains(OpenMode::WRITE) || mode.contains(OpenMode::APPEND));
        opts.create(mode.contains(OpenMode::CREATE));
        opts.truncate(mode.contains(OpenMode::TRUNC));
        let mut file = opts.open(&full).map_err(ErrCode::from)?;
        if mode.contains(OpenMode::APPEND) {
            file.seek(SeekFrom::End(0)).map_err(ErrCode::from)?;
        }

        self.files[slot] = Some(OpenFile { file, mode });
        Ok(slot as u32)
    }

    fn close(&mut self, handle: u32) -> Result<(), ErrCode> {
        let slot = self
            .files
            .get_mut(handle as usize)
            .ok_or(ErrCode::Inval)?;
        match slot.take() {
            Some(open) => {
                // Flush pending writes; the File close itself cannot fail
                // usefully here.
                let mut f = open.file;
                let _ = f.flush();
                Ok(())
            }
            None => Err(ErrCode::Inval),
        }
    }

    fn read(&mut self, handle: u32, buf: &mut [u8]) -> Result<u32, ErrCode> {
        let open = self.file_mut(handle)?;
        if !open.mode.contains(OpenMode::READ) {
            return Err(ErrCode::Perm);
        }
        let n = open.file.read(buf).map_err(ErrCode::from)?;
        Ok(n as u32)
    }

    fn write(&mut self, handle: u32, buf: &[u8]) -> Result<u32, ErrCode> {
        let open = self.file_mut(handle)?;
        if !open.mode.intersects(OpenMode::WRITE | OpenMode::APPEND) {
            return Err(ErrCode::Perm);
        }
        // A short write is an I/O error at this interface.
        open.file.write_all(buf).map_err(|_| ErrCode::Io)?;
        Ok(buf.len() as u32)
    }

    fn seek(&mut self, handle: u32, offset: i32, whence: Whence) -> Result<u32, ErrCode> {
        let open = self.file_mut(handle)?;
        let from = match whence {
            Whence::Set => SeekFrom::Start(offset.max(0) as u64),
            Whence::Cur => SeekFrom::Current(i64::from(offset)),
            Whence::End => SeekFrom::End(i64::from(offset)),
        };
        let pos = open.file.seek(from).map_err(ErrCode::from)?;
        Ok(pos as u32)
    }

    fn tell(&mut self, handle: u32) -> Result<u32, ErrCode> {
        let open = self.file_mut(handle)?;
        let pos = open.file.stream_position().map_err(ErrCode::from)?;
        Ok(pos as u32)
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).exists()
    }

    fn is_dir(&self, path: &str) -> bool {
        self.resolve(path).is_dir()
    }

    fn open_dir(&mut self, path: &str) -> Result<u32, ErrCode> {
        let full = self.resolve(path);
        if !full.is_dir() {
            return Err(ErrCode::Noent);
        }
        let slot = self
            .dirs
            .iter()
            .position(Option::is_none)
            .ok_or(ErrCode::Busy)?;
        let mut entries = VecDeque::new();
        for entry in fs::read_dir(&full).map_err(ErrCode::from)? {
            let entry = entry.map_err(ErrCode::from)?;
            let meta = entry.metadata().map_err(ErrCode::from)?;
            entries.push_back(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: meta.len().min(u64::from(u32::MAX)) as u32,
                attr: if meta.permissions().readonly() { 1 } else { 0 },
                is_dir: meta.is_dir(),
            });
        }
        self.dirs[slot] = Some(OpenDir { entries });
        Ok(slot as u32)
    }

    fn read_dir(&mut self, handle: u32) -> Result<Option<DirEntry>, ErrCode> {
        let dir = self
            .dirs
            .get_mut(handle as usize)
            .and_then(Option::as_mut)
            .ok_or(ErrCode::Inval)?;
        Ok(dir.entries.pop_front())
    }

    fn close_dir(&mut self, handle: u32) -> Result<(), ErrCode> {
        let slot = self.dirs.get_mut(handle as usize).ok_or(ErrCode::Inval)?;
        if slot.take().is_none() {
            return Err(ErrCode::Inval);
        }
        Ok(())
    }
}
