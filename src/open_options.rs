//! Translation of portable open options into `openat(2)` arguments.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Permission bits of files created by [`File::open`](crate::File::open).
pub const DEFAULT_MODE: u32 = 0o644;

/// Permission bits of anonymous files.
pub const ANONYMOUS_MODE: u32 = 0o600;

/// Options and flags used to open a [`File`](crate::File).
///
/// Mirrors `std::fs::OpenOptions`, plus the Linux flags relevant to
/// completion-based I/O.
///
/// ```
/// use uring_file::OpenOptions;
///
/// let mut options = OpenOptions::new();
/// options.write(true).create(true).truncate(true).dsync(true);
/// assert!(options.to_flags().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenOptions {
    read: bool,
    write: bool,
    append: bool,
    truncate: bool,
    create: bool,
    create_new: bool,
    sync: bool,
    dsync: bool,
    direct: bool,
    nofollow: bool,
    mode: Option<u32>,
    custom_flags: i32,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenOptions {
    /// Blank options; at least one of `read`, `write` or `append` must be set.
    pub fn new() -> Self {
        Self {
            read: false,
            write: false,
            append: false,
            truncate: false,
            create: false,
            create_new: false,
            sync: false,
            dsync: false,
            direct: false,
            nofollow: false,
            mode: None,
            custom_flags: 0,
        }
    }

    pub fn read(&mut self, read: bool) -> &mut Self {
        self.read = read;
        self
    }

    pub fn write(&mut self, write: bool) -> &mut Self {
        self.write = write;
        self
    }

    /// Append implies write access.
    pub fn append(&mut self, append: bool) -> &mut Self {
        self.append = append;
        self
    }

    pub fn truncate(&mut self, truncate: bool) -> &mut Self {
        self.truncate = truncate;
        self
    }

    pub fn create(&mut self, create: bool) -> &mut Self {
        self.create = create;
        self
    }

    /// Fail if the file already exists. Overrides `create` and `truncate`.
    pub fn create_new(&mut self, create_new: bool) -> &mut Self {
        self.create_new = create_new;
        self
    }

    /// `O_SYNC`: every write waits for data and metadata.
    pub fn sync(&mut self, sync: bool) -> &mut Self {
        self.sync = sync;
        self
    }

    /// `O_DSYNC`: every write waits for data.
    pub fn dsync(&mut self, dsync: bool) -> &mut Self {
        self.dsync = dsync;
        self
    }

    /// `O_DIRECT`: bypass the page cache. Buffers and offsets must then be
    /// aligned to the device's logical block size.
    pub fn direct(&mut self, direct: bool) -> &mut Self {
        self.direct = direct;
        self
    }

    /// `O_NOFOLLOW`: refuse to open a symbolic link.
    pub fn nofollow(&mut self, nofollow: bool) -> &mut Self {
        self.nofollow = nofollow;
        self
    }

    /// Permission bits for newly created files.
    pub fn mode(&mut self, mode: u32) -> &mut Self {
        self.mode = Some(mode);
        self
    }

    /// Extra `O_*` flags OR-ed in as is. Access mode bits are ignored.
    pub fn custom_flags(&mut self, flags: i32) -> &mut Self {
        self.custom_flags = flags;
        self
    }

    /// Whether the options grant write access.
    pub fn is_writable(&self) -> bool {
        self.write || self.append
    }

    /// Translate into the `flags` argument of `openat(2)`.
    pub fn to_flags(&self) -> Result<i32> {
        let access = match (self.read, self.is_writable()) {
            (true, false) => libc::O_RDONLY,
            (false, true) => libc::O_WRONLY,
            (true, true) => libc::O_RDWR,
            (false, false) => {
                return Err(Error::InvalidInput(
                    "open options grant neither read nor write access".to_string(),
                ))
            }
        };
        if !self.is_writable() && (self.truncate || self.create || self.create_new) {
            return Err(Error::InvalidInput(
                "truncate and create require write access".to_string(),
            ));
        }

        let creation = if self.create_new {
            libc::O_CREAT | libc::O_EXCL
        } else {
            let mut flags = 0;
            if self.create {
                flags |= libc::O_CREAT;
            }
            if self.truncate && !self.append {
                flags |= libc::O_TRUNC;
            }
            flags
        };

        let mut flags = access | creation | libc::O_CLOEXEC;
        if self.append {
            flags |= libc::O_APPEND;
        }
        if self.sync {
            flags |= libc::O_SYNC;
        }
        if self.dsync {
            flags |= libc::O_DSYNC;
        }
        if self.direct {
            flags |= libc::O_DIRECT;
        }
        if self.nofollow {
            flags |= libc::O_NOFOLLOW;
        }
        Ok(flags | (self.custom_flags & !libc::O_ACCMODE))
    }

    /// Permission bits for a named file.
    pub fn to_mode(&self) -> u32 {
        self.mode.unwrap_or(DEFAULT_MODE)
    }

    /// Flags and mode for an anonymous `O_TMPFILE` in `dir`.
    ///
    /// `O_TMPFILE` needs write access, so read-only options are widened to
    /// read-write; creation and truncation flags do not apply.
    pub(crate) fn anonymous(&self) -> Result<(i32, u32)> {
        let mut options = self.clone();
        options.write = true;
        options.read = true;
        options.append = false;
        options.create = false;
        options.create_new = false;
        options.truncate = false;
        let flags = (options.to_flags()? & !libc::O_ACCMODE) | libc::O_RDWR | libc::O_TMPFILE;
        Ok((flags, self.mode.unwrap_or(ANONYMOUS_MODE)))
    }
}

/// Null-terminated native encoding of `path`.
pub fn native_path(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::InvalidInput(format!("path contains a NUL byte: {}", path.display())))
}

/// What a handle is about to open.
#[derive(Debug, Clone)]
pub(crate) struct OpenTarget {
    pub path: PathBuf,
    pub native: CString,
    pub flags: i32,
    pub mode: u32,
    pub anonymous: bool,
}

impl OpenTarget {
    /// A named file. Directories are refused.
    pub(crate) fn named(path: &Path, options: &OpenOptions) -> Result<Self> {
        if path.is_dir() {
            return Err(Error::InvalidInput(format!(
                "{} is a directory",
                path.display()
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            native: native_path(path)?,
            flags: options.to_flags()?,
            mode: options.to_mode(),
            anonymous: false,
        })
    }

    /// An unnamed file in the system temporary directory.
    pub(crate) fn anonymous(options: &OpenOptions) -> Result<Self> {
        let dir = std::env::temp_dir();
        let (flags, mode) = options.anonymous()?;
        Ok(Self {
            native: native_path(&dir)?,
            path: dir,
            flags,
            mode,
            anonymous: true,
        })
    }
}
