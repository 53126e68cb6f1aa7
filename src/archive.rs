//! Streaming extraction of a single binary from an `.tar.xz` release archive.
use std::{
    cell::Cell,
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
    rc::Rc,
};

use tar::Archive;
use tempfile::TempDir;
use tracing::{debug, info};
use xz2::read::XzDecoder;

use crate::error::ArchiveError;

/// A binary unpacked into a scratch directory.
///
/// The scratch directory is removed when this value is dropped, on both the
/// success and the failure path of the caller.
#[derive(Debug)]
pub struct ExtractedBinary {
    dir: TempDir,
    path: PathBuf,
    entry_name: String,
}

impl ExtractedBinary {
    /// Location of the extracted file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Name of the archive entry the file came from.
    pub fn entry_name(&self) -> &str {
        &self.entry_name
    }

    /// Scratch directory holding the file.
    pub fn scratch_dir(&self) -> &Path {
        self.dir.path()
    }
}

/// Decompresses and de-tars `archive` in one pass, writing the first regular
/// entry whose path ends with `entry_suffix` into a fresh scratch directory.
pub fn extract_binary<R: Read>(
    archive: R,
    entry_suffix: &str,
) -> Result<ExtractedBinary, ArchiveError> {
    let dir = tempfile::Builder::new().prefix("tether-extract").tempdir()?;
    let (path, entry_name) = extract_into(archive, entry_suffix, dir.path())?;
    Ok(ExtractedBinary {
        dir,
        path,
        entry_name,
    })
}

/// Passes reads through and remembers whether the underlying stream failed,
/// so decoder errors can be told apart from transport errors.
struct SourceReader<R> {
    inner: R,
    failed: Rc<Cell<bool>>,
}

impl<R: Read> Read for SourceReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).inspect_err(|err| {
            if err.kind() != io::ErrorKind::Interrupted {
                self.failed.set(true);
            }
        })
    }
}

fn extract_into<R: Read>(
    archive: R,
    entry_suffix: &str,
    scratch: &Path,
) -> Result<(PathBuf, String), ArchiveError> {
    let failed = Rc::new(Cell::new(false));
    let source = SourceReader {
        inner: archive,
        failed: Rc::clone(&failed),
    };
    // xz2 and tar surface malformed input as `Other`/`InvalidData`/`UnexpectedEof`.
    let unreadable = |err: io::Error| {
        if failed.get() {
            ArchiveError::SourceUnreadable(err)
        } else {
            ArchiveError::ArchiveCorrupt(err)
        }
    };

    let mut tar = Archive::new(XzDecoder::new(source));
    let entries = tar.entries().map_err(unreadable)?;

    for entry in entries {
        let mut entry = entry.map_err(unreadable)?;
        let name = entry
            .path()
            .map_err(ArchiveError::ArchiveCorrupt)?
            .to_string_lossy()
            .into_owned();

        if entry.header().entry_type().is_dir() || !name.ends_with(entry_suffix) {
            debug!("Skipping archive entry: {name}");
            continue;
        }

        info!("Found '{entry_suffix}' in archive at {name}");
        let file_name = Path::new(entry_suffix)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "binary".into());
        let target = scratch.join(file_name);
        let mut out = File::create(&target)?;
        match io::copy(&mut entry, &mut out) {
            Ok(bytes) => debug!("Extracted {bytes} bytes to {}", target.display()),
            Err(err) if failed.get() || is_decode_error(&err) => return Err(unreadable(err)),
            Err(err) => return Err(ArchiveError::Io(err)),
        }
        out.sync_all()?;
        return Ok((target, name));
    }

    Err(ArchiveError::EntryNotFound {
        suffix: entry_suffix.to_string(),
    })
}

fn is_decode_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::InvalidData
            | io::ErrorKind::InvalidInput
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::Other
    )
}
