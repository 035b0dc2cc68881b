// File access for transfers: resolving requested names under the served root, and sequential
// block-sized reading and writing with netascii translation applied on the fly.

use crate::netascii::{self, NetasciiError};
use crate::tftp::{FileMode, DATA_BUFFER_SIZE};
use std::error;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};

const CR: u8 = 0x0d;

/// Failure to map a requested filename onto a path inside the served root.
#[derive(Debug)]
pub enum PathError {
    /// The name resolves to the root itself or somewhere outside it.
    OutsideRoot(PathBuf),
    IO(io::Error),
}

impl error::Error for PathError {}

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::OutsideRoot(p) => write!(f, "path escapes the served root: {}", p.display()),
            Self::IO(e) => write!(f, "unable to resolve path: {e}"),
        }
    }
}

impl From<io::Error> for PathError {
    fn from(e: io::Error) -> PathError {
        PathError::IO(e)
    }
}

fn join_requested(root: &Path, requested: &str) -> PathBuf {
    root.join(requested.trim_start_matches('/'))
}

/// Containment is checked component-wise, so `/srv/tftp2` is not inside `/srv/tftp`.
fn ensure_contained(root: &Path, canonical: PathBuf) -> Result<PathBuf, PathError> {
    if canonical != root && canonical.starts_with(root) {
        Ok(canonical)
    } else {
        Err(PathError::OutsideRoot(canonical))
    }
}

/// Resolves a name that must already exist. `root` must be canonical.
pub async fn resolve_existing(root: &Path, requested: &str) -> Result<PathBuf, PathError> {
    let canonical = fs::canonicalize(join_requested(root, requested)).await?;
    ensure_contained(root, canonical)
}

/// Resolves a name that may not exist yet. The parent directory has to exist, and a dangling
/// symlink in place of the file is refused since opening it would create its target.
///
/// Missing components are resolved against their nearest existing ancestor, so a name that leaves
/// the root through directories that do not exist is still reported as outside it.
pub async fn resolve_for_write(root: &Path, requested: &str) -> Result<PathBuf, PathError> {
    let candidate = join_requested(root, requested);
    match fs::canonicalize(&candidate).await {
        Ok(existing) => return ensure_contained(root, existing),
        Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
        Err(_) => {}
    }

    if fs::symlink_metadata(&candidate).await.is_ok() {
        return Err(PathError::OutsideRoot(candidate));
    }

    // Peel off trailing components until something exists. A `..` among them has no name and
    // cannot be resolved without its parent existing, so it is refused outright.
    let mut missing = Vec::new();
    let mut ancestor = candidate.as_path();
    let canonical_ancestor = loop {
        let (Some(name), Some(parent)) = (ancestor.file_name(), ancestor.parent()) else {
            return Err(PathError::OutsideRoot(candidate.clone()));
        };
        missing.push(name.to_owned());
        ancestor = parent;
        match fs::canonicalize(ancestor).await {
            Ok(canonical) => break canonical,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        }
    };

    let resolved = missing.iter().rev().fold(canonical_ancestor, |path, name| path.join(name));
    let resolved = ensure_contained(root, resolved)?;
    if missing.len() > 1 {
        return Err(PathError::IO(io::Error::new(
            io::ErrorKind::NotFound,
            "parent directory does not exist",
        )));
    }
    Ok(resolved)
}

/// One DATA payload's worth of file content.
#[derive(Debug, PartialEq)]
pub struct Block {
    pub data: Vec<u8>,
    pub is_final: bool,
}

/// Forward-only reader producing DATA-sized blocks.
#[derive(Debug)]
pub struct FileReader {
    f: File,
    mode: FileMode,
    // Bytes already translated for the wire but not yet handed out.
    pending: Vec<u8>,
    eof: bool,
}

impl FileReader {
    pub async fn open(path: &Path, mode: FileMode) -> Result<FileReader, io::Error> {
        let f = File::open(path).await?;
        if !f.metadata().await?.is_file() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "not a regular file"));
        }
        Ok(FileReader { f, mode, pending: Vec::new(), eof: false })
    }

    /// Returns the next block. A block shorter than [`DATA_BUFFER_SIZE`] (possibly empty) is the
    /// last one.
    pub async fn next_block(&mut self) -> Result<Block, io::Error> {
        while self.pending.len() < DATA_BUFFER_SIZE && !self.eof {
            let chunk = read_block_from_file(&mut self.f).await?;
            if chunk.len() < DATA_BUFFER_SIZE {
                self.eof = true;
            }
            match self.mode {
                FileMode::Octet => self.pending.extend_from_slice(&chunk),
                FileMode::NetAscii => self.pending.extend_from_slice(&netascii::encode(&chunk)),
            }
        }

        let take = self.pending.len().min(DATA_BUFFER_SIZE);
        let data: Vec<u8> = self.pending.drain(..take).collect();
        let is_final = data.len() < DATA_BUFFER_SIZE;
        Ok(Block { data, is_final })
    }
}

async fn read_block_from_file(f: &mut File) -> Result<Vec<u8>, io::Error> {
    let mut buf = vec![0_u8; DATA_BUFFER_SIZE];
    let mut cursor = 0;

    // A single read may come back short without being at the end of the file, so keep going
    // until the buffer is full or a read returns nothing.
    loop {
        let s = f.read(&mut buf[cursor..]).await?;
        cursor += s;
        if s == 0 || cursor == buf.len() {
            buf.truncate(cursor);
            return Ok(buf);
        }
    }
}

/// Why a block could not be written.
#[derive(Debug)]
pub enum WriteError {
    /// The underlying storage has no room left.
    DiskFull(io::Error),
    /// The netascii stream contained a CR not followed by LF or NUL.
    Malformed(NetasciiError),
    IO(io::Error),
}

impl error::Error for WriteError {}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::DiskFull(e) => write!(f, "no space left: {e}"),
            Self::Malformed(e) => write!(f, "malformed block: {e}"),
            Self::IO(e) => write!(f, "write failed: {e}"),
        }
    }
}

impl From<io::Error> for WriteError {
    fn from(e: io::Error) -> WriteError {
        if e.kind() == io::ErrorKind::StorageFull {
            WriteError::DiskFull(e)
        } else {
            WriteError::IO(e)
        }
    }
}

/// Sequential writer accepting DATA payloads in order.
#[derive(Debug)]
pub struct FileWriter {
    f: File,
    mode: FileMode,
    // A netascii CR that ended the previous block and still needs its successor.
    carried_cr: bool,
}

impl FileWriter {
    /// Creates the file, truncating it if it already exists.
    pub async fn create(path: &Path, mode: FileMode) -> Result<FileWriter, io::Error> {
        let f = OpenOptions::new().write(true).create(true).truncate(true).open(path).await?;
        Ok(FileWriter { f, mode, carried_cr: false })
    }

    /// Writes one block. A block shorter than [`DATA_BUFFER_SIZE`] is taken to be the last.
    /// Nothing about the writer changes when this fails.
    pub async fn write_next_block(&mut self, data: &[u8]) -> Result<(), WriteError> {
        let is_final = data.len() < DATA_BUFFER_SIZE;
        let (bytes, carry) = match self.mode {
            FileMode::Octet => (data.to_vec(), false),
            FileMode::NetAscii => {
                let mut wire = Vec::with_capacity(data.len() + 1);
                if self.carried_cr {
                    wire.push(CR);
                }
                wire.extend_from_slice(data);
                let carry = !is_final && wire.last() == Some(&CR);
                if carry {
                    wire.pop();
                }
                (netascii::decode(&wire).map_err(WriteError::Malformed)?, carry)
            }
        };

        self.f.write_all(&bytes).await?;
        self.f.flush().await?;
        self.carried_cr = carry;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    fn scratch() -> (TempDir, PathBuf) {
        let tmpdir = TempDir::new("scratch").unwrap();
        let root = tmpdir.path().canonicalize().unwrap();
        (tmpdir, root)
    }

    #[tokio::test]
    async fn test_resolve_existing_inside_root() {
        let (_tmpdir, root) = scratch();
        std::fs::create_dir(root.join("boot")).unwrap();
        std::fs::write(root.join("boot/pxelinux.0"), b"x").unwrap();

        let path = resolve_existing(&root, "/boot/pxelinux.0").await.unwrap();
        assert_eq!(path, root.join("boot/pxelinux.0"));
    }

    #[tokio::test]
    async fn test_resolve_existing_rejects_traversal() {
        let (_tmpdir, root) = scratch();
        std::fs::create_dir(root.join("served")).unwrap();
        std::fs::write(root.join("secret.txt"), b"x").unwrap();
        let served = root.join("served");

        let result = resolve_existing(&served, "../secret.txt").await;
        assert!(matches!(result, Err(PathError::OutsideRoot(_))));
    }

    #[tokio::test]
    async fn test_resolve_rejects_sibling_with_common_prefix() {
        let (_tmpdir, root) = scratch();
        std::fs::create_dir(root.join("tftp")).unwrap();
        std::fs::create_dir(root.join("tftp2")).unwrap();
        std::fs::write(root.join("tftp2/file"), b"x").unwrap();

        let result = resolve_existing(&root.join("tftp"), "../tftp2/file").await;
        assert!(matches!(result, Err(PathError::OutsideRoot(_))));
    }

    #[tokio::test]
    async fn test_resolve_rejects_root_itself() {
        let (_tmpdir, root) = scratch();
        assert!(matches!(resolve_existing(&root, "").await, Err(PathError::OutsideRoot(_))));
        assert!(matches!(resolve_for_write(&root, ".").await, Err(PathError::OutsideRoot(_))));
    }

    #[tokio::test]
    async fn test_resolve_existing_missing_file() {
        let (_tmpdir, root) = scratch();
        match resolve_existing(&root, "nope.bin").await {
            Err(PathError::IO(e)) => assert_eq!(e.kind(), io::ErrorKind::NotFound),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resolve_rejects_symlink_out_of_root() {
        let (_tmpdir, root) = scratch();
        std::fs::create_dir(root.join("served")).unwrap();
        std::fs::write(root.join("outside.txt"), b"x").unwrap();
        std::os::unix::fs::symlink(root.join("outside.txt"), root.join("served/link")).unwrap();
        std::os::unix::fs::symlink(root.join("ghost.txt"), root.join("served/dangling")).unwrap();
        let served = root.join("served");

        assert!(matches!(resolve_existing(&served, "link").await, Err(PathError::OutsideRoot(_))));
        assert!(matches!(resolve_for_write(&served, "link").await, Err(PathError::OutsideRoot(_))));
        assert!(matches!(resolve_for_write(&served, "dangling").await, Err(PathError::OutsideRoot(_))));
    }

    #[tokio::test]
    async fn test_resolve_for_write_new_file() {
        let (_tmpdir, root) = scratch();
        assert_eq!(resolve_for_write(&root, "new.txt").await.unwrap(), root.join("new.txt"));
        assert!(matches!(
            resolve_for_write(&root, "../../etc/passwd").await,
            Err(PathError::OutsideRoot(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_for_write_through_missing_dirs() {
        let (_tmpdir, root) = scratch();
        std::fs::create_dir(root.join("served")).unwrap();
        let served = root.join("served");

        assert!(matches!(
            resolve_for_write(&served, "../../nonexistent_dir/evil").await,
            Err(PathError::OutsideRoot(_))
        ));
        assert!(matches!(
            resolve_for_write(&served, "missing/../../evil").await,
            Err(PathError::OutsideRoot(_))
        ));
        match resolve_for_write(&served, "missing/file").await {
            Err(PathError::IO(e)) => assert_eq!(e.kind(), io::ErrorKind::NotFound),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reader_invalid_path() {
        let err = FileReader::open(Path::new("/some/invalid/file.txt"), FileMode::Octet).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_reader_refuses_directory() {
        let (_tmpdir, root) = scratch();
        let err = FileReader::open(&root, FileMode::Octet).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_reader_octet_blocks() {
        let (_tmpdir, root) = scratch();
        let path = root.join("report.txt");
        std::fs::write(&path, vec![0x78; 1000]).unwrap();

        let mut reader = FileReader::open(&path, FileMode::Octet).await.unwrap();
        assert_eq!(reader.next_block().await.unwrap(), Block { data: vec![0x78; 512], is_final: false });
        assert_eq!(reader.next_block().await.unwrap(), Block { data: vec![0x78; 488], is_final: true });
    }

    #[tokio::test]
    async fn test_reader_exact_multiple_ends_with_empty_block() {
        let (_tmpdir, root) = scratch();
        let path = root.join("even.bin");
        std::fs::write(&path, vec![0x01; 1024]).unwrap();

        let mut reader = FileReader::open(&path, FileMode::Octet).await.unwrap();
        assert!(!reader.next_block().await.unwrap().is_final);
        assert!(!reader.next_block().await.unwrap().is_final);
        assert_eq!(reader.next_block().await.unwrap(), Block { data: vec![], is_final: true });
    }

    #[tokio::test]
    async fn test_reader_netascii_expands_and_refills() {
        let (_tmpdir, root) = scratch();
        let path = root.join("lines.txt");
        // 300 newlines become 600 wire bytes.
        std::fs::write(&path, vec![b'\n'; 300]).unwrap();

        let mut reader = FileReader::open(&path, FileMode::NetAscii).await.unwrap();
        let first = reader.next_block().await.unwrap();
        assert_eq!(first.data.len(), 512);
        assert!(!first.is_final);
        assert_eq!(&first.data[..4], b"\r\n\r\n");

        let second = reader.next_block().await.unwrap();
        assert_eq!(second.data.len(), 88);
        assert!(second.is_final);
    }

    #[tokio::test]
    async fn test_writer_octet_truncates_existing() {
        let (_tmpdir, root) = scratch();
        let path = root.join("out.bin");
        std::fs::write(&path, vec![0xFF; 2000]).unwrap();

        let mut writer = FileWriter::create(&path, FileMode::Octet).await.unwrap();
        tokio_test::assert_ok!(writer.write_next_block(&[0xAB; 512]).await);
        tokio_test::assert_ok!(writer.write_next_block(&[0xCD; 10]).await);
        drop(writer);

        let written = std::fs::read(&path).unwrap();
        assert_eq!(written.len(), 522);
        assert_eq!(&written[510..514], &[0xAB, 0xAB, 0xCD, 0xCD]);
    }

    #[tokio::test]
    async fn test_writer_netascii_carries_cr_across_blocks() {
        let (_tmpdir, root) = scratch();
        let path = root.join("text.txt");

        let mut first = vec![b'a'; 511];
        first.push(b'\r');
        let mut writer = FileWriter::create(&path, FileMode::NetAscii).await.unwrap();
        tokio_test::assert_ok!(writer.write_next_block(&first).await);
        tokio_test::assert_ok!(writer.write_next_block(b"\nend\r\0").await);
        drop(writer);

        let mut expected = vec![b'a'; 511];
        expected.extend_from_slice(b"\nend\r");
        assert_eq!(std::fs::read(&path).unwrap(), expected);
    }

    #[tokio::test]
    async fn test_writer_netascii_rejects_bare_cr() {
        let (_tmpdir, root) = scratch();
        let path = root.join("bad.txt");

        let mut writer = FileWriter::create(&path, FileMode::NetAscii).await.unwrap();
        let result = writer.write_next_block(b"oops\rx").await;
        assert!(matches!(result, Err(WriteError::Malformed(_))));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_writer_reports_disk_full() {
        let mut writer = match FileWriter::create(Path::new("/dev/full"), FileMode::Octet).await {
            Ok(w) => w,
            // Not every sandbox exposes /dev/full.
            Err(_) => return,
        };
        let result = writer.write_next_block(&[0x00; 100]).await;
        assert!(matches!(result, Err(WriteError::DiskFull(_))));
    }
}
