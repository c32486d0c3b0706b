pub mod compression;
pub mod header;
pub mod index;
pub mod options;
pub mod resource;

use header::PackageHeader;
use index::{IndexEntry, IndexLayout, PackageIndex, ResourceKey, MIN_ENTRY_SIZE, ZLIB_COMPRESSION};
use options::{CancelToken, Limits, OpenOptions};
use resource::{Resource, ResourceRegistry};

use log::{debug, info, warn};
use rayon::prelude::*;
use std::fs::{self, File};
use std::io::{self, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;

use crate::error::{Error, Result};

/// What a mutating call did to the package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Added(ResourceKey),
    Replaced(ResourceKey),
    Deleted(ResourceKey),
}

enum Source {
    Memory(Cursor<Vec<u8>>),
    File { path: PathBuf, file: File },
}

impl Source {
    fn len(&self) -> io::Result<u64> {
        match self {
            Source::Memory(cursor) => Ok(cursor.get_ref().len() as u64),
            Source::File { file, .. } => Ok(file.metadata()?.len()),
        }
    }
}

impl Read for Source {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Source::Memory(cursor) => cursor.read(buf),
            Source::File { file, .. } => file.read(buf),
        }
    }
}

impl Seek for Source {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            Source::Memory(cursor) => cursor.seek(pos),
            Source::File { file, .. } => file.seek(pos),
        }
    }
}

/// An open DBPF package.
///
/// Reads are lazy: only the header and index are loaded at open time.
/// Added and replaced resources stay in memory until [`Package::save`] or
/// [`Package::save_as`] writes them out.
pub struct Package {
    header: PackageHeader,
    index: PackageIndex,
    source: Source,
    writable: bool,
    limits: Limits,
    dirty: bool,
}

impl Package {
    /// Creates an empty in-memory package.
    pub fn new() -> Self {
        Self {
            header: PackageHeader::default(),
            index: PackageIndex::default(),
            source: Source::Memory(Cursor::new(Vec::new())),
            writable: true,
            limits: Limits::default(),
            dirty: false,
        }
    }

    /// Opens a package read-only.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        OpenOptions::new().open(path)
    }

    pub fn open_writable<P: AsRef<Path>>(path: P) -> Result<Self> {
        OpenOptions::new().writable(true).open(path)
    }

    /// Parses a package held in memory. The buffer is owned, so it is writable.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        OpenOptions::new().writable(true).open_bytes(bytes)
    }

    pub(crate) fn open_with(path: &Path, opts: &OpenOptions) -> Result<Self> {
        let file = if opts.writable {
            fs::OpenOptions::new().read(true).write(true).open(path)?
        } else {
            File::open(path)?
        };
        let mut source = Source::File { path: path.to_path_buf(), file };
        let (header, index) = load(&mut source, &opts.limits)?;
        debug!("Opened {:?}: {} index entries", path, index.len());

        Ok(Self {
            header,
            index,
            source,
            writable: opts.writable,
            limits: opts.limits,
            dirty: false,
        })
    }

    pub(crate) fn from_bytes_with(bytes: Vec<u8>, opts: &OpenOptions) -> Result<Self> {
        let mut source = Source::Memory(Cursor::new(bytes));
        let (header, index) = load(&mut source, &opts.limits)?;

        Ok(Self {
            header,
            index,
            source,
            writable: opts.writable,
            limits: opts.limits,
            dirty: false,
        })
    }

    pub fn header(&self) -> &PackageHeader {
        &self.header
    }

    /// The index-type word as last read from storage.
    pub fn index_type(&self) -> u32 {
        self.index.index_type
    }

    /// Every index slot, including soft-deleted ones.
    pub fn entries(&self) -> &[IndexEntry] {
        &self.index.entries
    }

    pub fn live_entries(&self) -> impl Iterator<Item = &IndexEntry> {
        self.index.live()
    }

    pub fn len(&self) -> usize {
        self.index.live().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            Source::File { path, .. } => Some(path),
            Source::Memory(_) => None,
        }
    }

    pub fn find(&self, key: &ResourceKey) -> Option<&IndexEntry> {
        self.index.position_of(key).map(|i| &self.index.entries[i])
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.index.position_of(key).is_some()
    }

    /// Returns the resource bytes for `entry`, decompressed.
    ///
    /// `None` means the entry has no data to give: it is deleted, a legacy
    /// tombstone, or an unsaved slot without a buffer.
    pub fn read_entry(&mut self, entry: &IndexEntry) -> Result<Option<Vec<u8>>> {
        if entry.deleted {
            return Ok(None);
        }
        if let Some(data) = &entry.pending {
            return Ok(Some(data.to_vec()));
        }
        if entry.is_tombstone() || entry.is_unsaved() {
            return Ok(None);
        }

        let limit = self.limits.max_resource_size;
        if entry.mem_size > limit || entry.file_size > limit {
            return Err(Error::Corrupt(format!(
                "{} declares {} bytes ({} stored), above the {} byte limit",
                entry.key, entry.mem_size, entry.file_size, limit
            )));
        }

        let raw = self.read_stored(entry)?;
        if entry.file_size == entry.mem_size {
            return Ok(Some(raw));
        }
        compression::decompress(&raw, entry.file_size, entry.mem_size)
            .map(Some)
            .map_err(|e| match e {
                Error::Corrupt(msg) => Error::Corrupt(format!("{}: {}", entry.key, msg)),
                other => other,
            })
    }

    /// Reads the bytes exactly as stored, without decompressing.
    pub fn read_raw(&mut self, entry: &IndexEntry) -> Result<Vec<u8>> {
        if let Some(data) = &entry.pending {
            return Ok(data.to_vec());
        }
        self.read_stored(entry)
    }

    fn read_stored(&mut self, entry: &IndexEntry) -> Result<Vec<u8>> {
        let end = entry.chunk_offset as u64 + entry.file_size as u64;
        let len = self.source.len()?;
        if end > len {
            return Err(Error::Corrupt(format!(
                "{} spans 0x{:X}..0x{:X}, beyond end of package (0x{:X})",
                entry.key, entry.chunk_offset, end, len
            )));
        }
        self.source.seek(SeekFrom::Start(entry.chunk_offset as u64))?;
        let mut buf = vec![0u8; entry.file_size as usize];
        self.source.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Bytes of the first live resource with `key`.
    pub fn get_resource(&mut self, key: &ResourceKey) -> Result<Vec<u8>> {
        let entry = self.find(key).cloned().ok_or(Error::NotFound(*key))?;
        self.read_entry(&entry)?.ok_or(Error::NotFound(*key))
    }

    /// Reads a resource and hands it to the registered decoder for its type.
    pub fn read_resource(
        &mut self,
        key: &ResourceKey,
        registry: &ResourceRegistry,
    ) -> anyhow::Result<Box<dyn Resource>> {
        let data = self.get_resource(key)?;
        registry.decode(key.res_type, &data)
    }

    pub fn add_resource(&mut self, key: ResourceKey, data: Vec<u8>, reject_if_duplicate: bool) -> Result<Change> {
        if reject_if_duplicate && self.contains(&key) {
            return Err(Error::DuplicateKey(key));
        }
        self.check_size(&key, data.len())?;
        self.index.entries.push(IndexEntry::unsaved(key, Arc::from(data)));
        self.dirty = true;
        Ok(Change::Added(key))
    }

    pub fn replace_resource(&mut self, key: &ResourceKey, data: Vec<u8>) -> Result<Change> {
        let pos = self.index.position_of(key).ok_or(Error::NotFound(*key))?;
        self.check_size(key, data.len())?;
        self.index.entries[pos].set_pending(Arc::from(data));
        self.dirty = true;
        Ok(Change::Replaced(*key))
    }

    /// Soft-deletes the first live entry with `key`; the slot is dropped on save.
    pub fn delete_resource(&mut self, key: &ResourceKey) -> Result<Change> {
        let pos = self.index.position_of(key).ok_or(Error::NotFound(*key))?;
        self.index.entries[pos].deleted = true;
        self.dirty = true;
        Ok(Change::Deleted(*key))
    }

    fn check_size(&self, key: &ResourceKey, len: usize) -> Result<()> {
        if len > self.limits.max_resource_size as usize {
            return Err(Error::Format(format!(
                "{} is {} bytes, above the {} byte limit",
                key, len, self.limits.max_resource_size
            )));
        }
        Ok(())
    }

    /// Saves back to where the package was loaded from.
    pub fn save(&mut self) -> Result<()> {
        self.save_cancellable(&CancelToken::new())
    }

    pub fn save_cancellable(&mut self, cancel: &CancelToken) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        match &self.source {
            Source::Memory(_) => {
                let mut out = Cursor::new(Vec::new());
                self.write_to(&mut out, cancel)?;
                self.reload(Source::Memory(out))
            }
            Source::File { path, .. } => {
                let path = path.clone();
                self.save_file_in_place(&path, cancel, BufWriter::new)
            }
        }
    }

    /// Writes the package to `path`. The handle keeps its dirty state and
    /// stays attached to its original source.
    pub fn save_as<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.save_as_cancellable(path, &CancelToken::new())
    }

    pub fn save_as_cancellable<P: AsRef<Path>>(&mut self, path: P, cancel: &CancelToken) -> Result<()> {
        let path = path.as_ref();
        if let Source::File { path: own, .. } = &self.source {
            if same_file(own, path) {
                return self.save_cancellable(cancel);
            }
        }

        let result = (|| -> Result<PackageHeader> {
            let mut writer = BufWriter::new(File::create(path)?);
            let header = self.write_to(&mut writer, cancel)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
            Ok(header)
        })();

        match result {
            Ok(header) => {
                info!("Saved {} resources to {:?}", header.index_count, path);
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_file(path);
                Err(e)
            }
        }
    }

    /// Serializes the package into a fresh buffer.
    pub fn to_bytes(&mut self) -> Result<Vec<u8>> {
        let mut out = Cursor::new(Vec::new());
        self.write_to(&mut out, &CancelToken::new())?;
        Ok(out.into_inner())
    }

    pub(crate) fn save_file_in_place<W, F>(&mut self, path: &Path, cancel: &CancelToken, wrap: F) -> Result<()>
    where
        W: Write + Seek,
        F: FnOnce(File) -> W,
    {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let temp = tempfile::Builder::new()
            .prefix(".dbpf-")
            .suffix(".tmp")
            .tempfile_in(dir)?;
        debug!("Staging save of {:?} in {:?}", path, temp.path());

        // Any error before the swap drops `temp`, which deletes it.
        {
            let mut writer = wrap(temp.as_file().try_clone()?);
            self.write_to(&mut writer, cancel)?;
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        fs::set_permissions(temp.path(), fs::metadata(path)?.permissions())?;

        // Not cancellable from here on.
        swap_into_place(temp, path)?;

        let file = fs::OpenOptions::new().read(true).write(true).open(path)?;
        self.reload(Source::File { path: path.to_path_buf(), file })?;
        info!("Saved {} resources to {:?}", self.index.len(), path);
        Ok(())
    }

    fn reload(&mut self, mut source: Source) -> Result<()> {
        let (header, index) = load(&mut source, &self.limits)?;
        self.header = header;
        self.index = index;
        self.source = source;
        self.dirty = false;
        Ok(())
    }

    /// Serializes every live entry to `out`, which must start empty at offset 0.
    fn write_to<W: Write + Seek>(&mut self, out: &mut W, cancel: &CancelToken) -> Result<PackageHeader> {
        let live: Vec<IndexEntry> = self.index.live().cloned().collect();

        let packed: Vec<Option<Vec<u8>>> = live
            .par_iter()
            .map(|entry| match &entry.pending {
                Some(data) => compression::compress_if_smaller(data),
                None => Ok(None),
            })
            .collect::<Result<_>>()?;

        let mut header = self.header.clone();
        out.seek(SeekFrom::Start(0))?;
        header.write(out)?;

        let mut written = Vec::with_capacity(live.len());
        for (mut entry, packed) in live.into_iter().zip(packed) {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let offset = to_offset(out.stream_position()?)?;
            match (entry.pending.take(), packed) {
                (Some(data), Some(packed)) => {
                    out.write_all(&packed)?;
                    entry.file_size = packed.len() as u32;
                    entry.mem_size = data.len() as u32;
                    entry.compression = ZLIB_COMPRESSION;
                }
                (Some(data), None) => {
                    out.write_all(&data)?;
                    entry.file_size = data.len() as u32;
                    entry.mem_size = data.len() as u32;
                    entry.compression = 0;
                }
                (None, _) => {
                    // Untouched resources are copied exactly as stored.
                    let raw = self.read_stored(&entry)?;
                    out.write_all(&raw)?;
                }
            }
            entry.chunk_offset = offset;
            written.push(entry);
        }

        let layout = IndexLayout::derive(&written);
        let index_position = to_offset(out.stream_position()?)?;
        let index_size = PackageIndex::write(out, &written, &layout)?;
        header.set_index(written.len() as u32, index_size as u32, index_position);
        debug!(
            "Wrote {} entries, index type 0x{:02X}, {} bytes at 0x{:X}",
            written.len(),
            layout.index_type(),
            index_size,
            index_position
        );

        let end = out.stream_position()?;
        out.seek(SeekFrom::Start(0))?;
        header.write(out)?;
        out.seek(SeekFrom::Start(end))?;
        out.flush()?;
        Ok(header)
    }
}

impl Default for Package {
    fn default() -> Self {
        Self::new()
    }
}

fn to_offset(pos: u64) -> Result<u32> {
    u32::try_from(pos).map_err(|_| Error::Format(format!("package offset 0x{pos:X} exceeds 4 GiB")))
}

fn load(source: &mut Source, limits: &Limits) -> Result<(PackageHeader, PackageIndex)> {
    let file_len = source.len()?;
    source.seek(SeekFrom::Start(0))?;
    let mut raw = [0u8; PackageHeader::SIZE as usize];
    source.read_exact(&mut raw).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => {
            Error::Format(format!("header truncated: package is only {file_len} bytes"))
        }
        _ => Error::Io(e),
    })?;
    let header = PackageHeader::from_bytes(&raw)?;

    let count = header.index_count;
    if count > limits.max_index_count {
        return Err(Error::Format(format!(
            "index count {} exceeds limit {}",
            count, limits.max_index_count
        )));
    }
    // Sanity check for index_count to prevent excessive pre-allocation
    if count as u64 * MIN_ENTRY_SIZE > file_len {
        return Err(Error::Format("index_count too large for file size".to_string()));
    }
    if count == 0 {
        return Ok((header, PackageIndex::default()));
    }

    let position = header.resolved_index_position();
    if position < PackageHeader::SIZE || position + 4 > file_len {
        return Err(Error::Format(format!(
            "index position 0x{position:X} outside package of {file_len} bytes"
        )));
    }
    source.seek(SeekFrom::Start(position))?;
    let mut word = [0u8; 4];
    source.read_exact(&mut word)?;
    let expected = index::encoded_size(u32::from_le_bytes(word), count);
    if position + expected > file_len {
        return Err(Error::Format(format!(
            "index of {expected} bytes at 0x{position:X} runs past end of package ({file_len} bytes)"
        )));
    }
    if header.index_size as u64 != expected {
        warn!(
            "Header index size {} disagrees with computed size {}",
            header.index_size, expected
        );
    }

    let index = PackageIndex::parse(source, position, count)?;
    Ok((header, index))
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Replaces `path` with the staged file, under an exclusive lock.
fn swap_into_place(temp: NamedTempFile, path: &Path) -> Result<()> {
    let target = fs::OpenOptions::new().read(true).write(true).open(path)?;
    target.lock()?;

    // The lock is released when `target` closes.
    match temp.persist(path) {
        Ok(_) => Ok(()),
        Err(err) => {
            warn!("Rename onto {:?} failed ({}), copying in place", path, err.error);
            copy_into(err.file, &target)
        }
    }
}

fn copy_into(temp: NamedTempFile, mut target: &File) -> Result<()> {
    let mut staged = temp.reopen()?;
    target.set_len(0)?;
    target.seek(SeekFrom::Start(0))?;
    io::copy(&mut staged, &mut target)?;
    target.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Passes writes through until `budget` bytes have gone by, then fails.
    struct FailingWriter {
        inner: File,
        budget: usize,
    }

    impl Write for FailingWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if buf.len() > self.budget {
                return Err(io::Error::other("injected write failure"));
            }
            self.budget -= buf.len();
            self.inner.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    impl Seek for FailingWriter {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    /// Cancels `token` once more than `after` bytes have been written.
    struct CancellingWriter {
        inner: File,
        written: usize,
        after: usize,
        token: CancelToken,
    }

    impl Write for CancellingWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = self.inner.write(buf)?;
            self.written += n;
            if self.written > self.after {
                self.token.cancel();
            }
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    impl Seek for CancellingWriter {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    fn sample_package(dir: &Path) -> PathBuf {
        let mut pkg = Package::new();
        for i in 0..4u64 {
            let data = format!("resource number {i} ").repeat(20).into_bytes();
            pkg.add_resource(ResourceKey::new(0x0333406C, 0, i), data, true).unwrap();
        }
        let path = dir.join("sample.package");
        pkg.save_as(&path).unwrap();
        path
    }

    fn temp_files(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().is_some_and(|e| e == "tmp"))
            .collect()
    }

    #[test]
    fn failed_staging_write_leaves_original_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample_package(dir.path());
        let before = fs::read(&path).unwrap();

        let mut pkg = Package::open_writable(&path).unwrap();
        pkg.replace_resource(&ResourceKey::new(0x0333406C, 0, 2), b"replacement".to_vec()).unwrap();
        pkg.add_resource(ResourceKey::new(0x0333406C, 0, 9), vec![7u8; 512], true).unwrap();

        let err = pkg
            .save_file_in_place(&path, &CancelToken::new(), |inner| FailingWriter { inner, budget: 150 })
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)), "unexpected error: {err:?}");

        assert_eq!(fs::read(&path).unwrap(), before);
        assert!(temp_files(dir.path()).is_empty());
        assert!(pkg.is_dirty());

        // The handle still serves the pending data after the failed save.
        assert_eq!(pkg.get_resource(&ResourceKey::new(0x0333406C, 0, 2)).unwrap(), b"replacement");
    }

    #[test]
    fn cancelled_save_leaves_original_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample_package(dir.path());
        let before = fs::read(&path).unwrap();

        let mut pkg = Package::open_writable(&path).unwrap();
        pkg.delete_resource(&ResourceKey::new(0x0333406C, 0, 0)).unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = pkg.save_cancellable(&cancel).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(fs::read(&path).unwrap(), before);
        assert!(temp_files(dir.path()).is_empty());
    }

    #[test]
    fn cancel_between_resources_stops_the_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample_package(dir.path());
        let before = fs::read(&path).unwrap();

        let mut pkg = Package::open_writable(&path).unwrap();
        pkg.add_resource(ResourceKey::new(0x0333406C, 0, 9), vec![7u8; 512], true).unwrap();

        // Trips as soon as the first resource lands after the header.
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let err = pkg
            .save_file_in_place(&path, &cancel, |inner| CancellingWriter {
                inner,
                written: 0,
                after: PackageHeader::SIZE as usize,
                token,
            })
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled), "unexpected error: {err:?}");
        assert!(cancel.is_cancelled());

        assert_eq!(fs::read(&path).unwrap(), before);
        assert!(temp_files(dir.path()).is_empty());
        assert!(pkg.is_dirty());
    }

    #[test]
    fn copy_fallback_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target.bin");
        fs::write(&path, b"old contents that are longer").unwrap();

        let mut temp = NamedTempFile::new_in(dir.path()).unwrap();
        temp.write_all(b"new").unwrap();
        let target = fs::OpenOptions::new().read(true).write(true).open(&path).unwrap();
        copy_into(temp, &target).unwrap();
        drop(target);

        assert_eq!(fs::read(&path).unwrap(), b"new");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
