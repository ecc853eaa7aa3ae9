//! Read-only access to ZIP (and ZIP64) packed grain containers.
//!
//! Only the subset of the ZIP format which grain packers produce is supported: single disk
//! archives with stored or deflated entries. Entry data can either be accessed as a raw
//! byte range within the container file (stored entries), or as a stream which inflates
//! the entry on the fly.

use std::{
    collections::HashMap,
    fs::File,
    io::{self, BufReader, Read, Seek, SeekFrom},
    ops::Range,
    path::{Path, PathBuf},
};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use flate2::read::DeflateDecoder;

use crate::error::Error;

// -------------------------------------------------------------------------------------------------

const LOCAL_FILE_HEADER_SIGNATURE: u32 = 0x04034b50;
const CENTRAL_FILE_HEADER_SIGNATURE: u32 = 0x02014b50;
const END_OF_CENTRAL_DIR_SIGNATURE: u32 = 0x06054b50;
const END_OF_CENTRAL_DIR64_SIGNATURE: u32 = 0x06064b50;
const END_OF_CENTRAL_DIR64_LOCATOR_SIGNATURE: u32 = 0x07064b50;

const END_OF_CENTRAL_DIR_SIZE: u64 = 22;
const END_OF_CENTRAL_DIR64_SIZE: usize = 56;
const END_OF_CENTRAL_DIR64_LOCATOR_SIZE: u64 = 20;
const CENTRAL_FILE_HEADER_SIZE: usize = 46;
const LOCAL_FILE_HEADER_SIZE: usize = 30;

const ZIP64_EXTRA_FIELD_ID: u16 = 0x0001;
const ZIP64_MARKER_U32: u32 = 0xFFFF_FFFF;

/// The trailing comment can't exceed this, so the end of central directory record must be
/// located within this range at the end of the file.
const MAX_END_OF_CENTRAL_DIR_SEARCH: u64 = 128 * 1024;

const COMPRESSION_STORED: u16 = 0;
const COMPRESSION_DEFLATE: u16 = 8;

// -------------------------------------------------------------------------------------------------

/// Location and sizes of a single entry within a [`Container`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerEntry {
    /// Absolute byte offset of the entry's data in the container file.
    pub offset: u64,
    /// Size of the entry's data in the container file.
    pub compressed_size: u64,
    /// Size of the entry's content after decompression.
    pub uncompressed_size: u64,
}

impl ContainerEntry {
    /// True when the entry is stored without compression.
    pub fn is_stored(&self) -> bool {
        self.compressed_size == self.uncompressed_size
    }

    /// Byte range of the entry's data within the container file.
    pub fn byte_range(&self) -> Range<u64> {
        self.offset..self.offset + self.compressed_size
    }
}

// -------------------------------------------------------------------------------------------------

/// A parsed grain container's central directory.
///
/// Opening a container validates its whole directory: any structural inconsistency fails the
/// open, so partially read directories are never exposed.
#[derive(Debug, Clone)]
pub struct Container {
    path: PathBuf,
    file_len: u64,
    entries: HashMap<String, ContainerEntry>,
}

impl Container {
    /// Open and parse the container at the given file path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::with_capacity(8192, file);

        let directory = EndOfCentralDirectory::search(&mut reader, file_len)?;
        if directory
            .offset
            .checked_add(directory.size)
            .is_none_or(|end| end > file_len)
        {
            return Err(Error::FormatError(
                "Central directory exceeds the file size".to_string(),
            ));
        }

        // read the whole directory at once: it's small compared to the entries
        reader.seek(SeekFrom::Start(directory.offset))?;
        let mut directory_bytes = vec![0u8; directory.size as usize];
        reader.read_exact(&mut directory_bytes)?;

        let mut entries = HashMap::new();
        let mut pos = 0;
        while pos < directory_bytes.len() {
            let (name, entry, header_len) =
                CentralFileHeader::parse(&directory_bytes[pos..], &mut reader, file_len)?;
            entries.insert(name, entry);
            pos += header_len;
        }
        if entries.len() as u64 != directory.total_entries {
            return Err(Error::FormatError(format!(
                "Central directory lists {} entries, but contains {}",
                directory.total_entries,
                entries.len()
            )));
        }

        Ok(Self {
            path,
            file_len,
            entries,
        })
    }

    /// Path of the container file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total size of the container file in bytes.
    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    /// Names of all entries in the container, sorted.
    pub fn entry_names(&self) -> Vec<&str> {
        let mut names = self.entries.keys().map(String::as_str).collect::<Vec<_>>();
        names.sort_unstable();
        names
    }

    /// Location info of the given entry, if present.
    pub fn entry(&self, name: &str) -> Option<&ContainerEntry> {
        self.entries.get(name)
    }

    /// Byte range of a non-empty stored entry within the container file, which can be read
    /// directly without extracting it. Returns `None` for missing, empty or compressed entries.
    pub fn byte_range(&self, name: &str) -> Option<Range<u64>> {
        match self.entries.get(name) {
            Some(entry) if entry.compressed_size > 0 && entry.is_stored() => {
                Some(entry.byte_range())
            }
            _ => None,
        }
    }

    /// Open a stream which reads the given entry's content, decompressing it on the fly.
    pub fn open_entry(&self, name: &str) -> Result<Box<dyn Read + Send>, Error> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| Error::FormatError(format!("Missing entry '{name}'")))?;
        let region = ContainerRangeReader::new(&self.path, entry.byte_range())?;
        if entry.is_stored() {
            Ok(Box::new(region))
        } else {
            Ok(Box::new(DeflateDecoder::new(BufReader::new(region))))
        }
    }

    /// Read and decompress the given entry's content into memory.
    pub fn read_entry(&self, name: &str) -> Result<Vec<u8>, Error> {
        let capacity = self
            .entries
            .get(name)
            .map(|entry| entry.uncompressed_size as usize)
            .unwrap_or(0);
        let mut content = Vec::with_capacity(capacity);
        self.open_entry(name)?.read_to_end(&mut content)?;
        Ok(content)
    }
}

// -------------------------------------------------------------------------------------------------

/// A seekable reader which exposes a byte range of a file as a stream of its own. Positions
/// are relative to the start of the range.
#[derive(Debug)]
pub struct ContainerRangeReader {
    file: File,
    range: Range<u64>,
    pos: u64,
}

impl ContainerRangeReader {
    pub fn new<P: AsRef<Path>>(path: P, range: Range<u64>) -> Result<Self, Error> {
        let mut file = File::open(path.as_ref())?;
        file.seek(SeekFrom::Start(range.start))?;
        Ok(Self {
            file,
            range,
            pos: 0,
        })
    }

    /// Length of the range in bytes.
    pub fn len(&self) -> u64 {
        self.range.end - self.range.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Read for ContainerRangeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.len().saturating_sub(self.pos);
        let max_read = (buf.len() as u64).min(remaining) as usize;
        if max_read == 0 {
            return Ok(0);
        }
        let read = self.file.read(&mut buf[..max_read])?;
        self.pos += read as u64;
        Ok(read)
    }
}

impl Seek for ContainerRangeReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(offset) => self.len().checked_add_signed(offset),
            SeekFrom::Current(offset) => self.pos.checked_add_signed(offset),
        }
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative position",
            )
        })?;
        self.file.seek(SeekFrom::Start(self.range.start + new_pos))?;
        self.pos = new_pos;
        Ok(new_pos)
    }
}

// -------------------------------------------------------------------------------------------------

/// Resolved central directory location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EndOfCentralDirectory {
    offset: u64,
    size: u64,
    total_entries: u64,
}

impl EndOfCentralDirectory {
    /// Scan backwards from the end of the file for a valid end of central directory record.
    ///
    /// Each candidate position is the start of an optional ZIP64 locator, which is directly
    /// followed by the classic record.
    fn search<R: Read + Seek>(reader: &mut R, file_len: u64) -> Result<Self, Error> {
        let record_len = END_OF_CENTRAL_DIR64_LOCATOR_SIZE + END_OF_CENTRAL_DIR_SIZE;
        if file_len < record_len {
            return Err(Error::FormatError(
                "File is too small to be a grain archive".to_string(),
            ));
        }
        let first = file_len - record_len;
        let last = file_len.saturating_sub(MAX_END_OF_CENTRAL_DIR_SEARCH);

        // load the tail of the file once and scan in memory
        let mut tail = vec![0u8; (file_len - last) as usize];
        reader.seek(SeekFrom::Start(last))?;
        reader.read_exact(&mut tail)?;

        for pos in (last..=first).rev() {
            let record = &tail[(pos - last) as usize..(pos - last + record_len) as usize];
            if let Some(directory) = Self::parse(reader, record, pos, file_len)? {
                return Ok(directory);
            }
        }
        Err(Error::FormatError(
            "Failed to locate the archive's central directory".to_string(),
        ))
    }

    /// Parse a candidate record at `pos`. Returns `Ok(None)` when there's no record at this
    /// position, and an error when a record is present but unsupported.
    fn parse<R: Read + Seek>(
        reader: &mut R,
        record: &[u8],
        pos: u64,
        file_len: u64,
    ) -> Result<Option<Self>, Error> {
        let (locator, eocd) = record.split_at(END_OF_CENTRAL_DIR64_LOCATOR_SIZE as usize);

        let signature = LittleEndian::read_u32(&eocd[0..]);
        let this_disk = LittleEndian::read_u16(&eocd[4..]);
        let dir_disk = LittleEndian::read_u16(&eocd[6..]);
        let disk_dir_entries = LittleEndian::read_u16(&eocd[8..]);
        let total_dir_entries = LittleEndian::read_u16(&eocd[10..]);
        let dir_size = LittleEndian::read_u32(&eocd[12..]);
        let dir_offset = LittleEndian::read_u32(&eocd[16..]);
        let comment_len = LittleEndian::read_u16(&eocd[20..]);

        let record_end = pos + END_OF_CENTRAL_DIR64_LOCATOR_SIZE + END_OF_CENTRAL_DIR_SIZE;
        if signature != END_OF_CENTRAL_DIR_SIGNATURE || record_end + comment_len as u64 > file_len
        {
            return Ok(None);
        }
        if this_disk != 0 || dir_disk != 0 || disk_dir_entries != total_dir_entries {
            return Err(Error::FormatError(
                "Spanned or split archives are not supported".to_string(),
            ));
        }

        let mut directory = Self {
            offset: dir_offset as u64,
            size: dir_size as u64,
            total_entries: total_dir_entries as u64,
        };

        // an optional, consistent ZIP64 locator + record overrides the 32-bit values
        let locator_signature = LittleEndian::read_u32(&locator[0..]);
        let locator_disk = LittleEndian::read_u32(&locator[4..]);
        let locator_offset = LittleEndian::read_u64(&locator[8..]);
        let locator_total_disks = LittleEndian::read_u32(&locator[16..]);
        if locator_signature == END_OF_CENTRAL_DIR64_LOCATOR_SIGNATURE
            && locator_disk == 0
            && locator_total_disks == 1
            && locator_offset
                .checked_add(END_OF_CENTRAL_DIR64_SIZE as u64)
                .is_some_and(|end| end <= pos)
        {
            let mut eocd64 = [0u8; END_OF_CENTRAL_DIR64_SIZE];
            reader.seek(SeekFrom::Start(locator_offset))?;
            reader.read_exact(&mut eocd64)?;

            let signature = LittleEndian::read_u32(&eocd64[0..]);
            let this_disk = LittleEndian::read_u32(&eocd64[16..]);
            let dir_disk = LittleEndian::read_u32(&eocd64[20..]);
            let disk_dir_entries = LittleEndian::read_u64(&eocd64[24..]);
            let total_dir_entries = LittleEndian::read_u64(&eocd64[32..]);
            let dir_size = LittleEndian::read_u64(&eocd64[40..]);
            let dir_offset = LittleEndian::read_u64(&eocd64[48..]);

            if signature == END_OF_CENTRAL_DIR64_SIGNATURE
                && this_disk == 0
                && dir_disk == 0
                && disk_dir_entries == total_dir_entries
            {
                directory = Self {
                    offset: dir_offset,
                    size: dir_size,
                    total_entries: total_dir_entries,
                };
            }
        }

        Ok(Some(directory))
    }
}

// -------------------------------------------------------------------------------------------------

/// Central directory file header parser.
struct CentralFileHeader;

impl CentralFileHeader {
    /// Parse a single header from the start of `bytes`, following its local file header in the
    /// container to resolve the entry's data offset. Returns the entry name, its location and
    /// the number of directory bytes the header occupies.
    fn parse<R: Read + Seek>(
        bytes: &[u8],
        reader: &mut R,
        file_len: u64,
    ) -> Result<(String, ContainerEntry, usize), Error> {
        if bytes.len() < CENTRAL_FILE_HEADER_SIZE {
            return Err(Error::FormatError(
                "Truncated central directory header".to_string(),
            ));
        }
        let signature = LittleEndian::read_u32(&bytes[0..]);
        let compression = LittleEndian::read_u16(&bytes[10..]);
        let compressed_size = LittleEndian::read_u32(&bytes[20..]);
        let uncompressed_size = LittleEndian::read_u32(&bytes[24..]);
        let name_len = LittleEndian::read_u16(&bytes[28..]) as usize;
        let extra_len = LittleEndian::read_u16(&bytes[30..]) as usize;
        let comment_len = LittleEndian::read_u16(&bytes[32..]) as usize;
        let disk = LittleEndian::read_u16(&bytes[34..]);
        let local_header_offset = LittleEndian::read_u32(&bytes[42..]);

        if signature != CENTRAL_FILE_HEADER_SIGNATURE {
            return Err(Error::FormatError(
                "Bad central directory header signature".to_string(),
            ));
        }
        if disk != 0 {
            return Err(Error::FormatError(
                "Spanned or split archives are not supported".to_string(),
            ));
        }
        let header_len = CENTRAL_FILE_HEADER_SIZE + name_len + extra_len + comment_len;
        if bytes.len() < header_len {
            return Err(Error::FormatError(
                "Truncated central directory header".to_string(),
            ));
        }

        let name_start = CENTRAL_FILE_HEADER_SIZE;
        let name = String::from_utf8_lossy(&bytes[name_start..name_start + name_len]).to_string();

        let mut entry = ContainerEntry {
            offset: local_header_offset as u64,
            compressed_size: compressed_size as u64,
            uncompressed_size: uncompressed_size as u64,
        };

        // the ZIP64 extra field holds the 64-bit values of all saturated 32-bit fields
        let extra_start = name_start + name_len;
        let mut extra = &bytes[extra_start..extra_start + extra_len];
        while extra.len() >= 4 {
            let id = LittleEndian::read_u16(&extra[0..]);
            let size = (LittleEndian::read_u16(&extra[2..]) as usize).min(extra.len() - 4);
            if id == ZIP64_EXTRA_FIELD_ID {
                let mut field = &extra[4..4 + size];
                if uncompressed_size == ZIP64_MARKER_U32 {
                    entry.uncompressed_size = Self::read_zip64_value(&mut field)?;
                }
                if compressed_size == ZIP64_MARKER_U32 {
                    entry.compressed_size = Self::read_zip64_value(&mut field)?;
                }
                if local_header_offset == ZIP64_MARKER_U32 {
                    entry.offset = Self::read_zip64_value(&mut field)?;
                }
            }
            extra = &extra[4 + size..];
        }

        // now that both 32-bit and 64-bit sizes have been parsed, check if the compression
        // type is consistent with the supported values
        let is_stored =
            compression == COMPRESSION_STORED && entry.compressed_size == entry.uncompressed_size;
        let is_deflate =
            compression == COMPRESSION_DEFLATE && entry.compressed_size != entry.uncompressed_size;
        if !is_stored && !is_deflate {
            return Err(Error::FormatError(format!(
                "Unsupported compression for entry '{name}'"
            )));
        }

        // resolve the actual data offset from the entry's local header
        entry.offset = LocalFileHeader::data_offset(reader, entry.offset)?;
        if entry
            .offset
            .checked_add(entry.compressed_size)
            .is_none_or(|end| end > file_len)
        {
            return Err(Error::FormatError(format!(
                "Entry '{name}' exceeds the file size"
            )));
        }

        Ok((name, entry, header_len))
    }

    fn read_zip64_value(field: &mut &[u8]) -> Result<u64, Error> {
        field.read_u64::<LittleEndian>().map_err(|_| {
            Error::FormatError("Truncated ZIP64 extra field".to_string())
        })
    }
}

// -------------------------------------------------------------------------------------------------

/// Local file header parser.
struct LocalFileHeader;

impl LocalFileHeader {
    /// Resolve the offset of an entry's data from its local header at `header_offset`.
    /// Sizes in the local header are ignored: the central directory's copy is used instead.
    fn data_offset<R: Read + Seek>(reader: &mut R, header_offset: u64) -> Result<u64, Error> {
        let mut header = [0u8; LOCAL_FILE_HEADER_SIZE];
        reader.seek(SeekFrom::Start(header_offset))?;
        reader.read_exact(&mut header).map_err(|_| {
            Error::FormatError("Truncated local file header".to_string())
        })?;

        let signature = LittleEndian::read_u32(&header[0..]);
        let name_len = LittleEndian::read_u16(&header[26..]) as u64;
        let extra_len = LittleEndian::read_u16(&header[28..]) as u64;
        if signature != LOCAL_FILE_HEADER_SIGNATURE {
            return Err(Error::FormatError(
                "Bad local file header signature".to_string(),
            ));
        }
        Ok(header_offset + LOCAL_FILE_HEADER_SIZE as u64 + name_len + extra_len)
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{write_temp_file, ZipBuilder};

    #[test]
    fn stored_and_deflated_entries() {
        let json = br#"{"hello": "world", "hello again": "world"}"#.repeat(8);
        let raw = (0..255u8).collect::<Vec<_>>();
        let file = write_temp_file(
            &ZipBuilder::new()
                .deflated("index.json", &json)
                .stored("sound.flac", &raw)
                .build(),
        );

        let container = Container::open(file.path()).unwrap();
        assert_eq!(container.entry_names(), vec!["index.json", "sound.flac"]);

        // deflated entries have no direct byte range, but can be streamed
        assert!(container.byte_range("index.json").is_none());
        assert_eq!(container.read_entry("index.json").unwrap(), json);

        // stored entries can be accessed in place
        let range = container.byte_range("sound.flac").unwrap();
        assert_eq!(range.end - range.start, raw.len() as u64);
        let mut region = ContainerRangeReader::new(file.path(), range).unwrap();
        let mut content = Vec::new();
        region.read_to_end(&mut content).unwrap();
        assert_eq!(content, raw);
        assert_eq!(container.read_entry("sound.flac").unwrap(), raw);

        assert!(container.byte_range("missing").is_none());
        assert!(matches!(
            container.open_entry("missing"),
            Err(Error::FormatError(_))
        ));
    }

    #[test]
    fn zip64_records_override_legacy_fields() {
        let raw = (0..100u8).collect::<Vec<_>>();
        let file = write_temp_file(
            &ZipBuilder::new()
                .zip64(true)
                .stored("a", &raw)
                .stored("b", &raw[..10])
                .build(),
        );
        let container = Container::open(file.path()).unwrap();
        assert_eq!(container.entry("a").unwrap().uncompressed_size, 100);
        assert_eq!(container.entry("b").unwrap().compressed_size, 10);
        assert_eq!(container.read_entry("b").unwrap(), &raw[..10]);
    }

    #[test]
    fn trailing_comment() {
        let file = write_temp_file(
            &ZipBuilder::new()
                .stored("a", b"abc")
                .comment(&[b'x'; 1000])
                .build(),
        );
        let container = Container::open(file.path()).unwrap();
        assert_eq!(container.read_entry("a").unwrap(), b"abc");
    }

    #[test]
    fn range_reader_seeks_relative_to_range() {
        let raw = (0..64u8).collect::<Vec<_>>();
        let file = write_temp_file(&raw);
        let mut reader = ContainerRangeReader::new(file.path(), 16..32).unwrap();
        assert_eq!(reader.len(), 16);
        assert_eq!(reader.seek(SeekFrom::End(-4)).unwrap(), 12);
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, vec![28, 29, 30, 31]);
        assert_eq!(reader.seek(SeekFrom::Start(0)).unwrap(), 0);
        assert_eq!(reader.read_u8().unwrap(), 16);
        assert!(reader.seek(SeekFrom::Current(-2)).is_err());
    }

    #[test]
    fn invalid_archives() {
        // not an archive
        let file = write_temp_file(&[0u8; 4096]);
        assert!(matches!(
            Container::open(file.path()),
            Err(Error::FormatError(_))
        ));

        // too small
        let file = write_temp_file(b"PK");
        assert!(matches!(
            Container::open(file.path()),
            Err(Error::FormatError(_))
        ));

        // missing file
        assert!(matches!(
            Container::open("/this/path/does/not/exist.rvv"),
            Err(Error::IoError(_))
        ));

        // unsupported compression method
        let file = write_temp_file(
            &ZipBuilder::new()
                .stored("a", b"abc")
                .compression_method(12)
                .build(),
        );
        assert!(matches!(
            Container::open(file.path()),
            Err(Error::FormatError(_))
        ));
    }

    #[test]
    fn spanned_archives_are_rejected() {
        let mut bytes = ZipBuilder::new().stored("a", b"abc").build();
        // patch "number of this disk" in the trailing end of central directory record
        let eocd = bytes.len() - END_OF_CENTRAL_DIR_SIZE as usize;
        LittleEndian::write_u16(&mut bytes[eocd + 4..], 1);
        let file = write_temp_file(&bytes);
        assert!(matches!(
            Container::open(file.path()),
            Err(Error::FormatError(_))
        ));
    }
}
