//! Read-only access to OLE structured storage (compound document files).
//!
//! A compound file is a small FAT filesystem: fixed-size sectors chained
//! through a file allocation table, a directory of named storages and
//! streams arranged as a red-black tree per storage, and a mini stream that
//! packs small streams into 64-byte mini sectors.
//!
//! Only reading is implemented: loading the allocation tables and directory,
//! resolving a path, and reading a byte range of one stream.

use std::collections::HashSet;

use bytes::Bytes;

use crate::error::ImageError;
use crate::io::{read_u16_le, read_u32_le, RangeReader};

use super::FORMAT;
use crate::format::decoder::{invalid_header, read_required};

/// Compound file signature
pub const SIGNATURE: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

const HEADER_LEN: usize = 512;

/// FAT sector numbers in the header before DIFAT sectors are needed
const HEADER_DIFAT_ENTRIES: usize = 109;

/// Marks the end of a sector chain
const END_OF_CHAIN: u32 = 0xFFFF_FFFE;

/// Unallocated sector or absent directory link
const FREE_SECT: u32 = 0xFFFF_FFFF;

const DIR_ENTRY_LEN: usize = 128;

/// Upper bounds that keep a corrupt file from driving unbounded reads
const MAX_FAT_SECTORS: u64 = 4096;
const MAX_DIR_ENTRIES: usize = 65_536;

/// Directory entry object types
const TYPE_STORAGE: u8 = 1;
const TYPE_STREAM: u8 = 2;
const TYPE_ROOT: u8 = 5;

/// One directory entry.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub object_type: u8,
    left: u32,
    right: u32,
    child: u32,
    start_sector: u32,
    pub size: u64,
}

impl DirEntry {
    fn is_storage(&self) -> bool {
        matches!(self.object_type, TYPE_STORAGE | TYPE_ROOT)
    }

    /// Name with leading control characters (such as the `\x05` of property
    /// set streams) removed.
    fn display_name(&self) -> &str {
        self.name.trim_start_matches(|c: char| c.is_control())
    }
}

/// Parsed allocation tables and directory of a compound file.
#[derive(Debug)]
pub struct CompoundFile {
    sector_shift: u16,
    mini_sector_shift: u16,
    mini_stream_cutoff: u32,
    fat: Vec<u32>,
    mini_fat: Vec<u32>,
    entries: Vec<DirEntry>,

    /// Regular sectors holding the mini stream, in order
    mini_container: Vec<u32>,
}

impl CompoundFile {
    /// Load the header, FAT, mini FAT and directory.
    pub async fn open(reader: &dyn RangeReader) -> Result<Self, ImageError> {
        let header = read_required(reader, FORMAT, 0, HEADER_LEN).await?;

        if header[..8] != SIGNATURE {
            return Err(invalid_header(FORMAT, "missing compound file signature"));
        }
        if read_u16_le(&header[0x1C..0x1E]) != 0xFFFE {
            return Err(invalid_header(FORMAT, "compound file is not little-endian"));
        }

        let sector_shift = read_u16_le(&header[0x1E..0x20]);
        let mini_sector_shift = read_u16_le(&header[0x20..0x22]);
        if !matches!(sector_shift, 9 | 12) || mini_sector_shift != 6 {
            return Err(invalid_header(
                FORMAT,
                format!("sector shifts {sector_shift}/{mini_sector_shift}"),
            ));
        }

        let fat_sectors = read_u32_le(&header[0x2C..0x30]) as u64;
        let dir_start = read_u32_le(&header[0x30..0x34]);
        let mini_stream_cutoff = read_u32_le(&header[0x38..0x3C]);
        let mini_fat_start = read_u32_le(&header[0x3C..0x40]);
        let difat_start = read_u32_le(&header[0x44..0x48]);
        let difat_sectors = read_u32_le(&header[0x48..0x4C]) as u64;

        if fat_sectors > MAX_FAT_SECTORS {
            return Err(invalid_header(
                FORMAT,
                format!("{fat_sectors} FAT sectors"),
            ));
        }

        let mut file = CompoundFile {
            sector_shift,
            mini_sector_shift,
            mini_stream_cutoff,
            fat: Vec::new(),
            mini_fat: Vec::new(),
            entries: Vec::new(),
            mini_container: Vec::new(),
        };

        // FAT sector locations: 109 in the header, the rest in DIFAT sectors
        let mut fat_locations: Vec<u32> = header[0x4C..]
            .chunks_exact(4)
            .take(HEADER_DIFAT_ENTRIES)
            .map(read_u32_le)
            .filter(|&s| s != FREE_SECT)
            .collect();

        // Each DIFAT sector lists `per_sector - 1` locations plus a next link
        let per_sector = (file.sector_size() / 4) as u64;
        let difat_needed = fat_sectors
            .saturating_sub(HEADER_DIFAT_ENTRIES as u64)
            .div_ceil(per_sector - 1);

        let mut visited = HashSet::new();
        let mut difat = difat_start;
        for _ in 0..difat_sectors.min(difat_needed) {
            if fat_locations.len() as u64 >= fat_sectors
                || difat == END_OF_CHAIN
                || difat == FREE_SECT
            {
                break;
            }
            if !visited.insert(difat) {
                return Err(invalid_header(
                    FORMAT,
                    format!("DIFAT sector {difat} revisited"),
                ));
            }
            let sector = file.read_sector(reader, difat).await?;
            let (entries, next) = sector.split_at(sector.len() - 4);
            fat_locations.extend(
                entries
                    .chunks_exact(4)
                    .map(read_u32_le)
                    .filter(|&s| s != FREE_SECT),
            );
            difat = read_u32_le(next);
        }
        fat_locations.truncate(fat_sectors as usize);

        for location in fat_locations {
            let sector = file.read_sector(reader, location).await?;
            file.fat.extend(sector.chunks_exact(4).map(read_u32_le));
        }

        for sector in file.chain(mini_fat_start)? {
            let bytes = file.read_sector(reader, sector).await?;
            file.mini_fat.extend(bytes.chunks_exact(4).map(read_u32_le));
        }

        for sector in file.chain(dir_start)? {
            let bytes = file.read_sector(reader, sector).await?;
            for raw in bytes.chunks_exact(DIR_ENTRY_LEN) {
                if file.entries.len() >= MAX_DIR_ENTRIES {
                    return Err(invalid_header(FORMAT, "directory too large"));
                }
                file.entries.push(parse_dir_entry(raw));
            }
        }

        let root_start = match file.entries.first() {
            Some(root) if root.object_type == TYPE_ROOT => root.start_sector,
            _ => return Err(invalid_header(FORMAT, "missing root storage entry")),
        };
        file.mini_container = file.chain(root_start)?;

        Ok(file)
    }

    fn sector_size(&self) -> usize {
        1 << self.sector_shift
    }

    fn mini_sector_size(&self) -> usize {
        1 << self.mini_sector_shift
    }

    fn sector_offset(&self, sector: u32) -> u64 {
        // The header occupies the space of sector -1
        (sector as u64 + 1) << self.sector_shift
    }

    async fn read_sector(
        &self,
        reader: &dyn RangeReader,
        sector: u32,
    ) -> Result<Bytes, ImageError> {
        read_required(reader, FORMAT, self.sector_offset(sector), self.sector_size()).await
    }

    /// Follow a FAT chain, rejecting cycles and dangling links.
    fn chain(&self, start: u32) -> Result<Vec<u32>, ImageError> {
        follow(&self.fat, start)
    }

    /// Resolve a path of storage and stream names from the root.
    pub fn find(&self, path: &[&str]) -> Option<&DirEntry> {
        let mut current = self.entries.first()?;
        for name in path {
            if !current.is_storage() {
                return None;
            }
            current = self.find_child(current.child, name)?;
        }
        Some(current)
    }

    /// Search one storage's sibling tree for `name`.
    fn find_child(&self, root: u32, name: &str) -> Option<&DirEntry> {
        let mut pending = vec![root];
        let mut visited = 0;

        while let Some(index) = pending.pop() {
            if index == FREE_SECT {
                continue;
            }
            visited += 1;
            if visited > self.entries.len() {
                return None;
            }
            let entry = self.entries.get(index as usize)?;
            if entry.display_name() == name {
                return Some(entry);
            }
            pending.push(entry.left);
            pending.push(entry.right);
        }
        None
    }

    /// Read the full contents of a stream entry.
    pub async fn read_stream(
        &self,
        reader: &dyn RangeReader,
        entry: &DirEntry,
    ) -> Result<Vec<u8>, ImageError> {
        self.read_stream_range(reader, entry, 0, entry.size as usize)
            .await
    }

    /// Read `len` bytes of a stream starting at `offset` within it.
    ///
    /// Only the sectors covering the range are read; runs of adjacent
    /// regular sectors are fetched with one request.
    pub async fn read_stream_range(
        &self,
        reader: &dyn RangeReader,
        entry: &DirEntry,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>, ImageError> {
        if entry.object_type != TYPE_STREAM {
            return Err(invalid_header(
                FORMAT,
                format!("{} is not a stream", entry.display_name()),
            ));
        }

        let end = offset
            .checked_add(len as u64)
            .filter(|&end| end <= entry.size)
            .ok_or_else(|| {
                invalid_header(
                    FORMAT,
                    format!(
                        "range {offset}+{len} outside stream {} of {} bytes",
                        entry.display_name(),
                        entry.size
                    ),
                )
            })?;
        if len == 0 {
            return Ok(Vec::new());
        }

        let regular = entry.size >= self.mini_stream_cutoff as u64;
        let (chain, unit) = if regular {
            (self.chain(entry.start_sector)?, self.sector_size())
        } else {
            (follow(&self.mini_fat, entry.start_sector)?, self.mini_sector_size())
        };
        if (chain.len() as u64) * (unit as u64) < entry.size {
            return Err(invalid_header(
                FORMAT,
                format!("stream {} shorter than its size", entry.display_name()),
            ));
        }

        let first = (offset / unit as u64) as usize;
        let last = ((end - 1) / unit as u64) as usize;
        let covering = &chain[first..=last];

        let mut out = Vec::with_capacity(len.min(reader.size() as usize));
        if regular {
            for (start, count) in contiguous_runs(covering) {
                let bytes = read_required(
                    reader,
                    FORMAT,
                    self.sector_offset(start),
                    count * self.sector_size(),
                )
                .await?;
                out.extend_from_slice(&bytes);
            }
        } else {
            for &mini in covering {
                out.extend_from_slice(&self.read_mini_sector(reader, mini).await?);
            }
        }

        let skip = (offset % unit as u64) as usize;
        out.drain(..skip);
        out.truncate(len);
        Ok(out)
    }

    async fn read_mini_sector(
        &self,
        reader: &dyn RangeReader,
        mini: u32,
    ) -> Result<Bytes, ImageError> {
        let mini = mini as usize;
        let mini_size = self.mini_sector_size();
        let per_sector = self.sector_size() / mini_size;

        let sector = self
            .mini_container
            .get(mini / per_sector)
            .copied()
            .ok_or_else(|| {
                invalid_header(FORMAT, format!("mini sector {mini} outside mini stream"))
            })?;
        let offset = self.sector_offset(sector) + ((mini % per_sector) * mini_size) as u64;
        read_required(reader, FORMAT, offset, mini_size).await
    }
}

fn follow(table: &[u32], start: u32) -> Result<Vec<u32>, ImageError> {
    let mut chain = Vec::new();
    let mut sector = start;

    while sector != END_OF_CHAIN && sector != FREE_SECT {
        if chain.len() > table.len() {
            return Err(invalid_header(FORMAT, "cyclic sector chain"));
        }
        chain.push(sector);
        sector = *table.get(sector as usize).ok_or_else(|| {
            invalid_header(FORMAT, format!("sector {sector} outside allocation table"))
        })?;
    }
    Ok(chain)
}

/// Group a sector list into `(first sector, run length)` pairs.
fn contiguous_runs(sectors: &[u32]) -> Vec<(u32, usize)> {
    let mut runs: Vec<(u32, usize)> = Vec::new();
    for &sector in sectors {
        match runs.last_mut() {
            Some((start, count)) if *start as u64 + *count as u64 == sector as u64 => *count += 1,
            _ => runs.push((sector, 1)),
        }
    }
    runs
}

fn parse_dir_entry(raw: &[u8]) -> DirEntry {
    // Name: UTF-16LE, length in bytes including the terminator
    let name_len = (read_u16_le(&raw[0x40..0x42]) as usize).min(64);
    let units: Vec<u16> = raw[..name_len]
        .chunks_exact(2)
        .map(read_u16_le)
        .take_while(|&u| u != 0)
        .collect();

    DirEntry {
        name: String::from_utf16_lossy(&units),
        object_type: raw[0x42],
        left: read_u32_le(&raw[0x44..0x48]),
        right: read_u32_le(&raw[0x48..0x4C]),
        child: read_u32_le(&raw[0x4C..0x50]),
        start_sector: read_u32_le(&raw[0x74..0x78]),
        size: read_u32_le(&raw[0x78..0x7C]) as u64,
    }
}

// =============================================================================
// Test support
// =============================================================================

/// A node of a compound file built by [`build_test_file`].
#[cfg(test)]
pub(crate) enum TestNode<'a> {
    Stream(&'a str, &'a [u8]),
    Storage(&'a str, Vec<TestNode<'a>>),
}

#[cfg(test)]
struct TestEntry {
    name: String,
    object_type: u8,
    right: u32,
    child: u32,
    data: Vec<u8>,
    start: u32,
}

#[cfg(test)]
fn flatten_test_nodes(nodes: &[TestNode<'_>], entries: &mut Vec<TestEntry>) -> u32 {
    if nodes.is_empty() {
        return FREE_SECT;
    }

    // Siblings take consecutive indices, chained through right links
    let first = entries.len() as u32;
    for (i, node) in nodes.iter().enumerate() {
        let right = if i + 1 < nodes.len() {
            first + i as u32 + 1
        } else {
            FREE_SECT
        };
        let (name, object_type, data) = match node {
            TestNode::Stream(name, data) => (*name, TYPE_STREAM, data.to_vec()),
            TestNode::Storage(name, _) => (*name, TYPE_STORAGE, Vec::new()),
        };
        entries.push(TestEntry {
            name: name.to_string(),
            object_type,
            right,
            child: FREE_SECT,
            data,
            start: END_OF_CHAIN,
        });
    }

    for (i, node) in nodes.iter().enumerate() {
        if let TestNode::Storage(_, children) = node {
            let child = flatten_test_nodes(children, entries);
            entries[first as usize + i].child = child;
        }
    }
    first
}

/// Build a compound file with 512-byte sectors holding `nodes` under the
/// root storage.
///
/// Streams under the 4096-byte cutoff go to the mini stream; larger ones get
/// regular sectors. Sector order: FAT, directory, mini FAT, mini stream,
/// then each large stream.
#[cfg(test)]
pub(crate) fn build_test_file(nodes: &[TestNode<'_>]) -> Vec<u8> {
    const SECTOR: usize = 512;
    const MINI: usize = 64;
    const CUTOFF: usize = 4096;

    let mut entries = vec![TestEntry {
        name: "Root Entry".to_string(),
        object_type: TYPE_ROOT,
        right: FREE_SECT,
        child: FREE_SECT,
        data: Vec::new(),
        start: END_OF_CHAIN,
    }];
    let child = flatten_test_nodes(nodes, &mut entries);
    entries[0].child = child;

    // Mini stream contents and mini FAT
    let mut mini_stream = Vec::new();
    let mut mini_fat: Vec<u32> = Vec::new();
    for entry in entries.iter_mut().skip(1) {
        if entry.object_type != TYPE_STREAM || entry.data.len() >= CUTOFF || entry.data.is_empty()
        {
            continue;
        }
        let start = mini_fat.len() as u32;
        let count = entry.data.len().div_ceil(MINI);
        for i in 0..count as u32 {
            mini_fat.push(if i + 1 == count as u32 { END_OF_CHAIN } else { start + i + 1 });
        }
        mini_stream.extend_from_slice(&entry.data);
        mini_stream.resize((start as usize + count) * MINI, 0);
        entry.start = start;
    }

    let sectors_for = |len: usize| len.div_ceil(SECTOR);
    let dir_sectors = sectors_for(entries.len() * DIR_ENTRY_LEN);
    let mini_fat_sectors = sectors_for(mini_fat.len() * 4);
    let mini_stream_sectors = sectors_for(mini_stream.len());
    let large: Vec<usize> = entries
        .iter()
        .map(|e| {
            if e.object_type == TYPE_STREAM && e.data.len() >= CUTOFF {
                sectors_for(e.data.len())
            } else {
                0
            }
        })
        .collect();
    let payload =
        dir_sectors + mini_fat_sectors + mini_stream_sectors + large.iter().sum::<usize>();

    let mut fat_count = 1;
    while fat_count * (SECTOR / 4) < payload + fat_count {
        fat_count += 1;
    }
    assert!(fat_count <= HEADER_DIFAT_ENTRIES, "test file needs DIFAT sectors");

    let mut fat = vec![0xFFFF_FFFDu32; fat_count];
    let mut next = fat_count as u32;
    let mut allocate = |fat: &mut Vec<u32>, count: usize| -> u32 {
        if count == 0 {
            return END_OF_CHAIN;
        }
        let start = next;
        for i in 0..count as u32 {
            fat.push(if i + 1 == count as u32 { END_OF_CHAIN } else { start + i + 1 });
        }
        next += count as u32;
        start
    };

    let dir_start = allocate(&mut fat, dir_sectors);
    let mini_fat_start = allocate(&mut fat, mini_fat_sectors);
    entries[0].start = allocate(&mut fat, mini_stream_sectors);
    for (entry, &count) in entries.iter_mut().zip(&large) {
        if count > 0 {
            entry.start = allocate(&mut fat, count);
        }
    }
    fat.resize(fat_count * SECTOR / 4, FREE_SECT);

    let mut directory = Vec::new();
    for (i, entry) in entries.iter().enumerate() {
        let mut raw = vec![0u8; DIR_ENTRY_LEN];
        let units: Vec<u16> = entry.name.encode_utf16().collect();
        for (j, unit) in units.iter().enumerate() {
            raw[j * 2..j * 2 + 2].copy_from_slice(&unit.to_le_bytes());
        }
        let size = if i == 0 { mini_stream.len() } else { entry.data.len() };
        raw[0x40..0x42].copy_from_slice(&(((units.len() + 1) * 2) as u16).to_le_bytes());
        raw[0x42] = entry.object_type;
        raw[0x44..0x48].copy_from_slice(&FREE_SECT.to_le_bytes());
        raw[0x48..0x4C].copy_from_slice(&entry.right.to_le_bytes());
        raw[0x4C..0x50].copy_from_slice(&entry.child.to_le_bytes());
        raw[0x74..0x78].copy_from_slice(&entry.start.to_le_bytes());
        raw[0x78..0x7C].copy_from_slice(&(size as u32).to_le_bytes());
        directory.extend(raw);
    }
    directory.resize(dir_sectors * SECTOR, 0);

    let mut header = vec![0u8; HEADER_LEN];
    header[..8].copy_from_slice(&SIGNATURE);
    header[0x18..0x1A].copy_from_slice(&0x3Eu16.to_le_bytes());
    header[0x1A..0x1C].copy_from_slice(&3u16.to_le_bytes());
    header[0x1C..0x1E].copy_from_slice(&0xFFFEu16.to_le_bytes());
    header[0x1E..0x20].copy_from_slice(&9u16.to_le_bytes());
    header[0x20..0x22].copy_from_slice(&6u16.to_le_bytes());
    header[0x2C..0x30].copy_from_slice(&(fat_count as u32).to_le_bytes());
    header[0x30..0x34].copy_from_slice(&dir_start.to_le_bytes());
    header[0x38..0x3C].copy_from_slice(&(CUTOFF as u32).to_le_bytes());
    header[0x3C..0x40].copy_from_slice(&mini_fat_start.to_le_bytes());
    header[0x40..0x44].copy_from_slice(&(mini_fat_sectors as u32).to_le_bytes());
    header[0x44..0x48].copy_from_slice(&END_OF_CHAIN.to_le_bytes());
    for slot in header[0x4C..].chunks_exact_mut(4) {
        slot.copy_from_slice(&FREE_SECT.to_le_bytes());
    }
    for i in 0..fat_count {
        header[0x4C + i * 4..0x50 + i * 4].copy_from_slice(&(i as u32).to_le_bytes());
    }

    let mut mini_fat_bytes: Vec<u8> = mini_fat.iter().flat_map(|v| v.to_le_bytes()).collect();
    mini_fat_bytes.resize(mini_fat_sectors * SECTOR, 0xFF);
    mini_stream.resize(mini_stream_sectors * SECTOR, 0);

    let mut file = header;
    file.extend(fat.iter().flat_map(|v| v.to_le_bytes()));
    file.extend(directory);
    file.extend(mini_fat_bytes);
    file.extend(mini_stream);
    for (entry, &count) in entries.iter().zip(&large) {
        if count > 0 {
            let mut data = entry.data.clone();
            data.resize(count * SECTOR, 0);
            file.extend(data);
        }
    }
    file
}
