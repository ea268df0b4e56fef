use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Larger length prefixes can only come from a corrupt tail.
const MAX_FRAME_LEN: usize = 1 << 20;

/// Encode a single event as `[len][bincode][crc32]`.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Read exactly `buf.len()` bytes. `Ok(false)` on a clean or torn EOF.
fn read_frame_part(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Decode the next event and its frame length. `Ok(None)` marks the end of
/// the usable log: EOF, a truncated tail, a CRC mismatch, or an undecodable
/// payload.
fn decode_next(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_frame_part(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(None);
    }

    let mut payload = vec![0u8; len];
    if !read_frame_part(reader, &mut payload)? {
        return Ok(None);
    }

    let mut crc_buf = [0u8; 4];
    if !read_frame_part(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }

    let frame_len = (len + 8) as u64;
    Ok(bincode::deserialize::<Event>(&payload)
        .ok()
        .map(|event| (event, frame_len)))
}

/// Every valid event from the head of the log, and the byte offset where
/// the valid prefix ends. A missing file is an empty log.
fn read_log(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut valid_len = 0;
    while let Some((event, frame_len)) = decode_next(&mut reader)? {
        events.push(event);
        valid_len += frame_len;
    }
    Ok((events, valid_len))
}

/// Append-only write-ahead log of store mutations.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A torn or corrupt tail (crash mid-write) is cut off when the log is
///   opened, so new entries always follow the last valid one.
///
/// Appends are encoded into a pending buffer and reach the file only in
/// `flush_sync`. A failed flush truncates the file back to the last synced
/// offset.
pub struct Wal {
    file: File,
    path: PathBuf,
    /// Bytes of the file known to hold complete, synced frames.
    synced_len: u64,
    pending: Vec<u8>,
    pending_count: u64,
    appends_since_compact: u64,
}

impl Wal {
    /// Replay the log at `path`, cut off any torn tail, and open it for
    /// appends. Returns the writer and the replayed events.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (events, valid_len) = read_log(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > valid_len {
            tracing::warn!(
                "WAL {}: discarding {} bytes of torn or corrupt tail",
                path.display(),
                on_disk - valid_len
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        let wal = Self {
            file,
            path: path.to_path_buf(),
            synced_len: valid_len,
            pending: Vec::new(),
            pending_count: 0,
            appends_since_compact: 0,
        };
        Ok((wal, events))
    }

    /// Append one event and fsync. Production writes go through
    /// `append_buffered` + `flush_sync` for group commit.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event without writing. Durable only after `flush_sync()`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.pending, event)?;
        self.pending_count += 1;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Drop everything buffered since the last flush.
    pub fn discard_pending(&mut self) {
        self.appends_since_compact -= self.pending_count;
        self.pending.clear();
        self.pending_count = 0;
    }

    /// Write the pending frames and fsync. On failure the file is cut back
    /// to the last synced offset and the pending frames are dropped.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let written = self
            .file
            .write_all(&self.pending)
            .and_then(|()| self.file.sync_data());
        match written {
            Ok(()) => {
                self.synced_len += self.pending.len() as u64;
                self.pending.clear();
                self.pending_count = 0;
                Ok(())
            }
            Err(e) => {
                self.discard_pending();
                if let Err(trunc) = self.file.set_len(self.synced_len) {
                    tracing::error!("WAL truncate after failed write: {trunc}");
                }
                Err(e)
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Write the compacted event set to `<path>.tmp` and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted temp file over the log and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.synced_len = file.metadata()?.len();
        self.file = file;
        self.pending.clear();
        self.pending_count = 0;
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Read every valid event without opening the log for writing.
    #[cfg(test)]
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        read_log(path).map(|(events, _)| events)
    }
}
