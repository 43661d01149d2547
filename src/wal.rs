use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Length prefix plus trailing checksum.
const FRAME_OVERHEAD: u64 = 8;

/// Upper bound on a single encoded event; a longer prefix means a garbage tail.
const MAX_FRAME_LEN: usize = 1 << 20;

fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

enum Frame {
    Event(Event, u64),
    /// Clean end of file.
    End,
    /// Partial or corrupt record: everything from here on is discarded.
    Torn,
}

/// Read exactly `buf.len()` bytes. `Ok(false)` on EOF before the buffer filled.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_frame(reader: &mut impl Read) -> io::Result<Frame> {
    let mut first = [0u8; 1];
    if reader.read(&mut first)? == 0 {
        return Ok(Frame::End);
    }
    let mut rest = [0u8; 3];
    if !fill(reader, &mut rest)? {
        return Ok(Frame::Torn);
    }
    let len = u32::from_le_bytes([first[0], rest[0], rest[1], rest[2]]) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(Frame::Torn);
    }

    let mut payload = vec![0u8; len];
    let mut crc = [0u8; 4];
    if !fill(reader, &mut payload)? || !fill(reader, &mut crc)? {
        return Ok(Frame::Torn);
    }
    if u32::from_le_bytes(crc) != crc32fast::hash(&payload) {
        return Ok(Frame::Torn);
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Frame::Event(event, len as u64 + FRAME_OVERHEAD)),
        Err(_) => Ok(Frame::Torn),
    }
}

/// Valid events plus the byte offset where the valid prefix ends.
fn scan_reader(reader: impl Read) -> io::Result<(Vec<Event>, u64)> {
    let mut reader = BufReader::new(reader);
    let mut events = Vec::new();
    let mut valid_len = 0u64;
    loop {
        match read_frame(&mut reader)? {
            Frame::Event(event, size) => {
                events.push(event);
                valid_len += size;
            }
            Frame::End | Frame::Torn => break,
        }
    }
    Ok((events, valid_len))
}

fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    match File::open(path) {
        Ok(file) => scan_reader(file),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok((Vec::new(), 0)),
        Err(e) => Err(e),
    }
}

/// Where log bytes land.
pub trait LogSink: Write + Send {
    /// Make every written byte durable.
    fn sync(&mut self) -> io::Result<()>;
    /// Cut the log back to `len` bytes, durably.
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl LogSink for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)?;
        self.sync_all()
    }
}

/// Append-only event log for one property.
///
/// Each record is `[u32 le: len][bincode Event][u32 le: crc32 of payload]`.
/// A crash mid-write leaves a torn record at the tail; recovery drops it and
/// truncates the file so later appends stay reachable. A batch that fails to
/// commit is cut off again before the call returns, so the file only ever
/// holds acknowledged batches.
pub struct Wal<S: LogSink = File> {
    sink: S,
    path: PathBuf,
    /// Length of the acknowledged prefix.
    durable_len: u64,
    appends_since_compact: u64,
    /// Set when a failed batch could not be cut off. Every later commit fails.
    poisoned: bool,
}

impl Wal {
    /// Open the log at `path`, creating it if missing, and return every event
    /// it durably holds.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (events, valid_len) = scan(path)?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > valid_len {
            tracing::warn!(
                "discarding {} trailing bytes of {}",
                on_disk - valid_len,
                path.display()
            );
            LogSink::truncate(&mut file, valid_len)?;
        }
        let wal = Self {
            sink: file,
            path: path.to_path_buf(),
            durable_len: valid_len,
            appends_since_compact: 0,
            poisoned: false,
        };
        Ok((wal, events))
    }

    /// Replace the log with `events`: write a sibling temp file, fsync it,
    /// rename it over the log and reopen for appends. A crash at any point
    /// leaves either the old log or the new one intact.
    pub fn rewrite(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            for event in events {
                write_frame(&mut tmp, event)?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        // The old handle now points at an unlinked file.
        let reopened = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .and_then(|file| Ok((file.metadata()?.len(), file)));
        match reopened {
            Ok((len, file)) => {
                self.sink = file;
                self.durable_len = len;
                self.poisoned = false;
            }
            Err(e) => {
                tracing::error!("reopening {} after rewrite failed: {e}", self.path.display());
                self.poisoned = true;
                return Err(e);
            }
        }
        self.appends_since_compact = 0;

        if let Some(dir) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            File::open(dir)?.sync_all()?;
        }
        Ok(())
    }
}

impl<S: LogSink> Wal<S> {
    /// Append `events` as one durable unit. On error none of them is left in
    /// the log.
    pub fn commit(&mut self, events: &[Event]) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL refuses appends after a failed rollback"));
        }
        let mut batch = Vec::new();
        for event in events {
            write_frame(&mut batch, event)?;
        }
        let written = self
            .sink
            .write_all(&batch)
            .and_then(|()| self.sink.flush())
            .and_then(|()| self.sink.sync());
        if let Err(e) = written {
            self.roll_back();
            return Err(e);
        }
        self.durable_len += batch.len() as u64;
        self.appends_since_compact += events.len() as u64;
        Ok(())
    }

    fn roll_back(&mut self) {
        if let Err(e) = self.sink.truncate(self.durable_len) {
            tracing::error!(
                "WAL rollback to {} bytes failed, refusing further appends: {e}",
                self.durable_len
            );
            self.poisoned = true;
        }
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.commit(std::slice::from_ref(event))
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }
}
