use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

const HEADER_LEN: u64 = 4;
const TRAILER_LEN: u64 = 4;
/// Anything longer is treated as a corrupt length prefix.
const MAX_RECORD_LEN: u32 = 1 << 20;

/// Frame one event as `[u32 len][bincode payload][u32 crc32]`, little endian.
/// Returns the framed size.
fn write_record(writer: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(HEADER_LEN + u64::from(len) + TRAILER_LEN)
}

/// Read one record. `Ok(None)` means a clean end, a torn tail or a bad checksum;
/// either way nothing after this point is trusted.
fn read_record(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_RECORD_LEN {
        return Ok(None);
    }
    let mut payload = vec![0u8; len as usize];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Some((event, HEADER_LEN + u64::from(len) + TRAILER_LEN))),
        Err(_) => Ok(None),
    }
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Result of scanning a log file.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Byte length of the trusted prefix.
    pub valid_len: u64,
    /// Bytes after the trusted prefix (torn or corrupt tail).
    pub discarded: u64,
}

/// Append-only booking log. Torn tails left by a crash are cut off on open so
/// new records never land behind garbage. A batch that fails to write is cut
/// off the same way before the next one starts.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// Length of the synced prefix. Everything past it belongs to the open batch.
    durable_len: u64,
    pending_len: u64,
    pending_appends: u64,
    /// Set when a failed batch could not be cut off. Appends are refused until
    /// a compaction rewrites the file.
    poisoned: bool,
    #[cfg(test)]
    fail_after: Option<usize>,
}

impl Wal {
    /// Open (or create) the log and return the events it already holds.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let scan = Self::replay(path)?;
        if scan.discarded > 0 {
            tracing::warn!(
                "{}: discarding {} trailing bytes after last valid record",
                path.display(),
                scan.discarded
            );
            OpenOptions::new().write(true).open(path)?.set_len(scan.valid_len)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let wal = Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: scan.events.len() as u64,
            durable_len: scan.valid_len,
            pending_len: 0,
            pending_appends: 0,
            poisoned: false,
            #[cfg(test)]
            fail_after: None,
        };
        Ok((wal, scan.events))
    }

    /// Buffer a record without syncing. Follow a batch with [`Wal::flush_sync`],
    /// or [`Wal::discard_pending`] if any append in it failed.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("log is poisoned by an unrecoverable write"));
        }
        #[cfg(test)]
        if let Some(left) = self.fail_after {
            if left == 0 {
                self.fail_after = None;
                self.writer.write_all(&[0xA5; 5])?;
                self.writer.flush()?;
                return Err(io::Error::other("injected write failure"));
            }
            self.fail_after = Some(left - 1);
        }
        self.pending_len += write_record(&mut self.writer, event)?;
        self.pending_appends += 1;
        Ok(())
    }

    /// Flush and fsync the open batch, making it part of the trusted prefix.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.durable_len += self.pending_len;
        self.appends_since_compact += self.pending_appends;
        self.pending_len = 0;
        self.pending_appends = 0;
        Ok(())
    }

    /// Drop the open batch: discard what is still buffered and cut the file
    /// back to the synced prefix. If the cut fails the log is poisoned.
    pub fn discard_pending(&mut self) -> io::Result<()> {
        self.pending_len = 0;
        self.pending_appends = 0;
        let cut = self.truncate_to_durable();
        if cut.is_err() {
            self.poisoned = true;
        }
        cut
    }

    fn truncate_to_durable(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back the buffer without writing it out.
        let (stale_file, _unwritten) = stale.into_parts();
        stale_file.set_len(self.durable_len)?;
        stale_file.sync_data()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Make the `n`th append from now write a partial record and fail.
    #[cfg(test)]
    pub fn fail_append_after(&mut self, n: usize) {
        self.fail_after = Some(n);
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records written since open or the last compaction.
    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Rewrite the log as exactly `events`: write a temp file, fsync, rename over.
    /// Clears a poisoned log, since the old file is replaced wholesale.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        if !self.poisoned {
            self.writer.flush()?;
        }
        let tmp = self.path.with_extension("wal.tmp");
        let mut written = 0;
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            for event in events {
                written += write_record(&mut out, event)?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        drop(stale.into_parts());
        self.appends_since_compact = 0;
        self.durable_len = written;
        self.pending_len = 0;
        self.pending_appends = 0;
        self.poisoned = false;
        Ok(())
    }

    /// Scan the log. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut scan = Replay::default();
        while let Some((event, size)) = read_record(&mut reader)? {
            scan.events.push(event);
            scan.valid_len += size;
        }
        scan.discarded = file_len - scan.valid_len;
        Ok(scan)
    }
}
