use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// Encode a single event as `[u32 len][bincode][u32 crc32]`, little-endian.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload = bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large for WAL entry"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Why decoding stopped before end of file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailState {
    Clean,
    Truncated,
    Corrupt,
}

/// Read one entry. `Ok(Err(state))` marks the end of the usable log.
fn decode_next(reader: &mut impl Read) -> io::Result<Result<Event, TailState>> {
    let mut len_buf = [0u8; 4];
    match read_exact_or_eof(reader, &mut len_buf)? {
        Fill::Empty => return Ok(Err(TailState::Clean)),
        Fill::Partial => return Ok(Err(TailState::Truncated)),
        Fill::Full => {}
    }
    let mut payload = vec![0u8; u32::from_le_bytes(len_buf) as usize];
    if read_exact_or_eof(reader, &mut payload)? != Fill::Full {
        return Ok(Err(TailState::Truncated));
    }
    let mut crc_buf = [0u8; 4];
    if read_exact_or_eof(reader, &mut crc_buf)? != Fill::Full {
        return Ok(Err(TailState::Truncated));
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Err(TailState::Corrupt));
    }
    Ok(bincode::deserialize::<Event>(&payload).map_err(|_| TailState::Corrupt))
}

#[derive(PartialEq, Eq)]
enum Fill {
    Empty,
    Partial,
    Full,
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<Fill> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(match filled {
        0 if !buf.is_empty() => Fill::Empty,
        n if n == buf.len() => Fill::Full,
        _ => Fill::Partial,
    })
}

/// Append-only write-ahead log of series events.
///
/// A crash mid-write leaves at most one partial entry at the tail; replay
/// detects it through the length prefix and CRC and stops there.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Buffer an event. Nothing is durable until [`Wal::flush_sync`].
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write the compacted log to a side file and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::tmp_path(path))?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the side file over the live log and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// All valid events in `path`; a missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        loop {
            match decode_next(&mut reader)? {
                Ok(event) => events.push(event),
                Err(TailState::Clean) => break,
                Err(tail) => {
                    warn!(?tail, kept = events.len(), path = %path.display(), "discarding WAL tail");
                    break;
                }
            }
        }
        Ok(events)
    }
}
