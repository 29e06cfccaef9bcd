//! Append-only log of engine commits.
//!
//! On disk every commit is one frame: `[u32 len LE][bincode Vec<Event>][u32 crc32 LE]`.
//! A torn tail after a crash fails the length or CRC check and is dropped
//! on replay.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// One WAL record: every event in it is applied, or none are.
pub type Commit = Vec<Event>;

/// Events per frame when writing a snapshot.
const SNAPSHOT_FRAME_EVENTS: usize = 4096;
/// len + crc
const FRAME_OVERHEAD: u64 = 8;

fn invalid(e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

fn write_frame(out: &mut impl Write, events: &[Event]) -> io::Result<()> {
    let body = bincode::serialize(events).map_err(invalid)?;
    let len = u32::try_from(body.len()).map_err(|_| invalid("commit exceeds 4 GiB"))?;
    out.write_all(&len.to_le_bytes())?;
    out.write_all(&body)?;
    out.write_all(&crc32fast::hash(&body).to_le_bytes())
}

/// `Ok(None)` at a clean end of file or a short read.
fn read_exact_or_eof(input: &mut impl Read, buf: &mut [u8]) -> io::Result<Option<()>> {
    match input.read_exact(buf) {
        Ok(()) => Ok(Some(())),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

/// Next intact frame body, or `None` once the remaining bytes can't form one.
fn read_frame(input: &mut impl Read, remaining: u64) -> io::Result<Option<Vec<u8>>> {
    let mut word = [0u8; 4];
    if read_exact_or_eof(input, &mut word)?.is_none() {
        return Ok(None);
    }
    let len = u64::from(u32::from_le_bytes(word));
    if len + FRAME_OVERHEAD > remaining {
        return Ok(None);
    }
    let mut body = vec![0u8; len as usize];
    if read_exact_or_eof(input, &mut body)?.is_none() {
        return Ok(None);
    }
    if read_exact_or_eof(input, &mut word)?.is_none() {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&body) {
        return Ok(None);
    }
    Ok(Some(body))
}

/// What `replay` found on disk.
#[derive(Debug, Default)]
pub struct Replay {
    pub commits: Vec<Commit>,
    /// Bytes after the last valid frame (torn write or corruption).
    pub discarded_bytes: u64,
}

pub struct Wal {
    out: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        Ok(Self {
            out: BufWriter::new(Self::open_append(path)?),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    fn open_append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    /// Buffer one commit. Nothing is durable until `sync`.
    pub fn stage(&mut self, commit: &[Event]) -> io::Result<()> {
        write_frame(&mut self.out, commit)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn sync(&mut self) -> io::Result<()> {
        self.out.flush()?;
        self.out.get_ref().sync_all()
    }

    /// Replace the log with `snapshot`. The new file is fully synced before
    /// it is renamed over the old one.
    pub fn rewrite(&mut self, snapshot: &[Event]) -> io::Result<()> {
        self.sync()?;
        let staging = self.path.with_extension("wal.tmp");
        {
            let mut out = BufWriter::new(File::create(&staging)?);
            for frame in snapshot.chunks(SNAPSHOT_FRAME_EVENTS) {
                write_frame(&mut out, frame)?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&staging, &self.path)?;
        self.out = BufWriter::new(Self::open_append(&self.path)?);
        self.appends_since_compact = 0;
        Ok(())
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Read every intact commit. Stops at the first bad frame.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let total = file.metadata()?.len();
        let mut input = BufReader::new(file);
        let mut replay = Replay::default();
        let mut consumed = 0u64;

        while let Some(body) = read_frame(&mut input, total - consumed)? {
            let Ok(commit) = bincode::deserialize::<Commit>(&body) else {
                break;
            };
            consumed += body.len() as u64 + FRAME_OVERHEAD;
            replay.commits.push(commit);
        }
        replay.discarded_bytes = total - consumed;
        Ok(replay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SpaceInfo;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("deskhub_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn space() -> Event {
        Event::SpaceRegistered(SpaceInfo {
            id: Ulid::new(),
            venue_id: Ulid::new(),
            hourly_rate: None,
            daily_rate: None,
        })
    }

    fn deactivated() -> Event {
        Event::PolicyDeactivated { id: Ulid::new() }
    }

    fn write_all(path: &Path, commits: &[Commit]) {
        let mut wal = Wal::open(path).unwrap();
        for c in commits {
            wal.stage(c).unwrap();
        }
        wal.sync().unwrap();
    }

    #[test]
    fn staged_commits_replay_in_order() {
        let path = test_wal_path("order.wal");
        let commits = vec![vec![space()], vec![space(), deactivated()], vec![deactivated()]];
        write_all(&path, &commits);

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.commits, commits);
        assert_eq!(replay.discarded_bytes, 0);
    }

    #[test]
    fn torn_tail_is_dropped() {
        let path = test_wal_path("torn.wal");
        let commits = vec![vec![space()]];
        write_all(&path, &commits);
        OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(&[0xFF; 6])
            .unwrap();

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.commits, commits);
        assert_eq!(replay.discarded_bytes, 6);
    }

    #[test]
    fn missing_file_is_empty() {
        let path = test_wal_path("missing.wal");
        let replay = Wal::replay(&path).unwrap();
        assert!(replay.commits.is_empty());
        assert_eq!(replay.discarded_bytes, 0);
    }

    #[test]
    fn checksum_mismatch_stops_replay() {
        let path = test_wal_path("bad_crc.wal");
        let body = bincode::serialize(&vec![deactivated()]).unwrap();
        let mut f = File::create(&path).unwrap();
        f.write_all(&(body.len() as u32).to_le_bytes()).unwrap();
        f.write_all(&body).unwrap();
        f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        drop(f);

        let replay = Wal::replay(&path).unwrap();
        assert!(replay.commits.is_empty());
        assert_eq!(replay.discarded_bytes, body.len() as u64 + FRAME_OVERHEAD);
    }

    #[test]
    fn rewrite_shrinks_and_accepts_appends() {
        let path = test_wal_path("rewrite.wal");
        let churn: Vec<Commit> = (0..20).map(|_| vec![deactivated()]).collect();
        let snapshot = vec![space()];
        let after = vec![space()];

        let mut wal = Wal::open(&path).unwrap();
        for c in &churn {
            wal.stage(c).unwrap();
        }
        wal.sync().unwrap();
        assert_eq!(wal.appends_since_compact(), 20);
        let before = fs::metadata(&path).unwrap().len();

        wal.rewrite(&snapshot).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        wal.stage(&after).unwrap();
        wal.sync().unwrap();
        drop(wal);

        assert!(fs::metadata(&path).unwrap().len() < before);
        assert_eq!(Wal::replay(&path).unwrap().commits, vec![snapshot, after]);
    }

    #[test]
    fn large_snapshot_spans_frames() {
        let path = test_wal_path("large_snapshot.wal");
        let snapshot: Vec<Event> = (0..SNAPSHOT_FRAME_EVENTS + 10).map(|_| deactivated()).collect();
        let mut wal = Wal::open(&path).unwrap();
        wal.rewrite(&snapshot).unwrap();
        drop(wal);

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.commits.len(), 2);
        assert_eq!(replay.commits.concat(), snapshot);
    }
}
