//! Incremental line reader for one tracked file.
//!
//! `TailReader` owns the file handle, the byte offset and the partial-line
//! buffer. All methods are blocking; the tail task calls them from
//! `spawn_blocking`.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tailweb_core::{FileSnapshot, LineRecord, RotationCause, RotationEvent, TailError};

/// Chunk size for backward scans.
const SCAN_CHUNK: u64 = 8 * 1024;

/// Reader limits and the initial-attach policy.
#[derive(Clone, Debug)]
pub struct ReaderConfig {
    /// Complete lines emitted on first attach. `0` seeks to end-of-file.
    pub backfill_lines: usize,
    /// Bytes scanned backwards from end-of-file on attach.
    pub backfill_max_bytes: u64,
    /// A partial line longer than this is flushed as a line.
    pub max_line_bytes: usize,
    /// Bytes read per [`TailReader::read_to`] call.
    pub max_read_bytes: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            backfill_lines: 0,
            backfill_max_bytes: 64 * 1024,
            max_line_bytes: 1024 * 1024,
            max_read_bytes: 256 * 1024,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Line splitting
// ─────────────────────────────────────────────────────────────────────────────

/// Splits a byte stream into lines, carrying an unterminated tail between
/// calls.
#[derive(Debug)]
pub struct LineSplitter {
    partial: Vec<u8>,
    max_line_bytes: usize,
    skip_to_newline: bool,
}

impl LineSplitter {
    /// Splitter that flushes partial lines at `max_line_bytes`.
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            partial: Vec::new(),
            max_line_bytes: max_line_bytes.max(1),
            skip_to_newline: false,
        }
    }

    /// Feed `bytes`, calling `emit` once per complete line (terminator and a
    /// trailing `\r` stripped).
    pub fn feed(&mut self, mut bytes: &[u8], mut emit: impl FnMut(&[u8])) {
        if self.skip_to_newline {
            match bytes.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    self.skip_to_newline = false;
                    bytes = &bytes[pos + 1..];
                }
                None => return,
            }
        }

        let mut start = 0;
        while let Some(rel) = bytes[start..].iter().position(|&b| b == b'\n') {
            let end = start + rel;
            if self.partial.is_empty() {
                emit(strip_cr(&bytes[start..end]));
            } else {
                self.partial.extend_from_slice(&bytes[start..end]);
                emit(strip_cr(&self.partial));
                self.partial.clear();
            }
            start = end + 1;
        }

        let mut rest = &bytes[start..];
        while !rest.is_empty() {
            let room = self.max_line_bytes.saturating_sub(self.partial.len());
            let take = room.min(rest.len());
            self.partial.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.partial.len() >= self.max_line_bytes {
                emit(&self.partial);
                self.partial.clear();
            }
        }
    }

    /// Seed an unterminated fragment found at attach time.
    pub fn set_partial(&mut self, fragment: &[u8]) {
        self.partial.clear();
        self.partial.extend_from_slice(fragment);
    }

    /// Discard input until the next newline.
    pub fn skip_to_newline(&mut self) {
        self.partial.clear();
        self.skip_to_newline = true;
    }

    /// Forget any buffered fragment.
    pub fn reset(&mut self) {
        self.partial.clear();
        self.skip_to_newline = false;
    }

    /// Bytes buffered waiting for a terminator.
    pub fn pending(&self) -> usize {
        self.partial.len()
    }
}

fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

// ─────────────────────────────────────────────────────────────────────────────
// Backward scan
// ─────────────────────────────────────────────────────────────────────────────

/// Result of scanning the end of a file.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TailScan {
    /// Up to `max_lines` complete lines, oldest first.
    pub lines: Vec<Vec<u8>>,
    /// Bytes after the last newline.
    pub fragment: Vec<u8>,
    /// The fragment's start was not reached within the byte budget.
    pub fragment_truncated: bool,
}

/// Scan backwards from `size` for the last `max_lines` complete lines,
/// reading at most `max_bytes`.
pub fn scan_tail(
    file: &mut File,
    size: u64,
    max_lines: usize,
    max_bytes: u64,
) -> io::Result<TailScan> {
    let floor = size.saturating_sub(max_bytes);
    let mut pos = size;
    let mut chunks: Vec<Vec<u8>> = Vec::new();
    let mut newlines = 0usize;

    while pos > floor && newlines <= max_lines {
        let len = SCAN_CHUNK.min(pos - floor);
        pos -= len;
        let mut chunk = vec![0u8; len as usize];
        let _ = file.seek(SeekFrom::Start(pos))?;
        file.read_exact(&mut chunk)?;
        newlines += chunk.iter().filter(|&&b| b == b'\n').count();
        chunks.push(chunk);
    }

    let buf: Vec<u8> = chunks.into_iter().rev().flatten().collect();
    let at_start = pos == 0;

    let Some(last_nl) = buf.iter().rposition(|&b| b == b'\n') else {
        return Ok(TailScan {
            lines: Vec::new(),
            fragment: buf,
            fragment_truncated: !at_start,
        });
    };

    let fragment = buf[last_nl + 1..].to_vec();
    let mut segments: Vec<&[u8]> = buf[..last_nl].split(|&b| b == b'\n').collect();
    if !at_start && !segments.is_empty() {
        // The first segment may begin mid-line.
        let _ = segments.remove(0);
    }
    let skip = segments.len().saturating_sub(max_lines);
    let lines = segments
        .into_iter()
        .skip(skip)
        .map(|s| strip_cr(s).to_vec())
        .collect();

    Ok(TailScan {
        lines,
        fragment,
        fragment_truncated: false,
    })
}

/// Last `max_lines` complete lines of `path`, decoded lossily.
pub fn read_last_lines(path: &Path, max_lines: usize, max_bytes: u64) -> Result<Vec<String>, TailError> {
    let mut file = File::open(path).map_err(|e| TailError::from_io(&e, path))?;
    let size = file.metadata().map_err(|e| TailError::from_io(&e, path))?.len();
    let scan = scan_tail(&mut file, size, max_lines, max_bytes).map_err(|e| TailError::from_io(&e, path))?;
    Ok(scan
        .lines
        .iter()
        .map(|line| String::from_utf8_lossy(line).into_owned())
        .collect())
}

// ─────────────────────────────────────────────────────────────────────────────
// Reader
// ─────────────────────────────────────────────────────────────────────────────

/// Lines produced by one read.
#[derive(Debug, Default)]
pub struct ReadBatch {
    /// Complete lines, in file order.
    pub records: Vec<LineRecord>,
    /// More bytes remain before the requested size.
    pub more: bool,
}

/// Outcome of the initial attach.
#[derive(Debug)]
pub struct Attached {
    /// Backfill lines, numbered from 0.
    pub records: Vec<LineRecord>,
    /// File state the offset was positioned against.
    pub snapshot: FileSnapshot,
}

/// Reads newly appended bytes from a tracked offset.
#[derive(Debug)]
pub struct TailReader {
    path: PathBuf,
    config: ReaderConfig,
    file: Option<File>,
    offset: u64,
    next_seq: u64,
    splitter: LineSplitter,
}

impl TailReader {
    /// Reader positioned at offset 0 with no file open.
    pub fn new(path: impl Into<PathBuf>, config: ReaderConfig) -> Self {
        let splitter = LineSplitter::new(config.max_line_bytes);
        Self {
            path: path.into(),
            config,
            file: None,
            offset: 0,
            next_seq: 0,
            splitter,
        }
    }

    /// Apply the backfill policy: position at end-of-file and return the last
    /// `backfill_lines` complete lines. A trailing unterminated fragment is
    /// kept so the line it starts is emitted whole once completed.
    ///
    /// On error the reader stays at offset 0, so a file that appears later is
    /// read from its beginning.
    pub fn attach(&mut self) -> Result<Attached, TailError> {
        let mut file = self.open()?;
        let meta = file.metadata().map_err(|e| self.io_err(&e))?;
        let snapshot = FileSnapshot::from_metadata(&meta);

        let scan = scan_tail(
            &mut file,
            snapshot.size,
            self.config.backfill_lines,
            self.config.backfill_max_bytes,
        )
        .map_err(|e| self.io_err(&e))?;

        self.splitter.reset();
        if scan.fragment_truncated {
            self.splitter.skip_to_newline();
        } else {
            self.splitter.set_partial(&scan.fragment);
        }
        self.offset = snapshot.size;
        self.file = Some(file);

        let records = scan
            .lines
            .iter()
            .map(|line| self.next_record(line))
            .collect();
        Ok(Attached { records, snapshot })
    }

    /// Read from the current offset towards `size`, at most `max_read_bytes`.
    ///
    /// The file is reopened first if no handle is held, so a call with
    /// nothing new to read still reports a file that cannot be opened.
    pub fn read_to(&mut self, size: u64) -> Result<ReadBatch, TailError> {
        if self.file.is_none() {
            self.file = Some(self.open()?);
        }
        if size <= self.offset {
            return Ok(ReadBatch::default());
        }

        let want = (size - self.offset).min(self.config.max_read_bytes as u64);
        let mut buf = Vec::with_capacity(want as usize);
        let read = match self.file.as_mut() {
            Some(file) => file
                .seek(SeekFrom::Start(self.offset))
                .and_then(|_| file.take(want).read_to_end(&mut buf)),
            None => Ok(0),
        };
        let n = match read {
            Ok(n) => n as u64,
            Err(e) => {
                self.file = None;
                return Err(self.io_err(&e));
            }
        };
        self.offset += n;

        let mut lines: Vec<Vec<u8>> = Vec::new();
        self.splitter.feed(&buf, |line| lines.push(line.to_vec()));
        let records = lines.iter().map(|line| self.next_record(line)).collect();

        Ok(ReadBatch {
            records,
            more: n == want && self.offset < size,
        })
    }

    /// Reset after a rotation: drop the handle, discard the partial line and
    /// rewind to offset 0. The marker takes a sequence number of its own, so
    /// the first line of the new file follows it.
    pub fn rotate(
        &mut self,
        old: Option<FileSnapshot>,
        new: FileSnapshot,
        cause: RotationCause,
    ) -> RotationEvent {
        self.file = None;
        self.offset = 0;
        self.splitter.reset();
        let seq = self.next_seq;
        self.next_seq += 1;
        RotationEvent {
            seq,
            old,
            new,
            cause,
            at: Utc::now(),
        }
    }

    /// Current byte offset.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Next sequence number to assign, to a line or a rotation marker.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Bytes held in the partial-line buffer.
    pub fn pending_bytes(&self) -> usize {
        self.splitter.pending()
    }

    fn next_record(&mut self, line: &[u8]) -> LineRecord {
        let record = LineRecord::decode(self.next_seq, line);
        self.next_seq += 1;
        record
    }

    /// Open the tracked path, rejecting directories.
    fn open(&self) -> Result<File, TailError> {
        let file = File::open(&self.path).map_err(|e| self.io_err(&e))?;
        let meta = file.metadata().map_err(|e| self.io_err(&e))?;
        if meta.is_dir() {
            return Err(self.io_err(&io::Error::other("is a directory")));
        }
        Ok(file)
    }

    fn io_err(&self, err: &io::Error) -> TailError {
        TailError::from_io(err, &self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    fn split_all(chunks: &[&[u8]], max: usize) -> (Vec<String>, usize) {
        let mut splitter = LineSplitter::new(max);
        let mut out = Vec::new();
        for chunk in chunks {
            splitter.feed(chunk, |l| out.push(String::from_utf8_lossy(l).into_owned()));
        }
        (out, splitter.pending())
    }

    fn texts(records: &[LineRecord]) -> Vec<&str> {
        records.iter().map(|r| r.text.as_str()).collect()
    }

    fn append(path: &Path, bytes: &[u8]) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(bytes).unwrap();
    }

    // ── splitter ────────────────────────────────────────────────────

    #[test]
    fn partial_line_is_buffered_across_feeds() {
        let (lines, pending) = split_all(&[b"hel", b"lo\nwor", b"ld\n"], 1024);
        assert_eq!(lines, vec!["hello", "world"]);
        assert_eq!(pending, 0);
    }

    #[test]
    fn crlf_and_empty_lines() {
        let (lines, _) = split_all(&[b"a\r\n\r\n\nb\n"], 1024);
        assert_eq!(lines, vec!["a", "", "", "b"]);
    }

    #[test]
    fn oversized_partial_is_flushed() {
        let (lines, pending) = split_all(&[b"abcdefgh", b"ij\n"], 4);
        assert_eq!(lines, vec!["abcd", "efgh", "ij"]);
        assert_eq!(pending, 0);
    }

    #[test]
    fn skip_to_newline_discards_fragment() {
        let mut splitter = LineSplitter::new(1024);
        splitter.skip_to_newline();
        let mut out = Vec::new();
        splitter.feed(b"tail-of-old\nfresh\n", |l| out.push(l.to_vec()));
        assert_eq!(out, vec![b"fresh".to_vec()]);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn chunking_does_not_change_lines(
                lines in proptest::collection::vec("[a-z ]{0,12}", 0..20),
                cuts in proptest::collection::vec(0usize..200, 0..8),
            ) {
                let mut data = Vec::new();
                for line in &lines {
                    data.extend_from_slice(line.as_bytes());
                    data.push(b'\n');
                }
                let mut points: Vec<usize> = cuts.into_iter().map(|c| c % (data.len() + 1)).collect();
                points.sort_unstable();
                let mut chunks: Vec<&[u8]> = Vec::new();
                let mut last = 0;
                for p in points {
                    chunks.push(&data[last..p]);
                    last = p;
                }
                chunks.push(&data[last..]);

                let (out, pending) = split_all(&chunks, 4096);
                prop_assert_eq!(out, lines);
                prop_assert_eq!(pending, 0);
            }
        }
    }

    // ── backward scan ───────────────────────────────────────────────

    #[test]
    fn scan_returns_last_lines_and_fragment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, b"one\ntwo\nthree\nfour\npart");
        let mut file = File::open(&path).unwrap();
        let size = file.metadata().unwrap().len();
        let scan = scan_tail(&mut file, size, 2, 1024).unwrap();
        assert_eq!(scan.lines, vec![b"three".to_vec(), b"four".to_vec()]);
        assert_eq!(scan.fragment, b"part".to_vec());
        assert!(!scan.fragment_truncated);
    }

    #[test]
    fn scan_respects_byte_budget() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, b"aaaaaaaaaa\nbb\ncc\n");
        let mut file = File::open(&path).unwrap();
        let size = file.metadata().unwrap().len();
        // Last 8 bytes: "\nbb\ncc\n" preceded by one 'a'. The partial first
        // segment is dropped.
        let scan = scan_tail(&mut file, size, 10, 8).unwrap();
        assert_eq!(scan.lines, vec![b"bb".to_vec(), b"cc".to_vec()]);
    }

    #[test]
    fn scan_spanning_multiple_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.log");
        let mut data = Vec::new();
        for i in 0..5_000 {
            data.extend_from_slice(format!("line-{i}\n").as_bytes());
        }
        append(&path, &data);
        let lines = read_last_lines(&path, 3, 1024 * 1024).unwrap();
        assert_eq!(lines, vec!["line-4997", "line-4998", "line-4999"]);
    }

    #[test]
    fn read_last_lines_missing_file() {
        assert_matches!(
            read_last_lines(Path::new("/definitely/not/here.log"), 5, 1024),
            Err(TailError::FileNotFound { .. })
        );
    }

    // ── reader ──────────────────────────────────────────────────────

    #[test]
    fn attach_without_backfill_starts_at_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, b"old\n");
        let mut reader = TailReader::new(&path, ReaderConfig::default());
        let attached = reader.attach().unwrap();
        assert!(attached.records.is_empty());
        assert_eq!(reader.offset(), 4);

        append(&path, b"new\n");
        let batch = reader.read_to(8).unwrap();
        assert_eq!(texts(&batch.records), vec!["new"]);
        assert_eq!(batch.records[0].seq, 0);
    }

    #[test]
    fn attach_with_backfill_numbers_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, b"a\nb\nc\nd\n");
        let config = ReaderConfig {
            backfill_lines: 2,
            ..ReaderConfig::default()
        };
        let mut reader = TailReader::new(&path, config);
        let attached = reader.attach().unwrap();
        assert_eq!(texts(&attached.records), vec!["c", "d"]);
        assert_eq!(attached.records[1].seq, 1);
        assert_eq!(reader.next_seq(), 2);
    }

    #[test]
    fn attach_keeps_trailing_fragment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, b"done\nhalf");
        let mut reader = TailReader::new(&path, ReaderConfig::default());
        let _ = reader.attach().unwrap();
        assert_eq!(reader.pending_bytes(), 4);

        append(&path, b"-line\n");
        let batch = reader.read_to(15).unwrap();
        assert_eq!(texts(&batch.records), vec!["half-line"]);
    }

    #[test]
    fn attach_missing_file_leaves_offset_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("later.log");
        let mut reader = TailReader::new(&path, ReaderConfig::default());
        assert_matches!(reader.attach(), Err(TailError::FileNotFound { .. }));
        assert_eq!(reader.offset(), 0);

        append(&path, b"first\n");
        let batch = reader.read_to(6).unwrap();
        assert_eq!(texts(&batch.records), vec!["first"]);
    }

    #[test]
    fn read_to_reports_open_failure_with_nothing_to_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.log");
        let mut reader = TailReader::new(&path, ReaderConfig::default());
        assert_matches!(reader.read_to(0), Err(TailError::FileNotFound { .. }));

        std::fs::write(&path, b"").unwrap();
        assert_eq!(reader.read_to(0).unwrap().records.len(), 0);
    }

    #[test]
    fn read_to_directory_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::create_dir(&path).unwrap();
        let mut reader = TailReader::new(&path, ReaderConfig::default());
        assert_matches!(reader.attach(), Err(TailError::Io { .. }));
        assert_eq!(reader.offset(), 0);
    }

    #[test]
    fn read_is_capped_per_call() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"").unwrap();
        let config = ReaderConfig {
            max_read_bytes: 4,
            ..ReaderConfig::default()
        };
        let mut reader = TailReader::new(&path, config);
        let _ = reader.attach().unwrap();
        append(&path, b"ab\ncd\nef\n");

        let mut all = Vec::new();
        loop {
            let batch = reader.read_to(9).unwrap();
            all.extend(batch.records.into_iter().map(|r| r.text));
            if !batch.more {
                break;
            }
        }
        assert_eq!(all, vec!["ab", "cd", "ef"]);
        assert_eq!(reader.offset(), 9);
    }

    #[test]
    fn invalid_utf8_is_lossy_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"").unwrap();
        let mut reader = TailReader::new(&path, ReaderConfig::default());
        let _ = reader.attach().unwrap();
        append(&path, b"ok\n\xff\xfebad\nfine\n");
        let batch = reader.read_to(15).unwrap();
        assert_eq!(batch.records.len(), 3);
        assert!(!batch.records[0].lossy);
        assert!(batch.records[1].lossy);
        assert!(batch.records[1].text.ends_with("bad"));
        assert_eq!(batch.records[2].text, "fine");
    }

    #[test]
    fn rotate_resets_offset_and_partial_and_takes_a_seq() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"").unwrap();
        let mut reader = TailReader::new(&path, ReaderConfig::default());
        let attached = reader.attach().unwrap();
        append(&path, b"one\ntwo\npartial");
        let _ = reader.read_to(15).unwrap();
        assert_eq!(reader.pending_bytes(), 7);

        std::fs::write(&path, b"fresh\n").unwrap();
        let new = FileSnapshot::from_metadata(&std::fs::metadata(&path).unwrap());
        let event = reader.rotate(Some(attached.snapshot), new, RotationCause::Truncated);
        assert_eq!(reader.offset(), 0);
        assert_eq!(reader.pending_bytes(), 0);
        assert_eq!(event.seq, 2);
        assert_eq!(reader.next_seq(), 3);

        let batch = reader.read_to(new.size).unwrap();
        assert_eq!(texts(&batch.records), vec!["fresh"]);
        assert_eq!(batch.records[0].seq, 3);
    }
}
