use crate::queue::{io_err, QueueStorage, StorageError};
use chrono::Utc;
use crc32c::crc32c;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const SEGMENT_MAGIC: &[u8; 8] = b"SFSPOOL1";
const SEGMENT_VERSION: u32 = 1;
const SEGMENT_HEADER_LEN: u64 = 64;
const FRAME_HEADER_LEN: u64 = 8;
const SEQ_LEN: usize = 8;
const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SpoolStateDisk {
    stream_id: String,
    acked_seq: u64,
    open_segment_start_seq: Option<u64>,
}

struct SegmentWriter {
    path: PathBuf,
    file: fs::File,
    start_seq: u64,
    len: u64,
}

#[derive(Debug, Clone)]
struct ClosedSegment {
    path: PathBuf,
    start_seq: u64,
    end_seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReadPosition {
    segment_start: u64,
    offset: u64,
}

#[derive(Debug, Clone)]
struct HeadEntry {
    seq: u64,
    payload: Vec<u8>,
    next: ReadPosition,
}

enum FrameRead {
    Frame {
        seq: u64,
        payload: Vec<u8>,
        next_offset: u64,
    },
    End,
    Corrupt,
}

/// Append-only segment spool.
///
/// Entries are CRC-framed and numbered with a per-stream sequence. `acked_seq` in `state.json`
/// marks everything at or below it as delivered; closed segments wholly below it are removed.
pub struct SegmentSpool {
    dir: PathBuf,
    state_path: PathBuf,
    stream_id: Uuid,
    next_seq: u64,
    acked_seq: u64,
    segment_roll_bytes: u64,
    closed: VecDeque<ClosedSegment>,
    writer: SegmentWriter,
    cursor: Option<ReadPosition>,
    head: Option<HeadEntry>,
}

impl SegmentSpool {
    pub fn open(dir: impl Into<PathBuf>, segment_roll_bytes: u64) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(io_err(format!("create {}", dir.display())))?;

        let state_path = dir.join("state.json");
        let (stream_id, acked_seq, open_start_seq) = load_or_init_state(&state_path)?;

        let closed = list_closed_segments(&dir, stream_id)?;
        let mut next_seq = acked_seq.saturating_add(1);
        if let Some(last) = closed.back() {
            next_seq = next_seq.max(last.end_seq.saturating_add(1));
        }

        let (writer, last_seq) = open_or_create_segment(&dir, stream_id, open_start_seq, next_seq)?;
        next_seq = next_seq.max(writer.start_seq);
        if let Some(last_seq) = last_seq {
            next_seq = next_seq.max(last_seq.saturating_add(1));
        }

        let mut spool = Self {
            dir,
            state_path,
            stream_id,
            next_seq,
            acked_seq,
            segment_roll_bytes: segment_roll_bytes.max(1),
            closed,
            writer,
            cursor: None,
            head: None,
        };
        spool.delete_acked_segments();
        spool.persist_state()?;

        tracing::info!(
            dir = %spool.dir.display(),
            stream_id = %spool.stream_id,
            acked_seq = spool.acked_seq,
            next_seq = spool.next_seq,
            pending = spool.pending(),
            "spool opened"
        );
        Ok(spool)
    }

    fn persist_state(&self) -> Result<(), StorageError> {
        let tmp = self.state_path.with_extension("json.tmp");
        let disk = SpoolStateDisk {
            stream_id: self.stream_id.to_string(),
            acked_seq: self.acked_seq,
            open_segment_start_seq: Some(self.writer.start_seq),
        };
        fs::write(&tmp, serde_json::to_string_pretty(&disk)?)
            .map_err(io_err("write spool state tmp"))?;
        fs::rename(&tmp, &self.state_path).map_err(io_err("rename spool state"))?;
        Ok(())
    }

    fn roll_segment(&mut self) -> Result<(), StorageError> {
        let start_seq = self.writer.start_seq;
        let end_seq = self.next_seq.saturating_sub(1);
        let closed_path = segment_closed_path(&self.dir, self.stream_id, start_seq, end_seq);
        fs::rename(&self.writer.path, &closed_path).map_err(io_err(format!(
            "rename {} -> {}",
            self.writer.path.display(),
            closed_path.display()
        )))?;
        self.closed.push_back(ClosedSegment {
            path: closed_path,
            start_seq,
            end_seq,
        });

        self.writer = create_new_segment(&self.dir, self.stream_id, self.next_seq)?;
        self.persist_state()?;
        tracing::debug!(start_seq, end_seq, "rolled spool segment");
        Ok(())
    }

    fn delete_acked_segments(&mut self) {
        while let Some(seg) = self.closed.front() {
            if seg.end_seq > self.acked_seq {
                break;
            }
            if let Err(err) = fs::remove_file(&seg.path) {
                tracing::warn!(error=%err, path=%seg.path.display(), "failed to remove delivered segment");
            }
            self.closed.pop_front();
        }
    }

    fn segment_path(&self, start_seq: u64) -> Option<&Path> {
        if self.writer.start_seq == start_seq {
            return Some(&self.writer.path);
        }
        self.closed
            .iter()
            .find(|seg| seg.start_seq == start_seq)
            .map(|seg| seg.path.as_path())
    }

    fn position_after(&self, start_seq: u64) -> ReadPosition {
        let segment_start = self
            .closed
            .iter()
            .map(|seg| seg.start_seq)
            .find(|start| *start > start_seq)
            .unwrap_or(self.writer.start_seq);
        ReadPosition {
            segment_start,
            offset: SEGMENT_HEADER_LEN,
        }
    }

    fn first_position(&self) -> ReadPosition {
        ReadPosition {
            segment_start: self
                .closed
                .front()
                .map(|seg| seg.start_seq)
                .unwrap_or(self.writer.start_seq),
            offset: SEGMENT_HEADER_LEN,
        }
    }
}

impl QueueStorage for SegmentSpool {
    fn append(&mut self, blob: &[u8]) -> Result<(), StorageError> {
        let record_len = SEQ_LEN + blob.len();
        if record_len > MAX_FRAME_LEN {
            return Err(StorageError::TooLarge {
                len: blob.len(),
                max: MAX_FRAME_LEN - SEQ_LEN,
            });
        }

        let seq = self.next_seq;
        let mut record = Vec::with_capacity(record_len);
        record.extend_from_slice(&seq.to_le_bytes());
        record.extend_from_slice(blob);

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN as usize + record_len);
        frame.extend_from_slice(&(record_len as u32).to_le_bytes());
        frame.extend_from_slice(&crc32c(&record).to_le_bytes());
        frame.extend_from_slice(&record);

        let prev_len = self.writer.len;
        let written = self
            .writer
            .file
            .write_all(&frame)
            .and_then(|()| self.writer.file.sync_data());
        if let Err(source) = written {
            // Leave no torn frame behind for the reader.
            let _ = self.writer.file.set_len(prev_len);
            let _ = self.writer.file.seek(SeekFrom::End(0));
            return Err(StorageError::Io {
                context: format!("append to {}", self.writer.path.display()),
                source,
            });
        }

        self.writer.len = prev_len.saturating_add(frame.len() as u64);
        self.next_seq = seq.saturating_add(1);
        tracing::trace!(seq, bytes = blob.len(), "spooled entry");

        if self.writer.len >= self.segment_roll_bytes {
            self.roll_segment()?;
        }
        Ok(())
    }

    fn read_oldest(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
        if let Some(head) = &self.head {
            return Ok(Some(head.payload.clone()));
        }

        let mut pos = self.cursor.unwrap_or_else(|| self.first_position());
        loop {
            let Some(path) = self.segment_path(pos.segment_start) else {
                // Reclaimed segment; continue with the next one on disk.
                pos = self.position_after(pos.segment_start);
                continue;
            };

            match read_frame_at(path, pos.offset)? {
                FrameRead::Frame {
                    seq,
                    payload,
                    next_offset,
                } => {
                    let next = ReadPosition {
                        segment_start: pos.segment_start,
                        offset: next_offset,
                    };
                    if seq <= self.acked_seq {
                        pos = next;
                        continue;
                    }
                    self.cursor = Some(pos);
                    self.head = Some(HeadEntry {
                        seq,
                        payload: payload.clone(),
                        next,
                    });
                    return Ok(Some(payload));
                }
                FrameRead::End | FrameRead::Corrupt if pos.segment_start == self.writer.start_seq => {
                    self.cursor = Some(pos);
                    return Ok(None);
                }
                FrameRead::End => {
                    pos = self.position_after(pos.segment_start);
                }
                FrameRead::Corrupt => {
                    tracing::warn!(
                        segment_start = pos.segment_start,
                        offset = pos.offset,
                        "corrupt frame in closed segment; skipping rest of segment"
                    );
                    pos = self.position_after(pos.segment_start);
                }
            }
        }
    }

    fn delete_oldest(&mut self) -> Result<(), StorageError> {
        if self.head.is_none() && self.read_oldest()?.is_none() {
            return Ok(());
        }
        let Some(head) = self.head.take() else {
            return Ok(());
        };
        self.acked_seq = head.seq;
        self.cursor = Some(head.next);
        self.persist_state()?;
        self.delete_acked_segments();
        Ok(())
    }

    fn pending(&self) -> u64 {
        self.next_seq
            .saturating_sub(self.acked_seq.saturating_add(1))
    }
}

fn load_or_init_state(state_path: &Path) -> Result<(Uuid, u64, Option<u64>), StorageError> {
    if state_path.exists() {
        let raw = fs::read_to_string(state_path).map_err(io_err("read spool state"))?;
        let parsed: SpoolStateDisk = serde_json::from_str(&raw)?;
        let stream_id = Uuid::parse_str(parsed.stream_id.trim())
            .map_err(|err| StorageError::InvalidState(format!("stream_id: {err}")))?;
        return Ok((stream_id, parsed.acked_seq, parsed.open_segment_start_seq));
    }
    Ok((Uuid::new_v4(), 0, None))
}

fn open_or_create_segment(
    dir: &Path,
    stream_id: Uuid,
    open_start_seq: Option<u64>,
    next_seq: u64,
) -> Result<(SegmentWriter, Option<u64>), StorageError> {
    let preferred = open_start_seq
        .map(|start| segment_open_path(dir, stream_id, start))
        .filter(|path| path.exists());
    let existing = match preferred {
        Some(path) => Some(path),
        None => find_any_open_segment(dir, stream_id)?,
    };

    if let Some(path) = existing {
        let start_seq = parse_open_start_seq(&path).unwrap_or(next_seq);
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(io_err(format!("open {}", path.display())))?;
        let (len, last_seq) = recover_truncate_tail(&mut file)
            .map_err(io_err(format!("recover {}", path.display())))?;
        return Ok((
            SegmentWriter {
                path,
                file,
                start_seq,
                len,
            },
            last_seq,
        ));
    }

    Ok((create_new_segment(dir, stream_id, next_seq)?, None))
}

fn segment_open_path(dir: &Path, stream_id: Uuid, start_seq: u64) -> PathBuf {
    dir.join(format!("seg-{}-{}.open", stream_id, start_seq))
}

fn segment_closed_path(dir: &Path, stream_id: Uuid, start_seq: u64, end_seq: u64) -> PathBuf {
    dir.join(format!("seg-{}-{}-{}.seg", stream_id, start_seq, end_seq))
}

fn find_any_open_segment(dir: &Path, stream_id: Uuid) -> Result<Option<PathBuf>, StorageError> {
    let prefix = format!("seg-{}-", stream_id);
    let mut found: Vec<(u64, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err("read spool dir"))? {
        let path = entry.map_err(io_err("read spool dir entry"))?.path();
        let Some(name) = path.file_name().and_then(|v| v.to_str()) else {
            continue;
        };
        if name.starts_with(&prefix) && name.ends_with(".open") {
            if let Some(start) = parse_open_start_seq(&path) {
                found.push((start, path));
            }
        }
    }
    found.sort_by_key(|(start, _)| *start);
    Ok(found.pop().map(|(_, path)| path))
}

fn list_closed_segments(dir: &Path, stream_id: Uuid) -> Result<VecDeque<ClosedSegment>, StorageError> {
    let prefix = format!("seg-{}-", stream_id);
    let mut out = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err("read spool dir"))? {
        let path = entry.map_err(io_err("read spool dir entry"))?.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|v| v.to_str()) else {
            continue;
        };
        if !name.starts_with(&prefix) || !name.ends_with(".seg") {
            continue;
        }
        let Some((start_seq, end_seq)) = parse_closed_segment_range(name) else {
            continue;
        };
        out.push(ClosedSegment {
            path,
            start_seq,
            end_seq,
        });
    }
    out.sort_by_key(|seg| seg.start_seq);
    Ok(out.into())
}

fn parse_open_start_seq(path: &Path) -> Option<u64> {
    // seg-<uuid>-<start>.open
    let name = path.file_name()?.to_str()?;
    let trimmed = name.strip_suffix(".open")?;
    trimmed.rsplit('-').next()?.parse().ok()
}

fn parse_closed_segment_range(name: &str) -> Option<(u64, u64)> {
    // seg-<uuid>-<start>-<end>.seg
    let trimmed = name.strip_suffix(".seg")?;
    let mut parts = trimmed.rsplit('-');
    let end = parts.next()?.parse().ok()?;
    let start = parts.next()?.parse().ok()?;
    Some((start, end))
}

fn create_new_segment(dir: &Path, stream_id: Uuid, start_seq: u64) -> Result<SegmentWriter, StorageError> {
    let path = segment_open_path(dir, stream_id, start_seq);
    let mut file = fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(&path)
        .map_err(io_err(format!("create {}", path.display())))?;
    write_segment_header(&mut file, stream_id, start_seq)
        .and_then(|()| file.sync_data())
        .map_err(io_err(format!("write header {}", path.display())))?;
    Ok(SegmentWriter {
        path,
        file,
        start_seq,
        len: SEGMENT_HEADER_LEN,
    })
}

fn write_segment_header(file: &mut fs::File, stream_id: Uuid, start_seq: u64) -> io::Result<()> {
    let created_wall_ms = Utc::now().timestamp_millis();
    let mut header = vec![0u8; SEGMENT_HEADER_LEN as usize];
    header[0..8].copy_from_slice(SEGMENT_MAGIC);
    header[8..12].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
    header[12..16].copy_from_slice(&(SEGMENT_HEADER_LEN as u32).to_le_bytes());
    header[16..32].copy_from_slice(stream_id.as_bytes());
    header[32..40].copy_from_slice(&created_wall_ms.to_le_bytes());
    header[40..48].copy_from_slice(&start_seq.to_le_bytes());
    file.write_all(&header)
}

/// Truncates the segment after its last valid frame. Returns the new length and the sequence
/// number of that frame.
fn recover_truncate_tail(file: &mut fs::File) -> io::Result<(u64, Option<u64>)> {
    let end = file.metadata()?.len();
    if end < SEGMENT_HEADER_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "segment too small"));
    }
    file.seek(SeekFrom::Start(SEGMENT_HEADER_LEN))?;
    let mut pos = SEGMENT_HEADER_LEN;
    let mut last_seq = None;
    loop {
        match read_next_frame(file)? {
            FrameRead::Frame { seq, payload, .. } => {
                pos = pos.saturating_add(FRAME_HEADER_LEN + (SEQ_LEN + payload.len()) as u64);
                last_seq = Some(seq);
            }
            FrameRead::End | FrameRead::Corrupt => break,
        }
    }
    if pos < end {
        tracing::warn!(valid = pos, found = end, "truncating torn spool tail");
    }
    file.set_len(pos)?;
    file.seek(SeekFrom::End(0))?;
    Ok((pos, last_seq))
}

fn read_frame_at(path: &Path, offset: u64) -> Result<FrameRead, StorageError> {
    let mut file = fs::File::open(path).map_err(io_err(format!("open {}", path.display())))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(io_err(format!("seek {}", path.display())))?;
    let frame = read_next_frame(&mut file).map_err(io_err(format!("read {}", path.display())))?;
    Ok(match frame {
        FrameRead::Frame { seq, payload, .. } => {
            let next_offset = offset + FRAME_HEADER_LEN + (SEQ_LEN + payload.len()) as u64;
            FrameRead::Frame {
                seq,
                payload,
                next_offset,
            }
        }
        other => other,
    })
}

fn read_next_frame(file: &mut fs::File) -> io::Result<FrameRead> {
    let mut header = [0u8; FRAME_HEADER_LEN as usize];
    match file.read_exact(&mut header) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(FrameRead::End),
        Err(err) => return Err(err),
    }

    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if len < SEQ_LEN || len > MAX_FRAME_LEN {
        return Ok(FrameRead::Corrupt);
    }

    let mut record = vec![0u8; len];
    match file.read_exact(&mut record) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(FrameRead::End),
        Err(err) => return Err(err),
    }

    if crc32c(&record) != crc {
        return Ok(FrameRead::Corrupt);
    }

    let mut seq_bytes = [0u8; SEQ_LEN];
    seq_bytes.copy_from_slice(&record[..SEQ_LEN]);
    let seq = u64::from_le_bytes(seq_bytes);
    record.drain(..SEQ_LEN);
    Ok(FrameRead::Frame {
        seq,
        payload: record,
        next_offset: 0,
    })
}

/// Free bytes on the filesystem holding the spool.
pub fn free_bytes(dir: &Path) -> io::Result<u64> {
    use std::ffi::CString;
    let cpath = CString::new(dir.as_os_str().to_string_lossy().as_bytes().to_vec())
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

    let mut out: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut out as *mut libc::statvfs) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    let block = if out.f_frsize > 0 {
        out.f_frsize as u64
    } else {
        out.f_bsize as u64
    };
    // f_bavail: blocks available to the unprivileged service user.
    Ok((out.f_bavail as u64).saturating_mul(block))
}
