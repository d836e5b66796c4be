//! Staged write buffer.
//!
//! `MemBuffer` is an append log of `(key, flags, value)` entries with a
//! stack of staging checkpoints on top. A statement opens a frame, writes
//! into it, and either releases the frame (writes survive into the layer
//! below) or cleans it up (writes are truncated away). Frames nest only for
//! savepoints; the session keeps at most one statement-level frame open.

use std::fmt;

/// Marker into the staging stack. 1-based frame depth; `INVALID` (depth 0)
/// means "no staging open" and short-circuits every frame operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingHandle(usize);

impl StagingHandle {
    pub const INVALID: StagingHandle = StagingHandle(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for StagingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "staging:{}", self.0)
        } else {
            write!(f, "staging:invalid")
        }
    }
}

/// Per-key write flags carried alongside the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyFlags(u8);

impl KeyFlags {
    /// The write asserted the key did not exist (insert path); constraint
    /// checking is deferred to prewrite, so the key must be locked.
    pub const PRESUME_KEY_NOT_EXISTS: KeyFlags = KeyFlags(0b0000_0001);
    /// The executor explicitly requested a pessimistic lock on this key.
    pub const NEED_LOCKED: KeyFlags = KeyFlags(0b0000_0010);

    pub fn empty() -> KeyFlags {
        KeyFlags(0)
    }

    pub fn union(self, other: KeyFlags) -> KeyFlags {
        KeyFlags(self.0 | other.0)
    }

    pub fn has_presume_key_not_exists(self) -> bool {
        self.0 & Self::PRESUME_KEY_NOT_EXISTS.0 != 0
    }

    pub fn has_need_locked(self) -> bool {
        self.0 & Self::NEED_LOCKED.0 != 0
    }
}

/// Position marker for savepoint rollback (`truncate_to`). Unlike a
/// `StagingHandle` it does not participate in the frame stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCheckpoint(usize);

#[derive(Debug, Clone)]
struct Entry {
    key: Vec<u8>,
    flags: KeyFlags,
    value: Vec<u8>,
}

/// Flat write buffer with nested staging.
#[derive(Debug, Default)]
pub struct MemBuffer {
    entries: Vec<Entry>,
    /// Entry count at the moment each open frame was pushed.
    frames: Vec<usize>,
    /// Total key+value bytes over live entries.
    bytes: usize,
}

impl MemBuffer {
    pub fn new() -> MemBuffer {
        MemBuffer::default()
    }

    /// Logical number of buffered writes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total key+value bytes buffered.
    pub fn size(&self) -> usize {
        self.bytes
    }

    /// Push a staging frame and return its handle.
    pub fn staging(&mut self) -> StagingHandle {
        self.frames.push(self.entries.len());
        StagingHandle(self.frames.len())
    }

    /// Promote frame `h`'s writes into the layer below. Only the top frame
    /// may be released.
    pub fn release(&mut self, h: StagingHandle) {
        if !self.is_top(h) {
            return;
        }
        self.frames.pop();
    }

    /// Discard frame `h`'s writes, truncating the buffer back to where the
    /// frame was opened. Only the top frame may be cleaned up.
    pub fn cleanup(&mut self, h: StagingHandle) {
        if !self.is_top(h) {
            return;
        }
        let mark = self.frames.pop().unwrap_or(0);
        self.truncate_entries(mark);
    }

    /// Visit every `(key, flags, value)` written since frame `h` opened, in
    /// write order.
    pub fn inspect_stage<F>(&self, h: StagingHandle, mut visit: F)
    where
        F: FnMut(&[u8], KeyFlags, &[u8]),
    {
        if !h.is_valid() || h.0 > self.frames.len() {
            return;
        }
        let start = self.frames[h.0 - 1];
        for e in &self.entries[start..] {
            visit(&e.key, e.flags, &e.value);
        }
    }

    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.set_with_flags(key, value, KeyFlags::empty());
    }

    pub fn set_with_flags(&mut self, key: Vec<u8>, value: Vec<u8>, flags: KeyFlags) {
        self.bytes += key.len() + value.len();
        self.entries.push(Entry { key, flags, value });
    }

    /// Buffer a delete: an entry with an empty value.
    pub fn delete(&mut self, key: Vec<u8>) {
        self.set(key, Vec::new());
    }

    pub fn delete_with_flags(&mut self, key: Vec<u8>, flags: KeyFlags) {
        self.set_with_flags(key, Vec::new(), flags);
    }

    /// Latest buffered value for `key`, if any. An empty slice means the
    /// key was deleted in this buffer.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.key == key)
            .map(|e| e.value.as_slice())
    }

    /// True when any live entry's key starts with `prefix`.
    pub fn has_prefix(&self, prefix: &[u8]) -> bool {
        self.entries.iter().any(|e| e.key.starts_with(prefix))
    }

    /// Position marker for savepoint rollback.
    pub fn checkpoint(&self) -> BufferCheckpoint {
        BufferCheckpoint(self.entries.len())
    }

    /// Truncate the buffer back to a previously taken checkpoint. All open
    /// frames above the checkpoint collapse onto it.
    pub fn truncate_to(&mut self, cp: BufferCheckpoint) {
        self.truncate_entries(cp.0);
        for mark in self.frames.iter_mut() {
            if *mark > cp.0 {
                *mark = cp.0;
            }
        }
    }

    fn is_top(&self, h: StagingHandle) -> bool {
        // A stale handle (frame already released) is a silent no-op; a
        // handle beneath still-open frames is an ordering bug.
        if !h.is_valid() || h.0 > self.frames.len() {
            return false;
        }
        debug_assert!(
            h.0 == self.frames.len(),
            "frame {} released beneath open frames (top is {})",
            h,
            self.frames.len()
        );
        h.0 == self.frames.len()
    }

    fn truncate_entries(&mut self, keep: usize) {
        for e in &self.entries[keep.min(self.entries.len())..] {
            self.bytes -= e.key.len() + e.value.len();
        }
        self.entries.truncate(keep);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_buffer() {
        let buf = MemBuffer::new();
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.size(), 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_staging_release_keeps_writes() {
        let mut buf = MemBuffer::new();
        buf.set(b"a".to_vec(), b"1".to_vec());
        let h = buf.staging();
        buf.set(b"b".to_vec(), b"2".to_vec());
        buf.release(h);
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.get(b"b"), Some(b"2".as_slice()));
    }

    #[test]
    fn test_staging_cleanup_discards_writes() {
        let mut buf = MemBuffer::new();
        buf.set(b"a".to_vec(), b"1".to_vec());
        let h = buf.staging();
        buf.set(b"b".to_vec(), b"2".to_vec());
        buf.cleanup(h);
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.get(b"b"), None);
        assert_eq!(buf.size(), 2);
    }

    #[test]
    fn test_invalid_handle_short_circuits() {
        let mut buf = MemBuffer::new();
        buf.set(b"a".to_vec(), b"1".to_vec());
        buf.release(StagingHandle::INVALID);
        buf.cleanup(StagingHandle::INVALID);
        let mut visited = 0;
        buf.inspect_stage(StagingHandle::INVALID, |_, _, _| visited += 1);
        assert_eq!(visited, 0);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_nested_frames_for_savepoints() {
        let mut buf = MemBuffer::new();
        let stmt = buf.staging();
        buf.set(b"a".to_vec(), b"1".to_vec());
        let sp = buf.staging();
        buf.set(b"b".to_vec(), b"2".to_vec());
        buf.cleanup(sp);
        assert_eq!(buf.len(), 1);
        buf.release(stmt);
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.get(b"a"), Some(b"1".as_slice()));
    }

    #[test]
    fn test_inspect_stage_in_write_order() {
        let mut buf = MemBuffer::new();
        buf.set(b"before".to_vec(), b"x".to_vec());
        let h = buf.staging();
        buf.set_with_flags(
            b"k1".to_vec(),
            b"v1".to_vec(),
            KeyFlags::PRESUME_KEY_NOT_EXISTS,
        );
        buf.delete(b"k2".to_vec());
        let mut seen = Vec::new();
        buf.inspect_stage(h, |k, flags, v| {
            seen.push((k.to_vec(), flags, v.to_vec()));
        });
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, b"k1");
        assert!(seen[0].1.has_presume_key_not_exists());
        assert_eq!(seen[1].0, b"k2");
        assert!(seen[1].2.is_empty());
    }

    #[test]
    fn test_get_returns_latest_write() {
        let mut buf = MemBuffer::new();
        buf.set(b"k".to_vec(), b"v1".to_vec());
        buf.set(b"k".to_vec(), b"v2".to_vec());
        assert_eq!(buf.get(b"k"), Some(b"v2".as_slice()));
    }

    #[test]
    fn test_truncate_to_checkpoint_collapses_frames() {
        let mut buf = MemBuffer::new();
        let cp = buf.checkpoint();
        let h = buf.staging();
        buf.set(b"a".to_vec(), b"1".to_vec());
        buf.truncate_to(cp);
        assert_eq!(buf.len(), 0);
        // Frame is still open but now anchored at the checkpoint.
        buf.set(b"b".to_vec(), b"2".to_vec());
        buf.cleanup(h);
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_size_tracks_bytes() {
        let mut buf = MemBuffer::new();
        buf.set(b"key".to_vec(), b"value".to_vec());
        assert_eq!(buf.size(), 8);
        let h = buf.staging();
        buf.set(b"k2".to_vec(), b"v2".to_vec());
        assert_eq!(buf.size(), 12);
        buf.cleanup(h);
        assert_eq!(buf.size(), 8);
    }

    #[test]
    fn test_has_prefix() {
        let mut buf = MemBuffer::new();
        buf.set(b"t1_r1".to_vec(), b"row".to_vec());
        assert!(buf.has_prefix(b"t1"));
        assert!(!buf.has_prefix(b"t2"));
    }
}
