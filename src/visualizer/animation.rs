//! Per-key fade animation records.

use std::collections::HashMap;

use crate::scheduler::TaskHandle;

/// Fade state of one lit key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyAnimation {
    pub note: i32,
    pub press_start: f64,
    pub fade_start: Option<f64>,
    /// Completion task armed when the fade began.
    pub pending: Option<TaskHandle>,
}

impl KeyAnimation {
    pub fn is_fading(&self) -> bool {
        self.fade_start.is_some()
    }

    /// Elapsed fraction of the fade, `None` while the key is held.
    pub fn fade_progress(&self, now_ms: f64, fade_ms: f64) -> Option<f64> {
        let start = self.fade_start?;
        if fade_ms <= 0.0 {
            return Some(1.0);
        }
        Some(((now_ms - start) / fade_ms).max(0.0))
    }
}

/// Result of [`AnimationTable::begin_fade`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadeStart {
    Started,
    AlreadyFading,
    Missing,
}

/// At most one [`KeyAnimation`] per note.
#[derive(Debug, Default)]
pub struct AnimationTable {
    entries: HashMap<i32, KeyAnimation>,
}

impl AnimationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fresh record, returning the one it supersedes.
    pub fn press(&mut self, note: i32, now_ms: f64) -> Option<KeyAnimation> {
        self.entries.insert(
            note,
            KeyAnimation {
                note,
                press_start: now_ms,
                fade_start: None,
                pending: None,
            },
        )
    }

    pub fn begin_fade(&mut self, note: i32, now_ms: f64) -> FadeStart {
        match self.entries.get_mut(&note) {
            None => FadeStart::Missing,
            Some(entry) if entry.is_fading() => FadeStart::AlreadyFading,
            Some(entry) => {
                entry.fade_start = Some(now_ms);
                FadeStart::Started
            }
        }
    }

    pub fn attach_completion(&mut self, note: i32, handle: TaskHandle) {
        if let Some(entry) = self.entries.get_mut(&note) {
            entry.pending = Some(handle);
        }
    }

    /// Remove a fading record.
    ///
    /// With `Some(handle)` the record is removed only if that handle is its
    /// current completion, so a superseded or repeated completion is a no-op.
    pub fn complete(&mut self, note: i32, handle: Option<TaskHandle>) -> Option<KeyAnimation> {
        let entry = self.entries.get(&note)?;
        if !entry.is_fading() {
            return None;
        }
        if handle.is_some() && entry.pending != handle {
            return None;
        }
        self.entries.remove(&note)
    }

    /// Notes whose fade has fully elapsed.
    pub fn expired(&self, now_ms: f64, fade_ms: f64) -> Vec<i32> {
        let mut notes: Vec<i32> = self
            .entries
            .values()
            .filter(|entry| {
                entry
                    .fade_progress(now_ms, fade_ms)
                    .is_some_and(|progress| progress >= 1.0)
            })
            .map(|entry| entry.note)
            .collect();
        notes.sort_unstable();
        notes
    }

    pub fn drain(&mut self) -> Vec<KeyAnimation> {
        self.entries.drain().map(|(_, entry)| entry).collect()
    }

    pub fn get(&self, note: i32) -> Option<&KeyAnimation> {
        self.entries.get(&note)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
