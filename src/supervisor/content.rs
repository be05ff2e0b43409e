/// Idempotent content synchronisation between child and host storage.
///
/// Every distinct content value is written at most once: re-delivery of
/// the last applied value is ignored, and host-originated content counts as
/// already persisted.
#[derive(Debug, Clone, Default)]
pub struct ContentSync {
    autosave: bool,
    applied: Option<String>,
    /// Applied but not yet written (autosave off).
    dirty: bool,
}

impl ContentSync {
    pub fn new(autosave: bool) -> Self {
        Self {
            autosave,
            applied: None,
            dirty: false,
        }
    }

    /// A `ContentChanged` from the child. Returns the value to persist now,
    /// if any.
    pub fn observe(&mut self, content: &str) -> Option<String> {
        if self.applied.as_deref() == Some(content) {
            return None;
        }
        self.applied = Some(content.to_string());
        if self.autosave {
            self.dirty = false;
            Some(content.to_string())
        } else {
            self.dirty = true;
            None
        }
    }

    /// A `SaveRequested` from the child.
    pub fn flush(&mut self) -> Option<String> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        self.applied.clone()
    }

    /// Content the host pushed itself; an echo from the child is not a
    /// change.
    pub fn host_applied(&mut self, content: &str) {
        self.applied = Some(content.to_string());
        self.dirty = false;
    }
}
