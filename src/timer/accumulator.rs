use tokio::time::Instant;

/// Wall-clock time spent across the run segments of one session.
///
/// Closed segments are banked as milliseconds; at most one segment is open
/// at a time and is measured from its start instant on demand.
#[derive(Debug, Clone, Copy, Default)]
pub struct ElapsedAccumulator {
    banked_ms: u64,
    segment_start: Option<Instant>,
}

impl ElapsedAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_segment_open(&self) -> bool {
        self.segment_start.is_some()
    }

    /// Returns false if a segment was already open.
    pub fn open_segment(&mut self, now: Instant) -> bool {
        if self.segment_start.is_some() {
            return false;
        }
        self.segment_start = Some(now);
        true
    }

    /// Folds the open segment into the banked total and returns its length.
    pub fn close_segment(&mut self, now: Instant) -> u64 {
        let Some(start) = self.segment_start.take() else {
            return 0;
        };
        let segment_ms = now.saturating_duration_since(start).as_millis() as u64;
        self.banked_ms = self.banked_ms.saturating_add(segment_ms);
        segment_ms
    }

    pub fn elapsed_ms(&self, now: Instant) -> u64 {
        match self.segment_start {
            Some(start) => self
                .banked_ms
                .saturating_add(now.saturating_duration_since(start).as_millis() as u64),
            None => self.banked_ms,
        }
    }

    pub fn reset_to(&mut self, banked_ms: u64) {
        self.banked_ms = banked_ms;
        self.segment_start = None;
    }

    pub fn reset(&mut self) {
        self.reset_to(0);
    }
}
