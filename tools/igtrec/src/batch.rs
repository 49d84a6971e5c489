#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BatchSlot {
    /// Starts a new batch; its delay is computed against the live clock.
    First,
    /// Joins the current batch at `offset_secs` after the anchor.
    Member { offset_secs: f64 },
}

/// A batch is anchored on its first member: a record joins while
/// `igt - anchor <= window`, otherwise it anchors a new batch.
#[derive(Debug, Clone)]
pub struct BatchBuilder {
    window: f64,
    anchor: Option<f64>,
    len: usize,
}

impl BatchBuilder {
    pub fn new(window_secs: f64) -> Self {
        Self {
            window: window_secs,
            anchor: None,
            len: 0,
        }
    }

    pub fn admit(&mut self, igt: f64) -> BatchSlot {
        match self.anchor {
            Some(anchor) if igt - anchor <= self.window => {
                self.len += 1;
                BatchSlot::Member {
                    offset_secs: (igt - anchor).max(0.0),
                }
            }
            _ => {
                self.anchor = Some(igt);
                self.len = 1;
                BatchSlot::First
            }
        }
    }

    /// Members admitted to the current batch so far.
    pub fn current_len(&self) -> usize {
        self.len
    }

    pub fn reset(&mut self) {
        self.anchor = None;
        self.len = 0;
    }
}
