use serde::Serialize;

/// Read position of one assigned partition. Only the fetch loop owns and
/// mutates cursors; everyone else sees [`Position`] snapshots.
#[derive(Debug, Clone)]
pub struct PartitionCursor {
    fetch_offset: i64,
    consumed_offset: Option<i64>,
    auto_commit: bool,
}

impl PartitionCursor {
    /// `fetch_offset` must already be concrete (>= 0).
    pub fn new(fetch_offset: i64, auto_commit: bool) -> Self {
        debug_assert!(fetch_offset >= 0, "cursor created with symbolic offset");
        Self {
            fetch_offset,
            consumed_offset: None,
            auto_commit,
        }
    }

    pub fn fetch_offset(&self) -> i64 {
        self.fetch_offset
    }

    pub fn consumed_offset(&self) -> Option<i64> {
        self.consumed_offset
    }

    pub fn auto_commit(&self) -> bool {
        self.auto_commit
    }

    /// Move the next fetch elsewhere. Consumption history is left alone so a
    /// seek never implies a commit.
    pub fn seek_to(&mut self, offset: i64) {
        self.fetch_offset = offset;
    }

    /// Record delivery of `offset` to user code.
    pub fn advance(&mut self, offset: i64) {
        self.consumed_offset = Some(offset);
        self.fetch_offset = offset + 1;
    }

    /// Offset to commit so a restart resumes after the last delivered record.
    pub fn next_commit_offset(&self) -> Option<i64> {
        self.consumed_offset.map(|offset| offset + 1)
    }

    pub fn position(&self) -> Position {
        Position {
            fetch_offset: self.fetch_offset,
            consumed_offset: self.consumed_offset,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Position {
    pub fetch_offset: i64,
    pub consumed_offset: Option<i64>,
}
