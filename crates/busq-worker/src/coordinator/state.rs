use std::fmt::{Display, Formatter, Result as FmtResult};

/// Read/write mode of the inflight cache.
///
/// `open for write` means new record ids are pushed into the FIFO;
/// `open for read` means polls are served from the FIFO instead of the
/// storage ready query. Both are throughput hints only: the storage-level
/// claim is what guarantees single delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueMode {
    Both,
    WriteOnly,
    ReadOnly,
    Neither,
}

impl QueueMode {
    pub fn from_flags(open_for_write: bool, open_for_read: bool) -> Self {
        match (open_for_write, open_for_read) {
            (true, true) => QueueMode::Both,
            (true, false) => QueueMode::WriteOnly,
            (false, true) => QueueMode::ReadOnly,
            (false, false) => QueueMode::Neither,
        }
    }

    /// Mode after a startup prefetch of `found` ready rows.
    pub fn after_prefetch(found: usize, prefetch_entries: usize) -> Self {
        if found == 0 {
            QueueMode::Both
        } else if found < prefetch_entries {
            QueueMode::WriteOnly
        } else {
            QueueMode::Neither
        }
    }

    pub fn is_open_for_write(self) -> bool {
        matches!(self, QueueMode::Both | QueueMode::WriteOnly)
    }

    pub fn is_open_for_read(self) -> bool {
        matches!(self, QueueMode::Both | QueueMode::ReadOnly)
    }

    pub fn with_write(self, open: bool) -> Self {
        Self::from_flags(open, self.is_open_for_read())
    }

    pub fn with_read(self, open: bool) -> Self {
        Self::from_flags(self.is_open_for_write(), open)
    }
}

impl Display for QueueMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let s = match self {
            QueueMode::Both => "BOTH",
            QueueMode::WriteOnly => "WRITE_ONLY",
            QueueMode::ReadOnly => "READ_ONLY",
            QueueMode::Neither => "NEITHER",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_after_prefetch() {
        assert_eq!(QueueMode::after_prefetch(0, 10), QueueMode::Both);
        assert_eq!(QueueMode::after_prefetch(3, 10), QueueMode::WriteOnly);
        assert_eq!(QueueMode::after_prefetch(10, 10), QueueMode::Neither);
        assert_eq!(QueueMode::after_prefetch(11, 10), QueueMode::Neither);
    }

    #[test]
    fn test_flag_round_trip() {
        for mode in [
            QueueMode::Both,
            QueueMode::WriteOnly,
            QueueMode::ReadOnly,
            QueueMode::Neither,
        ] {
            assert_eq!(
                QueueMode::from_flags(mode.is_open_for_write(), mode.is_open_for_read()),
                mode
            );
        }
    }

    #[test]
    fn test_transitions_touch_one_flag() {
        assert_eq!(QueueMode::Both.with_write(false), QueueMode::ReadOnly);
        assert_eq!(QueueMode::ReadOnly.with_read(false), QueueMode::Neither);
        assert_eq!(QueueMode::Neither.with_write(true), QueueMode::WriteOnly);
        assert_eq!(QueueMode::WriteOnly.with_read(true), QueueMode::Both);
        assert_eq!(QueueMode::Both.with_read(true), QueueMode::Both);
    }

    #[test]
    fn test_display() {
        assert_eq!(QueueMode::WriteOnly.to_string(), "WRITE_ONLY");
        assert_eq!(QueueMode::Neither.to_string(), "NEITHER");
    }
}
