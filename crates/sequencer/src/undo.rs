use std::time::Duration;

use board_protocol::Placement;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UndoEntry {
    pub placement: Placement,
    /// Unix seconds; the entry is undoable strictly before this instant.
    pub deadline: u64,
}

impl UndoEntry {
    pub fn is_live(&self, now: Duration) -> bool {
        now < Duration::from_secs(self.deadline)
    }
}

/// Pending undo entries ordered by deadline.
#[derive(Debug, Default)]
pub struct UndoList {
    entries: Vec<UndoEntry>,
}

impl UndoList {
    pub fn push(&mut self, entry: UndoEntry) {
        let index = self
            .entries
            .partition_point(|existing| existing.deadline <= entry.deadline);
        self.entries.insert(index, entry);
    }

    /// Entries still undoable at `now`, whether or not they were pruned yet.
    pub fn entries_at(&self, now: Duration) -> Vec<UndoEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.is_live(now))
            .copied()
            .collect()
    }

    /// Drops expired entries and returns how many were dropped.
    pub fn prune(&mut self, now: Duration) -> usize {
        let expired = self.entries.partition_point(|entry| !entry.is_live(now));
        self.entries.drain(..expired);
        expired
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        self.entries
            .first()
            .map(|entry| Duration::from_secs(entry.deadline))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(position: u64, deadline: u64) -> UndoEntry {
        UndoEntry {
            placement: Placement {
                position,
                color: 1,
                modified: 0,
            },
            deadline,
        }
    }

    #[test]
    fn entry_is_listed_before_its_deadline_only() {
        let mut list = UndoList::default();
        list.push(entry(1, 100));

        assert_eq!(list.entries_at(Duration::from_secs(99)).len(), 1);
        assert_eq!(
            list.entries_at(Duration::from_millis(99_999)),
            vec![entry(1, 100)]
        );
        assert!(list.entries_at(Duration::from_secs(100)).is_empty());
        assert!(list.entries_at(Duration::from_secs(101)).is_empty());
    }

    #[test]
    fn prune_drops_expired_entries_in_deadline_order() {
        let mut list = UndoList::default();
        list.push(entry(3, 300));
        list.push(entry(1, 100));
        list.push(entry(2, 200));
        assert_eq!(list.next_deadline(), Some(Duration::from_secs(100)));

        assert_eq!(list.prune(Duration::from_secs(200)), 2);
        assert_eq!(list.len(), 1);
        assert_eq!(list.next_deadline(), Some(Duration::from_secs(300)));
        assert_eq!(list.prune(Duration::from_secs(299)), 0);
        assert_eq!(list.prune(Duration::from_secs(300)), 1);
        assert!(list.is_empty());
        assert_eq!(list.next_deadline(), None);
    }
}
