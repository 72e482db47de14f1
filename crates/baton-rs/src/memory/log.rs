//! An ordered turn log.

use super::turn::Turn;

/// Turns kept sorted by sequence number after every mutation.
#[derive(Debug, Clone, Default)]
pub struct ConversationLog {
    turns: Vec<Turn>,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one turn at its sorted position.
    pub fn push(&mut self, turn: Turn) {
        let idx = self.turns.partition_point(|t| t.seq() <= turn.seq());
        self.turns.insert(idx, turn);
    }

    /// Append a batch and restore ordering.
    pub fn extend(&mut self, turns: impl IntoIterator<Item = Turn>) {
        self.turns.extend(turns);
        self.turns.sort_by_key(Turn::seq);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// Apply `f` to every turn matching `pred`. Returns how many matched.
    pub fn update_where<F>(&mut self, mut pred: impl FnMut(&Turn) -> bool, mut f: F) -> usize
    where
        F: FnMut(&mut Turn),
    {
        let mut touched = 0;
        for turn in self.turns.iter_mut().filter(|t| pred(t)) {
            f(turn);
            touched += 1;
        }
        touched
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::turn::Turn;

    #[test]
    fn out_of_order_appends_read_back_sorted() {
        let t1 = Turn::human("one");
        let t2 = Turn::ai("two");
        let t3 = Turn::human("three");
        let mut log = ConversationLog::new();
        log.extend([t3.clone(), t1.clone()]);
        log.push(t2.clone());
        let seqs: Vec<u64> = log.turns().iter().map(Turn::seq).collect();
        assert_eq!(seqs, vec![t1.seq(), t2.seq(), t3.seq()]);
    }

    #[test]
    fn update_where_counts_matches() {
        let a = Turn::human("a");
        let b = Turn::ai("b");
        let target = b.seq();
        let mut log = ConversationLog::new();
        log.extend([a, b]);
        let n = log.update_where(|t| t.seq() == target, |t| t.flags.cache_breakpoint = true);
        assert_eq!(n, 1);
        assert!(log.last().is_some_and(|t| t.flags.cache_breakpoint));
    }
}
