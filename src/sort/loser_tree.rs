use std::cmp::Ordering;
use std::mem;

use crate::record::RecordComparator;

/// Head of one merge input as seen by the tournament.
#[derive(Clone, Debug)]
enum Head<T> {
    /// Smaller than everything; only present while the tree is being built.
    EarlyFence,
    Value(T),
    /// Larger than everything; marks an exhausted input.
    LateFence,
}

#[derive(Clone, Debug)]
struct Node<T> {
    key: Head<T>,
    index: usize,
}

/// Tree of losers over `k` inputs ordered by a [`RecordComparator`].
///
/// Equal heads are won by the lower input index, so inputs listed in creation
/// order merge stably.
pub struct LoserTree<T> {
    // Index 0 holds the overall winner, 1..capacity hold match losers.
    // Leaves are conceptual, at capacity..2*capacity.
    nodes: Vec<Node<T>>,
    capacity: usize,
}

impl<T> LoserTree<T> {
    /// Build from the first head of every input; `None` marks an empty input.
    pub fn new(heads: Vec<Option<T>>, comparator: &dyn RecordComparator<T>) -> Self {
        let size = heads.len();
        if size == 0 {
            return Self {
                nodes: vec![],
                capacity: 0,
            };
        }

        let capacity = size.next_power_of_two();
        let nodes = (0..capacity)
            .map(|_| Node {
                key: Head::EarlyFence,
                index: usize::MAX,
            })
            .collect();
        let mut tree = Self { nodes, capacity };

        for (i, head) in heads.into_iter().enumerate() {
            let key = head.map_or(Head::LateFence, Head::Value);
            tree.pass(i, key, comparator);
        }
        for i in size..capacity {
            tree.pass(i, Head::LateFence, comparator);
        }
        tree
    }

    /// Current winner and the input it came from.
    pub fn peek(&self) -> Option<(&T, usize)> {
        match self.nodes.first() {
            Some(Node {
                key: Head::Value(value),
                index,
            }) => Some((value, *index)),
            _ => None,
        }
    }

    /// Replace the winner with the next head of its input (`None` once that
    /// input is exhausted) and return the old winner.
    pub fn push(&mut self, next: Option<T>, comparator: &dyn RecordComparator<T>) -> Option<T> {
        let winner = self.nodes.first()?.index;
        if winner == usize::MAX {
            return None;
        }
        let key = next.map_or(Head::LateFence, Head::Value);
        match self.pass(winner, key, comparator).key {
            Head::Value(value) => Some(value),
            _ => None,
        }
    }

    /// Replay the matches from input `index` up to the root.
    fn pass(&mut self, index: usize, key: Head<T>, comparator: &dyn RecordComparator<T>) -> Node<T> {
        let mut candidate = Node { key, index };
        let mut slot = (self.capacity + index) / 2;
        while slot != 0 {
            if Self::beats(&self.nodes[slot], &candidate, comparator) {
                mem::swap(&mut candidate, &mut self.nodes[slot]);
            }
            slot /= 2;
        }
        mem::swap(&mut self.nodes[0], &mut candidate);
        candidate
    }

    fn beats(a: &Node<T>, b: &Node<T>, comparator: &dyn RecordComparator<T>) -> bool {
        let ordering = match (&a.key, &b.key) {
            (Head::EarlyFence, Head::EarlyFence) | (Head::LateFence, Head::LateFence) => {
                Ordering::Equal
            }
            (Head::EarlyFence, _) | (_, Head::LateFence) => Ordering::Less,
            (_, Head::EarlyFence) | (Head::LateFence, _) => Ordering::Greater,
            (Head::Value(x), Head::Value(y)) => comparator.compare(x, y),
        };
        ordering.then(a.index.cmp(&b.index)) == Ordering::Less
    }
}
