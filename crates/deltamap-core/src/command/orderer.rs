//! Dependency ordering of compiled commands.
//!
//! Three edge families: value producers run before their consumers,
//! dependent-row deletes run before principal-row deletes, and a delete
//! of a key runs before an insert reclaiming it in the same table.
//! Within the remaining freedom the order is deterministic.

use super::{CommandError, ModificationOperator, UpdateCommand};
use std::collections::BTreeSet;

/// Topologically order the session's commands.
pub fn order_commands(commands: Vec<UpdateCommand>) -> Result<Vec<UpdateCommand>, CommandError> {
    let n = commands.len();
    let mut successors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
    let mut indegree = vec![0usize; n];

    let mut add_edge = |from: usize, to: usize, successors: &mut Vec<BTreeSet<usize>>| {
        if from != to && successors[from].insert(to) {
            indegree[to] += 1;
        }
    };

    for (i, a) in commands.iter().enumerate() {
        for (j, b) in commands.iter().enumerate() {
            if i == j {
                continue;
            }

            // a produces a value b consumes
            if intersects(a.output_identifiers(), b.input_identifiers()) {
                add_edge(i, j, &mut successors);
                continue;
            }

            // dependent-row delete frees the reference before the
            // principal row goes away
            if a.op() == ModificationOperator::Delete
                && b.op() == ModificationOperator::Delete
                && a.input_identifiers()
                    .iter()
                    .any(|id| b.key_identifiers().contains(id) && !a.key_identifiers().contains(id))
            {
                add_edge(i, j, &mut successors);
                continue;
            }

            // a key must be released before it is reclaimed
            if a.op() == ModificationOperator::Delete
                && b.op() == ModificationOperator::Insert
                && let (Some((table_a, key_a)), Some((table_b, key_b))) =
                    (a.table_and_key(), b.table_and_key())
                && table_a == table_b
                && key_a == key_b
            {
                add_edge(i, j, &mut successors);
            }
        }
    }

    // Kahn's algorithm; among ready commands always pick the least by the
    // deterministic tie-break.
    let mut ready: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut out = Vec::with_capacity(n);
    let mut emitted = vec![false; n];

    while !ready.is_empty() {
        let pick = ready
            .iter()
            .enumerate()
            .min_by_key(|&(_, &i)| commands[i].sort_key())
            .map(|(pos, _)| pos)
            .unwrap_or(0);
        let index = ready.swap_remove(pick);

        emitted[index] = true;
        out.push(index);

        for &next in &successors[index] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push(next);
            }
        }
    }

    if out.len() < n {
        let mut entries = Vec::new();
        for (i, command) in commands.iter().enumerate() {
            if !emitted[i] {
                entries.extend_from_slice(command.source_entries());
            }
        }
        entries.sort_unstable();
        entries.dedup();
        return Err(CommandError::OrderingCycle { entries });
    }

    // reorder by emission sequence
    let mut slots: Vec<Option<UpdateCommand>> = commands.into_iter().map(Some).collect();
    Ok(out
        .into_iter()
        .filter_map(|index| slots[index].take())
        .collect())
}

fn intersects<T: Ord>(a: &BTreeSet<T>, b: &BTreeSet<T>) -> bool {
    a.intersection(b).next().is_some()
}
