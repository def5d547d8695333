//! Multi-step replica migration planning.
//!
//! Pure functions over replica sets; no store access. A plan is a sequence
//! of intermediate replica sets where every transition keeps at least one
//! replica in place and adds at most `max_agony` new ones, so the partition
//! stays available while brokers catch up one step at a time.

use crate::error::{Error, Result};

/// The number of replicas that would have to be newly synced to move from
/// `from` to `to`: the count of members of `to` absent from `from`.
pub fn agony<T: PartialEq>(from: &[T], to: &[T]) -> usize {
    to.iter().filter(|b| !from.contains(b)).count()
}

/// A replica set is valid when it has no duplicates and at least
/// `minimum_replicas` members.
pub fn valid_replica_set<T: PartialEq>(replicas: &[T], minimum_replicas: usize) -> bool {
    if replicas.len() < minimum_replicas {
        return false;
    }
    for (idx, replica) in replicas.iter().enumerate() {
        if replicas[..idx].contains(replica) {
            return false;
        }
    }
    true
}

/// A transition is safe when the sets share at least one broker (so the
/// partition never loses all of its replicas at once), the target is a valid
/// replica set, and the agony stays within budget.
pub fn safe_reassignment<T: PartialEq>(
    from: &[T],
    to: &[T],
    max_agony: usize,
    minimum_replicas: usize,
) -> bool {
    from.iter().any(|b| to.contains(b))
        && valid_replica_set(to, minimum_replicas)
        && agony(from, to) <= max_agony
}

/// Plans the migration from `from` to `to`.
///
/// Each step adds up to `max_agony` missing brokers and drops up to
/// `min(current_size - 1, max_agony)` unneeded ones; every transition is
/// checked with [`safe_reassignment`]. `minimum_replicas` defaults to the
/// smaller of the two set sizes. The last step is forced to exactly `to`,
/// since reordering an unchanged member set carries no risk. The first step
/// is `from` itself when `include_initial` is set.
pub fn steps<T: Clone + PartialEq>(
    from: &[T],
    to: &[T],
    max_agony: usize,
    minimum_replicas: Option<usize>,
    include_initial: bool,
) -> Result<Vec<Vec<T>>> {
    if max_agony == 0 {
        return Err(Error::ReassignmentPlan(
            "max_agony must be at least 1".to_string(),
        ));
    }
    if to.is_empty() {
        return Err(Error::ReassignmentPlan(
            "the target replica set must not be empty".to_string(),
        ));
    }
    let minimum_replicas = minimum_replicas.unwrap_or_else(|| from.len().min(to.len()));

    let mut missing: Vec<T> = to.iter().filter(|b| !from.contains(b)).cloned().collect();
    let mut unneeded: Vec<T> = from.iter().filter(|b| !to.contains(b)).cloned().collect();

    let mut plan: Vec<Vec<T>> = if include_initial {
        vec![from.to_vec()]
    } else {
        Vec::new()
    };

    let mut current = from.to_vec();
    while !missing.is_empty() || !unneeded.is_empty() {
        let add = pop_n(&mut missing, max_agony);
        let droppable = current.len().saturating_sub(1).min(max_agony);
        let drop = pop_n(&mut unneeded, droppable);

        let mut next: Vec<T> = current
            .iter()
            .filter(|b| !drop.contains(b))
            .cloned()
            .collect();
        next.extend(add);

        if !safe_reassignment(&current, &next, max_agony, minimum_replicas) {
            return Err(Error::ReassignmentPlan(format!(
                "no safe transition exists with max_agony {} and minimum_replicas {}",
                max_agony, minimum_replicas
            )));
        }
        if next == current {
            return Err(Error::ReassignmentPlan(
                "planning stalled before reaching the target replica set".to_string(),
            ));
        }
        plan.push(next.clone());
        current = next;
    }

    if !same_members(&current, to) {
        return Err(Error::ReassignmentPlan(
            "planning terminated with an unexpected replica set".to_string(),
        ));
    }
    match plan.last_mut() {
        Some(last) => *last = to.to_vec(),
        None => plan.push(to.to_vec()),
    }
    Ok(plan)
}

fn pop_n<T>(items: &mut Vec<T>, n: usize) -> Vec<T> {
    items.split_off(items.len().saturating_sub(n))
}

fn same_members<T: PartialEq>(a: &[T], b: &[T]) -> bool {
    a.len() == b.len() && a.iter().all(|x| b.contains(x)) && b.iter().all(|x| a.contains(x))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agony_counts_additions() {
        assert_eq!(agony(&[1], &[1]), 0);
        assert_eq!(agony(&[1, 2], &[1, 2]), 0);
        assert_eq!(agony(&[1], &[2]), 1);
        assert_eq!(agony(&[1, 3], &[3, 2]), 1);
        assert_eq!(agony(&[1, 2, 3], &[3, 2, 4]), 1);
        assert_eq!(agony(&[1, 2, 3], &[3, 4, 5]), 2);
        assert_eq!(agony(&[1, 2, 3], &[5, 4, 3]), 2);
    }

    #[test]
    fn test_valid_replica_set() {
        assert!(valid_replica_set(&[1, 2, 3], 1));
        assert!(valid_replica_set(&[1, 2, 3], 3));
        assert!(!valid_replica_set::<i32>(&[], 1));
        assert!(!valid_replica_set(&[1, 1], 1));
        assert!(!valid_replica_set(&[1, 2, 3], 4));
    }

    #[test]
    fn test_safe_reassignment() {
        assert!(safe_reassignment(&[1, 2, 3], &[1, 2, 4], 1, 1));
        assert!(safe_reassignment(&[1, 2, 3], &[1, 4, 5], 2, 1));
        assert!(!safe_reassignment(&[1, 2, 3], &[1, 4, 5], 1, 1));
        assert!(!safe_reassignment(&[1, 2, 3], &[4, 5, 6], 1000, 1));
        assert!(!safe_reassignment(&[1, 2, 3], &[1, 2], 1, 3));
    }

    fn assert_plan(plan: &[Vec<i32>], from: &[i32], to: &[i32], max_agony: usize, min: usize) {
        assert_eq!(plan.first().unwrap().as_slice(), from);
        assert_eq!(plan.last().unwrap().as_slice(), to);
        for pair in plan.windows(2) {
            assert!(
                safe_reassignment(&pair[0], &pair[1], max_agony, min),
                "unsafe transition {:?} -> {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_steps_for_full_reassignment() {
        let plan = steps(&[1, 2, 3], &[4, 5, 6], 1, None, true).unwrap();
        assert_plan(&plan, &[1, 2, 3], &[4, 5, 6], 1, 3);
    }

    #[test]
    fn test_steps_for_replica_addition() {
        let plan = steps(&[1], &[4, 5, 6], 1, None, true).unwrap();
        assert_plan(&plan, &[1], &[4, 5, 6], 1, 1);
    }

    #[test]
    fn test_steps_for_replica_removal() {
        let plan = steps(&[4, 5, 6], &[1], 1, None, true).unwrap();
        assert_plan(&plan, &[4, 5, 6], &[1], 1, 1);
    }

    #[test]
    fn test_steps_without_initial() {
        let plan = steps(&[1, 2], &[2, 3], 1, None, false).unwrap();
        assert!(!plan.is_empty());
        assert_eq!(plan.last().unwrap(), &vec![2, 3]);
        assert_ne!(plan.first().unwrap(), &vec![1, 2]);
    }

    #[test]
    fn test_steps_when_already_at_target() {
        let plan = steps(&[1, 2], &[2, 1], 1, None, false).unwrap();
        assert_eq!(plan, vec![vec![2, 1]]);

        let plan = steps(&[1, 2], &[1, 2], 1, None, true).unwrap();
        assert_eq!(plan, vec![vec![1, 2]]);
    }

    #[test]
    fn test_steps_rejects_zero_agony_budget() {
        assert!(matches!(
            steps(&[1], &[2], 0, None, false),
            Err(Error::ReassignmentPlan(_))
        ));
    }

    #[test]
    fn test_steps_higher_agony_means_fewer_steps() {
        let slow = steps(&[1, 2, 3], &[4, 5, 6], 1, None, false).unwrap();
        let fast = steps(&[1, 2, 3], &[4, 5, 6], 2, None, false).unwrap();
        assert!(fast.len() < slow.len());
    }
}
