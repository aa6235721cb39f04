//! Dependency gating.
//!
//! A task is eligible only once every id in its `depends_on` refers to a
//! `completed` task. Failed or cancelled dependencies are not propagated: the
//! dependent simply stays ineligible until someone cancels it.

use crate::errors::SubmitError;
use crate::schema::Task;
use sqlx::PgExecutor;
use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

/// SQL predicate over a `tasks` row aliased `t`: true when every dependency is
/// `completed`. A dependency row that no longer exists does not count as completed.
pub(crate) const DEPENDENCIES_SATISFIED: &str = r"
    NOT EXISTS (
        SELECT 1
        FROM unnest(t.depends_on) AS dependency(id)
        LEFT JOIN tasks d ON d.id = dependency.id
        WHERE d.status IS DISTINCT FROM 'completed'
    )";

/// Whether all dependencies of `task` have completed.
pub async fn is_eligible<'e>(
    executor: impl PgExecutor<'e>,
    task: &Task,
) -> Result<bool, sqlx::Error> {
    if task.depends_on.is_empty() {
        return Ok(true);
    }

    let completed = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(DISTINCT id) FROM tasks WHERE id = ANY($1) AND status = 'completed'",
    )
    .bind(&task.depends_on)
    .fetch_one(executor)
    .await?;

    let distinct = task.depends_on.iter().collect::<HashSet<_>>().len();
    Ok(usize::try_from(completed).unwrap_or(0) == distinct)
}

/// Reject batches whose dependency edges form a cycle, or that depend on
/// themselves.
///
/// Stored tasks can only reference tasks that existed before them, so a cycle
/// can only be introduced by edges between members of the same batch.
pub(crate) fn check_batch_acyclic(batch: &[(Uuid, &[Uuid])]) -> Result<(), SubmitError> {
    let members: HashSet<Uuid> = batch.iter().map(|(id, _)| *id).collect();
    let mut in_degree: HashMap<Uuid, usize> = members.iter().map(|id| (*id, 0)).collect();
    let mut dependents: HashMap<Uuid, Vec<Uuid>> = HashMap::new();

    for (id, depends_on) in batch {
        for dependency in depends_on.iter().collect::<HashSet<_>>() {
            if dependency == id {
                return Err(SubmitError::SelfDependency(*id));
            }
            if members.contains(dependency) {
                *in_degree.entry(*id).or_default() += 1;
                dependents.entry(*dependency).or_default().push(*id);
            }
        }
    }

    let mut ready: VecDeque<Uuid> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0;

    while let Some(id) = ready.pop_front() {
        visited += 1;
        for dependent in dependents.get(&id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push_back(*dependent);
                }
            }
        }
    }

    if visited == members.len() {
        return Ok(());
    }

    let mut cycle: Vec<Uuid> = in_degree
        .into_iter()
        .filter(|(_, degree)| *degree > 0)
        .map(|(id, _)| id)
        .collect();
    cycle.sort();
    Err(SubmitError::DependencyCycle(cycle))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use claims::{assert_matches, assert_ok};

    fn ids<const N: usize>() -> [Uuid; N] {
        std::array::from_fn(|_| Uuid::new_v4())
    }

    #[test]
    fn chains_and_external_dependencies_are_accepted() {
        let [a, b, c, stored] = ids();
        assert_ok!(check_batch_acyclic(&[
            (a, &[stored][..]),
            (b, &[a][..]),
            (c, &[a, b, a][..]),
        ]));
    }

    #[test]
    fn self_dependency_is_rejected() {
        let [a] = ids();
        assert_matches!(
            check_batch_acyclic(&[(a, &[a][..])]),
            Err(SubmitError::SelfDependency(id)) if id == a
        );
    }

    #[test]
    fn cycles_are_reported_with_their_members() {
        let [a, b, c, d] = ids();
        let result = check_batch_acyclic(&[
            (a, &[c][..]),
            (b, &[a][..]),
            (c, &[b][..]),
            (d, &[][..]),
        ]);

        let mut expected = vec![a, b, c];
        expected.sort();
        assert_matches!(result, Err(SubmitError::DependencyCycle(members)) if members == expected);
    }
}
