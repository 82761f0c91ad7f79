//! Create/drop statement generation with dependency ordering
//!
//! Foreign keys depend on the primary or unique key they reference. When
//! both appear in the same definition list, the key is created first and
//! dropped last. Everything else keeps its input order.

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use tracing::debug;

use super::statement::{DdlAction, Statement};
use crate::database::ErrorSensitivity;
use crate::models::{ConstraintDefinition, Definition, IndexDefinition};
use crate::planner::PlanningError;

/// Statements creating `definitions`, ordered so referenced keys come first
pub fn generate_create(
    definitions: &[Definition],
    sensitivity: ErrorSensitivity,
) -> Result<Vec<Statement>, PlanningError> {
    let order = creation_order(definitions)?;
    let statements: Vec<Statement> = order
        .into_iter()
        .map(|i| {
            let action = match &definitions[i] {
                Definition::Index(index) => DdlAction::CreateIndex(index.clone()),
                Definition::Constraint(constraint) => DdlAction::AddConstraint(constraint.clone()),
            };
            Statement::new(action, sensitivity)
        })
        .collect();
    debug!(count = statements.len(), %sensitivity, "Generated create statements");
    Ok(statements)
}

/// Statements dropping `definitions`, ordered so dependents go first
pub fn generate_drop(
    definitions: &[Definition],
    sensitivity: ErrorSensitivity,
) -> Result<Vec<Statement>, PlanningError> {
    let mut order = creation_order(definitions)?;
    order.reverse();
    let statements: Vec<Statement> = order
        .into_iter()
        .map(|i| {
            let action = match &definitions[i] {
                Definition::Index(index) => DdlAction::DropIndex {
                    name: index.name.clone(),
                    table: index.table.clone(),
                    if_exists: false,
                },
                Definition::Constraint(constraint) => DdlAction::DropConstraint {
                    constraint: constraint.clone(),
                    cascade: false,
                },
            };
            Statement::new(action, sensitivity)
        })
        .collect();
    debug!(count = statements.len(), %sensitivity, "Generated drop statements");
    Ok(statements)
}

/// `DROP INDEX IF EXISTS` for indexes a transform retires; absent ones are
/// not an error at any sensitivity
pub fn generate_index_removal(
    indexes: &[IndexDefinition],
    sensitivity: ErrorSensitivity,
) -> Vec<Statement> {
    indexes
        .iter()
        .map(|index| {
            Statement::new(
                DdlAction::DropIndex {
                    name: index.name.clone(),
                    table: index.table.clone(),
                    if_exists: true,
                },
                sensitivity,
            )
        })
        .collect()
}

fn references(fk: &ConstraintDefinition, key: &ConstraintDefinition) -> bool {
    if !key.kind.is_key() {
        return false;
    }
    match fk.reference() {
        Some((table, columns)) => table == key.table && columns == key.columns.as_slice(),
        None => false,
    }
}

/// Position pairs `(dependency, dependent)` among `definitions`
pub fn dependency_edges(definitions: &[Definition]) -> Vec<(usize, usize)> {
    let mut edges = Vec::new();
    for (i, key) in definitions.iter().enumerate() {
        let Definition::Constraint(key) = key else {
            continue;
        };
        for (j, dependent) in definitions.iter().enumerate() {
            if let Definition::Constraint(fk) = dependent
                && i != j
                && references(fk, key)
            {
                edges.push((i, j));
            }
        }
    }
    edges
}

fn creation_order(definitions: &[Definition]) -> Result<Vec<usize>, PlanningError> {
    let edges = dependency_edges(definitions);
    topological_order(definitions.len(), &edges).map_err(|members| PlanningError::Cycle {
        members: members
            .into_iter()
            .map(|i| definitions[i].name().to_string())
            .collect(),
    })
}

/// Stable topological order of `count` nodes.
///
/// Among nodes whose dependencies are satisfied the lowest position goes
/// first, so input order is preserved wherever the edges allow it. On a cycle
/// the positions of the nodes involved are returned.
pub fn topological_order(count: usize, edges: &[(usize, usize)]) -> Result<Vec<usize>, Vec<usize>> {
    let mut graph = DiGraph::<usize, ()>::with_capacity(count, edges.len());
    let nodes: Vec<NodeIndex> = (0..count).map(|i| graph.add_node(i)).collect();
    let mut in_degree = vec![0usize; count];
    for &(from, to) in edges {
        graph.add_edge(nodes[from], nodes[to], ());
        in_degree[to] += 1;
    }

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();
    let mut order = Vec::with_capacity(count);
    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for next in graph.neighbors(nodes[i]) {
            let j = graph[next];
            in_degree[j] -= 1;
            if in_degree[j] == 0 {
                ready.push(Reverse(j));
            }
        }
    }

    if order.len() == count {
        return Ok(order);
    }

    let mut members: Vec<usize> = tarjan_scc(&graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || scc.iter().any(|n| graph.contains_edge(*n, *n)))
        .flatten()
        .map(|n| graph[n])
        .collect();
    members.sort_unstable();
    Err(members)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definitions() -> Vec<Definition> {
        vec![
            ConstraintDefinition::foreign_key(
                "fpk_visit_person",
                "visit_occurrence",
                vec!["person_id".into()],
                "person",
                vec!["person_id".into()],
            )
            .into(),
            IndexDefinition::on_column("idx_visit_person", "visit_occurrence", "person_id").into(),
            ConstraintDefinition::primary_key("xpk_person", "person", vec!["person_id".into()])
                .into(),
        ]
    }

    #[test]
    fn test_create_puts_key_before_foreign_key() {
        let stmts = generate_create(&definitions(), ErrorSensitivity::Normal).unwrap();
        let order: Vec<_> = stmts.iter().map(|s| s.description.as_str()).collect();
        assert!(order[0].starts_with("create index idx_visit_person"));
        assert!(order[1].starts_with("add primary key xpk_person"));
        assert!(order[2].starts_with("add foreign key fpk_visit_person"));
    }

    #[test]
    fn test_drop_puts_foreign_key_before_key() {
        let stmts = generate_drop(&definitions(), ErrorSensitivity::Force).unwrap();
        let fk = stmts
            .iter()
            .position(|s| s.description.contains("fpk_visit_person"))
            .unwrap();
        let pk = stmts
            .iter()
            .position(|s| s.description.contains("xpk_person"))
            .unwrap();
        assert!(fk < pk);
        assert!(stmts.iter().all(|s| s.sensitivity == ErrorSensitivity::Force));
    }

    #[test]
    fn test_self_reference_is_not_a_cycle() {
        let defs: Vec<Definition> = vec![
            ConstraintDefinition::foreign_key(
                "fpk_visit_preceding",
                "visit_occurrence",
                vec!["preceding_visit_occurrence_id".into()],
                "visit_occurrence",
                vec!["visit_occurrence_id".into()],
            )
            .into(),
            ConstraintDefinition::primary_key(
                "xpk_visit_occurrence",
                "visit_occurrence",
                vec!["visit_occurrence_id".into()],
            )
            .into(),
        ];
        let stmts = generate_create(&defs, ErrorSensitivity::Normal).unwrap();
        assert!(stmts[0].description.contains("xpk_visit_occurrence"));
    }

    #[test]
    fn test_topological_order_reports_cycle_members() {
        let err = topological_order(4, &[(0, 1), (1, 2), (2, 1), (3, 0)]).unwrap_err();
        assert_eq!(err, vec![1, 2]);
    }

    #[test]
    fn test_topological_order_is_stable() {
        assert_eq!(topological_order(3, &[]).unwrap(), vec![0, 1, 2]);
        assert_eq!(topological_order(3, &[(2, 0)]).unwrap(), vec![1, 2, 0]);
    }
}
