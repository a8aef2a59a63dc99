//! Dependency ordering for plugin initialization.
//!
//! Depth-first visitation with in-progress/done marks. Roots are visited with
//! explicit `init_order` values first (ascending), then in registration order;
//! each plugin's dependencies are visited in declaration order before the
//! plugin itself is appended. Reaching a plugin that is still in progress
//! closes a cycle: that edge is dropped and the cycle recorded. Dependencies on
//! names that were never registered are skipped and recorded.

use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingDependency {
    pub plugin: String,
    pub dependency: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyReport {
    /// Every registered plugin exactly once, dependencies first.
    pub order: Vec<String>,
    /// One entry per dropped edge: the path from the revisited plugin back to itself.
    pub cycles: Vec<Vec<String>>,
    pub missing: Vec<MissingDependency>,
}

impl DependencyReport {
    pub fn is_clean(&self) -> bool {
        self.cycles.is_empty() && self.missing.is_empty()
    }
}

/// Input row: plugin name, declared dependencies, optional explicit order.
pub(crate) struct OrderNode<'a> {
    pub name: &'a str,
    pub dependencies: &'a [String],
    pub init_order: Option<i32>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

struct Walk<'a> {
    edges: HashMap<&'a str, &'a [String]>,
    marks: HashMap<&'a str, Mark>,
    stack: Vec<&'a str>,
    report: DependencyReport,
    missing_seen: HashSet<(&'a str, &'a str)>,
}

impl<'a> Walk<'a> {
    fn visit(&mut self, name: &'a str) {
        match self.marks.get(name) {
            Some(Mark::Done) => return,
            Some(Mark::InProgress) => {
                let start = self
                    .stack
                    .iter()
                    .position(|entry| *entry == name)
                    .unwrap_or(0);
                let mut path: Vec<String> =
                    self.stack[start..].iter().map(|s| s.to_string()).collect();
                path.push(name.to_string());
                self.report.cycles.push(path);
                return;
            }
            None => {}
        }

        self.marks.insert(name, Mark::InProgress);
        self.stack.push(name);

        let dependencies = self.edges.get(name).copied().unwrap_or(&[]);
        for dependency in dependencies {
            let dependency = dependency.as_str();
            if !self.edges.contains_key(dependency) {
                if self.missing_seen.insert((name, dependency)) {
                    self.report.missing.push(MissingDependency {
                        plugin: name.to_string(),
                        dependency: dependency.to_string(),
                    });
                }
                continue;
            }
            self.visit(dependency);
        }

        self.stack.pop();
        self.marks.insert(name, Mark::Done);
        self.report.order.push(name.to_string());
    }
}

/// Compute the initialization order for `nodes`, given in registration order.
pub(crate) fn resolve_order(nodes: &[OrderNode<'_>]) -> DependencyReport {
    let mut walk = Walk {
        edges: nodes
            .iter()
            .map(|node| (node.name, node.dependencies))
            .collect(),
        marks: HashMap::new(),
        stack: Vec::new(),
        report: DependencyReport::default(),
        missing_seen: HashSet::new(),
    };

    let mut roots: Vec<&OrderNode<'_>> = nodes.iter().collect();
    // Stable: plugins without an explicit order keep registration order.
    roots.sort_by_key(|node| (node.init_order.is_none(), node.init_order));

    for root in roots {
        walk.visit(root.name);
    }
    walk.report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn order_of(graph: &[(&str, Vec<String>, Option<i32>)]) -> DependencyReport {
        let nodes: Vec<OrderNode<'_>> = graph
            .iter()
            .map(|(name, dependencies, init_order)| OrderNode {
                name,
                dependencies,
                init_order: *init_order,
            })
            .collect();
        resolve_order(&nodes)
    }

    fn position(order: &[String], name: &str) -> usize {
        order.iter().position(|n| n == name).unwrap()
    }

    #[test]
    fn dependencies_come_first() {
        let report = order_of(&[
            ("C", deps(&["A", "B"]), None),
            ("A", deps(&[]), None),
            ("B", deps(&["A"]), None),
        ]);
        assert_eq!(report.order, vec!["A", "B", "C"]);
        assert!(report.is_clean());
    }

    #[test]
    fn every_edge_respected_in_a_diamond() {
        let graph = [
            ("app", deps(&["audio", "prayer"]), None),
            ("audio", deps(&["settings"]), None),
            ("prayer", deps(&["settings", "location"]), None),
            ("location", deps(&["settings"]), None),
            ("settings", deps(&[]), None),
        ];
        let report = order_of(&graph);
        assert_eq!(report.order.len(), graph.len());
        for (name, dependencies, _) in &graph {
            for dependency in dependencies {
                assert!(position(&report.order, dependency) < position(&report.order, name));
            }
        }
    }

    #[test]
    fn two_node_cycle_terminates_with_both_names_once() {
        let report = order_of(&[("X", deps(&["Y"]), None), ("Y", deps(&["X"]), None)]);
        assert_eq!(report.order, vec!["Y", "X"]);
        assert_eq!(report.cycles, vec![vec!["X", "Y", "X"]]);
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let report = order_of(&[("solo", deps(&["solo"]), None)]);
        assert_eq!(report.order, vec!["solo"]);
        assert_eq!(report.cycles, vec![vec!["solo", "solo"]]);
    }

    #[test]
    fn unregistered_dependencies_are_skipped() {
        let report = order_of(&[
            ("qibla", deps(&["compass", "location"]), None),
            ("location", deps(&[]), None),
        ]);
        assert_eq!(report.order, vec!["location", "qibla"]);
        assert_eq!(
            report.missing,
            vec![MissingDependency {
                plugin: "qibla".into(),
                dependency: "compass".into(),
            }]
        );
    }

    #[test]
    fn explicit_init_order_visits_first() {
        let report = order_of(&[
            ("first_registered", deps(&[]), None),
            ("late", deps(&[]), Some(5)),
            ("early", deps(&["first_registered"]), Some(1)),
        ]);
        assert_eq!(report.order, vec!["first_registered", "early", "late"]);
    }
}
