use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::BTreeMap;

use super::quadlet::UnitFile;

/// A dependency edge between two services of a bundle
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Dependency {
    pub from: String,
    pub to: String,
}

/// An edge pointing at a service that does not exist in the bundle
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MissingDependency {
    pub service: String,
    pub target: String,
}

/// Outcome of a dependency pass over a bundle's units
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct DependencyAnalysis {
    pub dependencies: Vec<Dependency>,
    /// Each cycle is the path slice from the re-encountered node to the
    /// node that closed the loop
    pub circular: Vec<Vec<String>>,
    pub missing: Vec<MissingDependency>,
}

type DepGraph = DiGraph<String, ()>;

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Analyze After/Requires/Wants edges between a bundle's units
///
/// Nodes are unit base names. Targets that are not units of the bundle
/// become `missing` entries; they get no outgoing edges so they can
/// never participate in a cycle.
pub fn analyze(units: &[UnitFile]) -> DependencyAnalysis {
    let mut graph: DepGraph = DiGraph::new();
    let mut index: BTreeMap<String, NodeIndex> = BTreeMap::new();
    let mut defined: Vec<String> = vec![];

    for u in units {
        let name = u.service_name();
        if !index.contains_key(&name) {
            let idx = graph.add_node(name.clone());
            index.insert(name.clone(), idx);
        }
        defined.push(name);
    }

    let mut result = DependencyAnalysis::default();
    for u in units {
        let from = u.service_name();
        let fidx = index[&from];
        for target in u.dependencies() {
            if !defined.contains(&target) {
                result.missing.push(MissingDependency {
                    service: from.clone(),
                    target: target.clone(),
                });
            }
            let tidx = *index.entry(target.clone()).or_insert_with(|| graph.add_node(target.clone()));
            // update_edge keeps the graph simple when a unit lists the
            // same dependency under several keys
            graph.update_edge(fidx, tidx, ());
            result.dependencies.push(Dependency { from: from.clone(), to: target });
        }
    }

    result.circular = find_cycles(&graph);
    result
}

/// Render the dependency graph of a unit set for graphviz
pub fn dot(units: &[UnitFile]) -> String {
    use petgraph::dot::{Config, Dot};
    let mut graph: DiGraph<String, ()> = DiGraph::new();
    let mut index: BTreeMap<String, NodeIndex> = BTreeMap::new();
    for u in units {
        let name = u.service_name();
        index
            .entry(name.clone())
            .or_insert_with(|| graph.add_node(name.clone()));
    }
    for u in units {
        let fidx = index[&u.service_name()];
        for target in u.dependencies() {
            let tidx = *index
                .entry(target.clone())
                .or_insert_with(|| graph.add_node(target.clone()));
            graph.update_edge(fidx, tidx, ());
        }
    }
    format!("{:?}", Dot::with_config(&graph, &[Config::EdgeNoLabel]))
}

/// Iterative three colour DFS over the whole graph
fn find_cycles(graph: &DepGraph) -> Vec<Vec<String>> {
    let mut color = vec![Color::White; graph.node_count()];
    let mut cycles = vec![];

    for start in graph.node_indices() {
        if color[start.index()] != Color::White {
            continue;
        }
        let mut path: Vec<NodeIndex> = vec![start];
        let mut stack: Vec<(NodeIndex, Vec<NodeIndex>)> =
            vec![(start, graph.neighbors(start).collect())];
        color[start.index()] = Color::Gray;

        while let Some((_, neighbors)) = stack.last_mut() {
            if let Some(next) = neighbors.pop() {
                match color[next.index()] {
                    Color::White => {
                        color[next.index()] = Color::Gray;
                        path.push(next);
                        stack.push((next, graph.neighbors(next).collect()));
                    }
                    Color::Gray => {
                        // back edge: the slice from `next` to the top of
                        // the path is the cycle
                        if let Some(pos) = path.iter().position(|&p| p == next) {
                            let cycle = path[pos..].iter().map(|&i| graph[i].clone()).collect();
                            cycles.push(cycle);
                        }
                    }
                    Color::Black => {}
                }
            } else {
                let (done, _) = stack.pop().unwrap();
                color[done.index()] = Color::Black;
                path.pop();
            }
        }
    }
    cycles
}

#[cfg(test)]
mod tests {
    use super::analyze;
    use crate::quadlet::UnitFile;
    use std::path::Path;

    fn unit(name: &str, after: &str) -> UnitFile {
        let data = if after.is_empty() {
            "[Container]\nImage=x\n".to_string()
        } else {
            format!("[Unit]\nAfter={}\n\n[Container]\nImage=x\n", after)
        };
        UnitFile::parse_str(Path::new(&format!("/b/{}.container", name)), &data).unwrap()
    }

    #[test]
    fn linear_chain_has_no_cycles() {
        let units = vec![unit("a", "b.service"), unit("b", "c.service"), unit("c", "")];
        let res = analyze(&units);
        assert_eq!(res.dependencies.len(), 2);
        assert!(res.circular.is_empty());
        assert!(res.missing.is_empty());
    }

    #[test]
    fn three_node_cycle_is_a_rotation() {
        let units = vec![unit("a", "b.service"), unit("b", "c.service"), unit("c", "a.service")];
        let res = analyze(&units);
        assert_eq!(res.circular.len(), 1);
        let cycle = &res.circular[0];
        assert_eq!(cycle.len(), 3);
        // rotation of a -> b -> c
        let mut doubled = cycle.clone();
        doubled.extend(cycle.clone());
        let flat = doubled.join(",");
        assert!(flat.contains("a,b,c") || flat.contains("b,c,a") || flat.contains("c,a,b"));
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let units = vec![unit("a", "a.service")];
        let res = analyze(&units);
        assert_eq!(res.circular, vec![vec!["a".to_string()]]);
    }

    #[test]
    fn missing_target_reported_not_cyclic() {
        let units = vec![unit("a", "ghost.service")];
        let res = analyze(&units);
        assert_eq!(res.missing.len(), 1);
        assert_eq!(res.missing[0].service, "a");
        assert_eq!(res.missing[0].target, "ghost");
        assert!(res.circular.is_empty());
    }

    #[test]
    fn dot_output_names_every_service() {
        let units = vec![unit("a", "b.service"), unit("b", "")];
        let rendered = super::dot(&units);
        assert!(rendered.contains("digraph"));
        assert!(rendered.contains("\"a\""));
        assert!(rendered.contains("\"b\""));
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let units = vec![
            unit("a", "b.service c.service"),
            unit("b", "d.service"),
            unit("c", "d.service"),
            unit("d", ""),
        ];
        let res = analyze(&units);
        assert!(res.circular.is_empty());
        assert_eq!(res.dependencies.len(), 4);
    }
}
