//! Build-order resolution for things that depend on other things.

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DependencyError {
    #[error("recursive dependency {0}")]
    Cycle(String),
}

/// Something with an ordered list of direct dependencies.
pub trait Dependent: Clone + Eq + Hash + fmt::Display {
    fn dependencies(&self) -> Vec<Self>;
}

/// Flatten the dependencies of `roots` into a build order.
///
/// Each dependency appears after everything it depends on, once, at the
/// position where it was first completed. The roots themselves are not part of
/// the result. Cycles are detected along each root-to-leaf path, so shared
/// dependencies (diamonds) are fine.
pub fn resolve_dependencies<T: Dependent>(roots: &[T]) -> Result<Vec<T>, DependencyError> {
    let mut order: Vec<T> = Vec::new();
    let mut seen: HashSet<T> = HashSet::new();

    for root in roots {
        for dep in root.dependencies() {
            visit(dep, HashSet::new(), &mut order, &mut seen)?;
        }
    }
    Ok(order)
}

fn visit<T: Dependent>(
    item: T,
    mut path: HashSet<T>,
    order: &mut Vec<T>,
    seen: &mut HashSet<T>,
) -> Result<(), DependencyError> {
    if !path.insert(item.clone()) {
        return Err(DependencyError::Cycle(item.to_string()));
    }

    for nested in item.dependencies() {
        visit(nested, path.clone(), order, seen)?;
    }

    if seen.insert(item.clone()) {
        order.push(item);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    #[derive(Debug, Clone)]
    struct Node {
        name: &'static str,
        graph: Arc<HashMap<&'static str, Vec<&'static str>>>,
    }

    impl PartialEq for Node {
        fn eq(&self, other: &Self) -> bool {
            self.name == other.name
        }
    }
    impl Eq for Node {}
    impl Hash for Node {
        fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
            self.name.hash(state);
        }
    }
    impl fmt::Display for Node {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.name)
        }
    }
    impl Dependent for Node {
        fn dependencies(&self) -> Vec<Self> {
            self.graph
                .get(self.name)
                .into_iter()
                .flatten()
                .map(|name| Node {
                    name,
                    graph: Arc::clone(&self.graph),
                })
                .collect()
        }
    }

    fn graph(edges: &[(&'static str, &[&'static str])]) -> Arc<HashMap<&'static str, Vec<&'static str>>> {
        Arc::new(edges.iter().map(|(k, v)| (*k, v.to_vec())).collect())
    }

    fn node(name: &'static str, g: &Arc<HashMap<&'static str, Vec<&'static str>>>) -> Node {
        Node {
            name,
            graph: Arc::clone(g),
        }
    }

    fn names(nodes: &[Node]) -> Vec<&'static str> {
        nodes.iter().map(|n| n.name).collect()
    }

    #[test]
    fn test_dependencies_before_dependents() {
        let g = graph(&[
            ("target", &["llvm", "libc"]),
            ("llvm", &["cmake", "ninja"]),
            ("libc", &["cmake"]),
        ]);
        let order = resolve_dependencies(&[node("target", &g)]).unwrap();
        assert_eq!(names(&order), ["cmake", "ninja", "llvm", "libc"]);
    }

    #[test]
    fn test_shared_deps_across_roots_appear_once() {
        let g = graph(&[("a", &["shared", "x"]), ("b", &["shared", "y"]), ("shared", &[])]);
        let order = resolve_dependencies(&[node("a", &g), node("b", &g)]).unwrap();
        assert_eq!(names(&order), ["shared", "x", "y"]);
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let g = graph(&[
            ("root", &["left", "right"]),
            ("left", &["base"]),
            ("right", &["base"]),
        ]);
        let order = resolve_dependencies(&[node("root", &g)]).unwrap();
        assert_eq!(names(&order), ["base", "left", "right"]);
    }

    #[test]
    fn test_cycle_is_reported() {
        let g = graph(&[("root", &["a"]), ("a", &["b"]), ("b", &["a"])]);
        let err = resolve_dependencies(&[node("root", &g)]).unwrap_err();
        assert_eq!(err, DependencyError::Cycle("a".to_string()));
        assert_eq!(err.to_string(), "recursive dependency a");
    }

    #[test]
    fn test_no_roots() {
        let order: Vec<Node> = resolve_dependencies(&[]).unwrap();
        assert!(order.is_empty());
    }
}
