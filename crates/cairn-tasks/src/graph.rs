//! Dependency graph construction and the working set
//!
//! [`GraphBuilder::build`] resolves requested tasks into a DAG in three
//! passes: requirements are resolved into nodes and edges, the result is
//! checked for cycles, and identities are computed dependency-first.
//!
//! The resulting [`Graph`] keeps every node for the lifetime of the build but
//! tracks a *working set* of nodes that still need attention. Planning and
//! scheduling shrink the working set; identities never change.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::error::GraphError;
use crate::influence::{Identity, InfluenceRegistry};
use crate::task::{TaskInstance, TaskRegistry};

/// Index of a node within its graph
pub type NodeId = usize;

/// A task instance inside a build graph
#[derive(Debug)]
pub struct GraphNode {
    id: NodeId,
    instance: Arc<TaskInstance>,
    identity: Identity,
    influence: Vec<String>,
    dependencies: Vec<Arc<GraphNode>>,
}

impl GraphNode {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn instance(&self) -> &Arc<TaskInstance> {
        &self.instance
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Influence strings the identity was computed from
    pub fn influence(&self) -> &[String] {
        &self.influence
    }

    /// Direct dependencies, sorted by qualified name
    pub fn dependencies(&self) -> &[Arc<GraphNode>] {
        &self.dependencies
    }

    pub fn qualified_name(&self) -> &str {
        self.instance.qualified_name()
    }

    pub fn canonical_name(&self) -> String {
        self.instance.canonical_name()
    }

    pub fn is_cacheable(&self) -> bool {
        self.instance.is_cacheable()
    }
}

/// Builds graphs from task names
pub struct GraphBuilder<'a> {
    tasks: &'a TaskRegistry,
    influence: &'a InfluenceRegistry,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(tasks: &'a TaskRegistry, influence: &'a InfluenceRegistry) -> Self {
        Self { tasks, influence }
    }

    /// Build the graph for the requested root tasks
    #[instrument(skip_all, fields(roots = roots.len()))]
    pub fn build<S: AsRef<str>>(&self, roots: &[S]) -> Result<Graph, GraphError> {
        let mut instances: Vec<Arc<TaskInstance>> = Vec::new();
        let mut children: Vec<Vec<NodeId>> = Vec::new();
        let mut index: HashMap<String, NodeId> = HashMap::new();
        let mut root_ids = BTreeSet::new();
        let mut queue = VecDeque::new();

        let mut intern = |instance: Arc<TaskInstance>,
                          instances: &mut Vec<Arc<TaskInstance>>,
                          children: &mut Vec<Vec<NodeId>>,
                          queue: &mut VecDeque<NodeId>|
         -> NodeId {
            if let Some(&id) = index.get(instance.qualified_name()) {
                return id;
            }
            let id = instances.len();
            index.insert(instance.qualified_name().to_string(), id);
            instances.push(instance);
            children.push(Vec::new());
            queue.push_back(id);
            id
        };

        for root in roots {
            let instance = self.tasks.instance(root.as_ref())?;
            let id = intern(instance, &mut instances, &mut children, &mut queue);
            root_ids.insert(id);
        }

        // Pass 1: resolve requirements breadth-first
        while let Some(id) = queue.pop_front() {
            let instance = instances[id].clone();
            let mut deps = Vec::new();
            for requirement in instance.requires()? {
                let dependency = self.tasks.instance(&requirement)?;
                deps.push(intern(dependency, &mut instances, &mut children, &mut queue));
            }
            deps.sort_by(|a, b| instances[*a].qualified_name().cmp(instances[*b].qualified_name()));
            deps.dedup();
            children[id] = deps;
        }

        // Pass 2: order dependency-first, anything left over is on or above a cycle
        let order = topological_order(&children);
        if order.len() != instances.len() {
            let ordered: BTreeSet<NodeId> = order.iter().copied().collect();
            let unordered: BTreeSet<NodeId> = (0..instances.len())
                .filter(|id| !ordered.contains(id))
                .collect();
            let mut cyclic: Vec<String> = cycle_members(&children, &unordered)
                .into_iter()
                .map(|id| instances[id].qualified_name().to_string())
                .collect();
            cyclic.sort();
            return Err(GraphError::Cycle(cyclic));
        }

        // Pass 3: identities, dependencies are always computed first
        let mut nodes: Vec<Option<Arc<GraphNode>>> = vec![None; instances.len()];
        for &id in &order {
            let instance = &instances[id];
            let dependencies: Vec<Arc<GraphNode>> = children[id]
                .iter()
                .filter_map(|child| nodes[*child].clone())
                .collect();
            let identities: BTreeMap<String, Identity> = dependencies
                .iter()
                .map(|dep| (dep.qualified_name().to_string(), dep.identity().clone()))
                .collect();

            let influence = self.influence.strings(instance)?;
            let identity = self.influence.identity(instance, &influence, &identities);
            nodes[id] = Some(Arc::new(GraphNode {
                id,
                instance: instance.clone(),
                identity,
                influence,
                dependencies,
            }));
        }

        let nodes: Vec<Arc<GraphNode>> = nodes.into_iter().flatten().collect();
        info!(
            task_count = nodes.len(),
            root_count = root_ids.len(),
            "task graph built"
        );
        Ok(Graph::new(nodes, children, root_ids))
    }
}

/// Kahn's algorithm over dependency edges, leaves first
fn topological_order(children: &[Vec<NodeId>]) -> Vec<NodeId> {
    let mut remaining: Vec<usize> = children.iter().map(Vec::len).collect();
    let mut parents: Vec<Vec<NodeId>> = vec![Vec::new(); children.len()];
    for (parent, deps) in children.iter().enumerate() {
        for &child in deps {
            parents[child].push(parent);
        }
    }

    let mut queue: VecDeque<NodeId> = (0..children.len())
        .filter(|id| remaining[*id] == 0)
        .collect();
    let mut order = Vec::with_capacity(children.len());

    while let Some(id) = queue.pop_front() {
        order.push(id);
        for &parent in &parents[id] {
            remaining[parent] = remaining[parent].saturating_sub(1);
            if remaining[parent] == 0 {
                queue.push_back(parent);
            }
        }
    }

    order
}

/// Nodes of `candidates` that can reach themselves again
fn cycle_members(children: &[Vec<NodeId>], candidates: &BTreeSet<NodeId>) -> Vec<NodeId> {
    candidates
        .iter()
        .copied()
        .filter(|&start| {
            let mut seen = BTreeSet::new();
            let mut stack: Vec<NodeId> = children[start].clone();
            while let Some(id) = stack.pop() {
                if id == start {
                    return true;
                }
                if candidates.contains(&id) && seen.insert(id) {
                    stack.extend(children[id].iter().copied());
                }
            }
            false
        })
        .collect()
}

/// A resolved build graph and its working set
#[derive(Debug)]
pub struct Graph {
    nodes: Vec<Arc<GraphNode>>,
    parents: Vec<Vec<NodeId>>,
    roots: BTreeSet<NodeId>,
    working: BTreeSet<NodeId>,
    /// Dependencies each working node still waits for
    edges: Vec<BTreeSet<NodeId>>,
}

impl Graph {
    fn new(
        nodes: Vec<Arc<GraphNode>>,
        children: Vec<Vec<NodeId>>,
        roots: BTreeSet<NodeId>,
    ) -> Self {
        let mut parents = vec![Vec::new(); nodes.len()];
        for (parent, deps) in children.iter().enumerate() {
            for &child in deps {
                parents[child].push(parent);
            }
        }

        Self {
            working: (0..nodes.len()).collect(),
            edges: children.into_iter().map(|deps| deps.into_iter().collect()).collect(),
            nodes,
            parents,
            roots,
        }
    }

    /// Number of nodes in the working set
    pub fn len(&self) -> usize {
        self.working.len()
    }

    /// Check if the working set is empty
    pub fn is_empty(&self) -> bool {
        self.working.is_empty()
    }

    /// Look up any node, including ones no longer in the working set
    pub fn get(&self, id: NodeId) -> Option<&Arc<GraphNode>> {
        self.nodes.get(id)
    }

    /// Look up a node by qualified name
    pub fn find(&self, qualified_name: &str) -> Option<&Arc<GraphNode>> {
        self.nodes.iter().find(|n| n.qualified_name() == qualified_name)
    }

    /// Whether the node is still in the working set
    pub fn contains(&self, id: NodeId) -> bool {
        self.working.contains(&id)
    }

    /// Every node of the graph, including removed ones
    pub fn all_nodes(&self) -> impl Iterator<Item = &Arc<GraphNode>> {
        self.nodes.iter()
    }

    /// Nodes in the working set
    pub fn nodes(&self) -> impl Iterator<Item = &Arc<GraphNode>> {
        self.working.iter().map(|id| &self.nodes[*id])
    }

    /// Requested root nodes
    pub fn roots(&self) -> impl Iterator<Item = &Arc<GraphNode>> {
        self.roots.iter().map(|id| &self.nodes[*id])
    }

    /// True if the node has no remaining dependencies in the working set
    pub fn is_leaf(&self, id: NodeId) -> bool {
        self.edges.get(id).map_or(true, BTreeSet::is_empty)
    }

    /// Working nodes matching `predicate`
    pub fn select<F>(&self, predicate: F) -> Vec<Arc<GraphNode>>
    where
        F: Fn(&GraphNode) -> bool,
    {
        self.nodes().filter(|n| predicate(n)).cloned().collect()
    }

    /// Working nodes ready to execute
    pub fn leaves(&self) -> Vec<Arc<GraphNode>> {
        self.working
            .iter()
            .filter(|id| self.is_leaf(**id))
            .map(|id| self.nodes[*id].clone())
            .collect()
    }

    /// Remove a completed node, unlocking its dependents
    pub fn remove(&mut self, id: NodeId) {
        if !self.working.remove(&id) {
            return;
        }
        for &parent in &self.parents[id] {
            self.edges[parent].remove(&id);
        }
        debug!(
            task = %self.nodes[id].qualified_name(),
            remaining = self.working.len(),
            "removed node"
        );
    }

    /// Remove nodes matching `predicate`, together with dependencies that
    /// no remaining node needs. Returns every removed node.
    pub fn prune<F>(&mut self, predicate: F) -> Vec<Arc<GraphNode>>
    where
        F: Fn(&GraphNode) -> bool,
    {
        let matching: Vec<NodeId> = self
            .working
            .iter()
            .copied()
            .filter(|id| predicate(&self.nodes[*id]))
            .collect();

        for &id in &matching {
            self.remove(id);
        }

        let mut pruned: Vec<Arc<GraphNode>> =
            matching.iter().map(|id| self.nodes[*id].clone()).collect();
        pruned.extend(self.sweep_orphans());
        pruned
    }

    /// Stop a node from waiting on its dependencies. Dependencies that no
    /// other node needs leave the working set; they are returned.
    pub fn detach(&mut self, id: NodeId) -> Vec<Arc<GraphNode>> {
        if let Some(edges) = self.edges.get_mut(id) {
            edges.clear();
        }
        self.sweep_orphans()
    }

    fn has_dependent(&self, id: NodeId) -> bool {
        self.parents[id]
            .iter()
            .any(|parent| self.working.contains(parent) && self.edges[*parent].contains(&id))
    }

    fn sweep_orphans(&mut self) -> Vec<Arc<GraphNode>> {
        let mut swept = Vec::new();
        loop {
            let orphans: Vec<NodeId> = self
                .working
                .iter()
                .copied()
                .filter(|id| !self.roots.contains(id) && !self.has_dependent(*id))
                .collect();
            if orphans.is_empty() {
                break;
            }
            for id in orphans {
                self.remove(id);
                swept.push(self.nodes[id].clone());
            }
        }
        swept
    }

    /// Working nodes in depth-first order, dependencies before dependents
    pub fn flatten_leaf_first(&self) -> Vec<Arc<GraphNode>> {
        let mut visited = BTreeSet::new();
        let mut order = Vec::new();
        for &root in &self.roots {
            self.visit_post(root, &mut visited, &mut order);
        }
        order.into_iter().map(|id| self.nodes[id].clone()).collect()
    }

    /// Working nodes in depth-first order, dependents before dependencies
    pub fn flatten_root_first(&self) -> Vec<Arc<GraphNode>> {
        let mut visited = BTreeSet::new();
        let mut order = Vec::new();
        for &root in &self.roots {
            self.visit_pre(root, &mut visited, &mut order);
        }
        order.into_iter().map(|id| self.nodes[id].clone()).collect()
    }

    fn visit_post(&self, id: NodeId, visited: &mut BTreeSet<NodeId>, order: &mut Vec<NodeId>) {
        if !self.working.contains(&id) || !visited.insert(id) {
            return;
        }
        for &child in &self.edges[id] {
            self.visit_post(child, visited, order);
        }
        order.push(id);
    }

    fn visit_pre(&self, id: NodeId, visited: &mut BTreeSet<NodeId>, order: &mut Vec<NodeId>) {
        if !self.working.contains(&id) || !visited.insert(id) {
            return;
        }
        order.push(id);
        for &child in &self.edges[id] {
            self.visit_pre(child, visited, order);
        }
    }

    /// Human-readable summary of the remaining work
    pub fn execution_plan(&self) -> String {
        let mut plan = String::new();
        for node in self.flatten_leaf_first() {
            let deps: Vec<&str> = self.edges[node.id()]
                .iter()
                .map(|id| self.nodes[*id].qualified_name())
                .collect();
            if deps.is_empty() {
                plan.push_str(&format!(
                    "  {} [{}]\n",
                    node.qualified_name(),
                    node.identity().short()
                ));
            } else {
                plan.push_str(&format!(
                    "  {} [{}] (after: {})\n",
                    node.qualified_name(),
                    node.identity().short(),
                    deps.join(", ")
                ));
            }
        }
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::tests::{noop, NoopAction};
    use crate::task::TaskDefinition;

    fn registry() -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry.register(noop("a").with_requires("b")).unwrap();
        registry.register(noop("b").with_requires("c")).unwrap();
        registry.register(noop("c")).unwrap();
        registry
            .register(noop("diamond").with_requires("left").with_requires("right"))
            .unwrap();
        registry.register(noop("left").with_requires("c")).unwrap();
        registry.register(noop("right").with_requires("c")).unwrap();
        registry.register(noop("sibling")).unwrap();
        registry
    }

    fn build(registry: &TaskRegistry, roots: &[&str]) -> Graph {
        let influence = InfluenceRegistry::with_defaults();
        GraphBuilder::new(registry, &influence).build(roots).unwrap()
    }

    fn names(nodes: &[Arc<GraphNode>]) -> Vec<&str> {
        nodes.iter().map(|n| n.qualified_name()).collect()
    }

    #[test]
    fn test_build_chain() {
        let registry = registry();
        let graph = build(&registry, &["a"]);
        assert_eq!(graph.len(), 3);
        assert_eq!(names(&graph.flatten_leaf_first()), vec!["c", "b", "a"]);
        assert_eq!(names(&graph.flatten_root_first()), vec!["a", "b", "c"]);
        assert_eq!(names(&graph.leaves()), vec!["c"]);
    }

    #[test]
    fn test_instances_are_shared() {
        let registry = registry();
        let graph = build(&registry, &["diamond"]);
        assert_eq!(graph.len(), 4);

        let left = graph.find("left").unwrap();
        let right = graph.find("right").unwrap();
        assert!(Arc::ptr_eq(&left.dependencies()[0], &right.dependencies()[0]));
    }

    #[test]
    fn test_identities_are_deterministic() {
        let registry = registry();
        let first = build(&registry, &["diamond", "sibling"]);
        let second = build(&registry, &["sibling", "diamond"]);
        for node in first.all_nodes() {
            let other = second.find(node.qualified_name()).unwrap();
            assert_eq!(node.identity(), other.identity());
        }
    }

    #[test]
    fn test_dependency_change_propagates() {
        let mut before = TaskRegistry::new();
        before.register(noop("a").with_requires("b")).unwrap();
        before.register(noop("b").with_requires("c")).unwrap();
        before.register(noop("c")).unwrap();
        before.register(noop("sibling")).unwrap();

        let mut after = TaskRegistry::new();
        after.register(noop("a").with_requires("b")).unwrap();
        after.register(noop("b").with_requires("c")).unwrap();
        after
            .register(TaskDefinition::new("c", Arc::new(NoopAction("changed"))))
            .unwrap();
        after.register(noop("sibling")).unwrap();

        let old = build(&before, &["a", "sibling"]);
        let new = build(&after, &["a", "sibling"]);
        for name in ["a", "b", "c"] {
            assert_ne!(old.find(name).unwrap().identity(), new.find(name).unwrap().identity());
        }
        assert_eq!(
            old.find("sibling").unwrap().identity(),
            new.find("sibling").unwrap().identity()
        );
    }

    #[test]
    fn test_cycle_is_reported() {
        let mut registry = TaskRegistry::new();
        registry.register(noop("a").with_requires("b")).unwrap();
        registry.register(noop("b").with_requires("c")).unwrap();
        registry.register(noop("c").with_requires("a")).unwrap();
        registry.register(noop("d").with_requires("a")).unwrap();

        let influence = InfluenceRegistry::with_defaults();
        let err = GraphBuilder::new(&registry, &influence).build(&["d"]).unwrap_err();
        match err {
            GraphError::Cycle(members) => assert_eq!(members, vec!["a", "b", "c"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_cycle_excludes_nodes_between_cycles() {
        let mut registry = TaskRegistry::new();
        registry.register(noop("app").with_requires("a")).unwrap();
        registry.register(noop("a").with_requires("b")).unwrap();
        registry.register(noop("b").with_requires("a")).unwrap();
        registry.register(noop("x").with_requires("x").with_requires("bridge")).unwrap();
        registry.register(noop("bridge").with_requires("y")).unwrap();
        registry.register(noop("y").with_requires("y")).unwrap();

        let influence = InfluenceRegistry::with_defaults();
        let err = GraphBuilder::new(&registry, &influence).build(&["app", "x"]).unwrap_err();
        match err {
            GraphError::Cycle(members) => assert_eq!(members, vec!["a", "b", "x", "y"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_requirement() {
        let mut registry = TaskRegistry::new();
        registry.register(noop("a").with_requires("missing")).unwrap();

        let influence = InfluenceRegistry::with_defaults();
        let err = GraphBuilder::new(&registry, &influence).build(&["a"]).unwrap_err();
        assert!(matches!(err, GraphError::Task(_)));
    }

    #[test]
    fn test_remove_unlocks_dependents() {
        let registry = registry();
        let mut graph = build(&registry, &["a"]);
        let c = graph.find("c").unwrap().id();
        let b = graph.find("b").unwrap().id();

        assert!(!graph.is_leaf(b));
        graph.remove(c);
        assert!(graph.is_leaf(b));
        assert_eq!(names(&graph.leaves()), vec!["b"]);
    }

    #[test]
    fn test_prune_sweeps_orphans() {
        let registry = registry();
        let mut graph = build(&registry, &["a", "diamond"]);
        assert_eq!(graph.len(), 6);

        // b is available: c is still needed by left and right
        let pruned = graph.prune(|n| n.qualified_name() == "b");
        assert_eq!(names(&pruned), vec!["b"]);
        assert!(graph.contains(graph.find("c").unwrap().id()));

        // left and right are available: c is no longer needed
        let pruned = graph.prune(|n| matches!(n.qualified_name(), "left" | "right"));
        assert_eq!(names(&pruned), vec!["left", "right", "c"]);
        assert_eq!(graph.len(), 2);
        assert!(graph.is_leaf(graph.find("a").unwrap().id()));
    }

    #[test]
    fn test_prune_keeps_roots() {
        let registry = registry();
        let mut graph = build(&registry, &["a", "c"]);
        graph.prune(|n| n.qualified_name() == "b");
        assert!(graph.contains(graph.find("c").unwrap().id()));
    }

    #[test]
    fn test_detach() {
        let registry = registry();
        let mut graph = build(&registry, &["a"]);
        let b = graph.find("b").unwrap().id();

        let swept = graph.detach(b);
        assert_eq!(names(&swept), vec!["c"]);
        assert!(graph.is_leaf(b));
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn test_select() {
        let registry = registry();
        let graph = build(&registry, &["diamond"]);
        let selected = graph.select(|n| n.dependencies().len() == 1);
        assert_eq!(names(&selected), vec!["left", "right"]);
    }

    #[test]
    fn test_execution_plan_output() {
        let registry = registry();
        let graph = build(&registry, &["a"]);
        let plan = graph.execution_plan();
        assert!(plan.contains("c ["));
        assert!(plan.contains("a [") && plan.contains("(after: b)"));
    }
}
