//! Resource dependency graph.
//!
//! Edges run from a resource to everything it depends on: its parent, its
//! explicit dependencies and every resource its inputs reference. Iteration
//! always follows declaration order so planning is deterministic.

use indexmap::IndexMap;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use tracing::debug;

use crate::error::{GraphError, GraphIssue};
use crate::resource::{OutputRef, PropertyValue, Resource, ResourceRegistration, Urn};
use crate::state::Snapshot;

/// A validated set of resources and their dependency edges.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    resources: IndexMap<Urn, Resource>,
}

impl ResourceGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the desired graph from program registrations.
    ///
    /// # Errors
    ///
    /// Returns every invalid registration, duplicate URN, dangling
    /// dependency and cycle found.
    pub fn from_registrations(
        stack: &str,
        registrations: Vec<ResourceRegistration>,
    ) -> Result<Self, GraphError> {
        let mut issues = Vec::new();
        let mut resources = Vec::with_capacity(registrations.len());

        for registration in registrations {
            match registration.validate() {
                Ok(()) => resources.push(registration.into_resource(stack)),
                Err(reason) => issues.push(GraphIssue::InvalidRegistration {
                    name: registration.name,
                    reason,
                }),
            }
        }

        match Self::from_resources(resources) {
            Ok(graph) if issues.is_empty() => Ok(graph),
            Ok(_) => Err(GraphError { issues }),
            Err(mut err) => {
                issues.append(&mut err.issues);
                Err(GraphError { issues })
            }
        }
    }

    /// Builds the prior graph from a snapshot's live resources.
    ///
    /// # Errors
    ///
    /// Returns a [`GraphError`] if the snapshot is not a valid graph.
    pub fn from_snapshot(snapshot: &Snapshot) -> Result<Self, GraphError> {
        Self::from_resources(snapshot.resources.iter().cloned())
    }

    /// Builds a graph from resource records in declaration order.
    ///
    /// # Errors
    ///
    /// Returns every duplicate URN, dangling dependency and cycle found.
    pub fn from_resources(resources: impl IntoIterator<Item = Resource>) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        let mut issues = Vec::new();

        for resource in resources {
            if graph.resources.contains_key(&resource.urn) {
                issues.push(GraphIssue::DuplicateUrn { urn: resource.urn });
            } else {
                graph.resources.insert(resource.urn.clone(), resource);
            }
        }

        match graph.validate() {
            Ok(()) if issues.is_empty() => Ok(graph),
            Ok(()) => Err(GraphError { issues }),
            Err(mut err) => {
                issues.append(&mut err.issues);
                Err(GraphError { issues })
            }
        }
    }

    /// Checks for dangling dependencies and cycles.
    ///
    /// # Errors
    ///
    /// Returns every problem found.
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut issues: Vec<GraphIssue> = self
            .resources
            .values()
            .flat_map(|resource| {
                resource
                    .all_dependencies()
                    .into_iter()
                    .filter(|dep| !self.resources.contains_key(dep))
                    .map(|dependency| GraphIssue::DanglingDependency {
                        urn: resource.urn.clone(),
                        dependency,
                    })
            })
            .collect();

        if let Err(mut err) = self.topological_order() {
            issues.append(&mut err.issues);
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(GraphError { issues })
        }
    }

    /// Gets a resource.
    #[must_use]
    pub fn get(&self, urn: &Urn) -> Option<&Resource> {
        self.resources.get(urn)
    }

    /// Returns true if the graph has the resource.
    #[must_use]
    pub fn contains(&self, urn: &Urn) -> bool {
        self.resources.contains_key(urn)
    }

    /// Position of a resource in declaration order.
    #[must_use]
    pub fn index_of(&self, urn: &Urn) -> Option<usize> {
        self.resources.get_index_of(urn)
    }

    /// Iterates over resources in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    /// Iterates over URNs in declaration order.
    pub fn urns(&self) -> impl Iterator<Item = &Urn> {
        self.resources.keys()
    }

    /// Number of resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns true if the graph is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Dependencies of a resource that exist in this graph.
    #[must_use]
    pub fn dependencies(&self, urn: &Urn) -> Vec<Urn> {
        self.resources
            .get(urn)
            .map(|r| {
                r.all_dependencies()
                    .into_iter()
                    .filter(|d| self.resources.contains_key(d))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Resources that depend directly on `urn`, in declaration order.
    #[must_use]
    pub fn dependents(&self, urn: &Urn) -> Vec<Urn> {
        self.resources
            .values()
            .filter(|r| r.all_dependencies().contains(urn))
            .map(|r| r.urn.clone())
            .collect()
    }

    /// Resources that depend on `urn` directly or transitively.
    ///
    /// Ordered breadth-first from `urn`.
    #[must_use]
    pub fn transitive_dependents(&self, urn: &Urn) -> Vec<Urn> {
        let mut seen: HashSet<Urn> = HashSet::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::from([urn.clone()]);

        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents(&current) {
                if &dependent != urn && seen.insert(dependent.clone()) {
                    order.push(dependent.clone());
                    queue.push_back(dependent);
                }
            }
        }
        order
    }

    /// Resolves an output reference against recorded resources.
    #[must_use]
    pub fn lookup_output(&self, reference: &OutputRef) -> Option<PropertyValue> {
        self.resources
            .get(&reference.urn)
            .and_then(|r| r.output_value(reference))
    }

    /// Orders resources so every dependency precedes its dependents.
    ///
    /// Among resources that are ready at the same time, the one declared
    /// first comes first.
    ///
    /// # Errors
    ///
    /// Returns a [`GraphIssue::Cycle`] naming the participating resources.
    pub fn topological_order(&self) -> Result<Vec<Urn>, GraphError> {
        let count = self.resources.len();
        let mut in_degree = vec![0_usize; count];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
        let mut edges: Vec<Vec<usize>> = vec![Vec::new(); count];

        for (index, resource) in self.resources.values().enumerate() {
            for dep in resource.all_dependencies() {
                if let Some(dep_index) = self.resources.get_index_of(&dep) {
                    in_degree[index] += 1;
                    dependents[dep_index].push(index);
                    edges[index].push(dep_index);
                }
            }
        }

        let mut ready: BTreeSet<usize> = (0..count).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(count);

        while let Some(index) = ready.pop_first() {
            order.push(index);
            for &dependent in &dependents[index] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() < count {
            let cycle = find_cycle(&in_degree, &edges);
            debug!("Cycle detected among {} resources", cycle.len());
            return Err(GraphError::single(GraphIssue::Cycle {
                urns: cycle
                    .into_iter()
                    .filter_map(|i| self.resources.get_index(i).map(|(urn, _)| urn.clone()))
                    .collect(),
            }));
        }

        Ok(order
            .into_iter()
            .filter_map(|i| self.resources.get_index(i).map(|(urn, _)| urn.clone()))
            .collect())
    }
}

/// Follows dependency edges among the nodes Kahn's algorithm could not
/// emit until a node repeats.
fn find_cycle(in_degree: &[usize], edges: &[Vec<usize>]) -> Vec<usize> {
    let stuck = |i: usize| in_degree[i] > 0;
    let Some(start) = (0..in_degree.len()).find(|&i| stuck(i)) else {
        return Vec::new();
    };

    let mut path = Vec::new();
    let mut position: HashMap<usize, usize> = HashMap::new();
    let mut current = start;

    loop {
        if let Some(&at) = position.get(&current) {
            return path.split_off(at);
        }
        position.insert(current, path.len());
        path.push(current);

        match edges[current].iter().copied().filter(|&d| stuck(d)).min() {
            Some(next) => current = next,
            None => return path,
        }
    }
}
