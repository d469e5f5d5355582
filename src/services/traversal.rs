//! Constrained system-graph traversal.
//!
//! The traversal is a breadth-first walk where every queued node carries a
//! [`State`] (`mode` + `direction`). For each edge around the current node a
//! pure decision function, [`classify`], says whether the edge is dropped,
//! rejected into a side set, or accepted (and with which continuation).
//! The same machine runs over entity instances and over meta-graph types;
//! only the [`TraversalSource`] differs.
//!
//! | Mode | Accepts | Continues |
//! |------|---------|-----------|
//! | `Fresh` | flow, containment, capability | per edge kind |
//! | `Feeds` | flow edges in the current direction | `Feeds` |
//! | `PhysicalGreater` | outgoing containment | `PhysicalGreater` |
//! | `PartsOf` | incoming `isPartOf` | `PartsOf` |
//! | `IsCapabilityOf` | see [`classify`] | `Fresh` rules |
//!
//! Reaching a zone type through flow or outgoing containment resets the mode
//! to `Fresh`, which lets a supply chain bounce through a zone.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::TraversalConfig;
use crate::error::AppError;
use crate::graph::Graph;
use crate::models::{AdjacencyEntry, EdgeLabel};
use crate::services::ModelGraph;
use crate::symbols::{
    RelationKind, RelationTable, TypeSet, FEEDS, HOSTED_BY, IS_MEASURE_OF, IS_PART_OF, LOCATED_IN,
};

// ============================================================================
// State machine
// ============================================================================

/// What kind of exploration a queued node continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Examine every edge kind.
    Fresh,
    /// Follow a supply chain up- or downstream.
    Feeds,
    /// Walk outward through containers.
    PhysicalGreater,
    /// Walk inward through parts of a zone.
    PartsOf,
    /// Arrived through a capability link.
    IsCapabilityOf,
}

/// Direction of travel relative to the chain being followed.
///
/// For flows `Forward` is downstream; for capabilities `Forward` means we
/// went from a capability to its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Forward,
    Backward,
}

/// Whether an edge leaves or enters the node being expanded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct State {
    pub mode: Mode,
    pub direction: Direction,
}

impl State {
    pub const FRESH: State = State {
        mode: Mode::Fresh,
        direction: Direction::Forward,
    };

    pub const fn new(mode: Mode, direction: Direction) -> Self {
        Self { mode, direction }
    }
}

/// How an accepted edge is written into the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emit {
    AsStored,
    /// Flip a reverse flow into `upstream feeds downstream`.
    Feeds,
    /// Relabel a capability of a top-level container.
    MeasureOf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Dropped entirely: not in the result, not traversed.
    Exclude,
    /// Kept aside for the second-chance pass.
    Reject,
    Accept { emit: Emit, next: Option<State> },
}

/// An edge as seen from the node being expanded.
#[derive(Debug, Clone, Copy)]
pub struct EdgeView<'a> {
    pub relation: &'a str,
    pub orientation: Orientation,
    pub near_is_zone: bool,
    pub near_is_top_level: bool,
    pub far_is_zone: bool,
    pub far_is_top_level: bool,
}

/// Decides what happens to `edge` when expanding a node in `state`.
pub fn classify(relations: &RelationTable, edge: &EdgeView<'_>, state: State) -> Decision {
    let kind = relations.kind(edge.relation);
    if kind == RelationKind::Excluded {
        return Decision::Exclude;
    }

    match state.mode {
        Mode::Fresh => fresh(kind, edge),
        Mode::Feeds => match kind {
            RelationKind::Flow if flow_direction(edge) == state.direction => accept_flow(edge),
            _ => Decision::Reject,
        },
        Mode::PhysicalGreater => match (kind, edge.orientation) {
            (RelationKind::Containment, Orientation::Outgoing) => containment_outward(edge),
            _ => Decision::Reject,
        },
        Mode::PartsOf => match edge.orientation {
            Orientation::Incoming if edge.relation == IS_PART_OF => Decision::Accept {
                emit: Emit::AsStored,
                next: Some(State::new(Mode::PartsOf, Direction::Backward)),
            },
            _ => Decision::Reject,
        },
        Mode::IsCapabilityOf => match state.direction {
            // At a capability reached from its owner: only look for other owners.
            Direction::Backward => match (kind, edge.orientation) {
                (RelationKind::Capability, Orientation::Outgoing) => fresh(kind, edge),
                _ => Decision::Reject,
            },
            // At an owner reached from one of its capabilities.
            Direction::Forward => match (kind, edge.orientation) {
                (RelationKind::Capability, Orientation::Incoming) => Decision::Reject,
                (_, Orientation::Outgoing) if edge.relation == HOSTED_BY => Decision::Reject,
                _ => fresh(kind, edge),
            },
        },
    }
}

fn fresh(kind: RelationKind, edge: &EdgeView<'_>) -> Decision {
    match (kind, edge.orientation) {
        (RelationKind::Flow, _) => accept_flow(edge),
        (RelationKind::Containment, Orientation::Outgoing) => containment_outward(edge),
        (RelationKind::Containment, Orientation::Incoming) => {
            let next = (edge.near_is_zone && edge.relation == IS_PART_OF)
                .then_some(State::new(Mode::PartsOf, Direction::Backward));
            Decision::Accept {
                emit: Emit::AsStored,
                next,
            }
        }
        (RelationKind::Capability, Orientation::Outgoing) if edge.far_is_top_level => {
            Decision::Accept {
                emit: Emit::MeasureOf,
                next: None,
            }
        }
        (RelationKind::Capability, Orientation::Incoming) if edge.near_is_top_level => {
            Decision::Accept {
                emit: Emit::MeasureOf,
                next: None,
            }
        }
        (RelationKind::Capability, Orientation::Outgoing) => Decision::Accept {
            emit: Emit::AsStored,
            next: Some(State::new(Mode::IsCapabilityOf, Direction::Forward)),
        },
        (RelationKind::Capability, Orientation::Incoming) => Decision::Accept {
            emit: Emit::AsStored,
            next: Some(State::new(Mode::IsCapabilityOf, Direction::Backward)),
        },
        _ => Decision::Reject,
    }
}

fn flow_direction(edge: &EdgeView<'_>) -> Direction {
    let reverse = RelationTable::is_reverse_flow(edge.relation);
    match (edge.orientation, reverse) {
        (Orientation::Outgoing, false) | (Orientation::Incoming, true) => Direction::Forward,
        (Orientation::Incoming, false) | (Orientation::Outgoing, true) => Direction::Backward,
    }
}

fn accept_flow(edge: &EdgeView<'_>) -> Decision {
    let next = if edge.far_is_zone {
        State::FRESH
    } else {
        State::new(Mode::Feeds, flow_direction(edge))
    };
    let emit = if RelationTable::is_reverse_flow(edge.relation) {
        Emit::Feeds
    } else {
        Emit::AsStored
    };
    Decision::Accept {
        emit,
        next: Some(next),
    }
}

fn containment_outward(edge: &EdgeView<'_>) -> Decision {
    let next = if edge.far_is_zone {
        State::FRESH
    } else {
        State::new(Mode::PhysicalGreater, Direction::Forward)
    };
    Decision::Accept {
        emit: Emit::AsStored,
        next: Some(next),
    }
}

/// Writes a stored edge in result form: reverse flows become
/// `upstream feeds downstream`.
pub fn normalize(source: &str, relation: &str, target: &str) -> (String, String, String) {
    if RelationTable::is_reverse_flow(relation) {
        (target.to_string(), FEEDS.to_string(), source.to_string())
    } else {
        (source.to_string(), relation.to_string(), target.to_string())
    }
}

// ============================================================================
// Policy
// ============================================================================

/// Relation table, type roles and limits shared by both traversal levels.
#[derive(Debug, Clone)]
pub struct TraversalPolicy {
    pub relations: RelationTable,
    pub zones: TypeSet,
    pub top_level: TypeSet,
    pub step_budget: usize,
    pub instance_second_chance: bool,
}

impl TraversalPolicy {
    pub fn from_config(config: &TraversalConfig) -> Self {
        Self {
            relations: RelationTable::from_config(config),
            zones: TypeSet::new(&config.zone_types),
            top_level: TypeSet::new(&config.top_level_types),
            step_budget: config.step_budget,
            instance_second_chance: config.instance_second_chance,
        }
    }
}

impl Default for TraversalPolicy {
    fn default() -> Self {
        Self::from_config(&TraversalConfig::default())
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Read access to the graph being traversed.
#[async_trait]
pub trait TraversalSource: Send + Sync {
    /// Payload stored for each result node.
    type Node: Clone + Send + Sync + 'static;

    async fn node(&self, id: &str) -> Result<Option<Self::Node>, AppError>;

    fn type_of(node: &Self::Node) -> &str;

    /// Outgoing edges; `neighbor` is the target.
    async fn forward(&self, id: &str) -> Result<Vec<AdjacencyEntry>, AppError>;

    /// Incoming edges; `neighbor` is the source.
    async fn backward(&self, id: &str) -> Result<Vec<AdjacencyEntry>, AppError>;
}

/// Result of one traversal.
#[derive(Debug, Clone)]
pub struct Traversal<N> {
    pub graph: Graph<N, EdgeLabel>,
    /// Dequeued items, including already-seen ones.
    pub steps: usize,
    pub truncated: bool,
}

struct Walker<'a, S: TraversalSource + ?Sized> {
    source: &'a S,
    policy: &'a TraversalPolicy,
    model: Option<Arc<ModelGraph>>,
    nodes: HashMap<String, Option<S::Node>>,
}

impl<'a, S: TraversalSource + ?Sized> Walker<'a, S> {
    async fn lookup(&mut self, id: &str) -> Result<Option<S::Node>, AppError> {
        if let Some(found) = self.nodes.get(id) {
            return Ok(found.clone());
        }
        let found = self.source.node(id).await?;
        self.nodes.insert(id.to_string(), found.clone());
        Ok(found)
    }

    fn is_zone(&self, node: &S::Node) -> bool {
        self.policy.zones.matches(S::type_of(node), self.model.as_deref())
    }

    fn is_top_level(&self, node: &S::Node) -> bool {
        self.policy
            .top_level
            .matches(S::type_of(node), self.model.as_deref())
    }
}

/// Runs the traversal from `seeds`.
///
/// `second_chance` re-admits rejected edges whose endpoints both ended up in
/// the result. Co-location (`locatedIn`) edges never get a second chance.
pub async fn traverse<S>(
    source: &S,
    policy: &TraversalPolicy,
    model: Option<Arc<ModelGraph>>,
    seeds: &[String],
    second_chance: bool,
) -> Result<Traversal<S::Node>, AppError>
where
    S: TraversalSource + ?Sized,
{
    let mut walker = Walker {
        source,
        policy,
        model,
        nodes: HashMap::new(),
    };
    let mut result: Graph<S::Node, EdgeLabel> = Graph::new();
    let mut rejected: Graph<(), EdgeLabel> = Graph::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<(String, usize, State)> = seeds
        .iter()
        .map(|seed| (seed.clone(), 0, State::FRESH))
        .collect();
    let mut steps = 0usize;
    let mut truncated = false;

    while let Some((id, distance, state)) = queue.pop_front() {
        if steps >= policy.step_budget {
            tracing::warn!(
                steps,
                queued = queue.len() + 1,
                nodes = result.node_count(),
                "graph traversal hit step budget, result truncated"
            );
            truncated = true;
            break;
        }
        steps += 1;

        if !seen.insert(id.clone()) {
            continue;
        }
        let Some(near) = walker.lookup(&id).await? else {
            tracing::debug!(node = %id, "node not found, skipped");
            continue;
        };
        let near_is_zone = walker.is_zone(&near);
        let near_is_top_level = walker.is_top_level(&near);
        result.add_node(id.clone(), near);

        let outgoing = source.forward(&id).await?;
        let incoming = source.backward(&id).await?;
        let edges = outgoing
            .into_iter()
            .map(|entry| (Orientation::Outgoing, entry))
            .chain(incoming.into_iter().map(|entry| (Orientation::Incoming, entry)));

        for (orientation, entry) in edges {
            let Some(far) = walker.lookup(&entry.neighbor).await? else {
                continue;
            };
            let view = EdgeView {
                relation: &entry.relation,
                orientation,
                near_is_zone,
                near_is_top_level,
                far_is_zone: walker.is_zone(&far),
                far_is_top_level: walker.is_top_level(&far),
            };
            let (stored_source, stored_target) = match orientation {
                Orientation::Outgoing => (id.as_str(), entry.neighbor.as_str()),
                Orientation::Incoming => (entry.neighbor.as_str(), id.as_str()),
            };

            match classify(&policy.relations, &view, state) {
                Decision::Exclude => {}
                Decision::Reject => {
                    if entry.relation != LOCATED_IN {
                        let (start, relation, end) =
                            normalize(stored_source, &entry.relation, stored_target);
                        rejected.add_statement(
                            &start,
                            EdgeLabel::new(relation, entry.substance.clone()),
                            &end,
                        );
                    }
                }
                Decision::Accept { emit, next } => {
                    let (start, relation, end) = match emit {
                        Emit::AsStored => (
                            stored_source.to_string(),
                            entry.relation.clone(),
                            stored_target.to_string(),
                        ),
                        Emit::Feeds => normalize(stored_source, &entry.relation, stored_target),
                        Emit::MeasureOf => (
                            stored_source.to_string(),
                            IS_MEASURE_OF.to_string(),
                            stored_target.to_string(),
                        ),
                    };
                    result.add_node(entry.neighbor.clone(), far);
                    result.add_statement(
                        &start,
                        EdgeLabel::new(relation, entry.substance.clone()),
                        &end,
                    );
                    if let Some(next) = next {
                        queue.push_back((entry.neighbor.clone(), distance + 1, next));
                    }
                }
            }
        }
    }

    if second_chance {
        let mut readmitted = 0usize;
        for statement in rejected.statements() {
            if result.contains_node(&statement.start)
                && result.contains_node(&statement.end)
                && result.add_statement(&statement.start, statement.predicate.clone(), &statement.end)
            {
                readmitted += 1;
            }
        }
        tracing::debug!(readmitted, "second-chance edges added");
    }

    Ok(Traversal {
        graph: result,
        steps,
        truncated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(relation: &str, orientation: Orientation) -> EdgeView<'_> {
        EdgeView {
            relation,
            orientation,
            near_is_zone: false,
            near_is_top_level: false,
            far_is_zone: false,
            far_is_top_level: false,
        }
    }

    fn next_of(decision: Decision) -> Option<State> {
        match decision {
            Decision::Accept { next, .. } => next,
            other => panic!("expected accept, got {other:?}"),
        }
    }

    const FEEDS_UP: State = State::new(Mode::Feeds, Direction::Backward);
    const FEEDS_DOWN: State = State::new(Mode::Feeds, Direction::Forward);

    #[test]
    fn test_excluded_always_dropped() {
        let table = RelationTable::default();
        for state in [State::FRESH, FEEDS_UP, State::new(Mode::PhysicalGreater, Direction::Forward)] {
            assert_eq!(
                classify(&table, &view("hasDocument", Orientation::Outgoing), state),
                Decision::Exclude
            );
        }
    }

    #[test]
    fn test_flow_directions_from_fresh() {
        let table = RelationTable::default();
        // current feeds far: far is downstream
        assert_eq!(
            classify(&table, &view("feeds", Orientation::Outgoing), State::FRESH),
            Decision::Accept {
                emit: Emit::AsStored,
                next: Some(FEEDS_DOWN)
            }
        );
        // far feeds current: far is upstream
        assert_eq!(
            next_of(classify(&table, &view("feeds", Orientation::Incoming), State::FRESH)),
            Some(FEEDS_UP)
        );
        // current isFedBy far: far is upstream, edge is flipped
        assert_eq!(
            classify(&table, &view("isFedBy", Orientation::Outgoing), State::FRESH),
            Decision::Accept {
                emit: Emit::Feeds,
                next: Some(FEEDS_UP)
            }
        );
        assert_eq!(
            next_of(classify(&table, &view("isFedBy", Orientation::Incoming), State::FRESH)),
            Some(FEEDS_DOWN)
        );
    }

    #[test]
    fn test_feeds_mode_keeps_direction() {
        let table = RelationTable::default();
        assert_eq!(
            next_of(classify(&table, &view("feedsWater", Orientation::Incoming), FEEDS_UP)),
            Some(FEEDS_UP)
        );
        assert_eq!(
            classify(&table, &view("feeds", Orientation::Outgoing), FEEDS_UP),
            Decision::Reject
        );
        assert_eq!(
            classify(&table, &view("isPartOf", Orientation::Outgoing), FEEDS_UP),
            Decision::Reject
        );
    }

    #[test]
    fn test_zone_resets_mode() {
        let table = RelationTable::default();
        let mut edge = view("isPartOf", Orientation::Outgoing);
        assert_eq!(
            next_of(classify(&table, &edge, State::FRESH)),
            Some(State::new(Mode::PhysicalGreater, Direction::Forward))
        );
        edge.far_is_zone = true;
        assert_eq!(next_of(classify(&table, &edge, State::FRESH)), Some(State::FRESH));

        let mut flow = view("feeds", Orientation::Outgoing);
        flow.far_is_zone = true;
        assert_eq!(next_of(classify(&table, &flow, FEEDS_DOWN)), Some(State::FRESH));
    }

    #[test]
    fn test_physical_greater_only_goes_outward() {
        let table = RelationTable::default();
        let state = State::new(Mode::PhysicalGreater, Direction::Forward);
        assert!(matches!(
            classify(&table, &view("locatedIn", Orientation::Outgoing), state),
            Decision::Accept { .. }
        ));
        assert_eq!(
            classify(&table, &view("isPartOf", Orientation::Incoming), state),
            Decision::Reject
        );
        assert_eq!(
            classify(&table, &view("feeds", Orientation::Outgoing), state),
            Decision::Reject
        );
    }

    #[test]
    fn test_incoming_containment_not_followed() {
        let table = RelationTable::default();
        assert_eq!(
            classify(&table, &view("isPartOf", Orientation::Incoming), State::FRESH),
            Decision::Accept {
                emit: Emit::AsStored,
                next: None
            }
        );
        let mut zone = view("isPartOf", Orientation::Incoming);
        zone.near_is_zone = true;
        assert_eq!(
            next_of(classify(&table, &zone, State::FRESH)),
            Some(State::new(Mode::PartsOf, Direction::Backward))
        );
    }

    #[test]
    fn test_capability_rules() {
        let table = RelationTable::default();
        let owner = State::new(Mode::IsCapabilityOf, Direction::Forward);
        let capability = State::new(Mode::IsCapabilityOf, Direction::Backward);

        assert_eq!(
            next_of(classify(&table, &view("isCapabilityOf", Orientation::Outgoing), State::FRESH)),
            Some(owner)
        );
        assert_eq!(
            next_of(classify(&table, &view("isCapabilityOf", Orientation::Incoming), State::FRESH)),
            Some(capability)
        );

        let mut building = view("isCapabilityOf", Orientation::Outgoing);
        building.far_is_top_level = true;
        assert_eq!(
            classify(&table, &building, State::FRESH),
            Decision::Accept {
                emit: Emit::MeasureOf,
                next: None
            }
        );

        // at the owner: no sibling capabilities, no hostedBy
        assert_eq!(
            classify(&table, &view("isCapabilityOf", Orientation::Incoming), owner),
            Decision::Reject
        );
        assert_eq!(
            classify(&table, &view("hostedBy", Orientation::Outgoing), owner),
            Decision::Reject
        );
        assert_eq!(
            next_of(classify(&table, &view("feeds", Orientation::Outgoing), owner)),
            Some(FEEDS_DOWN)
        );

        // at a capability: only its other owners
        assert!(matches!(
            classify(&table, &view("isCapabilityOf", Orientation::Outgoing), capability),
            Decision::Accept { .. }
        ));
        assert_eq!(
            classify(&table, &view("feeds", Orientation::Outgoing), capability),
            Decision::Reject
        );
    }

    #[test]
    fn test_other_relations_rejected() {
        let table = RelationTable::default();
        assert_eq!(
            classify(&table, &view("monitors", Orientation::Outgoing), State::FRESH),
            Decision::Reject
        );
    }

    #[test]
    fn test_normalize() {
        assert_eq!(
            normalize("A", "isFedBy", "B"),
            ("B".to_string(), "feeds".to_string(), "A".to_string())
        );
        assert_eq!(
            normalize("A", "isPartOf", "B"),
            ("A".to_string(), "isPartOf".to_string(), "B".to_string())
        );
    }
}
