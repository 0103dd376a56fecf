//! Road network graph for the traffic simulation
//!
//! Entry points, crossings and exits joined by one-way roads. Every road
//! knows how long it takes to travel and by which approach a vehicle joins
//! the queue at its far end.

use anyhow::{bail, Context, Result};
use ordered_float::OrderedFloat;
use petgraph::algo::astar;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::types::Direction;

/// Role of a node in the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeKind {
    Entry,
    Crossing,
    Exit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    pub kind: NodeKind,
}

/// A one-way road
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoadSpec {
    pub from: String,
    pub to: String,
    /// Simulated seconds for a car; scaled by vehicle type
    pub travel_time: f64,
    /// Queue joined at `to`
    pub approach: Direction,
}

/// Edge data for the road network graph
#[derive(Debug, Clone, Copy)]
pub struct RoadEdge {
    pub travel_time: f64,
    pub approach: Direction,
}

/// Directed road graph built once from configuration
#[derive(Debug, Default)]
pub struct RoadTopology {
    graph: DiGraph<NodeSpec, RoadEdge>,
    node_index: HashMap<String, NodeIndex>,
}

impl RoadTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_specs(nodes: &[NodeSpec], roads: &[RoadSpec]) -> Result<Self> {
        let mut topology = Self::new();
        for node in nodes {
            topology.add_node(node.clone())?;
        }
        for road in roads {
            topology
                .add_road(road)
                .with_context(|| format!("invalid road {} -> {}", road.from, road.to))?;
        }
        Ok(topology)
    }

    pub fn add_node(&mut self, node: NodeSpec) -> Result<()> {
        if self.node_index.contains_key(&node.id) {
            bail!("duplicate node {}", node.id);
        }
        let id = node.id.clone();
        let index = self.graph.add_node(node);
        self.node_index.insert(id, index);
        Ok(())
    }

    pub fn add_road(&mut self, road: &RoadSpec) -> Result<()> {
        let from = *self
            .node_index
            .get(&road.from)
            .with_context(|| format!("node {} not found", road.from))?;
        let to = *self
            .node_index
            .get(&road.to)
            .with_context(|| format!("node {} not found", road.to))?;
        if road.travel_time < 0.0 {
            bail!("negative travel time");
        }
        if road.approach == Direction::Pedestrian {
            bail!("roads cannot join the pedestrian phase");
        }
        self.graph.update_edge(
            from,
            to,
            RoadEdge {
                travel_time: road.travel_time,
                approach: road.approach,
            },
        );
        Ok(())
    }

    pub fn kind(&self, node: &str) -> Option<NodeKind> {
        self.node_index.get(node).map(|index| self.graph[*index].kind)
    }

    pub fn is_exit(&self, node: &str) -> bool {
        self.kind(node) == Some(NodeKind::Exit)
    }

    pub fn road(&self, from: &str, to: &str) -> Option<RoadEdge> {
        let from = self.node_index.get(from)?;
        let to = self.node_index.get(to)?;
        let edge = self.graph.find_edge(*from, *to)?;
        Some(self.graph[edge])
    }

    /// Queue a vehicle joins when arriving at `to` from `from`
    pub fn approach(&self, from: &str, to: &str) -> Option<Direction> {
        self.road(from, to).map(|road| road.approach)
    }

    pub fn travel_time(&self, from: &str, to: &str) -> Option<f64> {
        self.road(from, to).map(|road| road.travel_time)
    }

    /// Ids of all nodes of one kind
    pub fn nodes_of_kind(&self, kind: NodeKind) -> Vec<String> {
        self.graph
            .node_weights()
            .filter(|node| node.kind == kind)
            .map(|node| node.id.clone())
            .collect()
    }

    /// Fastest path from `start` to any exit, both ends included
    pub fn shortest_exit_path(&self, start: &str) -> Option<Vec<String>> {
        let start = *self.node_index.get(start)?;
        let (_, path) = astar(
            &self.graph,
            start,
            |node| self.graph[node].kind == NodeKind::Exit,
            |edge| OrderedFloat(edge.weight().travel_time),
            |_| OrderedFloat(0.0), // Null heuristic = Dijkstra
        )?;
        Some(path.into_iter().map(|index| self.graph[index].id.clone()).collect())
    }

    /// Checks that consecutive nodes of `path` are joined by roads
    pub fn validate_path(&self, path: &[String]) -> Result<()> {
        if path.len() < 2 {
            bail!("path must hold at least an entry and an exit");
        }
        for pair in path.windows(2) {
            if self.road(&pair[0], &pair[1]).is_none() {
                bail!("no road from {} to {}", pair[0], pair[1]);
            }
        }
        Ok(())
    }
}
