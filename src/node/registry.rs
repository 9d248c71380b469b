use dashmap::DashMap;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

use super::health::{HealthStatus, HealthThresholds};
use super::Node;
use crate::error::{Error, Result};

/// Criterio de ordenamiento para [`NodeRegistry::least_used`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMetric {
    Players,
    PlayingPlayers,
    Calls,
    Cpu,
    Memory,
    Penalty,
}

/// Conjunto de nodos del manager, indexado por id.
pub struct NodeRegistry {
    nodes: DashMap<String, Arc<Node>>,
    thresholds: HealthThresholds,
}

impl NodeRegistry {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self {
            nodes: DashMap::new(),
            thresholds,
        }
    }

    pub(crate) fn insert(&self, node: Arc<Node>) -> Result<()> {
        match self.nodes.entry(node.id().to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::Invalid(format!(
                "node {} is already registered",
                node.id()
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(node);
                Ok(())
            }
        }
    }

    pub(crate) fn remove(&self, id: &str) -> Option<Arc<Node>> {
        self.nodes.remove(id).map(|(_, node)| node)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Node>> {
        self.nodes.get(id).map(|entry| entry.value().clone())
    }

    /// Every node, sorted by id.
    pub fn all(&self) -> Vec<Arc<Node>> {
        let mut nodes: Vec<Arc<Node>> = self.nodes.iter().map(|e| e.value().clone()).collect();
        nodes.sort_by(|a, b| a.id().cmp(b.id()));
        nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn thresholds(&self) -> &HealthThresholds {
        &self.thresholds
    }

    pub fn health(&self, node: &Node) -> HealthStatus {
        node.health(&self.thresholds)
    }

    /// Connected nodes, ascending by `metric`.
    pub fn least_used(&self, metric: LoadMetric) -> Vec<Arc<Node>> {
        let mut scored: Vec<(f64, Arc<Node>)> = self
            .all()
            .into_iter()
            .filter(|node| node.is_connected())
            .map(|node| (self.score(&node, metric), node))
            .collect();

        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));
        scored.into_iter().map(|(_, node)| node).collect()
    }

    fn score(&self, node: &Node, metric: LoadMetric) -> f64 {
        match metric {
            LoadMetric::Players => node.stats().players as f64,
            LoadMetric::PlayingPlayers => node.stats().playing_players as f64,
            LoadMetric::Calls => node.calls() as f64,
            LoadMetric::Cpu => {
                let stats = node.stats();
                if stats.cpu.cores == 0 {
                    stats.cpu.system_load
                } else {
                    stats.cpu.system_load / stats.cpu.cores as f64
                }
            }
            LoadMetric::Memory => node.stats().memory.used as f64,
            LoadMetric::Penalty => self.health(node).penalty,
        }
    }

    /// Lowest-penalty connected node, skipping `exclude`.
    pub fn best_node(&self, exclude: Option<&str>) -> Option<Arc<Node>> {
        self.least_used(LoadMetric::Penalty)
            .into_iter()
            .find(|node| Some(node.id()) != exclude)
    }

    /// Best node serving `region`; any connected node when none does.
    pub fn best_node_in_region(&self, region: Option<&str>) -> Option<Arc<Node>> {
        let candidates = self.least_used(LoadMetric::Penalty);
        if let Some(region) = region {
            if let Some(node) = candidates.iter().find(|n| n.serves_region(region)) {
                return Some(node.clone());
            }
            debug!("Ningún nodo sirve la región {}, usando el mejor disponible", region);
        }
        candidates.into_iter().next()
    }
}
