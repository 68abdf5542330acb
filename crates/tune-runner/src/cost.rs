//! Hourly cost and cost-efficiency. Pure functions over a [`ResourceShape`]
//! and provider pricing data.

use crate::config::ResourceShape;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingTable {
    /// Per vCPU per hour.
    pub cpu_rate: f64,
    /// Per GB of RAM per hour.
    pub ram_rate: f64,
    /// Per GB of drive per hour, keyed by drive type.
    #[serde(default)]
    pub drive_rates: BTreeMap<String, f64>,
    #[serde(default = "default_fallback_drive_rate")]
    pub fallback_drive_rate: f64,
}

fn default_fallback_drive_rate() -> f64 {
    0.01
}

impl PricingTable {
    pub fn drive_rate(&self, kind: &str) -> f64 {
        self.drive_rates
            .get(kind)
            .copied()
            .unwrap_or(self.fallback_drive_rate)
    }
}

/// Minimum RAM (GB) per vCPU count offered by the provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderConstraints {
    #[serde(default)]
    pub min_ram_gb_by_cpu: BTreeMap<u32, u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DerivedMetrics {
    pub cost_per_hour: f64,
    pub cost_efficiency: f64,
}

pub fn cost_per_hour(shape: &ResourceShape, pricing: &PricingTable) -> f64 {
    let storage: f64 = shape
        .drives
        .iter()
        .map(|d| f64::from(d.count) * f64::from(d.size_gb) * pricing.drive_rate(&d.kind))
        .sum();
    let per_node = f64::from(shape.cpu_per_node) * pricing.cpu_rate
        + f64::from(shape.ram_gb_per_node) * pricing.ram_rate
        + storage;
    f64::from(shape.nodes) * per_node
}

pub fn cost_efficiency(throughput: f64, cost_per_hour: f64) -> f64 {
    if cost_per_hour > 0.0 {
        throughput / cost_per_hour
    } else {
        0.0
    }
}

pub fn derive(shape: &ResourceShape, pricing: &PricingTable, throughput: f64) -> DerivedMetrics {
    let cost = cost_per_hour(shape, pricing);
    DerivedMetrics {
        cost_per_hour: cost,
        cost_efficiency: cost_efficiency(throughput, cost),
    }
}

pub fn validate_shape(
    shape: &ResourceShape,
    constraints: &ProviderConstraints,
    provider: &str,
) -> Result<(), ConfigError> {
    let min_ram = constraints
        .min_ram_gb_by_cpu
        .get(&shape.cpu_per_node)
        .copied()
        .unwrap_or(0);
    if shape.ram_gb_per_node < min_ram {
        return Err(ConfigError::Infeasible {
            provider: provider.to_string(),
            reason: format!(
                "{} vCPU requires at least {}GB RAM (requested {}GB)",
                shape.cpu_per_node, min_ram, shape.ram_gb_per_node
            ),
        });
    }
    Ok(())
}
