//! Per-request region selection.
//!
//! Rules are evaluated in priority order (lower value first) and the first
//! enabled rule whose conditions all match wins, provided its target region is
//! active. When no rule matches, the configured strategy decides, with a
//! fallback chain of latency → geo → failover.

use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RegionError;
use crate::types::{RegionDefinition, RegionRole};

/// Fallback strategy used when no routing rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// Lowest observed client latency among active regions; falls back to geo
    /// when no latency has been observed.
    Latency,
    /// Same-country match; falls back to failover.
    Geo,
    /// The active primary, else any active region.
    Failover,
    /// Uniform random pick among active regions.
    RoundRobin,
    /// Weight-biased random pick among active regions.
    Weighted,
}

impl std::fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutingStrategy::Latency => write!(f, "latency"),
            RoutingStrategy::Geo => write!(f, "geo"),
            RoutingStrategy::Failover => write!(f, "failover"),
            RoutingStrategy::RoundRobin => write!(f, "round_robin"),
            RoutingStrategy::Weighted => write!(f, "weighted"),
        }
    }
}

/// Request attribute a rule condition inspects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleField {
    /// The request's country.
    Geo,
    /// A named request header.
    Header(String),
    /// The request path.
    Path,
}

/// Predicate applied to the selected field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOp {
    /// Field equals the value.
    Eq(String),
    /// Field differs from the value.
    Neq(String),
    /// Field contains the value.
    Contains(String),
    /// Field starts with the value.
    StartsWith(String),
    /// Field is one of the values.
    In(Vec<String>),
}

/// One predicate of a routing rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleCondition {
    /// The request attribute inspected.
    pub field: RuleField,
    /// The predicate applied to it.
    pub op: RuleOp,
}

impl RuleCondition {
    fn matches(&self, ctx: &RequestContext) -> bool {
        let value = match &self.field {
            RuleField::Geo => ctx.country.as_deref(),
            RuleField::Path => ctx.path.as_deref(),
            RuleField::Header(name) => ctx.headers.get(name).map(String::as_str),
        };
        let Some(value) = value else {
            return false;
        };
        match &self.op {
            RuleOp::Eq(v) => value == v,
            RuleOp::Neq(v) => value != v,
            RuleOp::Contains(v) => value.contains(v.as_str()),
            RuleOp::StartsWith(v) => value.starts_with(v.as_str()),
            RuleOp::In(vs) => vs.iter().any(|v| v == value),
        }
    }
}

/// A pinning rule mapping matching requests to a target region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Rule id, reported in routing decisions.
    pub id: String,
    /// Evaluation order; lower values are evaluated first.
    pub priority: u32,
    /// Disabled rules are skipped.
    pub enabled: bool,
    /// Conditions that must all match. An empty list matches every request.
    pub conditions: Vec<RuleCondition>,
    /// Region matching requests are sent to.
    pub target_region: String,
}

impl RoutingRule {
    fn matches(&self, ctx: &RequestContext) -> bool {
        self.enabled && self.conditions.iter().all(|c| c.matches(ctx))
    }
}

/// Attributes of the request being routed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Country the request originates from.
    pub country: Option<String>,
    /// Request path.
    pub path: Option<String>,
    /// Request headers.
    pub headers: HashMap<String, String>,
}

impl RequestContext {
    /// An empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the originating country.
    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    /// Set the request path.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Add a request header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// The outcome of routing one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Chosen region.
    pub region_id: String,
    /// Strategy that produced the decision.
    pub strategy: RoutingStrategy,
    /// Rule that matched, if any.
    pub matched_rule: Option<String>,
}

/// Rule table plus strategy fallback over a region snapshot.
///
/// Pure routing logic: the caller supplies the current regions and observed
/// latencies, which keeps the router trivially testable.
#[derive(Debug, Clone)]
pub struct RequestRouter {
    rules: Vec<RoutingRule>,
    strategy: RoutingStrategy,
    weights: HashMap<String, u32>,
}

impl RequestRouter {
    /// Create a router with the given fallback strategy.
    pub fn new(strategy: RoutingStrategy) -> Self {
        Self {
            rules: Vec::new(),
            strategy,
            weights: HashMap::new(),
        }
    }

    /// Add a rule, keeping the table sorted by priority.
    pub fn add_rule(&mut self, rule: RoutingRule) {
        self.rules.push(rule);
        self.rules.sort_by_key(|r| r.priority);
    }

    /// Remove a rule by id. Returns whether it existed.
    pub fn remove_rule(&mut self, rule_id: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.id != rule_id);
        self.rules.len() != before
    }

    /// The current rule table, in evaluation order.
    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    /// Change the fallback strategy.
    pub fn set_strategy(&mut self, strategy: RoutingStrategy) {
        self.strategy = strategy;
    }

    /// The current fallback strategy.
    pub fn strategy(&self) -> RoutingStrategy {
        self.strategy
    }

    /// Set the weight used by [`RoutingStrategy::Weighted`]. Unset regions
    /// weigh 1.
    pub fn set_weight(&mut self, region_id: impl Into<String>, weight: u32) {
        self.weights.insert(region_id.into(), weight);
    }

    /// Route one request against a region snapshot.
    pub fn route(
        &self,
        ctx: &RequestContext,
        regions: &[RegionDefinition],
        latencies: &HashMap<String, u64>,
    ) -> Result<RoutingDecision, RegionError> {
        let active: Vec<&RegionDefinition> = regions.iter().filter(|r| r.is_active()).collect();

        for rule in &self.rules {
            if rule.matches(ctx) {
                if active.iter().any(|r| r.id == rule.target_region) {
                    return Ok(RoutingDecision {
                        region_id: rule.target_region.clone(),
                        strategy: self.strategy,
                        matched_rule: Some(rule.id.clone()),
                    });
                }
                debug!(
                    rule = %rule.id,
                    target = %rule.target_region,
                    "matched rule targets an inactive region, continuing"
                );
            }
        }

        if active.is_empty() {
            return Err(RegionError::NoActiveRegion);
        }
        self.by_strategy(self.strategy, ctx, &active, latencies)
    }

    fn by_strategy(
        &self,
        strategy: RoutingStrategy,
        ctx: &RequestContext,
        active: &[&RegionDefinition],
        latencies: &HashMap<String, u64>,
    ) -> Result<RoutingDecision, RegionError> {
        match strategy {
            RoutingStrategy::Latency => {
                let fastest = active
                    .iter()
                    .filter_map(|r| latencies.get(&r.id).map(|l| (*l, &r.id)))
                    .min();
                match fastest {
                    Some((_, region_id)) => Ok(RoutingDecision {
                        region_id: region_id.clone(),
                        strategy: RoutingStrategy::Latency,
                        matched_rule: None,
                    }),
                    None => self.by_strategy(RoutingStrategy::Geo, ctx, active, latencies),
                }
            }
            RoutingStrategy::Geo => {
                let same_country = ctx.country.as_deref().and_then(|country| {
                    active
                        .iter()
                        .filter(|r| r.location.country == country)
                        .map(|r| &r.id)
                        .min()
                });
                match same_country {
                    Some(region_id) => Ok(RoutingDecision {
                        region_id: region_id.clone(),
                        strategy: RoutingStrategy::Geo,
                        matched_rule: None,
                    }),
                    None => self.by_strategy(RoutingStrategy::Failover, ctx, active, latencies),
                }
            }
            RoutingStrategy::Failover => {
                let chosen = active
                    .iter()
                    .find(|r| r.role == RegionRole::Primary)
                    .map(|r| &r.id)
                    // Deterministic pick when no primary is active.
                    .or_else(|| active.iter().map(|r| &r.id).min());
                match chosen {
                    Some(region_id) => Ok(RoutingDecision {
                        region_id: region_id.clone(),
                        strategy: RoutingStrategy::Failover,
                        matched_rule: None,
                    }),
                    None => Err(RegionError::NoActiveRegion),
                }
            }
            RoutingStrategy::RoundRobin => {
                let idx = rand::thread_rng().gen_range(0..active.len());
                Ok(RoutingDecision {
                    region_id: active[idx].id.clone(),
                    strategy: RoutingStrategy::RoundRobin,
                    matched_rule: None,
                })
            }
            RoutingStrategy::Weighted => {
                let weights: Vec<u64> = active
                    .iter()
                    .map(|r| u64::from(*self.weights.get(&r.id).unwrap_or(&1)))
                    .collect();
                let total: u64 = weights.iter().sum();
                if total == 0 {
                    return self.by_strategy(RoutingStrategy::RoundRobin, ctx, active, latencies);
                }
                let mut pick = rand::thread_rng().gen_range(0..total);
                let mut chosen = &active[active.len() - 1].id;
                for (region, weight) in active.iter().zip(weights) {
                    if pick < weight {
                        chosen = &region.id;
                        break;
                    }
                    pick -= weight;
                }
                Ok(RoutingDecision {
                    region_id: chosen.clone(),
                    strategy: RoutingStrategy::Weighted,
                    matched_rule: None,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RegionStatus;

    fn regions() -> Vec<RegionDefinition> {
        vec![
            RegionDefinition::new("ap-south", "IN", "Mumbai"),
            RegionDefinition::new("eu-west", "IE", "Dublin"),
            RegionDefinition::new("us-east", "US", "Virginia").as_primary(),
        ]
    }

    fn no_latencies() -> HashMap<String, u64> {
        HashMap::new()
    }

    fn pin_rule(
        id: &str,
        priority: u32,
        target: &str,
        conditions: Vec<RuleCondition>,
    ) -> RoutingRule {
        RoutingRule {
            id: id.to_string(),
            priority,
            enabled: true,
            conditions,
            target_region: target.to_string(),
        }
    }

    #[test]
    fn latency_picks_fastest_active() {
        let router = RequestRouter::new(RoutingStrategy::Latency);
        let mut latencies = HashMap::new();
        latencies.insert("us-east".to_string(), 50);
        latencies.insert("eu-west".to_string(), 10);

        let decision = router
            .route(&RequestContext::new(), &regions(), &latencies)
            .unwrap();
        assert_eq!(decision.region_id, "eu-west");
        assert_eq!(decision.strategy, RoutingStrategy::Latency);
        assert!(decision.matched_rule.is_none());
    }

    #[test]
    fn latency_ignores_inactive_regions() {
        let router = RequestRouter::new(RoutingStrategy::Latency);
        let mut regs = regions();
        regs[1].status = RegionStatus::Offline; // eu-west
        let mut latencies = HashMap::new();
        latencies.insert("us-east".to_string(), 50);
        latencies.insert("eu-west".to_string(), 10);

        let decision = router.route(&RequestContext::new(), &regs, &latencies).unwrap();
        assert_eq!(decision.region_id, "us-east");
    }

    #[test]
    fn latency_falls_back_to_geo_then_failover() {
        let router = RequestRouter::new(RoutingStrategy::Latency);

        // No latency data, same-country match exists.
        let decision = router
            .route(
                &RequestContext::new().with_country("IE"),
                &regions(),
                &no_latencies(),
            )
            .unwrap();
        assert_eq!(decision.region_id, "eu-west");
        assert_eq!(decision.strategy, RoutingStrategy::Geo);

        // No latency data and no geo match: failover to the active primary.
        let decision = router
            .route(
                &RequestContext::new().with_country("BR"),
                &regions(),
                &no_latencies(),
            )
            .unwrap();
        assert_eq!(decision.region_id, "us-east");
        assert_eq!(decision.strategy, RoutingStrategy::Failover);
    }

    #[test]
    fn failover_prefers_primary_then_any_active() {
        let router = RequestRouter::new(RoutingStrategy::Failover);

        let decision = router
            .route(&RequestContext::new(), &regions(), &no_latencies())
            .unwrap();
        assert_eq!(decision.region_id, "us-east");

        let mut regs = regions();
        regs[2].status = RegionStatus::Draining; // primary out
        let decision = router.route(&RequestContext::new(), &regs, &no_latencies()).unwrap();
        assert_eq!(decision.region_id, "ap-south");
    }

    #[test]
    fn no_active_region_is_an_error() {
        let router = RequestRouter::new(RoutingStrategy::Failover);
        let mut regs = regions();
        for r in &mut regs {
            r.status = RegionStatus::Offline;
        }
        assert!(matches!(
            router.route(&RequestContext::new(), &regs, &no_latencies()),
            Err(RegionError::NoActiveRegion)
        ));
    }

    #[test]
    fn round_robin_spreads_across_active() {
        let router = RequestRouter::new(RoutingStrategy::RoundRobin);
        let regs = regions();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            let decision = router.route(&RequestContext::new(), &regs, &no_latencies()).unwrap();
            seen.insert(decision.region_id);
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn weighted_biases_towards_heavy_regions() {
        let mut router = RequestRouter::new(RoutingStrategy::Weighted);
        router.set_weight("us-east", 100);
        router.set_weight("eu-west", 1);
        router.set_weight("ap-south", 1);

        let regs = regions();
        let mut us_east = 0;
        for _ in 0..300 {
            let decision = router.route(&RequestContext::new(), &regs, &no_latencies()).unwrap();
            if decision.region_id == "us-east" {
                us_east += 1;
            }
        }
        assert!(us_east > 200, "expected heavy bias, got {}/300", us_east);
    }

    #[test]
    fn first_matching_rule_wins_by_priority() {
        let mut router = RequestRouter::new(RoutingStrategy::Failover);
        router.add_rule(pin_rule(
            "eu-traffic",
            20,
            "eu-west",
            vec![RuleCondition {
                field: RuleField::Geo,
                op: RuleOp::Eq("IE".to_string()),
            }],
        ));
        router.add_rule(pin_rule(
            "everything",
            10,
            "ap-south",
            vec![],
        ));

        let decision = router
            .route(
                &RequestContext::new().with_country("IE"),
                &regions(),
                &no_latencies(),
            )
            .unwrap();
        // Priority 10 evaluates before priority 20.
        assert_eq!(decision.region_id, "ap-south");
        assert_eq!(decision.matched_rule.as_deref(), Some("everything"));
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let mut router = RequestRouter::new(RoutingStrategy::Failover);
        let mut rule = pin_rule("pin", 1, "eu-west", vec![]);
        rule.enabled = false;
        router.add_rule(rule);

        let decision = router
            .route(&RequestContext::new(), &regions(), &no_latencies())
            .unwrap();
        assert_eq!(decision.region_id, "us-east");
        assert!(decision.matched_rule.is_none());
    }

    #[test]
    fn rule_targeting_inactive_region_is_skipped() {
        let mut router = RequestRouter::new(RoutingStrategy::Failover);
        router.add_rule(pin_rule("pin", 1, "eu-west", vec![]));

        let mut regs = regions();
        regs[1].status = RegionStatus::Offline; // eu-west
        let decision = router.route(&RequestContext::new(), &regs, &no_latencies()).unwrap();
        assert_eq!(decision.region_id, "us-east");
    }

    #[test]
    fn header_and_path_predicates() {
        let mut router = RequestRouter::new(RoutingStrategy::Failover);
        router.add_rule(pin_rule(
            "beta-users",
            1,
            "eu-west",
            vec![RuleCondition {
                field: RuleField::Header("x-cohort".to_string()),
                op: RuleOp::In(vec!["beta".to_string(), "canary".to_string()]),
            }],
        ));
        router.add_rule(pin_rule(
            "admin-paths",
            2,
            "ap-south",
            vec![RuleCondition {
                field: RuleField::Path,
                op: RuleOp::StartsWith("/admin".to_string()),
            }],
        ));

        let decision = router
            .route(
                &RequestContext::new().with_header("x-cohort", "canary"),
                &regions(),
                &no_latencies(),
            )
            .unwrap();
        assert_eq!(decision.region_id, "eu-west");

        let decision = router
            .route(
                &RequestContext::new().with_path("/admin/metrics"),
                &regions(),
                &no_latencies(),
            )
            .unwrap();
        assert_eq!(decision.region_id, "ap-south");

        // A request matching neither rule falls through to the strategy.
        let decision = router
            .route(
                &RequestContext::new().with_path("/api/orders"),
                &regions(),
                &no_latencies(),
            )
            .unwrap();
        assert_eq!(decision.region_id, "us-east");
    }

    #[test]
    fn missing_field_never_matches() {
        let condition = RuleCondition {
            field: RuleField::Header("x-cohort".to_string()),
            op: RuleOp::Neq("beta".to_string()),
        };
        assert!(!condition.matches(&RequestContext::new()));
    }

    #[test]
    fn all_conditions_must_match() {
        let mut router = RequestRouter::new(RoutingStrategy::Failover);
        router.add_rule(pin_rule(
            "narrow",
            1,
            "eu-west",
            vec![
                RuleCondition {
                    field: RuleField::Geo,
                    op: RuleOp::Eq("IE".to_string()),
                },
                RuleCondition {
                    field: RuleField::Path,
                    op: RuleOp::Contains("checkout".to_string()),
                },
            ],
        ));

        let decision = router
            .route(
                &RequestContext::new().with_country("IE").with_path("/browse"),
                &regions(),
                &no_latencies(),
            )
            .unwrap();
        assert_eq!(decision.region_id, "us-east");

        let decision = router
            .route(
                &RequestContext::new()
                    .with_country("IE")
                    .with_path("/checkout/cart"),
                &regions(),
                &no_latencies(),
            )
            .unwrap();
        assert_eq!(decision.region_id, "eu-west");
    }

    #[test]
    fn remove_rule() {
        let mut router = RequestRouter::new(RoutingStrategy::Failover);
        router.add_rule(pin_rule("pin", 1, "eu-west", vec![]));
        assert!(router.remove_rule("pin"));
        assert!(!router.remove_rule("pin"));
        assert!(router.rules().is_empty());
    }
}
