//! Condition evaluator
//!
//! A pure function from (target, rules, sensor snapshot) to the desired run
//! state. Checks run in a fixed order and the first failing check decides
//! the block reason:
//!
//! 1. target configured
//! 2. power source
//! 3. internet reachability
//! 4. Ethernet-only mode, or network identity with optional Ethernet fallback

use custodian_api::{BlockReason, Reachability, SensorSnapshot, TargetIdentity};
use custodian_config::RuleConfig;

/// Outcome of one evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub desired_run: bool,
    /// Set exactly when `desired_run` is false
    pub block: Option<BlockReason>,
    /// Human-readable reason including the observed facts
    pub reason: String,
}

impl Decision {
    fn allow(why: impl Into<String>, snapshot: &SensorSnapshot) -> Self {
        Self {
            desired_run: true,
            block: None,
            reason: format!("{} ({})", why.into(), snapshot.facts()),
        }
    }

    fn block(reason: BlockReason, snapshot: &SensorSnapshot) -> Self {
        let text = match reason {
            BlockReason::NotConfigured => "not configured".to_string(),
            _ => format!("blocked: {} ({})", reason.summary(), snapshot.facts()),
        };
        Self {
            desired_run: false,
            block: Some(reason),
            reason: text,
        }
    }
}

/// Decide whether the target should run
pub fn evaluate(
    target: Option<&TargetIdentity>,
    rules: &RuleConfig,
    snapshot: &SensorSnapshot,
) -> Decision {
    if target.is_none() {
        return Decision::block(BlockReason::NotConfigured, snapshot);
    }

    if let Some(required) = &rules.required_power_source {
        if !snapshot.power_source.satisfies(required) {
            return Decision::block(
                BlockReason::PowerMismatch {
                    required: required.clone(),
                    current: snapshot.power_source.clone(),
                },
                snapshot,
            );
        }
    }

    if let Some(reason) = reachability_block(snapshot.reachability) {
        return Decision::block(reason, snapshot);
    }

    if rules.require_ethernet_only {
        if !snapshot.ethernet.active {
            return Decision::block(BlockReason::EthernetInactive, snapshot);
        }
        return match ethernet_condition(rules, snapshot) {
            Ok(why) => Decision::allow(why, snapshot),
            Err(reason) => Decision::block(reason, snapshot),
        };
    }

    let current = snapshot.network_identity.as_deref().filter(|n| !n.is_empty());
    match (&rules.required_network, current) {
        (Some(required), Some(current)) if required == current => {
            return Decision::allow(format!("on trusted network {}", current), snapshot);
        }
        (None, Some(current)) => {
            return Decision::allow(format!("connected to network {}", current), snapshot);
        }
        _ => {}
    }

    if rules.allow_ethernet_fallback && snapshot.ethernet.active {
        return match ethernet_condition(rules, snapshot) {
            Ok(why) => Decision::allow(why, snapshot),
            Err(reason) => Decision::block(reason, snapshot),
        };
    }

    let reason = match &rules.required_network {
        Some(required) => BlockReason::NetworkMismatch {
            required: required.clone(),
            current: current.map(str::to_string),
        },
        None => BlockReason::NoNetwork,
    };
    Decision::block(reason, snapshot)
}

fn reachability_block(reachability: Reachability) -> Option<BlockReason> {
    match reachability {
        Reachability::Reachable => None,
        Reachability::Unreachable => Some(BlockReason::Unreachable),
        Reachability::Unknown => Some(BlockReason::ReachabilityUnknown),
    }
}

/// Checks an active Ethernet link must pass. Reachability is asserted again
/// so Ethernet-only mode enforces it on its own.
fn ethernet_condition(rules: &RuleConfig, snapshot: &SensorSnapshot) -> Result<String, BlockReason> {
    let interface = snapshot.ethernet.interface.clone().unwrap_or_default();

    if rules.require_ethernet_default_route
        && snapshot.default_route_interface.as_deref() != Some(interface.as_str())
    {
        return Err(BlockReason::DefaultRouteMismatch {
            ethernet: interface,
            route: snapshot.default_route_interface.clone(),
        });
    }

    if let Some(reason) = reachability_block(snapshot.reachability) {
        return Err(reason);
    }

    Ok(format!("ethernet {} active", interface))
}
