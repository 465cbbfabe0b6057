//! Zone avoidance selection.
//!
//! # Zone availability
//! ```text
//! zone dropped when: no instances
//!                  | tripped / instances >= triggering blackout percentage
//!                  | every instance tripped (load per server < 0)
//! worst zone dropped when: max load per server >= triggering load
//!                        | any zone was dropped above
//! ```
//! When several zones tie for worst, the one dropped is picked at random,
//! weighted by instance count.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rand::Rng;

use crate::load_balancer::server::Server;
use crate::load_balancer::stats::ZoneSnapshot;
use crate::load_balancer::LoadBalancer;
use crate::rule::predicate::{
    AlwaysTrue, AvailabilityPredicate, CompositePredicate, ServerPredicate, ZoneAvoidancePredicate,
};
use crate::rule::{is_usable, Rotation, Rule};

/// Pick a zone among `choose_from`, weighted by instance count.
pub fn random_choose_zone(
    snapshot: &HashMap<String, ZoneSnapshot>,
    choose_from: &HashSet<String>,
) -> Option<String> {
    let mut zones: Vec<&String> = choose_from.iter().collect();
    zones.sort();
    match zones.len() {
        0 => return None,
        1 => return Some(zones[0].clone()),
        _ => {}
    }

    let total: usize = zones
        .iter()
        .map(|z| snapshot.get(*z).map(|s| s.instance_count).unwrap_or(0))
        .sum();
    if total == 0 {
        return Some(zones[0].clone());
    }

    let index = rand::thread_rng().gen_range(1..=total);
    let mut sum = 0;
    for zone in &zones {
        sum += snapshot.get(*zone).map(|s| s.instance_count).unwrap_or(0);
        if index <= sum {
            return Some((*zone).clone());
        }
    }
    Some(zones[0].clone())
}

/// Zones that may receive traffic given the current snapshot.
pub fn available_zones(
    snapshot: &HashMap<String, ZoneSnapshot>,
    triggering_load: f64,
    triggering_blackout_percentage: f64,
) -> HashSet<String> {
    let mut available: HashSet<String> = snapshot.keys().cloned().collect();
    if available.len() <= 1 {
        return available;
    }

    let mut worst: HashSet<String> = HashSet::new();
    let mut max_load = 0.0f64;
    let mut limited = false;

    for (zone, snap) in snapshot {
        if snap.instance_count == 0 {
            available.remove(zone);
            limited = true;
            continue;
        }
        let load = snap.load_per_server;
        let blackout = snap.circuit_tripped_count as f64 / snap.instance_count as f64;
        if blackout >= triggering_blackout_percentage || load < 0.0 {
            available.remove(zone);
            limited = true;
        } else if (load - max_load).abs() < 0.000001 {
            worst.insert(zone.clone());
        } else if load > max_load {
            max_load = load;
            worst.clear();
            worst.insert(zone.clone());
        }
    }

    if max_load < triggering_load && !limited {
        return available;
    }

    if let Some(avoid) = random_choose_zone(snapshot, &worst) {
        available.remove(&avoid);
    }
    available
}

/// Round robin over servers that pass zone avoidance and availability,
/// falling back to availability alone, then to any live server.
#[derive(Debug)]
pub struct ZoneAvoidanceRule {
    predicate: CompositePredicate,
    rotation: Rotation,
}

impl Default for ZoneAvoidanceRule {
    fn default() -> Self {
        Self::new()
    }
}

impl ZoneAvoidanceRule {
    pub fn new() -> Self {
        let availability: Arc<dyn ServerPredicate> = Arc::new(AvailabilityPredicate);
        let predicate = CompositePredicate::new(vec![Arc::new(ZoneAvoidancePredicate), availability.clone()])
            .with_fallback(availability)
            .with_fallback(Arc::new(AlwaysTrue));
        Self {
            predicate,
            rotation: Rotation::default(),
        }
    }
}

impl Rule for ZoneAvoidanceRule {
    fn name(&self) -> &'static str {
        "zone_avoidance"
    }

    fn choose(&self, lb: &dyn LoadBalancer, key: Option<&str>) -> Option<Arc<Server>> {
        let live: Vec<Arc<Server>> = lb.all_servers().iter().filter(|s| is_usable(s)).cloned().collect();
        let eligible = self.predicate.eligible(lb, &live, key);
        self.rotation.pick(&eligible)
    }
}
