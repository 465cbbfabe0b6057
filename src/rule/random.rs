//! Uniform random selection among live servers.

use std::sync::Arc;

use rand::seq::SliceRandom;

use crate::load_balancer::server::Server;
use crate::load_balancer::LoadBalancer;
use crate::rule::{is_usable, Rule};

#[derive(Debug, Default)]
pub struct RandomRule;

impl RandomRule {
    pub fn new() -> Self {
        Self
    }
}

impl Rule for RandomRule {
    fn name(&self) -> &'static str {
        "random"
    }

    fn choose(&self, lb: &dyn LoadBalancer, _key: Option<&str>) -> Option<Arc<Server>> {
        let up = lb.reachable_servers();
        let candidates: Vec<&Arc<Server>> = up.iter().filter(|s| is_usable(s)).collect();
        candidates.choose(&mut rand::thread_rng()).map(|s| Arc::clone(s))
    }
}
