use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use rand::Rng;

use crate::config::{LoadBalancePolicy, RouteConfig, RouteTarget};

struct Server {
    name: String,
    weight: i64,
    in_flight: AtomicI64,
}

fn new_servers(targets: &[RouteTarget]) -> Vec<Server> {
    targets
        .iter()
        .map(|t| Server {
            name: t.cluster.clone(),
            weight: t.weight.unwrap_or(1).max(0),
            in_flight: AtomicI64::new(0),
        })
        .collect()
}

enum Balancer {
    WeightedRoundRobin {
        servers: Vec<Server>,
        current: AtomicUsize,
    },
    WeightedLeastRequest {
        servers: Vec<Server>,
        current: AtomicUsize,
    },
    Empty,
}

/// Weighted selection across a route's targets. The round-robin variant draws
/// uniformly over cumulative weights from a rolling start index, so over many
/// draws target i is picked with frequency weight_i / total.
pub struct LoadBalancer {
    inner: Balancer,
}

impl LoadBalancer {
    pub fn new(config: &RouteConfig) -> Self {
        let inner = match config.load_balance_policy {
            LoadBalancePolicy::WeightedRoundRobin => Balancer::WeightedRoundRobin {
                servers: new_servers(&config.targets),
                current: AtomicUsize::new(0),
            },
            LoadBalancePolicy::WeightedLeastRequest => Balancer::WeightedLeastRequest {
                servers: new_servers(&config.targets),
                current: AtomicUsize::new(0),
            },
            LoadBalancePolicy::Unspecified => Balancer::Empty,
            LoadBalancePolicy::Custom => {
                tracing::error!("custom load balance policy is not an internal balancer");
                Balancer::Empty
            }
        };
        Self { inner }
    }

    /// The next cluster name, or an empty string when no selection is
    /// possible.
    pub fn next(&self) -> String {
        match &self.inner {
            Balancer::Empty => String::new(),
            Balancer::WeightedRoundRobin { servers, current } => {
                if servers.is_empty() {
                    return String::new();
                }
                if servers.len() == 1 {
                    return servers[0].name.clone();
                }

                let total_weight: i64 = servers.iter().map(|s| s.weight).sum();
                if total_weight <= 0 {
                    return String::new();
                }

                let draw = rand::thread_rng().gen_range(0..total_weight);
                let start = current.load(Ordering::Acquire);

                let mut cumulative: i64 = 0;
                let mut found = start % servers.len();
                for offset in 0..servers.len() {
                    let index = (start + offset) % servers.len();
                    cumulative += servers[index].weight;
                    if cumulative > draw {
                        found = index;
                        break;
                    }
                }

                current.store((found + 1) % servers.len(), Ordering::Release);
                servers[found].name.clone()
            }
            Balancer::WeightedLeastRequest { servers, current } => {
                if servers.is_empty() {
                    return String::new();
                }
                if servers.len() == 1 {
                    servers[0].in_flight.fetch_add(1, Ordering::AcqRel);
                    current.store(0, Ordering::Release);
                    return servers[0].name.clone();
                }

                let mut selected = 0;
                let mut least_ratio = f64::MAX;
                for (index, server) in servers.iter().enumerate() {
                    let in_flight = server.in_flight.load(Ordering::Acquire);
                    let ratio = in_flight as f64 / server.weight.max(1) as f64;
                    let fewer_requests = ratio == least_ratio
                        && in_flight < servers[selected].in_flight.load(Ordering::Acquire);
                    if ratio < least_ratio || fewer_requests {
                        least_ratio = ratio;
                        selected = index;
                    }
                }

                current.store(selected, Ordering::Release);
                servers[selected].in_flight.fetch_add(1, Ordering::AcqRel);
                servers[selected].name.clone()
            }
        }
    }

    /// Release the in-flight slot taken by the last `next` call. Counters
    /// saturate at zero.
    pub fn done(&self) {
        if let Balancer::WeightedLeastRequest { servers, current } = &self.inner {
            if servers.is_empty() {
                return;
            }
            let index = current.load(Ordering::Acquire) % servers.len();
            let _ = servers[index].in_flight.fetch_update(
                Ordering::AcqRel,
                Ordering::Acquire,
                |count| if count > 0 { Some(count - 1) } else { None },
            );
        }
    }
}
