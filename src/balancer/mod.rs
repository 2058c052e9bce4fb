//! Logical model routing across equivalent provider targets.

mod load_balancer;
mod strategy;
mod table;

pub use load_balancer::{LoadBalancer, LoadBalancerConfig, ProviderMetrics, Route};
pub use strategy::{Strategy, Weights};
pub use table::{ModelMapping, ModelTable, Target};
