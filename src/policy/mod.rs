use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::clock::Clock;
use crate::config::{PolicySelector, RouterConfig};
use crate::endpoint::Endpoint;
use crate::error::RouterError;
use crate::stats::{RequestStats, RequestStatsMonitor};

pub mod custom;
pub mod hra;
pub mod least_loaded;
pub mod qps;
pub mod round_robin;
pub mod session;

pub use custom::CustomRouter;
pub use hra::HraRouter;
pub use least_loaded::LeastLoadedRouter;
pub use qps::QpsLeastRouter;
pub use round_robin::RoundRobinRouter;
pub use session::SessionRouter;

/// Placeholder for a replica's physical-utilization view (GPU memory,
/// engine-reported queue depth). No policy here reads it; the parameter
/// is carried through `route_request` only to keep the external interface
/// shape intact for a future collaborator that would populate it.
#[derive(Debug, Clone, Default)]
pub struct EngineStats;

/// Uniform contract every placement strategy implements.
///
/// Only `HraRouter` suspends — it awaits its own internal channel until a
/// later sweep admits the request. Every other policy resolves
/// immediately. Every implementation MUST call
/// `RequestStatsMonitor::on_routed` before surfacing a URL.
///
/// Returns `Ok(None)` when no URL can be produced from the current
/// endpoint list (e.g. it is empty) — this is not an error, per the
/// error taxonomy; callers decide whether to time out and surface one.
#[async_trait]
pub trait PlacementPolicy: Send + Sync {
	async fn route_request(
		&self,
		endpoints: &[Endpoint],
		engine_stats: &HashMap<String, EngineStats>,
		request_stats: &HashMap<String, RequestStats>,
		headers: &HashMap<String, String>,
		request_id: &str,
		prefill_tokens: u64,
	) -> Result<Option<Endpoint>, RouterError>;

	/// Called once per `onComplete` on `url`. Only `HraRouter` overrides
	/// this to re-run its admission sweep; every other policy is
	/// stateless with respect to completions.
	fn on_request_complete(&self, _url: &Endpoint) {}
}

fn build_policy(
	selector: PolicySelector,
	cfg: &RouterConfig,
	monitor: Arc<RequestStatsMonitor>,
	clock: Arc<dyn Clock>,
) -> Result<Arc<dyn PlacementPolicy>, RouterError> {
	match selector {
		PolicySelector::RoundRobin => Ok(Arc::new(RoundRobinRouter::new(monitor))),
		PolicySelector::Llq => Ok(Arc::new(LeastLoadedRouter::new(monitor))),
		PolicySelector::Session => {
			if cfg.session_header.trim().is_empty() {
				return Err(RouterError::SessionKeyMissing);
			}
			Ok(Arc::new(SessionRouter::new(monitor, cfg.session_header.clone())))
		},
		PolicySelector::Hra => Ok(Arc::new(HraRouter::new(monitor, cfg.blocks, clock))),
		PolicySelector::Custom => Ok(Arc::new(CustomRouter::new(monitor))),
	}
}

/// Constructs and holds the single active policy instance for the process.
///
/// `reconfigure` discards the prior singleton before constructing the
/// new one, matching the source's registry-of-singletons behavior without
/// the hidden global: the "singleton" here is simply whichever `Arc` this
/// registry currently holds.
pub struct PolicyRegistry {
	current: Mutex<Option<Arc<dyn PlacementPolicy>>>,
}

impl Default for PolicyRegistry {
	fn default() -> Self {
		Self::new()
	}
}

impl PolicyRegistry {
	pub fn new() -> Self {
		Self {
			current: Mutex::new(None),
		}
	}

	pub fn initialize(
		&self,
		selector: PolicySelector,
		cfg: &RouterConfig,
		monitor: Arc<RequestStatsMonitor>,
		clock: Arc<dyn Clock>,
	) -> Result<Arc<dyn PlacementPolicy>, RouterError> {
		let policy = build_policy(selector, cfg, monitor, clock)?;
		*self.current.lock().unwrap() = Some(policy.clone());
		tracing::info!(policy = %selector, "policy initialized");
		Ok(policy)
	}

	pub fn reconfigure(
		&self,
		selector: PolicySelector,
		cfg: &RouterConfig,
		monitor: Arc<RequestStatsMonitor>,
		clock: Arc<dyn Clock>,
	) -> Result<Arc<dyn PlacementPolicy>, RouterError> {
		*self.current.lock().unwrap() = None;
		tracing::info!(policy = %selector, "reconfiguring policy");
		self.initialize(selector, cfg, monitor, clock)
	}

	pub fn get(&self) -> Result<Arc<dyn PlacementPolicy>, RouterError> {
		self
			.current
			.lock()
			.unwrap()
			.clone()
			.ok_or(RouterError::PolicyNotInitialized)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::clock::SystemClock;

	#[test]
	fn get_before_initialize_errors() {
		let registry = PolicyRegistry::new();
		assert!(matches!(registry.get(), Err(RouterError::PolicyNotInitialized)));
	}

	#[test]
	fn initialize_then_get_succeeds() {
		let registry = PolicyRegistry::new();
		let monitor = Arc::new(RequestStatsMonitor::new(60.0));
		let cfg = RouterConfig::default();
		registry
			.initialize(PolicySelector::RoundRobin, &cfg, monitor, Arc::new(SystemClock))
			.unwrap();
		assert!(registry.get().is_ok());
	}

	#[test]
	fn session_without_header_name_fails_construction() {
		let registry = PolicyRegistry::new();
		let monitor = Arc::new(RequestStatsMonitor::new(60.0));
		let mut cfg = RouterConfig::default();
		cfg.session_header = "".to_string();
		let err = registry.initialize(PolicySelector::Session, &cfg, monitor, Arc::new(SystemClock));
		assert!(matches!(err, Err(RouterError::SessionKeyMissing)));
	}

	#[test]
	fn reconfigure_replaces_the_instance() {
		let registry = PolicyRegistry::new();
		let monitor = Arc::new(RequestStatsMonitor::new(60.0));
		let cfg = RouterConfig::default();
		registry
			.initialize(PolicySelector::RoundRobin, &cfg, monitor.clone(), Arc::new(SystemClock))
			.unwrap();
		registry
			.reconfigure(PolicySelector::Llq, &cfg, monitor, Arc::new(SystemClock))
			.unwrap();
		assert!(registry.get().is_ok());
	}
}
