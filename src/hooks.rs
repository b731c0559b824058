use std::collections::HashMap;
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::{PolicySelector, RouterConfig};
use crate::endpoint::Endpoint;
use crate::error::RouterError;
use crate::policy::{EngineStats, PolicyRegistry};
use crate::stats::{RequestStats, RequestStatsMonitor};

/// The full lifecycle-hook surface handed to the serving layer: arrival
/// timestamping, placement, and the per-token/completion/swap/kill
/// callbacks that keep the monitor and the active policy in sync.
///
/// One `RouterHandle` per process. Construct it once at startup with
/// `RouterHandle::new`, clone the `Arc` it's usually wrapped in to every
/// worker that streams a response.
pub struct RouterHandle {
	monitor: Arc<RequestStatsMonitor>,
	registry: Arc<PolicyRegistry>,
	clock: Arc<dyn Clock>,
}

impl RouterHandle {
	pub fn new(cfg: &RouterConfig, clock: Arc<dyn Clock>) -> Result<Self, RouterError> {
		let monitor = Arc::new(RequestStatsMonitor::new(cfg.sliding_window_secs));
		let registry = Arc::new(PolicyRegistry::new());
		registry.initialize(cfg.policy, cfg, monitor.clone(), clock.clone())?;
		Ok(Self {
			monitor,
			registry,
			clock,
		})
	}

	pub fn monitor(&self) -> &Arc<RequestStatsMonitor> {
		&self.monitor
	}

	pub fn registry(&self) -> &Arc<PolicyRegistry> {
		&self.registry
	}

	pub fn reconfigure(&self, selector: PolicySelector, cfg: &RouterConfig) -> Result<(), RouterError> {
		self
			.registry
			.reconfigure(selector, cfg, self.monitor.clone(), self.clock.clone())?;
		Ok(())
	}

	pub fn on_arrival(&self, request_id: &str, t_now: f64) {
		self.monitor.on_arrival(request_id, t_now);
	}

	/// Resolves to a replica URL synchronously for every policy except
	/// HRA, which suspends until a later sweep admits the request.
	pub async fn route_request(
		&self,
		endpoints: &[Endpoint],
		engine_stats: &HashMap<String, EngineStats>,
		headers: &HashMap<String, String>,
		request_id: &str,
		prefill_tokens: u64,
	) -> Result<Option<Endpoint>, RouterError> {
		if request_id.is_empty() {
			return Err(RouterError::EmptyRequestId);
		}
		let policy = self.registry.get()?;
		let t_now = self.clock.now();
		let snapshot = self.monitor.get_stats(t_now);
		policy
			.route_request(endpoints, engine_stats, &snapshot, headers, request_id, prefill_tokens)
			.await
	}

	pub fn on_start(&self, url: &Endpoint, request_id: &str, t_now: f64) {
		self.monitor.on_start(url, request_id, t_now);
	}

	pub fn on_response(&self, url: &Endpoint, request_id: &str, t_now: f64, is_first_token: bool) {
		self.monitor.on_response(url, request_id, t_now, is_first_token);
	}

	/// Records completion on the monitor, then notifies the active policy
	/// so HRA can re-run its admission sweep.
	pub fn on_complete(&self, url: &Endpoint, request_id: &str, t_now: f64) -> Result<(), RouterError> {
		self.monitor.on_complete(url, request_id, t_now);
		let policy = self.registry.get()?;
		policy.on_request_complete(url);
		Ok(())
	}

	pub fn on_swapped(&self, url: &Endpoint, request_id: &str, t_now: f64) {
		self.monitor.on_swapped(url, request_id, t_now);
	}

	pub fn on_kill(&self, url: &Endpoint, request_id: &str) {
		self.monitor.on_kill(url, request_id);
	}

	pub fn get_stats(&self, t_now: f64) -> HashMap<String, RequestStats> {
		self.monitor.get_stats(t_now)
	}
}

/// Parses the authoritative prefill-token count from request headers.
/// Missing or unparseable values fall back to 0 rather than erroring —
/// per-request token hints are advisory to every policy except HRA's
/// block math, which degrades to treating the request as free to admit.
pub fn prefill_tokens_from_headers(headers: &HashMap<String, String>) -> u64 {
	headers
		.get("x-prefill-tokens")
		.and_then(|v| v.parse::<u64>().ok())
		.unwrap_or(0)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::clock::SystemClock;

	fn handle() -> RouterHandle {
		let cfg = RouterConfig {
			policy: PolicySelector::RoundRobin,
			..RouterConfig::default()
		};
		RouterHandle::new(&cfg, Arc::new(SystemClock)).unwrap()
	}

	#[tokio::test]
	async fn full_round_trip_through_the_hook_surface() {
		let h = handle();
		let url = Endpoint::new("https://a");
		h.on_arrival("req1", 0.0);
		let got = h
			.route_request(&[url.clone()], &HashMap::new(), &HashMap::new(), "req1", 10)
			.await
			.unwrap()
			.unwrap();
		assert_eq!(got, url);
		h.on_start(&url, "req1", 0.0);
		h.on_response(&url, "req1", 0.1, true);
		h.on_complete(&url, "req1", 0.5).unwrap();
		assert!(h.get_stats(0.5).is_empty());
	}

	#[tokio::test]
	async fn empty_request_id_is_a_programming_error() {
		let h = handle();
		let err = h
			.route_request(&[Endpoint::new("https://a")], &HashMap::new(), &HashMap::new(), "", 10)
			.await;
		assert!(matches!(err, Err(RouterError::EmptyRequestId)));
	}

	#[test]
	fn prefill_tokens_header_parses_or_defaults_to_zero() {
		let mut headers = HashMap::new();
		headers.insert("x-prefill-tokens".to_string(), "42".to_string());
		assert_eq!(prefill_tokens_from_headers(&headers), 42);
		assert_eq!(prefill_tokens_from_headers(&HashMap::new()), 0);
	}
}
