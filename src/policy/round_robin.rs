use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{EngineStats, PlacementPolicy};
use crate::endpoint::Endpoint;
use crate::error::RouterError;
use crate::stats::{RequestStats, RequestStatsMonitor};

/// Cycles through endpoints sorted lexicographically by URL.
///
/// Observably stable under a fixed endpoint set; when endpoints change
/// between calls, fairness is only approximate, since the counter keeps
/// advancing against whatever the sorted list looks like this call.
pub struct RoundRobinRouter {
	monitor: Arc<RequestStatsMonitor>,
	counter: AtomicUsize,
}

impl RoundRobinRouter {
	pub fn new(monitor: Arc<RequestStatsMonitor>) -> Self {
		Self {
			monitor,
			counter: AtomicUsize::new(0),
		}
	}
}

#[async_trait]
impl PlacementPolicy for RoundRobinRouter {
	async fn route_request(
		&self,
		endpoints: &[Endpoint],
		_engine_stats: &HashMap<String, EngineStats>,
		_request_stats: &HashMap<String, RequestStats>,
		_headers: &HashMap<String, String>,
		request_id: &str,
		prefill_tokens: u64,
	) -> Result<Option<Endpoint>, RouterError> {
		if endpoints.is_empty() {
			return Ok(None);
		}
		let mut sorted: Vec<&Endpoint> = endpoints.iter().collect();
		sorted.sort_by(|a, b| a.url.cmp(&b.url));
		let idx = self.counter.fetch_add(1, Ordering::Relaxed) % sorted.len();
		let chosen = sorted[idx].clone();
		self.monitor.on_routed(&chosen, request_id, prefill_tokens);
		Ok(Some(chosen))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn eps(urls: &[&str]) -> Vec<Endpoint> {
		urls.iter().map(|u| Endpoint::new(*u)).collect()
	}

	#[tokio::test]
	async fn cycles_lexicographically_with_period_n() {
		let monitor = Arc::new(RequestStatsMonitor::new(60.0));
		let router = RoundRobinRouter::new(monitor);
		let endpoints = eps(&["https://b", "https://a", "https://c"]);
		let mut chosen = Vec::new();
		for i in 0..6 {
			let url = router
				.route_request(
					&endpoints,
					&HashMap::new(),
					&HashMap::new(),
					&HashMap::new(),
					&format!("req{i}"),
					10,
				)
				.await
				.unwrap()
				.unwrap();
			chosen.push(url.url);
		}
		assert_eq!(
			chosen,
			vec!["https://a", "https://b", "https://c", "https://a", "https://b", "https://c"]
		);
	}

	#[tokio::test]
	async fn empty_endpoints_yields_no_url() {
		let monitor = Arc::new(RequestStatsMonitor::new(60.0));
		let router = RoundRobinRouter::new(monitor);
		let got = router
			.route_request(&[], &HashMap::new(), &HashMap::new(), &HashMap::new(), "req0", 10)
			.await
			.unwrap();
		assert!(got.is_none());
	}
}
