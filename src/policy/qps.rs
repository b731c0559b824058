use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::{EngineStats, PlacementPolicy};
use crate::endpoint::Endpoint;
use crate::error::RouterError;
use crate::stats::{RequestStats, RequestStatsMonitor};

/// Picks the endpoint with the lowest observed QPS. An endpoint absent
/// from the stats snapshot (it has never carried a request) short-circuits
/// the scan and is returned immediately, matching the "give idle replicas
/// traffic first" intent.
pub struct QpsLeastRouter {
	monitor: Arc<RequestStatsMonitor>,
}

impl QpsLeastRouter {
	pub fn new(monitor: Arc<RequestStatsMonitor>) -> Self {
		Self { monitor }
	}
}

pub(super) fn pick_by_qps<'a>(
	endpoints: &'a [Endpoint],
	request_stats: &HashMap<String, RequestStats>,
) -> Option<&'a Endpoint> {
	let mut lowest_qps = f64::INFINITY;
	let mut ret = None;
	for ep in endpoints {
		let Some(stat) = request_stats.get(&ep.url) else {
			return Some(ep);
		};
		if stat.qps < lowest_qps {
			lowest_qps = stat.qps;
			ret = Some(ep);
		}
	}
	ret
}

#[async_trait]
impl PlacementPolicy for QpsLeastRouter {
	async fn route_request(
		&self,
		endpoints: &[Endpoint],
		_engine_stats: &HashMap<String, EngineStats>,
		request_stats: &HashMap<String, RequestStats>,
		_headers: &HashMap<String, String>,
		request_id: &str,
		prefill_tokens: u64,
	) -> Result<Option<Endpoint>, RouterError> {
		let Some(chosen) = pick_by_qps(endpoints, request_stats).cloned() else {
			return Ok(None);
		};
		self.monitor.on_routed(&chosen, request_id, prefill_tokens);
		Ok(Some(chosen))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn stat(qps: f64) -> RequestStats {
		RequestStats {
			qps,
			..Default::default()
		}
	}

	#[tokio::test]
	async fn unknown_endpoint_short_circuits() {
		let monitor = Arc::new(RequestStatsMonitor::new(60.0));
		let router = QpsLeastRouter::new(monitor);
		let endpoints = vec![Endpoint::new("https://busy"), Endpoint::new("https://fresh")];
		let mut rs = HashMap::new();
		rs.insert("https://busy".to_string(), stat(5.0));
		let got = router
			.route_request(&endpoints, &HashMap::new(), &rs, &HashMap::new(), "r1", 10)
			.await
			.unwrap()
			.unwrap();
		assert_eq!(got.url, "https://fresh");
	}

	#[tokio::test]
	async fn lowest_qps_wins_when_all_known() {
		let monitor = Arc::new(RequestStatsMonitor::new(60.0));
		let router = QpsLeastRouter::new(monitor);
		let endpoints = vec![Endpoint::new("https://a"), Endpoint::new("https://b")];
		let mut rs = HashMap::new();
		rs.insert("https://a".to_string(), stat(3.0));
		rs.insert("https://b".to_string(), stat(1.0));
		let got = router
			.route_request(&endpoints, &HashMap::new(), &rs, &HashMap::new(), "r1", 10)
			.await
			.unwrap()
			.unwrap();
		assert_eq!(got.url, "https://b");
	}
}
