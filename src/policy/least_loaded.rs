use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::{EngineStats, PlacementPolicy};
use crate::endpoint::Endpoint;
use crate::error::RouterError;
use crate::stats::{RequestStats, RequestStatsMonitor};

/// Picks the endpoint minimizing `in_prefill + in_decoding` from the
/// snapshot. Unknown URLs count as zero load; the first-listed URL wins
/// ties.
pub struct LeastLoadedRouter {
	monitor: Arc<RequestStatsMonitor>,
}

impl LeastLoadedRouter {
	pub fn new(monitor: Arc<RequestStatsMonitor>) -> Self {
		Self { monitor }
	}
}

pub(super) fn queue_length(url: &str, request_stats: &HashMap<String, RequestStats>) -> u64 {
	request_stats
		.get(url)
		.map(|s| s.in_prefill + s.in_decoding)
		.unwrap_or(0)
}

#[async_trait]
impl PlacementPolicy for LeastLoadedRouter {
	async fn route_request(
		&self,
		endpoints: &[Endpoint],
		_engine_stats: &HashMap<String, EngineStats>,
		request_stats: &HashMap<String, RequestStats>,
		_headers: &HashMap<String, String>,
		request_id: &str,
		prefill_tokens: u64,
	) -> Result<Option<Endpoint>, RouterError> {
		let mut lowest = u64::MAX;
		let mut chosen: Option<&Endpoint> = None;
		for ep in endpoints {
			let work = queue_length(&ep.url, request_stats);
			if work < lowest {
				lowest = work;
				chosen = Some(ep);
			}
		}
		let Some(chosen) = chosen.cloned() else {
			return Ok(None);
		};
		self.monitor.on_routed(&chosen, request_id, prefill_tokens);
		Ok(Some(chosen))
	}
}
