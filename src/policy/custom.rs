use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::{EngineStats, PlacementPolicy};
use crate::endpoint::Endpoint;
use crate::error::RouterError;
use crate::stats::{RequestStats, RequestStatsMonitor};

/// Estimates queued + in-flight work per endpoint from decode-length history
/// rather than raw counts, falling back to QPS when decode-length history
/// isn't available yet.
pub struct CustomRouter {
	monitor: Arc<RequestStatsMonitor>,
}

impl CustomRouter {
	pub fn new(monitor: Arc<RequestStatsMonitor>) -> Self {
		Self { monitor }
	}
}

fn estimate_work(url: &str, request_stats: &HashMap<String, RequestStats>) -> f64 {
	let Some(stat) = request_stats.get(url) else {
		return 0.0;
	};
	let avg_gen_lat = stat.avg_decoding_length;
	if avg_gen_lat < 0.0 {
		return stat.qps;
	}
	let in_q_work = stat.ts_prefill_enqueue.len() as f64 * avg_gen_lat;
	let in_d_work: f64 = stat
		.ts_decoding_enqueue
		.iter()
		.map(|&tdiff| tdiff.max(avg_gen_lat))
		.sum();
	in_q_work + in_d_work
}

#[async_trait]
impl PlacementPolicy for CustomRouter {
	async fn route_request(
		&self,
		endpoints: &[Endpoint],
		_engine_stats: &HashMap<String, EngineStats>,
		request_stats: &HashMap<String, RequestStats>,
		_headers: &HashMap<String, String>,
		request_id: &str,
		prefill_tokens: u64,
	) -> Result<Option<Endpoint>, RouterError> {
		let mut lowest_work = f64::INFINITY;
		let mut chosen: Option<&Endpoint> = None;
		for ep in endpoints {
			let work = estimate_work(&ep.url, request_stats);
			if work < lowest_work {
				lowest_work = work;
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
