use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::qps::pick_by_qps;
use super::{EngineStats, PlacementPolicy};
use crate::endpoint::Endpoint;
use crate::error::RouterError;
use crate::stats::{RequestStats, RequestStatsMonitor};

const VIRTUAL_NODES_PER_ENDPOINT: u32 = 40;

/// Minimal consistent-hash ring: each endpoint owns several virtual points
/// on a 64-bit circle, and a key routes to whichever point is the smallest
/// one at or after its own hash (wrapping to the first point otherwise).
/// Adding or removing one endpoint only reshuffles the keys that land in
/// its arc, rather than rehashing everything.
#[derive(Default)]
struct HashRing {
	points: BTreeMap<u64, String>,
	nodes: std::collections::HashSet<String>,
}

fn hash_of<T: Hash>(v: &T) -> u64 {
	let mut h = DefaultHasher::new();
	v.hash(&mut h);
	h.finish()
}

impl HashRing {
	fn sync(&mut self, endpoint_urls: &[String]) {
		let new_nodes: std::collections::HashSet<String> = endpoint_urls.iter().cloned().collect();
		let stale: Vec<String> = self.nodes.difference(&new_nodes).cloned().collect();
		for node in stale {
			self.remove_node(&node);
		}
		let fresh: Vec<String> = new_nodes.difference(&self.nodes).cloned().collect();
		for node in fresh {
			self.add_node(&node);
		}
	}

	fn add_node(&mut self, node: &str) {
		for replica in 0..VIRTUAL_NODES_PER_ENDPOINT {
			let key = hash_of(&(node, replica));
			self.points.insert(key, node.to_string());
		}
		self.nodes.insert(node.to_string());
	}

	fn remove_node(&mut self, node: &str) {
		for replica in 0..VIRTUAL_NODES_PER_ENDPOINT {
			let key = hash_of(&(node, replica));
			self.points.remove(&key);
		}
		self.nodes.remove(node);
	}

	fn get_node(&self, key: &str) -> Option<&str> {
		if self.points.is_empty() {
			return None;
		}
		let h = hash_of(&key);
		let node = self
			.points
			.range(h..)
			.next()
			.or_else(|| self.points.iter().next())
			.map(|(_, v)| v.as_str());
		node
	}
}

/// Routes by a sticky session header when present, falling back to
/// least-QPS routing for requests without one.
pub struct SessionRouter {
	monitor: Arc<RequestStatsMonitor>,
	session_header: String,
	ring: Mutex<HashRing>,
}

impl SessionRouter {
	pub fn new(monitor: Arc<RequestStatsMonitor>, session_header: String) -> Self {
		Self {
			monitor,
			session_header,
			ring: Mutex::new(HashRing::default()),
		}
	}
}

#[async_trait]
impl PlacementPolicy for SessionRouter {
	async fn route_request(
		&self,
		endpoints: &[Endpoint],
		_engine_stats: &HashMap<String, EngineStats>,
		request_stats: &HashMap<String, RequestStats>,
		headers: &HashMap<String, String>,
		request_id: &str,
		prefill_tokens: u64,
	) -> Result<Option<Endpoint>, RouterError> {
		if endpoints.is_empty() {
			return Ok(None);
		}
		let urls: Vec<String> = endpoints.iter().map(|e| e.url.clone()).collect();
		{
			let mut ring = self.ring.lock().unwrap();
			ring.sync(&urls);
		}

		let session_id = headers.get(&self.session_header);
		tracing::debug!(session_id = ?session_id, "session lookup");

		let chosen_url = match session_id {
			Some(session_id) => {
				let ring = self.ring.lock().unwrap();
				ring.get_node(session_id).map(|s| s.to_string())
			},
			None => pick_by_qps(endpoints, request_stats).map(|e| e.url.clone()),
		};

		let Some(chosen_url) = chosen_url else {
			return Ok(None);
		};
		let chosen = Endpoint::new(&chosen_url);
		self.monitor.on_routed(&chosen, request_id, prefill_tokens);
		Ok(Some(chosen))
	}
}
