use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde::Serialize;
use tracing::debug;

use super::sliding_window::SlidingWindow;
use crate::config::BlockAccounting;
use crate::endpoint::Endpoint;

/// Per-replica snapshot of request-level performance, read-only for consumers.
///
/// `ts_prefill_enqueue`/`ts_decoding_enqueue` are *ages* (seconds since the
/// request entered that phase) for each currently in-flight request, not
/// timestamps.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStats {
	pub qps: f64,
	pub ttft: f64,
	pub in_prefill: u64,
	pub in_decoding: u64,
	pub ts_prefill_enqueue: Vec<f64>,
	pub ts_decoding_enqueue: Vec<f64>,
	pub finished: u64,
	pub uptime: f64,
	pub avg_decoding_length: f64,
	pub avg_latency: f64,
	pub avg_itl: f64,
	pub num_swapped: u64,
}

#[derive(Default)]
struct MonitorState {
	arrival_time: HashMap<String, f64>,
	first_token_time: HashMap<(String, String), f64>,
	in_prefill_ids: HashMap<String, HashSet<String>>,
	in_decoding_ids: HashMap<String, HashSet<String>>,
	prefill_tokens: HashMap<String, HashMap<String, u64>>,
	decode_tokens: HashMap<String, HashMap<String, u64>>,
	finished_count: HashMap<String, u64>,
	swapped_count: HashMap<String, u64>,
	qps_windows: HashMap<String, SlidingWindow>,
	ttft_windows: HashMap<String, SlidingWindow>,
	latency_windows: HashMap<String, SlidingWindow>,
	decode_duration_windows: HashMap<String, SlidingWindow>,
	first_query_time: Option<f64>,
}

/// Process-wide observer of each request's lifecycle across replicas.
///
/// One instance per process, constructed once with a fixed sliding-window
/// duration and threaded explicitly to every collaborator via `Arc` —
/// there is no hidden global, so "the first construction wins" from the
/// source is enforced structurally rather than by runtime branching.
///
/// All mutation paths and the snapshot builder execute under a single
/// coarse lock; critical sections are map updates plus at most one
/// sliding-window update, so a `std::sync::Mutex` is sufficient.
pub struct RequestStatsMonitor {
	window_secs: f64,
	state: Mutex<MonitorState>,
}

impl RequestStatsMonitor {
	pub fn new(window_secs: f64) -> Self {
		Self {
			window_secs,
			state: Mutex::new(MonitorState::default()),
		}
	}

	pub fn window_secs(&self) -> f64 {
		self.window_secs
	}

	/// Record the arrival of a request, before routing.
	pub fn on_arrival(&self, request_id: &str, t: f64) {
		let mut s = self.state.lock().unwrap();
		s.arrival_time.insert(request_id.to_string(), t);
		if s.first_query_time.is_none() {
			s.first_query_time = Some(t);
		}
	}

	/// Record that the request was sent to `url`; ticks the QPS window.
	pub fn on_start(&self, url: &Endpoint, _request_id: &str, t: f64) {
		let mut s = self.state.lock().unwrap();
		s.qps_windows
			.entry(url.url.clone())
			.or_insert_with(|| SlidingWindow::new(self.window_secs))
			.update(t, 1.0);
	}

	/// Record a placement decision: must be called by every policy
	/// immediately before it surfaces a URL to the caller.
	pub fn on_routed(&self, url: &Endpoint, request_id: &str, prefill_tokens: u64) {
		let mut s = self.state.lock().unwrap();
		s.prefill_tokens
			.entry(url.url.clone())
			.or_default()
			.insert(request_id.to_string(), prefill_tokens);
		s.in_prefill_ids
			.entry(url.url.clone())
			.or_default()
			.insert(request_id.to_string());
		debug!(url = %url.url, request_id, prefill_tokens, "request routed");
	}

	/// Record a streamed token. `is_first_token` flips the request from
	/// prefill to decoding and records TTFT.
	pub fn on_response(&self, url: &Endpoint, request_id: &str, t: f64, is_first_token: bool) {
		let mut s = self.state.lock().unwrap();
		*s.decode_tokens
			.entry(url.url.clone())
			.or_default()
			.entry(request_id.to_string())
			.or_insert(0) += 1;

		if !is_first_token {
			return;
		}

		if !s.arrival_time.contains_key(request_id) {
			debug!(
				url = %url.url,
				request_id,
				"first-token response for a request the monitor never saw arrive; self-healing via kill"
			);
			drop(s);
			self.on_kill(url, request_id);
			return;
		}

		if let Some(set) = s.in_prefill_ids.get_mut(&url.url) {
			set.remove(request_id);
		}
		s.in_decoding_ids
			.entry(url.url.clone())
			.or_default()
			.insert(request_id.to_string());
		s.first_token_time
			.insert((url.url.clone(), request_id.to_string()), t);

		let arrival = s.arrival_time[request_id];
		let ttft = t - arrival;
		s.ttft_windows
			.entry(url.url.clone())
			.or_insert_with(|| SlidingWindow::new(self.window_secs))
			.update(t, ttft);
	}

	/// Record completion: latencies, counters, and full per-request cleanup.
	pub fn on_complete(&self, url: &Endpoint, request_id: &str, t: f64) {
		let mut s = self.state.lock().unwrap();
		let Some(&arrival) = s.arrival_time.get(request_id) else {
			debug!(url = %url.url, request_id, "complete for unknown arrival; self-healing via kill");
			drop(s);
			self.on_kill(url, request_id);
			return;
		};
		let key = (url.url.clone(), request_id.to_string());
		let Some(&first_token) = s.first_token_time.get(&key) else {
			debug!(url = %url.url, request_id, "complete without a first-token record; self-healing via kill");
			drop(s);
			self.on_kill(url, request_id);
			return;
		};

		if let Some(set) = s.in_decoding_ids.get_mut(&url.url) {
			set.remove(request_id);
		}
		*s.finished_count.entry(url.url.clone()).or_insert(0) += 1;

		let latency = t - arrival;
		s.latency_windows
			.entry(url.url.clone())
			.or_insert_with(|| SlidingWindow::new(self.window_secs))
			.update(t, latency);

		let decode_duration = t - first_token;
		s.decode_duration_windows
			.entry(url.url.clone())
			.or_insert_with(|| SlidingWindow::new(self.window_secs))
			.update(t, decode_duration);

		if let Some(m) = s.decode_tokens.get_mut(&url.url) {
			m.remove(request_id);
		}
		if let Some(m) = s.prefill_tokens.get_mut(&url.url) {
			m.remove(request_id);
		}
		s.arrival_time.remove(request_id);
		s.first_token_time.remove(&key);
	}

	/// Increment the swap counter for `url`. No other state changes.
	pub fn on_swapped(&self, url: &Endpoint, _request_id: &str, _t: f64) {
		let mut s = self.state.lock().unwrap();
		*s.swapped_count.entry(url.url.clone()).or_insert(0) += 1;
	}

	/// Unconditionally tear down all per-request state. Idempotent.
	pub fn on_kill(&self, url: &Endpoint, request_id: &str) {
		let mut s = self.state.lock().unwrap();
		if let Some(set) = s.in_prefill_ids.get_mut(&url.url) {
			set.remove(request_id);
		}
		if let Some(set) = s.in_decoding_ids.get_mut(&url.url) {
			set.remove(request_id);
		}
		s.arrival_time.remove(request_id);
		s.first_token_time.remove(&(url.url.clone(), request_id.to_string()));
		if let Some(m) = s.decode_tokens.get_mut(&url.url) {
			m.remove(request_id);
		}
		if let Some(m) = s.prefill_tokens.get_mut(&url.url) {
			m.remove(request_id);
		}
	}

	/// Snapshot request statistics for every URL currently in-flight.
	pub fn get_stats(&self, t_now: f64) -> HashMap<String, RequestStats> {
		let mut s = self.state.lock().unwrap();
		let mut urls: HashSet<String> = s.in_prefill_ids.keys().cloned().collect();
		urls.extend(s.in_decoding_ids.keys().cloned());

		let first_query_time = s.first_query_time;
		let mut ret = HashMap::with_capacity(urls.len());
		for url in urls {
			let qps = match s.qps_windows.get_mut(&url) {
				Some(w) => {
					w.update_no_value(t_now);
					w.sum() / self.window_secs
				},
				None => -1.0,
			};
			let ttft = match s.ttft_windows.get_mut(&url) {
				Some(w) => {
					w.update_no_value(t_now);
					w.average()
				},
				None => -1.0,
			};
			let avg_latency = match s.latency_windows.get_mut(&url) {
				Some(w) => {
					w.update_no_value(t_now);
					w.average()
				},
				None => -1.0,
			};
			let avg_decoding_length = match s.decode_duration_windows.get_mut(&url) {
				Some(w) => {
					w.update_no_value(t_now);
					w.average()
				},
				None => -1.0,
			};

			let empty_set = HashSet::new();
			let prefill_ids = s.in_prefill_ids.get(&url).unwrap_or(&empty_set);
			let decoding_ids = s.in_decoding_ids.get(&url).unwrap_or(&empty_set);

			let ts_prefill_enqueue = prefill_ids
				.iter()
				.map(|id| t_now - s.arrival_time[id])
				.collect();
			let ts_decoding_enqueue = decoding_ids
				.iter()
				.map(|id| t_now - s.first_token_time[&(url.clone(), id.clone())])
				.collect();

			ret.insert(
				url.clone(),
				RequestStats {
					qps,
					ttft,
					in_prefill: prefill_ids.len() as u64,
					in_decoding: decoding_ids.len() as u64,
					ts_prefill_enqueue,
					ts_decoding_enqueue,
					finished: *s.finished_count.get(&url).unwrap_or(&0),
					uptime: first_query_time.map(|f| t_now - f).unwrap_or(0.0),
					avg_decoding_length,
					avg_latency,
					avg_itl: -1.0,
					num_swapped: *s.swapped_count.get(&url).unwrap_or(&0),
				},
			);
		}
		ret
	}

	/// Sum of `ceil((prefill_tokens + decode_tokens) / block_size)` over every
	/// request currently in decoding on `url`. Reflects *known* occupancy.
	pub fn estimate_allocated_blocks(&self, url: &Endpoint, blocks: &BlockAccounting) -> u64 {
		let s = self.state.lock().unwrap();
		let Some(decode_map) = s.decode_tokens.get(&url.url) else {
			return 0;
		};
		let decoding_ids = s.in_decoding_ids.get(&url.url);
		let mut total = 0u64;
		for (request_id, &decode_tokens) in decode_map {
			debug_assert!(
				decoding_ids.is_some_and(|ids| ids.contains(request_id)),
				"request {request_id} has decode tokens but is not tracked as decoding on {}",
				url.url
			);
			let prefill_tokens = s
				.prefill_tokens
				.get(&url.url)
				.and_then(|m| m.get(request_id))
				.copied()
				.unwrap_or(0);
			let total_tokens = prefill_tokens + decode_tokens;
			total += total_tokens.div_ceil(blocks.block_size);
		}
		total
	}

	/// Pessimistic reservation covering every request tracked in prefill or
	/// decoding on `url`, assuming each still needs its full expected decode.
	pub fn estimate_pending_reserved_blocks(&self, url: &Endpoint, blocks: &BlockAccounting) -> u64 {
		let s = self.state.lock().unwrap();
		let Some(prefill_map) = s.prefill_tokens.get(&url.url) else {
			return 0;
		};
		let total_prefill_tokens: u64 = prefill_map.values().sum();
		let total_expected = total_prefill_tokens as f64 * (1.0 + blocks.decode_to_prefill_ratio);
		(total_expected / blocks.block_size as f64).ceil() as u64
	}
}
