use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::{EngineStats, PlacementPolicy};
use crate::clock::Clock;
use crate::config::BlockAccounting;
use crate::endpoint::Endpoint;
use crate::error::RouterError;
use crate::stats::{RequestStats, RequestStatsMonitor};

struct QueuedRequest {
	prefill_tokens: u64,
	arrived_at: f64,
	endpoints: Vec<Endpoint>,
	request_id: String,
	tx: oneshot::Sender<Endpoint>,
}

/// Memory-aware admission control: a request is only handed a replica URL
/// once doing so leaves at least `min_free_blocks` free afterwards, under
/// the pessimistic assumption that every in-flight and pending request
/// still needs its full expected decode. Requests that can't be admitted
/// anywhere sit in an internal queue, ordered shortest-prefill-first with
/// FIFO as the tiebreak, and are only re-evaluated when a completion
/// frees capacity (`on_request_complete`) or a new arrival re-runs the
/// sweep.
///
/// The queue is guarded by its own lock, held for the duration of one
/// sweep; this lock is never held while calling into the monitor's own
/// lock, so the two critical sections can't cycle.
pub struct HraRouter {
	monitor: Arc<RequestStatsMonitor>,
	blocks: BlockAccounting,
	clock: Arc<dyn Clock>,
	queue: Mutex<Vec<QueuedRequest>>,
}

impl HraRouter {
	pub fn new(monitor: Arc<RequestStatsMonitor>, blocks: BlockAccounting, clock: Arc<dyn Clock>) -> Self {
		Self {
			monitor,
			blocks,
			clock,
			queue: Mutex::new(Vec::new()),
		}
	}

	fn try_schedule(&self) {
		let mut q = self.queue.lock().unwrap();
		if q.is_empty() {
			return;
		}

		let t_now = self.clock.now();
		let snapshot = self.monitor.get_stats(t_now);

		let mut replica_urls: HashSet<String> = HashSet::new();
		for qr in q.iter() {
			replica_urls.extend(qr.endpoints.iter().map(|e| e.url.clone()));
		}

		let mut allocated: HashMap<String, u64> = HashMap::new();
		let mut pending: HashMap<String, u64> = HashMap::new();
		let mut queue_lengths: HashMap<String, u64> = HashMap::new();
		for url in &replica_urls {
			let ep = Endpoint::new(url);
			allocated.insert(url.clone(), self.monitor.estimate_allocated_blocks(&ep, &self.blocks));
			pending.insert(url.clone(), self.monitor.estimate_pending_reserved_blocks(&ep, &self.blocks));
			let qlen = snapshot
				.get(url)
				.map(|s: &RequestStats| s.in_prefill + s.in_decoding)
				.unwrap_or(0);
			queue_lengths.insert(url.clone(), qlen);
		}

		let min_free_blocks = self.blocks.min_free_blocks();

		let mut idx = 0;
		while idx < q.len() {
			let prefill_tokens = q[idx].prefill_tokens;
			let req_blocks =
				((prefill_tokens as f64 * (1.0 + self.blocks.decode_to_prefill_ratio)) / self.blocks.block_size as f64)
					.ceil() as u64;

			let mut admissible: Vec<String> = Vec::new();
			for ep in &q[idx].endpoints {
				let projected = allocated[&ep.url] + pending[&ep.url] + req_blocks;
				// Signed so an overcommitted replica (projected > total_blocks) reads as
				// negative head room instead of clamping to 0, which would wrongly pass
				// the `>= min_free_blocks` check whenever min_free_blocks is itself 0.
				let free_after = self.blocks.total_blocks as i64 - projected as i64;
				if free_after >= min_free_blocks as i64 {
					admissible.push(ep.url.clone());
				}
			}

			if admissible.is_empty() {
				// This request can't fit anywhere right now; since the queue is
				// sorted shortest-prefill-first, nothing later in it is any
				// more likely to fit, so stop the sweep here.
				break;
			}

			let target = admissible
				.into_iter()
				.min_by_key(|u| queue_lengths[u])
				.expect("admissible is non-empty");

			let qr = q.remove(idx);
			let target_ep = Endpoint::new(&target);
			self
				.monitor
				.on_routed(&target_ep, &qr.request_id, qr.prefill_tokens);
			let _ = qr.tx.send(target_ep);

			*pending.get_mut(&target).unwrap() += req_blocks;
			*queue_lengths.get_mut(&target).unwrap() += 1;
			// Don't advance idx: the element we just removed shifted the rest down.
		}
	}
}

#[async_trait]
impl PlacementPolicy for HraRouter {
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

		let (tx, rx) = oneshot::channel();
		let arrived_at = self.clock.now();
		{
			let mut q = self.queue.lock().unwrap();
			q.push(QueuedRequest {
				prefill_tokens,
				arrived_at,
				endpoints: endpoints.to_vec(),
				request_id: request_id.to_string(),
				tx,
			});
			q.sort_by(|a, b| {
				(a.prefill_tokens, a.arrived_at)
					.partial_cmp(&(b.prefill_tokens, b.arrived_at))
					.expect("timestamps are never NaN")
			});
		}
		self.try_schedule();

		rx.await
			.map(Some)
			.map_err(|_| RouterError::Internal("HRA admission channel dropped before scheduling".to_string()))
	}

	fn on_request_complete(&self, _url: &Endpoint) {
		self.try_schedule();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::clock::ManualClock;
	use std::time::Duration;

	fn blocks(total: u64, safety_fraction: f64) -> BlockAccounting {
		BlockAccounting {
			block_size: 1,
			total_blocks: total,
			decode_to_prefill_ratio: 0.0,
			safety_fraction,
		}
	}

	fn router(total: u64, safety_fraction: f64) -> HraRouter {
		let monitor = Arc::new(RequestStatsMonitor::new(60.0));
		HraRouter::new(monitor, blocks(total, safety_fraction), Arc::new(ManualClock::new(0.0)))
	}

	#[tokio::test]
	async fn head_room_blocks_a_fat_request() {
		let r = router(10, 0.1); // min_free_blocks = 1
		let endpoints = vec![Endpoint::new("https://a")];
		let fut = r.route_request(&endpoints, &HashMap::new(), &HashMap::new(), &HashMap::new(), "fat", 20);
		let res = tokio::time::timeout(Duration::from_millis(50), fut).await;
		assert!(res.is_err(), "a request that can't preserve head room must stay queued");
	}

	#[tokio::test]
	async fn shortest_prefill_first_admits_small_before_queued_large() {
		let r = router(30, 0.1); // min_free_blocks = 3
		let endpoints = vec![Endpoint::new("https://a")];

		let large = r.route_request(&endpoints, &HashMap::new(), &HashMap::new(), &HashMap::new(), "large", 280);
		let large_res = tokio::time::timeout(Duration::from_millis(10), large);
		// Don't await yet; push large into the queue in the background.
		let large_handle = tokio::spawn(large_res);
		tokio::task::yield_now().await;

		let small = r
			.route_request(&endpoints, &HashMap::new(), &HashMap::new(), &HashMap::new(), "small", 16)
			.await
			.unwrap();
		assert_eq!(small.unwrap().url, "https://a");

		let large_timed_out = large_handle.await.unwrap();
		assert!(large_timed_out.is_err(), "large request should still be queued behind the smaller one");
	}

	#[tokio::test]
	async fn completion_triggered_sweep_admits_a_previously_blocked_request() {
		let monitor = Arc::new(RequestStatsMonitor::new(60.0));
		let b = blocks(10, 0.1);
		let clock = Arc::new(ManualClock::new(0.0));
		let r = HraRouter::new(monitor.clone(), b, clock);
		let occ = Endpoint::new("https://a");

		monitor.on_arrival("occ", 0.0);
		monitor.on_routed(&occ, "occ", 5);
		monitor.on_response(&occ, "occ", 0.1, true);

		let endpoints = vec![occ.clone()];
		let fut = r.route_request(&endpoints, &HashMap::new(), &HashMap::new(), &HashMap::new(), "queued", 1);
		let blocked = tokio::time::timeout(Duration::from_millis(20), fut).await;
		assert!(blocked.is_err());

		monitor.on_complete(&occ, "occ", 1.0);
		r.on_request_complete(&occ);

		// The future above was consumed by the timed-out call; issue a fresh
		// one representing the same still-queued request resolving now would
		// require holding onto the original receiver, so instead verify the
		// queue drained by routing a new request that only fits if the
		// sweep actually freed occ's blocks.
		let endpoints = vec![occ.clone()];
		let got = tokio::time::timeout(
			Duration::from_millis(20),
			r.route_request(&endpoints, &HashMap::new(), &HashMap::new(), &HashMap::new(), "after-free", 1),
		)
		.await
		.expect("capacity freed by completion should admit immediately")
		.unwrap()
		.unwrap();
		assert_eq!(got.url, "https://a");
	}

	#[tokio::test]
	async fn overcommitment_is_rejected_even_when_min_free_blocks_is_zero() {
		// total_blocks=50, safety_fraction=0.01 -> floor(0.5) = 0, so the
		// unsigned form of this check (`saturating_sub` clamped to 0) would
		// wrongly treat a deeply overcommitted replica as having exactly 0
		// free blocks, which satisfies `>= 0` and admits anyway.
		let r = router(50, 0.01);
		let endpoints = vec![Endpoint::new("https://a")];
		let fut = r.route_request(&endpoints, &HashMap::new(), &HashMap::new(), &HashMap::new(), "huge", 200);
		let res = tokio::time::timeout(Duration::from_millis(50), fut).await;
		assert!(res.is_err(), "projected usage far exceeding total_blocks must never be admitted");
	}

	#[tokio::test]
	async fn empty_endpoints_yields_no_url_without_queueing() {
		let r = router(10, 0.1);
		let got = r
			.route_request(&[], &HashMap::new(), &HashMap::new(), &HashMap::new(), "r1", 10)
			.await
			.unwrap();
		assert!(got.is_none());
		assert!(r.queue.lock().unwrap().is_empty());
	}
}
