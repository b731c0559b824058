use std::sync::Arc;

use crate::config::BlockAccounting;
use crate::endpoint::Endpoint;
use crate::stats::RequestStatsMonitor;

/// One row of the external per-tick metrics feed. The core only builds
/// the row; writing it to a file or a metrics backend is left to the
/// embedding binary, per the "core emits the data" split.
pub struct ScheduleTickRow {
	pub time: f64,
	pub replica_id: String,
	pub num_pending_requests: u64,
	pub num_active_requests: u64,
	pub num_allocated_blocks: u64,
	pub num_blocks: u64,
	pub memory_usage_percent: f64,
}

pub const CSV_HEADER: &str =
	"time,replica_id,num_pending_requests,num_active_requests,num_allocated_blocks,num_blocks,memory_usage_percent";

impl ScheduleTickRow {
	pub fn to_csv_row(&self) -> String {
		format!(
			"{},{},{},{},{},{},{:.4}",
			self.time,
			self.replica_id,
			self.num_pending_requests,
			self.num_active_requests,
			self.num_allocated_blocks,
			self.num_blocks,
			self.memory_usage_percent
		)
	}
}

/// Builds one row per URL present in the snapshot, at `t_now`.
pub fn schedule_tick_rows(monitor: &Arc<RequestStatsMonitor>, blocks: &BlockAccounting, t_now: f64) -> Vec<ScheduleTickRow> {
	let snapshot = monitor.get_stats(t_now);
	let mut rows: Vec<ScheduleTickRow> = snapshot
		.into_iter()
		.map(|(url, stats)| {
			let allocated = monitor.estimate_allocated_blocks(&Endpoint::new(&url), blocks);
			let memory_usage_percent = if blocks.total_blocks == 0 {
				0.0
			} else {
				allocated as f64 / blocks.total_blocks as f64 * 100.0
			};
			ScheduleTickRow {
				time: t_now,
				replica_id: url,
				num_pending_requests: stats.in_prefill,
				num_active_requests: stats.in_decoding,
				num_allocated_blocks: allocated,
				num_blocks: blocks.total_blocks,
				memory_usage_percent,
			}
		})
		.collect();
	rows.sort_by(|a, b| a.replica_id.cmp(&b.replica_id));
	rows
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn row_formats_with_header_matching_field_order() {
		let row = ScheduleTickRow {
			time: 12.5,
			replica_id: "https://r1".to_string(),
			num_pending_requests: 2,
			num_active_requests: 3,
			num_allocated_blocks: 40,
			num_blocks: 2756,
			memory_usage_percent: 1.4514,
		};
		assert_eq!(row.to_csv_row(), "12.5,https://r1,2,3,40,2756,1.4514");
		assert_eq!(CSV_HEADER.split(',').count(), row.to_csv_row().split(',').count());
	}

	#[test]
	fn schedule_tick_rows_are_sorted_and_reflect_the_snapshot() {
		let monitor = Arc::new(RequestStatsMonitor::new(60.0));
		let blocks = BlockAccounting::default();
		let url = Endpoint::new("https://r1");
		monitor.on_arrival("req1", 0.0);
		monitor.on_routed(&url, "req1", 100);

		let rows = schedule_tick_rows(&monitor, &blocks, 1.0);
		assert_eq!(rows.len(), 1);
		assert_eq!(rows[0].replica_id, "https://r1");
		assert_eq!(rows[0].num_pending_requests, 1);
		assert_eq!(rows[0].num_active_requests, 0);
	}
}
