use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;

/// Oldest records are evicted once the ring is full.
pub const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
	Ok,
	Failed,
	StreamAborted,
	ClientDisconnect,
}

/// One completed proxied call, successful or not.
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
	pub started_at: DateTime<Utc>,
	pub finished_at: DateTime<Utc>,
	pub model: String,
	pub provider: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub prompt_tokens: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub completion_tokens: Option<u64>,
	pub total_tokens: u64,
	pub status: CallStatus,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderSummary {
	pub requests: u64,
	pub failures: u64,
	pub prompt_tokens: u64,
	pub completion_tokens: u64,
	pub total_tokens: u64,
}

/// Bounded in-memory record of completed calls, for the admin surface only.
/// Nothing here feeds back into admission decisions.
#[derive(Clone)]
pub struct Ledger {
	inner: Arc<Mutex<VecDeque<UsageRecord>>>,
	capacity: usize,
}

impl Default for Ledger {
	fn default() -> Self {
		Ledger::with_capacity(DEFAULT_CAPACITY)
	}
}

impl Ledger {
	pub fn with_capacity(capacity: usize) -> Self {
		Ledger {
			inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
			capacity,
		}
	}

	pub fn append(&self, record: UsageRecord) {
		let mut ring = self.inner.lock();
		if ring.len() == self.capacity {
			ring.pop_front();
		}
		ring.push_back(record);
	}

	/// The most recent `n` records, newest first.
	pub fn recent(&self, n: usize) -> Vec<UsageRecord> {
		let ring = self.inner.lock();
		ring.iter().rev().take(n).cloned().collect()
	}

	pub fn summary_by_provider(&self) -> IndexMap<String, ProviderSummary> {
		let ring = self.inner.lock();
		let mut out: IndexMap<String, ProviderSummary> = IndexMap::new();
		for rec in ring.iter() {
			let entry = out.entry(rec.provider.clone()).or_default();
			entry.requests += 1;
			if rec.status != CallStatus::Ok {
				entry.failures += 1;
			}
			entry.prompt_tokens += rec.prompt_tokens.unwrap_or(0);
			entry.completion_tokens += rec.completion_tokens.unwrap_or(0);
			entry.total_tokens += rec.total_tokens;
		}
		out
	}

	pub fn clear(&self) {
		self.inner.lock().clear();
	}

	pub fn len(&self) -> usize {
		self.inner.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.lock().is_empty()
	}
}
