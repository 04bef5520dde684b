use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::store::Limits;

const MINUTE: Duration = Duration::from_secs(60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Coarse token estimate used when the caller supplies no ceiling: one token
/// per four characters, rounded up.
pub fn estimate_tokens(chars: usize) -> u64 {
	chars.div_ceil(4) as u64
}

/// Why a provider cannot admit a request right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum DenyReason {
	Rpm { used: u64, limit: u64 },
	Tpm { used: u64, limit: u64, hint: u64 },
	Rpd { used: u64, limit: u64 },
	Tpr { hint: u64, limit: u64 },
}

impl std::fmt::Display for DenyReason {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			DenyReason::Rpm { used, limit } => write!(f, "rpm limit reached ({used}/{limit})"),
			DenyReason::Tpm { used, limit, hint } => {
				write!(f, "tpm limit reached ({used}+{hint}/{limit})")
			},
			DenyReason::Rpd { used, limit } => write!(f, "rpd limit reached ({used}/{limit})"),
			DenyReason::Tpr { hint, limit } => {
				write!(f, "request exceeds tpr ceiling ({hint}/{limit})")
			},
		}
	}
}

/// Handle returned by [`Limiter::reserve`]; consumed by exactly one of
/// `commit` or `rollback`.
#[must_use]
#[derive(Debug)]
pub struct Ticket {
	at: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct LimiterStatus {
	pub rpm_used: u64,
	pub tpm_used: u64,
	pub rpd_used: u64,
	pub rpm_limit: Option<u64>,
	pub tpm_limit: Option<u64>,
	pub rpd_limit: Option<u64>,
}

#[derive(Debug, Default)]
struct Buckets {
	req_60s: VecDeque<Instant>,
	tok_60s: VecDeque<(Instant, u64)>,
	req_24h: VecDeque<Instant>,
}

impl Buckets {
	// Buckets are timestamp-ordered, so eviction only ever pops the front.
	fn evict(&mut self, now: Instant) {
		while let Some(t) = self.req_60s.front() {
			if now.duration_since(*t) >= MINUTE {
				self.req_60s.pop_front();
			} else {
				break;
			}
		}
		while let Some((t, _)) = self.tok_60s.front() {
			if now.duration_since(*t) >= MINUTE {
				self.tok_60s.pop_front();
			} else {
				break;
			}
		}
		while let Some(t) = self.req_24h.front() {
			if now.duration_since(*t) >= DAY {
				self.req_24h.pop_front();
			} else {
				break;
			}
		}
	}

	fn tokens_used(&self) -> u64 {
		self.tok_60s.iter().map(|(_, n)| n).sum()
	}
}

/// Sliding-window counters for one provider. Limits are passed in per call
/// because they live in the routing document and can change under us, while
/// the counters must survive those edits.
#[derive(Debug, Default)]
pub struct Limiter {
	state: Mutex<Buckets>,
}

impl Limiter {
	/// Tests whether a request could be admitted right now. Evicts expired
	/// entries but records nothing.
	pub fn check(&self, limits: &Limits, tokens_hint: Option<u64>) -> Result<(), DenyReason> {
		self.check_at(Instant::now(), limits, tokens_hint)
	}

	fn check_at(
		&self,
		now: Instant,
		limits: &Limits,
		tokens_hint: Option<u64>,
	) -> Result<(), DenyReason> {
		let mut b = self.state.lock();
		b.evict(now);
		if let Some(limit) = limits.rpm {
			let used = b.req_60s.len() as u64;
			if used + 1 > limit {
				return Err(DenyReason::Rpm { used, limit });
			}
		}
		if let Some(limit) = limits.rpd {
			let used = b.req_24h.len() as u64;
			if used + 1 > limit {
				return Err(DenyReason::Rpd { used, limit });
			}
		}
		// Without a hint only the request windows can be pre-checked; commit
		// still records whatever the call actually consumed.
		if let Some(hint) = tokens_hint {
			if let Some(limit) = limits.tpr
				&& hint > limit
			{
				return Err(DenyReason::Tpr { hint, limit });
			}
			if let Some(limit) = limits.tpm {
				let used = b.tokens_used();
				if used + hint > limit {
					return Err(DenyReason::Tpm { used, limit, hint });
				}
			}
		}
		Ok(())
	}

	/// Records a request start in both request windows.
	pub fn reserve(&self) -> Ticket {
		self.reserve_at(Instant::now())
	}

	fn reserve_at(&self, now: Instant) -> Ticket {
		let mut b = self.state.lock();
		b.evict(now);
		b.req_60s.push_back(now);
		b.req_24h.push_back(now);
		Ticket { at: now }
	}

	/// Records observed token consumption for a reserved request.
	pub fn commit(&self, ticket: Ticket, tokens: u64) {
		self.commit_at(Instant::now(), ticket, tokens)
	}

	fn commit_at(&self, now: Instant, ticket: Ticket, tokens: u64) {
		let Ticket { at: _ } = ticket;
		let mut b = self.state.lock();
		b.evict(now);
		b.tok_60s.push_back((now, tokens));
	}

	/// Undoes a reserve whose call failed before any response byte. Leaves
	/// the counters exactly as they were before the reserve.
	pub fn rollback(&self, ticket: Ticket) {
		let mut b = self.state.lock();
		if let Some(i) = b.req_60s.iter().rposition(|t| *t == ticket.at) {
			b.req_60s.remove(i);
		}
		if let Some(i) = b.req_24h.iter().rposition(|t| *t == ticket.at) {
			b.req_24h.remove(i);
		}
	}

	pub fn reset(&self) {
		let mut b = self.state.lock();
		b.req_60s.clear();
		b.tok_60s.clear();
		b.req_24h.clear();
	}

	pub fn status(&self, limits: &Limits) -> LimiterStatus {
		self.status_at(Instant::now(), limits)
	}

	fn status_at(&self, now: Instant, limits: &Limits) -> LimiterStatus {
		let mut b = self.state.lock();
		b.evict(now);
		LimiterStatus {
			rpm_used: b.req_60s.len() as u64,
			tpm_used: b.tokens_used(),
			rpd_used: b.req_24h.len() as u64,
			rpm_limit: limits.rpm,
			tpm_limit: limits.tpm,
			rpd_limit: limits.rpd,
		}
	}
}

/// Name-keyed limiter registry. Counters belong to the provider name, so a
/// disabled binding keeps its history and a config reload only drops
/// limiters whose provider disappeared from the document.
#[derive(Clone, Default)]
pub struct Registry {
	inner: Arc<Mutex<HashMap<String, Arc<Limiter>>>>,
}

impl Registry {
	pub fn get(&self, provider: &str) -> Arc<Limiter> {
		let mut map = self.inner.lock();
		map.entry(provider.to_string()).or_default().clone()
	}

	/// Drops limiters for providers no longer present.
	pub fn retain<'a>(&self, live: impl Iterator<Item = &'a str>) {
		let keep: std::collections::HashSet<&str> = live.collect();
		self.inner.lock().retain(|name, _| keep.contains(name.as_str()));
	}

	pub fn names(&self) -> Vec<String> {
		self.inner.lock().keys().cloned().collect()
	}
}
