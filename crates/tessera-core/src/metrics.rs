//! Run statistics.
//!
//! `RuntimeMetrics` is the counter sink the runtime reports into: a run
//! timer, instruction and kernel counters, transfer and allocation counters
//! and code cache counters. One instance is shared (behind an `Arc`) by
//! everything that takes part in a run, so counts are visible process-wide
//! while tests can still build a fresh instance per case.
//!
//! All counters are atomics; the few composite values (timer, per-opcode
//! table, last report) sit behind mutexes that are never held across calls
//! into other components.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Cumulative statistics for one opcode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpcodeStats {
    pub count: u64,
    pub total_time: Duration,
}

#[derive(Debug, Default)]
struct RunTimer {
    active: usize,
    last_run: Duration,
    total: Duration,
}

/// Start of one run, returned by [`RuntimeMetrics::start_run_timer`].
///
/// Every run carries its own token, so runs overlapping on other threads
/// do not disturb each other's timing.
#[derive(Debug)]
#[must_use = "a run timer must be stopped with `stop_run_timer`"]
pub struct RunTimerToken {
    started: Instant,
}

impl RunTimerToken {
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Point-in-time copy of the plain counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub runs_started: u64,
    pub runs_completed: u64,
    pub reports_produced: u64,
    pub executed_instructions: u64,
    pub kernel_launches: u64,
    pub host_to_device_transfers: u64,
    pub host_to_device_bytes: u64,
    pub device_to_host_transfers: u64,
    pub device_to_host_bytes: u64,
    pub device_allocations: u64,
    pub device_frees: u64,
    pub codegen_compilations: u64,
    pub codegen_cache_hits: u64,
    pub codegen_cache_misses: u64,
    pub codegen_flushes: u64,
    pub codegen_evictions: u64,
}

/// Counters, timers and report rendering for program runs.
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    extra_device_stats: AtomicBool,
    extra_kernel_stats: AtomicBool,

    timer: Mutex<RunTimer>,
    runs_started: AtomicU64,
    runs_completed: AtomicU64,
    reports_produced: AtomicU64,

    executed_instructions: AtomicU64,
    kernel_launches: AtomicU64,
    opcode_stats: Mutex<HashMap<String, OpcodeStats>>,

    host_to_device_transfers: AtomicU64,
    host_to_device_bytes: AtomicU64,
    device_to_host_transfers: AtomicU64,
    device_to_host_bytes: AtomicU64,
    device_allocations: AtomicU64,
    device_frees: AtomicU64,

    codegen_compilations: AtomicU64,
    codegen_cache_hits: AtomicU64,
    codegen_cache_misses: AtomicU64,
    codegen_flushes: AtomicU64,
    codegen_evictions: AtomicU64,

    last_report: Mutex<Option<String>>,
}

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
///
/// Metrics are written from cleanup paths that may run during unwinding.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Diagnostic toggles ───────────────────────────────────────────────

    pub fn set_extra_device_stats(&self, enabled: bool) {
        self.extra_device_stats.store(enabled, Ordering::Relaxed);
    }

    pub fn extra_device_stats(&self) -> bool {
        self.extra_device_stats.load(Ordering::Relaxed)
    }

    pub fn set_extra_kernel_stats(&self, enabled: bool) {
        self.extra_kernel_stats.store(enabled, Ordering::Relaxed);
    }

    pub fn extra_kernel_stats(&self) -> bool {
        self.extra_kernel_stats.load(Ordering::Relaxed)
    }

    // ── Run timer ────────────────────────────────────────────────────────

    /// Start timing a run.
    pub fn start_run_timer(&self) -> RunTimerToken {
        lock(&self.timer).active += 1;
        self.runs_started.fetch_add(1, Ordering::Relaxed);
        RunTimerToken {
            started: Instant::now(),
        }
    }

    /// Stop timing the run `token` belongs to and return its elapsed time.
    pub fn stop_run_timer(&self, token: RunTimerToken) -> Duration {
        let elapsed = token.elapsed();
        let mut timer = lock(&self.timer);
        timer.active = timer.active.saturating_sub(1);
        timer.last_run = elapsed;
        timer.total += elapsed;
        self.runs_completed.fetch_add(1, Ordering::Relaxed);
        elapsed
    }

    /// Whether any run is currently being timed.
    pub fn is_run_timer_running(&self) -> bool {
        lock(&self.timer).active > 0
    }

    /// Duration of the most recently completed run.
    pub fn last_run_time(&self) -> Duration {
        lock(&self.timer).last_run
    }

    /// Summed duration of every completed run.
    pub fn total_run_time(&self) -> Duration {
        lock(&self.timer).total
    }

    // ── Instruction and kernel counters ──────────────────────────────────

    pub fn increment_executed_instructions(&self) {
        self.executed_instructions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one completed kernel launch for `opcode`.
    ///
    /// Per-opcode timings are only kept while extra kernel stats are on.
    pub fn record_kernel(&self, opcode: &str, elapsed: Duration) {
        self.kernel_launches.fetch_add(1, Ordering::Relaxed);
        if self.extra_kernel_stats() {
            let mut stats = lock(&self.opcode_stats);
            let entry = stats.entry(opcode.to_string()).or_default();
            entry.count += 1;
            entry.total_time += elapsed;
        }
    }

    pub fn opcode_stats(&self, opcode: &str) -> Option<OpcodeStats> {
        lock(&self.opcode_stats).get(opcode).copied()
    }

    // ── Device counters ──────────────────────────────────────────────────

    pub fn record_host_to_device(&self, bytes: usize) {
        self.host_to_device_transfers.fetch_add(1, Ordering::Relaxed);
        self.host_to_device_bytes
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_device_to_host(&self, bytes: usize) {
        self.device_to_host_transfers.fetch_add(1, Ordering::Relaxed);
        self.device_to_host_bytes
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_device_allocation(&self) {
        self.device_allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_device_free(&self) {
        self.device_frees.fetch_add(1, Ordering::Relaxed);
    }

    // ── Code cache counters ──────────────────────────────────────────────

    pub fn record_codegen_compilation(&self) {
        self.codegen_compilations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_codegen_hit(&self) {
        self.codegen_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_codegen_miss(&self) {
        self.codegen_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_codegen_flush(&self, evicted: usize) {
        self.codegen_flushes.fetch_add(1, Ordering::Relaxed);
        self.codegen_evictions
            .fetch_add(evicted as u64, Ordering::Relaxed);
    }

    // ── Reporting ────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            runs_started: self.runs_started.load(Ordering::Relaxed),
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
            reports_produced: self.reports_produced.load(Ordering::Relaxed),
            executed_instructions: self.executed_instructions.load(Ordering::Relaxed),
            kernel_launches: self.kernel_launches.load(Ordering::Relaxed),
            host_to_device_transfers: self.host_to_device_transfers.load(Ordering::Relaxed),
            host_to_device_bytes: self.host_to_device_bytes.load(Ordering::Relaxed),
            device_to_host_transfers: self.device_to_host_transfers.load(Ordering::Relaxed),
            device_to_host_bytes: self.device_to_host_bytes.load(Ordering::Relaxed),
            device_allocations: self.device_allocations.load(Ordering::Relaxed),
            device_frees: self.device_frees.load(Ordering::Relaxed),
            codegen_compilations: self.codegen_compilations.load(Ordering::Relaxed),
            codegen_cache_hits: self.codegen_cache_hits.load(Ordering::Relaxed),
            codegen_cache_misses: self.codegen_cache_misses.load(Ordering::Relaxed),
            codegen_flushes: self.codegen_flushes.load(Ordering::Relaxed),
            codegen_evictions: self.codegen_evictions.load(Ordering::Relaxed),
        }
    }

    /// Render the human-readable statistics block.
    ///
    /// This is a pure read of the accumulated counters.
    pub fn report(&self) -> String {
        let s = self.snapshot();
        let mut out = String::new();

        let _ = writeln!(out, "Tessera Statistics:");
        let _ = writeln!(
            out,
            "Total execution time:\t\t{:.3} sec.",
            self.last_run_time().as_secs_f64()
        );
        let _ = writeln!(out, "Number of executed device inst:\t{}.", s.executed_instructions);
        let _ = writeln!(out, "Number of kernel launches:\t{}.", s.kernel_launches);
        let _ = writeln!(
            out,
            "Codegen compile (count):\t{}.",
            s.codegen_compilations
        );
        let _ = writeln!(
            out,
            "Codegen cache (hits/misses/evicted):\t{}/{}/{}.",
            s.codegen_cache_hits, s.codegen_cache_misses, s.codegen_evictions
        );

        if self.extra_device_stats() {
            let _ = writeln!(
                out,
                "Device H2D (count/bytes):\t{}/{}.",
                s.host_to_device_transfers, s.host_to_device_bytes
            );
            let _ = writeln!(
                out,
                "Device D2H (count/bytes):\t{}/{}.",
                s.device_to_host_transfers, s.device_to_host_bytes
            );
            let _ = writeln!(
                out,
                "Device alloc/free (count):\t{}/{}.",
                s.device_allocations, s.device_frees
            );
        }

        if self.extra_kernel_stats() {
            let stats = lock(&self.opcode_stats);
            let mut rows: Vec<_> = stats.iter().collect();
            rows.sort_by(|a, b| b.1.total_time.cmp(&a.1.total_time).then(a.0.cmp(b.0)));
            let _ = writeln!(out, "Kernel timings (opcode, count, time):");
            for (opcode, stat) in rows {
                let _ = writeln!(
                    out,
                    "  {:<10}\t{:>8}\t{:.6} sec.",
                    opcode,
                    stat.count,
                    stat.total_time.as_secs_f64()
                );
            }
        }

        out
    }

    /// Render the report, keep it as the last report and count it.
    pub fn produce_report(&self) -> String {
        let report = self.report();
        *lock(&self.last_report) = Some(report.clone());
        self.reports_produced.fetch_add(1, Ordering::Relaxed);
        report
    }

    pub fn last_report(&self) -> Option<String> {
        lock(&self.last_report).clone()
    }

    /// Clear every counter, timing and the stored report.
    ///
    /// Diagnostic toggles are left as they are.
    pub fn reset(&self) {
        *lock(&self.timer) = RunTimer::default();
        lock(&self.opcode_stats).clear();
        *lock(&self.last_report) = None;
        for counter in [
            &self.runs_started,
            &self.runs_completed,
            &self.reports_produced,
            &self.executed_instructions,
            &self.kernel_launches,
            &self.host_to_device_transfers,
            &self.host_to_device_bytes,
            &self.device_to_host_transfers,
            &self.device_to_host_bytes,
            &self.device_allocations,
            &self.device_frees,
            &self.codegen_compilations,
            &self.codegen_cache_hits,
            &self.codegen_cache_misses,
            &self.codegen_flushes,
            &self.codegen_evictions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        tracing::trace!("runtime metrics reset");
    }
}
