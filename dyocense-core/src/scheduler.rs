// dyocense-core/src/scheduler.rs
// ============================================================================
// Module: WFQ Scheduler
// Description: Weighted fair queuing across tenants with concurrency caps.
// Purpose: Dispatch runs fairly and without starvation on a bounded worker pool.
// Dependencies: crate::identifiers, std::sync::Mutex
// ============================================================================

//! ## Overview
//! Each tenant tracks a virtual finish time. On enqueue, a run's finish time
//! is `F_r = max(F_t_last, V) + S_r / w_t`; dispatch always picks the
//! eligible pending run with the smallest `F_r`, where eligible means the
//! tenant has not reached its concurrency cap. The scheduler holds all of its
//! state behind a single mutex, the same interior-mutability shape the
//! grounding codebase uses for its in-memory store.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;

use thiserror::Error;

use crate::identifiers::RunId;
use crate::identifiers::TenantId;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised by the WFQ Scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The run is not currently pending (already dispatched, or unknown).
    #[error("run {0} is not pending")]
    NotPending(RunId),
    /// The run is not currently dispatched (cannot be completed or re-queued).
    #[error("run {0} is not dispatched")]
    NotDispatched(RunId),
    /// The run exhausted its worker-crash re-queue budget and must fail.
    #[error("run {0} exhausted its re-queue budget")]
    RequeueBudgetExhausted(RunId),
    /// The scheduler's internal mutex was poisoned by a prior panic.
    #[error("scheduler state poisoned")]
    Poisoned,
}

/// Maximum number of times a run may be re-queued after a worker crash
/// before it is failed with `infrastructure_error`.
pub const MAX_REQUEUES: u32 = 2;

// ============================================================================
// SECTION: Pending / Dispatched Entries
// ============================================================================

/// A run waiting to be dispatched.
#[derive(Debug, Clone)]
struct PendingRun {
    run_id: RunId,
    tenant_id: TenantId,
    admitted_at: i64,
    finish_time: f64,
    max_parallel_runs: u32,
    requeue_count: u32,
}

/// A bounded record of one dispatch decision, for fairness observation.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchTraceEntry {
    /// Tenant the dispatched run belongs to.
    pub tenant_id: TenantId,
    /// The dispatched run.
    pub run_id: RunId,
    /// The run's virtual finish time at dispatch.
    pub finish_time: f64,
    /// The scheduler's global virtual clock at dispatch.
    pub virtual_clock: f64,
}

#[derive(Debug, Default)]
struct TenantState {
    last_finish_time: f64,
    running: u32,
}

struct Inner {
    pending: Vec<PendingRun>,
    dispatched: HashMap<RunId, PendingRun>,
    tenants: HashMap<TenantId, TenantState>,
    virtual_clock: f64,
    worker_count: u32,
    running_total: u32,
    trace: VecDeque<DispatchTraceEntry>,
}

const TRACE_CAPACITY: usize = 256;

// ============================================================================
// SECTION: Scheduler
// ============================================================================

/// Weighted fair queuing scheduler for one worker pool shared across tenants.
pub struct WfqScheduler {
    inner: Mutex<Inner>,
}

impl WfqScheduler {
    /// Creates a scheduler bound to a worker pool of `worker_count` slots.
    #[must_use]
    pub fn new(worker_count: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: Vec::new(),
                dispatched: HashMap::new(),
                tenants: HashMap::new(),
                virtual_clock: 0.0,
                worker_count,
                running_total: 0,
                trace: VecDeque::with_capacity(TRACE_CAPACITY),
            }),
        }
    }

    /// Enqueues a run for `tenant_id` with WFQ weight `weight` and estimated
    /// service demand `service_demand` (tier-profile wall-time × cost
    /// estimate; default `1.0`). A tenant with an empty queue starts at the
    /// global virtual clock, carrying no historical advantage or
    /// disadvantage.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Poisoned`] if the internal mutex was
    /// poisoned by a prior panic.
    pub fn enqueue(
        &self,
        run_id: RunId,
        tenant_id: TenantId,
        weight: f64,
        max_parallel_runs: u32,
        service_demand: f64,
        admitted_at: i64,
    ) -> Result<(), SchedulerError> {
        let mut inner = self.inner.lock().map_err(|_| SchedulerError::Poisoned)?;
        let virtual_clock = inner.virtual_clock;
        let tenant_state = inner.tenants.entry(tenant_id.clone()).or_default();
        let last_finish = if tenant_state.last_finish_time < virtual_clock {
            virtual_clock
        } else {
            tenant_state.last_finish_time
        };
        let finish_time = last_finish.max(virtual_clock) + service_demand / weight;
        tenant_state.last_finish_time = finish_time;

        inner.pending.push(PendingRun {
            run_id,
            tenant_id,
            admitted_at,
            finish_time,
            max_parallel_runs,
            requeue_count: 0,
        });
        Ok(())
    }

    /// Selects and removes the eligible pending run with the smallest finish
    /// time, ties broken by earlier `admitted_at` then lexicographic run id.
    /// Returns `None` when no run is eligible (queue empty, or every pending
    /// tenant is at its concurrency cap, or the worker pool is saturated).
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Poisoned`] if the internal mutex was
    /// poisoned by a prior panic.
    pub fn dispatch(&self) -> Result<Option<RunId>, SchedulerError> {
        let mut inner = self.inner.lock().map_err(|_| SchedulerError::Poisoned)?;
        if inner.running_total >= inner.worker_count {
            return Ok(None);
        }

        let best_index = inner
            .pending
            .iter()
            .enumerate()
            .filter(|(_, candidate)| {
                let running = inner.tenants.get(&candidate.tenant_id).map_or(0, |t| t.running);
                running < candidate.max_parallel_runs
            })
            .min_by(|(_, a), (_, b)| {
                a.finish_time
                    .partial_cmp(&b.finish_time)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.admitted_at.cmp(&b.admitted_at))
                    .then_with(|| a.run_id.cmp(&b.run_id))
            })
            .map(|(index, _)| index);

        let Some(index) = best_index else {
            return Ok(None);
        };

        let entry = inner.pending.remove(index);
        if entry.finish_time > inner.virtual_clock {
            inner.virtual_clock = entry.finish_time;
        }
        inner.running_total += 1;
        inner.tenants.entry(entry.tenant_id.clone()).or_default().running += 1;

        let virtual_clock = inner.virtual_clock;
        push_trace(
            &mut inner.trace,
            DispatchTraceEntry {
                tenant_id: entry.tenant_id.clone(),
                run_id: entry.run_id.clone(),
                finish_time: entry.finish_time,
                virtual_clock,
            },
        );

        let run_id = entry.run_id.clone();
        inner.dispatched.insert(run_id.clone(), entry);
        Ok(Some(run_id))
    }

    /// Marks a dispatched run as terminal, freeing its worker slot and
    /// decrementing the tenant's running count.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotDispatched`] if the run was not
    /// dispatched, or [`SchedulerError::Poisoned`] on a poisoned mutex.
    pub fn complete(&self, run_id: &RunId) -> Result<(), SchedulerError> {
        let mut inner = self.inner.lock().map_err(|_| SchedulerError::Poisoned)?;
        let entry = inner.dispatched.remove(run_id).ok_or_else(|| SchedulerError::NotDispatched(run_id.clone()))?;
        inner.running_total = inner.running_total.saturating_sub(1);
        if let Some(tenant) = inner.tenants.get_mut(&entry.tenant_id) {
            tenant.running = tenant.running.saturating_sub(1);
        }
        Ok(())
    }

    /// Re-queues a dispatched run after a worker crash, preserving its
    /// original finish time and incrementing its re-queue counter.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotDispatched`] if the run was not
    /// dispatched, [`SchedulerError::RequeueBudgetExhausted`] once
    /// [`MAX_REQUEUES`] re-queues have already happened, or
    /// [`SchedulerError::Poisoned`] on a poisoned mutex.
    pub fn requeue_after_crash(&self, run_id: &RunId) -> Result<(), SchedulerError> {
        let mut inner = self.inner.lock().map_err(|_| SchedulerError::Poisoned)?;
        let mut entry =
            inner.dispatched.remove(run_id).ok_or_else(|| SchedulerError::NotDispatched(run_id.clone()))?;
        inner.running_total = inner.running_total.saturating_sub(1);
        if let Some(tenant) = inner.tenants.get_mut(&entry.tenant_id) {
            tenant.running = tenant.running.saturating_sub(1);
        }

        if entry.requeue_count >= MAX_REQUEUES {
            return Err(SchedulerError::RequeueBudgetExhausted(run_id.clone()));
        }
        entry.requeue_count += 1;
        inner.pending.push(entry);
        Ok(())
    }

    /// Returns the most recent dispatch decisions, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Poisoned`] on a poisoned mutex.
    pub fn recent_dispatches(&self) -> Result<Vec<DispatchTraceEntry>, SchedulerError> {
        let inner = self.inner.lock().map_err(|_| SchedulerError::Poisoned)?;
        Ok(inner.trace.iter().cloned().collect())
    }

    /// Returns the number of runs currently pending across all tenants.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Poisoned`] on a poisoned mutex.
    pub fn pending_count(&self) -> Result<usize, SchedulerError> {
        let inner = self.inner.lock().map_err(|_| SchedulerError::Poisoned)?;
        Ok(inner.pending.len())
    }
}

fn push_trace(trace: &mut VecDeque<DispatchTraceEntry>, entry: DispatchTraceEntry) {
    if trace.len() == TRACE_CAPACITY {
        trace.pop_front();
    }
    trace.push_back(entry);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_returns_none_when_queue_is_empty() {
        let scheduler = WfqScheduler::new(4);
        assert_eq!(scheduler.dispatch().unwrap(), None);
    }

    #[test]
    fn higher_weight_tenant_receives_proportionally_more_dispatches() {
        let scheduler = WfqScheduler::new(1);
        for i in 0..8 {
            scheduler
                .enqueue(RunId::new(format!("a{i}")), TenantId::new("A"), 1.0, 10, 1.0, i)
                .unwrap();
            scheduler
                .enqueue(RunId::new(format!("b{i}")), TenantId::new("B"), 3.0, 10, 1.0, i)
                .unwrap();
        }

        let mut counts: HashMap<TenantId, u32> = HashMap::new();
        for _ in 0..8 {
            let run_id = scheduler.dispatch().unwrap().expect("a run should be eligible");
            let tenant_id = if run_id.as_str().starts_with('a') { TenantId::new("A") } else { TenantId::new("B") };
            *counts.entry(tenant_id.clone()).or_insert(0) += 1;
            scheduler.complete(&run_id).unwrap();
        }

        let a = *counts.get(&TenantId::new("A")).unwrap_or(&0);
        let b = *counts.get(&TenantId::new("B")).unwrap_or(&0);
        assert!(b >= 2 * a, "expected tenant B (weight 3) to receive roughly 3x tenant A's dispatches, got a={a} b={b}");
    }

    #[test]
    fn concurrency_cap_blocks_dispatch_past_the_limit() {
        let scheduler = WfqScheduler::new(4);
        scheduler.enqueue(RunId::new("r1"), TenantId::new("A"), 1.0, 1, 1.0, 0).unwrap();
        scheduler.enqueue(RunId::new("r2"), TenantId::new("A"), 1.0, 1, 1.0, 1).unwrap();

        let first = scheduler.dispatch().unwrap();
        assert_eq!(first, Some(RunId::new("r1")));
        let second = scheduler.dispatch().unwrap();
        assert_eq!(second, None, "tenant A is already at its cap of 1");

        scheduler.complete(&RunId::new("r1")).unwrap();
        let third = scheduler.dispatch().unwrap();
        assert_eq!(third, Some(RunId::new("r2")));
    }

    #[test]
    fn requeue_budget_is_exhausted_after_two_crashes() {
        let scheduler = WfqScheduler::new(1);
        scheduler.enqueue(RunId::new("r1"), TenantId::new("A"), 1.0, 1, 1.0, 0).unwrap();
        scheduler.dispatch().unwrap();
        scheduler.requeue_after_crash(&RunId::new("r1")).unwrap();
        scheduler.dispatch().unwrap();
        scheduler.requeue_after_crash(&RunId::new("r1")).unwrap();
        scheduler.dispatch().unwrap();
        let result = scheduler.requeue_after_crash(&RunId::new("r1"));
        assert!(matches!(result, Err(SchedulerError::RequeueBudgetExhausted(_))));
    }

    #[test]
    fn ties_break_on_admitted_at_then_run_id() {
        let scheduler = WfqScheduler::new(1);
        scheduler.enqueue(RunId::new("z"), TenantId::new("A"), 1.0, 10, 1.0, 0).unwrap();
        scheduler.enqueue(RunId::new("a"), TenantId::new("B"), 1.0, 10, 1.0, 0).unwrap();
        let first = scheduler.dispatch().unwrap().unwrap();
        assert_eq!(first, RunId::new("a"), "equal finish time and admitted_at breaks on lexicographic run_id");
    }
}
