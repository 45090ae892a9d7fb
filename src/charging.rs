//! Charging rules for HPC resources by machine and queue.
//!
//! Two policy families exist. Node-allocated machines (Derecho) bill whole
//! nodes on production queues and actual requested resources on development
//! queues; shared-node machines (Casper) bill actual requested resources on
//! all three axes with no production/development split.
//!
//! The same formulas exist twice on purpose: as a pure per-job function
//! ([`charge`]) for ad-hoc use and tests, and as a generated SQL view
//! ([`charged_view_sql`]) for bulk computation inside the store. Both are
//! built from the constants below, and the test suite asserts they agree on
//! every classification branch.

use crate::models::{Charge, Job, Machine, MachineFamily};

/// CPU cores per compute node on node-allocated machines.
pub const CORES_PER_NODE: i64 = 128;
/// GPUs per GPU node on node-allocated machines.
pub const GPUS_PER_NODE: i64 = 4;

pub const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;
pub const SECONDS_PER_HOUR: f64 = 3600.0;

/// Queue classification on node-allocated machines.
///
/// Derived from the queue name: a `gpu` marker selects the GPU axis, a
/// `dev` marker selects actual-allocation billing. The GPU check runs
/// before the dev check so a name carrying both markers (e.g. `gpudev`)
/// lands on GPU-development, never CPU-development.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    GpuProduction,
    CpuProduction,
    GpuDevelopment,
    CpuDevelopment,
}

impl QueueKind {
    pub fn is_gpu(&self) -> bool {
        matches!(self, QueueKind::GpuProduction | QueueKind::GpuDevelopment)
    }
}

/// Queue names with a known billing class. Anything else still classifies
/// by pattern, but [`classify`] reports it as unrecognized so the caller
/// can surface a policy-gap warning instead of charging silently.
const KNOWN_QUEUES: [&str; 7] = ["main", "cpu", "cpudev", "develop", "gpu", "gpudev", "pgpu"];

/// Classification result: the billing class plus whether the queue name is
/// on the known-policy list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClass {
    pub kind: QueueKind,
    pub recognized: bool,
}

/// Classify a queue name into its billing class.
///
/// Pattern matching is total: a name matching neither marker takes the
/// whole-node production branch, which is the most conservative policy.
pub fn classify(queue: &str) -> QueueClass {
    let q = queue.to_ascii_lowercase();
    let gpu = q.contains("gpu");
    let dev = q.contains("dev");
    let kind = match (gpu, dev) {
        (true, true) => QueueKind::GpuDevelopment,
        (true, false) => QueueKind::GpuProduction,
        (false, true) => QueueKind::CpuDevelopment,
        (false, false) => QueueKind::CpuProduction,
    };
    QueueClass {
        kind,
        recognized: KNOWN_QUEUES.contains(&q.as_str()),
    }
}

/// Compute charges for one job under the machine's policy.
///
/// Missing numeric inputs count as zero here and only here: charging must
/// always produce a number, so "unknown" never propagates into aggregation
/// as a NULL.
pub fn charge(machine: Machine, job: &Job) -> Charge {
    let elapsed = job.elapsed.unwrap_or(0) as f64;
    let numcpus = job.numcpus.unwrap_or(0) as f64;
    let numgpus = job.numgpus.unwrap_or(0) as f64;
    let numnodes = job.numnodes.unwrap_or(0) as f64;
    let memory = job.memory.unwrap_or(0) as f64;

    let memory_hours = elapsed * memory / (SECONDS_PER_HOUR * BYTES_PER_GB);

    match machine.family() {
        MachineFamily::NodeAllocated => {
            let kind = classify(job.queue.as_deref().unwrap_or("")).kind;
            let cpu_hours = match kind {
                QueueKind::CpuDevelopment | QueueKind::GpuDevelopment => {
                    elapsed * numcpus / SECONDS_PER_HOUR
                }
                QueueKind::CpuProduction | QueueKind::GpuProduction => {
                    elapsed * numnodes * CORES_PER_NODE as f64 / SECONDS_PER_HOUR
                }
            };
            let gpu_hours = match kind {
                QueueKind::GpuDevelopment => elapsed * numgpus / SECONDS_PER_HOUR,
                QueueKind::GpuProduction => {
                    elapsed * numnodes * GPUS_PER_NODE as f64 / SECONDS_PER_HOUR
                }
                _ => 0.0,
            };
            let charge_hours = if kind.is_gpu() { gpu_hours } else { cpu_hours };
            Charge {
                cpu_hours,
                gpu_hours,
                memory_hours,
                charge_hours,
            }
        }
        MachineFamily::SharedNode => Charge {
            cpu_hours: elapsed * numcpus / SECONDS_PER_HOUR,
            gpu_hours: elapsed * numgpus / SECONDS_PER_HOUR,
            memory_hours,
            // Shared-node machines have no single billing axis
            charge_hours: 0.0,
        },
    }
}

/// Generate the `v_jobs_charged` CREATE VIEW statement for a machine.
///
/// Built from the same constants as [`charge`] so the two can never drift.
/// SQLite does not allow a SELECT item to reference a sibling alias, so the
/// hour expressions are repeated where `charge_hours` needs them.
pub fn charged_view_sql(machine: Machine) -> String {
    match machine.family() {
        MachineFamily::NodeAllocated => {
            let cpu = format!(
                "CASE WHEN lower(COALESCE(queue, '')) LIKE '%dev%' \
                 THEN COALESCE(elapsed, 0) * COALESCE(numcpus, 0) / {SECONDS_PER_HOUR:.1} \
                 ELSE COALESCE(elapsed, 0) * COALESCE(numnodes, 0) * {CORES_PER_NODE} / {SECONDS_PER_HOUR:.1} END"
            );
            let gpu = format!(
                "CASE WHEN lower(COALESCE(queue, '')) LIKE '%gpu%' AND lower(COALESCE(queue, '')) LIKE '%dev%' \
                 THEN COALESCE(elapsed, 0) * COALESCE(numgpus, 0) / {SECONDS_PER_HOUR:.1} \
                 WHEN lower(COALESCE(queue, '')) LIKE '%gpu%' \
                 THEN COALESCE(elapsed, 0) * COALESCE(numnodes, 0) * {GPUS_PER_NODE} / {SECONDS_PER_HOUR:.1} \
                 ELSE 0.0 END"
            );
            format!(
                "CREATE VIEW IF NOT EXISTS v_jobs_charged AS\n\
                 SELECT *,\n  {cpu} AS cpu_hours,\n  {gpu} AS gpu_hours,\n  \
                 COALESCE(elapsed, 0) * COALESCE(memory, 0) / ({SECONDS_PER_HOUR:.1} * {BYTES_PER_GB:.1}) AS memory_hours,\n  \
                 CASE WHEN lower(COALESCE(queue, '')) LIKE '%gpu%' THEN {gpu} ELSE {cpu} END AS charge_hours\n\
                 FROM jobs;"
            )
        }
        MachineFamily::SharedNode => format!(
            "CREATE VIEW IF NOT EXISTS v_jobs_charged AS\n\
             SELECT *,\n  \
             COALESCE(elapsed, 0) * COALESCE(numcpus, 0) / {SECONDS_PER_HOUR:.1} AS cpu_hours,\n  \
             COALESCE(elapsed, 0) * COALESCE(numgpus, 0) / {SECONDS_PER_HOUR:.1} AS gpu_hours,\n  \
             COALESCE(elapsed, 0) * COALESCE(memory, 0) / ({SECONDS_PER_HOUR:.1} * {BYTES_PER_GB:.1}) AS memory_hours,\n  \
             0.0 AS charge_hours\n\
             FROM jobs;"
        ),
    }
}
