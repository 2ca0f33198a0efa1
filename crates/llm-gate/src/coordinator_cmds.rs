use anyhow::Result;
use chrono::{DateTime, Utc};
use gate_config::GateConfig;
use gate_coordinator::{Coordinator, CoordinatorStatus, QueueStateRecord, WorkStealingSummary};
use gate_core::{OutputFormat, system_clock};
use serde::Serialize;
use std::fmt::Write as _;

/// The CLI never registers, so it observes the cluster without joining it.
fn observer(config: &GateConfig) -> Coordinator {
    Coordinator::from_config(config, system_clock())
}

fn render_status(status: &CoordinatorStatus, dir: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Coordination dir: {dir}");
    let _ = writeln!(
        out,
        "Live instances:   {} (timeout {} ms)",
        status.usage.instances, status.heartbeat_timeout_ms
    );
    let _ = writeln!(
        out,
        "Fair share:       {} of {} per instance",
        status.my_parallel_limit, status.total_max_llm
    );
    let _ = writeln!(out, "Active requests:  {}", status.usage.active_requests);
    let _ = writeln!(out, "Active LLM calls: {}", status.usage.active_llm);
    let _ = writeln!(out, "Pending tasks:    {}", status.usage.pending_tasks);
    out
}

pub(crate) fn handle_status(config: &GateConfig, format: OutputFormat) -> Result<()> {
    let coordinator = observer(config);
    let status = coordinator.get_coordinator_status();
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
        OutputFormat::Text => print!(
            "{}",
            render_status(&status, &coordinator.dir().display().to_string())
        ),
    }
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueuesReport {
    summary: WorkStealingSummary,
    queues: Vec<QueueStateRecord>,
}

fn render_queues(report: &QueuesReport, now: DateTime<Utc>) -> String {
    let mut out = String::new();
    if report.queues.is_empty() {
        out.push_str("No fresh queue snapshots.\n");
        return out;
    }
    for queue in &report.queues {
        let age_ms = (now - queue.timestamp).num_milliseconds().max(0);
        let _ = writeln!(
            out,
            "{}  pending={} orchestrations={} age={}ms",
            queue.instance_id, queue.pending_task_count, queue.active_orchestrations, age_ms
        );
        for entry in &queue.stealable_entries {
            let _ = writeln!(
                out,
                "  {:<10} {}:{}  {}",
                entry.priority.as_str(),
                entry.provider,
                entry.model,
                entry.task_id
            );
        }
    }
    let _ = writeln!(
        out,
        "Total pending: {} across {} instance(s), busiest: {}",
        report.summary.total_remote_pending,
        report.summary.remote_instances,
        report.summary.busiest_instance.as_deref().unwrap_or("-")
    );
    out
}

pub(crate) fn handle_queues(config: &GateConfig, format: OutputFormat) -> Result<()> {
    let coordinator = observer(config);
    let report = QueuesReport {
        summary: coordinator.get_work_stealing_summary(),
        queues: coordinator.get_remote_queue_states(),
    };
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print!("{}", render_queues(&report, Utc::now())),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gate_coordinator::{ClusterRuntimeUsage, StealableEntry, StealingStats};
    use gate_core::Priority;

    #[test]
    fn test_render_status_lines() {
        let status = CoordinatorStatus {
            initialized: false,
            instance_id: "cli".to_string(),
            session_id: None,
            active_instances: 2,
            total_max_llm: 6,
            my_parallel_limit: 3,
            heartbeat_interval_ms: 15_000,
            heartbeat_timeout_ms: 60_000,
            heartbeat_running: false,
            usage: ClusterRuntimeUsage {
                instances: 2,
                active_requests: 4,
                active_llm: 3,
                pending_tasks: 7,
            },
            stealing: StealingStats::default(),
        };
        let text = render_status(&status, "/run/llm-gate/coordinator");
        assert!(text.contains("Live instances:   2 (timeout 60000 ms)"));
        assert!(text.contains("Fair share:       3 of 6"));
        assert!(text.contains("Pending tasks:    7"));
    }

    #[test]
    fn test_render_queues_with_entries() {
        let now = Utc::now();
        let report = QueuesReport {
            summary: WorkStealingSummary {
                remote_instances: 1,
                total_remote_pending: 5,
                busiest_instance: Some("a".to_string()),
                stealable_entries: 1,
            },
            queues: vec![QueueStateRecord {
                instance_id: "a".to_string(),
                timestamp: now - chrono::Duration::milliseconds(250),
                pending_task_count: 5,
                active_orchestrations: 1,
                stealable_entries: vec![StealableEntry {
                    task_id: "sub-1".to_string(),
                    provider: "openai".to_string(),
                    model: "gpt-4".to_string(),
                    priority: Priority::High,
                    enqueued_at: now,
                }],
            }],
        };
        let text = render_queues(&report, now);
        assert!(text.contains("a  pending=5 orchestrations=1 age=250ms"));
        assert!(text.contains("high       openai:gpt-4  sub-1"));
        assert!(text.contains("busiest: a"));
    }

    #[test]
    fn test_render_queues_empty() {
        let report = QueuesReport {
            summary: WorkStealingSummary {
                remote_instances: 0,
                total_remote_pending: 0,
                busiest_instance: None,
                stealable_entries: 0,
            },
            queues: Vec::new(),
        };
        assert_eq!(render_queues(&report, Utc::now()), "No fresh queue snapshots.\n");
    }
}
