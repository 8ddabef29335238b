//! Pipeline statistics and metrics.

use std::time::Duration;

use contracts::SinkKind;
use dispatcher::RunReport;

/// Statistics from a pipeline run
#[derive(Debug, Clone)]
pub struct PipelineStats {
    /// What the coordinator reported when it stopped
    pub report: RunReport,

    /// Total duration of the run
    pub duration: Duration,

    /// Sinks the run delivered to
    pub active_sinks: Vec<SinkKind>,
}

impl PipelineStats {
    /// Events that became terminal at every sink, per second
    pub fn events_per_sec(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.report.events_completed as f64 / secs
        } else {
            0.0
        }
    }

    /// Print detailed summary
    pub fn print_summary(&self) {
        let report = &self.report;

        println!("\n=== Pipeline Statistics: {} ===\n", report.namespace);
        println!("Overview");
        println!("  Duration: {:.2}s", self.duration.as_secs_f64());
        println!("  Events observed: {}", report.events_observed);
        println!("  Events completed: {}", report.events_completed);
        println!("  Already terminal (skipped): {}", report.already_terminal);
        println!("  Abandoned at shutdown: {}", report.abandoned);
        println!("  Throughput: {:.2} events/s", self.events_per_sec());
        match report.checkpoint {
            Some(offset) => println!("  Checkpoint: {}", offset),
            None => println!("  Checkpoint: none"),
        }

        println!("\nPer sink");
        for sink in &self.active_sinks {
            println!(
                "  {:<10} delivered={:<8} dead_lettered={}",
                sink,
                report.delivered(*sink),
                report.dead_lettered(*sink)
            );
        }

        println!("\n{}", report.summary);
    }
}
