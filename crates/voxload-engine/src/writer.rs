//! Report rendering and persistence.

use std::fmt::Write as _;
use std::path::Path;
use std::str::FromStr;
use voxload_core::{CoreError, CoreResult, LoadTestReport, MetricAssessment, RunStatus};

/// Output format of a rendered report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportFormat {
    #[default]
    Json,
    Markdown,
}

impl FromStr for ReportFormat {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "markdown" | "md" => Ok(Self::Markdown),
            other => Err(CoreError::Config(format!(
                "unknown report format `{}` (expected json or markdown)",
                other
            ))),
        }
    }
}

/// Renders a [`LoadTestReport`] as JSON or Markdown.
pub struct ReportWriter<'a> {
    report: &'a LoadTestReport,
}

impl<'a> ReportWriter<'a> {
    pub fn new(report: &'a LoadTestReport) -> Self {
        Self { report }
    }

    pub fn render(&self, format: ReportFormat) -> CoreResult<String> {
        match format {
            ReportFormat::Json => Ok(serde_json::to_string_pretty(self.report)?),
            ReportFormat::Markdown => Ok(self.markdown()),
        }
    }

    /// Writes the rendered report to `path`, creating parent directories.
    pub fn write(&self, path: impl AsRef<Path>, format: ReportFormat) -> CoreResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.render(format)?)?;
        Ok(())
    }

    fn markdown(&self) -> String {
        let r = self.report;
        let s = &r.summary;
        let mut out = String::new();

        // Writing into a String cannot fail.
        let _ = writeln!(out, "# Load Test Report: {}\n", r.run_id);
        let _ = writeln!(out, "**Status**: {}", status_line(&r.run_status));
        let _ = writeln!(out, "**Generated**: {}", r.generated_at.to_rfc3339());
        let _ = writeln!(out, "**Duration**: {:.1} seconds\n", r.duration_ms as f64 / 1000.0);

        out.push_str("---\n\n## Summary\n\n");
        let _ = writeln!(out, "- **Sessions Started**: {}", s.sessions_started);
        let _ = writeln!(out, "- **Successful**: {}", s.sessions_successful);
        let _ = writeln!(out, "- **Failed**: {}", s.sessions_failed);
        let _ = writeln!(out, "- **Creation Failures**: {}", s.creation_failures);
        let _ = writeln!(out, "- **Peak Concurrency**: {}", s.peak_concurrency);
        let _ = writeln!(out, "- **Success Rate**: {:.2}%", s.success_rate);
        let _ = writeln!(out, "- **Error Rate**: {:.2}% ({} errors)", s.error_rate, s.error_count);
        let _ = writeln!(
            out,
            "- **Audio Sent**: {} chunks, {} bytes\n",
            s.total_chunks_sent, s.total_bytes_sent
        );

        out.push_str("---\n\n## Metrics\n\n");
        out.push_str("| Metric | Average | Peak | Threshold | Status |\n");
        out.push_str("|--------|---------|------|-----------|--------|\n");
        metric_row(&mut out, "CPU (%)", &r.metrics.cpu_percent);
        metric_row(&mut out, "Memory (%)", &r.metrics.memory_percent);
        metric_row(&mut out, "Response time (ms)", &r.metrics.response_time_ms);
        metric_row(&mut out, "Throughput (sessions/s)", &r.metrics.throughput);

        let p = &r.response_time_percentiles;
        let _ = writeln!(
            out,
            "\nResponse time P50 {}ms, P95 {}ms, P99 {}ms, max {}ms\n",
            p.p50_ms, p.p95_ms, p.p99_ms, p.max_ms
        );

        if !r.profiles.is_empty() {
            out.push_str("---\n\n## Traffic Profiles\n\n");
            out.push_str("| Profile | Started | Successful | Failed | Avg response |\n");
            out.push_str("|---------|---------|------------|--------|--------------|\n");
            for profile in &r.profiles {
                let avg = profile
                    .average_response_time_ms
                    .map_or_else(|| "-".to_string(), |ms| format!("{:.0}ms", ms));
                let _ = writeln!(
                    out,
                    "| {} | {} | {} | {} | {} |",
                    profile.profile,
                    profile.sessions_started,
                    profile.sessions_successful,
                    profile.sessions_failed,
                    avg
                );
            }
            out.push('\n');
        }

        out.push_str("---\n\n## Bottlenecks\n\n");
        if r.bottlenecks.is_empty() {
            out.push_str("None detected.\n\n");
        } else {
            for (bottleneck, recommendation) in r.bottlenecks.iter().zip(&r.recommendations) {
                let _ = writeln!(
                    out,
                    "- **{}** (average {:.1}, limit {:.1}): {}",
                    bottleneck.kind, bottleneck.average, bottleneck.limit, recommendation
                );
            }
            out.push('\n');
        }

        out.push_str("---\n\n## Capacity\n\n");
        let c = &r.capacity;
        let _ = writeln!(out, "- **Recommended**: {} sessions", c.recommended);
        let _ = writeln!(out, "- **Conservative**: {}", c.conservative);
        let _ = writeln!(out, "- **Realistic**: {}", c.realistic);
        let _ = writeln!(out, "- **Maximum**: {}\n", c.maximum);

        out.push_str("---\n\n## Critical Issues\n\n");
        if r.critical_issues.is_empty() {
            out.push_str("None.\n\n");
        } else {
            for issue in &r.critical_issues {
                let _ = writeln!(out, "- ❌ {}", issue.message);
            }
            out.push('\n');
        }

        out.push_str("---\n\n## Pilot Readiness\n\n");
        let readiness = &r.readiness;
        let _ = writeln!(
            out,
            "{} Target of {} concurrent sessions: {}",
            if readiness.can_handle_pilot_load { "✅" } else { "❌" },
            readiness.target_sessions,
            if readiness.can_handle_pilot_load { "ready" } else { "not ready" }
        );
        for issue in &readiness.blocking_issues {
            let _ = writeln!(out, "- {}", issue);
        }

        if !r.top_errors.is_empty() {
            out.push_str("\n---\n\n## Errors\n\n");
            for error in &r.top_errors {
                let _ = writeln!(out, "- {} × {}", error.count, error.message);
            }
        }

        out
    }
}

fn status_line(status: &RunStatus) -> String {
    match status {
        RunStatus::Completed => "✅ completed".to_string(),
        RunStatus::Halted { reason } => format!("⚠️ halted ({})", reason),
        RunStatus::Aborted { message } => format!("❌ aborted ({})", message),
        RunStatus::Interrupted => "⏹️ interrupted".to_string(),
    }
}

fn metric_row(out: &mut String, name: &str, metric: &MetricAssessment) {
    let threshold = metric
        .threshold
        .map_or_else(|| "-".to_string(), |t| format!("{:.1}", t));
    let status = match (metric.threshold, metric.within_threshold) {
        (None, _) => "-",
        (Some(_), true) => "✅",
        (Some(_), false) => "❌",
    };
    let _ = writeln!(
        out,
        "| {} | {:.1} | {:.1} | {} | {} |",
        name, metric.average, metric.maximum, threshold, status
    );
}
