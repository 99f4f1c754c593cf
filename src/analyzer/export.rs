//! Rendering analysis reports and replay results to JSON, HTML and CSV

use anyhow::Context;
use std::fmt::Write as _;
use std::path::Path;

use super::AnalysisReport;
use crate::error::{DebugError, Result};
use crate::replay::ReplayResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Html,
    Csv,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Html => "html",
            ExportFormat::Csv => "csv",
        }
    }
}

impl std::str::FromStr for ExportFormat {
    type Err = DebugError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "html" | "htm" => Ok(ExportFormat::Html),
            "csv" => Ok(ExportFormat::Csv),
            _ => Err(DebugError::Config(format!("Invalid export format: {}", s))),
        }
    }
}

pub fn render_report(report: &AnalysisReport, format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Json => Ok(serde_json::to_string_pretty(report)?),
        ExportFormat::Html => Ok(report_html(report)),
        ExportFormat::Csv => Ok(report_csv(report)),
    }
}

pub fn render_replay_results(results: &[ReplayResult], format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Json => Ok(serde_json::to_string_pretty(results)?),
        ExportFormat::Html => Ok(replay_html(results)),
        ExportFormat::Csv => Ok(replay_csv(results)),
    }
}

/// Write rendered output, creating parent directories as needed
pub async fn export_to_file(path: &Path, contents: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create export directory {}", parent.display()))?;
    }

    tokio::fs::write(path, contents)
        .await
        .with_context(|| format!("Failed to write export file {}", path.display()))?;

    tracing::info!(path = %path.display(), bytes = contents.len(), "Report exported");
    Ok(())
}

fn report_csv(report: &AnalysisReport) -> String {
    let m = &report.metrics;
    let mut out = String::from("section,name,value\n");

    let rows: [(&str, String); 12] = [
        ("total_requests", m.total_requests.to_string()),
        ("successful_requests", m.successful_requests.to_string()),
        ("failed_requests", m.failed_requests.to_string()),
        ("success_rate", format!("{:.4}", m.success_rate)),
        ("error_rate", format!("{:.4}", m.error_rate)),
        ("throughput", format!("{:.4}", m.throughput)),
        ("latency_avg_ms", format!("{:.2}", m.latency.avg)),
        ("latency_min_ms", format!("{:.2}", m.latency.min)),
        ("latency_max_ms", format!("{:.2}", m.latency.max)),
        ("latency_p50_ms", format!("{:.2}", m.latency.percentiles.p50)),
        ("latency_p95_ms", format!("{:.2}", m.latency.percentiles.p95)),
        ("latency_p99_ms", format!("{:.2}", m.latency.percentiles.p99)),
    ];
    for (name, value) in rows {
        csv_row(&mut out, &["metrics", name, &value]);
    }

    for (module, stats) in &m.modules {
        csv_row(&mut out, &["module", &format!("{}.count", module), &stats.count.to_string()]);
        csv_row(
            &mut out,
            &["module", &format!("{}.avg_duration_ms", module), &format!("{:.2}", stats.avg_duration)],
        );
        csv_row(&mut out, &["module", &format!("{}.error_count", module), &stats.error_count.to_string()]);
    }

    for (provider, count) in &m.providers {
        csv_row(&mut out, &["provider", provider, &count.to_string()]);
    }

    for trend in &report.trends {
        csv_row(&mut out, &["trend", trend.metric.as_str(), trend.direction.as_str()]);
    }

    for anomaly in &report.anomalies {
        csv_row(&mut out, &["anomaly", anomaly.kind.as_str(), &anomaly.description]);
    }

    out
}

fn replay_csv(results: &[ReplayResult]) -> String {
    let mut out = String::from(
        "request_id,is_valid,original_duration_ms,replay_duration_ms,path,kind,original_value,replayed_value\n",
    );

    for result in results {
        let id = &result.original.request_id;
        let valid = result.is_valid.to_string();
        let original_ms = result.performance.original_duration.to_string();
        let replay_ms = result.performance.replay_duration.to_string();

        if result.differences.is_empty() {
            csv_row(&mut out, &[id, &valid, &original_ms, &replay_ms, "", "", "", ""]);
            continue;
        }

        for diff in &result.differences {
            csv_row(
                &mut out,
                &[
                    id,
                    &valid,
                    &original_ms,
                    &replay_ms,
                    &diff.path,
                    diff.kind.as_str(),
                    &value_cell(diff.original_value.as_ref()),
                    &value_cell(diff.replayed_value.as_ref()),
                ],
            );
        }
    }

    out
}

fn value_cell(value: Option<&serde_json::Value>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn csv_row(out: &mut String, fields: &[&str]) {
    let line: Vec<String> = fields.iter().map(|f| csv_escape(f)).collect();
    out.push_str(&line.join(","));
    out.push('\n');
}

fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

const STYLE: &str = "body{font-family:sans-serif;margin:2em;color:#222}\
.cards{display:flex;flex-wrap:wrap;gap:1em}\
.card{border:1px solid #ddd;border-radius:6px;padding:1em;min-width:10em}\
.card .value{font-size:1.6em;font-weight:bold}\
table{border-collapse:collapse;margin:1em 0}\
th,td{border:1px solid #ddd;padding:4px 8px;text-align:left}\
.high{color:#c0392b}.medium{color:#d68910}.low{color:#7f8c8d}\
.valid{color:#27ae60}.invalid{color:#c0392b}";

fn html_page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{title}</title>\n<style>{STYLE}</style>\n</head>\n<body>\n<h1>{title}</h1>\n{body}</body>\n</html>\n",
        title = html_escape(title),
        STYLE = STYLE,
        body = body
    )
}

fn card(out: &mut String, label: &str, value: &str) {
    let _ = write!(
        out,
        "<div class=\"card\"><div class=\"label\">{}</div><div class=\"value\">{}</div></div>",
        html_escape(label),
        html_escape(value)
    );
}

fn report_html(report: &AnalysisReport) -> String {
    let m = &report.metrics;
    let mut body = String::new();

    body.push_str("<div class=\"cards\">");
    card(&mut body, "Requests", &m.total_requests.to_string());
    card(&mut body, "Success rate", &format!("{:.1}%", m.success_rate * 100.0));
    card(&mut body, "Error rate", &format!("{:.1}%", m.error_rate * 100.0));
    card(&mut body, "Avg latency", &format!("{:.0} ms", m.latency.avg));
    card(&mut body, "P95 latency", &format!("{:.0} ms", m.latency.percentiles.p95));
    card(&mut body, "Throughput", &format!("{:.2} req/s", m.throughput));
    body.push_str("</div>\n");

    if !m.modules.is_empty() {
        body.push_str("<h2>Layers</h2>\n<table><tr><th>Layer</th><th>Count</th><th>Errors</th><th>Avg (ms)</th><th>P95 (ms)</th><th>Max (ms)</th></tr>\n");
        for (name, s) in &m.modules {
            let _ = writeln!(
                body,
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{:.1}</td><td>{:.1}</td><td>{:.1}</td></tr>",
                html_escape(name),
                s.count,
                s.error_count,
                s.avg_duration,
                s.p95_duration,
                s.max_duration
            );
        }
        body.push_str("</table>\n");
    }

    if !report.trends.is_empty() {
        body.push_str("<h2>Trends</h2>\n<table><tr><th>Metric</th><th>Direction</th><th>Change</th></tr>\n");
        for t in &report.trends {
            let _ = writeln!(
                body,
                "<tr><td>{}</td><td>{}</td><td>{:+.1}%</td></tr>",
                t.metric.as_str(),
                t.direction.as_str(),
                t.change_percent
            );
        }
        body.push_str("</table>\n");
    }

    if !report.anomalies.is_empty() {
        body.push_str("<h2>Anomalies</h2>\n<table><tr><th>Kind</th><th>Severity</th><th>Description</th></tr>\n");
        for a in &report.anomalies {
            let _ = writeln!(
                body,
                "<tr><td>{}</td><td class=\"{sev}\">{sev}</td><td>{}</td></tr>",
                a.kind.as_str(),
                html_escape(&a.description),
                sev = a.severity.as_str()
            );
        }
        body.push_str("</table>\n");
    }

    if !report.recommendations.is_empty() {
        body.push_str("<h2>Recommendations</h2>\n<ul>\n");
        for r in &report.recommendations {
            let _ = writeln!(
                body,
                "<li class=\"{}\">[{}] {}</li>",
                r.severity.as_str(),
                html_escape(&r.category),
                html_escape(&r.message)
            );
        }
        body.push_str("</ul>\n");
    }

    html_page("Performance report", &body)
}

fn replay_html(results: &[ReplayResult]) -> String {
    let valid = results.iter().filter(|r| r.is_valid).count();
    let mut body = String::new();

    body.push_str("<div class=\"cards\">");
    card(&mut body, "Replayed", &results.len().to_string());
    card(&mut body, "Valid", &valid.to_string());
    card(&mut body, "Invalid", &(results.len() - valid).to_string());
    body.push_str("</div>\n");

    body.push_str("<table><tr><th>Request</th><th>Result</th><th>Original (ms)</th><th>Replay (ms)</th><th>Differences</th></tr>\n");
    for r in results {
        let status = if r.is_valid { "valid" } else { "invalid" };
        let diffs: Vec<String> = r
            .differences
            .iter()
            .map(|d| format!("{} {}", d.kind.as_str(), html_escape(&d.path)))
            .collect();
        let _ = writeln!(
            body,
            "<tr><td>{}</td><td class=\"{status}\">{status}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            html_escape(&r.original.request_id),
            r.performance.original_duration,
            r.performance.replay_duration,
            diffs.join("<br>"),
            status = status
        );
    }
    body.push_str("</table>\n");

    html_page("Replay results", &body)
}
