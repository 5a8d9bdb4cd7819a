//! `socks5 trace`: send TRACE motes through a portal and report how long
//! each hop took.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use portal_proto::trace::{
    append_trace_event, new_trace_mote, now_micros, trace_data, TraceData, TraceEventKind,
};
use portal_proto::{OpenPortalRequest, OpenPortalResponse};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Streaming;
use tracing::warn;

use crate::upstream::UpstreamClient;

pub const TRACE_STREAM_ID: &str = "trace-stream";
const RESEND_AFTER: Duration = Duration::from_secs(30);
const TOTAL_ROW: &str = "Total Duration";

pub struct TraceSession {
    portal_id: i64,
    upstream: mpsc::Sender<OpenPortalRequest>,
    inbound: Streaming<OpenPortalResponse>,
    resend_after: Duration,
}

impl TraceSession {
    pub async fn open(client: &mut UpstreamClient, portal_id: i64) -> anyhow::Result<Self> {
        let (upstream, requests) = mpsc::channel(16);
        upstream
            .send(OpenPortalRequest {
                portal_id,
                mote: None,
            })
            .await
            .context("queue portal registration")?;
        let inbound = client
            .open_portal(ReceiverStream::new(requests))
            .await
            .context("open portal")?
            .into_inner();
        Ok(Self {
            portal_id,
            upstream,
            inbound,
            resend_after: RESEND_AFTER,
        })
    }

    /// Run one round trip. A reply that started before this call belongs to
    /// an earlier trace and is skipped; without a reply the trace is resent
    /// every 30 seconds.
    pub async fn trace_once(&mut self, size: usize) -> anyhow::Result<TraceData> {
        let start = now_micros();
        self.send_trace(size).await?;

        let mut resend = tokio::time::interval_at(
            tokio::time::Instant::now() + self.resend_after,
            self.resend_after,
        );
        loop {
            let received = tokio::select! {
                _ = resend.tick() => None,
                response = self.inbound.message() => Some(response),
            };
            let Some(response) = received else {
                eprintln!("No reply yet, sending another trace...");
                if let Err(err) = self.send_trace(size).await {
                    warn!(error = %err, "failed to resend trace mote");
                }
                continue;
            };
            let Some(response) = response.context("recv error")? else {
                bail!("portal stream closed before the trace returned");
            };
            let Some(mut mote) = response.mote else {
                continue;
            };
            let trace = match trace_data(&mote) {
                Some(trace) => trace.context("failed to decode trace data")?,
                None => continue,
            };
            if trace.start_micros < start {
                continue;
            }
            append_trace_event(&mut mote, TraceEventKind::UserRecv, None)?;
            return match trace_data(&mote) {
                Some(trace) => Ok(trace?),
                None => bail!("trace mote lost its payload"),
            };
        }
    }

    async fn send_trace(&self, size: usize) -> anyhow::Result<()> {
        let mut mote = new_trace_mote(TRACE_STREAM_ID, size);
        append_trace_event(&mut mote, TraceEventKind::UserSend, None)
            .context("add USER_SEND event")?;
        self.upstream
            .send(OpenPortalRequest {
                portal_id: self.portal_id,
                mote: Some(mote),
            })
            .await
            .context("send trace mote")?;
        Ok(())
    }
}

/// CLI entry point: `count` traces, then a report or a stats table.
pub async fn run_trace(
    client: &mut UpstreamClient,
    portal_id: i64,
    size: usize,
    count: usize,
) -> anyhow::Result<()> {
    let count = count.max(1);
    let mut session = TraceSession::open(client, portal_id).await?;
    let mut traces = Vec::with_capacity(count);
    for i in 0..count {
        if count > 1 {
            eprint!("Sending trace {}/{}...\r", i + 1, count);
        }
        let trace = session
            .trace_once(size)
            .await
            .with_context(|| format!("trace {} failed", i + 1))?;
        traces.push(trace);
    }
    if count > 1 {
        eprintln!();
        print!("{}", render_stats(&compute_stats(&traces)?));
    } else {
        print!("{}", render_report(&traces[0]));
    }
    Ok(())
}

fn kind_name(kind: i32) -> &'static str {
    TraceEventKind::try_from(kind)
        .unwrap_or(TraceEventKind::Unspecified)
        .name()
}

pub fn render_report(trace: &TraceData) -> String {
    let total = match trace.events.last() {
        Some(last) => last.timestamp_micros - trace.start_micros,
        None => now_micros() - trace.start_micros,
    };
    let mut rows = vec![vec![
        "Step Name".to_string(),
        "Timestamp".to_string(),
        "Delta".to_string(),
    ]];
    let mut last = trace.start_micros;
    for event in &trace.events {
        let timestamp = DateTime::<Utc>::from_timestamp_micros(event.timestamp_micros)
            .map(|ts| ts.format("%H:%M:%S%.6f").to_string())
            .unwrap_or_default();
        rows.push(vec![
            kind_name(event.kind).to_string(),
            timestamp,
            format_duration(event.timestamp_micros - last),
        ]);
        last = event.timestamp_micros;
    }
    format!(
        "\nTrace Report (Total Duration: {})\n{}",
        format_duration(total),
        render_table(&rows)
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Distribution {
    pub min: i64,
    pub p50: i64,
    pub p90: i64,
    pub p99: i64,
    pub max: i64,
}

impl Distribution {
    /// Nearest-rank percentiles. `values` must not be empty.
    fn of(values: &mut [i64]) -> Self {
        values.sort_unstable();
        let n = values.len();
        let rank = |p: f64| values[((p * n as f64).ceil() as usize).clamp(1, n) - 1];
        Self {
            min: values[0],
            p50: rank(0.50),
            p90: rank(0.90),
            p99: rank(0.99),
            max: values[n - 1],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceStats {
    pub samples: usize,
    /// Per step, in the order the first trace recorded them.
    pub steps: Vec<(&'static str, Distribution)>,
    pub total: Distribution,
}

pub fn compute_stats(traces: &[TraceData]) -> anyhow::Result<TraceStats> {
    let Some(first) = traces.first() else {
        bail!("no traces to calculate stats from");
    };
    let mut deltas: HashMap<&'static str, Vec<i64>> = HashMap::new();
    let mut totals = Vec::with_capacity(traces.len());
    for trace in traces {
        if trace.events.len() != first.events.len() {
            bail!("trace event count mismatch");
        }
        let mut last = trace.start_micros;
        for event in &trace.events {
            deltas
                .entry(kind_name(event.kind))
                .or_default()
                .push(event.timestamp_micros - last);
            last = event.timestamp_micros;
        }
        totals.push(last - trace.start_micros);
    }

    let mut steps = Vec::new();
    for event in &first.events {
        let name = kind_name(event.kind);
        if let Some(mut values) = deltas.remove(name) {
            steps.push((name, Distribution::of(&mut values)));
        }
    }
    Ok(TraceStats {
        samples: traces.len(),
        steps,
        total: Distribution::of(&mut totals),
    })
}

pub fn render_stats(stats: &TraceStats) -> String {
    let mut rows = vec![["Step Name", "Min", "P50", "P90", "P99", "Max"]
        .iter()
        .map(|h| h.to_string())
        .collect::<Vec<_>>()];
    let row = |name: &str, d: &Distribution| {
        let mut row = vec![name.to_string()];
        row.extend([d.min, d.p50, d.p90, d.p99, d.max].map(format_duration));
        row
    };
    for (name, dist) in &stats.steps {
        rows.push(row(name, dist));
    }
    rows.push(row(TOTAL_ROW, &stats.total));
    format!(
        "\nTrace Statistics (Samples: {})\n{}",
        stats.samples,
        render_table(&rows)
    )
}

/// Left-aligned columns separated by at least two spaces.
fn render_table(rows: &[Vec<String>]) -> String {
    let columns = rows.iter().map(Vec::len).max().unwrap_or(0);
    let widths: Vec<usize> = (0..columns)
        .map(|col| {
            rows.iter()
                .filter_map(|row| row.get(col))
                .map(|cell| cell.chars().count())
                .max()
                .unwrap_or(0)
        })
        .collect();

    let mut out = String::new();
    for row in rows {
        let mut line = String::new();
        for (col, cell) in row.iter().enumerate() {
            line.push_str(cell);
            if col + 1 < row.len() {
                let pad = widths[col] - cell.chars().count() + 2;
                line.extend(std::iter::repeat(' ').take(pad));
            }
        }
        out.push_str(&line);
        out.push('\n');
    }
    out
}

pub fn format_duration(micros: i64) -> String {
    if micros >= 1_000_000 {
        format!("{:.4} seconds", micros as f64 / 1_000_000.0)
    } else if micros >= 1_000 {
        format!("{:.4}ms", micros as f64 / 1_000.0)
    } else {
        format!("{micros}µs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portal_proto::trace::TraceEvent;

    fn trace(start: i64, steps: &[(TraceEventKind, i64)]) -> TraceData {
        TraceData {
            start_micros: start,
            padding: Vec::new(),
            events: steps
                .iter()
                .map(|(kind, at)| TraceEvent {
                    kind: *kind as i32,
                    timestamp_micros: *at,
                    server_id: String::new(),
                })
                .collect(),
        }
    }

    #[test]
    fn durations_pick_a_unit() {
        assert_eq!(format_duration(999), "999µs");
        assert_eq!(format_duration(1_500), "1.5000ms");
        assert_eq!(format_duration(2_250_000), "2.2500 seconds");
    }

    #[test]
    fn report_lists_steps_with_deltas() {
        let report = render_report(&trace(
            1_000_000,
            &[
                (TraceEventKind::UserSend, 1_000_010),
                (TraceEventKind::UserRecv, 1_002_010),
            ],
        ));
        assert!(report.contains("Trace Report (Total Duration: 2.0100ms)"));
        let lines: Vec<_> = report.lines().filter(|l| !l.is_empty()).collect();
        assert!(lines[1].starts_with("Step Name  "));
        assert!(lines[2].starts_with("USER_SEND  "));
        assert!(lines[2].contains("00:00:01.000010"));
        assert!(lines[2].ends_with("10µs"));
        assert!(lines[3].ends_with("2.0000ms"));
    }

    #[test]
    fn stats_use_nearest_rank_percentiles() {
        let traces: Vec<_> = (1..=10)
            .map(|i| {
                trace(
                    0,
                    &[
                        (TraceEventKind::UserSend, i),
                        (TraceEventKind::UserRecv, i * 100),
                    ],
                )
            })
            .collect();
        let stats = compute_stats(&traces).unwrap();
        assert_eq!(stats.samples, 10);
        assert_eq!(stats.steps[0].0, "USER_SEND");
        assert_eq!(
            stats.steps[0].1,
            Distribution {
                min: 1,
                p50: 5,
                p90: 9,
                p99: 10,
                max: 10
            }
        );
        assert_eq!(stats.total.max, 1_000);
        assert!(render_stats(&stats).contains("Total Duration"));
    }

    #[test]
    fn stats_reject_mismatched_traces() {
        let traces = vec![
            trace(0, &[(TraceEventKind::UserSend, 1)]),
            trace(0, &[]),
        ];
        assert!(compute_stats(&traces).is_err());
        assert!(compute_stats(&[]).is_err());
    }
}
