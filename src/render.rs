use crate::snapshot::{Snapshot, SnapshotRow};
use std::fmt::Write as _;

const HEADERS: [&str; 11] = [
    "NAME", "TYPE", "STATUS", "PID", "STARTED", "UPTIME", "CPU", "MEM", "NET", "TARGET", "ERROR",
];
const MAX_ERROR_WIDTH: usize = 60;

/// Console table for one snapshot, header and divider included.
pub fn render_table(snapshot: &Snapshot) -> String {
    let rows: Vec<[String; 11]> = snapshot.items.iter().map(columns).collect();

    let mut widths = HEADERS.map(width);
    for row in &rows {
        for (w, col) in widths.iter_mut().zip(row.iter()) {
            *w = (*w).max(width(col));
        }
    }
    let last = widths.len() - 1;
    widths[last] = widths[last].min(MAX_ERROR_WIDTH);

    let mut out = String::with_capacity(1024);
    let _ = writeln!(out, "procwarden  {}", snapshot.updated);
    if !snapshot.version.is_empty() {
        let _ = writeln!(out, "Version: {}", snapshot.version);
    }
    if !snapshot.network.mode.is_empty() {
        let _ = write!(out, "Network: {}", snapshot.network.mode);
        if !snapshot.network.error.is_empty() {
            let _ = write!(out, " ({})", snapshot.network.error);
        }
        if !snapshot.network.debug.is_empty() {
            let _ = write!(out, " {}", snapshot.network.debug);
        }
        out.push('\n');
    }
    out.push('\n');

    push_row(&mut out, HEADERS.iter().map(|h| h.to_string()), &widths);
    push_row(&mut out, widths.iter().map(|w| "-".repeat(*w)), &widths);
    for row in rows {
        let [name, kind, status, pid, started, uptime, cpu, mem, net, target, error] = row;
        let error = truncate(&error, widths[last]);
        push_row(
            &mut out,
            [name, kind, status, pid, started, uptime, cpu, mem, net, target, error].into_iter(),
            &widths,
        );
    }
    out
}

fn columns(row: &SnapshotRow) -> [String; 11] {
    [
        row.name.clone(),
        row.kind.clone(),
        row.icon.clone(),
        row.pid.clone(),
        row.started_at.clone(),
        row.uptime.clone(),
        row.cpu.clone(),
        row.memory.clone(),
        row.network.clone(),
        row.target.clone(),
        row.error.clone(),
    ]
}

fn push_row(out: &mut String, cols: impl Iterator<Item = String>, widths: &[usize]) {
    let mut line = String::new();
    for (i, (col, w)) in cols.zip(widths).enumerate() {
        if i > 0 {
            line.push_str("  ");
        }
        line.push_str(&col);
        line.extend(std::iter::repeat(' ').take(w.saturating_sub(width(&col))));
    }
    out.push_str(line.trim_end());
    out.push('\n');
}

fn width(text: &str) -> usize {
    text.chars().count()
}

fn truncate(text: &str, max: usize) -> String {
    if width(text) <= max {
        return text.to_string();
    }
    if max <= 3 {
        return text.chars().take(max).collect();
    }
    let mut out: String = text.chars().take(max - 3).collect();
    out.push_str("...");
    out
}
