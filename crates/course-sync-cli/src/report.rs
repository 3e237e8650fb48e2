use std::fmt::Write as _;

use course_sync_api::{PassReport, PassStatus, RowReport};

const HEADERS: [&str; 9] = [
    "SR.",
    "ID NUMBER",
    "EXTERNAL FULL NAME",
    "EXTERNAL SHORT NAME",
    "IS EXIST",
    "COURSE ID",
    "LOCAL FULL NAME",
    "LOCAL SHORT NAME",
    "IS UPDATED",
];

fn yes_no(flag: bool) -> String {
    let text = if flag { "yes" } else { "no" };
    text.to_string()
}

fn row_cells(row: &RowReport) -> [String; 9] {
    let (exists, course_id, local_full, local_short, updated) = match &row.outcome {
        Some(outcome) => (
            yes_no(outcome.matched),
            outcome.local_course_id.map(|id| id.to_string()).unwrap_or_default(),
            outcome.local_before.as_ref().map(|names| names.full_name.clone()).unwrap_or_default(),
            outcome.local_before.as_ref().map(|names| names.short_name.clone()).unwrap_or_default(),
            yes_no(outcome.updated),
        ),
        None => (String::new(), String::new(), String::new(), String::new(), "error".to_string()),
    };

    [
        row.sequence.to_string(),
        row.record.id_number.clone(),
        row.record.full_name.clone(),
        row.record.short_name.clone(),
        exists,
        course_id,
        local_full,
        local_short,
        updated,
    ]
}

fn push_line(out: &mut String, cells: &[String; 9], widths: &[usize; 9]) {
    let line = cells
        .iter()
        .zip(widths)
        .map(|(cell, width)| format!("{cell:<width$}"))
        .collect::<Vec<_>>()
        .join(" | ");
    out.push_str(line.trim_end());
    out.push('\n');
}

/// Render a pass report as a fixed-width table followed by status lines.
///
/// Local names are the values read before any update.
#[must_use]
pub fn render_table(report: &PassReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "course name synchronisation: {}", report.status.as_str());

    if report.status == PassStatus::Skipped {
        let _ = writeln!(out, "{}", report.message);
        return out;
    }

    let headers = HEADERS.map(str::to_string);
    let rows = report.rows.iter().map(row_cells).collect::<Vec<_>>();
    let mut widths = HEADERS.map(|header| header.chars().count());
    for cells in &rows {
        for (width, cell) in widths.iter_mut().zip(cells) {
            *width = (*width).max(cell.chars().count());
        }
    }

    push_line(&mut out, &headers, &widths);
    let rule = widths.iter().map(|width| "-".repeat(*width)).collect::<Vec<_>>().join("-+-");
    out.push_str(&rule);
    out.push('\n');
    for cells in &rows {
        push_line(&mut out, cells, &widths);
    }

    for row in &report.rows {
        if let Some(error) = &row.error {
            let _ = writeln!(out, "row {} ({}): {error}", row.sequence, row.record.id_number);
        }
    }

    let counts = &report.counts;
    let _ = writeln!(
        out,
        "total={} matched={} updated={} unchanged={} not_found={} missing_identifier={} failed={}",
        counts.total,
        counts.matched,
        counts.updated,
        counts.unchanged,
        counts.not_found,
        counts.missing_identifier,
        counts.failed
    );
    if report.status == PassStatus::Failed {
        let _ = writeln!(out, "error: {}", report.message);
    }
    out
}
