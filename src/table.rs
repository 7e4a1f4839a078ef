//! Plain ASCII grids for command output.

use itertools::Itertools;

/// Cells longer than this are cut and end in `...`.
const MAX_CELL_WIDTH: usize = 48;

pub fn render_table(headers: &[String], rows: &[Vec<String>]) -> String {
    let headers: Vec<String> = headers.iter().map(|h| clean_cell(h)).collect();
    let rows: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            (0..headers.len())
                .map(|idx| row.get(idx).map(|cell| clean_cell(cell)).unwrap_or_default())
                .collect()
        })
        .collect();

    let widths: Vec<usize> = (0..headers.len())
        .map(|idx| {
            rows.iter()
                .map(|row| row[idx].chars().count())
                .chain(std::iter::once(headers[idx].chars().count()))
                .max()
                .unwrap_or(0)
                .max(1)
        })
        .collect();

    let rule = format!("+{}+", widths.iter().map(|w| "-".repeat(w + 2)).join("+"));
    let mut out = String::new();
    out.push_str(&rule);
    out.push('\n');
    out.push_str(&format_row(&headers, &widths));
    out.push_str(&rule);
    out.push('\n');
    for row in &rows {
        out.push_str(&format_row(row, &widths));
    }
    if !rows.is_empty() {
        out.push_str(&rule);
        out.push('\n');
    }
    out
}

pub fn print_table(headers: &[String], rows: &[Vec<String>]) {
    print!("{}", render_table(headers, rows));
}

fn format_row(cells: &[String], widths: &[usize]) -> String {
    let body = cells
        .iter()
        .zip(widths)
        .map(|(cell, width)| format!(" {cell:<width$} "))
        .join("|");
    format!("|{body}|\n")
}

/// Flattens control characters and caps the width.
fn clean_cell(value: &str) -> String {
    let flat: String = value
        .chars()
        .map(|ch| if ch.is_control() { ' ' } else { ch })
        .collect();
    if flat.chars().count() > MAX_CELL_WIDTH {
        let head: String = flat.chars().take(MAX_CELL_WIDTH - 3).collect();
        format!("{head}...")
    } else {
        flat
    }
}
