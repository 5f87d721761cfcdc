use crate::cli::OutputFormat;
use std::io::{IsTerminal, Write};
use whodb_core::{EngineError, GetRowsResult};

/// Render a result set to stdout in the selected format.
pub fn print_result(result: &GetRowsResult, format: OutputFormat) -> Result<(), EngineError> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let format = resolve(format);

    match format {
        OutputFormat::Table => print_table(&mut out, result),
        OutputFormat::Plain => print_plain(&mut out, result),
        OutputFormat::Json => print_json(&mut out, result),
        OutputFormat::Csv => print_csv(&mut out, result),
        OutputFormat::Auto => unreachable!("resolved above"),
    }
}

/// Render a flat list of names (schemas, databases).
pub fn print_list(names: &[String], format: OutputFormat) -> Result<(), EngineError> {
    match resolve(format) {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(names).unwrap_or_default());
        }
        _ => {
            for name in names {
                println!("{name}");
            }
        }
    }
    Ok(())
}

fn resolve(format: OutputFormat) -> OutputFormat {
    match format {
        OutputFormat::Auto => {
            if std::io::stdout().is_terminal() {
                OutputFormat::Table
            } else {
                OutputFormat::Plain
            }
        }
        other => other,
    }
}

fn print_table(out: &mut impl Write, result: &GetRowsResult) -> Result<(), EngineError> {
    let headers: Vec<&str> = result.columns.iter().map(|c| c.name.as_str()).collect();

    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in &result.rows {
        for (i, value) in row.iter().enumerate() {
            if let Some(width) = widths.get_mut(i) {
                *width = (*width).max(value.chars().count().min(60));
            }
        }
    }

    let line = |out: &mut dyn Write, sep: char| -> std::io::Result<()> {
        write!(out, "+")?;
        for width in &widths {
            write!(out, "{}+", sep.to_string().repeat(width + 2))?;
        }
        writeln!(out)
    };

    let row_line = |out: &mut dyn Write, cells: &[&str]| -> std::io::Result<()> {
        write!(out, "|")?;
        for (i, width) in widths.iter().enumerate() {
            let cell = cells.get(i).copied().unwrap_or("");
            let truncated: String = cell.chars().take(60).collect();
            write!(out, " {truncated:<width$} |", width = width)?;
        }
        writeln!(out)
    };

    line(out, '-')?;
    row_line(out, &headers)?;
    line(out, '-')?;
    for row in &result.rows {
        let cells: Vec<&str> = row.iter().map(String::as_str).collect();
        row_line(out, &cells)?;
    }
    line(out, '-')?;
    writeln!(out, "{} rows", result.rows.len())?;
    Ok(())
}

fn print_plain(out: &mut impl Write, result: &GetRowsResult) -> Result<(), EngineError> {
    let headers: Vec<&str> = result.columns.iter().map(|c| c.name.as_str()).collect();
    writeln!(out, "{}", headers.join("\t"))?;
    for row in &result.rows {
        writeln!(out, "{}", row.join("\t"))?;
    }
    Ok(())
}

fn print_json(out: &mut impl Write, result: &GetRowsResult) -> Result<(), EngineError> {
    let objects: Vec<serde_json::Value> = result
        .rows
        .iter()
        .map(|row| {
            let mut object = serde_json::Map::new();
            for (column, value) in result.columns.iter().zip(row) {
                object.insert(
                    column.name.clone(),
                    serde_json::Value::String(value.clone()),
                );
            }
            serde_json::Value::Object(object)
        })
        .collect();
    writeln!(
        out,
        "{}",
        serde_json::to_string_pretty(&objects).unwrap_or_default()
    )?;
    Ok(())
}

fn print_csv(out: &mut impl Write, result: &GetRowsResult) -> Result<(), EngineError> {
    let mut writer = csv::Writer::from_writer(out);
    let headers: Vec<&str> = result.columns.iter().map(|c| c.name.as_str()).collect();
    writer
        .write_record(&headers)
        .map_err(|e| EngineError::internal(e.to_string()))?;
    for row in &result.rows {
        writer
            .write_record(row)
            .map_err(|e| EngineError::internal(e.to_string()))?;
    }
    writer
        .flush()
        .map_err(|e| EngineError::internal(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use whodb_core::Column;

    fn result() -> GetRowsResult {
        GetRowsResult {
            columns: vec![Column::new("id", "INTEGER"), Column::new("name", "TEXT")],
            rows: vec![vec!["1".into(), "alice".into()]],
            disable_update: false,
        }
    }

    #[test]
    fn plain_output_is_tab_separated() {
        let mut out = Vec::new();
        print_plain(&mut out, &result()).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "id\tname\n1\talice\n");
    }

    #[test]
    fn json_output_keys_by_column() {
        let mut out = Vec::new();
        print_json(&mut out, &result()).unwrap();
        let parsed: serde_json::Value =
            serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed[0]["name"], "alice");
    }

    #[test]
    fn table_output_draws_borders() {
        let mut out = Vec::new();
        print_table(&mut out, &result()).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("| id | name  |"));
        assert!(text.contains("1 rows"));
    }
}
