//! Row sinks used by `Plugin::export_data` and the CLI `export` command.
//!
//! Sinks implement pull back-pressure: any error returned from a write
//! tells the streaming plugin to stop iterating and release its cursor.

use std::io::Write;
use whodb_core::{Column, EngineError, RowSink};

/// Streams rows as CSV with a header row of column names.
pub struct CsvSink<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> CsvSink<W> {
    pub fn new(inner: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(inner),
        }
    }

    pub fn finish(mut self) -> Result<(), EngineError> {
        self.writer
            .flush()
            .map_err(|e| EngineError::internal(format!("flushing export failed: {e}")))
    }
}

impl<W: Write> RowSink for CsvSink<W> {
    fn write_header(&mut self, columns: &[Column]) -> Result<(), EngineError> {
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        self.writer
            .write_record(&names)
            .map_err(|e| EngineError::internal(format!("writing export header failed: {e}")))
    }

    fn write_row(&mut self, row: &[String]) -> Result<(), EngineError> {
        self.writer
            .write_record(row)
            .map_err(|e| EngineError::internal(format!("writing export row failed: {e}")))
    }
}

/// Streams rows as JSON objects, one per line, keyed by column name.
pub struct JsonLinesSink<W: Write> {
    inner: W,
    columns: Vec<String>,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            columns: Vec::new(),
        }
    }
}

impl<W: Write> RowSink for JsonLinesSink<W> {
    fn write_header(&mut self, columns: &[Column]) -> Result<(), EngineError> {
        self.columns = columns.iter().map(|c| c.name.clone()).collect();
        Ok(())
    }

    fn write_row(&mut self, row: &[String]) -> Result<(), EngineError> {
        let mut object = serde_json::Map::new();
        for (name, value) in self.columns.iter().zip(row) {
            object.insert(name.clone(), serde_json::Value::String(value.clone()));
        }
        let line = serde_json::Value::Object(object).to_string();
        writeln!(self.inner, "{line}")
            .map_err(|e| EngineError::internal(format!("writing export row failed: {e}")))
    }
}

/// Sink that stops the stream after a fixed number of rows. Used to put a
/// bound on previews without the plugin knowing about it.
pub struct LimitedSink<'a> {
    inner: &'a mut dyn RowSink,
    remaining: usize,
}

impl<'a> LimitedSink<'a> {
    pub fn new(inner: &'a mut dyn RowSink, limit: usize) -> Self {
        Self {
            inner,
            remaining: limit,
        }
    }
}

impl RowSink for LimitedSink<'_> {
    fn write_header(&mut self, columns: &[Column]) -> Result<(), EngineError> {
        self.inner.write_header(columns)
    }

    fn write_row(&mut self, row: &[String]) -> Result<(), EngineError> {
        if self.remaining == 0 {
            return Err(EngineError::Canceled);
        }
        self.remaining -= 1;
        self.inner.write_row(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns() -> Vec<Column> {
        vec![Column::new("id", "INTEGER"), Column::new("name", "TEXT")]
    }

    #[test]
    fn csv_sink_writes_header_and_rows() {
        let mut out = Vec::new();
        {
            let mut sink = CsvSink::new(&mut out);
            sink.write_header(&columns()).unwrap();
            sink.write_row(&["1".into(), "alice".into()]).unwrap();
            sink.write_row(&["2".into(), "bob,jr".into()]).unwrap();
            sink.finish().unwrap();
        }
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "id,name\n1,alice\n2,\"bob,jr\"\n");
    }

    #[test]
    fn json_lines_sink_keys_by_column() {
        let mut out = Vec::new();
        {
            let mut sink = JsonLinesSink::new(&mut out);
            sink.write_header(&columns()).unwrap();
            sink.write_row(&["1".into(), "alice".into()]).unwrap();
        }
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "{\"id\":\"1\",\"name\":\"alice\"}\n");
    }

    #[test]
    fn limited_sink_signals_stop() {
        let mut out = Vec::new();
        let mut csv = CsvSink::new(&mut out);
        let mut sink = LimitedSink::new(&mut csv, 1);
        sink.write_header(&columns()).unwrap();
        sink.write_row(&["1".into(), "a".into()]).unwrap();
        let err = sink.write_row(&["2".into(), "b".into()]).unwrap_err();
        assert_eq!(err.code(), "CANCELED");
    }
}
