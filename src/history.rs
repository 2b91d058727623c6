use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use csv::WriterBuilder;

pub const CSV_FILE_NAME: &str = "captions.csv";
pub const CSV_MIME: &str = "text/csv";
const CSV_HEADER: [&str; 3] = ["#", "timestamp_iso", "caption"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptionRecord {
    pub caption: String,
    pub timestamp: DateTime<Utc>,
}

impl CaptionRecord {
    pub fn timestamp_iso(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

/// On-demand CSV snapshot of a history.
#[derive(Debug, Clone)]
pub struct CsvExport {
    pub file_name: &'static str,
    pub mime: &'static str,
    pub bytes: Vec<u8>,
}

/// Append-only caption log owned by one session. Stored oldest first.
#[derive(Debug, Default, Clone)]
pub struct CaptionHistory {
    records: Vec<CaptionRecord>,
}

impl CaptionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, caption: impl Into<String>, timestamp: DateTime<Utc>) -> &CaptionRecord {
        self.records.push(CaptionRecord {
            caption: caption.into(),
            timestamp,
        });
        tracing::debug!("History now holds {} captions", self.records.len());
        &self.records[self.records.len() - 1]
    }

    pub fn clear(&mut self) {
        let dropped = std::mem::take(&mut self.records);
        tracing::info!("Cleared {} captions from history", dropped.len());
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last(&self) -> Option<&CaptionRecord> {
        self.records.last()
    }

    /// Records in insertion order.
    pub fn records(&self) -> &[CaptionRecord] {
        &self.records
    }

    /// Records newest first, for presentation.
    pub fn display_order(&self) -> Vec<&CaptionRecord> {
        self.records.iter().rev().collect()
    }

    /// Serializes the history as `#,timestamp_iso,caption` rows in
    /// chronological order. Row numbers are 1-based and assigned here.
    pub fn export_csv(&self) -> Result<Vec<u8>> {
        let mut wtr = WriterBuilder::new().from_writer(vec![]);
        wtr.write_record(CSV_HEADER)
            .context("Failed to write CSV header")?;

        for (index, record) in self.records.iter().enumerate() {
            let row = (index + 1).to_string();
            let timestamp = record.timestamp_iso();
            wtr.write_record([row.as_str(), timestamp.as_str(), record.caption.as_str()])
                .with_context(|| format!("Failed to write CSV row {}", row))?;
        }
        wtr.flush()?;

        wtr.into_inner().context("Failed to finish CSV export")
    }

    pub fn export(&self) -> Result<CsvExport> {
        Ok(CsvExport {
            file_name: CSV_FILE_NAME,
            mime: CSV_MIME,
            bytes: self.export_csv()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use csv::ReaderBuilder;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn parse(bytes: &[u8]) -> (Vec<String>, Vec<Vec<String>>) {
        let mut rdr = ReaderBuilder::new().has_headers(true).from_reader(bytes);
        let headers = rdr.headers().unwrap().iter().map(str::to_string).collect();
        let rows = rdr
            .records()
            .map(|r| r.unwrap().iter().map(str::to_string).collect())
            .collect();
        (headers, rows)
    }

    #[test]
    fn test_export_is_idempotent() {
        let mut history = CaptionHistory::new();
        history.append("a cat on a sofa", at(0));
        history.append("two dogs, playing", at(5));

        let first = history.export_csv().unwrap();
        let second = history.export_csv().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_append_shows_up_as_last_row() {
        let mut history = CaptionHistory::new();
        history.append("first", at(0));
        let before = parse(&history.export_csv().unwrap()).1.len();

        let record = history.append("a bowl of fruit", at(42)).clone();
        let (_, rows) = parse(&history.export_csv().unwrap());

        assert_eq!(rows.len(), before + 1);
        let last = rows.last().unwrap();
        assert_eq!(last[0], "2");
        assert_eq!(last[1], record.timestamp_iso());
        assert_eq!(last[2], "a bowl of fruit");
    }

    #[test]
    fn test_clear_leaves_header_only() {
        let mut history = CaptionHistory::new();
        for i in 0..4 {
            history.append(format!("caption {}", i), at(i));
        }
        history.clear();
        assert!(history.is_empty());

        let bytes = history.export_csv().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert_eq!(text.lines().count(), 1);

        let (headers, rows) = parse(&bytes);
        assert_eq!(headers, vec!["#", "timestamp_iso", "caption"]);
        assert!(rows.is_empty());
    }

    #[test]
    fn test_display_order_is_newest_first() {
        let mut history = CaptionHistory::new();
        history.append("A", at(0));
        history.append("B", at(1));
        history.append("C", at(2));

        let shown: Vec<&str> = history
            .display_order()
            .iter()
            .map(|r| r.caption.as_str())
            .collect();
        assert_eq!(shown, vec!["C", "B", "A"]);

        let stored: Vec<&str> = history.records().iter().map(|r| r.caption.as_str()).collect();
        assert_eq!(stored, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_special_characters_survive_export() {
        let tricky = [
            r#"A dog, "Rex", running"#,
            "line one\nline two",
            "plain",
        ];
        let mut history = CaptionHistory::new();
        for (i, caption) in tricky.iter().enumerate() {
            history.append(*caption, at(i as i64));
        }

        let (_, rows) = parse(&history.export_csv().unwrap());
        let captions: Vec<&str> = rows.iter().map(|r| r[2].as_str()).collect();
        assert_eq!(captions, tricky);
    }

    #[test]
    fn test_timestamp_is_utc_iso8601() {
        let record = CaptionRecord {
            caption: "x".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap(),
        };
        assert_eq!(record.timestamp_iso(), "2024-03-01T12:30:05Z");
    }

    #[test]
    fn test_export_artifact_metadata() {
        let export = CaptionHistory::new().export().unwrap();
        assert_eq!(export.file_name, "captions.csv");
        assert_eq!(export.mime, "text/csv");
        assert!(!export.bytes.is_empty());
    }
}
