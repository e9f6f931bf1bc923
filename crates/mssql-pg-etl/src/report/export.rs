//! Per-table stats files.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::RunSummary;
use crate::error::Result;

/// Writes `<table>_stats.csv` and `<table>_stats.json` into a directory.
#[derive(Debug, Clone)]
pub struct StatsExport {
    dir: PathBuf,
}

impl StatsExport {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write both files and return their paths (CSV first).
    pub fn write(&self, summary: &RunSummary) -> Result<(PathBuf, PathBuf)> {
        std::fs::create_dir_all(&self.dir)?;
        let stem = file_stem(&summary.table);

        let csv_path = self.dir.join(format!("{}_stats.csv", stem));
        self.write_csv(&csv_path, summary)?;

        let json_path = self.dir.join(format!("{}_stats.json", stem));
        std::fs::write(&json_path, serde_json::to_string_pretty(summary)?)?;

        debug!(
            "Wrote stats for {} to {} and {}",
            summary.table,
            csv_path.display(),
            json_path.display()
        );
        Ok((csv_path, json_path))
    }

    fn write_csv(&self, path: &Path, summary: &RunSummary) -> Result<()> {
        // Summary rows are two fields wide, skip lines three.
        let mut wtr = csv::WriterBuilder::new().flexible(true).from_path(path)?;

        let mut metrics = vec![
            ("table".to_string(), summary.table.clone()),
            ("strategy".to_string(), summary.strategy.clone()),
            ("total".to_string(), summary.total.to_string()),
            ("inserted".to_string(), summary.inserted.to_string()),
            ("updated".to_string(), summary.updated.to_string()),
            ("skipped".to_string(), summary.skipped.to_string()),
            (
                "unresolved_references".to_string(),
                summary.unresolved_references.to_string(),
            ),
            (
                "duration_seconds".to_string(),
                format!("{:.3}", summary.duration_seconds),
            ),
        ];
        for (kind, count) in &summary.skip_counts {
            metrics.push((format!("skipped.{}", kind), count.to_string()));
        }

        wtr.write_record(["metric", "value"])?;
        for (name, value) in &metrics {
            wtr.write_record([name.as_str(), value.as_str()])?;
        }

        wtr.write_record(["record_id", "kind", "reason"])?;
        for skip in &summary.skipped_records {
            let kind = skip.kind.to_string();
            wtr.write_record([skip.record_id.as_str(), kind.as_str(), skip.reason.as_str()])?;
        }
        wtr.flush()?;
        Ok(())
    }
}

/// File-system safe name for a possibly schema-qualified table.
fn file_stem(table: &str) -> String {
    table
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
