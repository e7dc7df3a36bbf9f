use crate::aggregator::AggregatedEntity;
use crate::CrawlError;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

/// Downstream consumer of the final deduplicated dataset.
pub trait ExportSink {
    fn write(&mut self, entities: &[AggregatedEntity]) -> Result<usize, CrawlError>;
}

/// Export row: the entity key, how many jobs contributed, and the merged fields.
/// Fields stay nested so payload keys never shadow `entity_key` or `sources`.
#[derive(Debug, Serialize)]
pub struct ExportRow<'a> {
    pub entity_key: &'a str,
    pub sources: usize,
    pub fields: Map<String, Value>,
}

impl<'a> From<&'a AggregatedEntity> for ExportRow<'a> {
    fn from(entity: &'a AggregatedEntity) -> Self {
        Self {
            entity_key: &entity.entity_key,
            sources: entity.source_job_ids.len(),
            fields: entity.fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        }
    }
}

/// Writes the collection as one JSON array, replacing the target atomically.
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl ExportSink for JsonFileSink {
    fn write(&mut self, entities: &[AggregatedEntity]) -> Result<usize, CrawlError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let temp = self.path.with_extension("json.tmp");
        {
            let mut writer = BufWriter::new(File::create(&temp)?);
            let rows: Vec<ExportRow<'_>> = entities.iter().map(ExportRow::from).collect();
            serde_json::to_writer_pretty(&mut writer, &rows)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&temp, &self.path)?;
        tracing::info!(path = %self.path.display(), entities = entities.len(), "export written");
        Ok(entities.len())
    }
}
