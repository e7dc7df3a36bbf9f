use crate::job::CatalogEntry;
use crate::CrawlError;
use std::fs;
use std::path::Path;

/// Read the static job catalog.
///
/// `.jsonl` files hold one entry per line (blank lines skipped); anything else is
/// parsed as a JSON array of entries.
pub fn load_catalog(path: &Path) -> Result<Vec<CatalogEntry>, CrawlError> {
    let text = fs::read_to_string(path)?;
    let is_jsonl = path.extension().map(|e| e == "jsonl").unwrap_or(false);
    let entries = if is_jsonl { parse_jsonl(&text)? } else { parse_array(&text)? };
    tracing::info!(path = %path.display(), entries = entries.len(), "catalog loaded");
    Ok(entries)
}

pub fn parse_array(text: &str) -> Result<Vec<CatalogEntry>, CrawlError> {
    let entries: Vec<CatalogEntry> = serde_json::from_str(text)?;
    for (index, entry) in entries.iter().enumerate() {
        entry.validate().map_err(|e| located(format!("catalog entry {}", index), e))?;
    }
    Ok(entries)
}

pub fn parse_jsonl(text: &str) -> Result<Vec<CatalogEntry>, CrawlError> {
    let mut entries = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let entry: CatalogEntry = serde_json::from_str(line)
            .map_err(|e| CrawlError::Other(format!("catalog line {}: {}", line_no + 1, e)))?;
        entry.validate().map_err(|e| located(format!("catalog line {}", line_no + 1), e))?;
        entries.push(entry);
    }
    Ok(entries)
}

fn located(location: String, err: CrawlError) -> CrawlError {
    match err {
        CrawlError::InvalidCatalog(reason) => CrawlError::InvalidCatalog(format!("{}: {}", location, reason)),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_jsonl_skips_blank_lines() {
        let text = r#"{"entity_key": "p1", "keyword": "clinic", "descriptor": {"name": "A"}}

{"entity_key": "p2"}
"#;
        let entries = parse_jsonl(text).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].job_id(), "p1::clinic");
        assert_eq!(entries[1].job_id(), "p2");
    }

    #[test]
    fn test_parse_jsonl_reports_line() {
        let err = parse_jsonl("{\"entity_key\": \"p1\"}\nnot json\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_load_json_array() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("catalog.json");
        fs::write(&path, r#"[{"entity_key": "a"}, {"entity_key": "a", "keyword": "dentist"}]"#).unwrap();
        let entries = load_catalog(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].job_id(), "a::dentist");
    }

    #[test]
    fn test_array_entries_are_validated() {
        let err = parse_array(r#"[{"entity_key": "a"}, {"entity_key": "  "}]"#).unwrap_err();
        assert!(matches!(err, CrawlError::InvalidCatalog(_)));
        assert!(err.to_string().contains("entry 1"));

        let ambiguous = parse_array(r#"[{"entity_key": "a::b"}]"#);
        assert!(matches!(ambiguous, Err(CrawlError::InvalidCatalog(_))));
    }

    #[test]
    fn test_jsonl_empty_key_reports_line() {
        let err = parse_jsonl("{\"entity_key\": \"p1\"}\n{\"entity_key\": \"\"}\n").unwrap_err();
        assert!(matches!(err, CrawlError::InvalidCatalog(_)));
        assert!(err.to_string().contains("line 2"));
    }
}
