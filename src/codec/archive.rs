use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Read, Write};

use chrono::{SecondsFormat, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zip::result::ZipError;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::bundle::{
    bytes_sha256, content_defects, Attachment, Bundle, ColumnValue, CorrelationKey, Manifest,
    Record, TableManifest, Values,
};
use crate::error::{BundleDefect, MigrationError, MigrationResult};

pub const FORMAT_VERSION: &str = "1.0.0";

const HEADER_NAME: &str = "manifest.json";
const DATA_DIR: &str = "data";
const ATTACHMENTS_DIR: &str = "attachments";
const META_NAME: &str = "meta.json";
const CONTENT_NAME: &str = "content";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArchiveHeader {
    format_version: String,
    created_at: String,
    tables: Vec<TableManifest>,
    #[serde(default)]
    sections: BTreeMap<String, SectionInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SectionInfo {
    count: u64,
    sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachmentMeta {
    table: String,
    business_key: String,
    column: String,
    file_name: String,
    media_type: String,
    size: u64,
    sha256: String,
}

/// Writes the bundle as a zip container: a header with the manifest and
/// section digests, one JSON-lines data section per table and one directory
/// per attachment.
pub fn encode(bundle: &Bundle) -> MigrationResult<Vec<u8>> {
    let mut sections = Vec::with_capacity(bundle.manifest().tables.len());
    let mut infos = BTreeMap::new();
    for table in &bundle.manifest().tables {
        let mut body = Vec::new();
        let mut count = 0_u64;
        for record in bundle.records_for(&table.name) {
            check_finite(record)?;
            serde_json::to_writer(&mut body, &record.values)
                .map_err(|err| MigrationError::Encode(err.to_string()))?;
            body.push(b'\n');
            count += 1;
        }
        infos.insert(
            table.name.clone(),
            SectionInfo {
                count,
                sha256: bytes_sha256(&body),
            },
        );
        sections.push((format!("{DATA_DIR}/{}.jsonl", table.name), body));
    }

    let header = ArchiveHeader {
        format_version: FORMAT_VERSION.to_string(),
        created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        tables: bundle.manifest().tables.clone(),
        sections: infos,
    };
    let header_json =
        serde_json::to_vec_pretty(&header).map_err(|err| MigrationError::Encode(err.to_string()))?;

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    write_entry(&mut writer, HEADER_NAME, &header_json, options)?;
    for (name, body) in &sections {
        write_entry(&mut writer, name, body, options)?;
    }
    for (index, attachment) in bundle.attachments().iter().enumerate() {
        let meta = AttachmentMeta {
            table: attachment.correlation.table.clone(),
            business_key: attachment.correlation.business_key.clone(),
            column: attachment.correlation.column.clone(),
            file_name: attachment.file_name.clone(),
            media_type: attachment.media_type.clone(),
            size: attachment.bytes.len() as u64,
            sha256: attachment.sha256(),
        };
        let meta_json =
            serde_json::to_vec_pretty(&meta).map_err(|err| MigrationError::Encode(err.to_string()))?;
        let dir = format!("{ATTACHMENTS_DIR}/{index:04}");
        write_entry(&mut writer, &format!("{dir}/{META_NAME}"), &meta_json, options)?;
        write_entry(
            &mut writer,
            &format!("{dir}/{CONTENT_NAME}"),
            &attachment.bytes,
            options,
        )?;
    }
    let cursor = writer.finish().map_err(map_zip_error)?;
    let bytes = cursor.into_inner();
    info!(
        target: "cfg_migrate",
        event = "bundle_encoded",
        tables = bundle.manifest().tables.len(),
        records = bundle.records().len(),
        attachments = bundle.attachments().len(),
        size_bytes = bytes.len()
    );
    Ok(bytes)
}

/// Parses a zip container back into a bundle, collecting every structural
/// defect before failing.
pub fn decode(bytes: &[u8]) -> MigrationResult<Bundle> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(|err| {
        MigrationError::malformed(BundleDefect::Archive {
            detail: err.to_string(),
        })
    })?;

    let header_bytes = read_entry(&mut archive, HEADER_NAME)?.ok_or_else(|| {
        MigrationError::malformed(BundleDefect::MissingSection {
            section: HEADER_NAME.to_string(),
        })
    })?;
    let header: ArchiveHeader = serde_json::from_slice(&header_bytes).map_err(|err| {
        MigrationError::malformed(BundleDefect::ManifestParse {
            detail: err.to_string(),
        })
    })?;
    check_format_version(&header.format_version)?;

    let manifest = Manifest::new(header.tables);
    let manifest_defects = manifest.validate();
    if !manifest_defects.is_empty() {
        return Err(MigrationError::MalformedBundle {
            defects: manifest_defects,
        });
    }

    let mut defects = Vec::new();
    let mut records = Vec::new();
    for table in &manifest.tables {
        let name = format!("{DATA_DIR}/{}.jsonl", table.name);
        let Some(body) = read_entry(&mut archive, &name)? else {
            defects.push(BundleDefect::MissingDataSection {
                table: table.name.clone(),
            });
            continue;
        };
        let section = header.sections.get(&table.name);
        if let Some(info) = section {
            if info.sha256 != bytes_sha256(&body) {
                defects.push(BundleDefect::DigestMismatch { section: name.clone() });
            }
        }
        let parsed = parse_section(&table.name, &body, &mut defects);
        if let Some(info) = section {
            if info.count != parsed.len() as u64 {
                defects.push(BundleDefect::CountMismatch {
                    table: table.name.clone(),
                    expected: info.count,
                    actual: parsed.len() as u64,
                });
            }
        }
        records.extend(parsed);
    }

    let declared: BTreeSet<&str> = manifest.table_names().collect();
    let entry_names: Vec<String> = archive.file_names().map(str::to_string).collect();
    for name in &entry_names {
        if let Some(table) = name
            .strip_prefix(&format!("{DATA_DIR}/"))
            .and_then(|rest| rest.strip_suffix(".jsonl"))
        {
            if !declared.contains(table) {
                defects.push(BundleDefect::UndeclaredTable {
                    table: table.to_string(),
                });
            }
        }
    }

    let mut meta_entries: Vec<&String> = entry_names
        .iter()
        .filter(|name| {
            name.starts_with(&format!("{ATTACHMENTS_DIR}/"))
                && name.ends_with(&format!("/{META_NAME}"))
        })
        .collect();
    meta_entries.sort();
    let mut attachments = Vec::with_capacity(meta_entries.len());
    for meta_name in meta_entries {
        if let Some(attachment) = read_attachment(&mut archive, meta_name, &mut defects)? {
            attachments.push(attachment);
        }
    }

    if !defects.is_empty() {
        defects.extend(content_defects(&manifest, &records, &attachments));
        return Err(MigrationError::MalformedBundle { defects });
    }
    let bundle = Bundle::new(manifest, records, attachments)?;
    debug!(
        target: "cfg_migrate",
        event = "bundle_decoded",
        records = bundle.records().len(),
        attachments = bundle.attachments().len()
    );
    Ok(bundle)
}

fn parse_section(table: &str, body: &[u8], defects: &mut Vec<BundleDefect>) -> Vec<Record> {
    let mut records = Vec::new();
    for (index, line) in body.split(|b| *b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<Values>(line) {
            Ok(values) => records.push(Record {
                table: table.to_string(),
                values,
            }),
            Err(err) => defects.push(BundleDefect::DataParse {
                table: table.to_string(),
                line: index + 1,
                detail: err.to_string(),
            }),
        }
    }
    records
}

fn read_attachment(
    archive: &mut ZipArchive<Cursor<&[u8]>>,
    meta_name: &str,
    defects: &mut Vec<BundleDefect>,
) -> MigrationResult<Option<Attachment>> {
    let dir = meta_name.trim_end_matches(META_NAME);
    let meta_bytes = read_entry(archive, meta_name)?.unwrap_or_default();
    let meta: AttachmentMeta = match serde_json::from_slice(&meta_bytes) {
        Ok(meta) => meta,
        Err(err) => {
            defects.push(BundleDefect::AttachmentEntry {
                entry: meta_name.to_string(),
                detail: err.to_string(),
            });
            return Ok(None);
        }
    };
    let content_name = format!("{dir}{CONTENT_NAME}");
    let Some(bytes) = read_entry(archive, &content_name)? else {
        defects.push(BundleDefect::MissingSection {
            section: content_name,
        });
        return Ok(None);
    };
    if bytes_sha256(&bytes) != meta.sha256 {
        defects.push(BundleDefect::DigestMismatch {
            section: content_name,
        });
        return Ok(None);
    }
    Ok(Some(Attachment {
        correlation: CorrelationKey {
            table: meta.table,
            business_key: meta.business_key,
            column: meta.column,
        },
        file_name: meta.file_name,
        media_type: meta.media_type,
        bytes,
    }))
}

fn check_format_version(found: &str) -> MigrationResult<()> {
    let unsupported = || {
        MigrationError::malformed(BundleDefect::UnsupportedFormatVersion {
            found: found.to_string(),
            supported: FORMAT_VERSION.to_string(),
        })
    };
    let version = Version::parse(found).map_err(|_| unsupported())?;
    let supported = Version::parse(FORMAT_VERSION).map_err(|_| unsupported())?;
    if version.major != supported.major || version > supported {
        return Err(unsupported());
    }
    Ok(())
}

fn check_finite(record: &Record) -> MigrationResult<()> {
    for (column, value) in &record.values {
        if let ColumnValue::Real(v) = value {
            if !v.is_finite() {
                return Err(MigrationError::Encode(format!(
                    "{} column {column} holds non-finite value {v}",
                    record.table
                )));
            }
        }
    }
    Ok(())
}

fn read_entry(
    archive: &mut ZipArchive<Cursor<&[u8]>>,
    name: &str,
) -> MigrationResult<Option<Vec<u8>>> {
    let mut file = match archive.by_name(name) {
        Ok(file) => file,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(err) => {
            return Err(MigrationError::malformed(BundleDefect::Archive {
                detail: format!("{name}: {err}"),
            }))
        }
    };
    let mut buf = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut buf).map_err(|err| {
        MigrationError::malformed(BundleDefect::Archive {
            detail: format!("{name}: {err}"),
        })
    })?;
    Ok(Some(buf))
}

fn write_entry(
    writer: &mut ZipWriter<Cursor<Vec<u8>>>,
    name: &str,
    bytes: &[u8],
    options: FileOptions,
) -> MigrationResult<()> {
    writer.start_file(name, options).map_err(map_zip_error)?;
    writer
        .write_all(bytes)
        .map_err(|err| MigrationError::Encode(format!("{name}: {err}")))
}

fn map_zip_error(err: ZipError) -> MigrationError {
    MigrationError::Encode(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Bundle {
        let manifest = Manifest::new(vec![
            TableManifest::new("rf_workflow", "c_code"),
            TableManifest::new("rf_state", "c_code").with_foreign_key("id_parent", "rf_workflow", false),
            TableManifest::new("rf_script", "c_code").with_file_column("c_source_file"),
        ]);
        Bundle::new(
            manifest,
            vec![
                Record::new("rf_workflow")
                    .with("c_code", "wf.approval")
                    .with("c_name", "Approval"),
                Record::new("rf_state")
                    .with("c_code", "wf.approval.draft")
                    .with("id_parent", "wf.approval"),
                Record::new("rf_script")
                    .with("c_code", "sc.notify")
                    .with("c_source_file", ColumnValue::Null),
            ],
            vec![Attachment {
                correlation: CorrelationKey {
                    table: "rf_script".into(),
                    business_key: "sc.notify".into(),
                    column: "c_source_file".into(),
                },
                file_name: "notify.groovy".into(),
                media_type: "text/plain".into(),
                bytes: b"println 'notify'".to_vec(),
            }],
        )
        .unwrap()
    }

    /// Rebuilds an archive, letting the caller rewrite or drop entries.
    fn rewrite_archive(
        bytes: &[u8],
        mut edit: impl FnMut(&str, Vec<u8>) -> Option<Vec<u8>>,
    ) -> Vec<u8> {
        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let names: Vec<String> = archive.file_names().map(str::to_string).collect();
        for name in names {
            let body = read_entry(&mut archive, &name).unwrap().unwrap();
            if let Some(body) = edit(&name, body) {
                write_entry(&mut writer, &name, &body, FileOptions::default()).unwrap();
            }
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn encode_then_decode_preserves_bundle() {
        let bundle = sample();
        let decoded = decode(&encode(&bundle).unwrap()).unwrap();
        assert_eq!(decoded, bundle);
    }

    #[test]
    fn reals_decode_to_the_same_bits() {
        let values = [
            1.0715660391465826e-75,
            0.1 + 0.2,
            -2.2250738585072014e-308,
            f64::MAX,
            f64::MIN_POSITIVE / 3.0,
        ];
        let records = values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                Record::new("rf_workflow")
                    .with("c_code", format!("wf.{i}"))
                    .with("c_weight", ColumnValue::Real(*v))
            })
            .collect();
        let manifest = Manifest::new(vec![TableManifest::new("rf_workflow", "c_code")]);
        let bundle = Bundle::new(manifest, records, vec![]).unwrap();
        let decoded = decode(&encode(&bundle).unwrap()).unwrap();
        for (record, expected) in decoded.records().iter().zip(values) {
            let Some(ColumnValue::Real(actual)) = record.values.get("c_weight") else {
                panic!("expected a real in {record:?}");
            };
            assert_eq!(actual.to_bits(), expected.to_bits());
        }
    }

    #[test]
    fn missing_data_section_is_reported() {
        let bytes = rewrite_archive(&encode(&sample()).unwrap(), |name, body| {
            (name != "data/rf_state.jsonl").then_some(body)
        });
        let err = decode(&bytes).unwrap_err();
        let MigrationError::MalformedBundle { defects } = err else {
            panic!("expected malformed bundle");
        };
        assert!(defects.contains(&BundleDefect::MissingDataSection {
            table: "rf_state".into()
        }));
    }

    #[test]
    fn tampered_section_fails_digest_check() {
        let bytes = rewrite_archive(&encode(&sample()).unwrap(), |name, body| {
            if name == "data/rf_workflow.jsonl" {
                Some(
                    String::from_utf8(body)
                        .unwrap()
                        .replace("Approval", "Tampered")
                        .into_bytes(),
                )
            } else {
                Some(body)
            }
        });
        let err = decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("digest mismatch for section data/rf_workflow.jsonl"));
    }

    #[test]
    fn unparsable_rows_name_the_line() {
        let bytes = rewrite_archive(&encode(&sample()).unwrap(), |name, body| {
            if name == "data/rf_state.jsonl" {
                let mut body = body;
                body.extend_from_slice(b"{not json}\n");
                Some(body)
            } else {
                Some(body)
            }
        });
        let MigrationError::MalformedBundle { defects } = decode(&bytes).unwrap_err() else {
            panic!("expected malformed bundle");
        };
        assert!(defects
            .iter()
            .any(|d| matches!(d, BundleDefect::DataParse { line: 2, .. })));
    }

    #[test]
    fn newer_major_format_is_rejected() {
        let bytes = rewrite_archive(&encode(&sample()).unwrap(), |name, body| {
            if name == HEADER_NAME {
                Some(
                    String::from_utf8(body)
                        .unwrap()
                        .replace(FORMAT_VERSION, "2.0.0")
                        .into_bytes(),
                )
            } else {
                Some(body)
            }
        });
        let err = decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("unsupported bundle format version 2.0.0"));
    }

    #[test]
    fn garbage_is_not_an_archive() {
        let err = decode(b"definitely not a zip").unwrap_err();
        assert!(err.to_string().contains("unreadable archive"));
    }

    #[test]
    fn non_finite_reals_cannot_be_encoded() {
        let manifest = Manifest::new(vec![TableManifest::new("rf_lookup", "c_code")]);
        let bundle = Bundle::new(
            manifest,
            vec![Record::new("rf_lookup")
                .with("c_code", "lk.1")
                .with("c_weight", ColumnValue::Real(f64::NAN))],
            vec![],
        )
        .unwrap();
        assert!(matches!(encode(&bundle), Err(MigrationError::Encode(_))));
    }
}
