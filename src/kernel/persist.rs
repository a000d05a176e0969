//! On-disk kernel cache format.
//!
//! Layout under the configured directory:
//! - `manifest.json`: schema version (first field), then the entry list
//!   with key, version, timestamps, TTL, and layout descriptors.
//! - `blobs/<hex>`: raw artifact payload bytes, named by the SHA-256 of
//!   the key concatenated with the version.
//!
//! Readers refuse unknown schema versions and skip anything that fails
//! to parse; a broken cache rebuilds on demand instead of crashing.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::element::ElemType;
use crate::error::{ErrorKind, GpuError, GpuResult};
use crate::kernel::{ArtifactPayload, KernelArtifact, ParamKind, ParamLayout, ParamSpec};

/// Bump when the manifest layout changes; readers refuse other versions.
const SCHEMA_VERSION: u32 = 1;

const MANIFEST_FILE: &str = "manifest.json";
const BLOBS_DIR: &str = "blobs";

/// One cache entry in transit to or from disk.
pub(crate) struct DiskEntry {
    pub key: u64,
    pub version: String,
    pub ttl: Duration,
    pub created_unix: u64,
    pub access_count: u64,
    pub artifact: KernelArtifact,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize)]
struct Manifest {
    schema_version: u32,
    entries: Vec<ManifestEntry>,
}

#[derive(Serialize, Deserialize)]
struct ManifestEntry {
    key: u64,
    version: String,
    blob: String,
    payload_kind: String,
    entry_point: String,
    params: Vec<ManifestParam>,
    size: u64,
    created_unix: u64,
    ttl_secs: u64,
    access_count: u64,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize)]
struct ManifestParam {
    kind: String,
    elem: Option<String>,
    size: usize,
    align: usize,
}

fn blob_name(key: u64, version: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.to_le_bytes());
    hasher.update(version.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn param_to_manifest(spec: &ParamSpec) -> ManifestParam {
    ManifestParam {
        kind: match spec.kind {
            ParamKind::Scalar => "scalar",
            ParamKind::View => "view",
            ParamKind::Struct => "struct",
        }
        .to_string(),
        elem: spec.elem.map(|e| e.name().to_string()),
        size: spec.size,
        align: spec.align,
    }
}

fn param_from_manifest(p: &ManifestParam) -> Option<ParamSpec> {
    let kind = match p.kind.as_str() {
        "scalar" => ParamKind::Scalar,
        "view" => ParamKind::View,
        "struct" => ParamKind::Struct,
        _ => return None,
    };
    let elem = match &p.elem {
        Some(name) => Some(elem_from_name(name)?),
        None => None,
    };
    Some(ParamSpec {
        kind,
        elem,
        size: p.size,
        align: p.align,
    })
}

fn elem_from_name(name: &str) -> Option<ElemType> {
    Some(match name {
        "f32" => ElemType::F32,
        "f64" => ElemType::F64,
        "f16" => ElemType::F16,
        "bf16" => ElemType::BF16,
        "i8" => ElemType::I8,
        "i32" => ElemType::I32,
        "i64" => ElemType::I64,
        "u8" => ElemType::U8,
        "u32" => ElemType::U32,
        "u64" => ElemType::U64,
        _ => return None,
    })
}

/// Write `entries` as a complete snapshot, replacing the manifest.
pub(crate) fn persist_directory(dir: &Path, entries: &[DiskEntry]) -> GpuResult<()> {
    let blobs = dir.join(BLOBS_DIR);
    fs::create_dir_all(&blobs).map_err(persist_error)?;

    let mut manifest = Manifest {
        schema_version: SCHEMA_VERSION,
        entries: Vec::with_capacity(entries.len()),
    };
    for entry in entries {
        let blob = blob_name(entry.key, &entry.version);
        let payload = entry.artifact.payload();
        let bytes = payload.bytes();
        fs::write(blobs.join(&blob), bytes).map_err(persist_error)?;
        manifest.entries.push(ManifestEntry {
            key: entry.key,
            version: entry.version.clone(),
            blob,
            payload_kind: payload.tag().to_string(),
            entry_point: entry.artifact.entry_point().to_string(),
            params: entry
                .artifact
                .layout()
                .slots()
                .iter()
                .map(|s| {
                    param_to_manifest(&ParamSpec {
                        kind: s.kind,
                        elem: s.elem,
                        size: s.size,
                        align: s.align,
                    })
                })
                .collect(),
            size: bytes.len() as u64,
            created_unix: entry.created_unix,
            ttl_secs: entry.ttl.as_secs(),
            access_count: entry.access_count,
            metadata: entry.metadata.clone(),
        });
    }

    let json = serde_json::to_vec_pretty(&manifest).map_err(|e| {
        GpuError::new(ErrorKind::InternalInvariantViolated, e.to_string())
    })?;
    // Write-then-rename so readers never observe a torn manifest.
    let tmp = dir.join(format!("{MANIFEST_FILE}.tmp"));
    fs::write(&tmp, json).map_err(persist_error)?;
    fs::rename(&tmp, dir.join(MANIFEST_FILE)).map_err(persist_error)?;
    Ok(())
}

/// Read whatever is salvageable from `dir`. Unknown schema versions and
/// corrupt entries are skipped with a log line, never an error.
pub(crate) fn load_directory(dir: &Path) -> Vec<DiskEntry> {
    let manifest_path = dir.join(MANIFEST_FILE);
    let raw = match fs::read(&manifest_path) {
        Ok(raw) => raw,
        Err(_) => return Vec::new(),
    };
    let manifest: Manifest = match serde_json::from_slice(&raw) {
        Ok(m) => m,
        Err(e) => {
            log::warn!("ignoring unreadable cache manifest {manifest_path:?}: {e}");
            return Vec::new();
        }
    };
    if manifest.schema_version != SCHEMA_VERSION {
        log::warn!(
            "refusing cache manifest with schema version {} (expected {SCHEMA_VERSION})",
            manifest.schema_version
        );
        return Vec::new();
    }

    let blobs = dir.join(BLOBS_DIR);
    let mut out = Vec::with_capacity(manifest.entries.len());
    for entry in manifest.entries {
        let bytes = match fs::read(blobs.join(&entry.blob)) {
            Ok(b) if b.len() as u64 == entry.size => b,
            Ok(_) => {
                log::warn!("cache blob {} has wrong size; skipping", entry.blob);
                continue;
            }
            Err(e) => {
                log::warn!("cache blob {} unreadable ({e}); skipping", entry.blob);
                continue;
            }
        };
        let Some(payload) = ArtifactPayload::from_parts(&entry.payload_kind, bytes) else {
            log::warn!(
                "cache entry {} has unknown payload kind '{}'; skipping",
                entry.key,
                entry.payload_kind
            );
            continue;
        };
        let Some(specs) = entry
            .params
            .iter()
            .map(param_from_manifest)
            .collect::<Option<Vec<_>>>()
        else {
            log::warn!("cache entry {} has unknown parameter spec; skipping", entry.key);
            continue;
        };
        out.push(DiskEntry {
            key: entry.key,
            version: entry.version,
            ttl: Duration::from_secs(entry.ttl_secs),
            created_unix: entry.created_unix,
            access_count: entry.access_count,
            artifact: KernelArtifact::new(
                entry.entry_point,
                payload,
                ParamLayout::from_specs(&specs),
            ),
            metadata: entry.metadata,
        });
    }
    out
}

fn persist_error(e: std::io::Error) -> GpuError {
    GpuError::new(
        ErrorKind::DriverError { transient: false },
        format!("cache persistence I/O failure: {e}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: u64, version: &str) -> DiskEntry {
        DiskEntry {
            key,
            version: version.to_string(),
            ttl: Duration::from_secs(600),
            created_unix: 1_700_000_000,
            access_count: 3,
            artifact: KernelArtifact::new(
                "saxpy",
                ArtifactPayload::Ptx(".visible .entry saxpy()".to_string()),
                ParamLayout::from_specs(&[
                    ParamSpec::view(ElemType::F32),
                    ParamSpec::scalar(ElemType::U64),
                ]),
            ),
            metadata: BTreeMap::from([("arch".to_string(), "sm_86".to_string())]),
        }
    }

    #[test]
    fn round_trip_preserves_entries() {
        let dir = std::env::temp_dir().join(format!("accel-cache-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        persist_directory(&dir, &[entry(7, "1.2.3")]).unwrap();
        let loaded = load_directory(&dir);
        assert_eq!(loaded.len(), 1);
        let e = &loaded[0];
        assert_eq!(e.key, 7);
        assert_eq!(e.version, "1.2.3");
        assert_eq!(e.access_count, 3);
        assert_eq!(e.artifact.entry_point(), "saxpy");
        assert_eq!(e.artifact.layout().slots().len(), 2);
        assert_eq!(e.metadata.get("arch").map(String::as_str), Some("sm_86"));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn corrupt_manifest_is_ignored() {
        let dir = std::env::temp_dir().join(format!("accel-cache-bad-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(MANIFEST_FILE), b"{ not json").unwrap();
        assert!(load_directory(&dir).is_empty());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn unknown_schema_version_is_refused() {
        let dir = std::env::temp_dir().join(format!("accel-cache-ver-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join(MANIFEST_FILE),
            br#"{"schema_version": 99, "entries": []}"#,
        )
        .unwrap();
        assert!(load_directory(&dir).is_empty());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_blob_skips_only_that_entry() {
        let dir = std::env::temp_dir().join(format!("accel-cache-blob-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        persist_directory(&dir, &[entry(1, "a"), entry(2, "b")]).unwrap();
        fs::remove_file(dir.join(BLOBS_DIR).join(blob_name(1, "a"))).unwrap();
        let loaded = load_directory(&dir);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].key, 2);
        let _ = fs::remove_dir_all(&dir);
    }
}
