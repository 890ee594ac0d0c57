//! Title metadata from `sce_sys/param.json`.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use serde_json::Value;
use snafu::{ResultExt, whatever};
use tracing::debug;

use crate::cache::{CacheRecord, StateCache};
use crate::error::{IoResultExt, MetadataParseSnafu, Result};

const PREFERRED_LANGUAGE: &str = "en-US";

/// Identity of an application folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleIdentity {
    pub title_id: String,
    pub title_name: String,
}

/// Cheap change detector for a metadata file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub mtime: i64,
    pub mtime_nsec: i64,
    pub size: u64,
    pub inode: u64,
}

impl Fingerprint {
    pub fn of(path: &Path) -> Option<Self> {
        let meta = fs::metadata(path).ok()?;
        Some(Self {
            mtime: meta.mtime(),
            mtime_nsec: meta.mtime_nsec(),
            size: meta.size(),
            inode: meta.ino(),
        })
    }
}

/// Path-keyed cache payload: the parsed identity and the fingerprint it was
/// parsed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMemo {
    pub fingerprint: Fingerprint,
    pub identity: TitleIdentity,
}

/// Path records stay alive while the path exists.
pub fn path_is_live<P>(record: &CacheRecord<P>) -> bool {
    Path::new(record.key()).exists()
}

/// `<dir>/sce_sys/param.json`
pub fn param_path(dir: &Path) -> PathBuf {
    dir.join("sce_sys").join("param.json")
}

/// Source of title identities.
pub trait MetadataReader {
    /// Reads the identity of the application folder `dir`.
    fn read_identity(&self, dir: &Path) -> Option<TitleIdentity>;

    /// Fingerprint of the metadata backing [`Self::read_identity`].
    fn fingerprint(&self, dir: &Path) -> Option<Fingerprint> {
        Fingerprint::of(&param_path(dir))
    }
}

/// Reads `sce_sys/param.json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParamJsonReader;

impl MetadataReader for ParamJsonReader {
    fn read_identity(&self, dir: &Path) -> Option<TitleIdentity> {
        let path = param_path(dir);
        match parse_param_file(&path) {
            Ok(identity) => Some(identity),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "no usable title metadata");
                None
            }
        }
    }
}

pub fn parse_param_file(path: &Path) -> Result<TitleIdentity> {
    let content = fs::read(path).metadata_read_context(path)?;
    let json: Value = serde_json::from_slice(&content).context(MetadataParseSnafu { path })?;
    match parse_param(&json) {
        Some(identity) => Ok(identity),
        None => whatever!("{} has no title id", path.display()),
    }
}

/// Extracts the title id (`titleId`, then `title_id`) and the display name,
/// preferring the `en-US` localized name and falling back to the id.
pub fn parse_param(json: &Value) -> Option<TitleIdentity> {
    let non_empty = |v: &Value| {
        v.as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let title_id = ["titleId", "title_id"]
        .iter()
        .find_map(|key| json.get(key).and_then(non_empty))?;

    let localized = json.get("localizedParameters");
    let title_name = localized
        .and_then(|l| l.get(PREFERRED_LANGUAGE))
        .and_then(|l| l.get("titleName"))
        .and_then(non_empty)
        .or_else(|| json.get("titleName").and_then(non_empty))
        .or_else(|| {
            localized.and_then(Value::as_object).and_then(|langs| {
                langs
                    .values()
                    .find_map(|l| l.get("titleName").and_then(non_empty))
            })
        })
        .unwrap_or_else(|| title_id.clone());

    Some(TitleIdentity {
        title_id,
        title_name,
    })
}

/// Returns the identity of `dir`, reparsing only when its fingerprint changed.
pub fn cached_identity(
    reader: &dyn MetadataReader,
    cache: &mut StateCache<PathMemo>,
    dir: &Path,
) -> Option<TitleIdentity> {
    let fingerprint = reader.fingerprint(dir)?;
    let key = dir.to_string_lossy();

    let memo = cache.find(&key).and_then(|r| r.payload.as_ref());
    if let Some(memo) = memo.filter(|m| m.fingerprint == fingerprint) {
        return Some(memo.identity.clone());
    }

    let identity = reader.read_identity(dir)?;
    cache.get_or_create(&key).payload = Some(PathMemo {
        fingerprint,
        identity: identity.clone(),
    });
    Some(identity)
}
