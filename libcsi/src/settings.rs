//! Mount settings resolution.
//!
//! [`resolve`] turns a publish request's secrets, volume context and
//! capability-derived flags into an immutable [`MountSettings`].  Two
//! settings that differ only in their sub-path share one mount session; the
//! equivalence class is captured by [`SessionKey`].
//!
//! Nothing here performs I/O.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CsiError;
use crate::types::{VolumeCapability, VolumeId};

/// Comma-separated mount options merged into the effective option list.
pub const CTX_MOUNT_OPTIONS: &str = "mountOptions";
/// Directory inside the session used as the volume root.
pub const CTX_SUB_PATH: &str = "subPath";
/// Requested capacity in bytes; its presence enables the quota step.
pub const CTX_CAPACITY: &str = "capacity";
/// Name of a cluster secret holding filesystem credentials.
pub const CTX_SECRET_NAME: &str = "secretName";
/// Namespace of [`CTX_SECRET_NAME`], `default` when absent.
pub const CTX_SECRET_NAMESPACE: &str = "secretNamespace";

const SECRET_FS_NAME: &str = "name";
const SECRET_METAURL: &str = "metaurl";
const SUBDIR_OPTION: &str = "subdir";
const READ_ONLY_OPTION: &str = "ro";

/// Identity of a mount session: everything in [`MountSettings`] except the
/// sub-path, folded into a stable, path-safe string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolved configuration for mounting one volume.
#[derive(Clone, PartialEq, Eq)]
pub struct MountSettings {
    /// Name of the distributed filesystem.
    pub filesystem_name: String,
    /// Metadata source the mount process connects to.
    pub source: String,
    /// Remaining secret entries as sorted `key=value` pairs.
    pub backend_options: Vec<String>,
    /// Session-relative directory used as this volume's root.
    pub sub_path: String,
    /// Effective mount options, in precedence order.
    pub options: Vec<String>,
}

impl MountSettings {
    /// Key of the session these settings can share.
    pub fn session_key(&self) -> SessionKey {
        let mut hasher = Sha256::new();
        hasher.update(self.filesystem_name.as_bytes());
        hasher.update([0]);
        hasher.update(self.source.as_bytes());
        for opt in &self.backend_options {
            hasher.update([1]);
            hasher.update(opt.as_bytes());
        }
        for opt in &self.options {
            hasher.update([2]);
            hasher.update(opt.as_bytes());
        }
        let digest = hex::encode(hasher.finalize());
        SessionKey(format!("{}-{}", self.filesystem_name, &digest[..16]))
    }

    /// Whether the effective options mount the filesystem read-only.
    pub fn is_read_only(&self) -> bool {
        parse_mount_options(&self.options).contains_key(READ_ONLY_OPTION)
    }

    /// Filesystem-absolute path the quota is applied to: the `subdir` mount
    /// option (if any) followed by the sub-path.
    pub fn quota_path(&self) -> Result<String, CsiError> {
        let mut parts = Vec::new();
        if let Some(Some(subdir)) = parse_mount_options(&self.options).get(SUBDIR_OPTION) {
            parts.push(normalize_sub_path(subdir)?);
        }
        parts.push(self.sub_path.clone());
        let joined = parts
            .into_iter()
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        Ok(format!("/{joined}"))
    }

    /// Backend options as environment variables for the mount process,
    /// e.g. `access-key=...` becomes `ACCESS_KEY`.
    pub fn backend_env(&self) -> Vec<(String, String)> {
        self.backend_options
            .iter()
            .filter_map(|o| o.split_once('='))
            .map(|(k, v)| (k.to_uppercase().replace(['-', '.'], "_"), v.to_owned()))
            .collect()
    }
}

impl fmt::Debug for MountSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let backend_keys: Vec<&str> = self
            .backend_options
            .iter()
            .map(|o| o.split_once('=').map_or(o.as_str(), |(k, _)| k))
            .collect();
        f.debug_struct("MountSettings")
            .field("filesystem_name", &self.filesystem_name)
            .field("backend_options", &backend_keys)
            .field("sub_path", &self.sub_path)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Parse `key=value` / bare-flag options into a map. Later entries win.
pub fn parse_mount_options(options: &[String]) -> BTreeMap<String, Option<String>> {
    let mut parsed = BTreeMap::new();
    for opt in options {
        let opt = opt.trim();
        if opt.is_empty() {
            continue;
        }
        match opt.split_once('=') {
            Some((k, v)) => parsed.insert(k.trim().to_owned(), Some(v.trim().to_owned())),
            None => parsed.insert(opt.to_owned(), None),
        };
    }
    parsed
}

fn split_options(raw: &str) -> impl Iterator<Item = String> + '_ {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

/// Effective mount options: volume-context options, then capability-derived
/// options (`ro`, capability flags), then caller flags. Duplicates are kept.
pub fn effective_mount_options(
    volume_context: &HashMap<String, String>,
    capability: &VolumeCapability,
    read_only: bool,
    caller_flags: &[String],
) -> Vec<String> {
    let mut options: Vec<String> = volume_context
        .get(CTX_MOUNT_OPTIONS)
        .map(|raw| split_options(raw).collect())
        .unwrap_or_default();
    if read_only || capability.is_read_only_mode() {
        options.push(READ_ONLY_OPTION.to_owned());
    }
    options.extend(
        capability
            .mount_flags()
            .iter()
            .chain(caller_flags)
            .map(|f| f.trim())
            .filter(|f| !f.is_empty())
            .map(str::to_owned),
    );
    options
}

/// Parse the `capacity` context value, falling back to `capacity_bytes`
/// from the request.
pub fn requested_capacity(
    volume_context: &HashMap<String, String>,
    capacity_bytes: Option<i64>,
) -> Result<Option<u64>, CsiError> {
    let Some(raw) = volume_context.get(CTX_CAPACITY) else {
        return capacity_bytes
            .map(|bytes| {
                u64::try_from(bytes).map_err(|_| {
                    CsiError::InvalidArgument(format!("invalid capacity_bytes {bytes}"))
                })
            })
            .transpose();
    };
    raw.trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|e| CsiError::InvalidArgument(format!("invalid capacity {raw:?}: {e}")))
}

/// Normalize a session-relative path: no leading or trailing `/`, no `.`
/// segments, `..` rejected.
pub fn normalize_sub_path(raw: &str) -> Result<String, CsiError> {
    let mut segments = Vec::new();
    for seg in raw.trim().split('/') {
        match seg {
            "" | "." => continue,
            ".." => {
                return Err(CsiError::InvalidArgument(format!(
                    "sub path {raw:?} escapes the filesystem root"
                )));
            }
            s => segments.push(s),
        }
    }
    Ok(segments.join("/"))
}

/// Resolve mount settings for `volume_id`.
pub fn resolve(
    volume_id: &VolumeId,
    secrets: &HashMap<String, String>,
    volume_context: &HashMap<String, String>,
    options: &[String],
) -> Result<MountSettings, CsiError> {
    let required = |key: &str| {
        secrets
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
            .ok_or_else(|| CsiError::InvalidArgument(format!("secret {key:?} not provided")))
    };
    let filesystem_name = required(SECRET_FS_NAME)?;
    // The name prefixes the session directory under the mount root.
    if filesystem_name.contains(['/', '\0']) || filesystem_name == "." || filesystem_name == ".." {
        return Err(CsiError::InvalidArgument(format!(
            "filesystem name {filesystem_name:?} is not a single path component"
        )));
    }
    let source = required(SECRET_METAURL)?;

    let backend_options = secrets
        .iter()
        .filter(|(k, _)| k.as_str() != SECRET_FS_NAME && k.as_str() != SECRET_METAURL)
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect::<BTreeMap<_, _>>()
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();

    let sub_path = match volume_context.get(CTX_SUB_PATH) {
        Some(p) => normalize_sub_path(p)?,
        None => normalize_sub_path(volume_id.as_str())?,
    };

    Ok(MountSettings {
        filesystem_name,
        source,
        backend_options,
        sub_path,
        options: options
            .iter()
            .map(|o| o.trim())
            .filter(|o| !o.is_empty())
            .map(str::to_owned)
            .collect(),
    })
}
