use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;

use crate::types::{AccountId, deserialize_id};

/// Cookie name → value, as exported from a logged-in browser session.
pub type CookieMap = BTreeMap<String, String>;

const HTTP_ONLY_PREFIX: &str = "#HttpOnly_";

/// Parse a Netscape/Mozilla cookie jar.
///
/// Lines are `domain, include_subdomains, path, secure, expiry, name, value`
/// separated by tabs. Comments are skipped, except `#HttpOnly_` lines which
/// are real cookies with the flag folded into the domain.
pub fn parse_cookie_jar(contents: &str) -> CookieMap {
    let mut cookies = CookieMap::new();
    for line in contents.lines() {
        let line = line.trim_end_matches('\r');
        let line = match line.strip_prefix(HTTP_ONLY_PREFIX) {
            Some(rest) => rest,
            None if line.starts_with('#') || line.trim().is_empty() => continue,
            None => line,
        };
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 7 {
            continue;
        }
        cookies.insert(fields[5].to_string(), fields[6].to_string());
    }
    cookies
}

/// Read one cookie jar from disk.
pub fn load_cookie_file(path: &Path) -> Result<CookieMap> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read cookie file {}", path.display()))?;
    Ok(parse_cookie_jar(&contents))
}

/// Turn configured credential sources into cookie files.
///
/// Files are taken as-is; directories contribute their `*.txt` entries in
/// name order. Duplicates are dropped.
pub fn expand_sources(sources: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for source in sources {
        if source.is_dir() {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(source)
                .with_context(|| format!("failed to list {}", source.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "txt"))
                .collect();
            entries.sort();
            files.extend(entries);
        } else {
            files.push(source.clone());
        }
    }
    let mut seen = std::collections::HashSet::new();
    files.retain(|p| seen.insert(p.clone()));
    Ok(files)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TwilightUser {
    auth_token: Option<String>,
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    id: Option<u64>,
    login: Option<String>,
}

fn deserialize_optional_id<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    deserialize_id(deserializer).map(Some)
}

/// Identity of a logged-in account, extracted from its browser cookies.
#[derive(Clone)]
pub struct Session {
    pub user_id: AccountId,
    pub login: String,
    pub auth_token: String,
    /// `unique_id` cookie; sent as the device id header.
    pub device_id: Option<String>,
    pub cookies: CookieMap,
    pub source: PathBuf,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("login", &self.login)
            .field("auth_token", &"<redacted>")
            .field("device_id", &self.device_id)
            .field("source", &self.source)
            .finish()
    }
}

impl Session {
    /// Resolve token, id, and login from the `twilight-user`, `login` and
    /// `unique_id` cookies.
    pub fn from_cookies(cookies: CookieMap, source: impl Into<PathBuf>) -> Result<Self> {
        let source = source.into();
        let raw = cookies
            .get("twilight-user")
            .ok_or_else(|| anyhow!("{}: missing twilight-user cookie", source.display()))?;
        let decoded = urlencoding::decode(raw)
            .with_context(|| format!("{}: twilight-user is not URL-encoded", source.display()))?;
        let user: TwilightUser = serde_json::from_str(&decoded)
            .with_context(|| format!("{}: twilight-user is not valid JSON", source.display()))?;

        let auth_token = user
            .auth_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| anyhow!("{}: twilight-user has no authToken", source.display()))?;
        let user_id = user
            .id
            .map(AccountId)
            .ok_or_else(|| anyhow!("{}: twilight-user has no id", source.display()))?;
        let login = cookies
            .get("login")
            .cloned()
            .or(user.login)
            .ok_or_else(|| anyhow!("{}: no login cookie", source.display()))?;
        let device_id = cookies.get("unique_id").cloned();

        Ok(Self {
            user_id,
            login,
            auth_token,
            device_id,
            cookies,
            source,
        })
    }

    /// Load and resolve one cookie file.
    pub fn load(path: &Path) -> Result<Self> {
        let cookies = load_cookie_file(path)?;
        Self::from_cookies(cookies, path)
    }

    /// `Cookie` request header carrying the whole jar.
    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}
