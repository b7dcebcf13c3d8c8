//! On-disk OAuth token cache
//!
//! One JSON file per server under the token directory, holding the current
//! tokens and the OAuth client registration used to obtain them:
//!
//! ```json
//! { "tokens": { "access_token": "...", "expires_at": "..." }, "client_info": { "client_id": "..." } }
//! ```
//!
//! Files are written with user-only permissions. A file that cannot be read or
//! parsed is treated as an empty cache entry.

use crate::auth::oauth::OAuthTokenResponse;
use crate::error::{AgentError, Result};
use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Custom serde module for Secret<String>
mod secret_string {
    use secrecy::{ExposeSecret, Secret};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(secret: &Secret<String>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(secret.expose_secret())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Secret<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Secret::new(s))
    }
}

/// Custom serde module for Option<Secret<String>>
mod option_secret_string {
    use secrecy::{ExposeSecret, Secret};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(secret: &Option<Secret<String>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match secret {
            Some(s) => serializer.serialize_some(s.expose_secret()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Secret<String>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt = Option::<String>::deserialize(deserializer)?;
        Ok(opt.map(Secret::new))
    }
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// A credential for one downstream server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    #[serde(with = "secret_string")]
    pub access_token: Secret<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, with = "option_secret_string", skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<Secret<String>>,
    /// `None` means the credential does not expire
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl Credential {
    /// Credential for servers that need no authorization
    pub fn empty() -> Self {
        Self {
            access_token: Secret::new(String::new()),
            token_type: String::new(),
            refresh_token: None,
            expires_at: None,
            scope: None,
        }
    }

    /// Credential carrying a fixed header value
    pub fn from_static(value: Secret<String>) -> Self {
        Self {
            access_token: value,
            token_type: String::new(),
            refresh_token: None,
            expires_at: None,
            scope: None,
        }
    }

    /// Build a credential from a token endpoint response.
    ///
    /// When the response does not rotate the refresh token, `previous_refresh` is kept.
    pub fn from_token_response(
        response: OAuthTokenResponse,
        previous_refresh: Option<Secret<String>>,
        now: DateTime<Utc>,
    ) -> Self {
        let expires_at = response
            .expires_in
            .and_then(|secs| i64::try_from(secs).ok())
            .map(|secs| now + Duration::seconds(secs));
        Self {
            access_token: response.access_token,
            token_type: response.token_type,
            refresh_token: response.refresh_token.or(previous_refresh),
            expires_at,
            scope: response.scope,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.access_token.expose_secret().is_empty()
    }

    /// True while `now < expires_at - skew`
    pub fn is_usable_at(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        if self.is_empty() {
            return false;
        }
        match self.expires_at {
            Some(expires_at) => now < expires_at - skew,
            None => true,
        }
    }
}

/// OAuth client registration persisted next to the tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRegistration {
    pub client_id: String,
    #[serde(default, with = "option_secret_string", skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<Secret<String>>,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    /// Token endpoint discovered when the client was registered; used for refresh
    #[serde(default)]
    pub token_endpoint: Option<String>,
}

const TOKENS_KEY: &str = "tokens";
const CLIENT_INFO_KEY: &str = "client_info";

/// File-backed token cache keyed by server name
#[derive(Debug, Clone)]
pub struct FileTokenStorage {
    dir: PathBuf,
}

impl FileTokenStorage {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the cache file for a server. Names that need sanitizing get a
    /// digest suffix so two distinct names never share a file.
    pub fn path_for(&self, server_name: &str) -> PathBuf {
        let sanitized: String = server_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let stem = sanitized.trim_start_matches('.');
        if stem == server_name {
            return self.dir.join(format!("{}.json", stem));
        }
        let digest = Sha256::digest(server_name.as_bytes());
        let suffix: String = digest[..4].iter().map(|b| format!("{:02x}", b)).collect();
        self.dir.join(format!("{}-{}.json", stem, suffix))
    }

    fn read(&self, server_name: &str) -> Map<String, Value> {
        let path = self.path_for(server_name);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(_) => return Map::new(),
        };
        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                warn!("Ignoring unreadable token cache file {}", path.display());
                Map::new()
            }
        }
    }

    fn write(&self, server_name: &str, data: &Map<String, Value>) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(server_name);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(data)?;
        {
            let mut file = open_private(&tmp)?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        restrict_permissions(&path)?;
        debug!("Wrote token cache {}", path.display());
        Ok(())
    }

    fn load_field<T: for<'de> Deserialize<'de>>(&self, server_name: &str, key: &str) -> Option<T> {
        let value = self.read(server_name).remove(key)?;
        match serde_json::from_value(value) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!("Ignoring malformed '{}' entry for '{}': {}", key, server_name, e);
                None
            }
        }
    }

    fn store_field<T: Serialize>(&self, server_name: &str, key: &str, value: &T) -> Result<()> {
        let mut data = self.read(server_name);
        data.insert(key.to_string(), serde_json::to_value(value)?);
        self.write(server_name, &data)
    }

    pub fn load_tokens(&self, server_name: &str) -> Option<Credential> {
        self.load_field(server_name, TOKENS_KEY)
    }

    pub fn save_tokens(&self, server_name: &str, credential: &Credential) -> Result<()> {
        self.store_field(server_name, TOKENS_KEY, credential)
    }

    pub fn load_client_info(&self, server_name: &str) -> Option<ClientRegistration> {
        self.load_field(server_name, CLIENT_INFO_KEY)
    }

    pub fn save_client_info(&self, server_name: &str, client: &ClientRegistration) -> Result<()> {
        self.store_field(server_name, CLIENT_INFO_KEY, client)
    }

    /// Delete the whole cache entry. Returns whether a file existed.
    pub fn clear(&self, server_name: &str) -> Result<bool> {
        let path = self.path_for(server_name);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Removed token cache {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(AgentError::Io(e)),
        }
    }

    /// Cache file stems, sorted. A stem equals the server name unless the name needed sanitizing.
    pub fn list_cached(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AgentError::Io(e)),
        };
        let mut names = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn credential(token: &str, expires_at: Option<DateTime<Utc>>) -> Credential {
        Credential {
            access_token: Secret::new(token.to_string()),
            token_type: "Bearer".to_string(),
            refresh_token: Some(Secret::new("refresh-1".to_string())),
            expires_at,
            scope: Some("read".to_string()),
        }
    }

    #[test]
    fn test_save_and_load_tokens() {
        let dir = TempDir::new().unwrap();
        let storage = FileTokenStorage::new(dir.path());
        assert!(storage.load_tokens("github").is_none());

        let expires = Utc::now() + Duration::hours(1);
        storage
            .save_tokens("github", &credential("access-1", Some(expires)))
            .unwrap();

        let loaded = storage.load_tokens("github").unwrap();
        assert_eq!(loaded.access_token.expose_secret(), "access-1");
        assert_eq!(
            loaded.refresh_token.as_ref().map(|t| t.expose_secret().as_str()),
            Some("refresh-1")
        );
        assert_eq!(loaded.expires_at, Some(expires));
    }

    #[test]
    fn test_tokens_and_client_info_coexist() {
        let dir = TempDir::new().unwrap();
        let storage = FileTokenStorage::new(dir.path());
        storage
            .save_client_info(
                "github",
                &ClientRegistration {
                    client_id: "client-abc".to_string(),
                    client_secret: None,
                    redirect_uris: vec!["http://127.0.0.1:1234/callback".to_string()],
                    token_endpoint: Some("https://auth.test/token".to_string()),
                },
            )
            .unwrap();
        storage
            .save_tokens("github", &credential("access-1", None))
            .unwrap();

        assert_eq!(storage.load_client_info("github").unwrap().client_id, "client-abc");
        assert!(storage.load_tokens("github").is_some());
    }

    #[test]
    fn test_corrupted_file_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let storage = FileTokenStorage::new(dir.path());
        fs::write(storage.path_for("broken"), "{not json").unwrap();
        assert!(storage.load_tokens("broken").is_none());
        assert!(storage.load_client_info("broken").is_none());
    }

    #[test]
    fn test_malformed_tokens_entry_keeps_client_info() {
        let dir = TempDir::new().unwrap();
        let storage = FileTokenStorage::new(dir.path());
        fs::write(
            storage.path_for("partial"),
            r#"{"tokens": {"nope": 1}, "client_info": {"client_id": "cid"}}"#,
        )
        .unwrap();
        assert!(storage.load_tokens("partial").is_none());
        assert_eq!(storage.load_client_info("partial").unwrap().client_id, "cid");
    }

    #[cfg(unix)]
    #[test]
    fn test_file_permissions_are_user_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let storage = FileTokenStorage::new(dir.path().join("nested"));
        storage
            .save_tokens("github", &credential("access-1", None))
            .unwrap();
        let mode = fs::metadata(storage.path_for("github"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_clear_and_list() {
        let dir = TempDir::new().unwrap();
        let storage = FileTokenStorage::new(dir.path());
        assert!(storage.list_cached().unwrap().is_empty());

        storage.save_tokens("b", &credential("t", None)).unwrap();
        storage.save_tokens("a", &credential("t", None)).unwrap();
        assert_eq!(storage.list_cached().unwrap(), vec!["a", "b"]);

        assert!(storage.clear("a").unwrap());
        assert!(!storage.clear("a").unwrap());
        assert_eq!(storage.list_cached().unwrap(), vec!["b"]);
    }

    #[test]
    fn test_path_sanitizes_separators() {
        let storage = FileTokenStorage::new("/tmp/tokens");
        assert_eq!(
            storage.path_for("github"),
            PathBuf::from("/tmp/tokens/github.json")
        );

        let path = storage.path_for("../etc/passwd");
        assert_eq!(path.parent(), Some(Path::new("/tmp/tokens")));
        let file_name = path.file_name().unwrap().to_str().unwrap();
        assert!(file_name.starts_with("_etc_passwd-"));
        assert!(file_name.ends_with(".json"));
    }

    #[test]
    fn test_sanitized_names_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileTokenStorage::new(dir.path());
        assert_ne!(storage.path_for("my server"), storage.path_for("my_server"));
        assert_ne!(storage.path_for("a/b"), storage.path_for("a:b"));

        storage.save_tokens("my server", &credential("spaced", None)).unwrap();
        assert!(storage.load_tokens("my_server").is_none());
        assert_eq!(
            storage.load_tokens("my server").unwrap().access_token.expose_secret(),
            "spaced"
        );
    }

    #[test]
    fn test_usability_respects_skew() {
        let now = Utc::now();
        let skew = Duration::seconds(60);
        assert!(credential("t", None).is_usable_at(now, skew));
        assert!(credential("t", Some(now + Duration::minutes(10))).is_usable_at(now, skew));
        assert!(!credential("t", Some(now + Duration::seconds(30))).is_usable_at(now, skew));
        assert!(!credential("t", Some(now - Duration::minutes(1))).is_usable_at(now, skew));
        assert!(!Credential::empty().is_usable_at(now, skew));
    }
}
