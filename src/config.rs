//! On-disk configuration store.
//!
//! Layout: `~/.ssh-command-tool3` (mode 0700) holding `config.json`
//! (mode 0600) and `.salt` (16 bytes, mode 0600). Passwords rest encrypted;
//! they are decrypted on load and re-encrypted on save, so the in-memory
//! descriptors always carry usable secrets.

use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use outpost_core_types::{
    AuthMethod, BrowserSettings, ConnectionDescriptor, ConnectionId, PortForwardDefaults,
};

use crate::secrets::{self, SecretCipher};

pub const CONFIG_DIR_NAME: &str = ".ssh-command-tool3";
const CONFIG_FILE: &str = "config.json";
const SALT_FILE: &str = ".salt";
const CONFIG_VERSION: u32 = 3;

#[derive(Clone, Debug, Error)]
pub enum ConfigError {
    #[error("config i/o failed: {0}")]
    Io(String),

    #[error("config file is invalid: {0}")]
    Invalid(String),

    #[error("field `{0}` is invalid")]
    Validation(&'static str),

    #[error("connection `{0}` not found")]
    NotFound(String),
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::Io(_) => "config/io",
            ConfigError::Invalid(_) => "config/invalid",
            ConfigError::Validation(_) => "validation",
            ConfigError::NotFound(_) => "not-found",
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    version: u32,
    connections: Vec<ConnectionDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_connection_id: Option<String>,
    #[serde(default)]
    browser_settings: BrowserSettings,
    #[serde(default)]
    port_forward_defaults: PortForwardDefaults,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            connections: Vec::new(),
            last_connection_id: None,
            browser_settings: BrowserSettings::default(),
            port_forward_defaults: PortForwardDefaults::default(),
        }
    }
}

/// Partial update applied by `PUT /api/connections/:id`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionPatch {
    pub name: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub key_path: Option<String>,
    pub passphrase: Option<String>,
}

pub struct ConfigStore {
    dir: PathBuf,
    file: PathBuf,
    cipher: SecretCipher,
    data: RwLock<ConfigFile>,
}

impl ConfigStore {
    /// Open (or initialize) the store under `dir`, defaulting to
    /// `~/.ssh-command-tool3`.
    pub fn open(dir: Option<PathBuf>) -> ConfigResult<Self> {
        let dir = match dir {
            Some(dir) => dir,
            None => PathBuf::from(shellexpand::tilde(&format!("~/{CONFIG_DIR_NAME}")).into_owned()),
        };
        std::fs::create_dir_all(&dir).map_err(|err| ConfigError::Io(err.to_string()))?;
        set_mode(&dir, 0o700)?;

        let salt_path = dir.join(SALT_FILE);
        let salt = if salt_path.exists() {
            std::fs::read(&salt_path).map_err(|err| ConfigError::Io(err.to_string()))?
        } else {
            let salt = secrets::generate_salt().to_vec();
            std::fs::write(&salt_path, &salt).map_err(|err| ConfigError::Io(err.to_string()))?;
            set_mode(&salt_path, 0o600)?;
            salt
        };
        let cipher = SecretCipher::new(&salt);

        let file = dir.join(CONFIG_FILE);
        let mut data = if file.exists() {
            let raw =
                std::fs::read_to_string(&file).map_err(|err| ConfigError::Io(err.to_string()))?;
            serde_json::from_str(&raw).map_err(|err| ConfigError::Invalid(err.to_string()))?
        } else {
            ConfigFile::default()
        };

        for descriptor in &mut data.connections {
            if let AuthMethod::Password { password } = &mut descriptor.auth {
                if secrets::is_encrypted(password) {
                    *password = cipher
                        .decrypt(password)
                        .map_err(|err| ConfigError::Invalid(err.to_string()))?;
                }
            }
        }

        debug!(dir = %dir.display(), connections = data.connections.len(), "config loaded");
        Ok(Self {
            dir,
            file,
            cipher,
            data: RwLock::new(data),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist the current state, passwords encrypted.
    pub fn save(&self) -> ConfigResult<()> {
        let mut on_disk = self.data.read().clone();
        for descriptor in &mut on_disk.connections {
            if let AuthMethod::Password { password } = &mut descriptor.auth {
                *password = self
                    .cipher
                    .encrypt(password)
                    .map_err(|err| ConfigError::Io(err.to_string()))?;
            }
        }

        let rendered = serde_json::to_string_pretty(&on_disk)
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        std::fs::write(&self.file, rendered).map_err(|err| ConfigError::Io(err.to_string()))?;
        set_mode(&self.file, 0o600)?;
        debug!("config saved");
        Ok(())
    }

    pub fn list(&self) -> Vec<ConnectionDescriptor> {
        self.data.read().connections.clone()
    }

    pub fn get(&self, id: &ConnectionId) -> ConfigResult<ConnectionDescriptor> {
        self.data
            .read()
            .connections
            .iter()
            .find(|descriptor| &descriptor.id == id)
            .cloned()
            .ok_or_else(|| ConfigError::NotFound(id.to_string()))
    }

    /// Resolve by id first, then by name.
    pub fn resolve(&self, reference: &str) -> ConfigResult<ConnectionDescriptor> {
        let data = self.data.read();
        data.connections
            .iter()
            .find(|descriptor| descriptor.id.0 == reference || descriptor.name == reference)
            .cloned()
            .ok_or_else(|| ConfigError::NotFound(reference.to_string()))
    }

    pub fn add(&self, mut descriptor: ConnectionDescriptor) -> ConfigResult<ConnectionId> {
        validate(&descriptor)?;
        descriptor.id = ConnectionId::new();
        let id = descriptor.id.clone();
        self.data.write().connections.push(descriptor);
        self.save()?;
        info!(connection = %id, "connection added");
        Ok(id)
    }

    pub fn update(&self, id: &ConnectionId, patch: ConnectionPatch) -> ConfigResult<()> {
        {
            let mut data = self.data.write();
            let descriptor = data
                .connections
                .iter_mut()
                .find(|descriptor| &descriptor.id == id)
                .ok_or_else(|| ConfigError::NotFound(id.to_string()))?;
            apply_patch(descriptor, patch);
            validate(descriptor)?;
        }
        self.save()
    }

    pub fn remove(&self, id: &ConnectionId) -> ConfigResult<()> {
        {
            let mut data = self.data.write();
            let before = data.connections.len();
            data.connections.retain(|descriptor| &descriptor.id != id);
            if data.connections.len() == before {
                return Err(ConfigError::NotFound(id.to_string()));
            }
            if data.last_connection_id.as_deref() == Some(id.0.as_str()) {
                data.last_connection_id = None;
            }
        }
        self.save()
    }

    pub fn set_last_connection_id(&self, id: &ConnectionId) -> ConfigResult<()> {
        self.data.write().last_connection_id = Some(id.0.clone());
        self.save()
    }

    pub fn last_connection_id(&self) -> Option<String> {
        self.data.read().last_connection_id.clone()
    }

    pub fn browser_settings(&self) -> BrowserSettings {
        self.data.read().browser_settings.clone()
    }

    pub fn set_browser_settings(&self, settings: BrowserSettings) -> ConfigResult<()> {
        self.data.write().browser_settings = settings;
        self.save()
    }

    pub fn port_forward_defaults(&self) -> PortForwardDefaults {
        self.data.read().port_forward_defaults.clone()
    }

    pub fn set_port_forward_defaults(&self, defaults: PortForwardDefaults) -> ConfigResult<()> {
        self.data.write().port_forward_defaults = defaults;
        self.save()
    }
}

fn validate(descriptor: &ConnectionDescriptor) -> ConfigResult<()> {
    if descriptor.name.trim().is_empty() {
        return Err(ConfigError::Validation("name"));
    }
    if descriptor.host.trim().is_empty() {
        return Err(ConfigError::Validation("host"));
    }
    if descriptor.port == 0 {
        return Err(ConfigError::Validation("port"));
    }
    if descriptor.username.trim().is_empty() {
        return Err(ConfigError::Validation("username"));
    }
    match &descriptor.auth {
        AuthMethod::Password { password } if password.is_empty() => {
            Err(ConfigError::Validation("password"))
        }
        AuthMethod::PrivateKey { key_path, .. } if key_path.trim().is_empty() => {
            Err(ConfigError::Validation("keyPath"))
        }
        _ => Ok(()),
    }
}

fn apply_patch(descriptor: &mut ConnectionDescriptor, patch: ConnectionPatch) {
    if let Some(name) = patch.name {
        descriptor.name = name;
    }
    if let Some(host) = patch.host {
        descriptor.host = host;
    }
    if let Some(port) = patch.port {
        descriptor.port = port;
    }
    if let Some(username) = patch.username {
        descriptor.username = username;
    }
    // a supplied secret switches the auth kind with it
    if let Some(password) = patch.password {
        descriptor.auth = AuthMethod::Password { password };
    } else if let Some(key_path) = patch.key_path {
        descriptor.auth = AuthMethod::PrivateKey {
            key_path,
            passphrase: patch.passphrase,
        };
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> ConfigResult<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|err| ConfigError::Io(err.to_string()))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> ConfigResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ConfigStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(Some(dir.path().join("cfg"))).unwrap();
        (dir, store)
    }

    fn descriptor(name: &str) -> ConnectionDescriptor {
        ConnectionDescriptor {
            id: ConnectionId::new(),
            name: name.into(),
            host: "h".into(),
            port: 22,
            username: "u".into(),
            auth: AuthMethod::Password {
                password: "s3cret".into(),
            },
        }
    }

    #[test]
    fn add_get_update_remove_round_trip() {
        let (_tmp, store) = store();
        let id = store.add(descriptor("dev")).unwrap();
        assert_eq!(store.get(&id).unwrap().name, "dev");

        store
            .update(
                &id,
                ConnectionPatch {
                    host: Some("other".into()),
                    ..ConnectionPatch::default()
                },
            )
            .unwrap();
        assert_eq!(store.get(&id).unwrap().host, "other");

        store.remove(&id).unwrap();
        assert!(matches!(store.get(&id), Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn validation_rejects_empty_fields() {
        let (_tmp, store) = store();
        let mut bad = descriptor("dev");
        bad.host = String::new();
        let err = store.add(bad).unwrap_err();
        assert!(matches!(err, ConfigError::Validation("host")));
        assert_eq!(err.code(), "validation");
    }

    #[test]
    fn passwords_rest_encrypted_but_load_decrypted() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cfg");

        let store = ConfigStore::open(Some(path.clone())).unwrap();
        store.add(descriptor("dev")).unwrap();
        drop(store);

        let raw = std::fs::read_to_string(path.join("config.json")).unwrap();
        assert!(!raw.contains("s3cret"), "plaintext password on disk");

        let reloaded = ConfigStore::open(Some(path)).unwrap();
        match &reloaded.list()[0].auth {
            AuthMethod::Password { password } => assert_eq!(password, "s3cret"),
            other => panic!("unexpected auth: {other:?}"),
        }
    }

    #[test]
    fn patching_key_path_switches_auth_kind() {
        let (_tmp, store) = store();
        let id = store.add(descriptor("dev")).unwrap();
        store
            .update(
                &id,
                ConnectionPatch {
                    key_path: Some("~/.ssh/id_rsa".into()),
                    ..ConnectionPatch::default()
                },
            )
            .unwrap();
        assert!(matches!(
            store.get(&id).unwrap().auth,
            AuthMethod::PrivateKey { .. }
        ));
    }

    #[test]
    fn last_connection_id_clears_with_its_connection() {
        let (_tmp, store) = store();
        let id = store.add(descriptor("dev")).unwrap();
        store.set_last_connection_id(&id).unwrap();
        assert_eq!(store.last_connection_id(), Some(id.0.clone()));

        store.remove(&id).unwrap();
        assert!(store.last_connection_id().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn on_disk_modes_are_restrictive() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cfg");
        let store = ConfigStore::open(Some(path.clone())).unwrap();
        store.save().unwrap();

        let dir_mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        let file_mode = std::fs::metadata(path.join("config.json"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
        assert_eq!(file_mode, 0o600);
    }
}
