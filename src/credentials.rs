use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::PathBuf;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use log::info;
use once_cell::sync::OnceCell;
use huddle::config::config_dir;
use huddle::models::Identity;

/// Cached sign-in identity. The bearer token is stored base64-encoded.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Credentials {
    pub user_id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Credentials {
    pub fn new(identity: &Identity) -> Self {
        Credentials {
            user_id: identity.user_id.clone(),
            display_name: identity.display_name.clone(),
            avatar: identity.avatar.clone(),
            token: identity.token.as_ref().map(|token| BASE64.encode(token)),
        }
    }

    pub fn get_token(&self) -> Option<String> {
        self.token.as_ref().and_then(|encoded| {
            BASE64
                .decode(encoded)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
    }

    pub fn into_identity(self) -> Identity {
        let token = self.get_token();
        Identity {
            user_id: self.user_id,
            display_name: self.display_name,
            avatar: self.avatar,
            token,
        }
    }
}

pub fn save_credentials(credentials: &Credentials) -> Result<()> {
    let path = get_credentials_path()?;
    let file = File::create(&path)?;
    serde_json::to_writer_pretty(file, credentials)?;

    info!("Identity saved for {} at {}", credentials.user_id, path.display());
    Ok(())
}

pub fn load_credentials() -> Result<Option<Credentials>> {
    let path = get_credentials_path()?;

    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(&path)?;
    let credentials: Credentials = serde_json::from_str(&contents)?;
    info!("Loaded identity for {} from {}", credentials.user_id, path.display());

    Ok(Some(credentials))
}

static CREDENTIALS_PATH_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

/// Use `path` instead of `<config dir>/identity.json`. Only the first call wins.
pub fn set_credentials_path(path: PathBuf) {
    let _ = CREDENTIALS_PATH_OVERRIDE.set(path);
}

fn get_credentials_path() -> Result<PathBuf> {
    if let Some(path) = CREDENTIALS_PATH_OVERRIDE.get() {
        return Ok(path.clone());
    }
    Ok(config_dir()?.join("identity.json"))
}
