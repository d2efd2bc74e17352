use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct State {
    pub last_host: Option<String>,
    pub default_key_path: Option<PathBuf>,
}

fn config_path() -> PathBuf {
    if let Some(dir) = dirs_next::config_dir() {
        return dir.join("adbtun").join("state.json");
    }
    PathBuf::from(".adbtun_state.json")
}

pub fn load_state() -> State {
    load_state_from(&config_path())
}

pub fn save_state(state: &State) -> Result<()> {
    save_state_to(&config_path(), state)
}

fn load_state_from(path: &Path) -> State {
    if let Ok(bytes) = fs::read(path) {
        if let Ok(state) = serde_json::from_slice::<State>(&bytes) {
            return state;
        }
    }
    State::default()
}

fn save_state_to(path: &Path, state: &State) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).ok();
    }
    let bytes = serde_json::to_vec_pretty(state)?;
    fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))
}
