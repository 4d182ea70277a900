/**
 * PERSISTANCE - Table des hôtes et table des échantillons en JSON
 *
 * FICHIERS (dans data_dir) :
 * - hosts.json   : [Host]   réécrit à chaque enregistrement / changement d'adresse
 * - samples.json : [Sample] triés par (host_id, timestamp), snapshot périodique + arrêt
 *
 * Écriture atomique : fichier temporaire puis rename, un crash ne laisse jamais
 * un fichier à moitié écrit.
 */

use crate::models::{Host, Sample};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct StateFiles {
    root: PathBuf,
}

impl StateFiles {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn hosts_path(&self) -> PathBuf {
        self.root.join("hosts.json")
    }

    pub fn samples_path(&self) -> PathBuf {
        self.root.join("samples.json")
    }

    pub async fn load_hosts(&self) -> Result<Vec<Host>, PersistError> {
        load_json(&self.hosts_path()).await
    }

    pub async fn save_hosts(&self, hosts: &[Host]) -> Result<(), PersistError> {
        save_json(&self.hosts_path(), hosts).await
    }

    pub async fn load_samples(&self) -> Result<Vec<Sample>, PersistError> {
        load_json(&self.samples_path()).await
    }

    pub async fn save_samples(&self, samples: &[Sample]) -> Result<(), PersistError> {
        save_json(&self.samples_path(), samples).await
    }
}

/// Fichier absent = table vide
async fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, PersistError> {
    if !fs::try_exists(path).await? {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path).await?;
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(&content)?)
}

async fn save_json<T: Serialize>(path: &Path, rows: &[T]) -> Result<(), PersistError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let content = serde_json::to_vec_pretty(rows)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}
