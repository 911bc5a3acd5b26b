use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use clap::Args;

use common::crypto::SecretKey;

/// Write a fresh keypair: the secret as PEM, the public key as hex in `<path>.pub`
#[derive(Args, Debug, Clone)]
pub struct Keygen {
    /// Where to write the secret key
    pub path: PathBuf,

    /// Overwrite existing key files
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum KeygenError {
    #[error("{0} already exists, pass --force to overwrite")]
    Exists(String),
    #[error("failed to write key: {0}")]
    Io(#[from] std::io::Error),
}

pub fn public_key_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".pub");
    PathBuf::from(name)
}

/// Generate and store a keypair, returning the public key hex
pub fn write_key_pair(path: &Path, force: bool) -> Result<String, KeygenError> {
    let public_path = public_key_path(path);
    if !force {
        for existing in [path, public_path.as_path()] {
            if existing.exists() {
                return Err(KeygenError::Exists(existing.display().to_string()));
            }
        }
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let secret = SecretKey::generate();
    let public = secret.public().to_hex();
    fs::write(path, secret.to_pem())?;
    fs::write(&public_path, format!("{}\n", public))?;
    Ok(public)
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Keygen {
    type Error = KeygenError;
    type Output = String;

    async fn execute(&self, _ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let public = write_key_pair(&self.path, self.force)?;
        Ok(format!(
            "Wrote {} and {}\n{}",
            self.path.display(),
            public_key_path(&self.path).display(),
            public
        ))
    }
}
