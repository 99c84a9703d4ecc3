use std::{fs, path::Path};

use anyhow::{Context, Result};
use tracing::info;

use crate::{
    cli::ServerArgs,
    crypto::{self, KeyPair},
    error::RelayResult,
};

/// Process-wide server settings, built once at startup and read-only afterwards.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    keypair: KeyPair,
    public_key_text: String,
}

impl RelayConfig {
    pub fn new(keypair: KeyPair) -> RelayResult<Self> {
        let public_key_text = crypto::encode_public_key(keypair.public_key())?;
        Ok(Self {
            keypair,
            public_key_text,
        })
    }

    pub fn generate(bits: usize) -> RelayResult<Self> {
        Self::new(crypto::generate_keypair(bits)?)
    }

    /// Loads a base64 PKCS#8 private key from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read private key {}", path.display()))?;
        let private_key = crypto::decode_private_key(&text)
            .with_context(|| format!("failed to parse private key {}", path.display()))?;
        Ok(Self::new(KeyPair::from_private_key(private_key))?)
    }

    /// Writes the private key to `path` in the format [`RelayConfig::load`] reads.
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = crypto::encode_private_key(self.keypair.private_key())?;
        fs::write(path, format!("{}\n", text.as_str()))
            .with_context(|| format!("failed to write private key {}", path.display()))
    }

    pub fn from_args(args: &ServerArgs) -> Result<Self> {
        match &args.private_key {
            Some(path) => {
                let config = Self::load(path)?;
                info!(path = %path.display(), bits = config.keypair.bits(), "loaded RSA keypair");
                Ok(config)
            }
            None => {
                info!(bits = args.rsa_bits, "generating RSA keypair");
                Ok(Self::generate(args.rsa_bits)?)
            }
        }
    }

    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    /// The line sent to every peer as the first handshake step.
    pub fn public_key_text(&self) -> &str {
        &self.public_key_text
    }
}

#[cfg(test)]
mod tests {
    use tempfile::{tempdir, NamedTempFile};

    use super::*;

    #[test]
    fn loads_a_persisted_private_key() -> Result<()> {
        let generated = RelayConfig::generate(1024)?;
        let text = crypto::encode_private_key(generated.keypair().private_key())?;

        let file = NamedTempFile::new()?;
        fs::write(file.path(), format!("{}\n", text.as_str()))?;

        let loaded = RelayConfig::load(file.path())?;
        assert_eq!(loaded.public_key_text(), generated.public_key_text());
        Ok(())
    }

    #[test]
    fn saved_keys_load_back() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("relay.key");

        let generated = RelayConfig::generate(1024)?;
        generated.save(&path)?;

        let loaded = RelayConfig::load(&path)?;
        assert_eq!(loaded.public_key_text(), generated.public_key_text());
        assert_eq!(loaded.keypair().bits(), 1024);
        Ok(())
    }

    #[test]
    fn missing_key_file_is_reported() -> Result<()> {
        let dir = tempdir()?;
        let err = RelayConfig::load(&dir.path().join("absent.key"))
            .expect_err("loading a missing file should fail");
        assert!(err.to_string().contains("failed to read private key"));
        Ok(())
    }
}
