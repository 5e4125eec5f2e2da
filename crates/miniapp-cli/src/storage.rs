use std::path::PathBuf;

use color_eyre::Result;
use dirs::cache_dir;
#[cfg(test)]
use miniapp_storage::InMemoryKeyProvider;
use miniapp_storage::{DatabaseDriverFactory, EncryptedFileDriverFactory, KeyringProvider};
use miniapp_securestorage::StorageRegistry;
use tracing::debug;

use crate::config::Config;

const KEYRING_SERVICE: &str = "miniapp-sdk";
const KEYRING_ACCOUNT: &str = "securestorage";

/// Resolve the default storage root (platform cache dir).
pub fn default_data_dir() -> Result<PathBuf> {
    let base = cache_dir().ok_or_else(|| color_eyre::eyre::eyre!("no cache dir available"))?;
    Ok(base.join("miniapp").join("securestorage"))
}

fn data_root(config: &Config) -> Result<PathBuf> {
    match &config.data_dir {
        Some(root) => Ok(root.clone()),
        None => default_data_dir(),
    }
}

fn keyring() -> KeyringProvider {
    KeyringProvider::new(KEYRING_SERVICE, KEYRING_ACCOUNT)
}

/// Registry over AES-GCM encrypted files, keyed by the OS keychain.
pub fn file_registry(
    config: &Config,
) -> Result<StorageRegistry<EncryptedFileDriverFactory<KeyringProvider>>> {
    let root = data_root(config)?;
    debug!(?root, "initializing encrypted file storage");
    Ok(StorageRegistry::new(
        EncryptedFileDriverFactory::new(root, keyring()),
        config.storage_options(),
    ))
}

/// Registry over per-mini-app redb databases, keyed by the OS keychain.
pub fn database_registry(
    config: &Config,
) -> Result<StorageRegistry<DatabaseDriverFactory<KeyringProvider>>> {
    let root = data_root(config)?;
    debug!(?root, "initializing database storage");
    Ok(StorageRegistry::new(
        DatabaseDriverFactory::new(root, keyring()),
        config.storage_options(),
    ))
}

/// Helper for tests to build a registry rooted at a temp dir with an in-memory key.
#[cfg(test)]
pub fn test_registry(
    root: impl Into<PathBuf>,
) -> StorageRegistry<EncryptedFileDriverFactory<InMemoryKeyProvider>> {
    StorageRegistry::new(
        EncryptedFileDriverFactory::new(root, InMemoryKeyProvider::default()),
        Default::default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_data_dir_overrides_default() {
        let config = Config {
            data_dir: Some(PathBuf::from("/tmp/miniapp-root")),
            ..Config::default()
        };
        let registry = file_registry(&config).expect("registry");
        assert_eq!(
            registry.factory().layout().root(),
            std::path::Path::new("/tmp/miniapp-root")
        );
    }

    #[test]
    fn quota_comes_from_config() {
        let config = Config {
            data_dir: Some(PathBuf::from("/tmp/miniapp-root")),
            max_size_bytes: Some(4096),
            ..Config::default()
        };
        let registry = database_registry(&config).expect("registry");
        assert_eq!(registry.options().max_size_bytes, 4096);
    }
}
