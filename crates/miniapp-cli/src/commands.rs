use std::io::Write;

use color_eyre::Result;
use miniapp_core::{DriverFactory, SecureStorageError, StorageIdentity};
use miniapp_securestorage::StorageRegistry;
use tracing::info;

use crate::cli::Command;

const HEALTH_PROBE_ID: &str = "__miniapp_health__";

/// Execute a storage subcommand against `registry`, writing human output to `out`.
pub async fn handle<F, W>(cmd: &Command, registry: &StorageRegistry<F>, out: &mut W) -> Result<()>
where
    F: DriverFactory,
    W: Write,
{
    match cmd {
        Command::Get { app, key } => {
            let storage = registry.storage(&StorageIdentity::new(app.as_str())?)?;
            storage.load().await?;
            match storage.get(key)? {
                Some(value) => writeln!(out, "{value}")?,
                None => writeln!(out, "(not set)")?,
            }
        }
        Command::Set { app, entries } => {
            let storage = registry.storage(&StorageIdentity::new(app.as_str())?)?;
            storage.load().await?;
            storage.set(entries.iter().cloned())?.await?;
            writeln!(out, "Stored {} entries for {app}", entries.len())?;
        }
        Command::Remove { app, keys } => {
            let storage = registry.storage(&StorageIdentity::new(app.as_str())?)?;
            storage.load().await?;
            storage.remove(keys)?.await?;
            writeln!(out, "Removed {} keys from {app}", keys.len())?;
        }
        Command::Size { app } => {
            let storage = registry.storage(&StorageIdentity::new(app.as_str())?)?;
            let report = storage.size().await?;
            writeln!(
                out,
                "{app}: {} of {} bytes used",
                report.used_bytes, report.max_bytes
            )?;
        }
        Command::Dump { app } => {
            let storage = registry.storage(&StorageIdentity::new(app.as_str())?)?;
            match storage.export().await {
                Ok(record) if record.is_empty() => writeln!(out, "{app} has no entries")?,
                Ok(record) => {
                    for (key, value) in record {
                        writeln!(out, "{key}={value}")?;
                    }
                }
                Err(SecureStorageError::Empty { .. }) => {
                    writeln!(out, "No secure storage persisted for {app}")?
                }
                Err(err) => return Err(err.into()),
            }
        }
        Command::Clear { app } => {
            let storage = registry.storage(&StorageIdentity::new(app.as_str())?)?;
            storage.clear().await?;
            storage.unload();
            writeln!(out, "Cleared secure storage for {app}")?;
        }
        Command::List => {
            let identities = registry.identities()?;
            if identities.is_empty() {
                writeln!(out, "No mini-app storage found.")?;
            }
            for identity in identities {
                writeln!(out, "{identity}")?;
            }
        }
        Command::Wipe { app } => {
            registry.wipe(&StorageIdentity::new(app.as_str())?).await?;
            writeln!(out, "Wiped secure storage for {app}")?;
        }
        Command::WipeAll => {
            let report = registry.wipe_all().await;
            writeln!(out, "Wiped {} mini-app stores", report.wiped.len())?;
            for (identity, err) in &report.failed {
                writeln!(out, "  failed: {identity}: {err}")?;
            }
            if !report.is_complete() {
                color_eyre::eyre::bail!("{} stores could not be wiped", report.failed.len());
            }
        }
        Command::Health => {
            run_health(registry).await?;
            writeln!(out, "Storage: ok")?;
        }
        Command::Version | Command::Config(_) => {
            color_eyre::eyre::bail!("not a storage command: {cmd:?}")
        }
    }
    Ok(())
}

/// Write/read/wipe round trip through a throwaway identity.
pub async fn run_health<F: DriverFactory>(registry: &StorageRegistry<F>) -> Result<()> {
    let identity = StorageIdentity::new(HEALTH_PROBE_ID)?;
    let storage = registry.storage(&identity)?;
    storage.load().await?;
    storage.set([("probe", "ok")])?.await?;
    let round_trip = storage.get("probe")?;
    registry.wipe(&identity).await?;

    if round_trip.as_deref() != Some("ok") {
        color_eyre::eyre::bail!("storage round-trip failed");
    }
    info!("storage health check passed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use miniapp_core::InMemoryDriverFactory;

    use super::*;
    use crate::storage;

    async fn run<F: DriverFactory>(cmd: Command, registry: &StorageRegistry<F>) -> String {
        let mut out = Vec::new();
        handle(&cmd, registry, &mut out).await.expect("command");
        String::from_utf8(out).expect("utf8")
    }

    #[tokio::test]
    async fn health_check_with_test_registry_succeeds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = storage::test_registry(dir.path());
        run_health(&registry).await.expect("health check should succeed");
        assert!(registry.identities().expect("identities").is_empty());
    }

    #[tokio::test]
    async fn set_get_remove_through_commands() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = storage::test_registry(dir.path());

        let out = run(
            Command::Set {
                app: "app-1".into(),
                entries: vec![("a".into(), "1".into()), ("b".into(), "2".into())],
            },
            &registry,
        )
        .await;
        assert_eq!(out, "Stored 2 entries for app-1\n");

        let out = run(
            Command::Get {
                app: "app-1".into(),
                key: "a".into(),
            },
            &registry,
        )
        .await;
        assert_eq!(out, "1\n");

        run(
            Command::Remove {
                app: "app-1".into(),
                keys: vec!["a".into()],
            },
            &registry,
        )
        .await;
        let out = run(Command::Dump { app: "app-1".into() }, &registry).await;
        assert_eq!(out, "b=2\n");
    }

    #[tokio::test]
    async fn list_and_wipe_all() {
        let registry = StorageRegistry::new(InMemoryDriverFactory::new(), Default::default());
        assert_eq!(run(Command::List, &registry).await, "No mini-app storage found.\n");

        for app in ["x", "y"] {
            run(
                Command::Set {
                    app: app.into(),
                    entries: vec![("k".into(), "v".into())],
                },
                &registry,
            )
            .await;
        }
        assert_eq!(run(Command::List, &registry).await, "x\ny\n");

        let out = run(Command::WipeAll, &registry).await;
        assert_eq!(out, "Wiped 2 mini-app stores\n");
        assert_eq!(run(Command::List, &registry).await, "No mini-app storage found.\n");
    }

    #[tokio::test]
    async fn dump_reports_unpersisted_store() {
        let registry = StorageRegistry::new(InMemoryDriverFactory::new(), Default::default());
        let out = run(Command::Dump { app: "nobody".into() }, &registry).await;
        assert_eq!(out, "No secure storage persisted for nobody\n");
    }

    #[tokio::test]
    async fn size_and_clear() {
        let registry = StorageRegistry::new(InMemoryDriverFactory::new(), Default::default());
        let out = run(Command::Size { app: "app".into() }, &registry).await;
        assert_eq!(out, "app: 0 of 2000000 bytes used\n");

        run(
            Command::Set {
                app: "app".into(),
                entries: vec![("k".into(), "v".into())],
            },
            &registry,
        )
        .await;
        run(Command::Clear { app: "app".into() }, &registry).await;
        let out = run(Command::Size { app: "app".into() }, &registry).await;
        assert_eq!(out, "app: 0 of 2000000 bytes used\n");
    }

    #[tokio::test]
    async fn quota_errors_surface_to_the_caller() {
        let registry = StorageRegistry::new(
            InMemoryDriverFactory::new(),
            miniapp_core::StorageOptions { max_size_bytes: 8 },
        );
        let mut out = Vec::new();
        let err = handle(
            &Command::Set {
                app: "app".into(),
                entries: vec![("key".into(), "value".into())],
            },
            &registry,
            &mut out,
        )
        .await
        .expect_err("over quota");
        assert!(err.to_string().contains("quota exceeded"));
    }
}
