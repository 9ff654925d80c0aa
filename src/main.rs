use anyhow::{Context, Result};
use snapshot_store::{
    ObjectInfo, Operation, SnapshotError, SnapshotStore, StorageService, Verifier,
    config::{AppConfig, Command},
    create_sample_database, verify_digest,
};
use std::path::Path;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // --- Parse config + command ---
    let (cfg, command) = AppConfig::from_env_and_args()?;
    tracing::debug!("Starting snapshot-store with config: {:?}", cfg);

    // `verify` without a digest check only needs the local file.
    if let Command::Verify {
        path,
        query,
        expect,
        check_digest: false,
    } = &command
    {
        return verify_local(path, query, *expect).await;
    }

    // --- Connect to the object store and bind the snapshot name ---
    let service = StorageService::connect(&cfg.storage())
        .await
        .map_err(|source| SnapshotError::Connection {
            op: Operation::Open,
            source,
        })
        .context("connecting to object store")?;
    let store = SnapshotStore::new(service, &cfg.bucket, &cfg.name)
        .await
        .context("creating snapshot store")?;

    match command {
        Command::Store { path } => {
            let info = store.store(&path).await?;
            println!("Database stored: Size={} bytes, ModTime={}", info.size, info.modified);
        }
        Command::Retrieve { path } => {
            let info = store.retrieve(&path).await?;
            println!("Database retrieved to {} ({} bytes)", path.display(), info.size);
        }
        Command::Info { json } => {
            let info = store.info().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                print_info(&info);
            }
        }
        Command::Delete => {
            store.delete().await?;
            println!("Deleted {}/{}", store.bucket(), store.name());
        }
        Command::Verify {
            path,
            query,
            expect,
            ..
        } => {
            let info = store.info().await?;
            verify_digest(&path, &info).await?;
            println!("Digest matches stored snapshot ({})", info.digest);
            verify_local(&path, &query, expect).await?;
        }
        Command::Demo { work_dir, cleanup } => run_demo(&store, &work_dir, cleanup).await?,
    }

    Ok(())
}

async fn verify_local(path: &Path, query: &str, expect: Option<i64>) -> Result<()> {
    let mut verifier = Verifier::new(query);
    if let Some(value) = expect {
        verifier = verifier.expecting(value);
    }
    let report = verifier.verify(path).await?;
    println!("Database verified: {} returned {}", report.query, report.value);
    Ok(())
}

fn print_info(info: &ObjectInfo) {
    println!("Bucket:      {}", info.bucket);
    println!("Name:        {}", info.name);
    println!("Size:        {} bytes", info.size);
    println!("ModTime:     {}", info.modified);
    println!("Digest:      {}", info.digest);
    if let Some(description) = &info.description {
        println!("Description: {}", description);
    }
    for (name, value) in &info.headers {
        println!("{}: {}", name, value);
    }
}

/// Full round trip: sample database → store → info → retrieve → verify.
async fn run_demo(
    store: &SnapshotStore<StorageService>,
    work_dir: &Path,
    cleanup: bool,
) -> Result<()> {
    let db_path = work_dir.join(store.name());
    let retrieved_path = work_dir.join(retrieved_name(store.name()));

    println!("Creating sample database...");
    create_sample_database(&db_path)
        .await
        .context("creating sample database")?;

    println!("Storing database...");
    store.store(&db_path).await?;

    let info = store.info().await?;
    println!("Database stored: Size={} bytes, ModTime={}", info.size, info.modified);

    println!("Retrieving database...");
    store.retrieve(&retrieved_path).await?;

    println!("Verifying retrieved database...");
    verify_digest(&retrieved_path, &info).await?;
    let report = Verifier::default().expecting(3).verify(&retrieved_path).await?;
    println!("Database verified: found {} users", report.value);

    if cleanup {
        store.delete().await?;
        match store.info().await {
            Err(err) if err.is_not_found() => println!("Snapshot deleted"),
            Err(err) => return Err(err.into()),
            Ok(_) => anyhow::bail!("snapshot still present after delete"),
        }
    }

    println!("Operation completed successfully!");
    Ok(())
}

/// `mydb.db` → `mydb_retrieved.db`
fn retrieved_name(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}_retrieved.{}", stem, ext),
        _ => format!("{}_retrieved", name),
    }
}
