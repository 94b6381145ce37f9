use anyhow::{Context, Result};
use backup_tool::{
    BackupClient, Catalog, ClientSettings, CryptoKey, DirectoryBackupOptions, LocalObjectStore,
    ObjectTransport,
    config::{self, BackupCommand, Command, DirectoryCommand, FileCommand, ObjectCommand},
};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // --- Parse config + command ---
    let (cfg, command) = config::AppConfig::from_env_and_args()?;
    tracing::debug!("Starting backup-tool with config: {:?}", cfg);

    // --- Load the key up front so a bad key fails before any work ---
    let key = if command.needs_key() {
        let path = cfg.require_key_file()?;
        Some(
            CryptoKey::from_file(path)
                .await
                .with_context(|| format!("loading crypto key from {}", path.display()))?,
        )
    } else {
        None
    };

    // --- Initialize catalog + store ---
    let catalog = Catalog::open(cfg.database_file.as_deref())
        .await
        .context("opening catalog")?;
    let store = LocalObjectStore::new(cfg.store_dir.clone());

    let settings = ClientSettings {
        namespace: cfg.namespace.clone(),
        bucket: cfg.bucket.clone(),
        relative_root: cfg.relative_path.clone(),
        work_dir: cfg.work_directory.clone(),
        cache_file: cfg.cache_file.clone(),
        key,
    };
    let client = BackupClient::new(settings, catalog, store).await?;

    run(&client, command).await
}

async fn run(client: &BackupClient<LocalObjectStore>, command: Command) -> Result<()> {
    match command {
        Command::File(FileCommand::List) => print_json(&client.file_list().await?),
        Command::File(FileCommand::Duplicates) => {
            // JSON object keys must be strings; the "no backup" group is "null".
            let groups: BTreeMap<String, _> = client
                .file_duplicates()
                .await?
                .into_iter()
                .map(|(blob, entries)| {
                    let key = blob.map_or_else(|| "null".to_string(), |id| id.to_string());
                    (key, entries)
                })
                .collect();
            print_json(&groups)
        }
        Command::File(FileCommand::Cleanup(opts)) => {
            print_json(&client.file_cleanup(opts.dry_run).await?)
        }
        Command::File(FileCommand::Backup { path, flags }) => {
            let uploaded = client
                .backup_file(&path, flags.overwrite, flags.check_uploaded_md5)
                .await?;
            print_json(&uploaded)
        }
        Command::File(FileCommand::Restore {
            id,
            overwrite,
            set_restore,
        }) => print_json(&client.restore_file(id, overwrite, set_restore).await?),
        Command::File(FileCommand::Md5 { path }) => print_json(&client.file_md5(&path).await?),
        Command::File(FileCommand::Encrypt { input, output }) => {
            let summary = client.file_encrypt(&input, &output).await?;
            print_json(&serde_json::json!({
                "original_digest": summary.original_digest,
                "encrypted_digest": summary.encrypted_digest,
            }))
        }
        Command::File(FileCommand::Decrypt { input, output }) => {
            let summary = client.file_decrypt(&input, &output).await?;
            print_json(&serde_json::json!({
                "encrypted_digest": summary.encrypted_digest,
                "decrypted_digest": summary.decrypted_digest,
            }))
        }
        Command::Backup(BackupCommand::List) => print_json(&client.backup_list().await?),
        Command::Backup(BackupCommand::Cleanup(opts)) => {
            print_json(&client.backup_cleanup(opts.dry_run).await?)
        }
        Command::Directory(DirectoryCommand::Backup {
            dirs,
            flags,
            skip_files,
        }) => {
            let options = DirectoryBackupOptions {
                overwrite: flags.overwrite,
                force_checksum: flags.check_uploaded_md5,
                skip_patterns: skip_files,
            };
            print_json(&client.directory_backup(&dirs, &options).await?)
        }
        Command::Object(ObjectCommand::List) => print_json(&client.object_list().await?),
        Command::Object(ObjectCommand::Put {
            namespace,
            bucket,
            object,
            file,
        }) => {
            let md5 = client.file_md5(&file).await?;
            client
                .transport()
                .put(&namespace, &bucket, &object, &file, &md5)
                .await
                .with_context(|| format!("uploading {} as {object}", file.display()))?;
            print_json(&serde_json::json!({ "object": object, "md5": md5 }))
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
