use anyhow::{Context, Result, bail};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::{env, path::PathBuf};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_file: Option<PathBuf>,
    pub crypto_key_file: Option<PathBuf>,
    pub relative_path: Option<PathBuf>,
    pub namespace: String,
    pub bucket: String,
    pub work_directory: PathBuf,
    pub cache_file: Option<PathBuf>,
    pub store_dir: PathBuf,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Deduplicating, encrypting file backup")]
pub struct Args {
    /// Catalog database file; in-memory when unset (overrides BACKUP_TOOL_DATABASE_FILE)
    #[arg(long, global = true)]
    pub database_file: Option<PathBuf>,

    /// File holding the encryption key (overrides BACKUP_TOOL_CRYPTO_KEY_FILE)
    #[arg(long, global = true)]
    pub crypto_key_file: Option<PathBuf>,

    /// Directory stripped from stored paths (overrides BACKUP_TOOL_RELATIVE_PATH)
    #[arg(long, global = true)]
    pub relative_path: Option<PathBuf>,

    /// Object store namespace (overrides BACKUP_TOOL_NAMESPACE)
    #[arg(long, global = true)]
    pub namespace: Option<String>,

    /// Object store bucket (overrides BACKUP_TOOL_BUCKET)
    #[arg(long, global = true)]
    pub bucket_name: Option<String>,

    /// Scratch directory for encrypted copies (overrides BACKUP_TOOL_WORK_DIR)
    #[arg(long, global = true)]
    pub work_directory: Option<PathBuf>,

    /// Pending-upload cache file (overrides BACKUP_TOOL_CACHE_FILE)
    #[arg(long, global = true)]
    pub cache_file: Option<PathBuf>,

    /// Root directory of the local object store (overrides BACKUP_TOOL_STORE_DIR)
    #[arg(long, global = true)]
    pub store_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Tracked local files
    #[command(subcommand)]
    File(FileCommand),

    /// Uploaded backup blobs
    #[command(subcommand)]
    Backup(BackupCommand),

    /// Whole directory trees
    #[command(subcommand)]
    Directory(DirectoryCommand),

    /// Raw objects in the store
    #[command(subcommand)]
    Object(ObjectCommand),
}

#[derive(Subcommand, Debug, Clone)]
pub enum FileCommand {
    /// List tracked files
    List,
    /// Group tracked files that share a backup
    Duplicates,
    /// Forget files that no longer exist
    Cleanup(DryRun),
    /// Back up one file
    Backup {
        path: PathBuf,
        #[command(flatten)]
        flags: BackupFlags,
    },
    /// Restore a tracked file by id
    Restore {
        id: i64,
        /// Download even if the local copy already matches
        #[arg(long)]
        overwrite: bool,
        /// Request a restore of archived objects
        #[arg(long)]
        set_restore: bool,
    },
    /// Print a file's digest
    Md5 { path: PathBuf },
    /// Encrypt a file locally
    Encrypt { input: PathBuf, output: PathBuf },
    /// Decrypt a file locally
    Decrypt { input: PathBuf, output: PathBuf },
}

#[derive(Subcommand, Debug, Clone)]
pub enum BackupCommand {
    /// List uploaded blobs
    List,
    /// Delete blobs no file refers to
    Cleanup(DryRun),
}

#[derive(Subcommand, Debug, Clone)]
pub enum DirectoryCommand {
    /// Back up every file below the given directories
    Backup {
        #[arg(required = true)]
        dirs: Vec<PathBuf>,
        #[command(flatten)]
        flags: BackupFlags,
        /// Regex of paths to leave out, matched from the start of the path
        #[arg(long = "skip-files", num_args = 1..)]
        skip_files: Vec<String>,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ObjectCommand {
    /// List objects in the configured bucket
    List,
    /// Upload a file as-is under the given object key
    Put {
        namespace: String,
        bucket: String,
        object: String,
        file: PathBuf,
    },
}

#[derive(ClapArgs, Debug, Clone, Copy)]
pub struct DryRun {
    /// Report what would be removed without removing anything
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(ClapArgs, Debug, Clone, Copy)]
pub struct BackupFlags {
    /// Replace the backup of files whose content changed
    #[arg(long)]
    pub overwrite: bool,
    /// Hash files even when their size and mtime are unchanged
    #[arg(long)]
    pub check_uploaded_md5: bool,
}

fn env_path(name: &str) -> Result<Option<PathBuf>> {
    match env::var(name) {
        Ok(value) if value.is_empty() => Ok(None),
        Ok(value) => Ok(Some(PathBuf::from(value))),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

fn env_string(name: &str, default: &str) -> Result<String> {
    match env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        Ok(_) | Err(env::VarError::NotPresent) => Ok(default.to_string()),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the command.
    pub fn from_env_and_args() -> Result<(Self, Command)> {
        // Parse CLI once
        let args = Args::parse();
        let command = args.command.clone();
        Ok((Self::merge(args)?, command))
    }

    /// Layer CLI values over environment values over defaults.
    pub fn merge(args: Args) -> Result<Self> {
        // --- Environment fallback ---
        let env_db = env_path("BACKUP_TOOL_DATABASE_FILE")?;
        let env_key = env_path("BACKUP_TOOL_CRYPTO_KEY_FILE")?;
        let env_relative = env_path("BACKUP_TOOL_RELATIVE_PATH")?;
        let env_namespace = env_string("BACKUP_TOOL_NAMESPACE", "default")?;
        let env_bucket = env_string("BACKUP_TOOL_BUCKET", "backups")?;
        let env_work = env_path("BACKUP_TOOL_WORK_DIR")?
            .unwrap_or_else(|| env::temp_dir().join("backup-tool"));
        let env_cache = env_path("BACKUP_TOOL_CACHE_FILE")?;
        let env_store =
            env_path("BACKUP_TOOL_STORE_DIR")?.unwrap_or_else(|| PathBuf::from("./data/objects"));

        // --- Merge ---
        Ok(Self {
            database_file: args.database_file.or(env_db),
            crypto_key_file: args.crypto_key_file.or(env_key),
            relative_path: args.relative_path.or(env_relative),
            namespace: args.namespace.unwrap_or(env_namespace),
            bucket: args.bucket_name.unwrap_or(env_bucket),
            work_directory: args.work_directory.unwrap_or(env_work),
            cache_file: args.cache_file.or(env_cache),
            store_dir: args.store_dir.unwrap_or(env_store),
        })
    }

    /// The key file, or a configuration error if none was given.
    pub fn require_key_file(&self) -> Result<&PathBuf> {
        match &self.crypto_key_file {
            Some(path) => Ok(path),
            None => bail!(
                "no crypto key configured: pass --crypto-key-file or set BACKUP_TOOL_CRYPTO_KEY_FILE"
            ),
        }
    }
}

impl Command {
    /// Whether the command encrypts or decrypts and therefore needs a key.
    pub fn needs_key(&self) -> bool {
        matches!(
            self,
            Command::File(
                FileCommand::Backup { .. }
                    | FileCommand::Restore { .. }
                    | FileCommand::Encrypt { .. }
                    | FileCommand::Decrypt { .. }
            ) | Command::Directory(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_values_win_over_defaults() {
        let args = Args::parse_from([
            "backup-tool",
            "--namespace",
            "archive",
            "--bucket-name",
            "photos",
            "--work-directory",
            "/tmp/work",
            "file",
            "list",
        ]);
        let cfg = AppConfig::merge(args).unwrap();
        assert_eq!(cfg.namespace, "archive");
        assert_eq!(cfg.bucket, "photos");
        assert_eq!(cfg.work_directory, PathBuf::from("/tmp/work"));
    }

    #[test]
    fn parses_nested_subcommands() {
        let args = Args::parse_from([
            "backup-tool",
            "directory",
            "backup",
            "/a",
            "/b",
            "--overwrite",
            "--skip-files",
            ".*\\.tmp",
        ]);
        match args.command {
            Command::Directory(DirectoryCommand::Backup { dirs, flags, skip_files }) => {
                assert_eq!(dirs, [PathBuf::from("/a"), PathBuf::from("/b")]);
                assert!(flags.overwrite);
                assert!(!flags.check_uploaded_md5);
                assert_eq!(skip_files, [".*\\.tmp"]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn key_requirement_by_command() {
        let needs = |argv: &[&str]| Args::parse_from(argv).command.needs_key();
        assert!(needs(&["backup-tool", "file", "backup", "/x"]));
        assert!(needs(&["backup-tool", "file", "restore", "3", "--set-restore"]));
        assert!(!needs(&["backup-tool", "file", "list"]));
        assert!(!needs(&["backup-tool", "backup", "cleanup", "--dry-run"]));
        assert!(!needs(&["backup-tool", "object", "list"]));
        assert!(!needs(&["backup-tool", "object", "put", "ns", "b", "k", "/x"]));
    }

    #[test]
    fn parses_object_put() {
        let args = Args::parse_from(["backup-tool", "object", "put", "ns", "bucket", "a/b", "/tmp/f"]);
        match args.command {
            Command::Object(ObjectCommand::Put {
                namespace,
                bucket,
                object,
                file,
            }) => {
                assert_eq!(namespace, "ns");
                assert_eq!(bucket, "bucket");
                assert_eq!(object, "a/b");
                assert_eq!(file, PathBuf::from("/tmp/f"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
