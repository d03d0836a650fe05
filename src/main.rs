//! zine - publish JSON content and its images to a GitHub branch

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use zine::ops::{publish_document, LogProgress, NoProgress, Progress};
use zine::remote::{GithubStore, MemoryStore, ObjectStore};
use zine::types::extension_of;
use zine::{digest_file, Config, Document, Error, IoResultExt, PendingAsset};

#[derive(Parser)]
#[command(name = "zine")]
#[command(about = "publish JSON content and its images to a GitHub branch in one commit")]
#[command(version)]
struct Cli {
    /// config file path
    #[arg(short, long, default_value = "zine.toml")]
    config: PathBuf,

    /// log debug output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// publish a document and its assets as one commit
    Publish {
        /// document profile name from the config
        #[arg(short, long)]
        document: String,

        /// local JSON file holding the full record array
        #[arg(short, long)]
        file: PathBuf,

        /// pending asset as KEY=PATH, KEY being the record value it belongs to
        #[arg(short, long = "asset")]
        assets: Vec<String>,

        /// commit message
        #[arg(short, long)]
        message: Option<String>,

        /// access token
        #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// run against an empty in-memory branch and print the plan
        #[arg(long)]
        dry_run: bool,
    },

    /// print content digests and target file names
    Hash {
        /// files or directories to hash
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// show the commit the publish branch points at
    ShowRef {
        /// access token
        #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },

    /// write a starting config file
    InitConfig {
        /// where to write the config
        path: PathBuf,

        /// repository owner
        #[arg(long, default_value = "owner")]
        owner: String,

        /// repository name
        #[arg(long, default_value = "site")]
        repo: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("error: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "zine=debug" } else { "zine=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> zine::Result<()> {
    match cli.command {
        Commands::Publish {
            document,
            file,
            assets,
            message,
            token,
            dry_run,
        } => {
            let config = Config::load(&cli.config)?;
            let profile = config.document(&document)?;

            let doc = load_document(&profile.path, &file)?;
            let pending = assets
                .iter()
                .map(|spec| parse_asset(spec))
                .collect::<zine::Result<Vec<_>>>()?;
            debug!(records = doc.len(), assets = pending.len(), "loaded changes");

            let binding = config.binding_for(profile);
            let options = config.publish_options(message.as_deref());

            let store: Box<dyn ObjectStore> = if dry_run {
                Box::new(MemoryStore::with_ref(&config.remote.branch_ref())?)
            } else {
                Box::new(GithubStore::new(&config.remote, token.unwrap_or_default())?)
            };
            let progress: &dyn Progress = if dry_run { &NoProgress } else { &LogProgress };

            let report = publish_document(store.as_ref(), doc, pending, binding, &options, progress)?;

            for object in &report.uploaded {
                println!("{} {}", object.sha.short(), object.path);
            }
            if dry_run {
                for doc in &report.documents {
                    println!("--- {}", doc.path());
                    println!("{}", doc.to_canonical_string()?);
                }
                println!("dry run: {} asset(s) would be published", report.uploaded.len());
            } else {
                println!("{}", report.commit);
            }
        }

        Commands::Hash { paths } => {
            for root in &paths {
                for entry in WalkDir::new(root).sort_by_file_name() {
                    let entry = walk_entry(root, entry)?;
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    let path = entry.path();
                    let d = digest_file(path)?;
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    println!("{}  {}  {}", d, d.file_name(&extension_of(&name)), path.display());
                }
            }
        }

        Commands::ShowRef { token } => {
            let config = Config::load(&cli.config)?;
            let store = GithubStore::new(&config.remote, token.unwrap_or_default())?;
            let sha = store.get_ref(&config.remote.branch_ref())?;
            println!("{}", sha);
        }

        Commands::InitConfig { path, owner, repo } => {
            if path.exists() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "config already exists",
                ))
                .with_path(&path);
            }
            Config::example(&owner, &repo).save(&path)?;
            println!("wrote {}", path.display());
        }
    }

    Ok(())
}

/// parse `KEY=PATH`, splitting on the last `=` so keys may carry query strings
fn parse_asset(spec: &str) -> zine::Result<PendingAsset> {
    let (key, path) = spec
        .rsplit_once('=')
        .filter(|(k, p)| !k.is_empty() && !p.is_empty())
        .ok_or_else(|| Error::InvalidAssetSpec(spec.to_string()))?;
    PendingAsset::from_file(key, Path::new(path))
}

/// read the local record array that will be committed at `repo_path`
fn load_document(repo_path: &str, file: &Path) -> zine::Result<Document> {
    let text = std::fs::read_to_string(file).with_path(file)?;
    Document::from_json(repo_path, &text)
}

fn walk_entry(root: &Path, entry: walkdir::Result<DirEntry>) -> zine::Result<DirEntry> {
    entry.or_else(|e| {
        let path = e.path().unwrap_or(root).to_path_buf();
        let source = e
            .into_io_error()
            .unwrap_or_else(|| std::io::Error::other("filesystem loop"));
        Err::<DirEntry, _>(source).with_path(path)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_asset() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("cover.PNG");
        std::fs::write(&file, b"X").unwrap();

        let spec = format!("https://example.com/a?b=c={}", file.display());
        let asset = parse_asset(&spec).unwrap();
        assert_eq!(asset.logical_key, "https://example.com/a?b=c");
        assert_eq!(asset.extension, ".png");
        assert_eq!(asset.content, b"X");
    }

    #[test]
    fn test_load_document_missing_file_names_path() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("list.json");

        match load_document("src/app/Tutorial/list.json", &file) {
            Err(Error::Io { path, .. }) => assert_eq!(path, file),
            other => panic!("expected io error, got {:?}", other),
        }

        std::fs::write(&file, r#"[{"url": "a.png"}]"#).unwrap();
        let doc = load_document("src/app/Tutorial/list.json", &file).unwrap();
        assert_eq!(doc.path(), "src/app/Tutorial/list.json");
        assert_eq!(doc.len(), 1);
    }

    #[test]
    fn test_walk_entry_error_names_path() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        let entry = WalkDir::new(&missing).into_iter().next().unwrap();
        match walk_entry(&missing, entry) {
            Err(Error::Io { path, .. }) => assert_eq!(path, missing),
            other => panic!("expected io error, got {:?}", other.map(|e| e.into_path())),
        }
    }

    #[test]
    fn test_parse_asset_rejects_malformed() {
        for spec in ["no-separator", "=path", "key="] {
            assert!(matches!(parse_asset(spec), Err(Error::InvalidAssetSpec(_))));
        }
    }

    #[test]
    fn test_cli_parses_publish() {
        let cli = Cli::try_parse_from([
            "zine",
            "publish",
            "-d",
            "projects",
            "-f",
            "list.json",
            "-a",
            "k=a.png",
            "-a",
            "j=b.png",
            "--dry-run",
        ])
        .unwrap();
        match cli.command {
            Commands::Publish { assets, dry_run, .. } => {
                assert_eq!(assets.len(), 2);
                assert!(dry_run);
            }
            _ => panic!("expected publish"),
        }
    }
}
