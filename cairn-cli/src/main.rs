//! cairn: command-line front end for a cairn node.
//!
//! # Usage
//!
//! ```bash
//! # Create a node directory and a repo in it
//! cairn --node ./node init
//! cairn --node ./node create-repo
//!
//! # Commit entities from a JSON array
//! cairn --node ./node commit did:key:z... --file notes.json
//!
//! # Replicate a repo into another node
//! cairn --node ./node export did:key:z... --output repo.car
//! cairn --node ./mirror import did:key:z... --file repo.car
//!
//! # Resume a pull from the mirror's head
//! cairn --node ./node export did:key:z... --tail bafy... | cairn --node ./mirror import did:key:z...
//! ```

use anyhow::{anyhow, bail, Context, Result};
use cairn_core::transfer_log::{format_entry, format_size};
use cairn_core::{
    Cid, EntityInput, ExportOptions, ExportOrder, ImportProgress, Node, NoDatasource, RevisionFilter,
    Uid,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Instant;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Parser, Debug)]
#[command(name = "cairn")]
#[command(author = "Cairn Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Content-addressed entity store with bundle replication")]
struct Cli {
    /// Node directory
    #[arg(short, long, global = true, default_value = ".")]
    node: PathBuf,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize a node directory and its instance keypair
    Init,

    /// Create a repo owned by this node
    CreateRepo,

    /// List repos and their heads
    Repos,

    /// Print the head of a repo
    Head { repo: String },

    /// Commit entity inputs read from a JSON array
    Commit {
        repo: String,
        /// JSON file, or "-" for stdin
        #[arg(short, long, default_value = "-")]
        file: String,
    },

    /// Resolve pending external references
    Reconcile { repo: String },

    /// Delegate publishing on a repo to another key
    Delegate {
        repo: String,
        audience: String,
        /// Lifetime in days; unlimited when absent
        #[arg(long)]
        ttl_days: Option<i64>,
    },

    /// Export a repo as a bundle stream
    Export {
        repo: String,
        /// Output file; stdout when absent
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Stop at this root (the receiver's head)
        #[arg(long)]
        tail: Option<String>,
        /// Emit bundles from the head backwards
        #[arg(long)]
        newest_first: bool,
    },

    /// Import a bundle stream into a repo
    Import {
        repo: String,
        /// Bundle file, or "-" for stdin
        #[arg(short, long, default_value = "-")]
        file: String,
    },

    /// List revisions in index order
    ListRevisions {
        repo: String,
        /// Resume from, and advance, this named cursor
        #[arg(long)]
        cursor: Option<String>,
        /// Start after this position when no cursor is named
        #[arg(long, default_value_t = 0)]
        after: i64,
        /// Only revisions of this entity type
        #[arg(long = "type")]
        entity_type: Option<String>,
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },

    /// Show the current state of an entity, by uid or URI
    Entity {
        repo: String,
        id: String,
        /// Print every revision instead of the current state
        #[arg(long)]
        history: bool,
    },

    /// Check the integrity of a repo
    Verify { repo: String },

    /// Show the transfer log
    Log {
        /// Only entries for this repo
        #[arg(long)]
        repo: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive("cairn=info".parse()?)
    };
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let node = Node::open(&cli.node)
        .with_context(|| format!("failed to open node at {}", cli.node.display()))?;

    match cli.command {
        Commands::Init => cmd_init(&node).await,
        Commands::CreateRepo => cmd_create_repo(&node).await,
        Commands::Repos => cmd_repos(&node).await,
        Commands::Head { repo } => cmd_head(&node, &repo).await,
        Commands::Commit { repo, file } => cmd_commit(&node, &repo, &file).await,
        Commands::Reconcile { repo } => cmd_reconcile(&node, &repo).await,
        Commands::Delegate {
            repo,
            audience,
            ttl_days,
        } => cmd_delegate(&node, &repo, &audience, ttl_days).await,
        Commands::Export {
            repo,
            output,
            tail,
            newest_first,
        } => cmd_export(&node, &repo, output, tail, newest_first).await,
        Commands::Import { repo, file } => cmd_import(&node, &repo, &file).await,
        Commands::ListRevisions {
            repo,
            cursor,
            after,
            entity_type,
            limit,
        } => cmd_list_revisions(&node, &repo, cursor, after, entity_type, limit).await,
        Commands::Entity { repo, id, history } => cmd_entity(&node, &repo, &id, history).await,
        Commands::Verify { repo } => cmd_verify(&node, &repo).await,
        Commands::Log { repo } => cmd_log(&node, repo),
    }
}

fn head_string(head: Option<Cid>) -> String {
    head.map(|c| c.to_string()).unwrap_or_else(|| "<empty>".to_string())
}

async fn read_input(file: &str) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    if file == "-" {
        tokio::io::stdin().read_to_end(&mut buf).await?;
    } else {
        File::open(file)
            .await
            .with_context(|| format!("failed to open {}", file))?
            .read_to_end(&mut buf)
            .await?;
    }
    Ok(buf)
}

async fn cmd_init(node: &Node) -> Result<()> {
    let instance = node.instance_keypair().await?;
    if let Some(path) = node.path() {
        println!("Node initialized at {}", path.display());
    }
    println!("  Instance: {}", instance.did());
    Ok(())
}

async fn cmd_create_repo(node: &Node) -> Result<()> {
    let repo = node.create_repo().await?;
    println!("{}", repo.did());
    Ok(())
}

async fn cmd_repos(node: &Node) -> Result<()> {
    let repos = node.list_repos().await?;
    if repos.is_empty() {
        println!("No repos.");
    }
    for (did, head) in repos {
        println!("{}  {}", did, head_string(head));
    }
    Ok(())
}

async fn cmd_head(node: &Node, repo: &str) -> Result<()> {
    let repo = node.repo(repo).await?;
    println!("{}", head_string(repo.head().await?));
    Ok(())
}

async fn cmd_commit(node: &Node, repo: &str, file: &str) -> Result<()> {
    let raw = read_input(file).await?;
    let inputs: Vec<EntityInput> =
        serde_json::from_slice(&raw).context("input must be a JSON array of entities")?;
    let report = node.ingest(repo, inputs, &NoDatasource).await?;

    match report.outcome.summary() {
        Some(summary) => {
            println!("Committed {}", summary.root_cid);
            println!("  Parent:    {}", head_string(summary.parent));
            println!("  Revisions: {}", summary.revisions.len());
        }
        None => println!("Nothing to commit."),
    }
    if !report.missing.is_empty() {
        println!("  Unresolved: {}", report.missing.join(", "));
    }
    if report.provisional > 0 {
        println!("  Provisional relations: {}", report.provisional);
    }
    if let Some(reconciled) = report.reconciled.filter(|r| r.resolved > 0) {
        println!("  Reconciled: {} ({} remaining)", reconciled.resolved, reconciled.remaining);
    }
    Ok(())
}

async fn cmd_reconcile(node: &Node, repo: &str) -> Result<()> {
    let report = node.reconcile_provisional(repo).await?;
    println!("Resolved {} reference(s), {} remaining", report.resolved, report.remaining);
    if let Some(summary) = report.outcome.summary() {
        println!("  Committed {}", summary.root_cid);
    }
    Ok(())
}

async fn cmd_delegate(node: &Node, repo: &str, audience: &str, ttl_days: Option<i64>) -> Result<()> {
    let ttl = ttl_days.map(chrono::Duration::days);
    let capability = node.delegate(repo, audience, ttl).await?;
    println!("{}", capability.token());
    Ok(())
}

async fn cmd_export(
    node: &Node,
    repo: &str,
    output: Option<PathBuf>,
    tail: Option<String>,
    newest_first: bool,
) -> Result<()> {
    let tail = tail
        .map(|t| t.parse::<Cid>())
        .transpose()
        .map_err(|e| anyhow!("invalid --tail: {}", e))?;
    let options = ExportOptions {
        tail,
        order: if newest_first {
            ExportOrder::NewestFirst
        } else {
            ExportOrder::OldestFirst
        },
    };

    let started = Instant::now();
    let progress = match &output {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("failed to create {}", path.display()))?;
            let (mut file, progress) = node.export_to(repo, file, options).await?;
            file.flush().await?;
            progress
        }
        None => {
            let (mut stdout, progress) = node.export_to(repo, tokio::io::stdout(), options).await?;
            stdout.flush().await?;
            progress
        }
    };

    eprintln!(
        "Exported {} commit(s), {} blocks, {} in {}ms",
        progress.commits,
        progress.blocks,
        format_size(progress.bytes),
        started.elapsed().as_millis()
    );
    Ok(())
}

async fn cmd_import(node: &Node, repo: &str, file: &str) -> Result<()> {
    node.mirror_repo(repo).await?;
    let print = |p: &ImportProgress| {
        if let Ok(line) = serde_json::to_string(p) {
            eprintln!("{}", line);
        }
    };
    let progress = if file == "-" {
        node.import_from(repo, tokio::io::stdin(), print).await?
    } else {
        let reader = File::open(file)
            .await
            .with_context(|| format!("failed to open {}", file))?;
        node.import_from(repo, reader, print).await?
    };
    println!("{}", serde_json::to_string(&progress)?);
    Ok(())
}

async fn cmd_list_revisions(
    node: &Node,
    repo: &str,
    cursor: Option<String>,
    after: i64,
    entity_type: Option<String>,
    limit: usize,
) -> Result<()> {
    let repo = node.repo(repo).await?;
    let filter = RevisionFilter {
        entity_type,
        entity_uid: None,
    };
    let page = match &cursor {
        Some(name) => repo.list_revisions_from(name, &filter, limit).await?,
        None => repo.list_revisions(after, &filter, limit).await?,
    };
    for item in &page.revisions {
        let rev = &item.revision;
        println!(
            "{:>6}  {}  {}  {}{}",
            item.seq,
            rev.id,
            rev.entity_type,
            rev.entity_uid,
            if rev.is_deleted { "  (deleted)" } else { "" }
        );
    }
    println!("-- next cursor {}, {} remaining", page.next_cursor, page.remaining);
    Ok(())
}

async fn cmd_entity(node: &Node, repo: &str, id: &str, history: bool) -> Result<()> {
    let repo = node.repo(repo).await?;
    let uid = match id.parse::<Uid>() {
        Ok(uid) => uid,
        Err(_) => repo
            .resolve_uri(id)
            .await?
            .ok_or_else(|| anyhow!("no entity known as {}", id))?,
    };
    if history {
        let revisions = repo.history(&uid).await?;
        println!("{}", serde_json::to_string_pretty(&revisions)?);
        return Ok(());
    }
    match repo.get_entity(&uid).await? {
        Some(entity) => println!("{}", serde_json::to_string_pretty(&entity)?),
        None => bail!("entity {} is deleted", uid),
    }
    Ok(())
}

async fn cmd_verify(node: &Node, repo: &str) -> Result<()> {
    let report = node.verify(repo).await?;
    println!("Head:      {}", head_string(report.head));
    println!("Commits:   {}", report.commits);
    println!("Revisions: {}", report.revisions);
    println!("Blocks:    {}", report.blocks);
    for warning in &report.warnings {
        println!("  warning: {}", warning);
    }
    for error in &report.errors {
        println!("  error: {}", error);
    }
    if !report.is_healthy() {
        bail!("verification found {} error(s)", report.errors.len());
    }
    println!("OK");
    Ok(())
}

fn cmd_log(node: &Node, repo: Option<String>) -> Result<()> {
    let log = node
        .transfer_log()
        .ok_or_else(|| anyhow!("node has no transfer log"))?;
    let entries = match &repo {
        Some(did) => log.for_repo(did)?,
        None => log.all()?,
    };
    if entries.is_empty() {
        println!("No transfers recorded.");
    }
    for entry in &entries {
        println!("{}", format_entry(entry));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_export_flags() {
        let cli = Cli::try_parse_from([
            "cairn", "--node", "/tmp/n", "export", "did:key:zabc", "--tail", "bafy", "--newest-first",
        ])
        .unwrap();
        assert_eq!(cli.node, PathBuf::from("/tmp/n"));
        match cli.command {
            Commands::Export {
                repo,
                output,
                tail,
                newest_first,
            } => {
                assert_eq!(repo, "did:key:zabc");
                assert!(output.is_none());
                assert_eq!(tail.as_deref(), Some("bafy"));
                assert!(newest_first);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_commit_from_json_file() {
        let dir = TempDir::new().unwrap();
        let node = Node::open(&dir.path().join("node")).unwrap();
        let repo = node.create_repo().await.unwrap();
        let input = dir.path().join("notes.json");
        std::fs::write(
            &input,
            r#"[{"type": "Note", "uris": ["note:1"], "content": {"text": "hi"}}]"#,
        )
        .unwrap();

        cmd_commit(&node, repo.did(), input.to_str().unwrap()).await.unwrap();
        let uid = repo.resolve_uri("note:1").await.unwrap().unwrap();
        assert!(repo.get_entity(&uid).await.unwrap().is_some());

        let car = dir.path().join("repo.car");
        cmd_export(&node, repo.did(), Some(car.clone()), None, false)
            .await
            .unwrap();
        assert!(std::fs::metadata(&car).unwrap().len() > 0);
    }
}
