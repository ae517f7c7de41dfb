//! Admin command-line interface
//!
//! Shape: `deploy | delete | status | namespace {...} | system {...} |
//! resource {...} | entity {...}`. The backend is the in-process store
//! persisted to a JSON state file, which is enough to drive every admin
//! flow end-to-end locally; hosted deployments swap the store binding.
//!
//! Exit codes: 0 success, 1 user-visible failure, 2 argument error (from
//! the parser).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use clap::{Args, Parser, Subcommand};

use crate::limiter::{LimiterConfig, RateLimiter};
use crate::models::{Entity, FailureMode, Limit, SystemClock};
use crate::namespace::NamespaceRegistry;
use crate::provision::{Applier, LimitsManifest};
use crate::schema;
use crate::store::{MemoryStore, Repository, WideRowStore};

/// SLUICE admin CLI.
#[derive(Debug, Parser)]
#[command(name = "sluice", version, about = "Distributed rate limiter administration")]
pub struct Cli {
    /// State file backing the local store.
    #[arg(long, env = "SLUICE_STATE_FILE", default_value = "sluice-state.json", global = true)]
    pub state_file: PathBuf,

    /// Namespace name to operate in. Defaults to the shared namespace.
    #[arg(long, short = 'n', global = true)]
    pub namespace: Option<String>,

    /// Command to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Initialise the deployment: write the version record and optionally
    /// apply a manifest.
    Deploy {
        /// Manifest to apply after deploying.
        #[arg(long)]
        manifest: Option<PathBuf>,
    },
    /// Remove the local deployment state entirely.
    Delete {
        /// Skip the confirmation check.
        #[arg(long)]
        force: bool,
    },
    /// Show deployment status.
    Status,
    /// Namespace registry management.
    #[command(subcommand)]
    Namespace(NamespaceCmd),
    /// System-wide default limits.
    #[command(subcommand)]
    System(SystemCmd),
    /// Resource-level default limits.
    #[command(subcommand)]
    Resource(ResourceCmd),
    /// Entity management and entity-level limits.
    #[command(subcommand)]
    Entity(EntityCmd),
}

/// `namespace` subcommands.
#[derive(Debug, Subcommand)]
pub enum NamespaceCmd {
    /// Register a namespace, printing its id.
    Register { name: String },
    /// List active namespaces.
    List,
    /// Show one namespace by name.
    Show { name: String },
    /// Soft-delete a namespace.
    Delete { name: String },
    /// Recover a soft-deleted namespace by id.
    Recover { id: String },
    /// List soft-deleted namespaces.
    Orphans,
    /// Hard-delete all data of a soft-deleted namespace.
    Purge { id: String },
}

/// `system` subcommands.
#[derive(Debug, Subcommand)]
pub enum SystemCmd {
    /// Write system default limits.
    SetDefaults(SetLimitsArgs),
    /// Show system default limits.
    GetDefaults,
    /// Remove system default limits.
    DeleteDefaults,
}

/// `resource` subcommands.
#[derive(Debug, Subcommand)]
pub enum ResourceCmd {
    /// Write defaults for one resource.
    SetDefaults {
        resource: String,
        #[command(flatten)]
        limits: SetLimitsArgs,
    },
    /// Show defaults of one resource.
    GetDefaults { resource: String },
    /// Remove defaults of one resource.
    DeleteDefaults { resource: String },
    /// List resources with stored defaults.
    List,
}

/// `entity` subcommands.
#[derive(Debug, Subcommand)]
pub enum EntityCmd {
    /// Create an entity.
    Create {
        id: String,
        /// Display name.
        #[arg(long)]
        name: Option<String>,
        /// Parent entity for cascading limits.
        #[arg(long)]
        parent: Option<String>,
        /// Cascade acquires to ancestors.
        #[arg(long)]
        cascade: bool,
    },
    /// Show an entity.
    Get { id: String },
    /// Delete an entity and everything it owns.
    Delete { id: String },
    /// Write entity-level limits.
    SetLimits {
        id: String,
        /// Scope the limits to one resource.
        #[arg(long)]
        resource: Option<String>,
        #[command(flatten)]
        limits: SetLimitsArgs,
    },
    /// Show entity-level limits.
    GetLimits {
        id: String,
        #[arg(long)]
        resource: Option<String>,
    },
    /// Remove entity-level limits.
    DeleteLimits {
        id: String,
        #[arg(long)]
        resource: Option<String>,
    },
}

/// Repeated `--limit name=capacity[:refill_amount[:refill_period_s]]`.
#[derive(Debug, Args)]
pub struct SetLimitsArgs {
    /// Limit specs, e.g. `--limit rpm=100` or `--limit tpm=10000:10000:60`.
    #[arg(long = "limit", required = true)]
    pub limits: Vec<String>,

    /// Unavailability policy (system level only): allow or block.
    #[arg(long)]
    pub on_unavailable: Option<FailureMode>,
}

/// Parse one `name=capacity[:refill_amount[:refill_period_s]]` spec.
pub fn parse_limit_spec(spec: &str) -> anyhow::Result<Limit> {
    let (name, rest) = spec
        .split_once('=')
        .ok_or_else(|| anyhow!("limit spec '{spec}' is not name=capacity[:refill[:period]]"))?;
    let mut parts = rest.split(':');
    let capacity: i64 = parts
        .next()
        .unwrap_or_default()
        .parse()
        .with_context(|| format!("bad capacity in '{spec}'"))?;
    let refill_amount: i64 = match parts.next() {
        Some(p) => p.parse().with_context(|| format!("bad refill amount in '{spec}'"))?,
        None => capacity,
    };
    let refill_period: u64 = match parts.next() {
        Some(p) => p.parse().with_context(|| format!("bad refill period in '{spec}'"))?,
        None => 60,
    };
    Ok(Limit::new(name, capacity, refill_amount, Duration::from_secs(refill_period)))
}

fn parse_limits(args: &SetLimitsArgs) -> anyhow::Result<Vec<Limit>> {
    args.limits.iter().map(|s| parse_limit_spec(s)).collect()
}

// ============================================================================
// Execution
// ============================================================================

struct CliContext {
    store: Arc<MemoryStore>,
    state_file: PathBuf,
}

impl CliContext {
    fn load(state_file: &Path) -> anyhow::Result<Self> {
        let store = if state_file.exists() {
            let raw = std::fs::read_to_string(state_file)
                .with_context(|| format!("reading {}", state_file.display()))?;
            let json: serde_json::Value = serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", state_file.display()))?;
            MemoryStore::from_json(&json).map_err(|e| anyhow!("{e}"))?
        } else {
            MemoryStore::new()
        };
        Ok(Self {
            store: Arc::new(store),
            state_file: state_file.to_path_buf(),
        })
    }

    fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.store.to_json())?;
        std::fs::write(&self.state_file, json)
            .with_context(|| format!("writing {}", self.state_file.display()))?;
        Ok(())
    }

    fn registry(&self) -> NamespaceRegistry {
        NamespaceRegistry::new(
            Arc::clone(&self.store) as Arc<dyn WideRowStore>,
            Arc::new(SystemClock),
        )
    }

    /// Resolve the `--namespace` flag to a namespace id. The shared
    /// namespace needs no registration.
    async fn namespace_id(&self, namespace: &Option<String>) -> anyhow::Result<String> {
        match namespace.as_deref() {
            None => Ok(schema::RESERVED_NAMESPACE.to_string()),
            Some(name) if name == schema::RESERVED_NAMESPACE => Ok(name.to_string()),
            Some(name) => self
                .registry()
                .resolve(name)
                .await?
                .ok_or_else(|| anyhow!("namespace '{name}' is not registered")),
        }
    }

    async fn limiter(&self, namespace: &Option<String>) -> anyhow::Result<RateLimiter> {
        let ns = self.namespace_id(namespace).await?;
        Ok(RateLimiter::new(
            Arc::clone(&self.store) as Arc<dyn WideRowStore>,
            LimiterConfig {
                namespace: ns,
                principal: std::env::var("USER").ok(),
                ..LimiterConfig::default()
            },
            Arc::new(SystemClock),
        ))
    }
}

fn print_limits(limits: &[Limit]) {
    if limits.is_empty() {
        println!("(no limits stored)");
        return;
    }
    for limit in limits {
        println!(
            "{:<16} capacity={:<10} burst={:<10} refill={}/{}s",
            limit.name,
            limit.capacity,
            limit.burst,
            limit.refill_amount,
            limit.refill_period.as_secs(),
        );
    }
}

/// Run a parsed CLI invocation.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let ctx = CliContext::load(&cli.state_file)?;

    match &cli.command {
        Command::Deploy { manifest } => {
            let limiter = ctx.limiter(&None).await?;
            limiter.write_version_record(None).await?;
            println!("version record written (schema v{})", schema::SCHEMA_VERSION);

            if let Some(path) = manifest {
                let yaml = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                let manifest = LimitsManifest::from_yaml(&yaml)?;

                let ns = if manifest.namespace == schema::RESERVED_NAMESPACE {
                    manifest.namespace.clone()
                } else {
                    ctx.registry().register(&manifest.namespace).await?
                };
                let repo = Repository::new(Arc::clone(&ctx.store) as Arc<dyn WideRowStore>, ns);
                let applier = Applier::new(repo, Arc::new(SystemClock));
                let result = applier.apply_manifest(&manifest).await?;
                println!(
                    "manifest applied: {} created, {} updated, {} deleted",
                    result.created, result.updated, result.deleted
                );
                if !result.is_clean() {
                    for error in &result.errors {
                        eprintln!("error: {error}");
                    }
                    bail!("{} changes failed", result.errors.len());
                }
            }
        }

        Command::Delete { force } => {
            if !force {
                bail!("refusing to delete {} without --force", cli.state_file.display());
            }
            if cli.state_file.exists() {
                std::fs::remove_file(&cli.state_file)
                    .with_context(|| format!("removing {}", cli.state_file.display()))?;
                println!("deployment state removed");
            } else {
                println!("nothing to delete");
            }
            return Ok(());
        }

        Command::Status => {
            let limiter = ctx.limiter(&None).await?;
            match limiter.repository().get_version_record().await? {
                Some(record) => {
                    println!("schema version:  {}", record.schema_version);
                    println!("min client:      {}", record.min_client_version);
                    println!(
                        "aggregator:      {}",
                        record.aggregator_version.as_deref().unwrap_or("(none)")
                    );
                }
                None => println!("not deployed (no version record)"),
            }
            println!("rows:            {}", ctx.store.len());
            let namespaces = ctx.registry().list().await?;
            println!("namespaces:      {}", namespaces.len());
            for ns in namespaces {
                println!("  {:<24} {}", ns.name, ns.id);
            }
            return Ok(());
        }

        Command::Namespace(cmd) => {
            let registry = ctx.registry();
            match cmd {
                NamespaceCmd::Register { name } => {
                    let id = registry.register(name).await?;
                    println!("{id}");
                }
                NamespaceCmd::List => {
                    for record in registry.list().await? {
                        println!("{:<24} {}", record.name, record.id);
                    }
                    return Ok(());
                }
                NamespaceCmd::Show { name } => {
                    let id = registry
                        .resolve(name)
                        .await?
                        .ok_or_else(|| anyhow!("namespace '{name}' is not registered"))?;
                    let record = registry
                        .describe(&id)
                        .await?
                        .ok_or_else(|| anyhow!("namespace id '{id}' has no registry record"))?;
                    println!("{}", serde_json::to_string_pretty(&record)?);
                    return Ok(());
                }
                NamespaceCmd::Delete { name } => {
                    registry.delete(name).await?;
                    println!("namespace '{name}' soft-deleted");
                }
                NamespaceCmd::Recover { id } => {
                    let record = registry.recover(id).await?;
                    println!("namespace '{}' recovered as {}", record.name, record.id);
                }
                NamespaceCmd::Orphans => {
                    for record in registry.orphans().await? {
                        println!("{:<24} {}", record.name, record.id);
                    }
                    return Ok(());
                }
                NamespaceCmd::Purge { id } => {
                    let deleted = registry.purge(id).await?;
                    println!("purged {deleted} rows");
                }
            }
        }

        Command::System(cmd) => {
            let limiter = ctx.limiter(&cli.namespace).await?;
            match cmd {
                SystemCmd::SetDefaults(args) => {
                    let limits = parse_limits(args)?;
                    limiter.set_system_defaults(&limits, args.on_unavailable).await?;
                    println!("system defaults written");
                }
                SystemCmd::GetDefaults => {
                    match limiter.get_system_defaults().await? {
                        Some((limits, mode)) => {
                            print_limits(&limits);
                            if let Some(mode) = mode {
                                println!("on_unavailable: {mode}");
                            }
                        }
                        None => println!("(no system defaults)"),
                    }
                    return Ok(());
                }
                SystemCmd::DeleteDefaults => {
                    limiter.delete_system_defaults().await?;
                    println!("system defaults removed");
                }
            }
        }

        Command::Resource(cmd) => {
            let limiter = ctx.limiter(&cli.namespace).await?;
            match cmd {
                ResourceCmd::SetDefaults { resource, limits } => {
                    let parsed = parse_limits(limits)?;
                    limiter.set_resource_defaults(resource, &parsed).await?;
                    println!("defaults for '{resource}' written");
                }
                ResourceCmd::GetDefaults { resource } => {
                    print_limits(&limiter.get_resource_defaults(resource).await?);
                    return Ok(());
                }
                ResourceCmd::DeleteDefaults { resource } => {
                    limiter.delete_resource_defaults(resource).await?;
                    println!("defaults for '{resource}' removed");
                }
                ResourceCmd::List => {
                    for resource in limiter.list_resource_defaults().await? {
                        println!("{resource}");
                    }
                    return Ok(());
                }
            }
        }

        Command::Entity(cmd) => {
            let limiter = ctx.limiter(&cli.namespace).await?;
            match cmd {
                EntityCmd::Create {
                    id,
                    name,
                    parent,
                    cascade,
                } => {
                    let mut entity = Entity::new(id.clone());
                    entity.name = name.clone();
                    entity.parent_id = parent.clone();
                    entity.cascade = *cascade;
                    limiter.create_entity(entity).await?;
                    println!("entity '{id}' created");
                }
                EntityCmd::Get { id } => {
                    let entity = limiter
                        .get_entity(id)
                        .await?
                        .ok_or_else(|| anyhow!("entity '{id}' not found"))?;
                    println!("{}", serde_json::to_string_pretty(&entity)?);
                    return Ok(());
                }
                EntityCmd::Delete { id } => {
                    limiter.delete_entity(id).await?;
                    println!("entity '{id}' deleted");
                }
                EntityCmd::SetLimits { id, resource, limits } => {
                    let parsed = parse_limits(limits)?;
                    limiter.set_limits(id, &parsed, resource.as_deref()).await?;
                    println!("limits for '{id}' written");
                }
                EntityCmd::GetLimits { id, resource } => {
                    print_limits(&limiter.get_limits(id, resource.as_deref()).await?);
                    return Ok(());
                }
                EntityCmd::DeleteLimits { id, resource } => {
                    limiter.delete_limits(id, resource.as_deref()).await?;
                    println!("limits for '{id}' removed");
                }
            }
        }
    }

    ctx.save()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_limit_spec_full() {
        let limit = parse_limit_spec("tpm=10000:5000:30").unwrap();
        assert_eq!(limit.name, "tpm");
        assert_eq!(limit.capacity, 10_000);
        assert_eq!(limit.refill_amount, 5_000);
        assert_eq!(limit.refill_period, Duration::from_secs(30));
    }

    #[test]
    fn test_parse_limit_spec_shorthand() {
        let limit = parse_limit_spec("rpm=100").unwrap();
        assert_eq!(limit.capacity, 100);
        assert_eq!(limit.refill_amount, 100);
        assert_eq!(limit.refill_period, Duration::from_secs(60));
    }

    #[test]
    fn test_parse_limit_spec_rejects_garbage() {
        assert!(parse_limit_spec("rpm").is_err());
        assert!(parse_limit_spec("rpm=abc").is_err());
        assert!(parse_limit_spec("rpm=10:x").is_err());
    }

    #[test]
    fn test_cli_parses_nested_commands() {
        let cli = Cli::try_parse_from([
            "sluice",
            "entity",
            "set-limits",
            "user-1",
            "--resource",
            "gpt-4",
            "--limit",
            "rpm=100",
            "--limit",
            "tpm=10000",
        ])
        .unwrap();
        match cli.command {
            Command::Entity(EntityCmd::SetLimits { id, resource, limits }) => {
                assert_eq!(id, "user-1");
                assert_eq!(resource.as_deref(), Some("gpt-4"));
                assert_eq!(limits.limits.len(), 2);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_namespace_commands() {
        let cli = Cli::try_parse_from(["sluice", "namespace", "register", "tenant-a"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Namespace(NamespaceCmd::Register { .. })
        ));

        assert!(Cli::try_parse_from(["sluice", "namespace", "frobnicate"]).is_err());
    }

    #[tokio::test]
    async fn test_end_to_end_against_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state.json");
        let base = ["sluice", "--state-file", state.to_str().unwrap()];

        let deploy = Cli::try_parse_from(base.iter().copied().chain(["deploy"])).unwrap();
        run(deploy).await.unwrap();
        assert!(state.exists());

        let register =
            Cli::try_parse_from(base.iter().copied().chain(["namespace", "register", "tenant-a"]))
                .unwrap();
        run(register).await.unwrap();

        let set = Cli::try_parse_from(base.iter().copied().chain([
            "-n",
            "tenant-a",
            "system",
            "set-defaults",
            "--limit",
            "rpm=100",
        ]))
        .unwrap();
        run(set).await.unwrap();

        // state survived across invocations
        let get = Cli::try_parse_from(base.iter().copied().chain([
            "-n",
            "tenant-a",
            "system",
            "get-defaults",
        ]))
        .unwrap();
        run(get).await.unwrap();
    }
}
