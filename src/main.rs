//! Converge CLI entrypoint.
//!
//! This is the main entrypoint for the converge command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use converge::cli::{Cli, Commands, OutputFormatter, StateCommands};
use converge::config::{
    ConfigHasher, ConfigParser, ConfigValidator, Document, StateBackend, find_config_file,
};
use converge::error::{ConvergeError, Result};
use converge::graph::{GraphBuilder, ResourceAddress};
use converge::planner::{CancellationHandle, Plan, PlanMode, cancellation};
use converge::provider::{LOCAL_PROVIDER, LocalProvider, ProviderRegistry};
use converge::reconciler::Reconciler;
use converge::state::{
    HttpRemoteState, LocalStateStore, RemoteState, S3StateStore, STATE_DIR, StateStore,
    StoreRemoteState,
};

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse_args();

    // Initialize logging
    init_logging(cli.verbose, cli.log_json);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            if let Some(secs) = e.retry_delay_secs() {
                eprintln!("This error is transient; retry in about {secs}s.");
            }
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` overrides the level chosen by `--verbose`.
fn init_logging(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Validate { warnings } => cmd_validate(config, warnings, &formatter),
        Commands::Plan {
            out,
            refresh,
            destroy,
        } => cmd_plan(config, out.as_deref(), refresh, destroy, &formatter).await,
        Commands::Apply { plan_file, yes } => {
            cmd_apply(config, plan_file.as_deref(), yes, &formatter).await
        }
        Commands::Destroy { yes } => cmd_destroy(config, yes, &formatter).await,
        Commands::Drift => cmd_drift(config, &formatter).await,
        Commands::Outputs { from, token } => cmd_outputs(config, from, token, &formatter).await,
        Commands::State { command } => cmd_state(config, command, &formatter).await,
    }
}

/// Validate configuration and build the graph.
fn cmd_validate(
    config_path: Option<&Path>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let document = load_document(&config_file)?;
    let result = ConfigValidator::new().check(&document);
    println!("{}", formatter.format_validation(&result, show_warnings));
    if !result.is_valid() {
        return Ok(ExitCode::FAILURE);
    }

    // Building the graph catches unknown references and cycles.
    let built = GraphBuilder::new().build(&document)?;
    let hasher = ConfigHasher::new();
    let hash = hasher.hash_document(&document)?;
    println!(
        "{}",
        formatter.success(&format!(
            "{} resource blocks expand to {} instances (config {})",
            document.block_count(),
            built.len(),
            hasher.short_hash(&hash)
        ))
    );
    Ok(ExitCode::SUCCESS)
}

/// Compute and display a plan.
async fn cmd_plan(
    config_path: Option<&Path>,
    out: Option<&Path>,
    refresh: bool,
    destroy: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let context = Context::load(config_path).await?;
    let mode = if destroy { PlanMode::Destroy } else { PlanMode::Apply };

    let outcome = context.reconciler().plan(mode, refresh).await?;
    for entry in &outcome.drift {
        warn!("Drift: {entry}");
    }
    println!("{}", formatter.format_plan(&outcome.plan));

    if let Some(path) = out {
        outcome.plan.save(path).await?;
        println!("{}", formatter.success(&format!("Plan saved to {}", path.display())));
    }
    Ok(ExitCode::SUCCESS)
}

/// Apply the configuration or a saved plan.
async fn cmd_apply(
    config_path: Option<&Path>,
    plan_file: Option<&Path>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let context = Context::load(config_path).await?;
    let (handle, signal) = cancellation();
    watch_ctrl_c(handle);
    let reconciler = context.reconciler().with_cancellation(signal);

    if let Some(path) = plan_file {
        let plan = Plan::load(path).await?;
        println!("{}", formatter.format_plan(&plan));
        if !plan.has_changes() {
            return Ok(ExitCode::SUCCESS);
        }
        if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
            eprintln!("Apply cancelled.");
            return Ok(ExitCode::SUCCESS);
        }
        let report = reconciler.apply_plan(&plan).await?;
        println!("{}", formatter.format_apply(&report));
        return Ok(exit_code(report.is_complete()));
    }

    let outcome = reconciler
        .reconcile_with(PlanMode::Apply, |plan| {
            println!("{}", formatter.format_plan(plan));
            if !plan.has_changes() {
                return false;
            }
            auto_approve
                || confirm("Do you want to apply this plan? [y/N]: ", "y").unwrap_or(false)
        })
        .await?;

    match outcome.report {
        Some(report) => {
            println!("{}", formatter.format_apply(&report));
            Ok(exit_code(report.is_complete()))
        }
        None => {
            if outcome.plan.has_changes() {
                eprintln!("Apply cancelled.");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Destroy every recorded resource.
async fn cmd_destroy(
    config_path: Option<&Path>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let context = Context::load(config_path).await?;
    let (handle, signal) = cancellation();
    watch_ctrl_c(handle);

    let outcome = context
        .reconciler()
        .with_cancellation(signal)
        .reconcile_with(PlanMode::Destroy, |plan| {
            println!("{}", formatter.format_plan(plan));
            if !plan.has_changes() {
                return false;
            }
            auto_approve
                || confirm(
                    "\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ",
                    "destroy",
                )
                .unwrap_or(false)
        })
        .await?;

    match outcome.report {
        Some(report) => {
            println!("{}", formatter.format_apply(&report));
            Ok(exit_code(report.is_complete()))
        }
        None => {
            if outcome.plan.has_changes() {
                eprintln!("Destruction cancelled.");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Check for drift.
async fn cmd_drift(config_path: Option<&Path>, formatter: &OutputFormatter) -> Result<ExitCode> {
    let context = Context::load(config_path).await?;
    let report = context.reconciler().check_drift().await?;
    println!("{}", formatter.format_drift(&report));
    Ok(exit_code(report.is_converged()))
}

/// Show published outputs, locally or from a remote snapshot.
async fn cmd_outputs(
    config_path: Option<&Path>,
    from: Option<String>,
    token: Option<String>,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let outputs = if let Some(url) = from {
        let mut remote = HttpRemoteState::new(&url)?;
        if let Some(token) = token {
            remote = remote.with_token(token);
        }
        remote.outputs().await?
    } else {
        let context = Context::load(config_path).await?;
        StoreRemoteState::new(context.store).outputs().await?
    };
    println!("{}", formatter.format_outputs(&outputs));
    Ok(ExitCode::SUCCESS)
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&Path>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let context = Context::load(config_path).await?;
    let reconciler = context.reconciler();

    match command {
        StateCommands::List => {
            let snapshot = context.store.read_snapshot().await?;
            println!("{}", formatter.format_records(&snapshot));
        }
        StateCommands::Show { address } => {
            let address: ResourceAddress = address.parse()?;
            let snapshot = context.store.read_snapshot().await?;
            match snapshot.get(&address) {
                Some(record) => println!("{}", formatter.format_record(record)),
                None => {
                    println!("{}", formatter.error(&format!("{address} is not recorded")));
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
        StateCommands::Mv { from, to } => {
            let from: ResourceAddress = from.parse()?;
            let to: ResourceAddress = to.parse()?;
            let snapshot = reconciler.move_resource(&from, &to).await?;
            println!(
                "{}",
                formatter.success(&format!("Moved {from} to {to} (serial {})", snapshot.serial))
            );
        }
        StateCommands::Rm { address } => {
            let address: ResourceAddress = address.parse()?;
            let snapshot = reconciler.remove_resource(&address).await?;
            println!(
                "{}",
                formatter.success(&format!(
                    "Removed {address} from state (serial {}); the object was not destroyed",
                    snapshot.serial
                ))
            );
        }
        StateCommands::Import { address, id } => {
            let address: ResourceAddress = address.parse()?;
            let snapshot = reconciler.import_resource(&address, &id).await?;
            println!(
                "{}",
                formatter.success(&format!("Imported {id} as {address} (serial {})", snapshot.serial))
            );
        }
        StateCommands::History => {
            let versions = context.store.list_versions().await?;
            println!("{}", formatter.format_history(&versions));
        }
        StateCommands::Rollback { serial } => {
            let snapshot = reconciler.rollback(serial).await?;
            println!(
                "{}",
                formatter.warning(&format!(
                    "Restored serial {serial} as serial {}; run `converge plan` to see what changes",
                    snapshot.serial
                ))
            );
        }
        StateCommands::Prune { keep } => {
            let removed = reconciler.prune_history(keep).await?;
            println!("{}", formatter.success(&format!("Pruned {removed} versions")));
        }
        StateCommands::Unlock { lock_id } => {
            context.store.force_unlock(&lock_id).await?;
            println!("{}", formatter.warning(&format!("Lock {lock_id} removed")));
        }
    }

    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Everything a command needs: the document, its store and providers.
struct Context {
    document: Document,
    store: Box<dyn StateStore>,
    providers: ProviderRegistry,
}

impl Context {
    /// Loads the configuration and creates the store and providers.
    async fn load(config_path: Option<&Path>) -> Result<Self> {
        let config_file = resolve_config_path(config_path)?;
        let document = load_document(&config_file)?;
        ConfigValidator::new().validate(&document)?;

        let base_dir = base_dir(&config_file);
        let store = create_state_store(&document, &base_dir).await?;
        debug!(
            "Using {} state for workspace {}",
            store.backend_type(),
            store.snapshot_id()
        );
        let providers = create_providers(&document, &base_dir);

        Ok(Self {
            document,
            store,
            providers,
        })
    }

    fn reconciler(&self) -> Reconciler<'_> {
        Reconciler::new(&self.document, self.store.as_ref(), &self.providers)
    }
}

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&Path>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.to_path_buf()))
}

/// Directory the configuration file lives in.
fn base_dir(config_file: &Path) -> PathBuf {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// Loads `.env` next to the configuration, then the document with
/// environment overrides applied.
fn load_document(config_file: &Path) -> Result<Document> {
    debug!("Loading configuration from: {}", config_file.display());
    let parser = ConfigParser::new().with_base_path(base_dir(config_file));
    parser.load_dotenv()?;
    parser.load_with_env(config_file)
}

/// Creates the state store the document selects.
async fn create_state_store(document: &Document, base_dir: &Path) -> Result<Box<dyn StateStore>> {
    let state = &document.state;
    let store: Box<dyn StateStore> = match state.backend {
        StateBackend::Local => {
            let path = state
                .path
                .as_ref()
                .map_or_else(|| base_dir.join(STATE_DIR), |p| base_dir.join(p));
            Box::new(LocalStateStore::with_base_dir(path, &state.workspace))
        }
        StateBackend::S3 => {
            let bucket = state
                .bucket
                .as_deref()
                .ok_or_else(|| ConvergeError::internal("S3 bucket not configured"))?;
            Box::new(
                S3StateStore::new(
                    bucket,
                    state.prefix.as_deref(),
                    state.region.as_deref(),
                    &state.workspace,
                )
                .await?,
            )
        }
    };
    Ok(store)
}

/// Registers the built-in providers.
fn create_providers(document: &Document, base_dir: &Path) -> ProviderRegistry {
    for name in document.providers.keys().filter(|n| n.as_str() != LOCAL_PROVIDER) {
        warn!("Provider {name} is configured but not built in; its resources cannot be planned");
    }
    let local = LocalProvider::from_config(document.providers.get(LOCAL_PROVIDER), base_dir);
    ProviderRegistry::new().with(Arc::new(local))
}

/// Cancels the run on Ctrl-C; in-flight provider calls finish first.
fn watch_ctrl_c(handle: CancellationHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; waiting for in-flight operations to finish");
            handle.cancel();
        }
    });
}

/// Asks for confirmation on stderr.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}

const fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
