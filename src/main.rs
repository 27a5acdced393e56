use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use serde::Serialize;
use tracing_subscriber::{fmt, EnvFilter};

use gatehouse::audit::{JsonLinesLogger, Logger, NopLogger, TracingLogger, DEFAULT_AUDIT_QUEUE};
use gatehouse::breakglass::{BreakGlassManager, Invocation};
use gatehouse::credentials::CommandCredentialProvider;
use gatehouse::issuer::{CredentialIssuer, IssueRequest, IssuerConfig};
use gatehouse::jobs::{self, SweepStores, EXPIRY_SWEEP_JOB};
use gatehouse::notify::{Notifier, QueuedNotifier, TracingNotifier};
use gatehouse::overrides::OverrideResolver;
use gatehouse::policy::{CachedPolicyLoader, FilePolicyLoader, Mode};
use gatehouse::requests::{NewAccessRequest, RequestManager};
use gatehouse::server::{ServerConfig, SessionServer};
use gatehouse::session::SessionTracker;
use gatehouse::settings::{AuditSink, Settings};
use gatehouse::storage::{SqlStore, DEFAULT_LIST_LIMIT};

#[derive(Parser, Debug)]
#[command(
    name = "gatehouse",
    version,
    about = "Policy-gated temporary cloud credentials"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct Identity {
    /// Profile to request credentials for
    #[arg(short, long)]
    profile: String,

    /// Acting user; defaults to $USER
    #[arg(short, long, env = "USER")]
    user: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a command with a local credential server in its environment
    Exec {
        #[command(flatten)]
        identity: Identity,
        /// Issue on the first refresh instead of at startup
        #[arg(long)]
        lazy: bool,
        #[arg(long)]
        device_id: Option<String>,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Print credentials in the credential_process format
    CredentialProcess {
        #[command(flatten)]
        identity: Identity,
        /// Requested lifetime in seconds; the mode default when omitted
        #[arg(long)]
        duration_secs: Option<u64>,
    },
    /// Manage access requests
    #[command(subcommand)]
    Request(RequestCommand),
    /// Manage break-glass events
    #[command(subcommand)]
    BreakGlass(BreakGlassCommand),
    /// Inspect and revoke server sessions
    #[command(subcommand)]
    Session(SessionCommand),
    /// Persist Expired status for lapsed records now
    Sweep,
}

#[derive(Subcommand, Debug)]
enum RequestCommand {
    Submit {
        #[command(flatten)]
        identity: Identity,
        #[arg(long)]
        justification: String,
        #[arg(long, default_value_t = 3600)]
        duration_secs: u64,
    },
    Approve {
        id: String,
        #[arg(long, env = "USER")]
        approver: String,
        #[arg(long)]
        comment: Option<String>,
    },
    Deny {
        id: String,
        #[arg(long, env = "USER")]
        approver: String,
        #[arg(long)]
        comment: Option<String>,
    },
    Cancel {
        id: String,
        #[arg(long, env = "USER")]
        user: String,
    },
    /// Pending requests, or one requester's history
    List {
        #[arg(long)]
        requester: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum BreakGlassCommand {
    Invoke {
        #[command(flatten)]
        identity: Identity,
        /// incident, maintenance, security, recovery or other
        #[arg(long)]
        reason: String,
        #[arg(long)]
        justification: String,
        #[arg(long, default_value_t = 3600)]
        duration_secs: u64,
        /// Access request this event escalates
        #[arg(long)]
        request_id: Option<String>,
    },
    Close {
        id: String,
        #[arg(long, env = "USER")]
        user: String,
        #[arg(long)]
        reason: String,
    },
    /// Active events, or one invoker's history
    List {
        #[arg(long)]
        invoker: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum SessionCommand {
    List {
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        profile: Option<String>,
        #[arg(long)]
        device_id: Option<String>,
    },
    Revoke {
        id: String,
        #[arg(long, env = "USER")]
        user: String,
        #[arg(long)]
        reason: String,
    },
}

/// Everything the subcommands share, built once from settings.
struct App {
    settings: Settings,
    store: Arc<SqlStore>,
    logger: Arc<dyn Logger>,
    /// Set for the `json_lines` sink; flushed by [`App::close`].
    audit_file: Option<JsonLinesLogger>,
    notifier: Arc<dyn Notifier>,
}

impl App {
    async fn init(settings: Settings) -> Result<Self> {
        let store = SqlStore::connect(&settings.database.url).await?;
        store.migrate().await?;

        let mut audit_file = None;
        let logger: Arc<dyn Logger> = match settings.audit.sink {
            AuditSink::Tracing => Arc::new(TracingLogger),
            AuditSink::Disabled => Arc::new(NopLogger),
            AuditSink::JsonLines => {
                let path = settings.audit.path.as_deref().unwrap_or(Path::new("audit.jsonl"));
                let file = JsonLinesLogger::open(path, DEFAULT_AUDIT_QUEUE)
                    .await
                    .into_diagnostic()?;
                audit_file = Some(file.clone());
                Arc::new(file)
            }
        };
        let notifier: Arc<dyn Notifier> = Arc::new(QueuedNotifier::spawn(
            Arc::new(TracingNotifier),
            settings.overrides.notification_queue,
        ));

        Ok(Self {
            settings,
            store: Arc::new(store),
            logger,
            audit_file,
            notifier,
        })
    }

    /// Write out anything still queued for the audit file.
    async fn close(&self) {
        if let Some(file) = &self.audit_file {
            file.flush().await;
        }
    }

    fn issuer(&self) -> CredentialIssuer {
        let s = &self.settings;
        let loader = CachedPolicyLoader::new(
            Arc::new(FilePolicyLoader::new()),
            Duration::from_secs(s.policy.cache_ttl_secs),
        );
        let mut provider = CommandCredentialProvider::new(
            s.credentials.command.clone(),
            s.credentials.args.clone(),
            s.credentials.namespace.clone(),
        );
        if let Some(arn) = &s.credentials.role_arn {
            provider = provider.with_role_arn(arn.clone());
        }

        let mut resolver = OverrideResolver::new()
            .with_timeout(Duration::from_millis(s.overrides.lookup_timeout_ms));
        if s.overrides.approvals {
            resolver = resolver.with_requests(self.store.clone());
        }
        if s.overrides.break_glass {
            resolver = resolver.with_break_glass(self.store.clone());
        }

        let config = IssuerConfig {
            policy_source: s.policy.source.to_string_lossy().to_string(),
            session_table_name: s.session_table_name(),
            cli_default_duration: s.credentials.cli_default_duration(),
            server_default_duration: s.credentials.server_duration(),
            max_duration: s.credentials.max_duration(),
            policy_timeout: Duration::from_secs(s.policy.load_timeout_secs),
        };
        CredentialIssuer::new(config, Arc::new(loader), Arc::new(provider))
            .with_resolver(resolver)
            .with_logger(self.logger.clone())
            .with_notifier(self.notifier.clone())
    }

    fn tracker(&self) -> SessionTracker {
        SessionTracker::new(self.store.clone())
            .with_ttl(Duration::from_secs(self.settings.sessions.ttl_secs))
    }

    fn requests(&self) -> RequestManager {
        RequestManager::new(self.store.clone(), self.logger.clone())
            .with_ttl(Duration::from_secs(self.settings.overrides.request_ttl_secs))
    }

    fn break_glass(&self) -> BreakGlassManager {
        BreakGlassManager::new(self.store.clone(), self.logger.clone(), self.notifier.clone())
            .with_max_duration(Duration::from_secs(
                self.settings.overrides.break_glass_max_duration_secs,
            ))
    }

    fn sweep_stores(&self) -> SweepStores {
        SweepStores {
            requests: self.store.clone(),
            break_glass: self.store.clone(),
            sessions: self.store.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // logging goes to stderr so stdout stays clean for credential output
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let settings = Settings::load(&cli.config)?;
    tracing::debug!(?settings, "Loaded configuration");

    let app = App::init(settings).await?;
    let outcome = run(&app, cli.command).await;
    app.close().await;
    outcome
}

async fn run(app: &App, command: Command) -> Result<ExitCode> {
    match command {
        Command::Exec {
            identity,
            lazy,
            device_id,
            command,
        } => exec(app, identity, lazy, device_id, command).await,
        Command::CredentialProcess {
            identity,
            duration_secs,
        } => {
            let issued = app
                .issuer()
                .issue(&IssueRequest {
                    user: identity.user,
                    profile: identity.profile,
                    mode: Mode::CredentialProcess,
                    duration: Duration::from_secs(duration_secs.unwrap_or(0)),
                    session_id: None,
                    no_session: false,
                })
                .await?;
            let creds = issued.credentials;
            print_json(&serde_json::json!({
                "Version": 1,
                "AccessKeyId": creds.access_key_id,
                "SecretAccessKey": creds.secret_access_key,
                "SessionToken": creds.session_token,
                "Expiration": creds.expiration,
            }))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Request(cmd) => request(app, cmd).await,
        Command::BreakGlass(cmd) => break_glass(app, cmd).await,
        Command::Session(cmd) => session(app, cmd).await,
        Command::Sweep => {
            let report = jobs::trigger_job_manually(&app.sweep_stores(), EXPIRY_SWEEP_JOB).await?;
            tracing::info!(
                requests = report.requests,
                break_glass = report.break_glass,
                sessions = report.sessions,
                "Sweep finished"
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn exec(
    app: &App,
    identity: Identity,
    lazy: bool,
    device_id: Option<String>,
    command: Vec<String>,
) -> Result<ExitCode> {
    let s = &app.settings;

    let _scheduler = if s.jobs.sweep_enabled {
        Some(jobs::init_scheduler(app.sweep_stores(), &s.jobs.sweep_schedule).await?)
    } else {
        None
    };

    let tracker = s.sessions.enabled.then(|| Arc::new(app.tracker()));
    let config = ServerConfig {
        bind: s.bind_addr()?,
        duration: s.credentials.server_duration(),
        lazy: lazy || s.server.lazy,
        namespace: s.credentials.namespace.clone(),
        device_id,
        ..ServerConfig::new(identity.user, identity.profile)
    };
    let server = SessionServer::start(config, Arc::new(app.issuer()), tracker).await?;

    let Some((program, args)) = command.split_first() else {
        server.shutdown().await;
        return Err(miette::miette!("no command given"));
    };
    let mut child = match tokio::process::Command::new(program)
        .args(args)
        .envs(server.env_vars())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            server.shutdown().await;
            return Err(miette::miette!("failed to start `{program}`: {e}"));
        }
    };

    let status = tokio::select! {
        status = child.wait() => Some(status.into_diagnostic()?),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted; stopping child");
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "Failed to kill child process");
            }
            None
        }
    };
    server.shutdown().await;

    let code = status.and_then(|s| s.code()).unwrap_or(130);
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}

async fn request(app: &App, cmd: RequestCommand) -> Result<ExitCode> {
    let manager = app.requests();
    match cmd {
        RequestCommand::Submit {
            identity,
            justification,
            duration_secs,
        } => print_json(
            &manager
                .submit(NewAccessRequest {
                    requester: identity.user,
                    profile: identity.profile,
                    justification,
                    duration: Duration::from_secs(duration_secs),
                })
                .await?,
        )?,
        RequestCommand::Approve {
            id,
            approver,
            comment,
        } => print_json(&manager.approve(&id, &approver, comment).await?)?,
        RequestCommand::Deny {
            id,
            approver,
            comment,
        } => print_json(&manager.deny(&id, &approver, comment).await?)?,
        RequestCommand::Cancel { id, user } => print_json(&manager.cancel(&id, &user).await?)?,
        RequestCommand::List { requester: Some(r) } => {
            print_json(&manager.list_for_requester(&r, DEFAULT_LIST_LIMIT).await?)?
        }
        RequestCommand::List { requester: None } => {
            print_json(&manager.list_pending(DEFAULT_LIST_LIMIT).await?)?
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn break_glass(app: &App, cmd: BreakGlassCommand) -> Result<ExitCode> {
    let manager = app.break_glass();
    match cmd {
        BreakGlassCommand::Invoke {
            identity,
            reason,
            justification,
            duration_secs,
            request_id,
        } => print_json(
            &manager
                .invoke(Invocation {
                    invoker: identity.user,
                    profile: identity.profile,
                    reason_code: reason,
                    justification,
                    duration: Duration::from_secs(duration_secs),
                    request_id,
                })
                .await?,
        )?,
        BreakGlassCommand::Close { id, user, reason } => {
            print_json(&manager.close(&id, &user, &reason).await?)?
        }
        BreakGlassCommand::List { invoker: Some(i) } => {
            print_json(&manager.list_for_invoker(&i, DEFAULT_LIST_LIMIT).await?)?
        }
        BreakGlassCommand::List { invoker: None } => {
            print_json(&manager.list_active(DEFAULT_LIST_LIMIT).await?)?
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn session(app: &App, cmd: SessionCommand) -> Result<ExitCode> {
    let tracker = app.tracker();
    match cmd {
        SessionCommand::List {
            user,
            profile,
            device_id,
        } => {
            let sessions = match (user, profile, device_id) {
                (Some(u), _, _) => tracker.list_for_user(&u, DEFAULT_LIST_LIMIT).await?,
                (None, Some(p), _) => tracker.list_for_profile(&p, DEFAULT_LIST_LIMIT).await?,
                (None, None, Some(d)) => tracker.list_for_device(&d, DEFAULT_LIST_LIMIT).await?,
                (None, None, None) => tracker.list_active(DEFAULT_LIST_LIMIT).await?,
            };
            print_json(&sessions)?;
        }
        SessionCommand::Revoke { id, user, reason } => {
            print_json(&tracker.revoke(&id, &user, &reason).await?)?
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).into_diagnostic()?);
    Ok(())
}
