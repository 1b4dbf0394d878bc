//! CLI entry point for `graphmail`.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Args, CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{json, Value};

use graphmail::auth::{self, AuthManager, LoginMethod};
use graphmail::config::{self, Config};
use graphmail::error::GraphMailError;
use graphmail::folders::{self, FolderSelector, DEFAULT_FOLDER_ROOT};
use graphmail::graph::{DraftRequest, GraphClient, MailboxApi, MessageQuery};
use graphmail::model::message::parse_select_fields;
use graphmail::output::{self, OutputFormat};
use graphmail::sync::{self, NewOptions, RecentOptions, StreamTarget};
use graphmail::{download, mail};

/// Default cap on folders visited by `folders tree`.
const DEFAULT_MAX_FOLDER_NODES: usize = 5000;

#[derive(Parser)]
#[command(
    name = "graphmail",
    version,
    about = "Outlook mailbox client for agents: mail, folders, and resumable attachment sync"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (json, text)
    #[arg(long, global = true, value_name = "FORMAT")]
    format: Option<String>,

    /// Profile name; isolates tokens and sync state
    #[arg(long, global = true)]
    profile: Option<String>,

    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true, env = "GRAPHMAIL_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Authentication operations
    Auth {
        #[command(subcommand)]
        action: AuthCommand,
    },
    /// Mail operations
    Mail {
        #[command(subcommand)]
        action: MailCommand,
    },
    /// Folder discovery operations
    Folders {
        #[command(subcommand)]
        action: FoldersCommand,
    },
    /// Attachment operations
    Attachments {
        #[command(subcommand)]
        action: AttachmentsCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate a man page
    Manpage,
}

#[derive(Subcommand)]
enum AuthCommand {
    /// Sign in with the browser or device-code flow
    Login {
        #[arg(long, value_enum, default_value_t = LoginMethod::Browser)]
        method: LoginMethod,
    },
    /// Show auth status
    Status,
    /// Clear cached auth for a profile
    Logout,
    /// Return deterministic onboarding steps for agent-driven setup
    Onboard {
        #[arg(long)]
        client_id: Option<String>,
        #[arg(long)]
        tenant_id: Option<String>,
        #[arg(long)]
        redirect_uri: Option<String>,
        #[arg(long)]
        scopes: Option<String>,
        #[arg(long, value_enum, default_value_t = LoginMethod::Browser)]
        method: LoginMethod,
    },
}

/// Folder selector shared by folder-scoped commands.
#[derive(Args, Clone)]
struct FolderArgs {
    /// Well-known folder name
    #[arg(long, default_value = DEFAULT_FOLDER_ROOT)]
    folder: String,
    /// Folder id (takes precedence over --folder-path and --folder)
    #[arg(long)]
    folder_id: Option<String>,
    /// Slash-delimited display-name path under the Inbox, e.g. /Clients/Acme
    #[arg(long)]
    folder_path: Option<String>,
    /// Include hidden folders when walking --folder-path
    #[arg(long)]
    include_hidden_folders: bool,
}

impl FolderArgs {
    fn selector(&self) -> FolderSelector {
        FolderSelector {
            folder: Some(self.folder.clone()),
            folder_id: self.folder_id.clone(),
            folder_path: self.folder_path.clone(),
            include_hidden: self.include_hidden_folders,
        }
    }
}

#[derive(Subcommand)]
enum MailCommand {
    /// List messages
    List {
        #[command(flatten)]
        folder: FolderArgs,
        #[arg(long)]
        unread_only: bool,
        #[arg(long, default_value_t = 10)]
        top: usize,
        /// Comma-separated Graph message fields
        #[arg(long, default_value = "")]
        select: String,
    },
    /// Get one message
    Get {
        #[arg(long)]
        message_id: String,
    },
    /// Mark a message read or unread
    Mark {
        #[arg(long)]
        message_id: String,
        /// true or false
        #[arg(long)]
        read: String,
    },
    /// Create an email draft
    Draft {
        /// Recipient(s), comma or semicolon separated
        #[arg(long, required = true, num_args = 1..)]
        to: Vec<String>,
        #[arg(long)]
        subject: String,
        #[arg(long, default_value = "")]
        body: String,
        #[arg(long)]
        body_file: Option<PathBuf>,
        #[arg(long, default_value = "Text", value_parser = ["Text", "HTML"])]
        body_content_type: String,
    },
    /// Send an existing draft
    SendDraft {
        #[arg(long)]
        message_id: String,
        #[arg(long)]
        confirm_send: bool,
    },
}

#[derive(Subcommand)]
enum FoldersCommand {
    /// Return the folder tree and a flat index
    Tree {
        #[arg(long, default_value = DEFAULT_FOLDER_ROOT)]
        root: String,
        #[arg(long)]
        include_hidden: bool,
        #[arg(long, default_value_t = DEFAULT_MAX_FOLDER_NODES)]
        max_nodes: usize,
    },
}

#[derive(Subcommand)]
enum AttachmentsCommand {
    /// List message attachments
    List {
        #[arg(long)]
        message_id: String,
    },
    /// Download one attachment
    Download {
        #[arg(long)]
        message_id: String,
        #[arg(long)]
        attachment_id: String,
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Download all attachments of one message
    DownloadAll {
        #[arg(long)]
        message_id: String,
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Download attachments from the latest emails in a folder
    DownloadRecent {
        #[command(flatten)]
        folder: FolderArgs,
        #[arg(long)]
        top: Option<usize>,
        #[arg(long)]
        unread_only: bool,
        #[arg(long)]
        output_dir: Option<PathBuf>,
        #[arg(long)]
        force_redownload: bool,
    },
    /// Download only attachments not yet recorded in the local ledger
    DownloadNew {
        #[command(flatten)]
        folder: FolderArgs,
        #[arg(long)]
        output_dir: Option<PathBuf>,
        #[arg(long, allow_hyphen_values = true)]
        overlap_hours: Option<i64>,
        #[arg(long)]
        max_pages: Option<usize>,
        #[arg(long)]
        max_messages: Option<usize>,
    },
    /// Inspect or reset attachment download state
    State {
        #[command(subcommand)]
        action: StateCommand,
    },
}

#[derive(Subcommand)]
enum StateCommand {
    /// Show state for one folder stream
    Status {
        #[command(flatten)]
        folder: FolderArgs,
    },
    /// Delete state and ledger for one folder stream
    Reset {
        #[command(flatten)]
        folder: FolderArgs,
        #[arg(long)]
        confirm_reset: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Completions { shell } => return plain_exit(cmd_completions(shell)),
        Commands::Manpage => return plain_exit(cmd_manpage()),
        _ => {}
    }

    // Layering: file < environment < flags
    let mut config = config::load_config(cli.config.as_deref());
    config.apply_env();
    if let Some(profile) = cli.profile {
        config.general.profile = profile;
    }
    if let Some(format) = cli.format {
        config.general.format = format;
    }
    let format = OutputFormat::parse(&config.general.format).unwrap_or(OutputFormat::Json);

    let log_level = match cli.verbose {
        0 => config.general.log_level.clone(),
        1 => "info".to_string(),
        2 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    setup_logging(&log_level, &config);

    let result = config
        .validate()
        .map_err(anyhow::Error::from)
        .and_then(|()| dispatch(cli.command, &config));

    let (payload, code) = match result {
        Ok(value) => (output::success(&value), ExitCode::SUCCESS),
        Err(e) => {
            tracing::debug!(error = ?e, "Command failed");
            let kind = e
                .downcast_ref::<GraphMailError>()
                .map_or("Error", GraphMailError::kind);
            (output::failure(kind, &format!("{e:#}")), ExitCode::from(1))
        }
    };
    println!("{}", output::render(&payload, format));
    code
}

fn plain_exit(result: anyhow::Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(1)
        }
    }
}

/// Configure logging: stderr (stdout carries the result) plus a log file.
fn setup_logging(level: &str, config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let log_dir = config::cache_dir(config);
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::never(&log_dir, "graphmail.log");
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
    }
}

/// Generate shell completions and print to stdout.
fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "graphmail", &mut std::io::stdout());
    Ok(())
}

/// Generate a man page and print to stdout.
fn cmd_manpage() -> anyhow::Result<()> {
    let cmd = Cli::command();
    let man = clap_mangen::Man::new(cmd);
    let mut buf = Vec::new();
    man.render(&mut buf)?;
    std::io::Write::write_all(&mut std::io::stdout(), &buf)?;
    Ok(())
}

fn dispatch(command: Commands, config: &Config) -> anyhow::Result<Value> {
    match command {
        Commands::Auth { action } => cmd_auth(action, config),
        Commands::Mail { action } => cmd_mail(action, config),
        Commands::Folders { action } => cmd_folders(action, config),
        Commands::Attachments { action } => cmd_attachments(action, config),
        Commands::Completions { .. } | Commands::Manpage => Ok(Value::Null),
    }
}

fn to_json(value: &impl serde::Serialize) -> anyhow::Result<Value> {
    serde_json::to_value(value).context("Failed to serialize result")
}

fn auth_manager(config: &Config) -> AuthManager {
    AuthManager::new(config, &config::token_dir(config))
}

fn build_client(config: &Config) -> anyhow::Result<GraphClient> {
    config.require_client_id()?;
    Ok(GraphClient::new(
        &config.graph,
        Box::new(auth_manager(config)),
    ))
}

// ── auth ────────────────────────────────────────────────────────

fn cmd_auth(action: AuthCommand, config: &Config) -> anyhow::Result<Value> {
    match action {
        AuthCommand::Login { method } => {
            config.require_client_id()?;
            let notify = |message: &str| eprintln!("{message}");
            to_json(&auth_manager(config).login(method, &notify)?)
        }
        AuthCommand::Status => to_json(&auth_manager(config).status()),
        AuthCommand::Logout => Ok(auth_manager(config).logout()?),
        AuthCommand::Onboard {
            client_id,
            tenant_id,
            redirect_uri,
            scopes,
            method,
        } => {
            let mut config = config.clone();
            let tenant_chosen = tenant_id.is_some()
                || std::env::var("OUTLOOK_TENANT_ID").is_ok_and(|v| !v.trim().is_empty())
                || config.auth.tenant_id != "common";
            if let Some(id) = client_id {
                config.auth.client_id = Some(id);
            }
            if let Some(tenant) = tenant_id {
                config.auth.tenant_id = tenant;
            }
            if let Some(uri) = redirect_uri {
                config.auth.redirect_uri = uri;
            }
            if let Some(raw) = scopes {
                config.auth.scopes = config::normalize_scopes(Some(&raw));
            }
            config.validate()?;
            to_json(&auth::onboarding_plan(
                &config,
                &config::token_dir(&config),
                method,
                tenant_chosen,
            ))
        }
    }
}

// ── mail ────────────────────────────────────────────────────────

fn cmd_mail(action: MailCommand, config: &Config) -> anyhow::Result<Value> {
    match action {
        MailCommand::List {
            folder,
            unread_only,
            top,
            select,
        } => {
            if top == 0 {
                return Err(GraphMailError::InvalidArgument(
                    "--top must be greater than 0".to_string(),
                )
                .into());
            }
            let client = build_client(config)?;
            let resolution = folders::resolve_folder(&client, &folder.selector())?;
            let messages = client.list_messages(&MessageQuery {
                folder: resolution.token.clone(),
                unread_only,
                top,
                select: parse_select_fields(&select),
                ..Default::default()
            })?;

            let mut result = to_json(&resolution)?;
            result["folder"] = json!(folder.folder);
            result["unread_only"] = json!(unread_only);
            result["top"] = json!(top);
            result["count"] = json!(messages.len());
            result["messages"] = to_json(&messages)?;
            Ok(result)
        }
        MailCommand::Get { message_id } => {
            let client = build_client(config)?;
            Ok(json!({ "message": client.get_message(&message_id)? }))
        }
        MailCommand::Mark { message_id, read } => {
            let read = mail::parse_boolean(&read)?;
            let client = build_client(config)?;
            let updated = client.mark_message(&message_id, read)?;
            Ok(json!({
                "message_id": message_id,
                "read": read,
                "updated": updated,
            }))
        }
        MailCommand::Draft {
            to,
            subject,
            body,
            body_file,
            body_content_type,
        } => {
            let recipients = mail::parse_recipients(&to)?;
            let body = mail::read_body(body_file.as_deref(), &body)?;
            let client = build_client(config)?;
            let draft = client.create_draft(&DraftRequest {
                to: recipients.clone(),
                subject,
                body,
                body_content_type,
            })?;
            Ok(json!({
                "message_id": draft.get("id"),
                "subject": draft.get("subject"),
                "to": recipients,
                "is_draft": true,
                "web_link": draft.get("webLink"),
            }))
        }
        MailCommand::SendDraft {
            message_id,
            confirm_send,
        } => {
            mail::require_send_confirmation(confirm_send)?;
            let client = build_client(config)?;
            client.send_draft(&message_id)?;
            Ok(json!({
                "message_id": message_id,
                "sent": true,
                "confirmation": "explicit",
            }))
        }
    }
}

// ── folders ─────────────────────────────────────────────────────

fn cmd_folders(action: FoldersCommand, config: &Config) -> anyhow::Result<Value> {
    let FoldersCommand::Tree {
        root,
        include_hidden,
        max_nodes,
    } = action;
    if max_nodes == 0 {
        return Err(GraphMailError::InvalidArgument(
            "--max-nodes must be greater than 0".to_string(),
        )
        .into());
    }
    let root = match root.trim() {
        "" => DEFAULT_FOLDER_ROOT.to_string(),
        token => token.to_string(),
    };

    let client = build_client(config)?;
    let tree = folders::build_folder_tree(&client, &root, include_hidden, max_nodes)?;
    Ok(json!({
        "root_token": root,
        "include_hidden": include_hidden,
        "max_nodes": max_nodes,
        "count": tree.index.len(),
        "tree": to_json(&tree.tree)?,
        "index": to_json(&tree.index)?,
    }))
}

// ── attachments ─────────────────────────────────────────────────

/// Download directory, created and made absolute.
fn prepare_output_dir(config: &Config, explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    let dir = config::output_dir(config, explicit);
    std::fs::create_dir_all(&dir).map_err(|e| GraphMailError::io(&dir, e))?;
    Ok(std::path::absolute(&dir).unwrap_or(dir))
}

/// Resolve the folder and the signed-in account for a sync stream.
fn stream_target(
    client: &GraphClient,
    folder: &FolderArgs,
    config: &Config,
) -> anyhow::Result<StreamTarget> {
    let resolution = folders::resolve_folder(client, &folder.selector())?;
    let account = client.auth().account()?;
    if account.home_account_id.trim().is_empty() {
        return Err(GraphMailError::Auth(
            "No authenticated account found for this profile. Run auth login first.".to_string(),
        )
        .into());
    }
    Ok(StreamTarget {
        profile: config.general.profile.clone(),
        account_home_id: account.home_account_id,
        folder: resolution,
        state_dir: config::state_dir(config),
    })
}

/// Progress bar on stderr; hidden when stderr is not a terminal.
fn progress_bar(label: &str, unit: &str) -> ProgressBar {
    if !std::io::stderr().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "{{spinner:.green}} {label} [{{bar:40.cyan/blue}}] {{pos}}/{{len}} {unit}"
            ))
            .expect("valid template"),
    );
    pb
}

fn track(pb: &ProgressBar) -> impl Fn(usize, usize) + '_ {
    move |done, total| {
        pb.set_length(total as u64);
        pb.set_position(done as u64);
    }
}

fn cmd_attachments(action: AttachmentsCommand, config: &Config) -> anyhow::Result<Value> {
    match action {
        AttachmentsCommand::List { message_id } => {
            let client = build_client(config)?;
            let attachments = client.list_attachments(&message_id)?;
            Ok(json!({
                "message_id": message_id,
                "count": attachments.len(),
                "attachments": to_json(&attachments)?,
            }))
        }
        AttachmentsCommand::Download {
            message_id,
            attachment_id,
            output_dir,
        } => {
            let client = build_client(config)?;
            let target = prepare_output_dir(config, output_dir.as_deref())?;
            let metadata = client.get_attachment(&message_id, &attachment_id)?;
            let saved = download::download_attachment(
                &client,
                &message_id,
                &attachment_id,
                &target,
                &metadata,
            )?;
            to_json(&saved)
        }
        AttachmentsCommand::DownloadAll {
            message_id,
            output_dir,
        } => {
            let client = build_client(config)?;
            let target = prepare_output_dir(config, output_dir.as_deref())?;
            let pb = progress_bar("Downloading", "attachments");
            let report = download::download_all(&client, &message_id, &target, &track(&pb))?;
            pb.finish_and_clear();
            to_json(&report)
        }
        AttachmentsCommand::DownloadRecent {
            folder,
            top,
            unread_only,
            output_dir,
            force_redownload,
        } => {
            let options = RecentOptions {
                top: top.unwrap_or(config.sync.recent_top),
                unread_only,
                force_redownload,
            };
            options.validate()?;
            let client = build_client(config)?;
            let target = stream_target(&client, &folder, config)?;
            let output = prepare_output_dir(config, output_dir.as_deref())?;

            let pb = progress_bar("Scanning", "messages");
            let summary = sync::run_recent(&client, &target, &output, &options, &track(&pb))?;
            pb.finish_and_clear();
            to_json(&summary)
        }
        AttachmentsCommand::DownloadNew {
            folder,
            output_dir,
            overlap_hours,
            max_pages,
            max_messages,
        } => {
            let options = NewOptions {
                overlap_hours: overlap_hours.unwrap_or(config.sync.overlap_hours),
                max_pages: max_pages.unwrap_or(config.sync.max_pages),
                max_messages: max_messages.unwrap_or(config.sync.max_messages),
            };
            options.validate()?;
            let client = build_client(config)?;
            let target = stream_target(&client, &folder, config)?;
            let output = prepare_output_dir(config, output_dir.as_deref())?;

            let pb = progress_bar("Scanning", "messages");
            let summary = sync::run_new(&client, &target, &output, &options, &track(&pb))?;
            pb.finish_and_clear();
            to_json(&summary)
        }
        AttachmentsCommand::State { action } => match action {
            StateCommand::Status { folder } => {
                let client = build_client(config)?;
                let target = stream_target(&client, &folder, config)?;
                to_json(&sync::stream_status(&target)?)
            }
            StateCommand::Reset {
                folder,
                confirm_reset,
            } => {
                if !confirm_reset {
                    return Err(GraphMailError::InvalidArgument(
                        "state reset requires --confirm-reset".to_string(),
                    )
                    .into());
                }
                let client = build_client(config)?;
                let target = stream_target(&client, &folder, config)?;
                to_json(&sync::reset_stream(&target, confirm_reset)?)
            }
        },
    }
}
