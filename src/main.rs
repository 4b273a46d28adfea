use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use wait_timeout::ChildExt;

const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");
const LOG_FILE_NAME: &str = "sundown.log";
const SESSION_STATE_LOGGED_OUT: &str = "logged_out";
const SESSION_STATE_RESTART: &str = "restart";

#[derive(Parser, Debug)]
#[command(name = "sundown", version, about = "Logout-time automation agent")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Process logout items now. Intended to be invoked by the OS logout hook.
    Logout,
    /// Create the drop directories, share directory, and log root.
    Init,
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    Ignore {
        #[command(subcommand)]
        command: IgnoreCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Validate,
}

#[derive(Subcommand, Debug)]
enum IgnoreCommand {
    Add { user: String },
    Remove { user: String },
    List,
}

#[derive(Debug, Error)]
enum SundownError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("process error: {0}")]
    Process(String),
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct Config {
    version: u32,
    paths: Paths,
    tools: Tools,
    install: Install,
    execution: Execution,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct Paths {
    share_root: String,
    log_root: String,
    ledger_path: String,
    preferences_path: String,
    login_state_path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct Tools {
    installer: String,
    hdiutil: String,
    profiles: String,
    last: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct Install {
    target_volume: String,
    detach_delay_sec: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct Execution {
    tool_timeout_sec: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            paths: Paths::default(),
            tools: Tools::default(),
            install: Install::default(),
            execution: Execution::default(),
        }
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            share_root: "/usr/local/sundown".to_string(),
            log_root: "/var/log/sundown".to_string(),
            ledger_path: "/usr/local/sundown/share/run_once.json".to_string(),
            preferences_path: "/usr/local/sundown/share/preferences.json".to_string(),
            login_state_path: "/usr/local/sundown/share/login_state.json".to_string(),
        }
    }
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            installer: "installer".to_string(),
            hdiutil: "hdiutil".to_string(),
            profiles: "profiles".to_string(),
            last: "last".to_string(),
        }
    }
}

impl Default for Install {
    fn default() -> Self {
        Self {
            target_volume: "/".to_string(),
            detach_delay_sec: 5,
        }
    }
}

impl Default for Execution {
    fn default() -> Self {
        Self { tool_timeout_sec: 0 }
    }
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
}

#[derive(Debug)]
struct Context {
    config_path: PathBuf,
    json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemKind {
    Package,
    DiskImage,
    Profile,
    Script,
}

impl ItemKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Package => "package",
            Self::DiskImage => "disk-image",
            Self::Profile => "profile",
            Self::Script => "script",
        }
    }
}

// Packages and disk images install before profiles, profiles before scripts.
const EXECUTION_ORDER: [&[ItemKind]; 3] = [
    &[ItemKind::Package, ItemKind::DiskImage],
    &[ItemKind::Profile],
    &[ItemKind::Script],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
enum Ineligible {
    #[error("owner uid {0} is not the superuser")]
    NotRootOwned(u32),
    #[error("world-writable")]
    WorldWritable,
    #[error("not world-executable")]
    NotWorldExecutable,
}

#[derive(Debug, Clone)]
struct Item {
    path: PathBuf,
    kind: ItemKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassMode {
    Every,
    Once,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
struct PassSummary {
    succeeded: usize,
    failed: usize,
    skipped_ineligible: usize,
    already_ran: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionKind {
    User(String),
    Reboot,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SessionRecord {
    kind: SessionKind,
    end: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InvocationContext {
    GenuineLogout,
    RebootAfterLogout,
    RebootNotLogout,
}

impl InvocationContext {
    fn as_str(&self) -> &'static str {
        match self {
            Self::GenuineLogout => "genuine_logout",
            Self::RebootAfterLogout => "reboot_after_logout",
            Self::RebootNotLogout => "reboot_not_logout",
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Self::GenuineLogout => "genuine logout",
            Self::RebootAfterLogout => "reboot following a logout",
            Self::RebootNotLogout => "reboot without a matching logout",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
struct LoginState {
    last_user_name: String,
    last_session_state: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
struct Preferences {
    ignored_users: Vec<String>,
}

impl Preferences {
    fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(prefs) => prefs,
                Err(err) => {
                    warn!(
                        "preferences at {} are unreadable, starting empty: {err}",
                        path.display()
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => Self::default(),
            Err(err) => {
                warn!(
                    "could not read preferences at {}, starting empty: {err}",
                    path.display()
                );
                Self::default()
            }
        }
    }

    fn save(&self, path: &Path) -> Result<(), SundownError> {
        write_atomic_json(path, self)
    }

    fn add_ignored_user(&mut self, user: &str) -> bool {
        if self.is_ignored(user) {
            return false;
        }
        self.ignored_users.push(user.to_string());
        true
    }

    fn remove_ignored_user(&mut self, user: &str) -> bool {
        let before = self.ignored_users.len();
        self.ignored_users.retain(|name| name != user);
        self.ignored_users.len() != before
    }

    fn is_ignored(&self, user: &str) -> bool {
        self.ignored_users.iter().any(|name| name == user)
    }
}

#[derive(Debug, Default)]
struct RunOnceLedger {
    entries: BTreeMap<String, DateTime<Utc>>,
    dirty: bool,
}

impl RunOnceLedger {
    fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(entries) => Self {
                    entries,
                    dirty: false,
                },
                Err(err) => {
                    warn!(
                        "run-once ledger at {} is unreadable, starting empty: {err}",
                        path.display()
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => Self::default(),
            Err(err) => {
                warn!(
                    "could not read run-once ledger at {}, starting empty: {err}",
                    path.display()
                );
                Self::default()
            }
        }
    }

    fn should_run(&self, item_path: &Path) -> bool {
        !self.entries.contains_key(&ledger_key(item_path))
    }

    fn record_success(&mut self, item_path: &Path, when: DateTime<Utc>) {
        self.entries.insert(ledger_key(item_path), when);
        self.dirty = true;
    }

    // Entries are never removed here; clearing one is an explicit operator
    // action on the document itself.
    fn save_if_dirty(&self, path: &Path) -> Result<bool, SundownError> {
        if !self.dirty {
            return Ok(false);
        }
        write_atomic_json(path, &self.entries)?;
        Ok(true)
    }
}

fn ledger_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[derive(Debug, Clone)]
struct CommandOutput {
    status_code: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    timed_out: bool,
}

impl CommandOutput {
    fn from_output(output: std::process::Output) -> Self {
        let status_code = output
            .status
            .code()
            .unwrap_or(if output.status.success() { 0 } else { 1 });
        Self {
            status_code,
            stdout: output.stdout,
            stderr: output.stderr,
            timed_out: false,
        }
    }

    fn success(&self) -> bool {
        self.status_code == 0
    }

    fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

trait ToolRunner {
    fn run(&self, program: &Path, args: &[String]) -> Result<CommandOutput, io::Error>;
}

struct SystemToolRunner {
    timeout: Option<Duration>,
}

impl SystemToolRunner {
    fn from_config(cfg: &Config) -> Self {
        let timeout = if cfg.execution.tool_timeout_sec == 0 {
            None
        } else {
            Some(Duration::from_secs(cfg.execution.tool_timeout_sec))
        };
        Self { timeout }
    }
}

impl ToolRunner for SystemToolRunner {
    fn run(&self, program: &Path, args: &[String]) -> Result<CommandOutput, io::Error> {
        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null());

        let Some(timeout) = self.timeout else {
            let output = cmd.output()?;
            return Ok(CommandOutput::from_output(output));
        };

        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = cmd.spawn()?;
        // Drain the pipes from separate threads so a chatty child cannot
        // deadlock against a full pipe while we wait on it.
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_handle = thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(mut stream) = stdout {
                let _ = stream.read_to_end(&mut buf);
            }
            buf
        });
        let stderr_handle = thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(mut stream) = stderr {
                let _ = stream.read_to_end(&mut buf);
            }
            buf
        });

        let mut timed_out = false;
        let status = match child.wait_timeout(timeout)? {
            Some(status) => status,
            None => {
                timed_out = true;
                child.kill()?;
                child.wait()?
            }
        };
        let stdout = stdout_handle.join().unwrap_or_default();
        let stderr = stderr_handle.join().unwrap_or_default();
        let status_code = status
            .code()
            .unwrap_or(if status.success() { 0 } else { 1 });
        Ok(CommandOutput {
            status_code,
            stdout,
            stderr,
            timed_out,
        })
    }
}

fn main() -> Result<(), SundownError> {
    let cli = Cli::parse();
    let ctx = build_context(&cli);

    let result = dispatch(&ctx, cli.command);

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{err}");
        }
        std::process::exit(1);
    }

    Ok(())
}

fn dispatch(ctx: &Context, command: Commands) -> Result<(), SundownError> {
    match command {
        Commands::Logout => {
            let cfg = load_config(&ctx.config_path)?;
            init_logging(Some(&log_file_path(&cfg)));
            let runner = SystemToolRunner::from_config(&cfg);
            handle_logout(ctx, &cfg, &runner)
        }
        Commands::Init => {
            let cfg = load_config(&ctx.config_path)?;
            init_logging(None);
            handle_init(ctx, &cfg)
        }
        Commands::Config { command } => {
            init_logging(None);
            handle_config(ctx, command)
        }
        Commands::Ignore { command } => {
            let cfg = load_config(&ctx.config_path)?;
            init_logging(None);
            handle_ignore(ctx, &cfg, command)
        }
    }
}

fn build_context(cli: &Cli) -> Context {
    Context {
        config_path: resolve_config_path(cli.config.as_ref()),
        json: cli.json,
    }
}

fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("SUNDOWN_CONFIG") {
        return PathBuf::from(path);
    }
    default_config_dir().join("config.yaml")
}

fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("SUNDOWN_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("sundown");
    base
}

fn load_config(path: &Path) -> Result<Config, SundownError> {
    if !path.exists() {
        return Ok(Config::default());
    }
    read_config(path)
}

fn read_config(path: &Path) -> Result<Config, SundownError> {
    let content = fs::read_to_string(path)?;
    read_config_from_str(&content)
}

fn read_config_from_str(content: &str) -> Result<Config, SundownError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    if cfg.version != 1 {
        return Err(SundownError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    Ok(cfg)
}

fn init_logging(log_file: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if let Some(path) = log_file {
        if ensure_parent(path).is_ok() {
            if let Ok(file) = fs::OpenOptions::new().create(true).append(true).open(path) {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .init();
                return;
            }
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
    if let Some(path) = log_file {
        warn!("log file {} is not writable, logging to stderr", path.display());
    }
}

fn handle_logout(
    ctx: &Context,
    cfg: &Config,
    runner: &dyn ToolRunner,
) -> Result<(), SundownError> {
    let history = match query_login_history(cfg, runner) {
        Ok(records) => records,
        Err(err) => {
            warn!("login history unavailable, treating invocation as a reboot: {err}");
            Vec::new()
        }
    };
    let context = classify_invocation(&history);
    if context != InvocationContext::GenuineLogout {
        info!("{}, skipping logout items", context.describe());
        return output(ctx, json!({ "ran": false, "reason": context.as_str() }));
    }

    let Some(state) = read_login_state(&login_state_path(cfg)) else {
        warn!("login state unavailable, skipping logout items");
        return output(ctx, json!({ "ran": false, "reason": "login_state_unavailable" }));
    };
    if state.last_session_state != SESSION_STATE_LOGGED_OUT
        && state.last_session_state != SESSION_STATE_RESTART
    {
        info!(
            "last session for {} is {:?}, not a completed logout, skipping",
            state.last_user_name, state.last_session_state
        );
        return output(ctx, json!({ "ran": false, "reason": "session_still_active" }));
    }
    let prefs = Preferences::load(&preferences_path(cfg));
    if prefs.is_ignored(&state.last_user_name) {
        info!("{} is on the ignore list, skipping logout items", state.last_user_name);
        return output(ctx, json!({ "ran": false, "reason": "user_ignored" }));
    }

    info!("processing logout items for {}", state.last_user_name);
    let every = process_logout_directory(cfg, runner, &logout_every_dir(cfg), PassMode::Every, None)?;

    let ledger_path = run_once_ledger_path(cfg);
    let mut ledger = RunOnceLedger::load(&ledger_path);
    let once = process_logout_directory(
        cfg,
        runner,
        &logout_once_dir(cfg),
        PassMode::Once,
        Some(&mut ledger),
    )?;
    if ledger.save_if_dirty(&ledger_path)? {
        info!("run-once ledger updated at {}", ledger_path.display());
    }

    output(
        ctx,
        json!({
            "ran": true,
            "user": state.last_user_name,
            "every": every,
            "once": once,
        }),
    )
}

fn handle_init(ctx: &Context, cfg: &Config) -> Result<(), SundownError> {
    let every = logout_every_dir(cfg);
    let once = logout_once_dir(cfg);
    let log_root = PathBuf::from(expand_path(&cfg.paths.log_root));
    fs::create_dir_all(&every)?;
    fs::create_dir_all(&once)?;
    fs::create_dir_all(&log_root)?;
    ensure_parent(&run_once_ledger_path(cfg))?;
    ensure_parent(&preferences_path(cfg))?;
    output(
        ctx,
        json!({
            "logout_every": every,
            "logout_once": once,
            "log_root": log_root,
        }),
    )
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), SundownError> {
    match command {
        ConfigCommand::Init => {
            if ctx.config_path.exists() {
                return output(ctx, json!({ "path": ctx.config_path, "created": false }));
            }
            ensure_parent(&ctx.config_path)?;
            fs::write(&ctx.config_path, DEFAULT_CONFIG_YAML)?;
            output(ctx, json!({ "path": ctx.config_path, "created": true }))
        }
        ConfigCommand::Validate => {
            let _cfg = read_config(&ctx.config_path)?;
            output(ctx, json!({ "path": ctx.config_path, "valid": true }))
        }
    }
}

fn handle_ignore(ctx: &Context, cfg: &Config, command: IgnoreCommand) -> Result<(), SundownError> {
    let path = preferences_path(cfg);
    match command {
        IgnoreCommand::Add { user } => {
            let mut prefs = Preferences::load(&path);
            let added = prefs.add_ignored_user(&user);
            if added {
                prefs.save(&path)?;
            }
            output(
                ctx,
                json!({ "user": user, "added": added, "ignored_users": prefs.ignored_users }),
            )
        }
        IgnoreCommand::Remove { user } => {
            let mut prefs = Preferences::load(&path);
            let removed = prefs.remove_ignored_user(&user);
            if removed {
                prefs.save(&path)?;
            }
            output(
                ctx,
                json!({ "user": user, "removed": removed, "ignored_users": prefs.ignored_users }),
            )
        }
        IgnoreCommand::List => {
            let prefs = Preferences::load(&path);
            if ctx.json {
                return output(ctx, json!({ "ignored_users": prefs.ignored_users }));
            }
            for user in &prefs.ignored_users {
                println!("{user}");
            }
            Ok(())
        }
    }
}

fn query_login_history(
    cfg: &Config,
    runner: &dyn ToolRunner,
) -> Result<Vec<SessionRecord>, String> {
    let last = resolve_tool(&cfg.tools.last)?;
    let output = runner
        .run(&last, &[])
        .map_err(|err| format!("failed to run {}: {err}", last.display()))?;
    if !output.success() {
        return Err(format!(
            "{} exited with status {}: {}",
            last.display(),
            output.status_code,
            output.stderr_text()
        ));
    }
    Ok(parse_login_history(&output.stdout_text()))
}

fn parse_login_history(text: &str) -> Vec<SessionRecord> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| {
            let lower = line.to_lowercase();
            !lower.starts_with("wtmp") && !lower.starts_with("btmp") && !lower.starts_with("utx")
        })
        .take(3)
        .filter_map(parse_session_line)
        .collect()
}

fn parse_session_line(line: &str) -> Option<SessionRecord> {
    let first = line.split_whitespace().next()?;
    let kind = match first {
        "reboot" => SessionKind::Reboot,
        "shutdown" => SessionKind::Shutdown,
        name => SessionKind::User(name.to_string()),
    };
    // A user session line carries "start - end"; the end field is the
    // session boundary. Reboot and shutdown lines carry a single event
    // time, which plays the same boundary role.
    let end = if let Some(idx) = line.find(" - ") {
        let rest = line[idx + 3..].trim_start();
        if rest.starts_with("still") {
            None
        } else {
            rest.split_whitespace().next().map(|token| token.to_string())
        }
    } else {
        line.split_whitespace().last().map(|token| token.to_string())
    };
    Some(SessionRecord { kind, end })
}

fn classify_invocation(records: &[SessionRecord]) -> InvocationContext {
    let Some(r0) = records.first() else {
        // No usable history: fail safe and skip.
        return InvocationContext::RebootNotLogout;
    };
    if r0.kind != SessionKind::Reboot {
        return InvocationContext::GenuineLogout;
    }
    let r1 = records.get(1);
    let r2 = records.get(2);

    // A reboot on top of history can still be a genuine logout when the
    // record below it shares a session boundary with the most recent real
    // user session.
    if let (Some(r1), Some(r2)) = (r1, r2) {
        if r1.kind == SessionKind::Shutdown
            && matches!(r2.kind, SessionKind::User(_))
            && r1.end.is_some()
            && r1.end == r2.end
        {
            return InvocationContext::GenuineLogout;
        }
    }
    if let Some(r1) = r1 {
        if matches!(r1.kind, SessionKind::User(_)) && r0.end.is_some() && r0.end == r1.end {
            return InvocationContext::GenuineLogout;
        }
    }

    let saw_user = r1.is_some_and(|r| matches!(r.kind, SessionKind::User(_)))
        || r2.is_some_and(|r| matches!(r.kind, SessionKind::User(_)));
    if saw_user {
        InvocationContext::RebootAfterLogout
    } else {
        InvocationContext::RebootNotLogout
    }
}

fn read_login_state(path: &Path) -> Option<LoginState> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) => {
            warn!("could not read login state at {}: {err}", path.display());
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(state) => Some(state),
        Err(err) => {
            warn!("could not parse login state at {}: {err}", path.display());
            None
        }
    }
}

fn process_logout_directory(
    cfg: &Config,
    runner: &dyn ToolRunner,
    dir: &Path,
    mode: PassMode,
    ledger: Option<&mut RunOnceLedger>,
) -> Result<PassSummary, SundownError> {
    if !dir.is_dir() {
        return Err(SundownError::Config(format!(
            "logout directory missing: {}",
            dir.display()
        )));
    }
    let mut summary = PassSummary::default();
    let mut discovered: Vec<(String, PathBuf, fs::Metadata)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let metadata = entry.metadata()?;
        discovered.push((name, entry.path(), metadata));
    }
    discovered.sort_by(|a, b| a.0.cmp(&b.0));

    let mut items = Vec::new();
    for (name, path, metadata) in discovered {
        let kind = classify_item(&name);
        let (uid, mode_bits) = owner_and_mode(&metadata);
        match item_eligibility(kind, uid, mode_bits) {
            Ok(()) => items.push(Item { path, kind }),
            Err(reason) => {
                warn!("skipping {} ({}): {reason}", path.display(), kind.as_str());
                summary.skipped_ineligible += 1;
            }
        }
    }

    execute_pass(cfg, runner, &items, mode, ledger, &mut summary);
    Ok(summary)
}

fn execute_pass(
    cfg: &Config,
    runner: &dyn ToolRunner,
    items: &[Item],
    mode: PassMode,
    mut ledger: Option<&mut RunOnceLedger>,
    summary: &mut PassSummary,
) {
    for group in EXECUTION_ORDER {
        for item in items.iter().filter(|item| group.contains(&item.kind)) {
            if mode == PassMode::Once {
                if let Some(ledger) = ledger.as_deref_mut() {
                    if !ledger.should_run(&item.path) {
                        info!("{} already ran, skipping", item.path.display());
                        summary.already_ran += 1;
                        continue;
                    }
                }
            }
            match execute_item(cfg, runner, item) {
                Outcome::Succeeded => {
                    summary.succeeded += 1;
                    if mode == PassMode::Once {
                        if let Some(ledger) = ledger.as_deref_mut() {
                            ledger.record_success(&item.path, Utc::now());
                        }
                    }
                }
                Outcome::Failed => summary.failed += 1,
            }
        }
    }
}

fn execute_item(cfg: &Config, runner: &dyn ToolRunner, item: &Item) -> Outcome {
    info!("processing {} ({})", item.path.display(), item.kind.as_str());
    match item.kind {
        ItemKind::Package => install_package_file(cfg, runner, &item.path),
        ItemKind::DiskImage => install_disk_image(cfg, runner, item),
        ItemKind::Profile => install_profile(cfg, runner, item),
        ItemKind::Script => run_script(runner, item),
    }
}

fn classify_item(name: &str) -> ItemKind {
    let extension = Path::new(name)
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase());
    match extension.as_deref() {
        Some("pkg") | Some("mpkg") => ItemKind::Package,
        Some("dmg") => ItemKind::DiskImage,
        Some("mobileconfig") => ItemKind::Profile,
        _ => ItemKind::Script,
    }
}

fn item_eligibility(kind: ItemKind, uid: u32, mode: u32) -> Result<(), Ineligible> {
    if uid != 0 {
        return Err(Ineligible::NotRootOwned(uid));
    }
    if mode & 0o002 != 0 {
        return Err(Ineligible::WorldWritable);
    }
    match kind {
        // Installed, not executed: no execute bit required.
        ItemKind::Package | ItemKind::DiskImage | ItemKind::Profile => Ok(()),
        ItemKind::Script => {
            if mode & 0o001 != 0 {
                Ok(())
            } else {
                Err(Ineligible::NotWorldExecutable)
            }
        }
    }
}

#[cfg(unix)]
fn owner_and_mode(metadata: &fs::Metadata) -> (u32, u32) {
    use std::os::unix::fs::MetadataExt;
    (metadata.uid(), metadata.mode())
}

#[cfg(not(unix))]
fn owner_and_mode(_metadata: &fs::Metadata) -> (u32, u32) {
    (u32::MAX, 0)
}

fn install_package_file(cfg: &Config, runner: &dyn ToolRunner, pkg_path: &Path) -> Outcome {
    let installer = match resolve_tool(&cfg.tools.installer) {
        Ok(path) => path,
        Err(err) => {
            error!("cannot install {}: {err}", pkg_path.display());
            return Outcome::Failed;
        }
    };
    let args = vec![
        "-pkg".to_string(),
        pkg_path.to_string_lossy().to_string(),
        "-target".to_string(),
        cfg.install.target_volume.clone(),
    ];
    let out = match runner.run(&installer, &args) {
        Ok(out) => out,
        Err(err) => {
            error!("failed to launch installer for {}: {err}", pkg_path.display());
            return Outcome::Failed;
        }
    };
    if !out.success() {
        error!(
            "install of {} failed with status {}{}: {}",
            pkg_path.display(),
            out.status_code,
            timeout_note(&out),
            out.stderr_text()
        );
        return Outcome::Failed;
    }
    let stderr = out.stderr_text();
    if !stderr.is_empty() {
        warn!("installer reported warnings for {}: {stderr}", pkg_path.display());
    }
    info!("installed {}", pkg_path.display());
    Outcome::Succeeded
}

fn install_disk_image(cfg: &Config, runner: &dyn ToolRunner, item: &Item) -> Outcome {
    let hdiutil = match resolve_tool(&cfg.tools.hdiutil) {
        Ok(path) => path,
        Err(err) => {
            error!("cannot attach {}: {err}", item.path.display());
            return Outcome::Failed;
        }
    };
    let attach_args = vec![
        "attach".to_string(),
        "-nobrowse".to_string(),
        "-readonly".to_string(),
        item.path.to_string_lossy().to_string(),
    ];
    let attached = match runner.run(&hdiutil, &attach_args) {
        Ok(out) => out,
        Err(err) => {
            error!("failed to launch attach for {}: {err}", item.path.display());
            return Outcome::Failed;
        }
    };
    if !attached.success() {
        error!(
            "failed to attach {} (status {}{}): {}",
            item.path.display(),
            attached.status_code,
            timeout_note(&attached),
            attached.stderr_text()
        );
        return Outcome::Failed;
    }
    let Some(mount_point) = parse_mount_point(&attached.stdout_text()) else {
        error!("could not determine mount point for {}", item.path.display());
        return Outcome::Failed;
    };

    let result = match find_nested_package(Path::new(&mount_point)) {
        Ok(Some(pkg)) => install_package_file(cfg, runner, &pkg),
        Ok(None) => {
            error!("{} contains no installable package", item.path.display());
            Outcome::Failed
        }
        Err(err) => {
            error!("could not read mounted volume {mount_point}: {err}");
            Outcome::Failed
        }
    };

    // The installer may still hold files open inside the volume.
    if cfg.install.detach_delay_sec > 0 {
        thread::sleep(Duration::from_secs(cfg.install.detach_delay_sec));
    }
    match runner.run(&hdiutil, &["detach".to_string(), mount_point.clone()]) {
        Ok(out) if out.success() => {}
        Ok(out) => warn!("failed to detach {mount_point}: {}", out.stderr_text()),
        Err(err) => warn!("failed to launch detach for {mount_point}: {err}"),
    }
    result
}

fn parse_mount_point(stdout: &str) -> Option<String> {
    let line = stdout.lines().rev().find(|line| !line.trim().is_empty())?;
    let field = line.rsplit('\t').next().unwrap_or(line).trim();
    if field.is_empty() {
        return None;
    }
    Some(field.to_string())
}

fn find_nested_package(mount_point: &Path) -> Result<Option<PathBuf>, io::Error> {
    let mut matches: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(mount_point)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_lowercase();
        if name.ends_with(".pkg") || name.ends_with(".mpkg") {
            matches.push(entry.path());
        }
    }
    matches.sort();
    if matches.len() > 1 {
        warn!(
            "{} contains {} packages, installing {}",
            mount_point.display(),
            matches.len(),
            matches[0].display()
        );
    }
    Ok(matches.into_iter().next())
}

fn install_profile(cfg: &Config, runner: &dyn ToolRunner, item: &Item) -> Outcome {
    let profiles = match resolve_tool(&cfg.tools.profiles) {
        Ok(path) => path,
        Err(err) => {
            error!("cannot install profile {}: {err}", item.path.display());
            return Outcome::Failed;
        }
    };
    let args = vec![
        "-I".to_string(),
        "-F".to_string(),
        item.path.to_string_lossy().to_string(),
    ];
    match runner.run(&profiles, &args) {
        Err(err) => {
            error!(
                "failed to launch profile installer for {}: {err}",
                item.path.display()
            );
            Outcome::Failed
        }
        Ok(out) => {
            // The profile tool reports failures on stderr rather than its
            // exit status.
            let stderr = out.stderr_text();
            if !stderr.is_empty() {
                error!("profile install of {} failed: {stderr}", item.path.display());
                return Outcome::Failed;
            }
            info!("installed profile {}", item.path.display());
            Outcome::Succeeded
        }
    }
}

fn run_script(runner: &dyn ToolRunner, item: &Item) -> Outcome {
    match runner.run(&item.path, &[]) {
        Err(err) => {
            error!("failed to launch {}: {err}", item.path.display());
            Outcome::Failed
        }
        Ok(out) => {
            if out.status_code != 0 {
                error!(
                    "{} exited with status {}{}: {}",
                    item.path.display(),
                    out.status_code,
                    timeout_note(&out),
                    out.stderr_text()
                );
                return Outcome::Failed;
            }
            let stderr = out.stderr_text();
            if !stderr.is_empty() {
                // Tools that chatter on stderr but still exit zero.
                warn!("{} succeeded with diagnostics: {stderr}", item.path.display());
            } else {
                info!("ran {}", item.path.display());
            }
            Outcome::Succeeded
        }
    }
}

fn timeout_note(out: &CommandOutput) -> &'static str {
    if out.timed_out {
        " (timed out)"
    } else {
        ""
    }
}

fn resolve_tool(tool: &str) -> Result<PathBuf, String> {
    let expanded = expand_path(tool);
    if expanded.contains('/') {
        let path = PathBuf::from(&expanded);
        if path.exists() {
            return Ok(path);
        }
        return Err(format!("tool {expanded} does not exist"));
    }
    which::which(&expanded).map_err(|err| format!("tool {expanded} not found in PATH: {err}"))
}

fn share_root(cfg: &Config) -> PathBuf {
    PathBuf::from(expand_path(&cfg.paths.share_root))
}

fn logout_every_dir(cfg: &Config) -> PathBuf {
    share_root(cfg).join("logout-every")
}

fn logout_once_dir(cfg: &Config) -> PathBuf {
    share_root(cfg).join("logout-once")
}

fn run_once_ledger_path(cfg: &Config) -> PathBuf {
    PathBuf::from(expand_path(&cfg.paths.ledger_path))
}

fn preferences_path(cfg: &Config) -> PathBuf {
    PathBuf::from(expand_path(&cfg.paths.preferences_path))
}

fn login_state_path(cfg: &Config) -> PathBuf {
    PathBuf::from(expand_path(&cfg.paths.login_state_path))
}

fn log_file_path(cfg: &Config) -> PathBuf {
    PathBuf::from(expand_path(&cfg.paths.log_root)).join(LOG_FILE_NAME)
}

fn expand_path(input: &str) -> String {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped).to_string_lossy().to_string();
        }
    }
    input.to_string()
}

fn ensure_parent(path: &Path) -> Result<(), SundownError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn write_atomic_json<T: Serialize>(path: &Path, value: &T) -> Result<(), SundownError> {
    ensure_parent(path)?;
    let body = serde_json::to_string_pretty(value)?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, format!("{body}\n"))?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), SundownError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), SundownError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
