use anyhow::{bail, Context};
use component_sandbox::editing::{EditEngine, ToolCall};
use component_sandbox::sandbox::broker::{
    CapabilityBroker, ChannelPrompter, CommandClipboard, HostFacilities, MemoryKeyValueStore,
    PendingPrompt, PermissionPrompter, StaticPrompter,
};
use component_sandbox::sandbox::ipc::{
    decode_guest, encode, salvage_request_id, typed_request, GuestMessage, HostMessage,
};
use component_sandbox::sandbox::permissions::{Capability, PermissionDecision, PermissionRule, RuleStore};
use component_sandbox::{Document, SandboxConfig};
use std::env;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "\
usage:
  component-sandbox broker --enable <caps> [--rules <file>] [--requests <file>]
                           [--auto <decision>] [--config <file>] [--debug]
  component-sandbox edit --html <file> [--calls <file>] [--undo <n>] [--config <file>] [--debug]

caps:      comma-separated, any of network,keyValueStorage,clipboard,cookies
decision:  allow-once | allow-always | deny-once | deny-always";

#[derive(Debug, Clone, Default)]
struct BrokerArgs {
    enabled: Vec<Capability>,
    rules: Option<PathBuf>,
    requests: Option<PathBuf>,
    auto: Option<PermissionDecision>,
}

#[derive(Debug, Clone, Default)]
struct EditArgs {
    html: Option<PathBuf>,
    calls: Option<PathBuf>,
    undo: usize,
}

#[derive(Debug, Clone)]
enum Mode {
    Broker(BrokerArgs),
    Edit(EditArgs),
}

#[derive(Debug, Clone)]
struct AppConfig {
    mode: Mode,
    config: Option<PathBuf>,
    debug: bool,
}

impl AppConfig {
    fn from_args() -> anyhow::Result<Self> {
        let args: Vec<String> = env::args().skip(1).collect();
        let Some((command, rest)) = args.split_first() else {
            bail!("missing command\n\n{USAGE}");
        };

        let mut mode = match command.as_str() {
            "broker" => Mode::Broker(BrokerArgs::default()),
            "edit" => Mode::Edit(EditArgs::default()),
            "--help" | "-h" | "help" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            other => bail!("unknown command {other:?}\n\n{USAGE}"),
        };
        let mut config = None;
        let mut debug = false;

        let mut i = 0;
        while i < rest.len() {
            let flag = rest[i].as_str();
            let mut value = || {
                i += 1;
                rest.get(i)
                    .cloned()
                    .with_context(|| format!("{flag} needs a value"))
            };

            match (&mut mode, flag) {
                (_, "--config") => config = Some(PathBuf::from(value()?)),
                (_, "--debug") => debug = true,
                (Mode::Broker(broker), "--enable") => {
                    for name in value()?.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                        let capability = Capability::parse(name)
                            .with_context(|| format!("unknown capability {name:?}"))?;
                        broker.enabled.push(capability);
                    }
                }
                (Mode::Broker(broker), "--rules") => broker.rules = Some(PathBuf::from(value()?)),
                (Mode::Broker(broker), "--requests") => broker.requests = Some(PathBuf::from(value()?)),
                (Mode::Broker(broker), "--auto") => {
                    let decision = value()?;
                    broker.auto = Some(
                        PermissionDecision::parse(&decision)
                            .with_context(|| format!("unknown decision {decision:?}"))?,
                    );
                }
                (Mode::Edit(edit), "--html") => edit.html = Some(PathBuf::from(value()?)),
                (Mode::Edit(edit), "--calls") => edit.calls = Some(PathBuf::from(value()?)),
                (Mode::Edit(edit), "--undo") => {
                    edit.undo = value()?.parse().context("--undo expects a number")?;
                }
                _ => bail!("unexpected argument {flag:?}\n\n{USAGE}"),
            }
            i += 1;
        }

        Ok(Self { mode, config, debug })
    }
}

fn setup_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Asks on the terminal. Only usable when requests do not come from stdin.
fn console_prompter() -> Arc<dyn PermissionPrompter> {
    let (prompter, mut prompts) = ChannelPrompter::new();

    tokio::spawn(async move {
        while let Some(prompt) = prompts.recv().await {
            let answered = tokio::task::spawn_blocking(move || ask(prompt)).await;
            if let Err(e) = answered {
                error!(error = %e, "prompt task failed");
            }
        }
    });
    Arc::new(prompter)
}

fn ask(mut prompt: PendingPrompt) {
    let stdin = std::io::stdin();
    loop {
        eprint!(
            "[{}] {}\n  decision (allow-once/allow-always/deny-once/deny-always) [deny-once]: ",
            prompt.capability, prompt.summary
        );
        let _ = std::io::stderr().flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        match answer(prompt, line.trim()) {
            Ok(_) => return,
            Err(unanswered) => {
                eprintln!("  unrecognised decision {:?}", line.trim());
                prompt = unanswered;
            }
        }
    }
}

/// Applies one typed answer; an empty answer is `deny-once`. Hands the prompt
/// back when the answer is not a decision.
fn answer(prompt: PendingPrompt, reply: &str) -> Result<bool, PendingPrompt> {
    let decision = if reply.is_empty() {
        Some(PermissionDecision::DenyOnce)
    } else {
        PermissionDecision::parse(reply)
    };
    let Some(decision) = decision else {
        return Err(prompt);
    };

    let request_id = prompt.id.clone();
    let delivered = prompt.decide(decision);
    if !delivered {
        warn!(%request_id, "prompt expired before it was answered");
    }
    Ok(delivered)
}

async fn run_broker(args: BrokerArgs, config: SandboxConfig) -> anyhow::Result<()> {
    if args.enabled.is_empty() {
        warn!("no capabilities enabled, every request will be refused");
    }

    let rules: Vec<PermissionRule> = match &args.rules {
        Some(path) => {
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading rules from {}", path.display()))?;
            serde_json::from_str(&text).context("rules file must be a JSON array of rules")?
        }
        None => Vec::new(),
    };

    let prompter: Arc<dyn PermissionPrompter> = match (args.auto, &args.requests) {
        (Some(decision), _) => Arc::new(StaticPrompter(decision)),
        (None, Some(_)) => console_prompter(),
        (None, None) => bail!("interactive prompts need --requests <file>; use --auto when piping requests"),
    };

    let facilities = HostFacilities {
        storage: Arc::new(MemoryKeyValueStore::new()),
        clipboard: Arc::new(CommandClipboard::detect()),
    };
    let broker = Arc::new(CapabilityBroker::new(
        "cli",
        args.enabled.iter().copied(),
        Arc::new(RuleStore::with_rules(rules)),
        prompter,
        &facilities,
        &config.broker,
    )?);

    let input: Box<dyn AsyncRead + Unpin + Send> = match &args.requests {
        Some(path) => Box::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("opening {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };

    let (responses, mut outgoing) = mpsc::unbounded_channel::<HostMessage>();
    let printer = tokio::spawn(async move {
        let stdout = std::io::stdout();
        while let Some(message) = outgoing.recv().await {
            match encode(&message) {
                Ok(frame) => {
                    let mut out = stdout.lock();
                    let _ = writeln!(out, "{frame}");
                    let _ = out.flush();
                }
                Err(e) => error!(error = %e, "failed to encode response"),
            }
        }
    });

    let mut inflight = JoinSet::new();
    let mut lines = BufReader::new(input).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let request = match decode_guest(line) {
            Ok(GuestMessage::CapabilityRequest {
                id,
                capability,
                details,
            }) => typed_request(id.clone(), capability, details).map_err(|e| (Some(id), e)),
            Ok(other) => {
                debug!(?other, "ignoring non-request frame");
                continue;
            }
            Err(e) => Err((salvage_request_id(line), e)),
        };

        match request {
            Ok(request) => {
                let broker = Arc::clone(&broker);
                let responses = responses.clone();
                inflight.spawn(async move {
                    let outcome = broker.handle_request(&request).await;
                    let _ = responses.send(HostMessage::response(
                        request.id,
                        outcome.map_err(|e| e.to_string()),
                    ));
                });
            }
            Err((Some(id), e)) => {
                let _ = responses.send(HostMessage::response(
                    id,
                    Err(format!("Unsupported capability request: {e}")),
                ));
            }
            Err((None, e)) => warn!(error = %e, "skipping malformed line"),
        }
    }

    while let Some(joined) = inflight.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "request task failed");
        }
    }
    drop(responses);
    printer.await?;

    let metrics = broker.auditor().metrics();
    info!(
        total = metrics.total_events,
        prompts = metrics.prompts_shown,
        denials = metrics.denials,
        failures = metrics.execution_failures,
        rules = broker.rules().len(),
        "broker finished"
    );
    Ok(())
}

async fn run_edit(args: EditArgs, config: SandboxConfig) -> anyhow::Result<()> {
    let html_path = args.html.context("edit needs --html <file>")?;
    let html = tokio::fs::read_to_string(&html_path)
        .await
        .with_context(|| format!("reading {}", html_path.display()))?;

    let engine = EditEngine::new(Arc::new(Document::parse(&html)), config.edit);

    if let Some(calls_path) = &args.calls {
        let calls = tokio::fs::read_to_string(calls_path)
            .await
            .with_context(|| format!("reading {}", calls_path.display()))?;
        for (number, line) in calls.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let call: ToolCall = serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid tool call", calls_path.display(), number + 1))?;
            match engine.dispatch(&call) {
                Ok(outcome) => eprintln!("{}", serde_json::to_string(&outcome)?),
                Err(e) => warn!(line = number + 1, error = %e, "tool call failed"),
            }
        }
    }

    for _ in 0..args.undo {
        if !engine.undo() {
            break;
        }
    }
    info!(undoable = engine.undo_count(), "edits applied");

    let document = engine.document();
    println!("{}", document.outer_html(document.root())?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_config = AppConfig::from_args()?;
    setup_logging(app_config.debug);

    let config = match &app_config.config {
        Some(path) => SandboxConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => SandboxConfig::default(),
    };

    let mode = app_config.mode;
    let run = async move {
        match mode {
            Mode::Broker(args) => run_broker(args, config).await,
            Mode::Edit(args) => run_edit(args, config).await,
        }
    };

    tokio::select! {
        result = run => result,
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, shutting down");
            Ok(())
        }
    }
}
