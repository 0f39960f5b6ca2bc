use std::env;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use murmur::{ChatSession, ConversationView, SessionError, SettingsStore, StreamOrchestrator};
use murmur_llm::BackendRegistry;
use murmur_storage::{
    ConversationId, MessageRecord, MessageStore, SqliteMessageStore, StorageError,
};
use snafu::{OptionExt, ResultExt, Snafu};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
struct CliArgs {
    prompt: String,
    conversation: Option<String>,
    config: Option<PathBuf>,
}

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("missing required --prompt argument"))]
    MissingPrompt { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("profile '{profile}' has no API key configured"))]
    MissingCredentials {
        stage: &'static str,
        profile: String,
    },
    #[snafu(display("failed to open message store: {source}"))]
    OpenStore {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("{source}"))]
    Turn {
        stage: &'static str,
        source: SessionError,
    },
}

type CliResult<T> = Result<T, CliError>;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run().await {
        eprintln!("murmur: {error}");
        std::process::exit(1);
    }
}

async fn run() -> CliResult<()> {
    let args = parse_args(env::args().skip(1))?;
    let settings_store = match args.config {
        Some(path) => SettingsStore::new(path),
        None => SettingsStore::load(),
    };
    let settings = settings_store.settings();

    let profile = settings.active_profile().cloned().unwrap_or_default();
    let config = profile
        .to_backend_config()
        .context(MissingCredentialsSnafu {
            stage: "resolve-backend-profile",
            profile: profile.id.clone(),
        })?;

    let store: Arc<dyn MessageStore> = Arc::new(
        SqliteMessageStore::open(settings.database.clone())
            .await
            .context(OpenStoreSnafu {
                stage: "open-message-store",
            })?,
    );

    let conversation_id = args
        .conversation
        .map(ConversationId::new)
        .unwrap_or_else(ConversationId::new_v7);
    let view = Arc::new(ConversationView::new(
        conversation_id.clone(),
        store.clone(),
        settings.pagination.tuning(),
    ));
    let restored = view.load_initial().await;
    tracing::info!(conversation_id = %conversation_id, restored, "conversation ready");

    let shown = Arc::new(Mutex::new(String::new()));
    let session = Arc::new(ChatSession::new(
        store.clone(),
        Arc::new(BackendRegistry::new()),
        StreamOrchestrator::new(store, settings.stream.tuning()),
        view,
        Arc::new(move |_user: &MessageRecord, assistant: &MessageRecord| {
            print_delta(&shown, &assistant.content)
        }),
    ));

    let stopper = session.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stopper.stop();
        }
    });

    let outcome = session.send(args.prompt, config).await;
    interrupt.abort();
    let outcome = outcome.context(TurnSnafu {
        stage: "send-prompt",
    })?;

    println!();
    if let Some(error) = &outcome.assistant.error {
        eprintln!("murmur: {error}");
    }
    tracing::info!(
        conversation_id = %conversation_id,
        state = outcome.state.as_str(),
        "turn finished"
    );
    Ok(())
}

/// Writes whatever `content` adds to what is already on screen.
fn print_delta(shown: &Mutex<String>, content: &str) {
    let Ok(mut shown) = shown.lock() else {
        return;
    };
    let Some(output) = next_output(&mut shown, content) else {
        return;
    };
    let mut stdout = std::io::stdout().lock();
    if let Err(error) = stdout.write_all(output.as_bytes()).and_then(|_| stdout.flush()) {
        tracing::debug!(error = %error, "failed to write reply to stdout");
    }
}

/// Output needed to bring the terminal from `shown` to `content`. Growth
/// prints the new tail. Content that no longer extends what was shown (the
/// reasoning split moves text out of the answer) restarts on a fresh line.
fn next_output(shown: &mut String, content: &str) -> Option<String> {
    if let Some(tail) = content.strip_prefix(shown.as_str()) {
        if tail.is_empty() {
            return None;
        }
        let output = tail.to_string();
        shown.push_str(tail);
        return Some(output);
    }

    shown.clear();
    shown.push_str(content);
    Some(format!("\n{content}"))
}

fn parse_args(args: impl IntoIterator<Item = String>) -> CliResult<CliArgs> {
    let mut prompt = None;
    let mut conversation = None;
    let mut config = None;
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--prompt" => {
                prompt = Some(pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-prompt-value",
                    arg: "--prompt",
                })?);
            }
            "--conversation" => {
                conversation = Some(pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-conversation-value",
                    arg: "--conversation",
                })?);
            }
            "--config" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-config-value",
                    arg: "--config",
                })?;
                config = Some(PathBuf::from(value));
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(CliArgs {
        prompt: prompt.context(MissingPromptSnafu {
            stage: "parse-args-prompt-required",
        })?,
        conversation,
        config,
    })
}
