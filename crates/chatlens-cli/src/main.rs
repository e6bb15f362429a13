use std::env;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use chatlens_contracts::anchors::{AnchorProfile, AnchorStore, ANCHORS_PATH_ENV, DEFAULT_ANCHORS_PATH};
use chatlens_contracts::chat::{
    build_completion_messages, chunk_message, filter_against_history, normalize_text_for_history,
    parse_chat_payload, AiMessageHistory, ConversationState, PACKET_CHARS,
};
use chatlens_contracts::events::{CycleEvent, CycleLog};
use chatlens_engine::{
    correct_message_sides_with, load_screenshot, ChatPerception, ClassifierHints,
    SideInferenceConfig,
};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONTEXT: &str = "You are a player in an in-game chat. Reply in one short, casual \
chat line. No narration, no meta commentary, stay in character.";

#[derive(Debug, Parser)]
#[command(name = "chatlens", version, about = "In-game chat perception pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Crop the message list out of a screenshot.
    Crop(CropArgs),
    /// Normalize a raw vision-model payload.
    Parse(ParseArgs),
    /// Re-derive bubble sides of a raw payload against a cropped image.
    Correct(CorrectArgs),
    /// Run crop, side correction, parsing and history filtering end to end.
    Perceive(PerceiveArgs),
    /// List anchor profiles and whether each is usable.
    Profiles(ProfilesArgs),
    /// Show how a reply is framed into packets and history keys.
    Chunk(ChunkArgs),
}

#[derive(Debug, Args)]
struct ClassifierArgs {
    #[arg(long)]
    dark_threshold: Option<u8>,
    #[arg(long)]
    dominance_ratio: Option<f64>,
    #[arg(long)]
    evidence_floor: Option<u32>,
}

impl ClassifierArgs {
    fn config(&self) -> SideInferenceConfig {
        let mut config = SideInferenceConfig::default();
        if let Some(value) = self.dark_threshold {
            config.dark_threshold = value;
        }
        if let Some(value) = self.dominance_ratio {
            config.dominance_ratio = value;
        }
        if let Some(value) = self.evidence_floor {
            config.evidence_floor = value;
        }
        config
    }
}

#[derive(Debug, Parser)]
struct CropArgs {
    #[arg(long)]
    screenshot: PathBuf,
    #[arg(long)]
    anchors: Option<PathBuf>,
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long)]
    data_url: bool,
}

#[derive(Debug, Parser)]
struct ParseArgs {
    /// Payload file, or `-` for stdin.
    #[arg(long, default_value = "-")]
    raw: PathBuf,
}

#[derive(Debug, Parser)]
struct CorrectArgs {
    #[arg(long, default_value = "-")]
    raw: PathBuf,
    /// Already-cropped message list image.
    #[arg(long)]
    crop: PathBuf,
    /// Classifier hints as JSON, e.g. `{"left_lane_norm":0.2,"right_lane_norm":0.83,"split_norm":0.515}`.
    #[arg(long)]
    hints: Option<String>,
    #[command(flatten)]
    classifier: ClassifierArgs,
}

#[derive(Debug, Parser)]
struct PerceiveArgs {
    #[arg(long)]
    screenshot: PathBuf,
    #[arg(long, default_value = "-")]
    raw: PathBuf,
    #[arg(long)]
    anchors: Option<PathBuf>,
    /// Newline-delimited texts the bot already sent.
    #[arg(long)]
    history: Option<PathBuf>,
    /// Reply that was sent this cycle; its packets are appended to `--history`.
    #[arg(long, requires = "history")]
    record_reply: Option<String>,
    #[arg(long)]
    context: Option<String>,
    #[arg(long)]
    events: Option<PathBuf>,
    #[command(flatten)]
    classifier: ClassifierArgs,
}

#[derive(Debug, Parser)]
struct ProfilesArgs {
    #[arg(long)]
    anchors: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ChunkArgs {
    #[arg(long)]
    reply: String,
    #[arg(long, default_value_t = PACKET_CHARS)]
    size: usize,
}

fn main() {
    init_tracing();
    match run() {
        Ok(()) => {}
        Err(err) => {
            eprintln!("chatlens error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .compact()
        .try_init();
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let output = match cli.command {
        Command::Crop(args) => run_crop(args)?,
        Command::Parse(args) => run_parse(args)?,
        Command::Correct(args) => {
            println!("{}", run_correct(args)?);
            return Ok(());
        }
        Command::Perceive(args) => run_perceive(args)?,
        Command::Profiles(args) => run_profiles(args),
        Command::Chunk(args) => run_chunk(args),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn run_crop(args: CropArgs) -> Result<Value> {
    let anchors = AnchorStore::load(resolve_anchors_path(args.anchors));
    let perception = ChatPerception::new(anchors, SideInferenceConfig::default());
    let screenshot = load_screenshot(&args.screenshot)?;
    let crop = perception.prepare(&screenshot)?;

    if let Some(out) = &args.out {
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        crop.image
            .save(out)
            .with_context(|| format!("failed to save {}", out.display()))?;
        info!(path = %out.display(), "saved crop");
    }

    let mut output = json!({
        "source": crop.source,
        "width": crop.width(),
        "height": crop.height(),
        "hints": crop.hints,
    });
    if args.data_url {
        output["data_url"] = Value::String(crop.to_png_data_url()?);
    }
    Ok(output)
}

fn run_parse(args: ParseArgs) -> Result<Value> {
    let raw = read_text_input(&args.raw)?;
    Ok(serde_json::to_value(parse_chat_payload(&raw))?)
}

fn run_correct(args: CorrectArgs) -> Result<String> {
    let raw = read_text_input(&args.raw)?;
    let crop = load_screenshot(&args.crop)?.to_rgb8();
    let hints = args
        .hints
        .as_deref()
        .map(serde_json::from_str::<ClassifierHints>)
        .transpose()
        .context("invalid --hints JSON")?;
    Ok(correct_message_sides_with(
        &raw,
        &crop,
        hints.as_ref(),
        &args.classifier.config(),
    ))
}

fn run_perceive(args: PerceiveArgs) -> Result<Value> {
    let anchors = AnchorStore::load(resolve_anchors_path(args.anchors));
    let perception = ChatPerception::new(anchors, args.classifier.config());
    let screenshot = load_screenshot(&args.screenshot)?;
    let crop = perception.prepare(&screenshot)?;
    let raw = read_text_input(&args.raw)?;
    let perceived = perception.perceive(&raw, &crop);

    let mut state = ConversationState::new();
    if let Some(path) = &args.history {
        state.ai_history = read_history(path)?;
    }
    let not_from_history = filter_against_history(&perceived.payload, &state.ai_history);
    let fresh = state.fresh_inbound(&perceived.payload);

    let context = args.context.as_deref().unwrap_or(DEFAULT_CONTEXT);
    let prompt = fresh
        .last()
        .map(|message| message.message.as_str())
        .unwrap_or_default();
    let completion_messages =
        build_completion_messages(context, &perceived.role_messages, prompt);

    let log = args
        .events
        .as_ref()
        .map(|path| CycleLog::new(path, format!("session-{}", timestamp_millis())));
    if let Some(log) = &log {
        log.append(&perceived.cycle_event(&args.screenshot, &crop.source, fresh.len()))?;
    }

    if let (Some(reply), Some(path)) = (&args.record_reply, &args.history) {
        state.record_reply(reply);
        write_history(path, &state.ai_history)?;
        info!(path = %path.display(), entries = state.ai_history.len(), "recorded reply");
        if let Some(log) = &log {
            log.append(&CycleEvent::reply_recorded(reply, state.ai_history.len()))?;
        }
    }

    Ok(json!({
        "crop": {
            "source": crop.source,
            "width": crop.width(),
            "height": crop.height(),
            "hints": crop.hints,
        },
        "payload": perceived.payload,
        "inbound": perceived.inbound(),
        "not_from_history": not_from_history,
        "fresh": fresh,
        "role_messages": perceived.role_messages,
        "completion_messages": completion_messages,
    }))
}

fn run_profiles(args: ProfilesArgs) -> Value {
    let anchors = AnchorStore::load(resolve_anchors_path(args.anchors));
    let profiles: Vec<Value> = anchors
        .keys()
        .map(|key| {
            let status = match anchors.get(key).map(AnchorProfile::from_value) {
                Some(Ok(_)) => "ok".to_string(),
                Some(Err(err)) => err.to_string(),
                None => "missing".to_string(),
            };
            json!({"resolution": key, "status": status})
        })
        .collect();
    json!({
        "path": anchors.path().map(|path| path.display().to_string()),
        "profiles": profiles,
    })
}

fn run_chunk(args: ChunkArgs) -> Value {
    let packets: Vec<Value> = chunk_message(&args.reply, args.size)
        .into_iter()
        .map(|packet| {
            let key = normalize_text_for_history(&packet);
            json!({"packet": packet, "history_key": key})
        })
        .collect();
    json!({"size": args.size.max(1), "packets": packets})
}

fn resolve_anchors_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| non_empty_env(ANCHORS_PATH_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ANCHORS_PATH))
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_text_input(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut raw = String::new();
        io::stdin()
            .read_to_string(&mut raw)
            .context("failed reading payload from stdin")?;
        return Ok(raw);
    }
    fs::read_to_string(path).with_context(|| format!("failed reading {}", path.display()))
}

fn read_history(path: &Path) -> Result<AiMessageHistory> {
    if !path.exists() {
        return Ok(AiMessageHistory::new());
    }
    let raw =
        fs::read_to_string(path).with_context(|| format!("failed reading {}", path.display()))?;
    Ok(AiMessageHistory::from_texts(raw.lines()))
}

fn write_history(path: &Path, history: &AiMessageHistory) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut entries: Vec<&str> = history.iter().collect();
    entries.sort_unstable();
    let mut encoded = entries.join("\n");
    encoded.push('\n');
    fs::write(path, encoded).with_context(|| format!("failed writing {}", path.display()))
}

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}
