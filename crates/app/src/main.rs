use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{Args, Parser, Subcommand};
use mood_reader_core::{
    analyse_page, AnalysisConfig, AppConfig, AssetStore, AudioResolver, Command, DocumentSource,
    HighlightView, JsonProgressStore, MemoryDocument, MoodAnalyzer, MoodCatalog,
    MoodReaderError, OpenAiBackend, SessionBuilder, SessionEvent,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tracing_subscriber::EnvFilter;

fn main() -> mood_reader_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let outcome = runtime.block_on(async move {
        match cli.command {
            Commands::Read(args) => run_read(args).await,
            Commands::Analyze {
                document,
                page,
                config,
                lines_per_page,
            } => run_analyze(&document, page, config.as_deref(), lines_per_page).await,
            Commands::Moods { config } => run_moods(config.as_deref()),
        }
    });
    // A pending stdin read sits on a blocking thread and never returns.
    runtime.shutdown_background();
    outcome
}

async fn run_read(args: ReadArgs) -> mood_reader_core::Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(speed) = args.speed {
        config.pacing.speed = speed;
    }
    if let Some(volume) = args.volume {
        config.audio.master_volume = volume;
    }
    let config = config.normalised();

    let document = MemoryDocument::open(&args.document, args.lines_per_page)?;
    tracing::info!(document = %args.document.display(), pages = document.page_count(), "starting reader");

    let mut builder = SessionBuilder::new(
        args.document.display().to_string(),
        Arc::new(document),
        &config,
    );

    let mut backend = None;
    if args.offline {
        tracing::info!("offline mode, no mood analysis");
    } else if let Some((analyzer, client)) = build_analyzer(&config.analysis)? {
        builder = builder.analyzer(analyzer);
        backend = Some(client);
    }

    if let Some(path) = &config.progress_file {
        builder = builder.progress(Arc::new(JsonProgressStore::open(path)?));
    }

    #[cfg(feature = "playback")]
    let _device = match mood_reader_core::AudioDevice::open() {
        Ok(device) => {
            let engine = mood_reader_core::CrossfadeEngine::new(
                &config.audio,
                Box::new(device.output()?),
                Box::new(device.output()?),
            );
            builder = builder.crossfade(engine);
            Some(device)
        }
        Err(err) => {
            tracing::warn!(error = %err, "no audio device, soundtrack disabled");
            None
        }
    };

    let (session, events) = builder.build();
    let (commands, receiver) = mpsc::channel(16);
    if let Some(page) = args.page {
        let _ = commands.send(Command::GoToPage(page)).await;
    }
    if args.play {
        let _ = commands.send(Command::Play).await;
    }

    print_help();
    let printer = tokio::spawn(print_events(events, args.marked));
    let input = tokio::spawn(read_commands(commands, backend, config.analysis.clone()));

    let outcome = session.run(receiver).await;
    input.abort();
    printer.abort();
    outcome
}

async fn run_analyze(
    document: &Path,
    page: u32,
    config: Option<&Path>,
    lines_per_page: usize,
) -> mood_reader_core::Result<()> {
    let config = load_config(config)?;
    let source = MemoryDocument::open(document, lines_per_page)?;
    let Some((analyzer, _)) = build_analyzer(&config.analysis)? else {
        return Err(MoodReaderError::InvalidInput(
            "analysis needs a moods file and an API key",
        ));
    };
    let resolver = AssetStore::from_config(&config.audio);

    tracing::info!(page, "analysing page");
    let segments = analyse_page(&analyzer, &source, &resolver, page, None).await?;
    println!("{}", serde_json::to_string_pretty(&segments)?);
    Ok(())
}

fn run_moods(config: Option<&Path>) -> mood_reader_core::Result<()> {
    let config = load_config(config)?;
    let Some(moods_file) = &config.analysis.moods_file else {
        return Err(MoodReaderError::InvalidInput("no moods file configured"));
    };
    let catalog = MoodCatalog::load(moods_file)?;
    let resolver = AssetStore::from_config(&config.audio);

    for path in catalog.paths() {
        match resolver.resolve(path) {
            Some(track) => println!("{path}\t{track}"),
            None => println!("{path}\t-"),
        }
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> mood_reader_core::Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load(path),
        None => Ok(AppConfig::default()),
    }
}

/// `None` when the catalog or the credential is missing; reading still
/// works, just without a soundtrack.
fn build_analyzer(
    config: &AnalysisConfig,
) -> mood_reader_core::Result<Option<(MoodAnalyzer, Arc<OpenAiBackend>)>> {
    let Some(moods_file) = &config.moods_file else {
        tracing::warn!("no moods file configured, mood analysis disabled");
        return Ok(None);
    };
    let catalog = MoodCatalog::load(moods_file)?;

    let Some(api_key) = config.api_key() else {
        tracing::warn!(env = %config.api_key_env, "no API key set, mood analysis disabled");
        return Ok(None);
    };

    let backend = Arc::new(OpenAiBackend::new(config, Some(api_key)));
    let analyzer = MoodAnalyzer::new(backend.clone(), catalog);
    Ok(Some((analyzer, backend)))
}

#[derive(Debug, Clone, PartialEq)]
enum Input {
    Session(Command),
    /// Re-read the credential and resume analysis.
    Reauthenticate,
    Help,
}

fn parse_input(line: &str) -> Option<Input> {
    let mut words = line.split_whitespace();
    let input = match words.next()? {
        "p" | "play" => Input::Session(Command::TogglePlay),
        "+" => Input::Session(Command::Faster),
        "-" => Input::Session(Command::Slower),
        "n" => Input::Session(Command::NextPage),
        "b" => Input::Session(Command::PreviousPage),
        "g" => Input::Session(Command::GoToPage(words.next()?.parse().ok()?)),
        "s" => Input::Session(Command::SetSpeed(words.next()?.parse().ok()?)),
        "v" => Input::Session(Command::SetVolume(words.next()?.parse().ok()?)),
        "auth" => Input::Reauthenticate,
        "q" | "quit" => Input::Session(Command::Close),
        "h" | "?" => Input::Help,
        _ => return None,
    };
    Some(input)
}

async fn read_commands(
    commands: mpsc::Sender<Command>,
    backend: Option<Arc<OpenAiBackend>>,
    analysis: AnalysisConfig,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let command = match parse_input(&line) {
            Some(Input::Session(command)) => command,
            Some(Input::Reauthenticate) => {
                let Some(backend) = &backend else {
                    println!("analysis is not enabled");
                    continue;
                };
                if let Err(err) = backend.set_api_key(analysis.api_key()) {
                    tracing::error!(error = %err, "could not update the credential");
                    continue;
                }
                Command::Reauthenticated
            }
            Some(Input::Help) => {
                print_help();
                continue;
            }
            None => {
                println!("unknown command: {line}");
                continue;
            }
        };
        if commands.send(command).await.is_err() {
            break;
        }
    }
    let _ = commands.send(Command::Close).await;
}

async fn print_events(mut events: mpsc::UnboundedReceiver<SessionEvent>, marked: bool) {
    let mut view = HighlightView::default();
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::PageLoaded {
                page,
                fragments,
                line_count,
            } => {
                println!("-- page {page} ({line_count} lines) --");
                view = HighlightView::new(fragments);
            }
            SessionEvent::LineChanged {
                line: Some(_),
                text,
                fragments,
                ..
            } => {
                if marked {
                    println!("{}", view.render_marked(&fragments, "\x1b[1m", "\x1b[0m"));
                } else if let Some(text) = text {
                    println!("{text}");
                }
            }
            SessionEvent::MoodChanged {
                mood, audio_ref, ..
            } => {
                println!("[mood] {mood} ({})", audio_ref.as_deref().unwrap_or("silence"));
            }
            SessionEvent::AnalysisFailed { page, reason } => {
                eprintln!("[analysis] page {page} failed: {reason}");
            }
            SessionEvent::PlaybackBlocked { page } => {
                println!("[wait] page {page} is still being analysed");
            }
            SessionEvent::ReauthenticationRequired => {
                eprintln!("[auth] credentials rejected, export a new key and type `auth`");
            }
            SessionEvent::StateChanged(state) => {
                tracing::debug!(?state, "playback state");
            }
            SessionEvent::Finished => println!("-- end of document --"),
            _ => {}
        }
    }
}

fn print_help() {
    println!("p play/pause | + faster | - slower | s <x> speed | n next | b back | g <n> page | v <0-1> volume | auth | q quit");
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Paced reader with a mood-matched soundtrack", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Read a document line by line, reading commands from stdin.
    Read(ReadArgs),
    /// Analyse one page and print its mood segments as JSON.
    Analyze {
        /// Plain-text or fragment JSON document.
        document: PathBuf,
        #[arg(short, long, default_value_t = 1)]
        page: u32,
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(long, default_value_t = 40)]
        lines_per_page: usize,
    },
    /// List the configured mood paths and the track each resolves to.
    Moods {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct ReadArgs {
    /// Plain-text or fragment JSON document.
    document: PathBuf,
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Page to start on instead of the saved position.
    #[arg(short, long)]
    page: Option<u32>,
    #[arg(short, long)]
    speed: Option<f32>,
    #[arg(short, long)]
    volume: Option<f32>,
    /// Skip mood analysis entirely.
    #[arg(long)]
    offline: bool,
    /// Start reading immediately.
    #[arg(long)]
    play: bool,
    /// Print the whole page with the active line in bold.
    #[arg(long)]
    marked: bool,
    #[arg(long, default_value_t = 40)]
    lines_per_page: usize,
}
