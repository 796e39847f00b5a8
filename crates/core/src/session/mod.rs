//! One open document: line pacing, analysis prefetch and the soundtrack.
//!
//! [`ReaderSession`] is the single owner of the scheduler, the crossfade
//! engine and the mood cache. Page extraction and analysis requests run in
//! spawned tasks that report back through an inbox channel, and their results
//! are applied on the session's own task. Every spawned task is tracked by a
//! handle plus a token, so navigating away aborts it and a result arriving
//! late is recognised and dropped.

use std::{collections::HashMap, fmt, sync::Arc};

use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{self, Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    extract_lines, join_lines, map_spans, mapping::is_contiguous, prefetch_window,
    segment_for_line, AppConfig, AssetStore, AudioResolver, CrossfadeEngine, Directive,
    DocumentSource, FadeStep, Line, MoodAnalyzer, MoodCache, MoodReaderError, MoodSegment,
    PacingConfig, PacingState, PlaybackState, ProgressStore, ReadingProgress, Result, Scheduler,
    TextFragment,
};

/// User input accepted by a running session.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Play,
    Pause,
    TogglePlay,
    SetSpeed(f32),
    /// Next speed preset up.
    Faster,
    Slower,
    SetVolume(f32),
    GoToPage(u32),
    NextPage,
    PreviousPage,
    /// Fresh credentials are available; analysis may resume.
    Reauthenticated,
    Close,
}

/// Notifications for whatever presents the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    PageLoaded {
        page: u32,
        fragments: Vec<TextFragment>,
        line_count: usize,
    },
    LineChanged {
        page: u32,
        line: Option<usize>,
        text: Option<String>,
        /// Fragment indices to emphasise.
        fragments: Vec<usize>,
    },
    MoodChanged {
        page: u32,
        mood: String,
        audio_ref: Option<String>,
    },
    AnalysisReady {
        page: u32,
        segments: usize,
    },
    AnalysisFailed {
        page: u32,
        reason: String,
    },
    /// Playback was requested while the page is still being analysed.
    PlaybackBlocked {
        page: u32,
    },
    StateChanged(PlaybackState),
    /// The analysis service rejected the credentials. Prefetching stays off
    /// until [`Command::Reauthenticated`].
    ReauthenticationRequired,
    Finished,
}

enum Inbox {
    Page {
        page: u32,
        token: u64,
        result: Result<Vec<TextFragment>>,
    },
    Analysis {
        page: u32,
        request: u64,
        result: Result<Vec<MoodSegment>>,
    },
}

/// Assembles a [`ReaderSession`]. Without an analyzer the session reads
/// offline with no soundtrack.
pub struct SessionBuilder {
    document_id: String,
    source: Arc<dyn DocumentSource>,
    pacing: PacingConfig,
    prefetch_ahead: u32,
    analyzer: Option<MoodAnalyzer>,
    resolver: Arc<dyn AudioResolver>,
    progress: Option<Arc<dyn ProgressStore>>,
    crossfade: CrossfadeEngine,
}

impl SessionBuilder {
    pub fn new(
        document_id: impl Into<String>,
        source: Arc<dyn DocumentSource>,
        config: &AppConfig,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            source,
            pacing: config.pacing.clone(),
            prefetch_ahead: config.analysis.prefetch_ahead,
            analyzer: None,
            resolver: Arc::new(AssetStore::from_config(&config.audio)),
            progress: None,
            crossfade: CrossfadeEngine::silent(&config.audio),
        }
    }

    pub fn analyzer(mut self, analyzer: MoodAnalyzer) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn AudioResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn progress(mut self, store: Arc<dyn ProgressStore>) -> Self {
        self.progress = Some(store);
        self
    }

    /// Replaces the default silent engine, e.g. with device-backed channels.
    pub fn crossfade(mut self, engine: CrossfadeEngine) -> Self {
        self.crossfade = engine;
        self
    }

    pub fn build(self) -> (ReaderSession, mpsc::UnboundedReceiver<SessionEvent>) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let page_count = self.source.page_count();

        let session = ReaderSession {
            document_id: self.document_id,
            source: self.source,
            analyzer: self.analyzer,
            resolver: self.resolver,
            progress: self.progress,
            scheduler: Scheduler::new(self.pacing.clone(), page_count),
            pacing: self.pacing,
            prefetch_ahead: self.prefetch_ahead,
            cache: MoodCache::new(),
            crossfade: self.crossfade,
            line_deadline: None,
            fade_ticker: None,
            page_token: 0,
            page_task: None,
            next_request: 0,
            analysis_tasks: HashMap::new(),
            signed_out: false,
            reported_line: None,
            reported_state: PacingState::Idle,
            recorded_page: None,
            inbox_tx,
            inbox_rx,
            events,
        };
        (session, events_rx)
    }
}

pub struct ReaderSession {
    document_id: String,
    source: Arc<dyn DocumentSource>,
    analyzer: Option<MoodAnalyzer>,
    resolver: Arc<dyn AudioResolver>,
    progress: Option<Arc<dyn ProgressStore>>,
    pacing: PacingConfig,
    prefetch_ahead: u32,
    scheduler: Scheduler,
    cache: MoodCache,
    crossfade: CrossfadeEngine,
    /// Deadline and token of the armed line timer.
    line_deadline: Option<(Instant, u64)>,
    fade_ticker: Option<Interval>,
    page_token: u64,
    page_task: Option<JoinHandle<()>>,
    next_request: u64,
    analysis_tasks: HashMap<u32, (u64, JoinHandle<()>)>,
    signed_out: bool,
    reported_line: Option<(u32, Option<usize>, bool)>,
    reported_state: PacingState,
    recorded_page: Option<u32>,
    inbox_tx: mpsc::UnboundedSender<Inbox>,
    inbox_rx: mpsc::UnboundedReceiver<Inbox>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl ReaderSession {
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn crossfade(&self) -> &CrossfadeEngine {
        &self.crossfade
    }

    pub fn cache(&self) -> &MoodCache {
        &self.cache
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.scheduler.playback_state()
    }

    /// Opens the document and processes commands until [`Command::Close`]
    /// arrives or every command sender is dropped.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) -> Result<()> {
        self.open();

        loop {
            let line_deadline = self.line_deadline;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Close) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(message) = self.inbox_rx.recv() => self.handle_inbox(message),
                token = line_timer(line_deadline) => self.on_line_timer(token),
                _ = fade_tick(&mut self.fade_ticker) => self.on_fade_tick(),
            }
        }

        self.close();
        Ok(())
    }

    /// Positions the reader at the stored progress, or the first page.
    pub fn open(&mut self) {
        let page_count = self.scheduler.page_count();
        let restored = self
            .progress
            .as_ref()
            .and_then(|store| store.load(&self.document_id));

        let (page, line) = match restored {
            Some(progress) if (1..=page_count).contains(&progress.last_page) => {
                info!(
                    document = %self.document_id,
                    page = progress.last_page,
                    line = ?progress.last_line,
                    "restoring reading position"
                );
                (progress.last_page, progress.last_line)
            }
            _ => (1, None),
        };

        info!(document = %self.document_id, page_count, "opening document");
        self.recorded_page = Some(page);
        let directive = self.scheduler.open(page, line);
        self.apply(directive);
        self.report();
    }

    pub fn handle_command(&mut self, command: Command) {
        debug!(?command, "session command");
        match command {
            Command::Play => self.play(),
            Command::Pause => self.pause(),
            Command::TogglePlay => {
                if self.scheduler.is_playing() {
                    self.pause();
                } else {
                    self.play();
                }
            }
            Command::SetSpeed(speed) => self.set_speed(speed),
            Command::Faster => self.set_speed(self.pacing.faster(self.scheduler.speed())),
            Command::Slower => self.set_speed(self.pacing.slower(self.scheduler.speed())),
            Command::SetVolume(volume) => self.crossfade.set_master_volume(volume),
            Command::GoToPage(page) => self.navigate(page),
            Command::NextPage => self.navigate(self.scheduler.page().saturating_add(1)),
            Command::PreviousPage => self.navigate(self.scheduler.page().saturating_sub(1)),
            Command::Reauthenticated => {
                if self.signed_out {
                    info!("credentials renewed, resuming analysis");
                    self.signed_out = false;
                    self.prefetch();
                }
            }
            Command::Close => self.close(),
        }
        self.report();
    }

    /// Cancels every timer and task. Progress is recorded first.
    pub fn close(&mut self) {
        self.record_progress();
        self.scheduler.stop();
        self.line_deadline = None;
        self.fade_ticker = None;
        self.crossfade.stop();

        if let Some(task) = self.page_task.take() {
            task.abort();
        }
        for (_, (_, task)) in self.analysis_tasks.drain() {
            task.abort();
        }
        self.cache.clear();
        info!(document = %self.document_id, "session closed");
    }

    fn handle_inbox(&mut self, message: Inbox) {
        match message {
            Inbox::Page {
                page,
                token,
                result,
            } => self.on_page(page, token, result),
            Inbox::Analysis {
                page,
                request,
                result,
            } => self.on_analysis(page, request, result),
        }
        self.report();
    }

    fn play(&mut self) {
        let page = self.scheduler.page();
        if !self.scheduler.is_playing() && self.cache.is_in_flight(page) {
            info!(page, "page is still being analysed, playback deferred");
            self.emit(SessionEvent::PlaybackBlocked { page });
            return;
        }

        let directive = self.scheduler.play();
        self.apply(directive);
        if self.scheduler.is_playing() {
            self.crossfade.set_playing(true);
        }
    }

    fn pause(&mut self) {
        let directive = self.scheduler.pause();
        self.apply(directive);
        self.crossfade.set_playing(false);
    }

    fn set_speed(&mut self, speed: f32) {
        self.scheduler.set_speed(speed);
        info!(speed = self.scheduler.speed(), "reading speed changed");
        self.emit(SessionEvent::StateChanged(self.scheduler.playback_state()));
    }

    fn navigate(&mut self, page: u32) {
        let directive = self.scheduler.navigate(page);
        if matches!(directive, Directive::LoadPage(_)) {
            self.fade_ticker = None;
            self.crossfade.cancel_fade();
        }
        if !self.scheduler.is_playing() {
            self.crossfade.set_playing(false);
        }
        self.apply(directive);
    }

    fn on_line_timer(&mut self, token: u64) {
        self.line_deadline = None;
        let directive = self.scheduler.on_timer(token);
        self.apply(directive);
        self.report();
    }

    fn on_fade_tick(&mut self) {
        if self.crossfade.advance_fade() != FadeStep::Running {
            self.fade_ticker = None;
        }
    }

    fn apply(&mut self, directive: Directive) {
        match directive {
            Directive::Nothing => {}
            Directive::Arm(timer) => {
                debug!(page = timer.page, line = timer.line, delay = ?timer.delay, "line timer armed");
                self.line_deadline = Some((Instant::now() + timer.delay, timer.token));
            }
            Directive::LoadPage(page) => self.request_page(page),
            Directive::Finished => {
                info!(document = %self.document_id, "end of document");
                self.crossfade.set_playing(false);
                self.emit(SessionEvent::Finished);
            }
        }
        if self.scheduler.pending_timer().is_none() {
            self.line_deadline = None;
        }
    }

    fn request_page(&mut self, page: u32) {
        if let Some(task) = self.page_task.take() {
            task.abort();
        }
        self.page_token += 1;
        let token = self.page_token;
        let source = Arc::clone(&self.source);
        let inbox = self.inbox_tx.clone();

        debug!(page, token, "loading page");
        self.page_task = Some(tokio::spawn(async move {
            let result = source.fragments(page).await;
            let _ = inbox.send(Inbox::Page {
                page,
                token,
                result,
            });
        }));
        self.retarget();
    }

    fn on_page(&mut self, page: u32, token: u64, result: Result<Vec<TextFragment>>) {
        if token != self.page_token {
            debug!(page, token, "discarding superseded page load");
            return;
        }
        self.page_task = None;

        let fragments = result.unwrap_or_else(|err| {
            warn!(page, error = %err, "page text unavailable, treating it as empty");
            Vec::new()
        });
        let lines = extract_lines(&fragments);
        let line_count = lines.len();
        self.emit(SessionEvent::PageLoaded {
            page,
            fragments,
            line_count,
        });

        let directive = self.scheduler.load_page(page, lines);
        if self.recorded_page != Some(page) {
            self.recorded_page = Some(page);
            self.record_progress();
        }
        self.prefetch();
        self.apply(directive);
    }

    fn prefetch(&mut self) {
        let Some(analyzer) = self.analyzer.clone() else {
            return;
        };
        if self.signed_out {
            debug!("signed out, analysis prefetch suspended");
            return;
        }

        let current = self.scheduler.page();
        let window = prefetch_window(current, self.scheduler.page_count(), self.prefetch_ahead);
        for page in window {
            if !self.cache.begin(page) {
                continue;
            }
            let lines = (page == current && self.scheduler.lines_ready())
                .then(|| self.scheduler.lines().to_vec());
            self.spawn_analysis(analyzer.clone(), page, lines);
        }
    }

    fn spawn_analysis(&mut self, analyzer: MoodAnalyzer, page: u32, lines: Option<Vec<Line>>) {
        self.next_request += 1;
        let request = self.next_request;
        let source = Arc::clone(&self.source);
        let resolver = Arc::clone(&self.resolver);
        let inbox = self.inbox_tx.clone();

        info!(page, request, "requesting mood analysis");
        let task = tokio::spawn(async move {
            let result =
                analyse_page(&analyzer, source.as_ref(), resolver.as_ref(), page, lines).await;
            let _ = inbox.send(Inbox::Analysis {
                page,
                request,
                result,
            });
        });
        if let Some((_, previous)) = self.analysis_tasks.insert(page, (request, task)) {
            previous.abort();
        }
    }

    fn on_analysis(&mut self, page: u32, request: u64, result: Result<Vec<MoodSegment>>) {
        match self.analysis_tasks.get(&page) {
            Some((current, _)) if *current == request => {
                self.analysis_tasks.remove(&page);
            }
            _ => {
                debug!(page, request, "discarding stale analysis result");
                return;
            }
        }

        match result {
            Ok(segments) => {
                let count = segments.len();
                info!(page, segments = count, "mood analysis ready");
                self.cache.complete(page, segments);
                self.emit(SessionEvent::AnalysisReady {
                    page,
                    segments: count,
                });
            }
            Err(err) if err.is_auth_error() => {
                self.cache.abandon(page);
                self.sign_out(&err);
            }
            Err(err) => {
                self.cache.abandon(page);
                warn!(page, error = %err, "mood analysis failed, page stays eligible");
                self.emit(SessionEvent::AnalysisFailed {
                    page,
                    reason: err.to_string(),
                });
            }
        }
    }

    /// Drops analyses for pages that left the prefetch window.
    fn retarget(&mut self) {
        let window = prefetch_window(
            self.scheduler.page(),
            self.scheduler.page_count(),
            self.prefetch_ahead,
        );
        let stale: Vec<u32> = self
            .analysis_tasks
            .keys()
            .copied()
            .filter(|page| !window.contains(page))
            .collect();
        for page in stale {
            self.cancel_analysis(page);
        }
    }

    fn cancel_analysis(&mut self, page: u32) {
        if let Some((_, task)) = self.analysis_tasks.remove(&page) {
            task.abort();
        }
        self.cache.abandon(page);
        debug!(page, "analysis cancelled");
    }

    fn sign_out(&mut self, err: &MoodReaderError) {
        error!(error = %err, "analysis service rejected the credentials");
        self.signed_out = true;
        let pages: Vec<u32> = self.analysis_tasks.keys().copied().collect();
        for page in pages {
            self.cancel_analysis(page);
        }
        self.emit(SessionEvent::ReauthenticationRequired);
    }

    /// Emits line and state changes since the last call and follows the
    /// mood of the current line.
    fn report(&mut self) {
        let page = self.scheduler.page();
        let line = self.scheduler.current_line();
        let key = (page, line, self.scheduler.lines_ready());
        if self.reported_line != Some(key) {
            self.reported_line = Some(key);
            self.emit(SessionEvent::LineChanged {
                page,
                line,
                text: self.scheduler.current().map(|l| l.text.clone()),
                fragments: self.scheduler.highlighted_fragments().to_vec(),
            });
        }

        let state = self.scheduler.state();
        if self.reported_state != state {
            self.reported_state = state;
            self.emit(SessionEvent::StateChanged(self.scheduler.playback_state()));
        }

        self.update_mood();
    }

    fn update_mood(&mut self) {
        if !self.scheduler.is_playing() {
            return;
        }
        let page = self.scheduler.page();
        let (Some(line), Some(segments)) = (self.scheduler.current_line(), self.cache.get(page))
        else {
            return;
        };
        let Some(segment) = segment_for_line(segments, line) else {
            return;
        };
        let (mood, audio_ref) = (segment.mood_path.clone(), segment.audio_ref.clone());

        if self.crossfade.play_mood(audio_ref.as_deref(), &mood) {
            self.emit(SessionEvent::MoodChanged {
                page,
                mood,
                audio_ref,
            });
            self.start_fade_ticker();
        }
    }

    fn start_fade_ticker(&mut self) {
        if self.fade_ticker.is_some() {
            return;
        }
        let step = self.crossfade.fade_step();
        let mut ticker = time::interval_at(Instant::now() + step, step);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.fade_ticker = Some(ticker);
    }

    fn record_progress(&self) {
        if let Some(store) = &self.progress {
            store.record(
                &self.document_id,
                ReadingProgress {
                    last_page: self.scheduler.page(),
                    last_line: self.scheduler.current_line(),
                },
            );
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

impl fmt::Debug for ReaderSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderSession")
            .field("document_id", &self.document_id)
            .field("scheduler", &self.scheduler)
            .field("crossfade", &self.crossfade)
            .field("cache", &self.cache)
            .field("signed_out", &self.signed_out)
            .finish()
    }
}

/// Analyses one page and maps the result onto its lines, resolving audio
/// for segments that came back without any. `lines` skips extraction when
/// the caller already has them.
pub async fn analyse_page(
    analyzer: &MoodAnalyzer,
    source: &dyn DocumentSource,
    resolver: &dyn AudioResolver,
    page: u32,
    lines: Option<Vec<Line>>,
) -> Result<Vec<MoodSegment>> {
    let lines = match lines {
        Some(lines) => lines,
        None => extract_lines(&source.fragments(page).await?),
    };
    let spans = analyzer.analyze(&join_lines(&lines)).await?;
    let mut segments = map_spans(&spans, &lines);
    if !is_contiguous(&segments, lines.len()) {
        debug!(page, "mood segments leave gaps or overlap, first match wins");
    }
    for segment in segments.iter_mut().filter(|s| s.audio_ref.is_none()) {
        segment.audio_ref = resolver.resolve(&segment.mood_path);
    }
    Ok(segments)
}

async fn line_timer(deadline: Option<(Instant, u64)>) -> u64 {
    match deadline {
        Some((at, token)) => {
            time::sleep_until(at).await;
            token
        }
        None => std::future::pending().await,
    }
}

async fn fade_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::{
        test_support::{PatchyDocument, Reply, ScriptedBackend},
        JsonProgressStore, MemoryDocument, MoodCatalog,
    };

    const DREAD: &str = "Dark.Tense.Dread";
    const CALM: &str = "Light.Calm.Warm";

    fn sections(spans: &[(&str, &str, &str)]) -> String {
        let sections: Vec<_> = spans
            .iter()
            .map(|(start, end, mood)| json!({ "start": start, "end": end, "mood": mood }))
            .collect();
        json!({ "sections": sections }).to_string()
    }

    fn session(
        document: impl DocumentSource + 'static,
        backend: &Arc<ScriptedBackend>,
    ) -> (ReaderSession, mpsc::UnboundedReceiver<SessionEvent>) {
        let mut store = AssetStore::new();
        store.register(DREAD, "dread.mp3");
        store.register(CALM, "calm.mp3");
        let catalog = MoodCatalog::new(vec![DREAD.to_string(), CALM.to_string()]);

        SessionBuilder::new("book", Arc::new(document), &AppConfig::default())
            .analyzer(MoodAnalyzer::new(backend.clone(), catalog))
            .resolver(Arc::new(store))
            .build()
    }

    fn pages(count: usize) -> MemoryDocument {
        let pages: Vec<Vec<String>> = (1..=count)
            .map(|page| vec![format!("page {page} opens"), format!("page {page} closes")])
            .collect();
        MemoryDocument::from_lines(&pages)
    }

    /// Lets spawned tasks run to their next suspension point and applies
    /// whatever they reported.
    async fn settle(session: &mut ReaderSession) {
        for _ in 0..3 {
            time::sleep(Duration::from_millis(1)).await;
            while let Ok(message) = session.inbox_rx.try_recv() {
                session.handle_inbox(message);
            }
        }
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    async fn wait_for(
        events: &mut mpsc::UnboundedReceiver<SessionEvent>,
        matches: impl Fn(&SessionEvent) -> bool,
    ) {
        loop {
            let event = events.recv().await.expect("session hung up");
            if matches(&event) {
                return;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reads_through_the_document_following_moods() {
        let backend = Arc::new(
            ScriptedBackend::default()
                .route(
                    "creaked",
                    Reply::Json(sections(&[("The door creaked", "Nobody was there.", DREAD)])),
                )
                .route("Sunlight", Reply::Json(sections(&[("Sunlight", "in.", CALM)]))),
        );
        let document = MemoryDocument::from_lines(&[
            vec!["The door creaked open.", "Nobody was there."],
            vec!["Sunlight spilled in."],
        ]);
        let (session, mut events) = session(document, &backend);
        let (commands, receiver) = mpsc::channel(8);
        let running = tokio::spawn(session.run(receiver));

        wait_for(&mut events, |e| {
            matches!(e, SessionEvent::AnalysisReady { page: 1, .. })
        })
        .await;
        commands.send(Command::Play).await.unwrap();

        let mut lines = Vec::new();
        let mut moods = Vec::new();
        loop {
            match events.recv().await.unwrap() {
                SessionEvent::LineChanged {
                    page,
                    line: Some(line),
                    ..
                } => lines.push((page, line)),
                SessionEvent::MoodChanged { mood, .. } => moods.push(mood),
                SessionEvent::Finished => break,
                _ => {}
            }
        }

        assert_eq!(lines, vec![(1, 0), (1, 1), (2, 0)]);
        assert_eq!(moods, vec![DREAD.to_string(), CALM.to_string()]);
        assert_eq!(backend.calls(), 2);

        commands.send(Command::Close).await.unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn analysis_is_requested_once_per_page() {
        let backend = Arc::new(ScriptedBackend::answering(Reply::Hang));
        let (mut session, mut events) = session(pages(3), &backend);

        session.open();
        settle(&mut session).await;
        assert_eq!(backend.calls(), 2);

        session.handle_command(Command::GoToPage(1));
        settle(&mut session).await;
        session.handle_command(Command::GoToPage(1));
        settle(&mut session).await;
        assert_eq!(backend.calls(), 2);

        drain(&mut events);
        session.handle_command(Command::Play);
        assert!(drain(&mut events).contains(&SessionEvent::PlaybackBlocked { page: 1 }));
        assert!(!session.scheduler().is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn results_for_pages_left_behind_are_dropped() {
        let backend = Arc::new(
            ScriptedBackend::replying(&sections(&[("page", "closes", DREAD)]))
                .with_delay(Duration::from_secs(5)),
        );
        let (mut session, _events) = session(pages(5), &backend);

        session.open();
        settle(&mut session).await;
        assert_eq!(backend.calls(), 2);

        session.handle_command(Command::GoToPage(4));
        settle(&mut session).await;
        assert_eq!(backend.calls(), 4);

        time::sleep(Duration::from_secs(6)).await;
        settle(&mut session).await;
        assert!(!session.cache().contains(1));
        assert!(!session.cache().contains(2));
        assert!(session.cache().contains(4));
        assert!(session.cache().contains(5));

        session.handle_inbox(Inbox::Analysis {
            page: 1,
            request: 1,
            result: Ok(Vec::new()),
        });
        assert!(!session.cache().contains(1));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_credentials_pause_analysis_until_renewed() {
        let backend = Arc::new(ScriptedBackend::answering(Reply::Unauthorized));
        let (mut session, mut events) = session(pages(3), &backend);

        session.open();
        settle(&mut session).await;
        let prompts = backend.calls();
        assert!(prompts >= 1);

        let raised = drain(&mut events)
            .into_iter()
            .filter(|e| *e == SessionEvent::ReauthenticationRequired)
            .count();
        assert_eq!(raised, 1);
        assert!(session.cache().is_empty());
        assert_eq!(session.cache().pending().count(), 0);

        session.handle_command(Command::GoToPage(2));
        settle(&mut session).await;
        assert_eq!(backend.calls(), prompts);

        session.handle_command(Command::Reauthenticated);
        settle(&mut session).await;
        assert!(backend.calls() > prompts);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_analysis_is_retried_on_the_next_visit() {
        let backend = Arc::new(
            ScriptedBackend::replying(&sections(&[("page", "closes", CALM)]))
                .queued(vec![Reply::Failure("upstream unavailable".into())]),
        );
        let (mut session, mut events) = session(pages(1), &backend);

        session.open();
        settle(&mut session).await;
        assert!(drain(&mut events)
            .iter()
            .any(|e| matches!(e, SessionEvent::AnalysisFailed { page: 1, .. })));
        assert!(!session.cache().contains(1));

        session.handle_command(Command::GoToPage(1));
        settle(&mut session).await;
        assert!(session.cache().contains(1));
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_page_has_no_lines() {
        let backend = Arc::new(ScriptedBackend::default());
        let document = PatchyDocument::new(pages(2), vec![1]);
        let (mut session, mut events) = session(document, &backend);

        session.open();
        settle(&mut session).await;
        assert!(drain(&mut events).iter().any(|e| matches!(
            e,
            SessionEvent::PageLoaded {
                page: 1,
                line_count: 0,
                ..
            }
        )));
        assert_eq!(session.cache().get(1), Some(&[][..]));

        session.handle_command(Command::Play);
        assert_eq!(session.scheduler().state(), PacingState::Idle);
        assert!(session.line_deadline.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn playing_starts_the_soundtrack_and_pausing_silences_it() {
        let backend = Arc::new(ScriptedBackend::replying(&sections(&[(
            "page 1 opens",
            "page 1 closes",
            DREAD,
        )])));
        let (mut session, _events) = session(pages(2), &backend);

        session.open();
        settle(&mut session).await;
        session.handle_command(Command::Play);

        assert_eq!(session.scheduler().current_line(), Some(0));
        assert!(session.line_deadline.is_some());
        assert_eq!(session.crossfade().current_mood(), Some(DREAD));
        assert!(session.crossfade().is_playing());
        assert!(session.fade_ticker.is_some());

        session.handle_command(Command::Pause);
        assert_eq!(session.scheduler().state(), PacingState::Paused);
        assert!(session.line_deadline.is_none());
        assert!(!session.crossfade().is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn navigating_away_stops_a_running_fade() {
        let backend = Arc::new(ScriptedBackend::replying(&sections(&[(
            "page 1 opens",
            "page 1 closes",
            DREAD,
        )])));
        let (mut session, _events) = session(pages(3), &backend);

        session.open();
        settle(&mut session).await;
        session.handle_command(Command::Play);
        assert!(session.crossfade().is_fading());
        session.handle_command(Command::GoToPage(9));
        assert!(session.crossfade().is_fading());

        session.handle_command(Command::GoToPage(3));
        assert!(session.fade_ticker.is_none());
        assert!(!session.crossfade().is_fading());
        assert!(session.line_deadline.is_none());
        assert_eq!(session.crossfade().current_mood(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn speed_presets_step_through_configured_options() {
        let backend = Arc::new(ScriptedBackend::default());
        let (mut session, mut events) = session(pages(1), &backend);

        session.handle_command(Command::Faster);
        assert_eq!(session.playback_state().speed_multiplier, 1.25);
        session.handle_command(Command::Slower);
        session.handle_command(Command::Slower);
        assert_eq!(session.playback_state().speed_multiplier, 0.75);
        assert!(drain(&mut events)
            .iter()
            .any(|e| matches!(e, SessionEvent::StateChanged(state) if state.speed_multiplier == 0.75)));
    }

    #[tokio::test(start_paused = true)]
    async fn reading_position_is_restored_and_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonProgressStore::open(dir.path().join("progress.json")).unwrap());
        store.record(
            "book",
            ReadingProgress {
                last_page: 2,
                last_line: Some(1),
            },
        );

        let (mut session, _events) =
            SessionBuilder::new("book", Arc::new(pages(3)), &AppConfig::default())
                .progress(store.clone())
                .build();
        session.open();
        settle(&mut session).await;
        assert_eq!(session.scheduler().page(), 2);
        assert_eq!(session.scheduler().current_line(), Some(1));
        assert_eq!(session.scheduler().state(), PacingState::Paused);

        session.handle_command(Command::NextPage);
        settle(&mut session).await;
        assert_eq!(
            store.load("book"),
            Some(ReadingProgress {
                last_page: 3,
                last_line: Some(1),
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn closing_cancels_timers_and_requests() {
        let backend = Arc::new(ScriptedBackend::answering(Reply::Hang));
        let (mut session, _events) = session(pages(3), &backend);

        session.open();
        settle(&mut session).await;
        assert_eq!(session.analysis_tasks.len(), 2);

        session.close();
        assert!(session.analysis_tasks.is_empty());
        assert!(session.page_task.is_none());
        assert!(session.line_deadline.is_none());
        assert!(session.fade_ticker.is_none());
        assert_eq!(session.cache().pending().count(), 0);
        assert_eq!(session.scheduler().state(), PacingState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn offline_sessions_read_without_analysis() {
        let (mut session, _events) =
            SessionBuilder::new("book", Arc::new(pages(1)), &AppConfig::default()).build();

        session.open();
        settle(&mut session).await;
        session.handle_command(Command::Play);
        assert!(session.scheduler().is_playing());
        assert!(session.cache().is_empty());
        assert_eq!(session.crossfade().current_mood(), None);
    }
}
