//! Doubles shared by the unit tests.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    AudioOutput, CompletionBackend, DocumentSource, MemoryDocument, MoodReaderError, Result,
    TextFragment,
};

/// What a [`ScriptedBackend`] answers with.
#[derive(Debug, Clone)]
pub enum Reply {
    Json(String),
    Unauthorized,
    Failure(String),
    /// Never answers.
    Hang,
}

/// Completion backend answering from a script instead of the network.
///
/// Routes are checked first (by substring of the prompt), then queued
/// replies, then the fallback.
#[derive(Debug)]
pub struct ScriptedBackend {
    routes: Vec<(String, Reply)>,
    queue: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::answering(Reply::Json(r#"{"sections":[]}"#.to_string()))
    }
}

impl ScriptedBackend {
    pub fn answering(fallback: Reply) -> Self {
        Self {
            routes: Vec::new(),
            queue: Mutex::new(VecDeque::new()),
            fallback,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn replying(raw: &str) -> Self {
        Self::answering(Reply::Json(raw.to_string()))
    }

    /// Replies used once each, in order, before the fallback.
    pub fn queued(mut self, replies: Vec<Reply>) -> Self {
        self.queue = Mutex::new(replies.into());
        self
    }

    pub fn route(mut self, needle: &str, reply: Reply) -> Self {
        self.routes.push((needle.to_string(), reply));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_reply(&self, prompt: &str) -> Reply {
        if let Some((_, reply)) = self.routes.iter().find(|(needle, _)| prompt.contains(needle)) {
            return reply.clone();
        }
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.next_reply(prompt);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match reply {
            Reply::Json(raw) => Ok(raw),
            Reply::Unauthorized => Err(MoodReaderError::Unauthorized("token expired".into())),
            Reply::Failure(message) => Err(MoodReaderError::Backend {
                status: 500,
                message,
            }),
            Reply::Hang => std::future::pending().await,
        }
    }
}

/// Output that records every call into a shared log.
#[derive(Debug)]
pub struct RecordingOutput {
    log: Arc<Mutex<Vec<String>>>,
    pub(crate) fail_play: bool,
    pub(crate) fail_load: bool,
}

impl RecordingOutput {
    pub fn new() -> (Self, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let output = Self {
            log: log.clone(),
            fail_play: false,
            fail_load: false,
        };
        (output, log)
    }

    fn push(&self, op: impl Into<String>) {
        self.log.lock().unwrap().push(op.into());
    }
}

impl AudioOutput for RecordingOutput {
    fn load(&mut self, source: Option<&str>) -> Result<()> {
        if self.fail_load {
            return Err(MoodReaderError::Playback("unsupported format".into()));
        }
        self.push(format!("load:{}", source.unwrap_or("")));
        Ok(())
    }

    fn set_volume(&mut self, _volume: f32) {}

    fn play(&mut self) -> Result<()> {
        if self.fail_play {
            return Err(MoodReaderError::Playback("autoplay blocked".into()));
        }
        self.push("play");
        Ok(())
    }

    fn pause(&mut self) {
        self.push("pause");
    }

    fn rewind(&mut self) {
        self.push("rewind");
    }
}

/// In-memory document whose listed pages fail to extract.
#[derive(Debug)]
pub struct PatchyDocument {
    inner: MemoryDocument,
    broken: Vec<u32>,
}

impl PatchyDocument {
    pub fn new(inner: MemoryDocument, broken: Vec<u32>) -> Self {
        Self { inner, broken }
    }
}

#[async_trait]
impl DocumentSource for PatchyDocument {
    fn page_count(&self) -> u32 {
        self.inner.page_count()
    }

    async fn fragments(&self, page: u32) -> Result<Vec<TextFragment>> {
        if self.broken.contains(&page) {
            return Err(MoodReaderError::msg(format!("page {page} could not be extracted")));
        }
        self.inner.fragments(page).await
    }
}
