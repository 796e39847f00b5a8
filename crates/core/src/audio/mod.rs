//! Two-channel ambient audio with interpolated crossfades.
//!
//! The engine owns both channels for its whole lifetime. It does not run a
//! timer of its own: [`CrossfadeEngine::play_mood`] starts a fade and the
//! owner calls [`CrossfadeEngine::advance_fade`] every
//! [`CrossfadeEngine::fade_step`] until it reports completion.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::{config::clamp_volume, AudioConfig, Result};

#[cfg(feature = "playback")]
mod device;
#[cfg(feature = "playback")]
pub use device::{AudioDevice, DeviceOutput};

/// Playback handle behind one channel.
pub trait AudioOutput: Send {
    /// Replaces the source; `None` leaves the channel empty.
    fn load(&mut self, source: Option<&str>) -> Result<()>;
    fn set_volume(&mut self, volume: f32);
    fn play(&mut self) -> Result<()>;
    fn pause(&mut self);
    /// Seeks back to the beginning of the loaded source.
    fn rewind(&mut self);
}

/// Output that only traces what it is asked to do. Used when no audio
/// device is wanted.
#[derive(Debug, Default)]
pub struct SilentOutput {
    name: &'static str,
}

impl SilentOutput {
    pub fn named(name: &'static str) -> Self {
        Self { name }
    }
}

impl AudioOutput for SilentOutput {
    fn load(&mut self, source: Option<&str>) -> Result<()> {
        trace!(channel = self.name, ?source, "load");
        Ok(())
    }

    fn set_volume(&mut self, volume: f32) {
        trace!(channel = self.name, volume, "volume");
    }

    fn play(&mut self) -> Result<()> {
        trace!(channel = self.name, "play");
        Ok(())
    }

    fn pause(&mut self) {
        trace!(channel = self.name, "pause");
    }

    fn rewind(&mut self) {
        trace!(channel = self.name, "rewind");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FadeCurve {
    Linear,
    /// Squared progress, closer to perceived loudness.
    Quadratic,
}

impl FadeCurve {
    fn rising(self, progress: f32) -> f32 {
        match self {
            FadeCurve::Linear => progress,
            FadeCurve::Quadratic => progress * progress,
        }
    }

    fn falling(self, progress: f32) -> f32 {
        self.rising(1.0 - progress)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelId {
    A,
    B,
}

impl ChannelId {
    pub fn other(self) -> Self {
        match self {
            ChannelId::A => ChannelId::B,
            ChannelId::B => ChannelId::A,
        }
    }

    fn index(self) -> usize {
        match self {
            ChannelId::A => 0,
            ChannelId::B => 1,
        }
    }
}

struct Channel {
    output: Box<dyn AudioOutput>,
    source: Option<String>,
    mood: Option<String>,
    volume: f32,
    playing: bool,
}

impl Channel {
    fn new(output: Box<dyn AudioOutput>) -> Self {
        Self {
            output,
            source: None,
            mood: None,
            volume: 0.0,
            playing: false,
        }
    }

    fn set_volume(&mut self, volume: f32) {
        self.volume = clamp_volume(volume);
        self.output.set_volume(self.volume);
    }

    fn load(&mut self, source: Option<&str>) {
        if self.playing {
            self.output.pause();
            self.playing = false;
        }
        self.source = match self.output.load(source) {
            Ok(()) => source.map(str::to_string),
            Err(err) => {
                warn!(error = %err, ?source, "failed to load ambient track");
                None
            }
        };
    }

    fn start(&mut self) {
        if self.playing || self.source.is_none() {
            return;
        }
        match self.output.play() {
            Ok(()) => self.playing = true,
            Err(err) => warn!(error = %err, "ambient playback failed"),
        }
    }

    fn halt(&mut self) {
        if self.playing {
            self.output.pause();
            self.playing = false;
        }
    }
}

struct Fade {
    outgoing: ChannelId,
    incoming: ChannelId,
    from_out: f32,
    from_in: f32,
    target: f32,
    step: u32,
    steps: u32,
}

/// Result of one fade step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadeStep {
    /// No fade is running.
    Idle,
    Running,
    /// The fade just finished and the active channel flipped.
    Completed,
}

pub struct CrossfadeEngine {
    channels: [Channel; 2],
    active: ChannelId,
    committed_mood: Option<String>,
    master_volume: f32,
    playing: bool,
    fade: Option<Fade>,
    fade_duration: Duration,
    fade_step: Duration,
    curve: FadeCurve,
}

impl CrossfadeEngine {
    pub fn new(config: &AudioConfig, a: Box<dyn AudioOutput>, b: Box<dyn AudioOutput>) -> Self {
        Self {
            channels: [Channel::new(a), Channel::new(b)],
            active: ChannelId::A,
            committed_mood: None,
            master_volume: clamp_volume(config.master_volume),
            playing: false,
            fade: None,
            fade_duration: config.fade_duration(),
            fade_step: config.fade_step(),
            curve: config.curve,
        }
    }

    /// Engine backed by [`SilentOutput`] channels.
    pub fn silent(config: &AudioConfig) -> Self {
        Self::new(
            config,
            Box::new(SilentOutput::named("a")),
            Box::new(SilentOutput::named("b")),
        )
    }

    pub fn active_channel(&self) -> ChannelId {
        self.active
    }

    /// Mood of the most recent `play_mood` call, for display.
    pub fn current_mood(&self) -> Option<&str> {
        self.committed_mood.as_deref()
    }

    pub fn channel_volume(&self, id: ChannelId) -> f32 {
        self.channel(id).volume
    }

    pub fn channel_mood(&self, id: ChannelId) -> Option<&str> {
        self.channel(id).mood.as_deref()
    }

    pub fn channel_is_playing(&self, id: ChannelId) -> bool {
        self.channel(id).playing
    }

    pub fn master_volume(&self) -> f32 {
        self.master_volume
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn is_fading(&self) -> bool {
        self.fade.is_some()
    }

    /// Interval at which [`CrossfadeEngine::advance_fade`] should be called.
    pub fn fade_step(&self) -> Duration {
        self.fade_step
    }

    /// Crossfades to `mood`. Returns false when `mood` is already the
    /// committed mood and nothing was started.
    ///
    /// A fade already in progress is abandoned at its current volumes and
    /// the new fade continues from them. The track fades in on the channel
    /// that already holds it, otherwise on the quieter channel, so the
    /// louder one always ramps down from where it is.
    pub fn play_mood(&mut self, audio_ref: Option<&str>, mood: &str) -> bool {
        if self.committed_mood.as_deref() == Some(mood) {
            return false;
        }

        if self.fade.take().is_some() {
            debug!(mood, "fade interrupted, continuing from live volumes");
        }

        let incoming = self.pick_incoming(audio_ref);
        let outgoing = incoming.other();
        self.active = outgoing;
        let from_out = self.channel(outgoing).volume;

        let reuse = self.holds(incoming, audio_ref);
        let from_in = if reuse {
            self.channel(incoming).volume
        } else {
            let channel = self.channel_mut(incoming);
            channel.load(audio_ref);
            channel.set_volume(0.0);
            0.0
        };
        self.channel_mut(incoming).mood = Some(mood.to_string());

        if self.playing {
            self.channel_mut(incoming).start();
        }

        let target = if self.channel(incoming).source.is_some() {
            self.master_volume
        } else {
            0.0
        };
        let steps = (self.fade_duration.as_millis() / self.fade_step.as_millis().max(1)).max(1);

        info!(mood, ?audio_ref, ?incoming, "crossfading to new mood");
        self.fade = Some(Fade {
            outgoing,
            incoming,
            from_out,
            from_in,
            target,
            step: 0,
            steps: u32::try_from(steps).unwrap_or(u32::MAX),
        });
        self.committed_mood = Some(mood.to_string());
        true
    }

    /// Applies one interpolation step of the running fade.
    pub fn advance_fade(&mut self) -> FadeStep {
        let curve = self.curve;
        let Some(fade) = self.fade.as_mut() else {
            return FadeStep::Idle;
        };

        fade.step = (fade.step + 1).min(fade.steps);
        let progress = fade.step as f32 / fade.steps as f32;
        let out_volume = fade.from_out * curve.falling(progress);
        let in_volume = fade.from_in + (fade.target - fade.from_in) * curve.rising(progress);
        let (outgoing, incoming) = (fade.outgoing, fade.incoming);
        let finished = fade.step >= fade.steps;

        self.channel_mut(outgoing).set_volume(out_volume);
        self.channel_mut(incoming).set_volume(in_volume);

        if !finished {
            return FadeStep::Running;
        }

        self.fade = None;
        let master = self.master_volume;
        let out = self.channel_mut(outgoing);
        out.set_volume(0.0);
        out.halt();
        out.output.rewind();

        let inc = self.channel_mut(incoming);
        if inc.source.is_some() {
            inc.set_volume(master);
        }
        self.active = incoming;
        debug!(active = ?incoming, "fade complete");
        FadeStep::Completed
    }

    /// Drops a running fade and leaves both channels at their live volumes.
    /// The louder channel becomes the active one and the next
    /// [`CrossfadeEngine::play_mood`] continues from where the fade stopped,
    /// even for the mood that was fading in.
    pub fn cancel_fade(&mut self) {
        let Some(fade) = self.fade.take() else {
            return;
        };
        if self.channel(fade.incoming).volume > self.channel(fade.outgoing).volume {
            self.active = fade.incoming;
        }
        self.committed_mood = None;
        debug!(active = ?self.active, "fade cancelled");
    }

    /// Applied to the active channel right away unless a fade is running;
    /// a running fade keeps its own targets and the new volume is applied
    /// when it completes.
    pub fn set_master_volume(&mut self, volume: f32) {
        self.master_volume = clamp_volume(volume);
        if self.fade.is_none() {
            let master = self.master_volume;
            let active = self.channel_mut(self.active);
            if active.source.is_some() {
                active.set_volume(master);
            }
        }
    }

    /// Pauses or resumes every audible channel. A running fade is neither
    /// restarted nor cancelled.
    pub fn set_playing(&mut self, playing: bool) {
        if self.playing == playing {
            return;
        }
        self.playing = playing;

        let fading_in = self.fade.as_ref().map(|fade| fade.incoming);
        let audible: Vec<ChannelId> = [ChannelId::A, ChannelId::B]
            .into_iter()
            .filter(|&id| {
                id == self.active || Some(id) == fading_in || self.channel(id).volume > 0.0
            })
            .collect();

        for id in audible {
            let channel = self.channel_mut(id);
            if playing {
                channel.start();
            } else {
                channel.halt();
            }
        }
    }

    pub fn toggle_playback(&mut self) -> bool {
        self.set_playing(!self.playing);
        self.playing
    }

    /// Cancels any fade and silences both channels.
    pub fn stop(&mut self) {
        self.fade = None;
        self.playing = false;
        for channel in &mut self.channels {
            channel.halt();
            channel.output.rewind();
        }
    }

    fn holds(&self, id: ChannelId, audio_ref: Option<&str>) -> bool {
        audio_ref.is_some() && self.channel(id).source.as_deref() == audio_ref
    }

    fn pick_incoming(&self, audio_ref: Option<&str>) -> ChannelId {
        let standby = self.active.other();
        if let Some(id) = [standby, self.active].into_iter().find(|&id| self.holds(id, audio_ref)) {
            return id;
        }
        if self.channel(self.active).volume < self.channel(standby).volume {
            self.active
        } else {
            standby
        }
    }

    fn channel(&self, id: ChannelId) -> &Channel {
        &self.channels[id.index()]
    }

    fn channel_mut(&mut self, id: ChannelId) -> &mut Channel {
        &mut self.channels[id.index()]
    }
}

impl fmt::Debug for CrossfadeEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrossfadeEngine")
            .field("active", &self.active)
            .field("committed_mood", &self.committed_mood)
            .field("master_volume", &self.master_volume)
            .field("playing", &self.playing)
            .field("fading", &self.fade.is_some())
            .finish()
    }
}
