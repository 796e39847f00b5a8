use std::{fmt, fs::File, io::BufReader};

use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink, Source};

use crate::{AudioOutput, MoodReaderError, Result};

/// Default output device. Must outlive every [`DeviceOutput`] it hands out.
pub struct AudioDevice {
    _stream: OutputStream,
    handle: OutputStreamHandle,
}

impl AudioDevice {
    pub fn open() -> Result<Self> {
        let (stream, handle) = OutputStream::try_default()
            .map_err(|err| MoodReaderError::Playback(err.to_string()))?;
        Ok(Self {
            _stream: stream,
            handle,
        })
    }

    /// Creates a paused sink usable as one crossfade channel.
    pub fn output(&self) -> Result<DeviceOutput> {
        let sink =
            Sink::try_new(&self.handle).map_err(|err| MoodReaderError::Playback(err.to_string()))?;
        sink.pause();
        Ok(DeviceOutput {
            sink,
            source: None,
            queued: false,
        })
    }
}

impl fmt::Debug for AudioDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioDevice").finish()
    }
}

/// Looping local-file playback on a rodio sink.
pub struct DeviceOutput {
    sink: Sink,
    source: Option<String>,
    queued: bool,
}

impl AudioOutput for DeviceOutput {
    fn load(&mut self, source: Option<&str>) -> Result<()> {
        self.sink.clear();
        self.queued = false;
        self.source = source.map(str::to_string);
        Ok(())
    }

    fn set_volume(&mut self, volume: f32) {
        self.sink.set_volume(volume);
    }

    fn play(&mut self) -> Result<()> {
        if !self.queued {
            let Some(path) = self.source.as_deref() else {
                return Ok(());
            };
            let file = File::open(path)?;
            let decoder = Decoder::new(BufReader::new(file))
                .map_err(|err| MoodReaderError::Playback(format!("{path}: {err}")))?;
            self.sink.append(decoder.buffered().repeat_infinite());
            self.queued = true;
        }
        self.sink.play();
        Ok(())
    }

    fn pause(&mut self) {
        self.sink.pause();
    }

    fn rewind(&mut self) {
        self.sink.clear();
        self.queued = false;
    }
}

impl fmt::Debug for DeviceOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceOutput")
            .field("source", &self.source)
            .field("queued", &self.queued)
            .finish()
    }
}
