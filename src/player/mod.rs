//! Pull-driven playback on top of an `AudioSinkSession`
//!
//! The player owns a writer thread that keeps asking a [`PcmSource`] for
//! the next buffer of PCM and streams it into the session, and answers
//! "what time is it" for the rest of the application through a shared
//! [`MasterClock`](crate::audio::MasterClock).

mod audio_player;

pub use audio_player::{AudioPlayer, AUDIO_BUFFER_SIZE};

/// One buffer handed out by a [`PcmSource`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PcmChunk {
    /// Bytes filled at the start of the buffer
    pub len: usize,

    /// Presentation time of the first frame, in microseconds
    pub presentation_time_us: i64,
}

impl PcmChunk {
    /// Nothing available right now
    pub const EMPTY: PcmChunk = PcmChunk {
        len: 0,
        presentation_time_us: 0,
    };
}

/// Supplier of interleaved PCM in the session's format
pub trait PcmSource: Send {
    /// Fill `buf` with the audio following `render_position_us`
    ///
    /// `render_position_us` is the last presentation time the player
    /// reported. Returning an empty chunk makes the writer back off briefly.
    fn fill(&mut self, buf: &mut [u8], render_position_us: i64) -> PcmChunk;
}

impl<F> PcmSource for F
where
    F: FnMut(&mut [u8], i64) -> PcmChunk + Send,
{
    fn fill(&mut self, buf: &mut [u8], render_position_us: i64) -> PcmChunk {
        self(buf, render_position_us)
    }
}
