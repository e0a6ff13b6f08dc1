//! SMPTE timecode arithmetic and byte encodings.

use super::{Error, ErrorDetails, Result};
use regex::Regex;
use std::fmt::{Debug, Display, Formatter};
use std::sync::OnceLock;

/// Timebases accepted by [`Timecode`], in integer frames per second.
pub const VALID_TIMEBASES: [u8; 5] = [24, 25, 30, 50, 60];

/// Used for the 24 h wrap.
const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

fn tc_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{2}):(\d{2}):(\d{2})([:;])(\d{2})$").unwrap())
}

fn bcd(value: u8) -> u8 {
    ((value / 10) << 4) | (value % 10)
}

fn unbcd(value: u8) -> Option<u8> {
    let tens = value >> 4;
    let units = value & 0x0F;
    if tens > 9 || units > 9 {
        None
    } else {
        Some(tens * 10 + units)
    }
}

/// An SMPTE HH:MM:SS:FF time address with an integer timebase.
///
/// Supports drop-frame counting at timebases 30 and 60: at every minute boundary whose minute is
/// not divisible by 10, the first 2 (timebase 30) or 4 (timebase 60) frame numbers are skipped.
///
/// Arithmetic never fails; a timecode that advances past 23:59:59 wraps to the 00 hour.
///
/// # Example
///
/// ```
/// use teletext_io::Timecode;
/// let mut tc = Timecode::parse("00:08:59;29", 30)?;
/// tc.add_one_frame();
/// assert_eq!(tc.to_string(), "00:09:00;02");
/// # Ok::<(), teletext_io::Error>(())
/// ```
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Timecode {
    hours: u8,
    minutes: u8,
    seconds: u8,
    frames: u8,
    timebase: u8,
    drop_frame: bool,
}

impl Timecode {
    /// Constructs a timecode, validating every component against the timebase.
    pub fn new(
        hours: u8,
        minutes: u8,
        seconds: u8,
        frames: u8,
        timebase: u8,
        drop_frame: bool,
    ) -> Result<Self> {
        if !VALID_TIMEBASES.contains(&timebase) {
            return Err(Error::invalid_timecode());
        }
        if drop_frame && timebase != 30 && timebase != 60 {
            return Err(Error::invalid_timecode());
        }
        if hours > 23 || minutes > 59 || seconds > 59 || frames >= timebase {
            return Err(Error::invalid_timecode());
        }
        if drop_frame && seconds == 0 && minutes % 10 != 0 && frames < timebase / 15 {
            // A frame number that drop-frame counting skips.
            return Err(Error::invalid_timecode());
        }
        Ok(Self {
            hours,
            minutes,
            seconds,
            frames,
            timebase,
            drop_frame,
        })
    }

    /// The zero timecode at the given timebase.
    pub fn zero(timebase: u8) -> Self {
        Self {
            hours: 0,
            minutes: 0,
            seconds: 0,
            frames: 0,
            timebase,
            drop_frame: false,
        }
    }

    /// Parses `"HH:MM:SS:FF"` or `"HH:MM:SS;FF"`; the semicolon form selects drop-frame.
    pub fn parse(s: &str, timebase: u8) -> Result<Self> {
        let caps = tc_regex()
            .captures(s)
            .ok_or_else(Error::invalid_timecode)?;
        let field = |i: usize| caps[i].parse::<u8>().map_err(|_| Error::invalid_timecode());
        let drop_frame = &caps[4] == ";";
        Self::new(
            field(1)?,
            field(2)?,
            field(3)?,
            field(5)?,
            timebase,
            drop_frame,
        )
    }

    /// Hours component.
    pub fn hours(&self) -> u8 {
        self.hours
    }

    /// Minutes component.
    pub fn minutes(&self) -> u8 {
        self.minutes
    }

    /// Seconds component.
    pub fn seconds(&self) -> u8 {
        self.seconds
    }

    /// Frames component.
    pub fn frames(&self) -> u8 {
        self.frames
    }

    /// Integer frames per second.
    pub fn timebase(&self) -> u8 {
        self.timebase
    }

    /// Whether drop-frame counting is in effect.
    pub fn drop_frame(&self) -> bool {
        self.drop_frame
    }

    /// Frame numbers skipped per affected minute boundary (2 at 30, 4 at 60).
    fn dropped_per_minute(&self) -> u64 {
        if self.drop_frame {
            (self.timebase / 15) as u64
        } else {
            0
        }
    }

    /// The number of frames counted from 00:00:00:00 up to this timecode.
    pub fn frame_count(&self) -> u64 {
        let tb = self.timebase as u64;
        let total_minutes = self.hours as u64 * 60 + self.minutes as u64;
        let nominal =
            (total_minutes * 60 + self.seconds as u64) * tb + self.frames as u64;
        nominal - self.dropped_per_minute() * (total_minutes - total_minutes / 10)
    }

    /// Builds the timecode addressed by `count` frames past 00:00:00:00, wrapping at 24 h.
    pub fn from_frame_count(count: u64, timebase: u8, drop_frame: bool) -> Result<Self> {
        if !VALID_TIMEBASES.contains(&timebase) {
            return Err(Error::invalid_timecode());
        }
        if drop_frame && timebase != 30 && timebase != 60 {
            return Err(Error::invalid_timecode());
        }
        let tb = timebase as u64;
        let drop = if drop_frame { tb / 15 } else { 0 };
        let frames_per_day = SECONDS_PER_DAY * tb - drop * (24 * 60 - 24 * 6);
        let mut count = count % frames_per_day;
        if drop > 0 {
            let frames_per_ten = tb * 600 - drop * 9;
            let frames_per_minute = tb * 60 - drop;
            let ten_blocks = count / frames_per_ten;
            let rem = count % frames_per_ten;
            let minutes_past = if rem < tb * 60 {
                0
            } else {
                1 + (rem - tb * 60) / frames_per_minute
            };
            count += drop * (ten_blocks * 9 + minutes_past);
        }
        let frames = (count % tb) as u8;
        let seconds = ((count / tb) % 60) as u8;
        let minutes = ((count / (tb * 60)) % 60) as u8;
        let hours = ((count / (tb * 3600)) % 24) as u8;
        Ok(Self {
            hours,
            minutes,
            seconds,
            frames,
            timebase,
            drop_frame,
        })
    }

    /// Advances by exactly one frame, rolling components over and skipping dropped frame numbers
    /// at minute boundaries.
    pub fn add_one_frame(&mut self) {
        self.frames += 1;
        if self.frames < self.timebase {
            return;
        }
        self.frames = 0;
        self.seconds += 1;
        if self.seconds == 60 {
            self.seconds = 0;
            self.minutes += 1;
            if self.minutes == 60 {
                self.minutes = 0;
                self.hours = (self.hours + 1) % 24;
            }
            if self.drop_frame && self.minutes % 10 != 0 {
                self.frames = self.timebase / 15;
            }
        }
    }

    /// Advances by `n` frames.
    pub fn add_frames(&mut self, n: u64) {
        *self = Self::from_frame_count(self.frame_count() + n, self.timebase, self.drop_frame)
            .unwrap();
    }

    /// Returns a copy advanced by `n` frames.
    pub fn plus_frames(&self, n: u64) -> Self {
        let mut out = *self;
        out.add_frames(n);
        out
    }

    /// Serializes to the 4-byte SMPTE packed form `[frames, seconds, minutes, hours]`.
    ///
    /// Each byte is BCD; bit 7 of the frames byte is the drop-frame flag and bit 7 of the
    /// seconds byte is reserved (written as zero).
    pub fn to_smpte_bytes(&self) -> [u8; 4] {
        let mut frames = bcd(self.frames);
        if self.drop_frame {
            frames |= 0x80;
        }
        [
            frames,
            bcd(self.seconds),
            bcd(self.minutes),
            bcd(self.hours),
        ]
    }

    /// Parses the 4-byte SMPTE packed form; the timebase comes from external context and the
    /// drop-frame flag from bit 7 of the frames byte.
    pub fn from_smpte_bytes(bytes: &[u8; 4], timebase: u8) -> Result<Self> {
        let drop_frame = bytes[0] & 0x80 != 0;
        let frames = unbcd(bytes[0] & 0x7F).ok_or_else(Error::invalid_timecode)?;
        let seconds = unbcd(bytes[1] & 0x7F).ok_or_else(Error::invalid_timecode)?;
        let minutes = unbcd(bytes[2] & 0x7F).ok_or_else(Error::invalid_timecode)?;
        let hours = unbcd(bytes[3] & 0x3F).ok_or_else(Error::invalid_timecode)?;
        Self::new(hours, minutes, seconds, frames, timebase, drop_frame)
    }

    /// BCD encoding `[HH, MM, SS, FF]` as used by STL TC In/Out fields.
    pub fn to_bcd(&self) -> [u8; 4] {
        [
            bcd(self.hours),
            bcd(self.minutes),
            bcd(self.seconds),
            bcd(self.frames),
        ]
    }
}

impl Display for Timecode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let sep = if self.drop_frame { ';' } else { ':' };
        write!(
            f,
            "{:02}:{:02}:{:02}{}{:02}",
            self.hours, self.minutes, self.seconds, sep, self.frames
        )
    }
}

impl Debug for Timecode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self, self.timebase)
    }
}
