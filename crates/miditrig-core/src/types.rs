//! Note event types shared by the MIDI, HTTP and MQTT paths

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Human readable note name, e.g. `C4` for note 60
pub fn note_name(note: u8) -> String {
    let octave = (note / 12) as i16 - 1;
    format!("{}{}", NOTE_NAMES[(note % 12) as usize], octave)
}

/// JSON record published to and decoded from MQTT
///
/// All three fields are required when decoding; a payload that omits one
/// is rejected rather than merged with trigger defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotePayload {
    pub channel: u8,
    pub note: u8,
    pub velocity: u8,
}

impl NotePayload {
    pub fn new(channel: u8, note: u8, velocity: u8) -> Self {
        Self {
            channel,
            note,
            velocity,
        }
    }

    /// Decode a payload received over MQTT
    pub fn from_json(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Encode for publishing
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Note event received from a MIDI input port
///
/// A velocity of zero designates a note end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoteEvent {
    pub channel: u8,
    pub note: u8,
    pub velocity: u8,
}

impl NoteEvent {
    pub fn start(channel: u8, note: u8, velocity: u8) -> Self {
        Self {
            channel,
            note,
            velocity,
        }
    }

    pub fn end(channel: u8, note: u8) -> Self {
        Self {
            channel,
            note,
            velocity: 0,
        }
    }

    pub fn is_start(&self) -> bool {
        self.velocity != 0
    }

    pub fn payload(&self) -> NotePayload {
        NotePayload::new(self.channel, self.note, self.velocity)
    }

    /// Decode raw MIDI bytes. Anything other than note on/off yields `None`.
    pub fn decode(message: &[u8]) -> Option<Self> {
        if message.len() < 3 {
            return None;
        }

        let channel = message[0] & 0x0F;
        let note = message[1];
        let velocity = message[2];

        match message[0] & 0xF0 {
            0x90 if velocity > 0 => Some(Self::start(channel, note, velocity)),
            // Note on with velocity 0 is a running-status note off
            0x90 | 0x80 => Some(Self::end(channel, note)),
            _ => None,
        }
    }
}

impl fmt::Display for NoteEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "note {}({}) on channel {} with velocity {}",
            note_name(self.note),
            self.note,
            self.channel,
            self.velocity
        )
    }
}

/// Note message sent to a MIDI output port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteMessage {
    On { channel: u8, note: u8, velocity: u8 },
    Off { channel: u8, note: u8 },
}

impl NoteMessage {
    /// Build a note on, or a note off when velocity is zero
    pub fn from_parts(channel: u8, note: u8, velocity: u8) -> Self {
        if velocity == 0 {
            NoteMessage::Off { channel, note }
        } else {
            NoteMessage::On {
                channel,
                note,
                velocity,
            }
        }
    }

    pub fn is_on(&self) -> bool {
        matches!(self, NoteMessage::On { .. })
    }

    /// Wire bytes. Channel is masked to 4 bits, data bytes to 7 bits.
    pub fn to_bytes(&self) -> [u8; 3] {
        match *self {
            NoteMessage::On {
                channel,
                note,
                velocity,
            } => [0x90 | (channel & 0x0F), note & 0x7F, velocity & 0x7F],
            NoteMessage::Off { channel, note } => [0x80 | (channel & 0x0F), note & 0x7F, 0],
        }
    }

    /// Parse wire bytes back into a message
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        NoteEvent::decode(bytes)
            .map(|ev| Self::from_parts(ev.channel, ev.note, ev.velocity))
            .ok_or_else(|| Error::NotANote(bytes.to_vec()))
    }
}

impl From<NotePayload> for NoteMessage {
    fn from(p: NotePayload) -> Self {
        Self::from_parts(p.channel, p.note, p.velocity)
    }
}

impl fmt::Display for NoteMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            NoteMessage::On {
                channel,
                note,
                velocity,
            } => write!(
                f,
                "note on {}({}) channel {} velocity {}",
                note_name(note),
                note,
                channel,
                velocity
            ),
            NoteMessage::Off { channel, note } => write!(
                f,
                "note off {}({}) channel {}",
                note_name(note),
                note,
                channel
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_name() {
        assert_eq!(note_name(60), "C4");
        assert_eq!(note_name(61), "C#4");
        assert_eq!(note_name(0), "C-1");
    }

    #[test]
    fn test_decode_note_on() {
        assert_eq!(
            NoteEvent::decode(&[0x92, 64, 100]),
            Some(NoteEvent::start(2, 64, 100))
        );
    }

    #[test]
    fn test_decode_note_off_forms() {
        assert_eq!(NoteEvent::decode(&[0x80, 60, 64]), Some(NoteEvent::end(0, 60)));
        assert_eq!(NoteEvent::decode(&[0x91, 60, 0]), Some(NoteEvent::end(1, 60)));
    }

    #[test]
    fn test_decode_ignores_other_messages() {
        assert_eq!(NoteEvent::decode(&[0xB0, 1, 64]), None);
        assert_eq!(NoteEvent::decode(&[0xF8]), None);
        assert_eq!(NoteEvent::decode(&[0x90, 60]), None);
    }

    #[test]
    fn test_zero_velocity_is_note_off() {
        let msg = NoteMessage::from_parts(3, 60, 0);
        assert_eq!(msg, NoteMessage::Off { channel: 3, note: 60 });
        assert_eq!(msg.to_bytes(), [0x83, 60, 0]);
    }

    #[test]
    fn test_note_on_bytes_are_masked() {
        let msg = NoteMessage::from_parts(18, 200, 100);
        assert_eq!(msg.to_bytes(), [0x92, 200 & 0x7F, 100]);
    }

    #[test]
    fn test_payload_requires_all_fields() {
        assert!(NotePayload::from_json(br#"{"channel":2,"note":64}"#).is_err());
        let p = NotePayload::from_json(br#"{"channel":2,"note":64,"velocity":100}"#).unwrap();
        assert_eq!(p, NotePayload::new(2, 64, 100));
    }

    #[test]
    fn test_from_bytes_rejects_cc() {
        assert!(matches!(
            NoteMessage::from_bytes(&[0xB0, 7, 100]),
            Err(Error::NotANote(_))
        ));
    }
}
