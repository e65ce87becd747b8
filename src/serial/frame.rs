//! Fixed five-byte relay frames shared by commands and acknowledgements:
//!
//! ```text
//! [STX][channel][state 0|1][checksum][ETX]
//! ```
//!
//! `checksum = (channel + state) mod 256`. An acknowledgement uses the same
//! layout, echoing the channel and carrying the state the board actually
//! applied.

use crate::error::LinkError;

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
pub const FRAME_LEN: usize = 5;

pub type Frame = [u8; FRAME_LEN];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayFrame {
    pub channel: u8,
    pub on: bool,
}

impl RelayFrame {
    pub fn new(channel: u8, on: bool) -> Self {
        Self { channel, on }
    }

    pub fn encode(&self) -> Frame {
        let state = u8::from(self.on);
        [STX, self.channel, state, checksum(self.channel, state), ETX]
    }

    /// Parses a received frame. Nothing is returned unless every byte checks out.
    pub fn decode(bytes: &Frame) -> Result<Self, LinkError> {
        let [stx, channel, state, sum, etx] = *bytes;

        if stx != STX || etx != ETX {
            return Err(LinkError::Parse(format!("bad frame delimiters in {bytes:02x?}")));
        }
        if sum != checksum(channel, state) {
            return Err(LinkError::Parse(format!(
                "checksum mismatch: got {sum:#04x}, expected {:#04x}",
                checksum(channel, state)
            )));
        }
        let on = match state {
            0 => false,
            1 => true,
            other => return Err(LinkError::Parse(format!("invalid state byte {other:#04x}"))),
        };

        Ok(Self { channel, on })
    }
}

fn checksum(channel: u8, state: u8) -> u8 {
    channel.wrapping_add(state)
}
