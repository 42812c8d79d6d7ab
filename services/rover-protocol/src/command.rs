use std::fmt;
use std::str::FromStr;

/// Every code the vehicle's receiver understands. One ASCII byte on the wire.
pub const COMMAND_CODES: [u8; 8] = *b"FBLRSVWX";

/// A single drive command. The set is closed: anything else is rejected
/// before it can reach a queue, a relay peer or the device link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Forward,
    Backward,
    Left,
    Right,
    Stop,
    SpeedLow,
    SpeedMed,
    SpeedHigh,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandParseError {
    #[error("empty command")]
    Empty,
    #[error("unrecognized command: {0:?}")]
    Unrecognized(String),
}

impl Command {
    pub const ALL: [Command; 8] = [
        Command::Forward,
        Command::Backward,
        Command::Left,
        Command::Right,
        Command::Stop,
        Command::SpeedLow,
        Command::SpeedMed,
        Command::SpeedHigh,
    ];

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'F' => Some(Self::Forward),
            b'B' => Some(Self::Backward),
            b'L' => Some(Self::Left),
            b'R' => Some(Self::Right),
            b'S' => Some(Self::Stop),
            b'V' => Some(Self::SpeedLow),
            b'W' => Some(Self::SpeedMed),
            b'X' => Some(Self::SpeedHigh),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::Forward => b'F',
            Self::Backward => b'B',
            Self::Left => b'L',
            Self::Right => b'R',
            Self::Stop => b'S',
            Self::SpeedLow => b'V',
            Self::SpeedMed => b'W',
            Self::SpeedHigh => b'X',
        }
    }

    pub fn as_char(self) -> char {
        self.as_byte() as char
    }

    /// Directional commands that put the vehicle in motion.
    pub fn is_movement(self) -> bool {
        matches!(
            self,
            Self::Forward | Self::Backward | Self::Left | Self::Right
        )
    }

    pub fn is_speed(self) -> bool {
        matches!(self, Self::SpeedLow | Self::SpeedMed | Self::SpeedHigh)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

impl TryFrom<u8> for Command {
    type Error = CommandParseError;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        Self::from_byte(b).ok_or_else(|| CommandParseError::Unrecognized((b as char).to_string()))
    }
}

/// Parses exactly one command code. Surrounding whitespace is ignored, case is not.
impl FromStr for Command {
    type Err = CommandParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.as_bytes() {
            [] => Err(CommandParseError::Empty),
            [b] => Self::from_byte(*b).ok_or_else(|| CommandParseError::Unrecognized(s.into())),
            _ => Err(CommandParseError::Unrecognized(s.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alphabet_is_closed() {
        for code in COMMAND_CODES {
            let cmd = Command::from_byte(code).unwrap();
            assert_eq!(cmd.as_byte(), code);
        }
        for b in 0u8..=255 {
            if !COMMAND_CODES.contains(&b) {
                assert!(Command::from_byte(b).is_none(), "byte {b} accepted");
            }
        }
    }

    #[test]
    fn test_parse_str() {
        assert_eq!(" L\n".parse::<Command>(), Ok(Command::Left));
        assert_eq!("".parse::<Command>(), Err(CommandParseError::Empty));
        assert_eq!(
            "Z".parse::<Command>(),
            Err(CommandParseError::Unrecognized("Z".into()))
        );
        assert!("f".parse::<Command>().is_err());
        assert!("FF".parse::<Command>().is_err());
    }

    #[test]
    fn test_families() {
        let movement: Vec<_> = Command::ALL.iter().filter(|c| c.is_movement()).collect();
        assert_eq!(movement.len(), 4);
        assert!(Command::SpeedHigh.is_speed());
        assert!(!Command::Stop.is_movement());
        assert!(!Command::Stop.is_speed());
    }
}
