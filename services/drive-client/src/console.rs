//! Line-oriented operator console on stdin.

use rover_protocol::Command;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::warn;

use crate::pilot::PilotEvent;

/// Operator actions, independent of where they were typed or clicked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorInput {
    Press(Command),
    Release(Command),
    /// Raw code, validated by the queue.
    Send(String),
    Speed(Command),
    Connect,
    Disconnect,
    Auto(bool),
    Validate,
    Quit,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConsoleError {
    #[error("unknown console command {0:?} (try: press|release|send <C>, speed slow|med|fast, connect, disconnect, auto on|off, validate, quit)")]
    Unknown(String),
    #[error("{verb} needs a movement command (F, B, L or R)")]
    NotMovement { verb: &'static str },
    #[error("speed must be slow, med or fast")]
    BadSpeed,
    #[error("auto takes on or off")]
    BadToggle,
}

pub fn parse_line(line: &str) -> Result<Option<OperatorInput>, ConsoleError> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let arg = words.next().unwrap_or_default();

    let input = match verb.to_ascii_lowercase().as_str() {
        "press" => OperatorInput::Press(movement(arg, "press")?),
        "release" => OperatorInput::Release(movement(arg, "release")?),
        "send" => OperatorInput::Send(arg.to_string()),
        "speed" => OperatorInput::Speed(match arg {
            "slow" => Command::SpeedLow,
            "med" | "medium" => Command::SpeedMed,
            "fast" => Command::SpeedHigh,
            _ => return Err(ConsoleError::BadSpeed),
        }),
        "connect" => OperatorInput::Connect,
        "disconnect" => OperatorInput::Disconnect,
        "auto" => OperatorInput::Auto(match arg {
            "on" => true,
            "off" => false,
            _ => return Err(ConsoleError::BadToggle),
        }),
        "validate" => OperatorInput::Validate,
        "quit" | "exit" => OperatorInput::Quit,
        _ => return Err(ConsoleError::Unknown(verb.to_string())),
    };
    Ok(Some(input))
}

fn movement(arg: &str, verb: &'static str) -> Result<Command, ConsoleError> {
    match arg.to_ascii_uppercase().parse::<Command>() {
        Ok(cmd) if cmd.is_movement() => Ok(cmd),
        _ => Err(ConsoleError::NotMovement { verb }),
    }
}

/// Forward parsed stdin lines to the pilot. End of input quits.
pub async fn run(events: mpsc::UnboundedSender<PilotEvent>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match parse_line(&line) {
                Ok(Some(input)) => {
                    if events.send(PilotEvent::Input(input)).is_err() {
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("{e}"),
            },
            Ok(None) | Err(_) => {
                let _ = events.send(PilotEvent::Input(OperatorInput::Quit));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            parse_line("press f").unwrap(),
            Some(OperatorInput::Press(Command::Forward))
        );
        assert_eq!(
            parse_line("  release L ").unwrap(),
            Some(OperatorInput::Release(Command::Left))
        );
        assert_eq!(
            parse_line("speed fast").unwrap(),
            Some(OperatorInput::Speed(Command::SpeedHigh))
        );
        assert_eq!(parse_line("auto on").unwrap(), Some(OperatorInput::Auto(true)));
        assert_eq!(parse_line("send Z").unwrap(), Some(OperatorInput::Send("Z".into())));
        assert_eq!(parse_line("QUIT").unwrap(), Some(OperatorInput::Quit));
        assert_eq!(parse_line("   ").unwrap(), None);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            parse_line("press S"),
            Err(ConsoleError::NotMovement { verb: "press" })
        );
        assert_eq!(parse_line("speed warp"), Err(ConsoleError::BadSpeed));
        assert_eq!(parse_line("auto maybe"), Err(ConsoleError::BadToggle));
        assert!(matches!(parse_line("jump"), Err(ConsoleError::Unknown(_))));
    }
}
