//! Console command parsing

use loco_protocol::{Address, Direction};
use loco_throttle::ShareMode;
use thiserror::Error;

/// One line typed at the console
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Acquire { address: Address, mode: ShareMode },
    Speed { number: u16, speed: f32 },
    Direction { number: u16, direction: Direction },
    Function { number: u16, index: u8, on: bool },
    EmergencyStop { number: u16 },
    Release { number: u16 },
    Status { address: Address },
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq)]
pub enum ParseCommandError {
    #[error("unknown command '{0}' (try 'help')")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("invalid {what}: '{value}'")]
    Invalid { what: &'static str, value: String },
}

pub const HELP: &str = "\
acquire <addr>[L|S] [shared]   request a throttle
speed <addr> <0.0-1.0>         set speed
dir <addr> fwd|rev             set direction
fn <addr> <index> on|off       set a function
estop <addr>                   emergency stop
release <addr>                 give the address back
status <addr>                  show allocation state
quit                           release everything and exit";

/// Parse one input line; blank lines and `#` comments yield `None`
pub fn parse(line: &str) -> Result<Option<ConsoleCommand>, ParseCommandError> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    if verb.starts_with('#') {
        return Ok(None);
    }
    let args: Vec<&str> = words.collect();

    let command = match verb.to_ascii_lowercase().as_str() {
        "acquire" | "a" => {
            let (addr, mode) = match args.as_slice() {
                [addr] => (addr, ShareMode::Exclusive),
                [addr, "shared"] => (addr, ShareMode::Shared),
                _ => return Err(ParseCommandError::Usage("acquire <addr>[L|S] [shared]")),
            };
            ConsoleCommand::Acquire {
                address: parse_address(addr)?,
                mode,
            }
        }
        "speed" | "s" => match args.as_slice() {
            [addr, speed] => ConsoleCommand::Speed {
                number: parse_number(addr)?,
                speed: speed.parse().map_err(|_| invalid("speed", speed))?,
            },
            _ => return Err(ParseCommandError::Usage("speed <addr> <0.0-1.0>")),
        },
        "dir" | "d" => match args.as_slice() {
            [addr, dir] => ConsoleCommand::Direction {
                number: parse_number(addr)?,
                direction: match dir.to_ascii_lowercase().as_str() {
                    "fwd" | "f" | "forward" => Direction::Forward,
                    "rev" | "r" | "reverse" => Direction::Reverse,
                    _ => return Err(invalid("direction", dir)),
                },
            },
            _ => return Err(ParseCommandError::Usage("dir <addr> fwd|rev")),
        },
        "fn" | "f" => match args.as_slice() {
            [addr, index, state] => ConsoleCommand::Function {
                number: parse_number(addr)?,
                index: index.parse().map_err(|_| invalid("function", index))?,
                on: match state.to_ascii_lowercase().as_str() {
                    "on" | "1" => true,
                    "off" | "0" => false,
                    _ => return Err(invalid("function state", state)),
                },
            },
            _ => return Err(ParseCommandError::Usage("fn <addr> <index> on|off")),
        },
        "estop" | "e" => match args.as_slice() {
            [addr] => ConsoleCommand::EmergencyStop {
                number: parse_number(addr)?,
            },
            _ => return Err(ParseCommandError::Usage("estop <addr>")),
        },
        "release" | "r" => match args.as_slice() {
            [addr] => ConsoleCommand::Release {
                number: parse_number(addr)?,
            },
            _ => return Err(ParseCommandError::Usage("release <addr>")),
        },
        "status" => match args.as_slice() {
            [addr] => ConsoleCommand::Status {
                address: parse_address(addr)?,
            },
            _ => return Err(ParseCommandError::Usage("status <addr>")),
        },
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" | "q" => ConsoleCommand::Quit,
        _ => return Err(ParseCommandError::Unknown(verb.to_string())),
    };
    Ok(Some(command))
}

fn invalid(what: &'static str, value: &str) -> ParseCommandError {
    ParseCommandError::Invalid {
        what,
        value: value.to_string(),
    }
}

fn parse_number(text: &str) -> Result<u16, ParseCommandError> {
    parse_address(text).map(|a| a.number())
}

/// `3` infers the form, `3S` forces short, `3L` forces long
fn parse_address(text: &str) -> Result<Address, ParseCommandError> {
    let upper = text.to_ascii_uppercase();
    let (digits, build): (&str, fn(u16) -> Address) = if let Some(d) = upper.strip_suffix('L') {
        (d, Address::long)
    } else if let Some(d) = upper.strip_suffix('S') {
        (d, Address::short)
    } else {
        (upper.as_str(), Address::infer)
    };
    digits
        .parse()
        .map(build)
        .map_err(|_| invalid("address", text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_acquire_forms() {
        assert_eq!(
            parse("acquire 3").unwrap(),
            Some(ConsoleCommand::Acquire {
                address: Address::infer(3),
                mode: ShareMode::Exclusive
            })
        );
        assert_eq!(
            parse("a 3L shared").unwrap(),
            Some(ConsoleCommand::Acquire {
                address: Address::long(3),
                mode: ShareMode::Shared
            })
        );
        assert!(matches!(
            parse("acquire"),
            Err(ParseCommandError::Usage(_))
        ));
    }

    #[test]
    fn test_parse_operations() {
        assert_eq!(
            parse("speed 3 0.5").unwrap(),
            Some(ConsoleCommand::Speed {
                number: 3,
                speed: 0.5
            })
        );
        assert_eq!(
            parse("dir 1234 rev").unwrap(),
            Some(ConsoleCommand::Direction {
                number: 1234,
                direction: Direction::Reverse
            })
        );
        assert_eq!(
            parse("fn 3 12 on").unwrap(),
            Some(ConsoleCommand::Function {
                number: 3,
                index: 12,
                on: true
            })
        );
        assert_eq!(
            parse("estop 3").unwrap(),
            Some(ConsoleCommand::EmergencyStop { number: 3 })
        );
        assert_eq!(parse("QUIT").unwrap(), Some(ConsoleCommand::Quit));
    }

    #[test]
    fn test_blank_and_comment_lines() {
        assert_eq!(parse("").unwrap(), None);
        assert_eq!(parse("   # yard goat").unwrap(), None);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            parse("whistle 3"),
            Err(ParseCommandError::Unknown("whistle".into()))
        );
        assert!(matches!(
            parse("speed 3 fast"),
            Err(ParseCommandError::Invalid { what: "speed", .. })
        ));
        assert!(matches!(
            parse("dir x fwd"),
            Err(ParseCommandError::Invalid { what: "address", .. })
        ));
    }

    proptest! {
        #[test]
        fn parse_never_panics(line in ".{0,40}") {
            let _ = parse(&line);
        }
    }
}
