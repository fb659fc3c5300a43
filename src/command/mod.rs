use std::str;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::resp::Resp;

mod replconf;
mod set;

pub use replconf::ReplConf;
pub use set::Set;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping(Option<Bytes>),
    Echo(Bytes),
    Get(Bytes),
    Set(Set),
    Del(Vec<Bytes>),
    Info(Option<String>),
    ReplConf(ReplConf),
    Psync { replid: String, offset: i64 },
    Wait { replicas: usize, timeout: Duration },
}

/// Errors are sent back verbatim, so `Display` is the reply text.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),

    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(&'static str),

    #[error("ERR syntax error")]
    Syntax,

    #[error("ERR value is not an integer or out of range")]
    NotAnInteger,

    #[error("ERR invalid expire time in '{0}' command")]
    InvalidExpire(&'static str),

    #[error("ERR Protocol error: expected an array of bulk strings")]
    IncorrectFormat,
}

impl Command {
    pub fn parse(frame: Resp) -> Result<Self, CommandError> {
        use CommandError::*;
        let Resp::Array(array) = frame else {
            return Err(IncorrectFormat);
        };
        let args = array
            .into_iter()
            .map(|part| match part {
                Resp::BulkString(bytes) => Ok(bytes),
                _ => Err(IncorrectFormat),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let (name, args) = args.split_first().ok_or(IncorrectFormat)?;

        let command = match name.to_ascii_uppercase().as_slice() {
            b"PING" => match args {
                [] => Self::Ping(None),
                [msg] => Self::Ping(Some(msg.clone())),
                _ => return Err(WrongArity("ping")),
            },
            b"ECHO" => match args {
                [msg] => Self::Echo(msg.clone()),
                _ => return Err(WrongArity("echo")),
            },
            b"GET" => match args {
                [key] => Self::Get(key.clone()),
                _ => return Err(WrongArity("get")),
            },
            b"SET" => Self::Set(Set::parse(args)?),
            b"DEL" => {
                if args.is_empty() {
                    return Err(WrongArity("del"));
                }
                Self::Del(args.to_vec())
            }
            b"INFO" => match args {
                [] => Self::Info(None),
                [section] => Self::Info(Some(utf8(section)?.to_ascii_lowercase())),
                _ => return Err(Syntax),
            },
            b"REPLCONF" => Self::ReplConf(ReplConf::parse(args)?),
            b"PSYNC" => match args {
                [replid, offset] => Self::Psync {
                    replid: utf8(replid)?.to_owned(),
                    offset: integer(offset)?,
                },
                _ => return Err(WrongArity("psync")),
            },
            b"WAIT" => match args {
                [replicas, timeout] => {
                    let replicas =
                        usize::try_from(integer(replicas)?).map_err(|_| NotAnInteger)?;
                    let timeout = u64::try_from(integer(timeout)?).map_err(|_| NotAnInteger)?;
                    Self::Wait {
                        replicas,
                        timeout: Duration::from_millis(timeout),
                    }
                }
                _ => return Err(WrongArity("wait")),
            },
            other => return Err(UnknownCommand(String::from_utf8_lossy(other).into_owned())),
        };
        Ok(command)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Ping(_) => "PING",
            Command::Echo(_) => "ECHO",
            Command::Get(_) => "GET",
            Command::Set(_) => "SET",
            Command::Del(_) => "DEL",
            Command::Info(_) => "INFO",
            Command::ReplConf(_) => "REPLCONF",
            Command::Psync { .. } => "PSYNC",
            Command::Wait { .. } => "WAIT",
        }
    }

    /// Commands that mutate the keyspace and therefore travel to replicas.
    pub fn is_write(&self) -> bool {
        matches!(self, Command::Set(_) | Command::Del(_))
    }
}

impl From<&Command> for Resp {
    fn from(command: &Command) -> Self {
        let mut array = vec![Bytes::from_static(command.name().as_bytes())];
        match command {
            Command::Ping(msg) => array.extend(msg.clone()),
            Command::Echo(msg) => array.push(msg.clone()),
            Command::Get(key) => array.push(key.clone()),
            Command::Set(set) => array.extend(set.args()),
            Command::Del(keys) => array.extend(keys.iter().cloned()),
            Command::Info(section) => array.extend(section.clone().map(Bytes::from)),
            Command::ReplConf(replconf) => array.extend(replconf.args()),
            Command::Psync { replid, offset } => {
                array.push(Bytes::from(replid.clone()));
                array.push(Bytes::from(offset.to_string()));
            }
            Command::Wait { replicas, timeout } => {
                array.push(Bytes::from(replicas.to_string()));
                array.push(Bytes::from(timeout.as_millis().to_string()));
            }
        }
        Resp::command(array)
    }
}

impl From<Command> for Resp {
    fn from(command: Command) -> Self {
        Resp::from(&command)
    }
}

fn utf8(arg: &Bytes) -> Result<&str, CommandError> {
    str::from_utf8(arg).map_err(|_| CommandError::Syntax)
}

fn integer(arg: &Bytes) -> Result<i64, CommandError> {
    str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(CommandError::NotAnInteger)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(parts: &[&str]) -> Result<Command, CommandError> {
        Command::parse(Resp::command(parts.iter().map(|p| p.to_string())))
    }

    #[test]
    fn command_names_are_case_insensitive() {
        assert_eq!(parse(&["pInG"]), Ok(Command::Ping(None)));
        assert_eq!(
            parse(&["echo", "hi"]),
            Ok(Command::Echo(Bytes::from("hi")))
        );
        assert_eq!(
            parse(&["InFo", "REPLICATION"]),
            Ok(Command::Info(Some("replication".into())))
        );
    }

    #[test]
    fn unknown_and_malformed_requests() {
        assert_eq!(
            parse(&["FLUSHALL"]),
            Err(CommandError::UnknownCommand("FLUSHALL".into()))
        );
        assert_eq!(parse(&["GET"]), Err(CommandError::WrongArity("get")));
        assert_eq!(
            Command::parse(Resp::simple_string("PING")),
            Err(CommandError::IncorrectFormat)
        );
        assert_eq!(
            Command::parse(Resp::array(vec![Resp::Integer(1)])),
            Err(CommandError::IncorrectFormat)
        );
        assert_eq!(
            CommandError::UnknownCommand("foo".into()).to_string(),
            "ERR unknown command 'foo'"
        );
    }

    #[test]
    fn psync_and_wait_arguments() {
        assert_eq!(
            parse(&["PSYNC", "?", "-1"]),
            Ok(Command::Psync {
                replid: "?".into(),
                offset: -1
            })
        );
        assert_eq!(
            parse(&["WAIT", "2", "500"]),
            Ok(Command::Wait {
                replicas: 2,
                timeout: Duration::from_millis(500)
            })
        );
        assert_eq!(
            parse(&["WAIT", "-1", "500"]),
            Err(CommandError::NotAnInteger)
        );
    }

    #[test]
    fn re_encodes_writes_for_propagation() {
        let command = parse(&["set", "a", "1"]).unwrap();
        assert!(command.is_write());
        assert_eq!(Resp::from(&command), Resp::command(["SET", "a", "1"]));

        let command = parse(&["del", "a", "b"]).unwrap();
        assert_eq!(Resp::from(command), Resp::command(["DEL", "a", "b"]));
    }
}
