use bytes::Bytes;

use super::{integer, utf8, CommandError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplConf {
    ListeningPort(u16),
    Capa(Vec<String>),
    GetAck,
    Ack(u64),
}

impl ReplConf {
    pub fn parse(args: &[Bytes]) -> Result<Self, CommandError> {
        let (option, values) = args
            .split_first()
            .ok_or(CommandError::WrongArity("replconf"))?;
        match option.to_ascii_lowercase().as_slice() {
            b"listening-port" => match values {
                [port] => u16::try_from(integer(port)?)
                    .map(Self::ListeningPort)
                    .map_err(|_| CommandError::NotAnInteger),
                _ => Err(CommandError::Syntax),
            },
            // `capa` may repeat: REPLCONF capa eof capa psync2
            b"capa" => {
                let mut capabilities = vec![];
                let mut rest = values;
                loop {
                    match rest {
                        [] => break,
                        [capa, tail @ ..] => {
                            capabilities.push(utf8(capa)?.to_owned());
                            rest = match tail {
                                [kw, tail @ ..] if kw.eq_ignore_ascii_case(b"capa") => tail,
                                _ => tail,
                            };
                        }
                    }
                }
                if capabilities.is_empty() {
                    return Err(CommandError::Syntax);
                }
                Ok(Self::Capa(capabilities))
            }
            b"getack" => Ok(Self::GetAck),
            b"ack" => match values {
                [offset] => u64::try_from(integer(offset)?)
                    .map(Self::Ack)
                    .map_err(|_| CommandError::NotAnInteger),
                _ => Err(CommandError::Syntax),
            },
            _ => Err(CommandError::Syntax),
        }
    }

    pub(super) fn args(&self) -> Vec<Bytes> {
        match self {
            ReplConf::ListeningPort(port) => {
                vec![Bytes::from_static(b"listening-port"), port.to_string().into()]
            }
            ReplConf::Capa(capabilities) => capabilities
                .iter()
                .flat_map(|c| [Bytes::from_static(b"capa"), Bytes::from(c.clone())])
                .collect(),
            ReplConf::GetAck => vec![Bytes::from_static(b"GETACK"), Bytes::from_static(b"*")],
            ReplConf::Ack(offset) => vec![Bytes::from_static(b"ACK"), offset.to_string().into()],
        }
    }
}
