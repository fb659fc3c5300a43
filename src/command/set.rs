use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use super::{integer, CommandError};
use crate::utils::get_epoch_ms;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Set {
    pub key: Bytes,
    pub value: Bytes,
    pub expiry: Option<Expiry>,
}

/// Relative expiry as the client spelled it, kept so propagation repeats it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    Ex(u64),
    Px(u64),
}

impl Expiry {
    pub fn duration(self) -> Duration {
        match self {
            Expiry::Ex(secs) => Duration::from_secs(secs),
            Expiry::Px(millis) => Duration::from_millis(millis),
        }
    }

    /// The deadline must fit both the monotonic clock and an absolute
    /// unix-ms timestamp in a signed 64-bit snapshot field.
    fn is_representable(self) -> bool {
        let millis = match self {
            Expiry::Ex(secs) => secs.checked_mul(1000),
            Expiry::Px(millis) => Some(millis),
        };
        let Some(millis) = millis else {
            return false;
        };
        millis <= (i64::MAX as u64).saturating_sub(get_epoch_ms())
            && Instant::now().checked_add(self.duration()).is_some()
    }
}

impl Set {
    pub fn parse(args: &[Bytes]) -> Result<Self, CommandError> {
        let [key, value, options @ ..] = args else {
            return Err(CommandError::WrongArity("set"));
        };
        let expiry = match options {
            [] => None,
            [unit, amount] => {
                let unit = unit.to_ascii_uppercase();
                if unit != b"PX" && unit != b"EX" {
                    return Err(CommandError::Syntax);
                }
                let amount = u64::try_from(integer(amount)?)
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or(CommandError::InvalidExpire("set"))?;
                let expiry = if unit == b"PX" {
                    Expiry::Px(amount)
                } else {
                    Expiry::Ex(amount)
                };
                if !expiry.is_representable() {
                    return Err(CommandError::InvalidExpire("set"));
                }
                Some(expiry)
            }
            _ => return Err(CommandError::Syntax),
        };
        Ok(Self {
            key: key.clone(),
            value: value.clone(),
            expiry,
        })
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.expiry.map(Expiry::duration)
    }

    pub(super) fn args(&self) -> Vec<Bytes> {
        let mut args = vec![self.key.clone(), self.value.clone()];
        match self.expiry {
            Some(Expiry::Px(ms)) => args.extend([Bytes::from_static(b"PX"), ms.to_string().into()]),
            Some(Expiry::Ex(s)) => args.extend([Bytes::from_static(b"EX"), s.to_string().into()]),
            None => {}
        }
        args
    }
}
