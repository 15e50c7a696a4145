use crate::domain::payload::{Payload, PayloadMap};

/// Positional and keyword arguments of one call
///
/// Packing into a request payload:
/// - no arguments: no payload
/// - one positional argument only: that value
/// - keyword arguments only: the keyword mapping
/// - anything else: the positional list, with the keyword mapping appended when present
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    positional: Vec<Payload>,
    keywords:   PayloadMap
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<Payload>) -> Self {
        self.positional.push(value.into());
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Payload>) -> Self {
        self.keywords.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keywords.is_empty()
    }

    pub fn pack(self) -> Option<Payload> {
        let CallArgs { mut positional, keywords } = self;

        match (positional.len(), keywords.is_empty()) {
            (0, true) => None,
            (1, true) => positional.pop(),
            (0, false) => Some(Payload::Map(keywords)),
            (_, true) => Some(Payload::List(positional)),
            (_, false) => {
                positional.push(Payload::Map(keywords));
                Some(Payload::List(positional))
            }
        }
    }
}

impl<T: Into<Payload>> From<Vec<T>> for CallArgs {
    fn from(values: Vec<T>) -> Self {
        values.into_iter().fold(CallArgs::new(), CallArgs::arg)
    }
}
