//! Транспортная кодировка задач и результатов через границу изоляции.
//!
//! Формат внутренний (bincode + serde) и не обязан быть стабильным между версиями.

use super::{
    errors::CodecError,
    value::Value,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
};


/// Жёсткий предел размера payload, защищает декодер от мусорных длин
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024 * 1024;

#[inline(always)]
fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<MAX_PAYLOAD_BYTES>()
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(bincode::serde::encode_to_vec(value, config())?)
}

/// Декодирует payload целиком: лишние байты в хвосте считаются ошибкой
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let (value, read) = bincode::serde::decode_from_slice::<T, _>(bytes, config())?;
    if read != bytes.len() {
        return Err(CodecError::TrailingBytes(bytes.len() - read));
    }
    Ok(value)
}


/// Вызов зарегистрированной функции: ссылка по имени плюс аргументы
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub function: String,
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
}

impl Task {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        }
    }

    pub fn with_args<I, V>(function: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self {
            function: function.into(),
            args: args.into_iter().map(Into::into).collect(),
            kwargs: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }
}


/// Снимок ошибки, поднятой внутри контекста
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedFailure {
    pub kind: String,
    pub message: String,
    pub causes: Vec<String>,
    pub function: String,
}

impl CapturedFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            causes: Vec::new(),
            function: function.into(),
        }
    }

    /// Снимает тип и цепочку причин с ошибки пользовательского кода
    pub fn capture(err: &anyhow::Error, function: &str) -> Self {
        let kind = err
            .downcast_ref::<Raised>()
            .map(|raised| raised.kind.clone())
            .unwrap_or_else(|| "Error".to_string());
        let message = match err.downcast_ref::<Raised>() {
            Some(raised) => raised.message.clone(),
            None => err.to_string(),
        };
        Self {
            kind,
            message,
            causes: err.chain().skip(1).map(|cause| cause.to_string()).collect(),
            function: function.to_string(),
        }
    }

    #[inline]
    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind == kind
    }
}

impl fmt::Display for CapturedFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} (in `{}`)", self.kind, self.message, self.function)?;
        for cause in &self.causes {
            write!(f, "; caused by: {}", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for CapturedFailure {}


/// Типизированная ошибка, которую пользовательская функция может поднять через `?`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Raised {
    kind: String,
    message: String,
}

impl Raised {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new("ValueError", message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    pub fn lookup_error(message: impl Into<String>) -> Self {
        Self::new("LookupError", message)
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}


/// То, что контекст отправляет обратно по своему каналу: ровно одно на задачу
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    Success(Value),
    Failure(CapturedFailure),
    /// Возвращённое значение не удалось закодировать внутри контекста
    Untransportable(String),
}

impl Outcome {
    /// Кодирует исход, откатываясь на `Untransportable`, если значение не сериализуется
    pub fn encode_or_report(&self) -> Vec<u8> {
        match encode(self) {
            Ok(bytes) => bytes,
            Err(err) => {
                let fallback = Outcome::Untransportable(err.to_string());
                // Untransportable содержит только строку
                encode(&fallback).unwrap_or_default()
            }
        }
    }
}
