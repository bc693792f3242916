//! Stable identities for response handlers.
//!
//! A [`Handler`] pairs a transform with a [`HandlerIdentity`]. The identity is
//! what gets fingerprinted, never the closure value itself, so the same
//! method referenced through an instance, through its type or through its
//! path string always yields the same [`Fingerprint`].

use std::any::{type_name, TypeId};
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use serde::Serialize;

use crate::{RequestError, Response, Result};

/// Behavior shared by values that expose a single call operation.
pub trait Invoke: Send + Sync + 'static {
    type Output: Serialize;

    fn invoke(&self, response: &Response) -> Result<Self::Output>;
}

/// Canonical identity of a handler, independent of how it was referenced.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum HandlerIdentity {
    /// Free function or method referenced by its qualified path.
    NamedFunction(String),
    /// Method referenced through its defining type.
    StaticMethod { type_name: String, method: String },
    /// Method referenced through an instance; only the instance's type matters.
    BoundMethod { type_name: String, method: String },
    /// Value exposing a single call operation.
    Invokable { type_name: String },
    /// Closure, identified by its compiler-assigned type and the place it
    /// was wrapped.
    ///
    /// Every closure expression has a distinct type, so closures forwarded
    /// through one helper still differ. Values of one closure expression share
    /// an identity whatever they capture.
    Anonymous { closure_type: String, site: String },
}

impl HandlerIdentity {
    /// String every representation of the same behavior normalizes to.
    pub fn canonical(&self) -> String {
        match self {
            Self::NamedFunction(path) => path.clone(),
            Self::StaticMethod { type_name, method } | Self::BoundMethod { type_name, method } => {
                format!("{type_name}::{method}")
            }
            Self::Invokable { type_name } => format!("{type_name}::invoke"),
            Self::Anonymous { closure_type, site } => format!("{closure_type}@{site}"),
        }
    }

    /// Fingerprint of [`HandlerIdentity::canonical`].
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.canonical())
    }
}

/// 32-bit digest of a handler's canonical identity.
///
/// Equal fingerprints mean "very likely the same behavior"; the space is small
/// enough that collisions are possible.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Fingerprint(u32);

impl Fingerprint {
    const FNV_OFFSET: u32 = 0x811c_9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;

    /// FNV-1a over the UTF-8 bytes of `canonical`.
    pub fn of(canonical: &str) -> Self {
        let hash = canonical.bytes().fold(Self::FNV_OFFSET, |hash, byte| {
            (hash ^ u32::from(byte)).wrapping_mul(Self::FNV_PRIME)
        });
        Self(hash)
    }

    /// Raw 32-bit digest.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

type TransformFn = dyn Fn(&Response) -> Result<serde_json::Value> + Send + Sync;

/// Transforms a response into the value a request resolves to.
#[derive(Clone)]
pub struct Handler {
    identity: HandlerIdentity,
    transform: Arc<TransformFn>,
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("identity", &self.identity)
            .field("fingerprint", &self.fingerprint().to_string())
            .finish()
    }
}

impl Handler {
    /// Handler referenced by a qualified path such as `"parsers::decode_user"`
    /// or `"app::User::from_response"`.
    ///
    /// A leading `::` is ignored.
    pub fn path<F, R>(path: impl AsRef<str>, transform: F) -> Result<Self>
    where
        F: Fn(&Response) -> Result<R> + Send + Sync + 'static,
        R: Serialize,
    {
        let path = path.as_ref().trim();
        let path = path.strip_prefix("::").unwrap_or(path);
        if path.is_empty() || !path.split("::").all(is_identifier) {
            return Err(RequestError::invalid_handler(format!(
                "'{path}' is not a qualified function path"
            )));
        }
        Ok(Self::from_parts(
            HandlerIdentity::NamedFunction(path.to_owned()),
            transform,
        ))
    }

    /// Handler referenced as method `method` of type `T`.
    pub fn method<T: ?Sized, F, R>(method: &str, transform: F) -> Result<Self>
    where
        F: Fn(&Response) -> Result<R> + Send + Sync + 'static,
        R: Serialize,
    {
        let method = validate_method(method)?;
        Ok(Self::from_parts(
            HandlerIdentity::StaticMethod {
                type_name: type_name::<T>().to_owned(),
                method,
            },
            transform,
        ))
    }

    /// Handler referenced as method `method` of `instance`.
    ///
    /// The instance is only used to resolve its type; it fingerprints the same
    /// as [`Handler::method`] on that type.
    pub fn bound<T, F, R>(instance: Arc<T>, method: &str, transform: F) -> Result<Self>
    where
        T: Send + Sync + 'static,
        F: Fn(&T, &Response) -> Result<R> + Send + Sync + 'static,
        R: Serialize,
    {
        let method = validate_method(method)?;
        let identity = HandlerIdentity::BoundMethod {
            type_name: type_name::<T>().to_owned(),
            method,
        };
        Ok(Self::from_parts(identity, move |response: &Response| {
            transform(&*instance, response)
        }))
    }

    /// Handler backed by a value implementing [`Invoke`].
    pub fn invokable<I: Invoke>(value: I) -> Self {
        let identity = HandlerIdentity::Invokable {
            type_name: type_name::<I>().to_owned(),
        };
        Self::from_parts(identity, move |response: &Response| value.invoke(response))
    }

    /// Handler backed by a closure, identified by the closure's type and the
    /// caller's source location.
    ///
    /// Two separately written closures never share an identity, even with
    /// identical bodies.
    #[track_caller]
    pub fn closure<F, R>(transform: F) -> Self
    where
        F: Fn(&Response) -> Result<R> + Send + Sync + 'static,
        R: Serialize,
    {
        let location = Location::caller();
        let site = format!(
            "{}:{}:{}",
            location.file(),
            location.line(),
            location.column()
        );
        let closure_type = format!("{}#{:?}", type_name::<F>(), TypeId::of::<F>());
        Self::from_parts(HandlerIdentity::Anonymous { closure_type, site }, transform)
    }

    fn from_parts<F, R>(identity: HandlerIdentity, transform: F) -> Self
    where
        F: Fn(&Response) -> Result<R> + Send + Sync + 'static,
        R: Serialize,
    {
        let transform = move |response: &Response| -> Result<serde_json::Value> {
            let output = transform(response)?;
            Ok(serde_json::to_value(output)?)
        };
        Self {
            identity,
            transform: Arc::new(transform),
        }
    }

    /// Identity this handler fingerprints as.
    pub fn identity(&self) -> &HandlerIdentity {
        &self.identity
    }

    /// Fingerprint of this handler's identity.
    pub fn fingerprint(&self) -> Fingerprint {
        self.identity.fingerprint()
    }

    pub(crate) fn apply(&self, response: &Response) -> Result<serde_json::Value> {
        (self.transform)(response)
    }
}

/// Fingerprint of a handler.
pub fn fingerprint(handler: &Handler) -> Fingerprint {
    handler.fingerprint()
}

fn validate_method(method: &str) -> Result<String> {
    let method = method.trim();
    if is_identifier(method) {
        Ok(method.to_owned())
    } else {
        Err(RequestError::invalid_handler(format!(
            "'{method}' is not a method name"
        )))
    }
}

fn is_identifier(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(first) if first == '_' || first.is_alphabetic() => {
            chars.all(|c| c == '_' || c.is_alphanumeric())
        }
        _ => false,
    }
}
