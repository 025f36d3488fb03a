//! Topic registry binding wire topic names to typed message payloads.
//!
//! Publishers and consumers are parameterized by payload type. The registry
//! recovers the wire name for a type and allocates empty payloads to decode
//! into, so topic naming lives in one collision-checked place instead of at
//! every call site.
//!
//! A registry is an ordinary value: build it once at startup and hand it
//! (usually behind an `Arc`) to whatever constructs publishers and consumers.
//!
//! # Example
//!
//! ```
//! use messaging_topics::register_topics;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Default, Serialize, Deserialize)]
//! struct FileUpload {
//!     path: String,
//! }
//!
//! let registry = register_topics![FileUpload => "file.upload"].unwrap();
//! assert_eq!(registry.name_of::<FileUpload>().unwrap().as_ref(), "file.upload");
//! ```

use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// A message payload that can travel over a topic.
///
/// Every serde type with a `Default` is a payload; the wire format is JSON.
pub trait Payload: Default + Send + Sync + 'static {
    /// Serializes the payload to its wire bytes.
    fn encode(&self) -> serde_json::Result<Vec<u8>>;

    /// Decodes wire bytes into an already allocated payload.
    fn decode_into(&mut self, bytes: &[u8]) -> serde_json::Result<()>;
}

impl<T> Payload for T
where
    T: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
{
    fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    fn decode_into(&mut self, bytes: &[u8]) -> serde_json::Result<()> {
        *self = serde_json::from_slice(bytes)?;
        Ok(())
    }
}

/// Errors raised by the topic registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The topic name is already bound to another payload type.
    #[error("topic '{name}' is already bound to {existing}")]
    NameTaken {
        name: String,
        existing: &'static str,
    },

    /// The payload type is already bound to another topic name.
    #[error("type {type_name} is already bound to topic '{existing}'")]
    TypeTaken {
        type_name: &'static str,
        existing: String,
    },

    /// The payload type was never registered.
    #[error("type {0} has no registered topic")]
    Unregistered(&'static str),
}

/// Handle for a topic carrying payloads of type `T`.
pub struct Topic<T> {
    name: Arc<str>,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Topic<T> {
    fn new(name: Arc<str>) -> Self {
        Self {
            name,
            _payload: PhantomData,
        }
    }

    /// The wire name of the topic.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T: Payload> Topic<T> {
    /// Allocates an empty payload to decode a record into.
    pub fn allocate(&self) -> T {
        T::default()
    }
}

impl<T> Clone for Topic<T> {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.name))
    }
}

impl<T> fmt::Debug for Topic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("payload", &type_name::<T>())
            .finish()
    }
}

struct Binding {
    type_id: TypeId,
    type_name: &'static str,
}

#[derive(Default)]
struct Bindings {
    by_type: HashMap<TypeId, Arc<str>>,
    by_name: HashMap<Arc<str>, Binding>,
}

/// Bidirectional mapping between wire topic names and payload types.
///
/// Writes happen during startup registration; afterwards the registry is
/// read concurrently by every publisher and consumer constructor.
#[derive(Default)]
pub struct TopicRegistry {
    bindings: RwLock<Bindings>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds payload type `T` to the topic `name`.
    ///
    /// Registering the same pair twice returns the existing handle. Binding
    /// either side to a different counterpart fails.
    pub fn register<T: Payload>(&self, name: impl Into<String>) -> Result<Topic<T>, RegistryError> {
        let name = name.into();
        let type_id = TypeId::of::<T>();
        let mut bindings = self.bindings.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = bindings.by_type.get(&type_id) {
            if existing.as_ref() == name {
                return Ok(Topic::new(Arc::clone(existing)));
            }
            return Err(RegistryError::TypeTaken {
                type_name: type_name::<T>(),
                existing: existing.to_string(),
            });
        }

        if let Some(binding) = bindings.by_name.get(name.as_str()) {
            return Err(RegistryError::NameTaken {
                name,
                existing: binding.type_name,
            });
        }

        let name: Arc<str> = Arc::from(name);
        bindings.by_type.insert(type_id, Arc::clone(&name));
        bindings.by_name.insert(
            Arc::clone(&name),
            Binding {
                type_id,
                type_name: type_name::<T>(),
            },
        );

        Ok(Topic::new(name))
    }

    /// Returns the wire name bound to payload type `T`.
    pub fn name_of<T: Payload>(&self) -> Result<Arc<str>, RegistryError> {
        let bindings = self.bindings.read().unwrap_or_else(PoisonError::into_inner);
        bindings
            .by_type
            .get(&TypeId::of::<T>())
            .cloned()
            .ok_or(RegistryError::Unregistered(type_name::<T>()))
    }

    /// Returns the payload type bound to the topic `name`.
    pub fn type_of(&self, name: &str) -> Option<TypeId> {
        let bindings = self.bindings.read().unwrap_or_else(PoisonError::into_inner);
        bindings.by_name.get(name).map(|binding| binding.type_id)
    }

    /// Returns the topic handle for payload type `T`.
    pub fn topic<T: Payload>(&self) -> Result<Topic<T>, RegistryError> {
        self.name_of::<T>().map(Topic::new)
    }

    /// Allocates an empty payload of a registered type.
    pub fn allocate<T: Payload>(&self) -> Result<T, RegistryError> {
        self.topic::<T>().map(|topic| topic.allocate())
    }

    /// Number of registered topics.
    pub fn len(&self) -> usize {
        self.bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_name
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for TopicRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bindings = self.bindings.read().unwrap_or_else(PoisonError::into_inner);
        let mut map = f.debug_map();
        for (name, binding) in &bindings.by_name {
            map.entry(name, &binding.type_name);
        }
        map.finish()
    }
}

/// Builds a [`TopicRegistry`] from `Type => "name"` pairs.
///
/// Evaluates to `Result<TopicRegistry, RegistryError>`; the first conflicting
/// binding stops registration.
///
/// # Example
///
/// ```
/// use messaging_topics::register_topics;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Default, Serialize, Deserialize)]
/// struct UserCreated {
///     user_id: String,
/// }
///
/// #[derive(Debug, Default, Serialize, Deserialize)]
/// struct OcrResult {
///     text: String,
/// }
///
/// let registry = register_topics![
///     UserCreated => "user.created",
///     OcrResult => "ocr.result",
/// ]
/// .unwrap();
/// assert_eq!(registry.len(), 2);
/// ```
#[macro_export]
macro_rules! register_topics {
    ($($payload:ty => $name:expr),* $(,)?) => {{
        let registry = $crate::TopicRegistry::new();
        #[allow(unused_mut)]
        let mut result: ::std::result::Result<(), $crate::RegistryError> = Ok(());
        $(
            if result.is_ok() {
                result = registry.register::<$payload>($name).map(|_| ());
            }
        )*
        result.map(|()| registry)
    }};
}
