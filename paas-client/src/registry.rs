// Subclass registry
// Maps a server-side class name to a factory for the client-side model type.
// Payloads whose `className` has no factory become a GenericObject.

use serde_json::{Map, Value};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Field carrying the type tag of a server payload.
pub const CLASS_NAME_FIELD: &str = "className";

const RESERVED_CLASSES: &[&str] = &["_User", "_Role", "_Installation", "_File", "_Conversation"];

/// A materialized server object.
pub trait PaasObject: Send + Sync + fmt::Debug + Any {
    fn class_name(&self) -> Option<&str>;

    fn object_id(&self) -> Option<&str>;

    fn as_any(&self) -> &dyn Any;
}

impl dyn PaasObject {
    pub fn downcast_ref<T: PaasObject>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn is<T: PaasObject>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

pub type ObjectFactory = Arc<dyn Fn(&Map<String, Value>) -> Box<dyn PaasObject> + Send + Sync>;

/// Untyped fallback container.
#[derive(Debug, Clone, PartialEq)]
pub struct GenericObject {
    pub class_name: Option<String>,
    pub fields: Map<String, Value>,
}

impl GenericObject {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

impl PaasObject for GenericObject {
    fn class_name(&self) -> Option<&str> {
        self.class_name.as_deref()
    }

    fn object_id(&self) -> Option<&str> {
        self.fields.get("objectId").and_then(Value::as_str)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
pub struct SubclassRegistry {
    factories: HashMap<String, ObjectFactory>,
}

impl SubclassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid_name(name: &str) -> bool {
        if RESERVED_CLASSES.contains(&name) {
            return true;
        }
        let mut chars = name.chars();
        match chars.next() {
            Some(first) if first.is_ascii_alphabetic() => {
                chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            _ => false,
        }
    }

    /// Registers `factory` for `type_name`. Returns false for invalid names.
    /// A later registration for the same name replaces the earlier one.
    pub fn register(&mut self, type_name: &str, factory: ObjectFactory) -> bool {
        if !Self::is_valid_name(type_name) {
            warn!("Refusing to register invalid class name {:?}", type_name);
            return false;
        }
        if self.factories.insert(type_name.to_string(), factory).is_some() {
            debug!("Replaced factory for class {}", type_name);
        } else {
            debug!("Registered factory for class {}", type_name);
        }
        true
    }

    pub fn resolve(&self, type_name: &str) -> Option<ObjectFactory> {
        self.factories.get(type_name).cloned()
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Builds an object from a payload. Never fails.
    pub fn materialize(&self, value: &Value) -> Box<dyn PaasObject> {
        materialize_with(value, |name| self.resolve(name))
    }
}

impl fmt::Debug for SubclassRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("SubclassRegistry")
            .field("classes", &names)
            .finish()
    }
}

pub(crate) fn materialize_with<F>(value: &Value, resolve: F) -> Box<dyn PaasObject>
where
    F: FnOnce(&str) -> Option<ObjectFactory>,
{
    let Some(fields) = value.as_object() else {
        let mut fields = Map::new();
        fields.insert("value".to_string(), value.clone());
        return Box::new(GenericObject {
            class_name: None,
            fields,
        });
    };

    let class_name = fields
        .get(CLASS_NAME_FIELD)
        .and_then(Value::as_str)
        .map(str::to_string);

    if let Some(factory) = class_name.as_deref().and_then(resolve) {
        return factory(fields);
    }

    if let Some(name) = &class_name {
        debug!("No factory for class {}, using generic object", name);
    }
    Box::new(GenericObject {
        class_name,
        fields: fields.clone(),
    })
}
