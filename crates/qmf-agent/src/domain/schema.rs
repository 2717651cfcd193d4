//! Schema registry: package → class/event table.

use std::collections::BTreeMap;
use std::sync::Arc;

/// Producer of an opaque serialized schema blob.
pub type SchemaWriter = Arc<dyn Fn() -> Vec<u8> + Send + Sync>;

/// Whether a schema describes a table (object class) or an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    Table,
    Event,
}

/// Key of a schema within its package.
///
/// The 128-bit digest distinguishes versions of the same class name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SchemaClassKey {
    pub class_name: String,
    pub hash: [u8; 16],
}

impl SchemaClassKey {
    pub fn new(class_name: impl Into<String>, hash: [u8; 16]) -> Self {
        SchemaClassKey {
            class_name: class_name.into(),
            hash,
        }
    }
}

/// A registered schema. Never mutated after insertion.
#[derive(Clone)]
pub struct SchemaClass {
    pub kind: SchemaKind,
    pub write_schema: SchemaWriter,
}

impl std::fmt::Debug for SchemaClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaClass")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Classes of one package.
pub type ClassMap = BTreeMap<SchemaClassKey, SchemaClass>;

/// Insertion-only package table.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    packages: BTreeMap<String, ClassMap>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        SchemaRegistry::default()
    }

    /// Register a schema, creating its package on first sight.
    ///
    /// Re-registration with the same `(package, name, hash)` is an
    /// idempotent no-op. Returns whether the *package* was newly created,
    /// which is what triggers a package indication while connected.
    pub fn register(
        &mut self,
        package: &str,
        key: SchemaClassKey,
        kind: SchemaKind,
        write_schema: SchemaWriter,
    ) -> bool {
        let new_package = !self.packages.contains_key(package);
        let classes = self.packages.entry(package.to_string()).or_default();
        classes.entry(key).or_insert(SchemaClass { kind, write_schema });
        new_package
    }

    /// Look up a schema by package and key.
    pub fn find(&self, package: &str, key: &SchemaClassKey) -> Option<&SchemaClass> {
        self.packages.get(package)?.get(key)
    }

    pub fn package_count(&self) -> usize {
        self.packages.len()
    }

    pub fn class_count(&self, package: &str) -> usize {
        self.packages.get(package).map_or(0, BTreeMap::len)
    }
}
