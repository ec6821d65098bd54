//! # Step dependencies.
//!
//! [`Resources`] is a typed bag of shared services (database pools, clients,
//! configuration) handed to step handlers. Steps declare what they need with
//! [`Dependency::of`]; the runner refuses to run a step whose declared
//! dependencies are missing.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A declared dependency: a type the step expects to find in [`Resources`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Dependency {
    id: TypeId,
    name: &'static str,
}

impl Dependency {
    /// Dependency on a resource of type `T`.
    pub fn of<T: Any + Send + Sync>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// Type name, for diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Shared services keyed by type.
///
/// Cheap to clone; values are reference counted.
#[derive(Clone, Default)]
pub struct Resources {
    items: Arc<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl Resources {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) the resource of type `T`.
    pub fn with<T: Any + Send + Sync>(mut self, value: T) -> Self {
        Arc::make_mut(&mut self.items).insert(TypeId::of::<T>(), Arc::new(value));
        self
    }

    /// Resource of type `T`, if provided.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.items
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|item| item.downcast::<T>().ok())
    }

    /// Whether `dependency` is provided.
    pub fn provides(&self, dependency: &Dependency) -> bool {
        self.items.contains_key(&dependency.id)
    }

    /// First dependency of `required` that is not provided.
    pub fn first_missing<'a>(
        &self,
        required: impl IntoIterator<Item = &'a Dependency>,
    ) -> Option<&'a Dependency> {
        required.into_iter().find(|d| !self.provides(d))
    }
}

impl fmt::Debug for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resources")
            .field("len", &self.items.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Clock(u64);

    #[test]
    fn test_lookup_by_type() {
        let resources = Resources::new().with(Clock(7)).with(String::from("eu"));
        assert_eq!(resources.get::<Clock>().unwrap().0, 7);
        assert_eq!(resources.get::<String>().unwrap().as_str(), "eu");
        assert!(resources.get::<u32>().is_none());

        let deps = [Dependency::of::<Clock>(), Dependency::of::<u32>()];
        let missing = resources.first_missing(&deps).unwrap();
        assert_eq!(missing.name(), "u32");
    }

    #[test]
    fn test_clones_do_not_see_later_additions() {
        let base = Resources::new().with(Clock(1));
        let extended = base.clone().with(5u32);
        assert!(base.get::<u32>().is_none());
        assert_eq!(*extended.get::<u32>().unwrap(), 5);
    }
}
