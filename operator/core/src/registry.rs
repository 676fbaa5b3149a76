use crate::{
    provider::{BridgeMountProvider, BridgeProvider, ConnectionProvider, MountTarget},
    Error, Result,
};
use std::{collections::BTreeMap, sync::Arc};

type Constructor<C, P> = Box<dyn Fn(&C) -> Arc<P> + Send + Sync>;

/// Maps provider names to constructors.
pub struct Registry<C, P: ?Sized> {
    family: &'static str,
    constructors: BTreeMap<&'static str, Constructor<C, P>>,
}

pub type ConnectionProviders = Registry<(), dyn ConnectionProvider>;
pub type MountProviders = Registry<MountTarget, dyn BridgeMountProvider>;
pub type BridgeProviders = Registry<MountTarget, dyn BridgeProvider>;

impl<C, P: ?Sized> Registry<C, P> {
    pub fn new(family: &'static str) -> Self {
        Self {
            family,
            constructors: BTreeMap::new(),
        }
    }

    pub fn register(
        mut self,
        name: &'static str,
        constructor: impl Fn(&C) -> Arc<P> + Send + Sync + 'static,
    ) -> Self {
        self.constructors.insert(name, Box::new(constructor));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.constructors.keys().copied()
    }

    /// Builds the named provider; unknown names are a permanent error.
    pub fn build(&self, name: &str, context: &C) -> Result<Arc<P>> {
        let constructor = self.constructors.get(name).ok_or_else(|| {
            Error::permanent(format!("unknown {} provider '{name}'", self.family))
        })?;
        Ok(constructor(context))
    }
}

impl<C, P: ?Sized> std::fmt::Debug for Registry<C, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("family", &self.family)
            .field("names", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeConnection;
    use pretty_assertions::assert_eq;

    #[test]
    fn builds_registered_providers() {
        let registry = ConnectionProviders::new("connection")
            .register("stowaway", |_| Arc::new(FakeConnection::default()));
        assert!(registry.contains("stowaway"));
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["stowaway"]);
        assert!(registry.build("stowaway", &()).is_ok());

        let error = registry.build("wormhole", &()).err().unwrap();
        assert!(!error.is_transient());
        assert_eq!(error.to_string(), "unknown connection provider 'wormhole'");
    }
}
