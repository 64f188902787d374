//! The transport factories an engine can pick from, by kind.

use std::collections::BTreeMap;

use cape_transport::TransportFactory;

/// Transport factories keyed by [`TransportFactory::kind`].
#[derive(Default)]
pub struct TransportSet {
    factories: BTreeMap<&'static str, Box<dyn TransportFactory>>,
}

impl TransportSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a factory, replacing any earlier one of the same kind.
    #[must_use]
    pub fn with(mut self, factory: impl TransportFactory + 'static) -> Self {
        self.insert(Box::new(factory));
        self
    }

    pub fn insert(&mut self, factory: Box<dyn TransportFactory>) {
        self.factories.insert(factory.kind(), factory);
    }

    #[must_use]
    pub fn get(&self, kind: &str) -> Option<&dyn TransportFactory> {
        self.factories.get(kind).map(AsRef::as_ref)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for TransportSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.kinds()).finish()
    }
}
