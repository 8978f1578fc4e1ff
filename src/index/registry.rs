//! Layer and contributor registry.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::transaction::FileTransaction;
use crate::model::{Layer, LayerSchema, LayerSet};
use crate::types::{Result, SourceFile};

/// External producer of locations, edges and dependencies for a file.
///
/// A contributor is a pure function of the file: it reads whatever it needs
/// and records its findings on the transaction. It never touches storage.
pub trait Contributor: Send + Sync {
    /// Stable name used in logs and error reports.
    fn name(&self) -> &str;

    /// Whether this contributor handles `file`.
    fn accepts(&self, file: &SourceFile) -> bool {
        let _ = file;
        true
    }

    /// Records everything `file` contributes.
    fn process_file(&self, file: &SourceFile, transaction: &mut FileTransaction) -> Result<()>;
}

type ProcessFn = dyn Fn(&SourceFile, &mut FileTransaction) -> Result<()> + Send + Sync;

/// Contributor backed by a closure, restricted to paths with a suffix.
pub struct FnContributor {
    name: String,
    suffix: Option<String>,
    process: Box<ProcessFn>,
}

impl FnContributor {
    /// Wraps `process` as a contributor named `name` that accepts every file.
    pub fn new<F>(name: impl Into<String>, process: F) -> Self
    where
        F: Fn(&SourceFile, &mut FileTransaction) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            suffix: None,
            process: Box::new(process),
        }
    }

    /// Only accept files whose path ends with `suffix`.
    pub fn for_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = Some(suffix.into());
        self
    }
}

impl Contributor for FnContributor {
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts(&self, file: &SourceFile) -> bool {
        self.suffix
            .as_deref()
            .map_or(true, |suffix| file.path.ends_with(suffix))
    }

    fn process_file(&self, file: &SourceFile, transaction: &mut FileTransaction) -> Result<()> {
        (self.process)(file, transaction)
    }
}

/// Layers in registration order plus the contributors feeding them.
///
/// Registration order fixes the layer ordinals and therefore the on-disk
/// layout; build the configuration the same way on every run.
#[derive(Clone)]
pub struct IndexConfiguration {
    layers: Arc<LayerSet>,
    contributors: Vec<Arc<dyn Contributor>>,
}

impl IndexConfiguration {
    /// Starts an empty configuration.
    pub fn builder() -> IndexConfigurationBuilder {
        IndexConfigurationBuilder::default()
    }

    /// Registered layers, indexed by ordinal.
    pub fn layers(&self) -> &LayerSet {
        &self.layers
    }

    /// Shared handle on the layer set, for transactions.
    pub fn layers_arc(&self) -> Arc<LayerSet> {
        Arc::clone(&self.layers)
    }

    /// Fingerprint persisted in the index meta page.
    pub fn schema(&self) -> LayerSchema {
        self.layers.schema()
    }

    /// Registered layer named `name`.
    pub fn layer(&self, name: &str) -> Option<&Layer> {
        self.layers.by_name(name)
    }

    /// Every contributor, in registration order.
    pub fn contributors(&self) -> &[Arc<dyn Contributor>] {
        &self.contributors
    }

    /// Contributors that run on `file`, in registration order.
    pub fn find_processors(&self, file: &SourceFile) -> Vec<Arc<dyn Contributor>> {
        self.contributors
            .iter()
            .filter(|c| c.accepts(file))
            .cloned()
            .collect()
    }
}

impl fmt::Debug for IndexConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.contributors.iter().map(|c| c.name()).collect();
        f.debug_struct("IndexConfiguration")
            .field("layers", &self.layers)
            .field("contributors", &names)
            .finish()
    }
}

/// Builder for [`IndexConfiguration`].
#[derive(Default)]
pub struct IndexConfigurationBuilder {
    layers: Vec<Layer>,
    contributors: Vec<Arc<dyn Contributor>>,
}

impl IndexConfigurationBuilder {
    /// Appends a layer; its ordinal is its position.
    pub fn layer(mut self, layer: Layer) -> Self {
        self.layers.push(layer);
        self
    }

    /// Appends a contributor.
    pub fn contributor(mut self, contributor: impl Contributor + 'static) -> Self {
        self.contributors.push(Arc::new(contributor));
        self
    }

    /// Appends a contributor that is shared with other configurations.
    pub fn shared_contributor(mut self, contributor: Arc<dyn Contributor>) -> Self {
        self.contributors.push(contributor);
        self
    }

    /// Assigns ordinals in the order layers were added.
    ///
    /// # Errors
    /// * `IndexError::InvalidOwned` - a layer name is registered twice
    /// * `IndexError::Fatal` - a layer already carries an ordinal from
    ///   another configuration
    pub fn build(self) -> Result<IndexConfiguration> {
        let mut layers = LayerSet::new();
        for layer in self.layers {
            let ordinal = layers.register(layer.clone())?;
            debug!(layer = %layer.id(), ordinal, "index.config.layer");
        }
        Ok(IndexConfiguration {
            layers: Arc::new(layers),
            contributors: self.contributors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FailureClass, IndexError};

    fn noop(name: &str) -> FnContributor {
        FnContributor::new(name, |_, _| Ok(()))
    }

    #[test]
    fn find_processors_filters_by_acceptance() {
        let config = IndexConfiguration::builder()
            .layer(Layer::unidirectional("calls"))
            .contributor(noop("dart").for_suffix(".dart"))
            .contributor(noop("html").for_suffix(".html"))
            .contributor(noop("all"))
            .build()
            .unwrap();
        let names: Vec<String> = config
            .find_processors(&SourceFile::new("lib/main.dart", 0))
            .iter()
            .map(|c| c.name().to_owned())
            .collect();
        assert_eq!(names, vec!["dart", "all"]);
        assert_eq!(config.layer("calls").unwrap().ordinal().unwrap(), 0);
    }

    #[test]
    fn reusing_a_layer_in_two_configurations_is_fatal() {
        let calls = Layer::unidirectional("calls");
        IndexConfiguration::builder()
            .layer(calls.clone())
            .build()
            .unwrap();
        let err = IndexConfiguration::builder()
            .layer(Layer::unidirectional("first"))
            .layer(calls)
            .build()
            .unwrap_err();
        assert_eq!(err.class(), FailureClass::Fatal);
    }

    #[test]
    fn duplicate_layer_names_are_rejected() {
        let err = IndexConfiguration::builder()
            .layer(Layer::unidirectional("calls"))
            .layer(Layer::bidirectional("calls"))
            .build()
            .unwrap_err();
        assert!(matches!(err, IndexError::InvalidOwned(_)));
    }
}
