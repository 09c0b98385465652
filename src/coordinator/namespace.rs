//! Namespace classifiers
//!
//! A classifier maps stores and regions to namespaces. Only the built-in
//! `default` classifier exists; it puts everything in one namespace.

use crate::common::{Error, Result};

pub const DEFAULT_CLASSIFIER: &str = "default";

/// Name of the only namespace the default classifier knows
pub const DEFAULT_NAMESPACE: &str = "global";

pub trait Classifier: Send + Sync {
    fn namespaces(&self) -> Vec<String>;

    fn is_namespace_exist(&self, name: &str) -> bool;
}

#[derive(Debug, Default)]
pub struct DefaultClassifier;

impl Classifier for DefaultClassifier {
    fn namespaces(&self) -> Vec<String> {
        vec![DEFAULT_NAMESPACE.to_string()]
    }

    fn is_namespace_exist(&self, name: &str) -> bool {
        name == DEFAULT_NAMESPACE
    }
}

pub fn create_classifier(name: &str) -> Result<Box<dyn Classifier>> {
    match name {
        DEFAULT_CLASSIFIER => Ok(Box::new(DefaultClassifier)),
        other => Err(Error::InvalidConfig(format!(
            "unknown namespace classifier {:?}",
            other
        ))),
    }
}
