//! Component descriptions: serializable metadata plus the code that builds instances.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::instance::ComponentFactory;
use super::ComponentError;
use crate::filter::Filter;
use crate::properties::PropertyMap;
use crate::service::ServiceScope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Cardinality {
    #[serde(rename = "0..1")]
    Optional,
    #[default]
    #[serde(rename = "1..1")]
    Mandatory,
    #[serde(rename = "0..n")]
    Multiple,
    #[serde(rename = "1..n")]
    AtLeastOne,
}

impl Cardinality {
    pub fn min(self) -> usize {
        match self {
            Cardinality::Optional | Cardinality::Multiple => 0,
            Cardinality::Mandatory | Cardinality::AtLeastOne => 1,
        }
    }

    pub fn is_multiple(self) -> bool {
        matches!(self, Cardinality::Multiple | Cardinality::AtLeastOne)
    }

    pub fn is_mandatory(self) -> bool {
        self.min() > 0
    }
}

impl fmt::Display for Cardinality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Cardinality::Optional => "0..1",
            Cardinality::Mandatory => "1..1",
            Cardinality::Multiple => "0..n",
            Cardinality::AtLeastOne => "1..n",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferencePolicy {
    /// Bound services never change while the component is active; losing one
    /// deactivates the component.
    #[default]
    Static,
    /// Bound services are swapped in place through bind/unbind.
    Dynamic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyOption {
    /// Keep the bound services as long as they remain available.
    #[default]
    Reluctant,
    /// Rebind when a better-ranked service appears.
    Greedy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReferenceMetadata {
    pub name: String,
    pub interface: String,
    #[serde(default)]
    pub cardinality: Cardinality,
    #[serde(default)]
    pub policy: ReferencePolicy,
    #[serde(default)]
    pub policy_option: PolicyOption,
    /// Extra filter every bound service must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl ReferenceMetadata {
    pub fn new(name: impl Into<String>, interface: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interface: interface.into(),
            cardinality: Cardinality::default(),
            policy: ReferencePolicy::default(),
            policy_option: PolicyOption::default(),
            target: None,
        }
    }

    pub fn cardinality(mut self, cardinality: Cardinality) -> Self {
        self.cardinality = cardinality;
        self
    }

    pub fn dynamic(mut self) -> Self {
        self.policy = ReferencePolicy::Dynamic;
        self
    }

    pub fn greedy(mut self) -> Self {
        self.policy_option = PolicyOption::Greedy;
        self
    }

    pub fn target(mut self, filter: impl Into<String>) -> Self {
        self.target = Some(filter.into());
        self
    }

    pub fn is_dynamic(&self) -> bool {
        self.policy == ReferencePolicy::Dynamic
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceMetadata {
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub scope: ServiceScope,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentMetadata {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Activate as soon as satisfied. Defaults to true for components that
    /// publish no service and false for those that do.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub immediate: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceMetadata>,
    #[serde(default)]
    pub references: Vec<ReferenceMetadata>,
    #[serde(default)]
    pub properties: PropertyMap,
}

impl ComponentMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            immediate: None,
            service: None,
            references: Vec::new(),
            properties: PropertyMap::new(),
        }
    }

    pub fn provides(mut self, interfaces: &[&str]) -> Self {
        self.service = Some(ServiceMetadata {
            interfaces: interfaces.iter().map(|s| (*s).to_owned()).collect(),
            scope: ServiceScope::Singleton,
        });
        self
    }

    pub fn scope(mut self, scope: ServiceScope) -> Self {
        if let Some(service) = &mut self.service {
            service.scope = scope;
        }
        self
    }

    pub fn reference(mut self, reference: ReferenceMetadata) -> Self {
        self.references.push(reference);
        self
    }

    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = Some(immediate);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<crate::PropertyValue>) -> Self {
        self.properties.insert(key, value);
        self
    }

    /// Whether the instance is created eagerly. Components with a bundle or
    /// prototype scoped service are always created on demand.
    pub fn is_immediate(&self) -> bool {
        match &self.service {
            None => true,
            Some(service) if service.scope != ServiceScope::Singleton => false,
            Some(_) => self.immediate.unwrap_or(false),
        }
    }

    pub fn provided_interfaces(&self) -> &[String] {
        self.service
            .as_ref()
            .map(|s| s.interfaces.as_slice())
            .unwrap_or_default()
    }

    pub fn reference_named(&self, name: &str) -> Option<&ReferenceMetadata> {
        self.references.iter().find(|r| r.name == name)
    }

    pub fn validate(&self) -> Result<(), ComponentError> {
        let invalid = |reason: String| ComponentError::InvalidDescription {
            component: self.name.clone(),
            reason,
        };
        if self.name.trim().is_empty() {
            return Err(invalid("component name is empty".into()));
        }
        if let Some(service) = &self.service {
            if service.interfaces.is_empty() {
                return Err(invalid("service declares no interfaces".into()));
            }
            if self.immediate == Some(true) && service.scope != ServiceScope::Singleton {
                return Err(invalid(format!(
                    "immediate components must use singleton scope, not {}",
                    service.scope.as_str()
                )));
            }
        }
        let mut names = HashSet::new();
        for reference in &self.references {
            if reference.name.is_empty() || reference.interface.is_empty() {
                return Err(invalid("references need a name and an interface".into()));
            }
            if !names.insert(reference.name.as_str()) {
                return Err(invalid(format!("duplicate reference '{}'", reference.name)));
            }
            if let Some(target) = &reference.target {
                Filter::parse(target).map_err(|e| {
                    invalid(format!("reference '{}' has a bad target: {e}", reference.name))
                })?;
            }
        }
        Ok(())
    }
}

/// Metadata together with the factory that creates instances.
#[derive(Clone)]
pub struct ComponentDescription {
    pub metadata: Arc<ComponentMetadata>,
    pub factory: Arc<dyn ComponentFactory>,
}

impl ComponentDescription {
    pub fn new(metadata: ComponentMetadata, factory: impl ComponentFactory + 'static) -> Self {
        Self {
            metadata: Arc::new(metadata),
            factory: Arc::new(factory),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

impl fmt::Debug for ComponentDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentDescription")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_deserializes_with_defaults() {
        let yaml = r#"
name: printer.queue
service:
  interfaces: [svc.Queue]
references:
  - name: printer
    interface: svc.Printer
    cardinality: "0..n"
    policy: dynamic
    policy_option: greedy
    target: "(color=true)"
  - name: log
    interface: svc.Log
properties:
  capacity: 10
"#;
        let meta: ComponentMetadata = serde_yaml::from_str(yaml).unwrap();
        assert!(meta.enabled);
        assert!(!meta.is_immediate());
        assert_eq!(meta.references[0].cardinality, Cardinality::Multiple);
        assert!(meta.references[0].is_dynamic());
        assert_eq!(meta.references[0].policy_option, PolicyOption::Greedy);
        assert_eq!(meta.references[1].cardinality, Cardinality::Mandatory);
        assert_eq!(meta.references[1].policy, ReferencePolicy::Static);
        assert_eq!(meta.properties.get("capacity").and_then(|v| v.as_i64()), Some(10));
        meta.validate().unwrap();
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = serde_yaml::from_str::<ComponentMetadata>("name: a\nlazy: true\n");
        assert!(err.is_err());
    }

    #[test]
    fn validation_catches_bad_descriptions() {
        let dup = ComponentMetadata::new("a")
            .reference(ReferenceMetadata::new("r", "x"))
            .reference(ReferenceMetadata::new("r", "y"));
        match dup.validate() {
            Err(ComponentError::InvalidDescription { component, reason }) => {
                assert_eq!(component, "a");
                assert!(reason.contains("duplicate reference"));
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let bad_target = ComponentMetadata::new("b")
            .reference(ReferenceMetadata::new("r", "x").target("(oops"));
        assert!(bad_target.validate().is_err());

        let scoped = ComponentMetadata::new("c")
            .provides(&["x"])
            .scope(ServiceScope::Prototype)
            .immediate(true);
        assert!(scoped.validate().is_err());
    }

    #[test]
    fn immediacy_defaults() {
        assert!(ComponentMetadata::new("a").is_immediate());
        assert!(!ComponentMetadata::new("b").provides(&["x"]).is_immediate());
        assert!(ComponentMetadata::new("c").provides(&["x"]).immediate(true).is_immediate());
        assert!(!ComponentMetadata::new("d")
            .provides(&["x"])
            .scope(ServiceScope::Bundle)
            .is_immediate());
    }
}
