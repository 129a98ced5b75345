//! Resource records and registrations.

use serde::{Deserialize, Serialize};

use super::property::{OutputRef, PropertyKey, PropertyMap, PropertyValue};
use super::urn::{TypeToken, Urn};

/// A declared or recorded resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Unique identity.
    pub urn: Urn,
    /// Resource type.
    #[serde(rename = "type")]
    pub type_token: TypeToken,
    /// Provider-assigned ID once created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Desired or last-applied inputs.
    pub inputs: PropertyMap,
    /// Outputs reported by the provider.
    #[serde(default, skip_serializing_if = "PropertyMap::is_empty")]
    pub outputs: PropertyMap,
    /// Explicit dependencies.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Urn>,
    /// Parent resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Urn>,
}

impl Resource {
    /// Creates a resource with no ID, outputs or dependencies.
    #[must_use]
    pub fn new(urn: Urn, inputs: PropertyMap) -> Self {
        Self {
            type_token: urn.type_token(),
            urn,
            id: None,
            inputs,
            outputs: PropertyMap::new(),
            dependencies: Vec::new(),
            parent: None,
        }
    }

    /// Sets the provider ID.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the outputs.
    #[must_use]
    pub fn with_outputs(mut self, outputs: PropertyMap) -> Self {
        self.outputs = outputs;
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn with_dependency(mut self, urn: Urn) -> Self {
        self.dependencies.push(urn);
        self
    }

    /// Logical name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.urn.name()
    }

    /// Every resource this one depends on: parent, explicit, then implicit.
    ///
    /// Implicit dependencies come from output references in the inputs.
    /// The list is deduplicated and never contains the resource itself.
    #[must_use]
    pub fn all_dependencies(&self) -> Vec<Urn> {
        let mut deps: Vec<Urn> = Vec::new();
        let implicit = self.inputs.output_refs().into_iter().map(|r| &r.urn);
        for urn in self.parent.iter().chain(&self.dependencies).chain(implicit) {
            if urn != &self.urn && !deps.contains(urn) {
                deps.push(urn.clone());
            }
        }
        deps
    }

    /// Input keys that reference the given resource.
    #[must_use]
    pub fn keys_referencing(&self, urn: &Urn) -> Vec<PropertyKey> {
        self.inputs.keys_referencing(urn)
    }

    /// Value an output reference to this resource resolves to.
    ///
    /// Without a property the reference resolves to the ID. Named
    /// properties are looked up in outputs, then in inputs.
    #[must_use]
    pub fn output_value(&self, reference: &OutputRef) -> Option<PropertyValue> {
        match &reference.property {
            None => self.id.clone().map(PropertyValue::String),
            Some(key) => self
                .outputs
                .get_set(key)
                .or_else(|| self.inputs.get_set(key))
                .filter(|v| !v.contains_computed())
                .cloned(),
        }
    }
}

/// A resource as declared by the program, before it has a URN.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRegistration {
    /// Resource type.
    pub type_token: TypeToken,
    /// Logical name.
    pub name: String,
    /// Parent resource.
    pub parent: Option<Urn>,
    /// Desired inputs.
    pub inputs: PropertyMap,
    /// Explicit dependencies.
    pub dependencies: Vec<Urn>,
}

impl ResourceRegistration {
    /// Creates a registration.
    #[must_use]
    pub fn new(type_token: impl Into<TypeToken>, name: impl Into<String>, inputs: PropertyMap) -> Self {
        Self {
            type_token: type_token.into(),
            name: name.into(),
            parent: None,
            inputs,
            dependencies: Vec::new(),
        }
    }

    /// Sets the parent.
    #[must_use]
    pub fn with_parent(mut self, parent: Urn) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn with_dependency(mut self, urn: Urn) -> Self {
        self.dependencies.push(urn);
        self
    }

    /// Checks the name and type can form a URN.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.name.is_empty() {
            return Err(String::from("name is empty"));
        }
        if self.name.contains("::") {
            return Err(String::from("name must not contain '::'"));
        }
        self.type_token.validate()
    }

    /// URN this registration produces in a stack.
    #[must_use]
    pub fn urn(&self, stack: &str) -> Urn {
        Urn::new(stack, self.parent.as_ref(), &self.type_token, &self.name)
    }

    /// Converts into a resource record.
    #[must_use]
    pub fn into_resource(self, stack: &str) -> Resource {
        let urn = self.urn(stack);
        Resource {
            urn,
            type_token: self.type_token,
            id: None,
            inputs: self.inputs,
            outputs: PropertyMap::new(),
            dependencies: self.dependencies,
            parent: self.parent,
        }
    }
}
