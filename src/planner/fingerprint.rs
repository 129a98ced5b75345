//! Plan fingerprinting.
//!
//! A fingerprint identifies the exact step sequence of a plan, so an apply
//! can refuse to run anything other than the plan that was reviewed.

use sha2::{Digest, Sha256};

use crate::resource::PropertyMap;

use super::plan::Step;

/// Hasher for computing plan fingerprints.
#[derive(Debug, Default)]
pub struct PlanHasher;

impl PlanHasher {
    /// Creates a new plan hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the fingerprint of an ordered step sequence.
    #[must_use]
    pub fn fingerprint(&self, stack: &str, steps: &[Step]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(stack.as_bytes());

        for (index, step) in steps.iter().enumerate() {
            hasher.update(index.to_be_bytes());
            hasher.update(step.op.to_string().as_bytes());
            hasher.update(step.urn.as_str().as_bytes());

            for key in &step.keys {
                hasher.update(key.as_bytes());
            }
            for dependency in &step.depends_on {
                hasher.update(dependency.to_be_bytes());
            }

            // Old identity
            if let Some(id) = step.old.as_ref().and_then(|r| r.id.as_deref()) {
                hasher.update(id.as_bytes());
            }

            // New inputs
            if let Some(new) = &step.new {
                hasher.update(self.hash_inputs(&new.inputs).as_bytes());
            }
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash of a property map.
    ///
    /// Key order is preserved, so this is a hash of the canonical JSON form.
    #[must_use]
    pub fn hash_inputs(&self, inputs: &PropertyMap) -> String {
        let mut hasher = Sha256::new();
        if let Ok(json) = serde_json::to_vec(inputs) {
            hasher.update(&json);
        }
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::StepOp;
    use crate::resource::{Resource, TypeToken, Urn};

    fn step(path: &str) -> Step {
        let token = TypeToken::new("test:index:Thing");
        let urn = Urn::new("dev", None, &token, "a");
        let mut inputs = PropertyMap::new();
        inputs.insert("path", path);
        Step {
            op: StepOp::Create,
            urn: urn.clone(),
            type_token: token,
            old: None,
            new: Some(Resource::new(urn, inputs)),
            keys: Vec::new(),
            depends_on: Vec::new(),
            reason: String::from("new resource"),
        }
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let hasher = PlanHasher::new();
        assert_eq!(
            hasher.fingerprint("dev", &[step("/a/")]),
            hasher.fingerprint("dev", &[step("/a/")])
        );
    }

    #[test]
    fn test_fingerprint_changes_with_inputs() {
        let hasher = PlanHasher::new();
        assert_ne!(
            hasher.fingerprint("dev", &[step("/a/")]),
            hasher.fingerprint("dev", &[step("/b/")])
        );
        assert_ne!(
            hasher.fingerprint("dev", &[step("/a/")]),
            hasher.fingerprint("prod", &[step("/a/")])
        );
    }

    #[test]
    fn test_fingerprint_ignores_reason() {
        let hasher = PlanHasher::new();
        let mut reworded = step("/a/");
        reworded.reason = String::from("something else");
        assert_eq!(
            hasher.fingerprint("dev", &[step("/a/")]),
            hasher.fingerprint("dev", &[reworded])
        );
    }
}
