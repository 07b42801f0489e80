// SecretMasker: replaces registered secret values in log output.

use parking_lot::RwLock;
use std::sync::Arc;

/// Replacement text used when a secret is found.
const MASK: &str = "***";

/// A cloneable, thread-safe masker. Clones share the same secret set, so a
/// value registered while a job runs is masked everywhere.
#[derive(Debug, Clone, Default)]
pub struct SecretMasker {
    secrets: Arc<RwLock<Vec<String>>>,
}

impl SecretMasker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a secret value. Blank values are ignored.
    pub fn add_value(&self, secret: &str) {
        let trimmed = secret.trim();
        if trimmed.is_empty() {
            return;
        }

        let mut secrets = self.secrets.write();
        if !secrets.iter().any(|s| s == trimmed) {
            secrets.push(trimmed.to_string());
            // longest first, so a secret containing another is masked whole
            secrets.sort_by(|a, b| b.len().cmp(&a.len()));
        }
    }

    /// Replace all registered secret values in `input` with `***`.
    pub fn mask_secrets(&self, input: &str) -> String {
        let secrets = self.secrets.read();
        let mut result = input.to_string();
        for secret in secrets.iter() {
            if result.contains(secret.as_str()) {
                result = result.replace(secret.as_str(), MASK);
            }
        }
        result
    }

    pub fn secret_count(&self) -> usize {
        self.secrets.read().len()
    }
}
