use serde::{Deserialize, Serialize};

/// A tenant identity, normalized once at the boundary.
///
/// `friendly` is whatever the caller supplied ("Acme Corp"); `canonical` is
/// the lowercased slug used as the storage and isolation key ("acme-corp").
/// Two tenant ids are the same tenant iff their canonical keys are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId {
    pub friendly: String,
    pub canonical: String,
}

impl TenantId {
    pub fn new(raw: &str) -> Self {
        Self {
            friendly: raw.trim().to_string(),
            canonical: canonicalize(raw),
        }
    }

    pub fn key(&self) -> &str {
        &self.canonical
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical)
    }
}

/// Lowercase, trim, and collapse any run of non-alphanumeric characters to a
/// single dash. Empty input canonicalizes to "default".
fn canonicalize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_dash = false;
    for ch in raw.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if out.is_empty() {
        "default".to_string()
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_key_is_slugged() {
        let t = TenantId::new("  Acme Corp / EU  ");
        assert_eq!(t.friendly, "Acme Corp / EU");
        assert_eq!(t.canonical, "acme-corp-eu");
    }

    #[test]
    fn same_canonical_key_means_same_tenant() {
        assert_eq!(TenantId::new("Acme!").key(), TenantId::new("acme").key());
    }

    #[test]
    fn empty_input_maps_to_default() {
        assert_eq!(TenantId::new("   ").canonical, "default");
    }
}
