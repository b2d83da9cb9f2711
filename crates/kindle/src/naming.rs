//! Cluster name generation and validation.

use uuid::Uuid;

/// Prefix of every generated cluster name.
pub const NAME_PREFIX: &str = "kindle-";

/// Number of random hex characters after the prefix.
pub const SUFFIX_LEN: usize = 8;

/// Longest name accepted; kind derives container hostnames from it.
pub const MAX_NAME_LENGTH: usize = 50;

/// Generate a fresh cluster name: `kindle-` followed by 8 random hex characters.
pub fn generate_cluster_name() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{NAME_PREFIX}{}", &suffix[..SUFFIX_LEN])
}

/// Check a caller-supplied name, returning a reason when it is unusable.
pub fn validate_cluster_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("cluster name must not be empty".to_string());
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(format!(
            "cluster name '{name}' is longer than {MAX_NAME_LENGTH} characters"
        ));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-' || *c == '.'))
    {
        return Err(format!(
            "cluster name '{name}' contains invalid character '{bad}'"
        ));
    }
    Ok(())
}
