//! Opaque identifiers of fixed shape: a short prefix plus a v4 UUID in
//! simple (dashless) form, e.g. `bld_4f1c29aa...`.

use uuid::Uuid;

fn prefixed(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

pub fn new_spec_id() -> String {
    prefixed("spec")
}

pub fn new_plan_id() -> String {
    prefixed("plan")
}

pub fn new_build_id() -> String {
    prefixed("bld")
}

pub fn new_step_id() -> String {
    prefixed("step")
}

pub fn new_artifact_id() -> String {
    prefixed("art")
}

pub fn new_gate_id() -> String {
    prefixed("gate")
}

pub fn new_fix_id() -> String {
    prefixed("fix")
}

pub fn new_correlation_id() -> String {
    prefixed("corr")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_prefix_and_fixed_length() {
        let id = new_build_id();
        assert!(id.starts_with("bld_"));
        assert_eq!(id.len(), "bld_".len() + 32);

        let other = new_build_id();
        assert_ne!(id, other);
    }
}
