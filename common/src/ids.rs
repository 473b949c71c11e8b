use ulid::Ulid;

/// Generates a new lexicographically-sortable run identifier.
#[must_use]
pub fn new_run_id() -> String {
    Ulid::new().to_string()
}

/// Whether `value` is shaped like a UUID (36 chars, 4 hyphens) or a ULID
/// (26 uppercase alphanumeric chars) — the two identifier shapes backends
/// reject when they only accept natural-language node names.
#[must_use]
pub fn looks_like_uuid_or_ulid(value: &str) -> bool {
    if value.len() == 36 && value.chars().filter(|c| *c == '-').count() == 4 {
        return true;
    }
    if value.len() == 26
        && value.chars().all(|c| c.is_ascii_alphanumeric())
        && value.chars().all(|c| !c.is_ascii_lowercase())
    {
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_uuid_shape() {
        assert!(looks_like_uuid_or_ulid(
            "550e8400-e29b-41d4-a716-446655440000"
        ));
    }

    #[test]
    fn detects_ulid_shape() {
        assert!(looks_like_uuid_or_ulid("01ARZ3NDEKTSV4RRFFQ69G5FAV"));
    }

    #[test]
    fn rejects_entity_name() {
        assert!(!looks_like_uuid_or_ulid("watercooler-thread"));
        assert!(!looks_like_uuid_or_ulid("Entity Name"));
    }

    #[test]
    fn run_ids_are_sortable_and_unique() {
        let a = new_run_id();
        let b = new_run_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 26);
    }
}
